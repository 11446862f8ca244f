use std::path::Path;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;

use crate::config::ObjectStoreConfig;
use crate::error::{PlaneError, Result};
use crate::transfer::{prepare_destination, LandedFile, TransferRequest, TransferWay, Transport};

/// Downloads artifacts addressed by a plain URL.
#[derive(Debug, Clone)]
pub struct UrlTransport {
    client: reqwest::Client,
}

impl UrlTransport {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Transport for UrlTransport {
    async fn fetch(&self, request: TransferRequest<'_>) -> Result<LandedFile> {
        let url = request.source.param("url")?;
        let destination = request.pull_destination(url);
        download(&self.client, url, &destination).await
    }
}

/// Fetches objects from an OSS or S3 compatible endpoint with path-style
/// GETs (`<endpoint>/<bucket>/<objectName>`).
#[derive(Debug, Clone)]
pub struct ObjectStoreTransport {
    way: TransferWay,
    store: Option<ObjectStoreConfig>,
    client: reqwest::Client,
}

impl ObjectStoreTransport {
    pub fn new(way: TransferWay, store: Option<ObjectStoreConfig>, client: reqwest::Client) -> Self {
        Self { way, store, client }
    }
}

#[async_trait]
impl Transport for ObjectStoreTransport {
    async fn fetch(&self, request: TransferRequest<'_>) -> Result<LandedFile> {
        let store = self.store.as_ref().ok_or_else(|| {
            PlaneError::Transfer(format!("no {} endpoint configured", self.way))
        })?;
        let object_name = request.source.param("objectName")?;
        let destination = request.pull_destination(object_name);
        download(&self.client, &store.object_url(object_name), &destination).await
    }
}

/// Streams `url` into `destination`, failing on non-success statuses and on
/// bodies shorter than the advertised length.
async fn download(client: &reqwest::Client, url: &str, destination: &Path) -> Result<LandedFile> {
    let mut response = client
        .get(url)
        .send()
        .await
        .map_err(|e| PlaneError::Transfer(format!("GET {} failed: {}", url, e)))?;

    let status = response.status();
    if !status.is_success() {
        return Err(PlaneError::Transfer(format!(
            "GET {} returned {}",
            url, status
        )));
    }
    let expected = response.content_length();

    prepare_destination(destination).await?;
    let mut file = tokio::fs::File::create(destination).await.map_err(|e| {
        PlaneError::Transfer(format!("cannot create {}: {}", destination.display(), e))
    })?;

    let mut written: u64 = 0;
    while let Some(chunk) = response
        .chunk()
        .await
        .map_err(|e| PlaneError::Transfer(format!("reading {} failed: {}", url, e)))?
    {
        file.write_all(&chunk).await.map_err(|e| {
            PlaneError::Transfer(format!("writing {} failed: {}", destination.display(), e))
        })?;
        written += chunk.len() as u64;
    }
    file.flush().await.map_err(|e| {
        PlaneError::Transfer(format!("writing {} failed: {}", destination.display(), e))
    })?;

    if let Some(expected) = expected {
        if written != expected {
            return Err(PlaneError::Transfer(format!(
                "truncated download from {}: {} of {} bytes",
                url, written, expected
            )));
        }
    }

    Ok(LandedFile {
        path: destination.to_path_buf(),
        size: written,
    })
}
