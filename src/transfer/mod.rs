//! Moving artifacts onto workers.
//!
//! Every artifact is addressed by a [`TransferWay`] plus the parameters that
//! way declares. The set of ways is closed: [`TransferStrategy`] holds exactly
//! one [`Transport`] per way and picks it with an exhaustive `match`, so adding
//! a protocol means adding a variant and a slot.
//!
//! # Components
//!
//! - [`http::UrlTransport`]: HTTP(S) download
//! - [`http::ObjectStoreTransport`]: path-style GET against OSS / S3 endpoints
//! - [`scp::ScpTransport`]: `scp` from a remote host, or a local copy
//! - [`upload::UploadTransport`]: finalizes bytes already streamed to the worker
//!
//! Transports never retry. Whether a failed transfer is retried is decided by
//! the dispatcher.

pub mod http;
pub mod scp;
pub mod upload;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::TransferConfig;
use crate::error::{PlaneError, Result};
use crate::worker::WorkerId;

pub use http::{ObjectStoreTransport, UrlTransport};
pub use scp::ScpTransport;
pub use upload::UploadTransport;

/// Protocol used to address and move an artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TransferWay {
    Url,
    Scp,
    Oss,
    S3,
    Upload,
}

impl TransferWay {
    pub const ALL: [TransferWay; 5] = [
        TransferWay::Url,
        TransferWay::Scp,
        TransferWay::Oss,
        TransferWay::S3,
        TransferWay::Upload,
    ];

    /// Parameter keys a caller must supply, in order.
    pub const fn required_parameters(self) -> &'static [&'static str] {
        match self {
            TransferWay::Url => &["url"],
            TransferWay::Scp => &["path"],
            TransferWay::Oss | TransferWay::S3 => &["objectName"],
            TransferWay::Upload => &[],
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            TransferWay::Url => "URL",
            TransferWay::Scp => "SCP",
            TransferWay::Oss => "OSS",
            TransferWay::S3 => "S3",
            TransferWay::Upload => "UPLOAD",
        }
    }
}

impl std::fmt::Display for TransferWay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransferWay {
    type Err = PlaneError;

    fn from_str(s: &str) -> Result<Self> {
        TransferWay::ALL
            .into_iter()
            .find(|way| way.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| PlaneError::IllegalArgument(format!("unknown transfer way: {}", s)))
    }
}

pub type TransferParams = BTreeMap<String, String>;

/// Fails unless `params` holds exactly the keys `way` declares.
pub fn validate_parameters(way: TransferWay, params: &TransferParams) -> Result<()> {
    let required = way.required_parameters();

    if let Some(missing) = required.iter().find(|key| !params.contains_key(**key)) {
        return Err(PlaneError::IllegalArgument(format!(
            "{} transfer requires parameter '{}'",
            way, missing
        )));
    }
    if let Some(extra) = params.keys().find(|key| !required.contains(&key.as_str())) {
        return Err(PlaneError::IllegalArgument(format!(
            "{} transfer does not accept parameter '{}'",
            way, extra
        )));
    }
    if let Some((key, _)) = params.iter().find(|(_, value)| value.trim().is_empty()) {
        return Err(PlaneError::IllegalArgument(format!(
            "{} transfer parameter '{}' cannot be empty",
            way, key
        )));
    }
    Ok(())
}

/// Where an artifact comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferSource {
    pub way: TransferWay,
    pub params: TransferParams,
}

impl TransferSource {
    pub fn new(way: TransferWay, params: TransferParams) -> Result<Self> {
        validate_parameters(way, &params)?;
        Ok(Self { way, params })
    }

    pub fn upload() -> Self {
        Self {
            way: TransferWay::Upload,
            params: TransferParams::new(),
        }
    }

    pub fn url(url: impl Into<String>) -> Self {
        Self::single(TransferWay::Url, url)
    }

    pub fn scp(path: impl Into<String>) -> Self {
        Self::single(TransferWay::Scp, path)
    }

    pub fn oss(object_name: impl Into<String>) -> Self {
        Self::single(TransferWay::Oss, object_name)
    }

    pub fn s3(object_name: impl Into<String>) -> Self {
        Self::single(TransferWay::S3, object_name)
    }

    fn single(way: TransferWay, value: impl Into<String>) -> Self {
        let mut params = TransferParams::new();
        params.insert(way.required_parameters()[0].to_string(), value.into());
        Self { way, params }
    }

    pub fn param(&self, key: &str) -> Result<&str> {
        self.params.get(key).map(String::as_str).ok_or_else(|| {
            PlaneError::IllegalArgument(format!("{} transfer requires parameter '{}'", self.way, key))
        })
    }
}

/// Worker an artifact is transferred to.
#[derive(Debug, Clone)]
pub struct TransferTarget {
    pub worker_id: WorkerId,
    pub storage_root: PathBuf,
}

/// One transfer handed to a [`Transport`].
#[derive(Debug, Clone, Copy)]
pub struct TransferRequest<'a> {
    pub file_id: Uuid,
    pub source: &'a TransferSource,
    /// Catalog storage key of the artifact
    pub path: &'a str,
    pub target: &'a TransferTarget,
}

impl TransferRequest<'_> {
    /// `<storage_root>/<file_id>/<name>` for pulled artifacts.
    pub fn pull_destination(&self, name: &str) -> PathBuf {
        let name = artifact_name(name).unwrap_or_else(|| {
            artifact_name(self.path).unwrap_or_else(|| "artifact".to_string())
        });
        self.target
            .storage_root
            .join(self.file_id.to_string())
            .join(name)
    }
}

fn artifact_name(location: &str) -> Option<String> {
    let trimmed = location.split(['?', '#']).next().unwrap_or(location);
    trimmed
        .rsplit(['/', ':'])
        .next()
        .filter(|name| !name.is_empty() && *name != "." && *name != "..")
        .map(str::to_string)
}

/// Artifact available on a worker after a transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LandedFile {
    pub path: PathBuf,
    pub size: u64,
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn fetch(&self, request: TransferRequest<'_>) -> Result<LandedFile>;
}

pub(crate) async fn prepare_destination(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(|e| {
            PlaneError::Transfer(format!("cannot create {}: {}", parent.display(), e))
        })?;
    }
    Ok(())
}

/// Routes each [`TransferWay`] to its transport and bounds every transfer by
/// a timeout.
#[derive(Clone)]
pub struct TransferStrategy {
    url: Arc<dyn Transport>,
    scp: Arc<dyn Transport>,
    oss: Arc<dyn Transport>,
    s3: Arc<dyn Transport>,
    upload: Arc<dyn Transport>,
    timeout: Duration,
}

impl TransferStrategy {
    pub fn from_config(config: &TransferConfig) -> Self {
        let client = reqwest::Client::new();
        Self {
            url: Arc::new(UrlTransport::new(client.clone())),
            scp: Arc::new(ScpTransport::new(config.scp_remote.clone())),
            oss: Arc::new(ObjectStoreTransport::new(
                TransferWay::Oss,
                config.oss.clone(),
                client.clone(),
            )),
            s3: Arc::new(ObjectStoreTransport::new(
                TransferWay::S3,
                config.s3.clone(),
                client,
            )),
            upload: Arc::new(UploadTransport),
            timeout: config.timeout(),
        }
    }

    /// Replaces the transport serving `way`.
    pub fn with_transport(mut self, way: TransferWay, transport: Arc<dyn Transport>) -> Self {
        match way {
            TransferWay::Url => self.url = transport,
            TransferWay::Scp => self.scp = transport,
            TransferWay::Oss => self.oss = transport,
            TransferWay::S3 => self.s3 = transport,
            TransferWay::Upload => self.upload = transport,
        }
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn transport(&self, way: TransferWay) -> &Arc<dyn Transport> {
        match way {
            TransferWay::Url => &self.url,
            TransferWay::Scp => &self.scp,
            TransferWay::Oss => &self.oss,
            TransferWay::S3 => &self.s3,
            TransferWay::Upload => &self.upload,
        }
    }

    /// Lands the artifact on `request.target`. Every failure, including the
    /// timeout, surfaces as a transfer error.
    pub async fn transfer(&self, request: TransferRequest<'_>) -> Result<LandedFile> {
        validate_parameters(request.source.way, &request.source.params)?;

        let way = request.source.way;
        tracing::info!(
            file_id = %request.file_id,
            worker_id = %request.target.worker_id,
            way = %way,
            "Starting transfer"
        );

        let fetch = self.transport(way).fetch(request);
        match tokio::time::timeout(self.timeout, fetch).await {
            Ok(Ok(landed)) => {
                tracing::info!(
                    file_id = %request.file_id,
                    path = %landed.path.display(),
                    size = landed.size,
                    "Transfer completed"
                );
                Ok(landed)
            }
            Ok(Err(e)) => {
                tracing::warn!(file_id = %request.file_id, way = %way, error = %e, "Transfer failed");
                Err(match e {
                    PlaneError::Transfer(_) => e,
                    other => PlaneError::Transfer(other.to_string()),
                })
            }
            Err(_) => {
                tracing::warn!(
                    file_id = %request.file_id,
                    way = %way,
                    timeout_ms = self.timeout.as_millis() as u64,
                    "Transfer timed out"
                );
                Err(PlaneError::Transfer(format!(
                    "{} transfer timed out after {:?}",
                    way, self.timeout
                )))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(pairs: &[(&str, &str)]) -> TransferParams {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn required_parameters_per_way() {
        assert_eq!(TransferWay::Url.required_parameters(), &["url"]);
        assert_eq!(TransferWay::Scp.required_parameters(), &["path"]);
        assert_eq!(TransferWay::Oss.required_parameters(), &["objectName"]);
        assert_eq!(TransferWay::S3.required_parameters(), &["objectName"]);
        assert!(TransferWay::Upload.required_parameters().is_empty());
    }

    #[test]
    fn validate_accepts_exact_keys() {
        assert!(validate_parameters(TransferWay::Scp, &params(&[("path", "/data/gc.log")])).is_ok());
        assert!(validate_parameters(TransferWay::Upload, &TransferParams::new()).is_ok());
    }

    #[test]
    fn validate_rejects_missing_extra_and_empty_keys() {
        let missing = validate_parameters(TransferWay::Url, &TransferParams::new());
        assert!(matches!(missing, Err(PlaneError::IllegalArgument(_))));

        let extra = validate_parameters(
            TransferWay::S3,
            &params(&[("objectName", "a.hprof"), ("bucket", "b")]),
        );
        assert!(matches!(extra, Err(PlaneError::IllegalArgument(_))));

        let upload_extra = validate_parameters(TransferWay::Upload, &params(&[("path", "x")]));
        assert!(matches!(upload_extra, Err(PlaneError::IllegalArgument(_))));

        let empty = validate_parameters(TransferWay::Scp, &params(&[("path", " ")]));
        assert!(matches!(empty, Err(PlaneError::IllegalArgument(_))));
    }

    #[test]
    fn way_parses_case_insensitively() {
        assert_eq!("scp".parse::<TransferWay>().unwrap(), TransferWay::Scp);
        assert_eq!("S3".parse::<TransferWay>().unwrap(), TransferWay::S3);
        assert!("ftp".parse::<TransferWay>().is_err());
    }

    #[test]
    fn pull_destination_uses_last_path_segment() {
        let source = TransferSource::url("https://dumps.example.com/prod/heap.hprof?sig=abc");
        let target = TransferTarget {
            worker_id: WorkerId::from("w1"),
            storage_root: PathBuf::from("/srv/w1"),
        };
        let file_id = Uuid::nil();
        let request = TransferRequest {
            file_id,
            source: &source,
            path: "heap.hprof",
            target: &target,
        };
        assert_eq!(
            request.pull_destination("https://dumps.example.com/prod/heap.hprof?sig=abc"),
            PathBuf::from(format!("/srv/w1/{}/heap.hprof", file_id))
        );
        assert_eq!(
            request.pull_destination("https://dumps.example.com/"),
            PathBuf::from(format!("/srv/w1/{}/heap.hprof", file_id))
        );
    }
}
