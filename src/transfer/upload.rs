use async_trait::async_trait;

use crate::error::{PlaneError, Result};
use crate::transfer::{LandedFile, TransferRequest, Transport};

/// Uploaded artifacts are streamed straight into the worker's storage root
/// under their catalog path, so there is nothing to pull. This only checks the
/// bytes are there and records their size.
#[derive(Debug, Clone, Copy, Default)]
pub struct UploadTransport;

#[async_trait]
impl Transport for UploadTransport {
    async fn fetch(&self, request: TransferRequest<'_>) -> Result<LandedFile> {
        let relative = request.path.trim_start_matches('/');
        if relative.split('/').any(|part| part == "..") {
            return Err(PlaneError::IllegalArgument(format!(
                "upload path escapes storage root: {}",
                request.path
            )));
        }
        let path = request.target.storage_root.join(relative);

        let metadata = tokio::fs::metadata(&path).await.map_err(|e| {
            PlaneError::Transfer(format!("uploaded artifact {} not found: {}", path.display(), e))
        })?;
        if !metadata.is_file() {
            return Err(PlaneError::Transfer(format!(
                "uploaded artifact {} is not a file",
                path.display()
            )));
        }

        Ok(LandedFile {
            path,
            size: metadata.len(),
        })
    }
}
