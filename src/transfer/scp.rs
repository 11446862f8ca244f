use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;

use crate::error::{PlaneError, Result};
use crate::transfer::{prepare_destination, LandedFile, TransferRequest, Transport};

/// Copies artifacts with `scp`.
///
/// A `path` already in `host:path` form is copied as given. Otherwise the
/// configured remote is prefixed, and with no remote the path is read from the
/// local filesystem.
///
/// The `scp` child is killed if the transfer is dropped, e.g. on timeout, so
/// it never keeps writing into the destination afterwards.
#[derive(Debug, Clone)]
pub struct ScpTransport {
    remote: Option<String>,
    program: PathBuf,
}

impl Default for ScpTransport {
    fn default() -> Self {
        Self::new(None)
    }
}

impl ScpTransport {
    pub fn new(remote: Option<String>) -> Self {
        Self {
            remote,
            program: PathBuf::from("scp"),
        }
    }

    /// Use another scp-compatible binary.
    pub fn with_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.program = program.into();
        self
    }

    fn remote_source(&self, path: &str) -> Option<String> {
        if is_remote_path(path) {
            return Some(path.to_string());
        }
        self.remote
            .as_ref()
            .map(|remote| format!("{}:{}", remote, path))
    }
}

/// `host:path` or `user@host:path`, as opposed to a plain local path.
fn is_remote_path(path: &str) -> bool {
    match path.split_once(':') {
        Some((host, _)) => !host.is_empty() && !host.contains('/'),
        None => false,
    }
}

#[async_trait]
impl Transport for ScpTransport {
    async fn fetch(&self, request: TransferRequest<'_>) -> Result<LandedFile> {
        let path = request.source.param("path")?;
        let destination = request.pull_destination(path);
        prepare_destination(&destination).await?;

        match self.remote_source(path) {
            Some(source) => {
                tracing::debug!(source = %source, destination = %destination.display(), "Running scp");
                let output = Command::new(&self.program)
                    .args(["-q", "-o", "BatchMode=yes"])
                    .arg(&source)
                    .arg(&destination)
                    .stdout(Stdio::null())
                    .stderr(Stdio::piped())
                    .kill_on_drop(true)
                    .output()
                    .await
                    .map_err(|e| PlaneError::Transfer(format!("cannot run scp: {}", e)))?;

                if !output.status.success() {
                    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
                    return Err(PlaneError::Transfer(if stderr.is_empty() {
                        format!("scp {} exited with {:?}", source, output.status.code())
                    } else {
                        format!("scp {} failed: {}", source, stderr)
                    }));
                }
            }
            None => {
                tokio::fs::copy(path, &destination)
                    .await
                    .map_err(|e| PlaneError::Transfer(format!("copy {} failed: {}", path, e)))?;
            }
        }

        let size = tokio::fs::metadata(&destination)
            .await
            .map_err(|e| {
                PlaneError::Transfer(format!("{} missing after copy: {}", destination.display(), e))
            })?
            .len();

        Ok(LandedFile {
            path: destination,
            size,
        })
    }
}
