use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;

use crate::error::{PlaneError, Result};
use crate::scheduler::job::FileType;
use crate::worker::WorkerId;

/// Brings up the machine behind an elastic worker record.
///
/// The registry has already created the PROVISIONING record when this is
/// called. Implementations only start provisioning; the worker becomes usable
/// once someone calls
/// [`WorkerRegistry::mark_ready`](crate::worker::WorkerRegistry::mark_ready).
#[async_trait]
pub trait ElasticProvisioner: Send + Sync {
    async fn provision(
        &self,
        worker_id: &WorkerId,
        file_type: Option<FileType>,
        required_space: u64,
    ) -> Result<()>;
}

/// Provisions by running a shell command, e.g. a script that creates a pod.
///
/// The command sees `DIAGPLANE_WORKER_ID`, `DIAGPLANE_FILE_TYPE` (empty for
/// file transfers) and `DIAGPLANE_REQUIRED_SPACE` in its environment.
#[derive(Debug, Clone)]
pub struct CommandProvisioner {
    command: String,
}

impl CommandProvisioner {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }
}

#[async_trait]
impl ElasticProvisioner for CommandProvisioner {
    async fn provision(
        &self,
        worker_id: &WorkerId,
        file_type: Option<FileType>,
        required_space: u64,
    ) -> Result<()> {
        tracing::info!(worker_id = %worker_id, command = %self.command, "Running provisioning command");

        let output = Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .env("DIAGPLANE_WORKER_ID", worker_id.as_str())
            .env("DIAGPLANE_FILE_TYPE", file_type.map_or("", FileType::tag))
            .env("DIAGPLANE_REQUIRED_SPACE", required_space.to_string())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| PlaneError::Unknown(format!("cannot run provisioning command: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(PlaneError::Unknown(format!(
                "provisioning command exited with {:?}: {}",
                output.status.code(),
                stderr
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn command_sees_worker_environment() {
        let provisioner = CommandProvisioner::new(
            r#"test "$DIAGPLANE_WORKER_ID" = e1 && test "$DIAGPLANE_FILE_TYPE" = heap-dump && test "$DIAGPLANE_REQUIRED_SPACE" = 42"#,
        );
        provisioner
            .provision(&WorkerId::from("e1"), Some(FileType::HeapDump), 42)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn abandoned_command_is_killed() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("provisioned");
        let provisioner =
            CommandProvisioner::new(format!("sleep 0.5 && touch '{}'", marker.display()));

        let result = tokio::time::timeout(
            std::time::Duration::from_millis(50),
            provisioner.provision(&WorkerId::from("e1"), None, 1),
        )
        .await;
        assert!(result.is_err());

        tokio::time::sleep(std::time::Duration::from_millis(1000)).await;
        assert!(!marker.exists());
    }

    #[tokio::test]
    async fn failing_command_is_unknown_error() {
        let provisioner = CommandProvisioner::new("echo quota exceeded >&2; exit 3");
        let err = provisioner
            .provision(&WorkerId::from("e1"), None, 1)
            .await
            .unwrap_err();
        assert!(matches!(err, PlaneError::Unknown(ref msg) if msg.contains("quota exceeded")));
    }
}
