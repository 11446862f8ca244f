use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::worker::registry::WorkerRegistry;
use crate::worker::WorkerId;

/// Periodic capacity report sent by a worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatReport {
    pub worker_id: WorkerId,
    pub available_space: u64,
    pub total_space: u64,
    pub timestamp: DateTime<Utc>,
}

impl HeartbeatReport {
    pub fn new(worker_id: WorkerId, available_space: u64, total_space: u64) -> Self {
        Self {
            worker_id,
            available_space,
            total_space,
            timestamp: Utc::now(),
        }
    }
}

/// Applies heartbeat reports arriving on a channel to the registry until the
/// channel closes or shutdown is requested.
pub struct HeartbeatReceiver {
    registry: Arc<WorkerRegistry>,
}

impl HeartbeatReceiver {
    pub fn new(registry: Arc<WorkerRegistry>) -> Self {
        Self { registry }
    }

    pub async fn run(&self, mut rx: mpsc::Receiver<HeartbeatReport>, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                report = rx.recv() => {
                    let Some(report) = report else {
                        // All senders dropped
                        break;
                    };
                    if let Err(e) = self.registry.heartbeat(&report).await {
                        tracing::warn!(worker_id = %report.worker_id, error = %e, "Rejected heartbeat");
                    }
                }
                _ = shutdown.cancelled() => break,
            }
        }
    }
}
