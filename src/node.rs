use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::catalog::{DeletedFile, FileCatalog};
use crate::config::PlaneConfig;
use crate::scheduler::Dispatcher;
use crate::transfer::TransferStrategy;
use crate::worker::{
    AnalysisLauncher, ElasticProvisioner, HeartbeatReceiver, HeartbeatReport, WorkerId,
    WorkerRegistry,
};

const HEARTBEAT_CHANNEL_CAPACITY: usize = 1024;

/// What one maintenance pass changed.
#[derive(Debug, Default)]
pub struct MaintenanceReport {
    /// Elastic workers that timed out while provisioning
    pub expired_workers: Vec<WorkerId>,
    /// Workers currently excluded from selection for missing heartbeats
    pub stale_workers: Vec<WorkerId>,
    pub swept_files: Vec<DeletedFile>,
}

/// Wires the catalog, registry and dispatcher together and runs the periodic
/// maintenance that keeps them honest.
pub struct ControlPlane {
    pub config: PlaneConfig,
    pub catalog: Arc<FileCatalog>,
    pub registry: Arc<WorkerRegistry>,
    pub dispatcher: Arc<Dispatcher>,
}

impl ControlPlane {
    pub fn new(
        config: PlaneConfig,
        transfers: TransferStrategy,
        launcher: Arc<dyn AnalysisLauncher>,
        provisioner: Option<Arc<dyn ElasticProvisioner>>,
    ) -> Self {
        let catalog = Arc::new(FileCatalog::new());
        let registry = Arc::new(WorkerRegistry::from_config(&config));

        let mut dispatcher = Dispatcher::new(
            catalog.clone(),
            registry.clone(),
            transfers,
            launcher,
            config.retry.clone(),
        )
        .with_provisioning_timeout(Duration::from_millis(
            config.elastic.provisioning_timeout_ms,
        ));
        match provisioner {
            Some(provisioner) if config.elastic.enabled => {
                dispatcher = dispatcher.with_provisioner(provisioner);
            }
            Some(_) => {
                tracing::warn!("Elastic provisioner supplied but elastic workers are disabled");
            }
            None if config.elastic.enabled => {
                tracing::warn!("Elastic workers enabled without a provisioner");
            }
            None => {}
        }

        Self {
            config,
            catalog,
            registry,
            dispatcher: Arc::new(dispatcher),
        }
    }

    /// Channel workers' heartbeats are fed into. Reports are applied until
    /// every sender is dropped or `shutdown` is cancelled.
    pub fn spawn_heartbeat_receiver(
        &self,
        shutdown: CancellationToken,
    ) -> mpsc::Sender<HeartbeatReport> {
        let (tx, rx) = mpsc::channel(HEARTBEAT_CHANNEL_CAPACITY);
        let receiver = HeartbeatReceiver::new(self.registry.clone());
        tokio::spawn(async move {
            receiver.run(rx, shutdown).await;
        });
        tx
    }

    /// One maintenance pass:
    /// 1. Expires elastic workers stuck in provisioning
    /// 2. Reports workers excluded for stale heartbeats
    /// 3. Soft-deletes files past retention that no unfinished job uses
    pub async fn run_maintenance(&self, now: DateTime<Utc>) -> MaintenanceReport {
        let expired_workers = self.registry.expire_provisioning(now).await;

        let stale_workers = self.registry.stale_workers(now).await;
        if !stale_workers.is_empty() {
            tracing::warn!(count = stale_workers.len(), workers = ?stale_workers, "Stale workers excluded from selection");
        }

        let swept_files = match self.config.file_retention() {
            Some(retention) => {
                let in_use = self.dispatcher.files_in_use().await;
                self.catalog.sweep_expired(retention, now, &in_use).await
            }
            None => Vec::new(),
        };

        MaintenanceReport {
            expired_workers,
            stale_workers,
            swept_files,
        }
    }

    /// Run maintenance on the configured interval until `shutdown` fires.
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(Duration::from_millis(
            self.config.maintenance_interval_ms,
        ));
        tracing::info!(
            interval_ms = self.config.maintenance_interval_ms,
            elastic = self.config.elastic.enabled,
            "Control plane running"
        );

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let report = self.run_maintenance(Utc::now()).await;
                    tracing::debug!(
                        expired = report.expired_workers.len(),
                        stale = report.stale_workers.len(),
                        swept = report.swept_files.len(),
                        "Maintenance pass finished"
                    );
                }
                _ = shutdown.cancelled() => {
                    tracing::info!("Control plane stopped");
                    break;
                }
            }
        }
    }
}
