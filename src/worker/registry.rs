use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use crate::config::PlaneConfig;
use crate::error::{PlaneError, Result};
use crate::paging::{PageView, PagingRequest};
use crate::scheduler::job::FileType;
use crate::transfer::TransferTarget;
use crate::worker::heartbeat::HeartbeatReport;
use crate::worker::record::{ElasticState, WorkerKind, WorkerRecord};
use crate::worker::WorkerId;

/// Retryable conditions raised while acquiring worker capacity.
///
/// None of these fail a job on their own; the dispatcher decides whether to
/// re-select, wait, or give up once its attempt budget runs out.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CapacityError {
    #[error("No capable worker for {} with {required} bytes free", .file_type.map_or("file transfer", FileType::tag))]
    NoCapableWorker {
        file_type: Option<FileType>,
        required: u64,
    },

    #[error("Elastic worker {0} is not ready")]
    NotReady(WorkerId),

    #[error("Elastic worker {0} is unreachable")]
    Unreachable(WorkerId),

    #[error("Worker {worker_id} has {available} bytes available, {requested} requested")]
    InsufficientSpace {
        worker_id: WorkerId,
        available: u64,
        requested: u64,
    },

    #[error("Worker not found: {0}")]
    UnknownWorker(WorkerId),
}

/// Authoritative view of worker capacity and readiness.
///
/// Every record has its own mutex: reservations, releases and heartbeats on a
/// worker are serialized, while selection only reads a snapshot of each record
/// and never holds more than one lock at a time. A selection can therefore be
/// outdated by the time the caller reserves; `reserve` re-checks and reports
/// `InsufficientSpace` so the caller can select again.
#[derive(Debug)]
pub struct WorkerRegistry {
    workers: RwLock<HashMap<WorkerId, Arc<Mutex<WorkerRecord>>>>,
    staleness: chrono::Duration,
    provisioning_timeout: chrono::Duration,
}

impl WorkerRegistry {
    pub fn new(staleness: chrono::Duration, provisioning_timeout: chrono::Duration) -> Self {
        Self {
            workers: RwLock::new(HashMap::new()),
            staleness,
            provisioning_timeout,
        }
    }

    pub fn from_config(config: &PlaneConfig) -> Self {
        Self::new(config.heartbeat_staleness(), config.provisioning_timeout())
    }

    /// Register a new worker
    pub async fn register(&self, worker: WorkerRecord) -> Result<()> {
        worker.check_invariant()?;
        let mut workers = self.workers.write().await;
        if workers.contains_key(&worker.id) {
            return Err(PlaneError::IllegalArgument(format!(
                "worker {} already registered",
                worker.id
            )));
        }
        tracing::info!(
            worker_id = %worker.id,
            total_space = worker.total_space,
            elastic = worker.is_elastic(),
            "Worker registered"
        );
        workers.insert(worker.id.clone(), Arc::new(Mutex::new(worker)));
        Ok(())
    }

    async fn handle(&self, id: &WorkerId) -> Option<Arc<Mutex<WorkerRecord>>> {
        self.workers.read().await.get(id).cloned()
    }

    async fn snapshot(&self) -> Vec<WorkerRecord> {
        let handles: Vec<_> = self.workers.read().await.values().cloned().collect();
        let mut records = Vec::with_capacity(handles.len());
        for handle in handles {
            records.push(handle.lock().await.clone());
        }
        records
    }

    /// Refresh capacity from a worker report.
    pub async fn heartbeat(&self, report: &HeartbeatReport) -> Result<()> {
        if report.available_space > report.total_space {
            return Err(PlaneError::IllegalArgument(format!(
                "worker {} reports {} bytes available out of {}",
                report.worker_id, report.available_space, report.total_space
            )));
        }
        let handle = self
            .handle(&report.worker_id)
            .await
            .ok_or_else(|| PlaneError::WorkerNotFound(report.worker_id.clone()))?;

        let mut worker = handle.lock().await;
        if !worker.apply_heartbeat(report) {
            tracing::debug!(worker_id = %report.worker_id, "Ignoring out-of-order heartbeat");
            return Ok(());
        }
        if worker.elastic_state() == Some(ElasticState::Unreachable) {
            tracing::warn!(worker_id = %report.worker_id, "Heartbeat from unreachable elastic worker");
        }
        Ok(())
    }

    pub async fn select(&self, file_type: Option<FileType>, required_space: u64) -> std::result::Result<WorkerId, CapacityError> {
        self.select_excluding(file_type, required_space, &HashSet::new())
            .await
    }

    /// Pick the capable, fresh worker with the most free space, breaking ties
    /// by the most recent heartbeat and then by id.
    pub async fn select_excluding(
        &self,
        file_type: Option<FileType>,
        required_space: u64,
        excluded: &HashSet<WorkerId>,
    ) -> std::result::Result<WorkerId, CapacityError> {
        let now = Utc::now();
        self.snapshot()
            .await
            .into_iter()
            .filter(|w| !excluded.contains(&w.id))
            .filter(|w| w.accepts(file_type))
            .filter(|w| w.is_selectable(now, self.staleness))
            .filter(|w| w.available_space >= required_space)
            .max_by(|a, b| {
                a.available_space
                    .cmp(&b.available_space)
                    .then(a.last_modified_time.cmp(&b.last_modified_time))
                    .then(b.id.cmp(&a.id))
            })
            .map(|w| w.id)
            .ok_or(CapacityError::NoCapableWorker {
                file_type,
                required: required_space,
            })
    }

    /// Atomically hold `amount` bytes on a worker.
    pub async fn reserve(&self, id: &WorkerId, amount: u64) -> std::result::Result<(), CapacityError> {
        let handle = self
            .handle(id)
            .await
            .ok_or_else(|| CapacityError::UnknownWorker(id.clone()))?;
        let mut worker = handle.lock().await;
        worker.try_reserve(amount)?;
        tracing::debug!(worker_id = %id, amount, available = worker.available_space, "Capacity reserved");
        Ok(())
    }

    /// Return reserved bytes to a worker.
    pub async fn release(&self, id: &WorkerId, amount: u64) -> Result<()> {
        let handle = self
            .handle(id)
            .await
            .ok_or_else(|| PlaneError::WorkerNotFound(id.clone()))?;
        let mut worker = handle.lock().await;
        worker.release(amount)?;
        tracing::debug!(worker_id = %id, amount, available = worker.available_space, "Capacity released");
        Ok(())
    }

    /// Create a PROVISIONING record for a new elastic worker.
    pub async fn provision_elastic(&self, file_type: Option<FileType>) -> WorkerId {
        let id = WorkerId::new(format!("elastic-{}", Uuid::new_v4().simple()));
        let record = WorkerRecord::new_elastic(id.clone(), file_type, Utc::now());
        self.workers
            .write()
            .await
            .insert(id.clone(), Arc::new(Mutex::new(record)));
        tracing::info!(worker_id = %id, file_type = ?file_type, "Elastic worker provisioning");
        id
    }

    /// A provisioning elastic worker that will accept `file_type`, if any.
    pub async fn pending_elastic(&self, file_type: Option<FileType>) -> Option<WorkerId> {
        self.snapshot()
            .await
            .into_iter()
            .filter(|w| w.elastic_state() == Some(ElasticState::Provisioning))
            .filter(|w| w.accepts(file_type))
            .min_by_key(|w| w.last_modified_time)
            .map(|w| w.id)
    }

    /// Provisioning callback: the elastic worker is up and reachable.
    pub async fn mark_ready(
        &self,
        id: &WorkerId,
        address: impl Into<String>,
        storage_root: impl Into<PathBuf>,
        total_space: u64,
    ) -> Result<()> {
        let handle = self
            .handle(id)
            .await
            .ok_or_else(|| PlaneError::WorkerNotFound(id.clone()))?;
        let mut worker = handle.lock().await;
        match worker.elastic_state() {
            Some(ElasticState::Provisioning) => {}
            Some(state) => {
                return Err(PlaneError::IllegalArgument(format!(
                    "elastic worker {} is {:?}, not provisioning",
                    id, state
                )))
            }
            None => {
                return Err(PlaneError::IllegalArgument(format!(
                    "worker {} is static",
                    id
                )))
            }
        }
        worker.address = Some(address.into());
        worker.storage_root = storage_root.into();
        worker.total_space = total_space;
        worker.available_space = total_space.saturating_sub(worker.reserved);
        worker.last_modified_time = Utc::now();
        worker.set_elastic_state(ElasticState::Ready);
        tracing::info!(worker_id = %id, total_space, "Elastic worker ready");
        Ok(())
    }

    /// Permanently exclude an elastic worker. The record is kept.
    pub async fn mark_unreachable(&self, id: &WorkerId) -> Result<()> {
        let handle = self
            .handle(id)
            .await
            .ok_or_else(|| PlaneError::WorkerNotFound(id.clone()))?;
        let mut worker = handle.lock().await;
        if !worker.is_elastic() {
            return Err(PlaneError::IllegalArgument(format!(
                "worker {} is static",
                id
            )));
        }
        worker.set_elastic_state(ElasticState::Unreachable);
        tracing::warn!(worker_id = %id, "Elastic worker marked unreachable");
        Ok(())
    }

    /// Move elastic workers stuck in provisioning past the timeout to
    /// UNREACHABLE. Returns the ids that expired.
    pub async fn expire_provisioning(&self, now: DateTime<Utc>) -> Vec<WorkerId> {
        let handles: Vec<_> = self.workers.read().await.values().cloned().collect();
        let mut expired = Vec::new();
        for handle in handles {
            let mut worker = handle.lock().await;
            if let WorkerKind::Elastic {
                state: ElasticState::Provisioning,
                requested_at,
            } = worker.kind
            {
                if now - requested_at > self.provisioning_timeout {
                    worker.set_elastic_state(ElasticState::Unreachable);
                    tracing::warn!(worker_id = %worker.id, "Elastic worker did not become ready in time");
                    expired.push(worker.id.clone());
                }
            }
        }
        expired
    }

    /// Workers excluded from selection because their heartbeat is too old.
    pub async fn stale_workers(&self, now: DateTime<Utc>) -> Vec<WorkerId> {
        let mut stale: Vec<WorkerId> = self
            .snapshot()
            .await
            .into_iter()
            .filter(|w| w.readiness().is_ok() && w.is_stale(now, self.staleness))
            .map(|w| w.id)
            .collect();
        stale.sort();
        stale
    }

    pub async fn get_worker(&self, id: &WorkerId) -> Result<WorkerRecord> {
        let handle = self
            .handle(id)
            .await
            .ok_or_else(|| PlaneError::WorkerNotFound(id.clone()))?;
        let worker = handle.lock().await;
        Ok(worker.clone())
    }

    /// Workers ordered by id.
    pub async fn list_workers(&self, paging: PagingRequest) -> PageView<WorkerRecord> {
        let mut workers = self.snapshot().await;
        workers.sort_by(|a, b| a.id.cmp(&b.id));
        paging.paginate(workers)
    }

    /// Where transfers to `id` should land.
    pub async fn target(&self, id: &WorkerId) -> Result<TransferTarget> {
        let worker = self.get_worker(id).await?;
        Ok(TransferTarget {
            worker_id: worker.id,
            storage_root: worker.storage_root,
        })
    }
}
