use std::collections::BTreeSet;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{PlaneError, Result};
use crate::scheduler::job::FileType;
use crate::worker::heartbeat::HeartbeatReport;
use crate::worker::registry::CapacityError;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(String);

impl WorkerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for WorkerId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for WorkerId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ElasticState {
    Provisioning,
    Ready,
    Unreachable,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WorkerKind {
    /// Pre-provisioned, never torn down by the control plane
    Static,
    /// Provisioned on demand
    Elastic {
        state: ElasticState,
        requested_at: DateTime<Utc>,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkerRecord {
    pub id: WorkerId,
    /// Unknown until an elastic worker comes up
    pub address: Option<String>,
    /// Directory artifacts are landed in
    pub storage_root: PathBuf,
    pub capabilities: BTreeSet<FileType>,
    pub available_space: u64,
    pub total_space: u64,
    /// Bytes held by outstanding reservations
    pub reserved: u64,
    /// Timestamp of the last capacity refresh
    pub last_modified_time: DateTime<Utc>,
    pub kind: WorkerKind,
}

impl WorkerRecord {
    /// A static worker accepting every file type, fully available.
    pub fn new_static(
        id: impl Into<WorkerId>,
        address: impl Into<String>,
        storage_root: impl Into<PathBuf>,
        total_space: u64,
    ) -> Self {
        Self {
            id: id.into(),
            address: Some(address.into()),
            storage_root: storage_root.into(),
            capabilities: FileType::ALL.into_iter().collect(),
            available_space: total_space,
            total_space,
            reserved: 0,
            last_modified_time: Utc::now(),
            kind: WorkerKind::Static,
        }
    }

    pub(crate) fn new_elastic(id: WorkerId, file_type: Option<FileType>, now: DateTime<Utc>) -> Self {
        let capabilities = match file_type {
            Some(file_type) => BTreeSet::from([file_type]),
            None => FileType::ALL.into_iter().collect(),
        };
        Self {
            id,
            address: None,
            storage_root: PathBuf::new(),
            capabilities,
            available_space: 0,
            total_space: 0,
            reserved: 0,
            last_modified_time: now,
            kind: WorkerKind::Elastic {
                state: ElasticState::Provisioning,
                requested_at: now,
            },
        }
    }

    pub fn with_capabilities(mut self, capabilities: impl IntoIterator<Item = FileType>) -> Self {
        self.capabilities = capabilities.into_iter().collect();
        self
    }

    pub fn with_available_space(mut self, available_space: u64) -> Self {
        self.available_space = available_space;
        self
    }

    pub fn with_last_modified_time(mut self, at: DateTime<Utc>) -> Self {
        self.last_modified_time = at;
        self
    }

    pub fn is_elastic(&self) -> bool {
        matches!(self.kind, WorkerKind::Elastic { .. })
    }

    pub fn elastic_state(&self) -> Option<ElasticState> {
        match self.kind {
            WorkerKind::Static => None,
            WorkerKind::Elastic { state, .. } => Some(state),
        }
    }

    pub(crate) fn set_elastic_state(&mut self, next: ElasticState) {
        if let WorkerKind::Elastic { state, .. } = &mut self.kind {
            *state = next;
        }
    }

    /// File transfers (no file type) run on any worker.
    pub fn accepts(&self, file_type: Option<FileType>) -> bool {
        file_type.map_or(true, |t| self.capabilities.contains(&t))
    }

    pub fn is_stale(&self, now: DateTime<Utc>, staleness: chrono::Duration) -> bool {
        now - self.last_modified_time > staleness
    }

    /// Whether the worker can take work at all, regardless of capacity.
    pub fn readiness(&self) -> std::result::Result<(), CapacityError> {
        match self.elastic_state() {
            None | Some(ElasticState::Ready) => Ok(()),
            Some(ElasticState::Provisioning) => Err(CapacityError::NotReady(self.id.clone())),
            Some(ElasticState::Unreachable) => Err(CapacityError::Unreachable(self.id.clone())),
        }
    }

    pub fn is_selectable(&self, now: DateTime<Utc>, staleness: chrono::Duration) -> bool {
        self.readiness().is_ok() && !self.is_stale(now, staleness)
    }

    pub(crate) fn check_invariant(&self) -> Result<()> {
        if self.available_space > self.total_space {
            return Err(PlaneError::IllegalArgument(format!(
                "worker {} reports {} bytes available out of {}",
                self.id, self.available_space, self.total_space
            )));
        }
        Ok(())
    }

    /// Take `amount` bytes, re-checking availability under the record lock.
    pub(crate) fn try_reserve(&mut self, amount: u64) -> std::result::Result<(), CapacityError> {
        self.readiness()?;
        if self.available_space < amount {
            return Err(CapacityError::InsufficientSpace {
                worker_id: self.id.clone(),
                available: self.available_space,
                requested: amount,
            });
        }
        self.available_space -= amount;
        self.reserved += amount;
        Ok(())
    }

    pub(crate) fn release(&mut self, amount: u64) -> Result<()> {
        if amount > self.reserved {
            return Err(PlaneError::SanityCheck(format!(
                "releasing {} bytes on worker {} which only has {} reserved",
                amount, self.id, self.reserved
            )));
        }
        self.reserved -= amount;
        self.available_space = (self.available_space + amount).min(self.total_space);
        Ok(())
    }

    /// Apply a capacity report. The worker's figure still counts bytes the
    /// control plane has reserved as free, so those are subtracted.
    pub(crate) fn apply_heartbeat(&mut self, report: &HeartbeatReport) -> bool {
        if report.timestamp < self.last_modified_time {
            return false;
        }
        self.total_space = report.total_space;
        self.available_space = report.available_space.saturating_sub(self.reserved);
        self.last_modified_time = report.timestamp;
        true
    }
}
