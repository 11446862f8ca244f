//! Artifact files, soft deletion, and retention.
//!
//! A file is either active or soft-deleted. Deletion replaces the active
//! record with an immutable [`DeletedFile`] audit record whose size and
//! creation time are copied from the active record under the same write lock,
//! so the two can never drift.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{PlaneError, Result};
use crate::paging::{PageView, PagingRequest};
use crate::transfer::TransferSource;

#[derive(Debug, Clone, Serialize)]
pub struct FileRecord {
    pub id: Uuid,
    /// Storage path or object key
    pub path: String,
    pub size: u64,
    pub source: TransferSource,
    pub owning_jobs: Vec<Uuid>,
    pub created_at: DateTime<Utc>,
}

impl FileRecord {
    pub fn new(path: String, size: u64, source: TransferSource) -> Self {
        Self {
            id: Uuid::new_v4(),
            path,
            size,
            source,
            owning_jobs: Vec::new(),
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeletionReason {
    Manual,
    Retention,
    JobCompleted,
}

/// Audit record of a soft-deleted file. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeletedFile {
    pub id: Uuid,
    pub path: String,
    pub size: u64,
    pub original_created_time: DateTime<Utc>,
    pub deleted_time: DateTime<Utc>,
    pub reason: DeletionReason,
}

#[derive(Debug, Clone)]
enum FileEntry {
    Active(FileRecord),
    Deleted(DeletedFile),
}

#[derive(Debug, Default)]
pub struct FileCatalog {
    files: RwLock<HashMap<Uuid, FileEntry>>,
}

impl FileCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an uploaded artifact.
    pub async fn ingest(&self, path: impl Into<String>, size: u64) -> Uuid {
        let record = FileRecord::new(path.into(), size, TransferSource::upload());
        self.insert(record).await
    }

    /// Register an artifact that workers pull from `source`.
    pub async fn ingest_from(
        &self,
        source: TransferSource,
        path: impl Into<String>,
        size: u64,
    ) -> Result<Uuid> {
        let source = TransferSource::new(source.way, source.params)?;
        Ok(self.insert(FileRecord::new(path.into(), size, source)).await)
    }

    /// Re-insert a record loaded from durable storage.
    pub async fn restore(&self, record: FileRecord) -> Result<()> {
        let mut files = self.files.write().await;
        if files.contains_key(&record.id) {
            return Err(PlaneError::IllegalArgument(format!(
                "file {} already registered",
                record.id
            )));
        }
        files.insert(record.id, FileEntry::Active(record));
        Ok(())
    }

    async fn insert(&self, record: FileRecord) -> Uuid {
        let id = record.id;
        tracing::info!(file_id = %id, path = %record.path, size = record.size, way = %record.source.way, "File ingested");
        self.files.write().await.insert(id, FileEntry::Active(record));
        id
    }

    /// Active record for `id`.
    pub async fn get(&self, id: &Uuid) -> Result<FileRecord> {
        match self.files.read().await.get(id) {
            Some(FileEntry::Active(record)) => Ok(record.clone()),
            _ => Err(PlaneError::FileDoesNotExist(*id)),
        }
    }

    pub async fn resolve(&self, id: &Uuid) -> Result<String> {
        self.get(id).await.map(|record| record.path)
    }

    /// Record `job_id` as an owner of an active file.
    pub async fn attach_job(&self, id: &Uuid, job_id: Uuid) -> Result<()> {
        match self.files.write().await.get_mut(id) {
            Some(FileEntry::Active(record)) => {
                if !record.owning_jobs.contains(&job_id) {
                    record.owning_jobs.push(job_id);
                }
                Ok(())
            }
            _ => Err(PlaneError::FileDoesNotExist(*id)),
        }
    }

    pub async fn mark_deleted(&self, id: &Uuid) -> Result<Option<DeletedFile>> {
        self.mark_deleted_with(id, DeletionReason::Manual).await
    }

    /// Soft-delete an active file.
    ///
    /// Returns the new audit record, or `None` if the file was already
    /// deleted. Unknown ids are an error.
    pub async fn mark_deleted_with(
        &self,
        id: &Uuid,
        reason: DeletionReason,
    ) -> Result<Option<DeletedFile>> {
        let mut files = self.files.write().await;
        let entry = files.get_mut(id).ok_or(PlaneError::FileDoesNotExist(*id))?;

        let deleted = match &*entry {
            FileEntry::Deleted(_) => return Ok(None),
            FileEntry::Active(record) => DeletedFile {
                id: record.id,
                path: record.path.clone(),
                size: record.size,
                original_created_time: record.created_at,
                deleted_time: Utc::now(),
                reason,
            },
        };
        *entry = FileEntry::Deleted(deleted.clone());

        tracing::info!(file_id = %id, size = deleted.size, reason = ?reason, "File soft-deleted");
        Ok(Some(deleted))
    }

    pub async fn deleted_record(&self, id: &Uuid) -> Option<DeletedFile> {
        match self.files.read().await.get(id) {
            Some(FileEntry::Deleted(deleted)) => Some(deleted.clone()),
            _ => None,
        }
    }

    /// Active files ordered by creation time.
    pub async fn list_files(&self, paging: PagingRequest) -> PageView<FileRecord> {
        let mut active: Vec<FileRecord> = self
            .files
            .read()
            .await
            .values()
            .filter_map(|entry| match entry {
                FileEntry::Active(record) => Some(record.clone()),
                FileEntry::Deleted(_) => None,
            })
            .collect();
        active.sort_by_key(|r| r.created_at);
        paging.paginate(active)
    }

    /// Audit records ordered by deletion time.
    pub async fn list_deleted(&self, paging: PagingRequest) -> PageView<DeletedFile> {
        let mut deleted: Vec<DeletedFile> = self
            .files
            .read()
            .await
            .values()
            .filter_map(|entry| match entry {
                FileEntry::Deleted(deleted) => Some(deleted.clone()),
                FileEntry::Active(_) => None,
            })
            .collect();
        deleted.sort_by_key(|d| d.deleted_time);
        paging.paginate(deleted)
    }

    /// Soft-delete active files created more than `retention` before `now`
    /// that are not in `in_use`.
    pub async fn sweep_expired(
        &self,
        retention: chrono::Duration,
        now: DateTime<Utc>,
        in_use: &HashSet<Uuid>,
    ) -> Vec<DeletedFile> {
        let cutoff = now - retention;
        let expired: Vec<Uuid> = self
            .files
            .read()
            .await
            .values()
            .filter_map(|entry| match entry {
                FileEntry::Active(record)
                    if record.created_at < cutoff && !in_use.contains(&record.id) =>
                {
                    Some(record.id)
                }
                _ => None,
            })
            .collect();

        let mut swept = Vec::with_capacity(expired.len());
        for id in expired {
            // A concurrent delete between the scan and here yields Ok(None).
            if let Ok(Some(deleted)) = self.mark_deleted_with(&id, DeletionReason::Retention).await
            {
                swept.push(deleted);
            }
        }
        if !swept.is_empty() {
            tracing::info!(count = swept.len(), "Retention sweep soft-deleted files");
        }
        swept
    }
}
