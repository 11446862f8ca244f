use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use crate::error::{PlaneError, Result};
use crate::scheduler::job::Job;

const DEFAULT_MAX_JOBS: usize = 10_000;

/// Owns job records. Each record sits behind its own mutex so transitions on
/// one job are serialized without blocking others.
///
/// Records are kept for the life of the store. Only unfinished jobs count
/// against `max_jobs`.
#[derive(Debug)]
pub struct JobStore {
    jobs: RwLock<HashMap<Uuid, Arc<Mutex<Job>>>>,
    max_jobs: usize,
}

impl Default for JobStore {
    fn default() -> Self {
        Self::new()
    }
}

impl JobStore {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_MAX_JOBS)
    }

    pub fn with_capacity(max_jobs: usize) -> Self {
        Self {
            jobs: RwLock::new(HashMap::new()),
            max_jobs,
        }
    }

    /// Add a new job. Fails if `max_jobs` jobs are already unfinished.
    pub async fn insert(&self, job: Job) -> Result<()> {
        let mut jobs = self.jobs.write().await;
        if jobs.len() >= self.max_jobs {
            let mut active = 0;
            for handle in jobs.values() {
                if !handle.lock().await.state.is_terminal() {
                    active += 1;
                }
            }
            if active >= self.max_jobs {
                return Err(PlaneError::IllegalArgument(format!(
                    "job store at capacity ({} unfinished jobs), retry later",
                    self.max_jobs
                )));
            }
        }
        jobs.insert(job.id, Arc::new(Mutex::new(job)));
        Ok(())
    }

    pub(crate) async fn handle(&self, id: &Uuid) -> Result<Arc<Mutex<Job>>> {
        self.jobs
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or(PlaneError::JobNotFound(*id))
    }

    /// Snapshot of one job.
    pub async fn get(&self, id: &Uuid) -> Result<Job> {
        let handle = self.handle(id).await?;
        let job = handle.lock().await;
        Ok(job.clone())
    }

    async fn snapshot(&self) -> Vec<Job> {
        let handles: Vec<Arc<Mutex<Job>>> = self.jobs.read().await.values().cloned().collect();
        let mut jobs = Vec::with_capacity(handles.len());
        for handle in handles {
            jobs.push(handle.lock().await.clone());
        }
        jobs
    }

    /// All jobs sorted chronologically by creation time
    pub async fn all(&self) -> Vec<Job> {
        let mut jobs = self.snapshot().await;
        jobs.sort_by_key(|j| j.created_at);
        jobs
    }

    /// Files referenced by jobs that have not finished.
    pub async fn files_in_use(&self) -> HashSet<Uuid> {
        self.snapshot()
            .await
            .into_iter()
            .filter(|j| !j.state.is_terminal())
            .map(|j| j.file_id)
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.jobs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.jobs.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::job::{JobState, JobType};

    #[tokio::test]
    async fn insert_respects_capacity() {
        let store = JobStore::with_capacity(1);
        store
            .insert(Job::new(JobType::GclogAnalysis, Uuid::new_v4()))
            .await
            .unwrap();
        let overflow = store
            .insert(Job::new(JobType::GclogAnalysis, Uuid::new_v4()))
            .await;
        assert!(matches!(overflow, Err(PlaneError::IllegalArgument(_))));
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn finished_jobs_do_not_count_toward_capacity() {
        let store = JobStore::with_capacity(2);
        for state in [JobState::Succeeded, JobState::Failed] {
            let mut job = Job::new(JobType::GclogAnalysis, Uuid::new_v4());
            job.state = state;
            store.insert(job).await.unwrap();
        }

        store
            .insert(Job::new(JobType::GclogAnalysis, Uuid::new_v4()))
            .await
            .unwrap();
        store
            .insert(Job::new(JobType::GclogAnalysis, Uuid::new_v4()))
            .await
            .unwrap();
        assert_eq!(store.len().await, 4);

        // Two unfinished jobs fill the store
        assert!(store
            .insert(Job::new(JobType::GclogAnalysis, Uuid::new_v4()))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn files_in_use_skips_finished_jobs() {
        let store = JobStore::new();
        let active = Job::new(JobType::HeapDumpAnalysis, Uuid::new_v4());
        let mut done = Job::new(JobType::HeapDumpAnalysis, Uuid::new_v4());
        done.state = JobState::Succeeded;
        let active_file = active.file_id;

        store.insert(active).await.unwrap();
        store.insert(done).await.unwrap();

        let in_use = store.files_in_use().await;
        assert_eq!(in_use.len(), 1);
        assert!(in_use.contains(&active_file));
    }

    #[tokio::test]
    async fn unknown_job_is_not_found() {
        let store = JobStore::new();
        let id = Uuid::new_v4();
        assert!(matches!(
            store.get(&id).await,
            Err(PlaneError::JobNotFound(missing)) if missing == id
        ));
    }
}
