use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use uuid::Uuid;

use crate::alert::{AlertSink, TracingAlertSink};
use crate::catalog::{DeletionReason, FileCatalog, FileRecord};
use crate::config::RetryPolicy;
use crate::error::{PlaneError, Result};
use crate::paging::{PageView, PagingRequest};
use crate::scheduler::job::{FileType, Job, JobError, JobOutcome, JobState, JobType, Reservation};
use crate::scheduler::store::JobStore;
use crate::transfer::{TransferRequest, TransferStrategy};
use crate::worker::{AnalysisLauncher, CapacityError, ElasticProvisioner, WorkerId, WorkerRegistry};

const DEFAULT_PROVISIONING_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Poll interval while waiting on an elastic worker past the retry budget.
const ELASTIC_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// A job submission.
#[derive(Debug, Clone)]
pub struct JobRequest {
    pub job_type: JobType,
    pub file_id: Uuid,
    /// Soft-delete the file once the job succeeds
    pub delete_file_on_completion: bool,
}

impl JobRequest {
    pub fn new(job_type: JobType, file_id: Uuid) -> Self {
        Self {
            job_type,
            file_id,
            delete_file_on_completion: false,
        }
    }

    pub fn delete_file_on_completion(mut self) -> Self {
        self.delete_file_on_completion = true;
        self
    }
}

/// Owns job state and drives jobs from submission to completion:
/// select a worker → reserve capacity → transfer the artifact → hand off →
/// observe completion → release capacity.
///
/// Transitions on a job happen under that job's lock, and the capacity
/// reservation lives on the job record. Whichever path ends the job takes the
/// reservation out of the record and releases it, so capacity is returned
/// exactly once even when cancellation races with dispatch.
pub struct Dispatcher {
    jobs: JobStore,
    catalog: Arc<FileCatalog>,
    registry: Arc<WorkerRegistry>,
    transfers: TransferStrategy,
    launcher: Arc<dyn AnalysisLauncher>,
    provisioner: Option<Arc<dyn ElasticProvisioner>>,
    alerts: Arc<dyn AlertSink>,
    retry: RetryPolicy,
    provisioning_timeout: Duration,
}

/// Dispatch ownership of a queued job. Dropping it clears the claim, so a
/// dispatch whose future is abandoned part way leaves the job dispatchable.
struct Claim {
    handle: Arc<Mutex<Job>>,
}

impl Drop for Claim {
    fn drop(&mut self) {
        if let Ok(mut job) = self.handle.try_lock() {
            job.claimed = false;
            return;
        }
        let handle = self.handle.clone();
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(async move {
                handle.lock().await.claimed = false;
            });
        }
    }
}

/// Result of one pass of worker acquisition.
enum Acquired {
    Worker(WorkerId),
    /// The job left QUEUED while we were looking, e.g. it was cancelled
    Abandoned,
    Exhausted(u32),
}

impl Dispatcher {
    pub fn new(
        catalog: Arc<FileCatalog>,
        registry: Arc<WorkerRegistry>,
        transfers: TransferStrategy,
        launcher: Arc<dyn AnalysisLauncher>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            jobs: JobStore::new(),
            catalog,
            registry,
            transfers,
            launcher,
            provisioner: None,
            alerts: Arc::new(TracingAlertSink),
            retry,
            provisioning_timeout: DEFAULT_PROVISIONING_TIMEOUT,
        }
    }

    /// Bounds both the provisioning request and the wait for the
    /// provisioned worker to become ready.
    pub fn with_provisioning_timeout(mut self, timeout: Duration) -> Self {
        self.provisioning_timeout = timeout;
        self
    }

    /// Enable elastic provisioning when no existing worker fits a job.
    pub fn with_provisioner(mut self, provisioner: Arc<dyn ElasticProvisioner>) -> Self {
        self.provisioner = Some(provisioner);
        self
    }

    pub fn with_alert_sink(mut self, alerts: Arc<dyn AlertSink>) -> Self {
        self.alerts = alerts;
        self
    }

    pub fn with_max_jobs(mut self, max_jobs: usize) -> Self {
        self.jobs = JobStore::with_capacity(max_jobs);
        self
    }

    pub async fn submit(&self, job_type: JobType, file_id: Uuid) -> Result<Uuid> {
        self.submit_request(JobRequest::new(job_type, file_id)).await
    }

    /// Create a job in CREATED. The file must be active in the catalog.
    pub async fn submit_request(&self, request: JobRequest) -> Result<Uuid> {
        self.catalog.get(&request.file_id).await?;

        let mut job = Job::new(request.job_type, request.file_id);
        job.delete_file_on_completion = request.delete_file_on_completion;
        let job_id = job.id;

        self.jobs.insert(job).await?;
        self.catalog.attach_job(&request.file_id, job_id).await?;

        tracing::info!(
            job_id = %job_id,
            job_type = %request.job_type,
            file_id = %request.file_id,
            "Job submitted"
        );
        Ok(job_id)
    }

    pub async fn get_job(&self, job_id: &Uuid) -> Result<Job> {
        self.jobs.get(job_id).await
    }

    /// Jobs ordered by creation time.
    pub async fn list_jobs(&self, paging: PagingRequest) -> PageView<Job> {
        paging.paginate(self.jobs.all().await)
    }

    /// Files referenced by jobs that have not finished.
    pub async fn files_in_use(&self) -> HashSet<Uuid> {
        self.jobs.files_in_use().await
    }

    /// Drive a job through worker selection, transfer and hand-off.
    ///
    /// Idempotent: a job that is already assigned or further along, or that
    /// another dispatch call is working on, is left alone. Returns the state
    /// the job is in when this call finishes.
    pub async fn dispatch(&self, job_id: &Uuid) -> Result<JobState> {
        let handle = self.jobs.handle(job_id).await?;
        let (job_type, file_id) = {
            let mut job = handle.lock().await;
            match job.state {
                JobState::Created => job.queue()?,
                JobState::Queued if !job.claimed => {}
                state => return Ok(state),
            }
            job.claimed = true;
            (job.job_type, job.file_id)
        };
        let _claim = Claim {
            handle: handle.clone(),
        };
        tracing::debug!(job_id = %job_id, "Job queued for dispatch");

        self.run_dispatch(&handle, job_type, file_id).await;

        let state = handle.lock().await.state;
        Ok(state)
    }

    async fn run_dispatch(&self, handle: &Arc<Mutex<Job>>, job_type: JobType, file_id: Uuid) {
        let file = match self.catalog.get(&file_id).await {
            Ok(file) => file,
            Err(e) => {
                self.fail_job(handle, e).await;
                return;
            }
        };

        let worker_id = match self.acquire_worker(handle, job_type.file_type(), &file).await {
            Acquired::Worker(worker_id) => worker_id,
            Acquired::Abandoned => return,
            Acquired::Exhausted(attempts) => {
                let error = PlaneError::Transfer(format!(
                    "no capable worker for {} after {} attempts",
                    job_type, attempts
                ));
                self.fail_job(handle, error).await;
                return;
            }
        };

        let reservation = Reservation {
            worker_id: worker_id.clone(),
            amount: file.size,
        };
        let job_id = {
            let mut job = handle.lock().await;
            if job.state != JobState::Queued {
                drop(job);
                self.release(&reservation).await;
                return;
            }
            if let Err(e) = job.assign(reservation.clone()) {
                drop(job);
                self.release(&reservation).await;
                self.fail_job(handle, PlaneError::ShouldNotReachHere(e.to_string()))
                    .await;
                return;
            }
            tracing::info!(job_id = %job.id, worker_id = %worker_id, "Job assigned");
            job.id
        };

        let target = match self.registry.target(&worker_id).await {
            Ok(target) => target,
            Err(e) => {
                self.fail_job(handle, PlaneError::SanityCheck(e.to_string())).await;
                return;
            }
        };

        let request = TransferRequest {
            file_id: file.id,
            source: &file.source,
            path: &file.path,
            target: &target,
        };
        let landed = match self.transfers.transfer(request).await {
            Ok(landed) => landed,
            Err(e) => {
                self.fail_job(handle, e).await;
                return;
            }
        };

        let snapshot = {
            let mut job = handle.lock().await;
            if job.state != JobState::Assigned {
                // Cancelled during the transfer; cancel released the capacity.
                tracing::info!(job_id = %job_id, state = %job.state, "Job left ASSIGNED during transfer");
                return;
            }
            if let Err(e) = job.start(landed.path.clone()) {
                drop(job);
                self.fail_job(handle, PlaneError::ShouldNotReachHere(e.to_string()))
                    .await;
                return;
            }
            tracing::info!(job_id = %job_id, worker_id = %worker_id, "Job running");
            job.clone()
        };

        if job_type.is_file_transfer() {
            // Landing the file is the whole job.
            if let Err(e) = self.complete(&job_id, JobOutcome::Succeeded).await {
                tracing::debug!(job_id = %job_id, error = %e, "File transfer completion skipped");
            }
            return;
        }

        if let Err(e) = self.launcher.launch(&snapshot, &target, &landed).await {
            let error = match e {
                PlaneError::Unknown(_) => e,
                other => PlaneError::Unknown(format!("hand-off to {} failed: {}", worker_id, other)),
            };
            self.fail_job(handle, error).await;
        }
    }

    /// Select and reserve a worker, retrying with backoff.
    ///
    /// Elastic workers that are still provisioning are polled on later
    /// attempts while selection keeps looking at the other candidates; workers
    /// that prove unusable are excluded for the rest of this dispatch. Once an
    /// elastic worker has been requested, polling continues past the retry
    /// budget until the provisioning timeout runs out.
    async fn acquire_worker(
        &self,
        handle: &Arc<Mutex<Job>>,
        file_type: Option<FileType>,
        file: &FileRecord,
    ) -> Acquired {
        let mut excluded: HashSet<WorkerId> = HashSet::new();
        let mut pending_elastic: Option<WorkerId> = None;
        let mut elastic_deadline: Option<Instant> = None;
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            if attempt > self.retry.max_attempts {
                let waiting = pending_elastic.is_some()
                    && elastic_deadline.is_some_and(|deadline| Instant::now() < deadline);
                if !waiting {
                    return Acquired::Exhausted(attempt - 1);
                }
                tokio::time::sleep(self.retry.backoff(attempt - 1).max(ELASTIC_POLL_INTERVAL)).await;
            } else if attempt > 1 {
                tokio::time::sleep(self.retry.backoff(attempt - 1)).await;
            }
            {
                let mut job = handle.lock().await;
                if job.state != JobState::Queued {
                    return Acquired::Abandoned;
                }
                job.attempts = attempt;
            }

            let candidate = match self
                .registry
                .select_excluding(file_type, file.size, &excluded)
                .await
            {
                Ok(worker_id) => worker_id,
                Err(CapacityError::NoCapableWorker { .. }) => {
                    match self.elastic_candidate(&mut pending_elastic, file_type, file.size).await {
                        Some(worker_id) => {
                            elastic_deadline
                                .get_or_insert_with(|| Instant::now() + self.provisioning_timeout);
                            worker_id
                        }
                        None => {
                            tracing::debug!(file_id = %file.id, attempt, "No capable worker yet");
                            continue;
                        }
                    }
                }
                Err(e) => {
                    tracing::debug!(file_id = %file.id, attempt, error = %e, "Selection failed");
                    continue;
                }
            };

            match self.registry.reserve(&candidate, file.size).await {
                Ok(()) => return Acquired::Worker(candidate),
                Err(CapacityError::NotReady(worker_id)) => {
                    // Keep polling it, but let selection find anything else.
                    tracing::debug!(worker_id = %worker_id, attempt, "Worker not ready, retrying");
                    excluded.insert(worker_id);
                }
                Err(CapacityError::InsufficientSpace { worker_id, .. }) => {
                    tracing::debug!(worker_id = %worker_id, attempt, "Lost reservation race, reselecting");
                }
                Err(CapacityError::Unreachable(worker_id))
                | Err(CapacityError::UnknownWorker(worker_id)) => {
                    if pending_elastic.as_ref() == Some(&worker_id) {
                        pending_elastic = None;
                        elastic_deadline = None;
                    }
                    excluded.insert(worker_id);
                }
                Err(CapacityError::NoCapableWorker { .. }) => {}
            }
        }
    }

    /// The elastic worker to poll when no existing worker fits: the one this
    /// dispatch is already waiting for, one another dispatch already asked
    /// for, or a freshly provisioned one.
    async fn elastic_candidate(
        &self,
        pending: &mut Option<WorkerId>,
        file_type: Option<FileType>,
        required_space: u64,
    ) -> Option<WorkerId> {
        let provisioner = self.provisioner.as_ref()?;
        if let Some(worker_id) = pending.as_ref() {
            return Some(worker_id.clone());
        }
        if let Some(worker_id) = self.registry.pending_elastic(file_type).await {
            *pending = Some(worker_id.clone());
            return Some(worker_id);
        }

        let worker_id = self.registry.provision_elastic(file_type).await;
        let requested = tokio::time::timeout(
            self.provisioning_timeout,
            provisioner.provision(&worker_id, file_type, required_space),
        )
        .await
        .unwrap_or_else(|_| {
            Err(PlaneError::Unknown(format!(
                "provisioning {} did not finish within {}ms",
                worker_id,
                self.provisioning_timeout.as_millis()
            )))
        });
        if let Err(e) = requested {
            self.alerts.alert(&e, "elastic provisioning");
            if let Err(e) = self.registry.mark_unreachable(&worker_id).await {
                tracing::error!(worker_id = %worker_id, error = %e, "Cannot mark worker unreachable");
            }
            return None;
        }
        *pending = Some(worker_id.clone());
        Some(worker_id)
    }

    /// Record a worker-reported outcome. Only RUNNING jobs accept one, so a
    /// duplicate report is rejected rather than applied twice.
    pub async fn report_completion(&self, job_id: &Uuid, outcome: JobOutcome) -> Result<JobState> {
        self.complete(job_id, outcome).await
    }

    async fn complete(&self, job_id: &Uuid, outcome: JobOutcome) -> Result<JobState> {
        let handle = self.jobs.handle(job_id).await?;
        let mut failure = None;
        let (reservation, state, delete_file, file_id) = {
            let mut job = handle.lock().await;
            if job.state != JobState::Running {
                return Err(PlaneError::IllegalArgument(format!(
                    "job {} is {}, not running",
                    job_id, job.state
                )));
            }
            match &outcome {
                JobOutcome::Succeeded => job.succeed()?,
                JobOutcome::Failed { message } => {
                    let error = PlaneError::Unknown(format!("analysis failed: {}", message));
                    job.fail(JobError::from(&error))?;
                    failure = Some(error);
                }
            }
            (
                job.take_reservation(),
                job.state,
                job.delete_file_on_completion,
                job.file_id,
            )
        };

        tracing::info!(job_id = %job_id, state = %state, "Job completed");
        if let Some(error) = failure {
            self.alerts.alert(&error, "analysis");
        }
        if let Some(reservation) = reservation {
            self.release(&reservation).await;
        }

        if state == JobState::Succeeded && delete_file {
            if let Err(e) = self
                .catalog
                .mark_deleted_with(&file_id, DeletionReason::JobCompleted)
                .await
            {
                tracing::warn!(job_id = %job_id, file_id = %file_id, error = %e, "Could not delete file after job");
            }
        }
        Ok(state)
    }

    /// Cancel a job that has not started running. Cooperative: it only
    /// changes recorded state and returns held capacity.
    pub async fn cancel(&self, job_id: &Uuid) -> Result<JobState> {
        let handle = self.jobs.handle(job_id).await?;
        let reservation = {
            let mut job = handle.lock().await;
            job.cancel()?;
            job.take_reservation()
        };
        tracing::info!(job_id = %job_id, "Job cancelled");
        if let Some(reservation) = reservation {
            self.release(&reservation).await;
        }
        Ok(JobState::Failed)
    }

    /// Move a job to FAILED, recording `error` and returning its capacity.
    /// Does nothing if the job already finished.
    async fn fail_job(&self, handle: &Arc<Mutex<Job>>, error: PlaneError) {
        let (job_id, reservation) = {
            let mut job = handle.lock().await;
            if job.state.is_terminal() {
                return;
            }
            if let Err(e) = job.fail(JobError::from(&error)) {
                tracing::error!(job_id = %job.id, error = %e, "Cannot fail job");
                return;
            }
            (job.id, job.take_reservation())
        };

        tracing::warn!(job_id = %job_id, code = %error.code(), error = %error, "Job failed");
        if error.is_fatal() {
            self.alerts.alert(&error, "job dispatch");
        }
        if let Some(reservation) = reservation {
            self.release(&reservation).await;
        }
    }

    async fn release(&self, reservation: &Reservation) {
        if let Err(e) = self
            .registry
            .release(&reservation.worker_id, reservation.amount)
            .await
        {
            tracing::error!(worker_id = %reservation.worker_id, error = %e, "Capacity release failed");
            self.alerts.alert(&e, "capacity release");
        }
    }
}
