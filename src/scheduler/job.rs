use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ErrorCode, PlaneError, Result};
use crate::worker::WorkerId;

/// Kind of artifact an analysis consumes. Workers advertise which kinds they
/// accept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FileType {
    HeapDump,
    GcLog,
    ThreadDump,
}

impl FileType {
    pub const ALL: [FileType; 3] = [FileType::HeapDump, FileType::GcLog, FileType::ThreadDump];

    pub const fn tag(self) -> &'static str {
        match self {
            FileType::HeapDump => "heap-dump",
            FileType::GcLog => "gc-log",
            FileType::ThreadDump => "thread-dump",
        }
    }
}

impl std::fmt::Display for FileType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.tag())
    }
}

impl FromStr for FileType {
    type Err = PlaneError;

    fn from_str(s: &str) -> Result<Self> {
        FileType::ALL
            .into_iter()
            .find(|t| t.tag() == s)
            .ok_or_else(|| PlaneError::IllegalArgument(format!("unknown file type: {}", s)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobType {
    FileTransfer,
    HeapDumpAnalysis,
    GclogAnalysis,
    ThreadDumpAnalysis,
}

impl JobType {
    pub const ALL: [JobType; 4] = [
        JobType::FileTransfer,
        JobType::HeapDumpAnalysis,
        JobType::GclogAnalysis,
        JobType::ThreadDumpAnalysis,
    ];

    /// Artifact kind the job analyses. File transfers carry none.
    pub const fn file_type(self) -> Option<FileType> {
        match self {
            JobType::FileTransfer => None,
            JobType::HeapDumpAnalysis => Some(FileType::HeapDump),
            JobType::GclogAnalysis => Some(FileType::GcLog),
            JobType::ThreadDumpAnalysis => Some(FileType::ThreadDump),
        }
    }

    pub fn tag(self) -> Option<&'static str> {
        self.file_type().map(FileType::tag)
    }

    pub const fn is_file_transfer(self) -> bool {
        matches!(self, JobType::FileTransfer)
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            JobType::FileTransfer => "FILE_TRANSFER",
            JobType::HeapDumpAnalysis => "HEAP_DUMP_ANALYSIS",
            JobType::GclogAnalysis => "GCLOG_ANALYSIS",
            JobType::ThreadDumpAnalysis => "THREAD_DUMP_ANALYSIS",
        }
    }
}

impl std::fmt::Display for JobType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobType {
    type Err = PlaneError;

    fn from_str(s: &str) -> Result<Self> {
        JobType::ALL
            .into_iter()
            .find(|t| t.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| PlaneError::IllegalArgument(format!("unknown job type: {}", s)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    Created,
    Queued,
    Assigned,
    Running,
    Succeeded,
    Failed,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Succeeded | JobState::Failed)
    }

    pub fn can_transition_to(self, next: JobState) -> bool {
        use JobState::*;
        match (self, next) {
            (Created, Queued) | (Queued, Assigned) | (Assigned, Running) | (Running, Succeeded) => {
                true
            }
            (from, Failed) => !from.is_terminal(),
            _ => false,
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobState::Created => write!(f, "created"),
            JobState::Queued => write!(f, "queued"),
            JobState::Assigned => write!(f, "assigned"),
            JobState::Running => write!(f, "running"),
            JobState::Succeeded => write!(f, "succeeded"),
            JobState::Failed => write!(f, "failed"),
        }
    }
}

/// Error recorded on a failed job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobError {
    pub code: ErrorCode,
    pub message: String,
}

impl From<&PlaneError> for JobError {
    fn from(e: &PlaneError) -> Self {
        Self {
            code: e.code(),
            message: e.to_string(),
        }
    }
}

/// Capacity held on a worker on behalf of a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reservation {
    pub worker_id: WorkerId,
    pub amount: u64,
}

/// How an analysis ended, as reported by the worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Succeeded,
    Failed { message: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct Job {
    pub id: Uuid,
    pub job_type: JobType,
    pub file_id: Uuid,
    pub state: JobState,
    pub assigned_worker: Option<WorkerId>,
    /// Last worker that held the job, kept after it is released
    pub last_worker: Option<WorkerId>,
    pub landed_path: Option<PathBuf>,
    pub attempts: u32,
    pub cancelled: bool,
    pub delete_file_on_completion: bool,
    pub last_error: Option<JobError>,
    pub created_at: DateTime<Utc>,
    pub assigned_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip)]
    pub(crate) reservation: Option<Reservation>,
    /// Set by the dispatch call that owns the job while it is queued
    #[serde(skip)]
    pub(crate) claimed: bool,
}

impl Job {
    pub fn new(job_type: JobType, file_id: Uuid) -> Self {
        Self {
            id: Uuid::new_v4(),
            job_type,
            file_id,
            state: JobState::Created,
            assigned_worker: None,
            last_worker: None,
            landed_path: None,
            attempts: 0,
            cancelled: false,
            delete_file_on_completion: false,
            last_error: None,
            created_at: Utc::now(),
            assigned_at: None,
            completed_at: None,
            reservation: None,
            claimed: false,
        }
    }

    fn advance(&mut self, next: JobState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(PlaneError::IllegalArgument(format!(
                "job {} is {}, cannot move to {}",
                self.id, self.state, next
            )));
        }
        self.state = next;
        Ok(())
    }

    pub(crate) fn queue(&mut self) -> Result<()> {
        self.advance(JobState::Queued)
    }

    pub(crate) fn assign(&mut self, reservation: Reservation) -> Result<()> {
        self.advance(JobState::Assigned)?;
        self.assigned_worker = Some(reservation.worker_id.clone());
        self.last_worker = Some(reservation.worker_id.clone());
        self.assigned_at = Some(Utc::now());
        self.reservation = Some(reservation);
        Ok(())
    }

    pub(crate) fn start(&mut self, landed_path: PathBuf) -> Result<()> {
        self.advance(JobState::Running)?;
        self.landed_path = Some(landed_path);
        Ok(())
    }

    pub(crate) fn succeed(&mut self) -> Result<()> {
        self.advance(JobState::Succeeded)?;
        self.release_worker();
        Ok(())
    }

    pub(crate) fn fail(&mut self, error: JobError) -> Result<()> {
        self.advance(JobState::Failed)?;
        self.last_error = Some(error);
        self.release_worker();
        Ok(())
    }

    /// Cancellation is only possible before the analysis starts running.
    pub(crate) fn cancel(&mut self) -> Result<()> {
        if !matches!(
            self.state,
            JobState::Created | JobState::Queued | JobState::Assigned
        ) {
            return Err(PlaneError::IllegalArgument(format!(
                "job {} is {} and can no longer be cancelled",
                self.id, self.state
            )));
        }
        self.advance(JobState::Failed)?;
        self.cancelled = true;
        self.release_worker();
        Ok(())
    }

    /// Takes the reservation so that exactly one caller releases it.
    pub(crate) fn take_reservation(&mut self) -> Option<Reservation> {
        self.reservation.take()
    }

    fn release_worker(&mut self) {
        self.assigned_worker = None;
        self.completed_at = Some(Utc::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reservation(worker: &str) -> Reservation {
        Reservation {
            worker_id: WorkerId::from(worker),
            amount: 10,
        }
    }

    #[test]
    fn job_type_tags() {
        assert_eq!(JobType::HeapDumpAnalysis.tag(), Some("heap-dump"));
        assert_eq!(JobType::GclogAnalysis.tag(), Some("gc-log"));
        assert_eq!(JobType::ThreadDumpAnalysis.tag(), Some("thread-dump"));
        assert_eq!(JobType::FileTransfer.tag(), None);
    }

    #[test]
    fn only_file_transfer_is_file_transfer() {
        for job_type in JobType::ALL {
            assert_eq!(
                job_type.is_file_transfer(),
                job_type == JobType::FileTransfer
            );
        }
    }

    #[test]
    fn job_type_parses_wire_names() {
        assert_eq!(
            "GCLOG_ANALYSIS".parse::<JobType>().unwrap(),
            JobType::GclogAnalysis
        );
        assert!(matches!(
            "OQL_QUERY".parse::<JobType>(),
            Err(PlaneError::IllegalArgument(_))
        ));
        assert_eq!("gc-log".parse::<FileType>().unwrap(), FileType::GcLog);
    }

    #[test]
    fn terminal_states_have_no_exits() {
        for next in [
            JobState::Created,
            JobState::Queued,
            JobState::Assigned,
            JobState::Running,
            JobState::Succeeded,
            JobState::Failed,
        ] {
            assert!(!JobState::Succeeded.can_transition_to(next));
            assert!(!JobState::Failed.can_transition_to(next));
        }
    }

    #[test]
    fn happy_path_sets_and_clears_worker() {
        let mut job = Job::new(JobType::HeapDumpAnalysis, Uuid::new_v4());
        assert_eq!(job.state, JobState::Created);
        assert!(job.assigned_worker.is_none());

        job.queue().unwrap();
        job.assign(reservation("w1")).unwrap();
        assert_eq!(job.assigned_worker, Some(WorkerId::from("w1")));
        assert!(job.assigned_at.is_some());

        job.start(PathBuf::from("/srv/w1/heap.hprof")).unwrap();
        assert_eq!(job.state, JobState::Running);
        assert!(job.assigned_worker.is_some());

        job.succeed().unwrap();
        assert_eq!(job.state, JobState::Succeeded);
        assert!(job.assigned_worker.is_none());
        assert_eq!(job.last_worker, Some(WorkerId::from("w1")));
        assert!(job.completed_at.is_some());
    }

    #[test]
    fn assigned_worker_set_only_while_assigned_or_running() {
        fn check(job: &Job) {
            assert_eq!(
                job.assigned_worker.is_some(),
                matches!(job.state, JobState::Assigned | JobState::Running),
                "job in {} with worker {:?}",
                job.state,
                job.assigned_worker
            );
        }

        let mut job = Job::new(JobType::GclogAnalysis, Uuid::new_v4());
        check(&job);
        job.queue().unwrap();
        check(&job);
        job.assign(reservation("w1")).unwrap();
        check(&job);
        job.start(PathBuf::from("/srv/w1/gc.log")).unwrap();
        check(&job);
        job.fail(JobError::from(&PlaneError::Unknown("oom".to_string())))
            .unwrap();
        check(&job);

        let mut cancelled = Job::new(JobType::GclogAnalysis, Uuid::new_v4());
        cancelled.queue().unwrap();
        cancelled.assign(reservation("w2")).unwrap();
        cancelled.cancel().unwrap();
        check(&cancelled);
    }

    #[test]
    fn skipping_states_is_rejected() {
        let mut job = Job::new(JobType::GclogAnalysis, Uuid::new_v4());
        assert!(job.assign(reservation("w1")).is_err());
        assert!(job.succeed().is_err());
        assert_eq!(job.state, JobState::Created);
    }

    #[test]
    fn cancel_only_before_running() {
        let mut job = Job::new(JobType::GclogAnalysis, Uuid::new_v4());
        job.queue().unwrap();
        job.assign(reservation("w1")).unwrap();
        job.cancel().unwrap();
        assert_eq!(job.state, JobState::Failed);
        assert!(job.cancelled);
        assert!(job.assigned_worker.is_none());
        assert_eq!(job.take_reservation(), Some(reservation("w1")));
        assert_eq!(job.take_reservation(), None);

        let mut running = Job::new(JobType::GclogAnalysis, Uuid::new_v4());
        running.queue().unwrap();
        running.assign(reservation("w1")).unwrap();
        running.start(PathBuf::from("/tmp/gc.log")).unwrap();
        assert!(running.cancel().is_err());
        assert_eq!(running.state, JobState::Running);
    }

    #[test]
    fn failure_records_error() {
        let mut job = Job::new(JobType::ThreadDumpAnalysis, Uuid::new_v4());
        job.queue().unwrap();
        let err = PlaneError::Transfer("connection refused".to_string());
        job.fail(JobError::from(&err)).unwrap();
        let recorded = job.last_error.clone().unwrap();
        assert_eq!(recorded.code, ErrorCode::TransferError);
        assert!(job.fail(JobError::from(&err)).is_err());
    }
}
