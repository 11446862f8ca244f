pub mod dispatcher;
pub mod job;
pub mod store;

pub use dispatcher::{Dispatcher, JobRequest};
pub use job::{FileType, Job, JobError, JobOutcome, JobState, JobType};
pub use store::JobStore;
