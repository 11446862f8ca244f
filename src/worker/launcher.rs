use async_trait::async_trait;

use crate::error::Result;
use crate::scheduler::Job;
use crate::transfer::{LandedFile, TransferTarget};

/// Hands a running job to the worker holding its artifact. The analysis
/// itself runs on the worker, which reports back through
/// [`Dispatcher::report_completion`](crate::scheduler::Dispatcher::report_completion).
#[async_trait]
pub trait AnalysisLauncher: Send + Sync {
    async fn launch(&self, job: &Job, target: &TransferTarget, landed: &LandedFile) -> Result<()>;
}

/// Launcher for deployments where workers pick up landed artifacts on their
/// own; it only records the hand-off.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingLauncher;

#[async_trait]
impl AnalysisLauncher for LoggingLauncher {
    async fn launch(&self, job: &Job, target: &TransferTarget, landed: &LandedFile) -> Result<()> {
        tracing::info!(
            job_id = %job.id,
            job_type = %job.job_type,
            worker_id = %target.worker_id,
            path = %landed.path.display(),
            "Analysis handed off"
        );
        Ok(())
    }
}
