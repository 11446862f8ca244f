//! Line-oriented control surface for server mode.
//!
//! Each input line is one JSON command; each gets one JSON reply line.
//! Workers report heartbeats and provisioning callbacks here, and clients
//! ingest files, submit jobs and report outcomes.

use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::catalog::FileCatalog;
use crate::error::{ErrorCode, PlaneError, Result};
use crate::node::ControlPlane;
use crate::scheduler::{Dispatcher, JobError, JobOutcome, JobRequest, JobState, JobType};
use crate::transfer::{TransferParams, TransferSource, TransferWay};
use crate::worker::{HeartbeatReport, WorkerId, WorkerRegistry};

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum IngressCommand {
    Heartbeat {
        worker_id: WorkerId,
        available_space: u64,
        total_space: u64,
    },
    /// Provisioning callback from an elastic worker
    Ready {
        worker_id: WorkerId,
        address: String,
        storage_root: PathBuf,
        total_space: u64,
    },
    Ingest {
        way: TransferWay,
        #[serde(default)]
        params: TransferParams,
        path: String,
        size: u64,
    },
    /// Create a job and dispatch it in the background
    Submit {
        job_type: JobType,
        file_id: Uuid,
        #[serde(default)]
        delete_file_on_completion: bool,
    },
    /// Analysis outcome; a present `error` means the analysis failed
    Complete {
        job_id: Uuid,
        #[serde(default)]
        error: Option<String>,
    },
    Cancel {
        job_id: Uuid,
    },
    Status {
        job_id: Uuid,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reply", rename_all = "snake_case")]
pub enum IngressReply {
    Accepted,
    FileIngested {
        file_id: Uuid,
    },
    JobSubmitted {
        job_id: Uuid,
    },
    Job {
        job_id: Uuid,
        state: JobState,
        #[serde(skip_serializing_if = "Option::is_none")]
        worker_id: Option<WorkerId>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<JobError>,
    },
    Error {
        code: ErrorCode,
        message: String,
    },
}

impl From<&PlaneError> for IngressReply {
    fn from(e: &PlaneError) -> Self {
        IngressReply::Error {
            code: e.code(),
            message: e.client_message(),
        }
    }
}

/// Applies [`IngressCommand`]s to a running control plane.
pub struct Ingress {
    catalog: Arc<FileCatalog>,
    registry: Arc<WorkerRegistry>,
    dispatcher: Arc<Dispatcher>,
    heartbeats: mpsc::Sender<HeartbeatReport>,
}

impl Ingress {
    /// Heartbeats are forwarded to `heartbeats`, usually the sender returned
    /// by [`ControlPlane::spawn_heartbeat_receiver`].
    pub fn new(plane: &ControlPlane, heartbeats: mpsc::Sender<HeartbeatReport>) -> Self {
        Self {
            catalog: plane.catalog.clone(),
            registry: plane.registry.clone(),
            dispatcher: plane.dispatcher.clone(),
            heartbeats,
        }
    }

    /// Parse and apply one line. Malformed input is an illegal argument.
    pub async fn handle_line(&self, line: &str) -> IngressReply {
        let command = match serde_json::from_str::<IngressCommand>(line) {
            Ok(command) => command,
            Err(e) => {
                let error = PlaneError::IllegalArgument(format!("malformed command: {}", e));
                return IngressReply::from(&error);
            }
        };
        match self.handle(command).await {
            Ok(reply) => reply,
            Err(e) => {
                tracing::debug!(code = %e.code(), error = %e, "Command rejected");
                IngressReply::from(&e)
            }
        }
    }

    pub async fn handle(&self, command: IngressCommand) -> Result<IngressReply> {
        match command {
            IngressCommand::Heartbeat {
                worker_id,
                available_space,
                total_space,
            } => {
                let report = HeartbeatReport::new(worker_id, available_space, total_space);
                self.heartbeats
                    .send(report)
                    .await
                    .map_err(|_| PlaneError::Unknown("heartbeat receiver stopped".to_string()))?;
                Ok(IngressReply::Accepted)
            }
            IngressCommand::Ready {
                worker_id,
                address,
                storage_root,
                total_space,
            } => {
                self.registry
                    .mark_ready(&worker_id, address, storage_root, total_space)
                    .await?;
                Ok(IngressReply::Accepted)
            }
            IngressCommand::Ingest {
                way,
                params,
                path,
                size,
            } => {
                let source = TransferSource::new(way, params)?;
                let file_id = self.catalog.ingest_from(source, path, size).await?;
                Ok(IngressReply::FileIngested { file_id })
            }
            IngressCommand::Submit {
                job_type,
                file_id,
                delete_file_on_completion,
            } => {
                let mut request = JobRequest::new(job_type, file_id);
                if delete_file_on_completion {
                    request = request.delete_file_on_completion();
                }
                let job_id = self.dispatcher.submit_request(request).await?;

                let dispatcher = self.dispatcher.clone();
                tokio::spawn(async move {
                    if let Err(e) = dispatcher.dispatch(&job_id).await {
                        tracing::warn!(job_id = %job_id, error = %e, "Dispatch failed");
                    }
                });
                Ok(IngressReply::JobSubmitted { job_id })
            }
            IngressCommand::Complete { job_id, error } => {
                let outcome = match error {
                    None => JobOutcome::Succeeded,
                    Some(message) => JobOutcome::Failed { message },
                };
                self.dispatcher.report_completion(&job_id, outcome).await?;
                self.status(&job_id).await
            }
            IngressCommand::Cancel { job_id } => {
                self.dispatcher.cancel(&job_id).await?;
                self.status(&job_id).await
            }
            IngressCommand::Status { job_id } => self.status(&job_id).await,
        }
    }

    async fn status(&self, job_id: &Uuid) -> Result<IngressReply> {
        let job = self.dispatcher.get_job(job_id).await?;
        Ok(IngressReply::Job {
            job_id: job.id,
            state: job.state,
            worker_id: job.assigned_worker.or(job.last_worker),
            error: job.last_error,
        })
    }

    /// Serve commands from `reader` until it reaches EOF or `shutdown` fires,
    /// writing one reply line per command to `writer`.
    pub async fn run<R, W>(
        &self,
        reader: R,
        mut writer: W,
        shutdown: CancellationToken,
    ) -> std::io::Result<()>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut lines = reader.lines();
        loop {
            let line = tokio::select! {
                line = lines.next_line() => line?,
                _ = shutdown.cancelled() => break,
            };
            let Some(line) = line else {
                tracing::info!("Command input closed");
                break;
            };
            if line.trim().is_empty() {
                continue;
            }

            let reply = self.handle_line(&line).await;
            let mut encoded = serde_json::to_vec(&reply)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
            encoded.push(b'\n');
            writer.write_all(&encoded).await?;
            writer.flush().await?;
        }
        Ok(())
    }
}
