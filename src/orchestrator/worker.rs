//! The task that carries one job through a worker agent and the project
//! backend, reporting back to the controller.

use std::sync::Arc;

use tokio::sync::mpsc;

use super::{Event, Input};
use crate::agent::{AgentOutcome, ExecuteRequest, WorkerAgent};
use crate::delivery::{DeliveryItem, ProjectBackend};
use crate::error::DeliveryError;

/// Where a running job currently is, for the sequential lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Downloading,
    Uploading,
}

/// Terminal report of one job task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Delivered { media_ref: String },
    /// The agent answered EXECUTE with ERROR.
    Rejected {
        message: String,
        error_code: Option<String>,
    },
    /// PING or EXECUTE never got a usable reply.
    AgentUnavailable(String),
    DownloadFailed(String),
    UploadFailed(String),
    AuthExpired,
}

pub(crate) struct JobTask {
    pub slot: usize,
    pub ticket: u64,
    pub needs_ping: bool,
    pub agent: Arc<dyn WorkerAgent>,
    pub backend: Arc<dyn ProjectBackend>,
    pub request: ExecuteRequest,
    /// Result index and segment; `media_ref` is filled in after generation.
    pub item: DeliveryItem,
    pub events: mpsc::Sender<Input>,
}

impl JobTask {
    pub async fn run(self) {
        let outcome = self.drive().await;
        let _ = self
            .events
            .send(Input::Event(Event::JobFinished {
                slot: self.slot,
                ticket: self.ticket,
                outcome,
            }))
            .await;
    }

    async fn drive(&self) -> JobOutcome {
        if self.needs_ping {
            match self.agent.ping().await {
                Ok(agent_id) => {
                    self.emit(Event::AgentReady {
                        slot: self.slot,
                        ticket: self.ticket,
                        agent_id,
                    })
                    .await;
                }
                Err(e) => return JobOutcome::AgentUnavailable(e.to_string()),
            }
        }

        tracing::debug!(slot = self.slot, index = self.item.index, "EXECUTE sent");
        let media_ref = match self.agent.execute(self.request.clone()).await {
            Ok(AgentOutcome::Complete { media_ref, .. }) => media_ref,
            Ok(AgentOutcome::Error {
                message,
                error_code,
            }) => {
                return JobOutcome::Rejected {
                    message,
                    error_code,
                };
            }
            Err(e) => return JobOutcome::AgentUnavailable(e.to_string()),
        };

        let item = DeliveryItem {
            media_ref: media_ref.clone(),
            ..self.item.clone()
        };

        self.emit_stage(Stage::Downloading).await;
        match self.backend.download(&item).await {
            Ok(()) => {}
            Err(DeliveryError::AuthExpired) => return JobOutcome::AuthExpired,
            Err(e) => return JobOutcome::DownloadFailed(e.to_string()),
        }

        if item.needs_upload() {
            self.emit_stage(Stage::Uploading).await;
            match self.backend.upload(&item).await {
                Ok(()) => {}
                Err(DeliveryError::AuthExpired) => return JobOutcome::AuthExpired,
                Err(e) => {
                    tracing::warn!(
                        index = item.index,
                        error = %e,
                        "Generated media could not be delivered"
                    );
                    return JobOutcome::UploadFailed(e.to_string());
                }
            }
        }

        JobOutcome::Delivered { media_ref }
    }

    async fn emit_stage(&self, stage: Stage) {
        self.emit(Event::JobStage {
            slot: self.slot,
            ticket: self.ticket,
            stage,
        })
        .await;
    }

    async fn emit(&self, event: Event) {
        let _ = self.events.send(Input::Event(event)).await;
    }
}
