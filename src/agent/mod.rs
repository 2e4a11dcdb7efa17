//! Boundary to the per-site automation agents that type prompts and click
//! buttons on the target web tool.
//!
//! Every exchange is one typed [`AgentRequest`] answered by one
//! [`AgentReply`]. Implementations only provide [`WorkerAgent::send`]; the
//! helpers map replies onto the three protocol verbs.

pub mod http;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::AgentError;
use crate::state_machine::{MediaKind, Platform};

pub use http::HttpWorkerAgent;

/// Body of an EXECUTE request: everything the agent needs for one job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecuteRequest {
    pub prompt: String,
    pub media_kind: MediaKind,
    pub platform: Platform,
    /// Site-specific settings, passed through untouched.
    #[serde(default)]
    pub settings: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_media_ref: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgentRequest {
    Execute(ExecuteRequest),
    Stop,
    Ping,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgentReply {
    Complete {
        media_ref: String,
        media_kind: MediaKind,
    },
    Error {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error_code: Option<String>,
    },
    Ok {
        agent_id: String,
    },
    Ack,
}

/// Terminal event for one EXECUTE.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentOutcome {
    Complete {
        media_ref: String,
        media_kind: MediaKind,
    },
    Error {
        message: String,
        error_code: Option<String>,
    },
}

#[async_trait]
pub trait WorkerAgent: Send + Sync {
    /// Deliver one request and wait for its reply.
    async fn send(&self, request: AgentRequest) -> Result<AgentReply, AgentError>;

    async fn execute(&self, request: ExecuteRequest) -> Result<AgentOutcome, AgentError> {
        match self.send(AgentRequest::Execute(request)).await? {
            AgentReply::Complete {
                media_ref,
                media_kind,
            } => Ok(AgentOutcome::Complete {
                media_ref,
                media_kind,
            }),
            AgentReply::Error {
                message,
                error_code,
            } => Ok(AgentOutcome::Error {
                message,
                error_code,
            }),
            other => Err(AgentError::UnexpectedReply(format!("{other:?}"))),
        }
    }

    /// Best-effort cancellation; failures are only logged.
    async fn stop(&self) {
        if let Err(e) = self.send(AgentRequest::Stop).await {
            tracing::debug!(error = %e, "Agent stop signal failed");
        }
    }

    async fn ping(&self) -> Result<String, AgentError> {
        match self.send(AgentRequest::Ping).await? {
            AgentReply::Ok { agent_id } => Ok(agent_id),
            other => Err(AgentError::NotReady(format!("unexpected ping reply {other:?}"))),
        }
    }
}
