use thiserror::Error;

use crate::state_machine::LifecycleState;

/// Errors surfaced by the control surface. Per-item failures never show up
/// here; they become failed results inside the run.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Queue is empty, nothing to run")]
    EmptyQueue,

    #[error("Invalid run config: {0}")]
    InvalidConfig(String),

    #[error("A run is already in progress ({0})")]
    RunInProgress(LifecycleState),

    #[error("No finished run to retry from")]
    NoFinishedRun,

    #[error("Controller is no longer running")]
    ControllerGone,
}

/// Failures talking to a worker agent (transport, not generation).
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("Agent not ready: {0}")]
    NotReady(String),

    #[error("Unexpected agent reply: {0}")]
    UnexpectedReply(String),

    #[error("Agent returned status {status}: {message}")]
    Status { status: u16, message: String },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Failures of the prompt rewrite service.
#[derive(Debug, Error)]
pub enum RewriteError {
    #[error("No rewrite provider configured")]
    NotConfigured,

    #[error("Provider {provider} failed: {message}")]
    Provider { provider: String, message: String },

    #[error("Provider {0} returned an empty rewrite")]
    EmptyRewrite(String),

    #[error("All rewrite providers failed")]
    AllProvidersFailed,
}

/// Failures of the project backend after a successful generation.
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("Project session expired")]
    AuthExpired,

    #[error("Download failed: {0}")]
    Download(String),

    #[error("Upload failed: {0}")]
    Upload(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_in_progress_names_state() {
        let err = OrchestratorError::RunInProgress(LifecycleState::Generating);
        assert_eq!(err.to_string(), "A run is already in progress (GENERATING)");
    }

    #[test]
    fn provider_error_display() {
        let err = RewriteError::Provider {
            provider: "claude-haiku".into(),
            message: "overloaded".into(),
        };
        assert_eq!(err.to_string(), "Provider claude-haiku failed: overloaded");
    }

    #[test]
    fn errors_are_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<OrchestratorError>();
        assert_send_sync::<AgentError>();
        assert_send_sync::<RewriteError>();
        assert_send_sync::<DeliveryError>();
    }
}
