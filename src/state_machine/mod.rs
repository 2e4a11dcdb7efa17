mod job;
mod run;
mod state;

pub use job::{FailureKind, Job, JobResult, JobSpec, MediaKind, Platform, RetryConfig};
pub use run::{CooldownRange, ErrorDisposition, RunSettings, RunState};
pub use state::LifecycleState;
