//! promptline: bulk prompt orchestration for AI image and video workers.
//!
//! A run takes a queue of prompts through one or more worker agents,
//! tracking it in a single-writer state machine ([`state_machine::RunState`])
//! owned by the [`orchestrator::Orchestrator`] controller.

pub mod agent;
pub mod anthropic;
pub mod censorship;
pub mod cli;
pub mod config;
pub mod delivery;
pub mod error;
pub mod orchestrator;
pub mod queue;
pub mod state_machine;
pub mod ui;
pub mod watchdog;
