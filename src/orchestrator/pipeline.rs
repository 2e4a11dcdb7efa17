//! Sliding-window scheduling over `concurrency` worker slots.
//!
//! Slots are filled one at a time at start (and after a resume), spaced by
//! the submit stagger. After that a slot that frees up is refilled at once.
//! Every bound job carries its own timeout; a report or timeout only counts
//! while the slot still holds the same submission ticket.

use std::time::Duration;

use tokio::time::Instant;

use super::{JobOutcome, Orchestrator, TimerKind};
use crate::censorship::Verdict;
use crate::error::RewriteError;
use crate::state_machine::FailureKind;

impl Orchestrator {
    /// Fill one free slot now and schedule the next fill.
    pub(super) fn stagger_fill(&mut self) {
        let Some(slot) = self.free_slot() else {
            return;
        };
        if self.submit_to_slot(slot) && self.free_slot().is_some() && !self.pending.is_empty() {
            self.schedule_timer(TimerKind::Stagger, self.options.submit_stagger);
        }
    }

    fn submit_to_slot(&mut self, slot: usize) -> bool {
        if !self.run.state().accepts_submissions() {
            return false;
        }
        let Some(position) = self.pending.pop_front() else {
            return false;
        };
        let settings = self.run.settings();
        let timeout = self
            .options
            .timeouts
            .job_timeout(&settings.platform, settings.media_kind);
        if !self.spawn_job(slot, position, Some(timeout)) {
            self.pending.push_front(position);
            return false;
        }
        self.run.set_cursor(position);
        self.run.mark_generating();
        true
    }

    fn refill(&mut self, slot: usize) {
        if self.slots.get(slot).is_some_and(|s| s.is_free()) {
            self.submit_to_slot(slot);
        }
    }

    /// Hand pending work to any idle slot, unless the initial fill is still
    /// spacing out submissions.
    pub(super) fn refill_any(&mut self) {
        if self
            .timer
            .as_ref()
            .is_some_and(|t| t.kind == TimerKind::Stagger)
        {
            return;
        }
        if let Some(slot) = self.free_slot() {
            self.submit_to_slot(slot);
        }
    }

    fn free_slot(&self) -> Option<usize> {
        self.slots.iter().position(|s| s.is_free())
    }

    pub(super) fn pipeline_finished(&mut self, slot: usize, position: usize, outcome: JobOutcome) {
        match outcome {
            JobOutcome::Delivered { media_ref } => {
                self.run.record_result(position, Ok(Some(media_ref)));
            }
            JobOutcome::Rejected {
                message,
                error_code,
            } => self.pipeline_rejected(position, message, error_code),
            JobOutcome::AgentUnavailable(message) | JobOutcome::DownloadFailed(message) => {
                self.run
                    .record_result(position, Err(FailureKind::Transient(message)));
            }
            JobOutcome::UploadFailed(message) => {
                self.run
                    .record_result(position, Err(FailureKind::Upload(message)));
            }
            JobOutcome::AuthExpired => {
                self.pending.push_front(position);
                self.on_auth_expired();
            }
        }
        self.note_progress();
        self.refill(slot);
        self.check_pipeline_complete();
    }

    fn pipeline_rejected(&mut self, position: usize, message: String, error_code: Option<String>) {
        let Some(job) = self.run.job(position) else {
            return;
        };
        let failure = match self.policy.assess(job, &message, error_code.as_deref()) {
            Verdict::NotCensorship => FailureKind::Transient(message),
            Verdict::Ineligible { indicator, reason } => {
                tracing::info!(indicator = %indicator, reason, position, "Censored job not rewritable");
                FailureKind::Censorship(message)
            }
            Verdict::Rewrite { indicator, source } => {
                tracing::info!(indicator = %indicator, position, "Censorship detected, rewriting prompt");
                if self.spawn_rewrite(position, source, message.clone(), None) {
                    return;
                }
                FailureKind::Censorship(message)
            }
        };
        self.run.record_result(position, Err(failure));
    }

    pub(super) fn pipeline_rewritten(
        &mut self,
        position: usize,
        failure: String,
        result: Result<String, RewriteError>,
    ) {
        match result {
            Ok(revised) => {
                if let Some(job) = self.run.job_mut(position) {
                    job.apply_rewrite(revised);
                    tracing::info!(position, rewrites = job.rewrite_count, "Rewritten job re-queued");
                }
                self.pending.push_back(position);
                self.refill_any();
            }
            Err(e) => {
                tracing::warn!(position, error = %e, "Rewrite failed, keeping the failure");
                self.run
                    .record_result(position, Err(FailureKind::Censorship(failure)));
            }
        }
        self.check_pipeline_complete();
    }

    pub(super) fn on_slot_timeout(&mut self, slot: usize, ticket: u64) {
        let Some(binding) = self.unbind(slot, ticket) else {
            tracing::debug!(slot, ticket, "Timeout for a slot that already moved on");
            return;
        };
        binding.cancel();
        self.stop_agent(slot);
        let waited = binding.bound_at.elapsed().as_secs();
        tracing::warn!(slot, position = binding.position, waited_secs = waited, "Job timed out");
        self.run.record_result(
            binding.position,
            Err(FailureKind::Timeout(format!("no result after {waited}s"))),
        );
        self.note_progress();
        self.refill(slot);
        self.check_pipeline_complete();
    }

    /// Skip the job that has been in flight the longest.
    pub(super) fn pipeline_skip(&mut self) {
        let oldest = self
            .slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.binding.as_ref().map(|b| (i, b.bound_at)))
            .min_by_key(|&(_, bound_at)| bound_at)
            .map(|(i, _)| i);
        let Some(slot) = oldest else {
            tracing::debug!("Skip ignored, nothing in flight");
            return;
        };
        let Some(binding) = self.slots[slot].binding.take() else {
            return;
        };
        binding.cancel();
        self.stop_agent(slot);
        tracing::info!(slot, position = binding.position, "Job skipped");
        self.run
            .record_result(binding.position, Err(FailureKind::Skipped));
        self.note_progress();
        self.refill(slot);
        self.check_pipeline_complete();
    }

    /// Watchdog path: fail every job bound for at least `deadline`.
    pub(super) fn pipeline_force_fail(&mut self, reason: &str, deadline: Duration, now: Instant) {
        let stuck: Vec<usize> = self
            .slots
            .iter()
            .enumerate()
            .filter(|(_, s)| {
                s.binding
                    .as_ref()
                    .is_some_and(|b| now.saturating_duration_since(b.bound_at) >= deadline)
            })
            .map(|(i, _)| i)
            .collect();

        for &slot in &stuck {
            if let Some(binding) = self.slots[slot].binding.take() {
                binding.cancel();
                self.stop_agent(slot);
                self.run.record_result(
                    binding.position,
                    Err(FailureKind::Timeout(reason.to_string())),
                );
            }
        }
        self.note_progress();
        for slot in stuck {
            self.refill(slot);
        }
        self.check_pipeline_complete();
    }

    pub(super) fn pipeline_resume(&mut self) {
        self.note_progress();
        self.stagger_fill();
        self.check_pipeline_complete();
    }

    /// Bump the run's transition marker so the watchdog sees progress.
    fn note_progress(&mut self) {
        if self.run.state().accepts_submissions() {
            self.run.mark_generating();
        }
    }

    fn check_pipeline_complete(&mut self) {
        if !self.run.state().accepts_submissions() {
            return;
        }
        let idle = self.slots.iter().all(|s| s.binding.is_none());
        if idle && self.pending.is_empty() && self.rewrites.is_empty() {
            self.run.complete();
            self.finish_run();
        }
    }
}
