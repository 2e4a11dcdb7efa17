//! One job at a time: submit, wait for the terminal report, retry in place
//! or cool down, advance.

use super::{Deferred, JobOutcome, Orchestrator, Stage, TimerKind};
use crate::censorship::Verdict;
use crate::error::RewriteError;
use crate::state_machine::{ErrorDisposition, FailureKind, LifecycleState};

impl Orchestrator {
    pub(super) fn submit_current(&mut self) {
        if self.run.state() != LifecycleState::Preparing || !self.slots[0].is_free() {
            return;
        }
        let position = self.run.cursor();
        if self.spawn_job(0, position, None) {
            self.run.mark_generating();
        }
    }

    pub(super) fn sequential_stage(&mut self, stage: Stage) {
        if self.run.state() == LifecycleState::Paused {
            return;
        }
        match stage {
            Stage::Downloading => self.run.mark_downloading(),
            Stage::Uploading => self.run.mark_uploading(),
        }
    }

    pub(super) fn sequential_finished(&mut self, outcome: JobOutcome) {
        if self.run.state() == LifecycleState::Paused {
            self.deferred.push_back(Deferred::Job(outcome));
            return;
        }
        match outcome {
            JobOutcome::Delivered { media_ref } => {
                self.run.mark_success(Some(media_ref));
                self.after_item();
            }
            JobOutcome::Rejected {
                message,
                error_code,
            } => self.sequential_rejected(message, error_code),
            JobOutcome::AgentUnavailable(message) | JobOutcome::DownloadFailed(message) => {
                let disposition = self.run.mark_error(&FailureKind::Transient(message));
                self.after_error(disposition);
            }
            JobOutcome::UploadFailed(message) => {
                self.run.fail_current(&FailureKind::Upload(message));
                self.after_item();
            }
            JobOutcome::AuthExpired => self.on_auth_expired(),
        }
    }

    fn sequential_rejected(&mut self, message: String, error_code: Option<String>) {
        let Some(job) = self.run.current_job() else {
            return;
        };
        match self.policy.assess(job, &message, error_code.as_deref()) {
            Verdict::NotCensorship => {
                let disposition = self.run.mark_error(&FailureKind::Transient(message));
                self.after_error(disposition);
            }
            Verdict::Ineligible { indicator, reason } => {
                tracing::info!(indicator = %indicator, reason, "Censored item not rewritable");
                self.run.fail_current(&FailureKind::Censorship(message));
                self.after_item();
            }
            Verdict::Rewrite { indicator, source } => {
                tracing::info!(indicator = %indicator, index = self.run.resolve_index(), "Censorship detected, rewriting prompt");
                let disposition = self
                    .run
                    .mark_error(&FailureKind::Censorship(message.clone()));
                let position = self.run.cursor();
                if !self.spawn_rewrite(position, source, message, Some(disposition)) {
                    self.after_error(disposition);
                }
            }
        }
    }

    pub(super) fn sequential_rewritten(
        &mut self,
        disposition: ErrorDisposition,
        failure: String,
        result: Result<String, RewriteError>,
    ) {
        if self.run.state() == LifecycleState::Paused {
            self.deferred.push_back(Deferred::Rewrite {
                disposition,
                failure,
                result,
            });
            return;
        }
        match result {
            Ok(revised) => {
                let index = self.run.resolve_index();
                self.run.pop_last_failed(index);
                let position = self.run.cursor();
                if let Some(job) = self.run.job_mut(position) {
                    job.apply_rewrite(revised);
                    tracing::info!(index, rewrites = job.rewrite_count, "Retrying with rewritten prompt");
                }
                self.run.grant_one_shot_retry();
                self.run.restart_current();
                self.submit_current();
            }
            Err(e) => {
                tracing::warn!(error = %e, failure = %failure, "Rewrite failed, keeping the failure");
                self.after_error(disposition);
            }
        }
    }

    fn after_error(&mut self, disposition: ErrorDisposition) {
        match disposition {
            ErrorDisposition::Retry { attempt, delay }
                if self.run.state() == LifecycleState::Error =>
            {
                tracing::info!(attempt, delay_ms = delay.as_millis() as u64, "Retrying item after backoff");
                self.schedule_timer(TimerKind::Backoff, delay);
            }
            ErrorDisposition::GaveUp if self.run.state() == LifecycleState::Cooldown => {
                self.after_item();
            }
            _ => self.sequential_proceed(),
        }
    }

    /// The current item has its terminal result; cool down unless it was
    /// the last one.
    fn after_item(&mut self) {
        if self.run.cursor() + 1 >= self.run.queue().len() {
            self.sequential_proceed();
            return;
        }
        let pause = self.run.settings().cooldown.sample();
        tracing::debug!(cooldown_ms = pause.as_millis() as u64, "Cooling down");
        self.schedule_timer(TimerKind::Cooldown, pause);
    }

    /// Move on from wherever the run stands: next item if the current one
    /// is resolved, another attempt otherwise.
    pub(super) fn sequential_proceed(&mut self) {
        if self.run.has_result_for(self.run.resolve_index()) {
            self.run.advance();
        } else if self.run.state() == LifecycleState::Error {
            self.run.retry_current();
        }
        match self.run.state() {
            LifecycleState::Preparing => self.submit_current(),
            LifecycleState::Completed => self.finish_run(),
            _ => {}
        }
    }

    pub(super) fn sequential_resume(&mut self) {
        if self.slots[0].binding.is_some() {
            // still waiting on the agent; let the watchdog see it again
            self.run.mark_generating();
            return;
        }
        if !self.rewrites.is_empty() {
            return;
        }
        match self.deferred.pop_front() {
            Some(Deferred::Job(outcome)) => self.sequential_finished(outcome),
            Some(Deferred::Rewrite {
                disposition,
                failure,
                result,
            }) => self.sequential_rewritten(disposition, failure, result),
            None => self.sequential_proceed(),
        }
    }

    pub(super) fn sequential_skip(&mut self) {
        let state = self.run.state();
        if !matches!(
            state,
            LifecycleState::Preparing
                | LifecycleState::Generating
                | LifecycleState::Downloading
                | LifecycleState::Uploading
                | LifecycleState::Error
        ) {
            tracing::debug!(state = %state, "Skip ignored");
            return;
        }
        if let Some(binding) = self.slots[0].binding.take() {
            binding.cancel();
            self.stop_agent(0);
        }
        for (_, rewrite) in self.rewrites.drain() {
            rewrite.task.abort();
        }
        self.cancel_timer();
        tracing::info!(index = self.run.resolve_index(), "Item skipped");
        self.run.skip_current();
        self.after_item();
    }

    pub(super) fn sequential_force_fail(&mut self, reason: &str) {
        if let Some(binding) = self.slots[0].binding.take() {
            binding.cancel();
            self.stop_agent(0);
        }
        self.run.force_fail_current(reason);
        self.after_item();
    }
}
