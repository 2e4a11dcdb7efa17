//! The single-writer state machine for one automation run.
//!
//! [`RunState`] owns the queue, cursor, retry counter and accumulated
//! results. Only the controller mutates it; runners, the watchdog and the
//! censorship policy go through the operations defined here.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use uuid::Uuid;

use super::job::{FailureKind, Job, JobResult, MediaKind, Platform, RetryConfig};
use super::state::LifecycleState;
use crate::error::OrchestratorError;

/// Random pause between items, sampled uniformly from `[min, max]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CooldownRange {
    pub min: Duration,
    pub max: Duration,
}

impl CooldownRange {
    pub fn new(min: Duration, max: Duration) -> Self {
        Self { min, max }
    }

    pub fn sample(&self) -> Duration {
        if self.max <= self.min {
            return self.min;
        }
        let ms = rand::thread_rng().gen_range(self.min.as_millis()..=self.max.as_millis());
        Duration::from_millis(ms as u64)
    }
}

impl Default for CooldownRange {
    fn default() -> Self {
        Self::new(Duration::from_secs(5), Duration::from_secs(10))
    }
}

/// Per-run parameters carried over unchanged into retry sub-runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSettings {
    pub concurrency: usize,
    pub media_kind: MediaKind,
    pub platform: Platform,
    pub cooldown: CooldownRange,
    pub retry: RetryConfig,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            concurrency: 1,
            media_kind: MediaKind::default(),
            platform: Platform::default(),
            cooldown: CooldownRange::default(),
            retry: RetryConfig::default(),
        }
    }
}

/// What `mark_error` decided for the current item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorDisposition {
    /// Run is in `Error`; loop back to `Preparing` after `delay`.
    Retry { attempt: u32, delay: Duration },
    /// A failed result was recorded and the run is in `Cooldown`.
    GaveUp,
}

#[derive(Debug)]
pub struct RunState {
    run_id: Uuid,
    state: LifecycleState,
    queue: Vec<Job>,
    cursor: usize,
    retry_count: u32,
    results: Vec<JobResult>,
    use_original_index_for_naming: bool,
    settings: RunSettings,
    state_entered_at: Instant,
    transitions: u64,
}

impl Default for RunState {
    fn default() -> Self {
        Self::new()
    }
}

impl RunState {
    pub fn new() -> Self {
        Self {
            run_id: Uuid::new_v4(),
            state: LifecycleState::Idle,
            queue: Vec::new(),
            cursor: 0,
            retry_count: 0,
            results: Vec::new(),
            use_original_index_for_naming: false,
            settings: RunSettings::default(),
            state_entered_at: Instant::now(),
            transitions: 0,
        }
    }

    /// Reset every run field for a new queue. An empty queue is accepted
    /// here; `start()` turns it into an immediate `Completed`.
    pub fn init(&mut self, queue: Vec<Job>, settings: RunSettings) -> Result<(), OrchestratorError> {
        if settings.concurrency == 0 {
            return Err(OrchestratorError::InvalidConfig(
                "concurrency must be at least 1".into(),
            ));
        }
        if settings.cooldown.min > settings.cooldown.max {
            return Err(OrchestratorError::InvalidConfig(format!(
                "cooldown min {:?} exceeds max {:?}",
                settings.cooldown.min, settings.cooldown.max
            )));
        }

        self.run_id = Uuid::new_v4();
        self.queue = queue;
        self.cursor = 0;
        self.retry_count = 0;
        self.results = Vec::new();
        self.use_original_index_for_naming = false;
        self.settings = settings;
        self.transition(LifecycleState::Idle);
        tracing::info!(run_id = %self.run_id, items = self.queue.len(), "Run initialized");
        Ok(())
    }

    /// Name files and key results by `original_index` instead of position.
    pub fn set_use_original_index(&mut self, enabled: bool) {
        self.use_original_index_for_naming = enabled;
    }

    /// Seed results carried over from an earlier run (retry sub-runs).
    pub fn seed_results(&mut self, results: Vec<JobResult>) {
        self.results = results;
    }

    pub fn start(&mut self) {
        if self.queue.is_empty() {
            self.transition(LifecycleState::Completed);
            return;
        }
        self.cursor = 0;
        self.retry_count = 0;
        self.transition(LifecycleState::Preparing);
    }

    pub fn mark_generating(&mut self) {
        self.transition(LifecycleState::Generating);
    }

    pub fn mark_downloading(&mut self) {
        self.transition(LifecycleState::Downloading);
    }

    pub fn mark_uploading(&mut self) {
        self.transition(LifecycleState::Uploading);
    }

    pub fn mark_success(&mut self, media_ref: Option<String>) {
        let index = self.resolve_index();
        let segment_key = self.current_job().and_then(|j| j.segment_key.clone());
        self.push_result(JobResult::success(index, segment_key, media_ref));
        self.retry_count = 0;
        self.transition(LifecycleState::Cooldown);
    }

    pub fn mark_error(&mut self, kind: &FailureKind) -> ErrorDisposition {
        self.retry_count += 1;
        if self.retry_count >= self.settings.retry.max_retries {
            tracing::warn!(
                index = self.resolve_index(),
                attempts = self.retry_count,
                error = %kind,
                "Giving up on item"
            );
            self.push_current_failure(kind);
            self.transition(LifecycleState::Cooldown);
            ErrorDisposition::GaveUp
        } else {
            let delay = Duration::from_millis(self.settings.retry.delay_for_attempt(self.retry_count));
            self.transition(LifecycleState::Error);
            ErrorDisposition::Retry {
                attempt: self.retry_count,
                delay,
            }
        }
    }

    /// `Error` → `Preparing` once the backoff has elapsed.
    pub fn retry_current(&mut self) -> bool {
        if self.state != LifecycleState::Error {
            return false;
        }
        self.transition(LifecycleState::Preparing);
        true
    }

    pub fn skip_current(&mut self) {
        self.fail_current(&FailureKind::Skipped);
    }

    /// Watchdog path: record a timeout for the current item and move on.
    pub fn force_fail_current(&mut self, reason: &str) {
        self.fail_current(&FailureKind::Timeout(reason.to_string()));
    }

    /// Record a terminal failure for the current item without the retry
    /// loop, e.g. an upload that failed after a good generation.
    pub fn fail_current(&mut self, kind: &FailureKind) {
        self.push_current_failure(kind);
        self.retry_count = 0;
        self.transition(LifecycleState::Cooldown);
    }

    /// Send the current item back to `Preparing` after a prompt rewrite.
    pub fn restart_current(&mut self) {
        self.transition(LifecycleState::Preparing);
    }

    pub fn advance(&mut self) {
        self.cursor += 1;
        if self.cursor >= self.queue.len() {
            self.transition(LifecycleState::Completed);
        } else {
            self.retry_count = 0;
            self.transition(LifecycleState::Preparing);
        }
    }

    pub fn pause(&mut self) -> bool {
        if !self.state.is_active() {
            return false;
        }
        self.transition(LifecycleState::Paused);
        true
    }

    pub fn resume(&mut self) -> bool {
        if self.state != LifecycleState::Paused {
            return false;
        }
        self.transition(LifecycleState::Preparing);
        true
    }

    /// Pipeline completion once every slot and queue drained.
    pub fn complete(&mut self) {
        self.transition(LifecycleState::Completed);
    }

    /// Discard the run entirely (Stop).
    pub fn reset(&mut self) {
        self.queue.clear();
        self.results.clear();
        self.cursor = 0;
        self.retry_count = 0;
        self.use_original_index_for_naming = false;
        self.transition(LifecycleState::Idle);
    }

    pub fn resolve_index(&self) -> usize {
        self.resolve_index_for(self.cursor)
    }

    pub fn resolve_index_for(&self, position: usize) -> usize {
        match self.queue.get(position) {
            Some(job) if self.use_original_index_for_naming => job.original_index,
            _ => position,
        }
    }

    /// Record an outcome for an arbitrary queue position (pipeline mode).
    pub fn record_result(
        &mut self,
        position: usize,
        outcome: Result<Option<String>, FailureKind>,
    ) -> bool {
        let index = self.resolve_index_for(position);
        let segment_key = self.queue.get(position).and_then(|j| j.segment_key.clone());
        let result = match outcome {
            Ok(media_ref) => JobResult::success(index, segment_key, media_ref),
            Err(kind) => JobResult::failure(index, &kind, segment_key),
        };
        self.push_result(result)
    }

    /// Remove the failure just recorded for `index` so a rewritten prompt
    /// can take its place. The only sanctioned removal from `results`.
    pub fn pop_last_failed(&mut self, index: usize) -> Option<JobResult> {
        match self.results.last() {
            Some(last) if last.index == index && !last.success => self.results.pop(),
            _ => None,
        }
    }

    /// Leave exactly one more attempt before the item is given up.
    pub fn grant_one_shot_retry(&mut self) {
        self.retry_count = self.settings.retry.max_retries.saturating_sub(1);
    }

    /// Move the cursor onto a pipeline position for snapshots.
    pub fn set_cursor(&mut self, position: usize) {
        self.cursor = position;
    }

    fn push_current_failure(&mut self, kind: &FailureKind) {
        let index = self.resolve_index();
        let segment_key = self.current_job().and_then(|j| j.segment_key.clone());
        self.push_result(JobResult::failure(index, kind, segment_key));
    }

    fn push_result(&mut self, result: JobResult) -> bool {
        if self.results.iter().any(|r| r.index == result.index) {
            tracing::warn!(index = result.index, "Result already recorded, dropping duplicate");
            return false;
        }
        tracing::info!(
            index = result.index,
            success = result.success,
            error = result.error.as_deref().unwrap_or(""),
            "Result recorded"
        );
        self.results.push(result);
        true
    }

    fn transition(&mut self, to: LifecycleState) {
        tracing::debug!(from = %self.state, to = %to, cursor = self.cursor, "State transition");
        self.state = to;
        self.state_entered_at = Instant::now();
        self.transitions += 1;
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn queue(&self) -> &[Job] {
        &self.queue
    }

    pub fn job(&self, position: usize) -> Option<&Job> {
        self.queue.get(position)
    }

    pub fn job_mut(&mut self, position: usize) -> Option<&mut Job> {
        self.queue.get_mut(position)
    }

    pub fn current_job(&self) -> Option<&Job> {
        self.queue.get(self.cursor)
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn results(&self) -> &[JobResult] {
        &self.results
    }

    pub fn settings(&self) -> &RunSettings {
        &self.settings
    }

    pub fn uses_original_index(&self) -> bool {
        self.use_original_index_for_naming
    }

    pub fn state_entered_at(&self) -> Instant {
        self.state_entered_at
    }

    /// Monotonic count of transitions; the watchdog keys on it.
    pub fn transitions(&self) -> u64 {
        self.transitions
    }

    pub fn has_result_for(&self, index: usize) -> bool {
        self.results.iter().any(|r| r.index == index)
    }

    pub fn completed_count(&self) -> usize {
        self.results.iter().filter(|r| r.success).count()
    }

    pub fn failed_count(&self) -> usize {
        self.results.iter().filter(|r| !r.success).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state_machine::job::JobSpec;

    fn jobs(prompts: &[&str]) -> Vec<Job> {
        prompts
            .iter()
            .enumerate()
            .map(|(i, p)| Job::from_spec(i, JobSpec::new(*p)))
            .collect()
    }

    fn settings(max_retries: u32) -> RunSettings {
        RunSettings {
            retry: RetryConfig {
                max_retries,
                base_delay_ms: 100,
            },
            ..Default::default()
        }
    }

    fn started(prompts: &[&str], max_retries: u32) -> RunState {
        let mut run = RunState::new();
        run.init(jobs(prompts), settings(max_retries)).unwrap();
        run.start();
        run
    }

    #[test]
    fn empty_queue_completes_on_start() {
        let mut run = RunState::new();
        run.init(Vec::new(), settings(3)).unwrap();
        assert_eq!(run.state(), LifecycleState::Idle);
        run.start();
        assert_eq!(run.state(), LifecycleState::Completed);
        assert!(run.results().is_empty());
    }

    #[test]
    fn init_rejects_zero_concurrency() {
        let mut run = RunState::new();
        let bad = RunSettings {
            concurrency: 0,
            ..Default::default()
        };
        assert!(matches!(
            run.init(jobs(&["a"]), bad),
            Err(OrchestratorError::InvalidConfig(_))
        ));
    }

    #[test]
    fn init_rejects_inverted_cooldown() {
        let mut run = RunState::new();
        let bad = RunSettings {
            cooldown: CooldownRange::new(Duration::from_secs(9), Duration::from_secs(1)),
            ..Default::default()
        };
        assert!(run.init(jobs(&["a"]), bad).is_err());
    }

    #[test]
    fn happy_path_walks_all_items() {
        let mut run = started(&["a", "b", "c"], 3);
        for _ in 0..3 {
            assert_eq!(run.state(), LifecycleState::Preparing);
            run.mark_generating();
            run.mark_downloading();
            run.mark_success(Some("file.png".into()));
            assert_eq!(run.state(), LifecycleState::Cooldown);
            run.advance();
        }
        assert_eq!(run.state(), LifecycleState::Completed);
        let indices: Vec<usize> = run.results().iter().map(|r| r.index).collect();
        assert_eq!(indices, vec![0, 1, 2]);
        assert_eq!(run.completed_count(), 3);
        assert_eq!(run.failed_count(), 0);
    }

    #[test]
    fn error_retries_then_gives_up() {
        let mut run = started(&["a", "b"], 2);
        run.mark_generating();

        let d = run.mark_error(&FailureKind::Transient("flaky".into()));
        assert_eq!(
            d,
            ErrorDisposition::Retry {
                attempt: 1,
                delay: Duration::from_millis(100)
            }
        );
        assert_eq!(run.state(), LifecycleState::Error);
        assert!(run.results().is_empty());
        assert!(run.retry_current());
        assert_eq!(run.state(), LifecycleState::Preparing);

        run.mark_generating();
        let d = run.mark_error(&FailureKind::Transient("flaky again".into()));
        assert_eq!(d, ErrorDisposition::GaveUp);
        assert_eq!(run.state(), LifecycleState::Cooldown);
        assert_eq!(run.results().len(), 1);
        assert!(!run.results()[0].success);
        assert_eq!(run.results()[0].error.as_deref(), Some("flaky again"));

        run.advance();
        assert_eq!(run.retry_count(), 0);
        assert_eq!(run.cursor(), 1);
    }

    #[test]
    fn success_resets_retry_count() {
        let mut run = started(&["a"], 3);
        run.mark_error(&FailureKind::Transient("x".into()));
        run.retry_current();
        run.mark_success(None);
        assert_eq!(run.retry_count(), 0);
    }

    #[test]
    fn skip_records_skipped_failure() {
        let mut run = started(&["a", "b"], 3);
        run.mark_generating();
        run.skip_current();
        assert_eq!(run.state(), LifecycleState::Cooldown);
        assert_eq!(run.results()[0].error.as_deref(), Some("Skipped"));
    }

    #[test]
    fn upload_failure_is_terminal_without_retries() {
        let mut run = started(&["a", "b"], 3);
        run.mark_uploading();
        run.fail_current(&FailureKind::Upload("segment gone".into()));
        assert_eq!(run.state(), LifecycleState::Cooldown);
        assert_eq!(run.results()[0].error.as_deref(), Some("Upload failed: segment gone"));
        assert_eq!(run.retry_count(), 0);
    }

    #[test]
    fn rewrite_restart_reenters_preparing_on_same_item() {
        let mut run = started(&["a", "b"], 1);
        run.mark_generating();
        assert_eq!(
            run.mark_error(&FailureKind::Censorship("policy".into())),
            ErrorDisposition::GaveUp
        );
        assert!(run.pop_last_failed(0).is_some());
        run.grant_one_shot_retry();
        run.restart_current();
        assert_eq!(run.state(), LifecycleState::Preparing);
        assert_eq!(run.cursor(), 0);
        assert!(!run.has_result_for(0));
    }

    #[test]
    fn pause_only_from_active_and_resume_into_preparing() {
        let mut run = RunState::new();
        run.init(jobs(&["a"]), settings(3)).unwrap();
        assert!(!run.pause());

        run.start();
        run.mark_generating();
        assert!(run.pause());
        assert_eq!(run.state(), LifecycleState::Paused);
        assert!(!run.pause());
        assert!(run.resume());
        assert_eq!(run.state(), LifecycleState::Preparing);
        assert!(!run.resume());
    }

    #[test]
    fn resolve_index_uses_original_index_when_enabled() {
        let mut queue = jobs(&["x", "y"]);
        queue[0].original_index = 7;
        queue[1].original_index = 2;
        let mut run = RunState::new();
        run.init(queue, settings(3)).unwrap();
        run.start();
        assert_eq!(run.resolve_index(), 0);
        run.set_use_original_index(true);
        assert_eq!(run.resolve_index(), 7);
        assert_eq!(run.resolve_index_for(1), 2);
    }

    #[test]
    fn duplicate_results_are_dropped() {
        let mut run = started(&["a", "b"], 3);
        assert!(run.record_result(1, Ok(None)));
        assert!(!run.record_result(1, Err(FailureKind::Transient("late".into()))));
        assert_eq!(run.results().len(), 1);
        assert!(run.results()[0].success);
    }

    #[test]
    fn pop_last_failed_only_removes_matching_failure() {
        let mut run = started(&["a", "b"], 1);
        run.mark_error(&FailureKind::Censorship("policy".into()));
        assert!(run.pop_last_failed(1).is_none());
        let popped = run.pop_last_failed(0).unwrap();
        assert!(!popped.success);
        assert!(run.results().is_empty());

        run.record_result(0, Ok(None));
        assert!(run.pop_last_failed(0).is_none());
    }

    #[test]
    fn one_shot_retry_leaves_a_single_attempt() {
        let mut run = started(&["a"], 3);
        run.grant_one_shot_retry();
        assert_eq!(
            run.mark_error(&FailureKind::Transient("x".into())),
            ErrorDisposition::GaveUp
        );
    }

    #[test]
    fn every_transition_moves_the_marker() {
        let mut run = started(&["a"], 3);
        let before = run.transitions();
        run.mark_generating();
        run.mark_generating();
        assert_eq!(run.transitions(), before + 2);
    }

    #[test]
    fn reset_discards_run() {
        let mut run = started(&["a", "b"], 3);
        run.mark_success(None);
        run.reset();
        assert_eq!(run.state(), LifecycleState::Idle);
        assert!(run.queue().is_empty());
        assert!(run.results().is_empty());
    }

    #[test]
    fn cooldown_sample_stays_in_range() {
        let range = CooldownRange::new(Duration::from_millis(10), Duration::from_millis(20));
        for _ in 0..50 {
            let d = range.sample();
            assert!(d >= Duration::from_millis(10) && d <= Duration::from_millis(20));
        }
        let fixed = CooldownRange::new(Duration::from_millis(5), Duration::from_millis(5));
        assert_eq!(fixed.sample(), Duration::from_millis(5));
    }
}
