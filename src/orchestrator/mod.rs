//! The controller that owns a run.
//!
//! One [`Orchestrator`] task owns the [`RunState`] and the worker slots.
//! Control commands from an [`OrchestratorHandle`] and every completion,
//! timeout, timer and watchdog tick arrive on the same channel and are
//! handled one at a time by [`Orchestrator::dispatch`], so the run only ever
//! has a single writer.
//!
//! With `concurrency == 1` the run is driven by the sequential runner
//! (`sequential.rs`); above that by the sliding-window pipeline
//! (`pipeline.rs`). Both share the job task in `worker.rs`.

mod pipeline;
mod retry;
mod sequential;
mod worker;

pub use retry::{RetryPlan, RetrySelector};
pub use worker::{JobOutcome, Stage};

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::agent::{ExecuteRequest, WorkerAgent};
use crate::censorship::CensorshipRecoveryPolicy;
use crate::config::TimeoutConfig;
use crate::delivery::{DeliveryItem, NoopBackend, ProjectBackend};
use crate::error::{OrchestratorError, RewriteError};
use crate::state_machine::{
    ErrorDisposition, Job, JobResult, JobSpec, LifecycleState, RunSettings, RunState,
};
use crate::watchdog::{self, WatchdogConfig, WatchdogSupervisor, WatchdogVerdict};
use worker::JobTask;

const INPUT_BUFFER: usize = 256;
const SUMMARY_CHARS: usize = 60;

/// Controller knobs that are not part of a run's own settings.
#[derive(Debug, Clone)]
pub struct OrchestratorOptions {
    /// Gap between submissions while the slots are first filled.
    pub submit_stagger: Duration,
    pub timeouts: TimeoutConfig,
    pub watchdog: WatchdogConfig,
    /// Passed through to every EXECUTE.
    pub agent_settings: serde_json::Value,
}

impl Default for OrchestratorOptions {
    fn default() -> Self {
        Self {
            submit_stagger: Duration::from_secs(2),
            timeouts: TimeoutConfig::default(),
            watchdog: WatchdogConfig::default(),
            agent_settings: serde_json::Value::Null,
        }
    }
}

/// Everything a UI may observe about a run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSnapshot {
    pub run_id: Uuid,
    pub lifecycle_state: LifecycleState,
    pub cursor: usize,
    /// Length of the current queue; a retry run only counts retried items.
    pub total_count: usize,
    pub current_job_summary: Option<String>,
    pub completed_count: usize,
    pub failed_count: usize,
    pub results: Vec<JobResult>,
    /// Resolved indices of jobs bound to a worker slot right now.
    pub in_flight: Vec<usize>,
    pub auth_expired: bool,
    /// A retry sub-run: indices are those of the first queue.
    pub is_retry: bool,
}

impl RunSnapshot {
    fn of(run: &RunState, slots: &[WorkerSlot], auth_expired: bool) -> Self {
        Self {
            run_id: run.run_id(),
            lifecycle_state: run.state(),
            cursor: run.cursor(),
            total_count: run.queue().len(),
            current_job_summary: run.current_job().map(|j| j.summary(SUMMARY_CHARS)),
            completed_count: run.completed_count(),
            failed_count: run.failed_count(),
            results: run.results().to_vec(),
            in_flight: slots
                .iter()
                .filter_map(|s| s.binding.as_ref())
                .map(|b| run.resolve_index_for(b.position))
                .collect(),
            auth_expired,
            is_retry: run.uses_original_index(),
        }
    }
}

/// Control surface requests.
#[derive(Debug)]
pub(crate) enum Command {
    Start {
        queue: Vec<JobSpec>,
        settings: RunSettings,
        reply: oneshot::Sender<Result<usize, OrchestratorError>>,
    },
    Pause,
    Resume,
    Stop,
    SkipCurrent,
    RetryFailed {
        reply: oneshot::Sender<Result<usize, OrchestratorError>>,
    },
    RetrySelected {
        indices: Vec<usize>,
        reply: oneshot::Sender<Result<usize, OrchestratorError>>,
    },
    GetState {
        reply: oneshot::Sender<RunSnapshot>,
    },
    /// The project backend reported an expired session.
    AuthExpired,
    /// The worker behind `slot` went away (e.g. its tab was closed).
    WorkerLost { slot: usize },
}

/// Reports from tasks the controller spawned. `ticket` identifies the
/// submission, timer or rewrite that produced it; stale tickets are dropped.
#[derive(Debug)]
pub(crate) enum Event {
    AgentReady {
        slot: usize,
        ticket: u64,
        agent_id: String,
    },
    JobStage {
        slot: usize,
        ticket: u64,
        stage: Stage,
    },
    JobFinished {
        slot: usize,
        ticket: u64,
        outcome: JobOutcome,
    },
    SlotTimeout {
        slot: usize,
        ticket: u64,
    },
    TimerElapsed {
        ticket: u64,
    },
    RewriteFinished {
        ticket: u64,
        result: Result<String, RewriteError>,
    },
    WatchdogTick,
}

#[derive(Debug)]
pub(crate) enum Input {
    Command(Command),
    Event(Event),
}

/// A job bound to a worker slot.
struct Binding {
    position: usize,
    ticket: u64,
    bound_at: Instant,
    task: AbortHandle,
    timeout: Option<AbortHandle>,
}

impl Binding {
    fn cancel(&self) {
        self.task.abort();
        if let Some(timeout) = &self.timeout {
            timeout.abort();
        }
    }
}

struct WorkerSlot {
    agent: Arc<dyn WorkerAgent>,
    binding: Option<Binding>,
    /// Answered a PING during this run.
    ready: bool,
    lost: bool,
}

impl WorkerSlot {
    fn new(agent: Arc<dyn WorkerAgent>) -> Self {
        Self {
            agent,
            binding: None,
            ready: false,
            lost: false,
        }
    }

    fn is_free(&self) -> bool {
        self.binding.is_none() && !self.lost
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimerKind {
    Cooldown,
    Backoff,
    Stagger,
}

struct Timer {
    ticket: u64,
    kind: TimerKind,
    task: AbortHandle,
}

struct PendingRewrite {
    position: usize,
    /// The censorship message that triggered the rewrite.
    failure: String,
    /// Sequential mode: what `mark_error` decided before the rewrite.
    disposition: Option<ErrorDisposition>,
    task: AbortHandle,
}

/// Sequential-mode reports that arrived while the run was paused.
enum Deferred {
    Job(JobOutcome),
    Rewrite {
        disposition: ErrorDisposition,
        failure: String,
        result: Result<String, RewriteError>,
    },
}

pub struct Orchestrator {
    run: RunState,
    options: OrchestratorOptions,
    agents: Vec<Arc<dyn WorkerAgent>>,
    policy: CensorshipRecoveryPolicy,
    backend: Arc<dyn ProjectBackend>,
    watchdog: WatchdogSupervisor,
    slots: Vec<WorkerSlot>,
    /// Pipeline mode: queue positions waiting for a slot.
    pending: VecDeque<usize>,
    rewrites: HashMap<u64, PendingRewrite>,
    timer: Option<Timer>,
    deferred: VecDeque<Deferred>,
    /// First queue of the current run family; retries clone from it.
    original_queue: Vec<Job>,
    auth_expired: bool,
    next_ticket: u64,
    events: Option<mpsc::WeakSender<Input>>,
    snapshots: watch::Sender<RunSnapshot>,
    watchdog_cancel: Option<CancellationToken>,
}

impl Orchestrator {
    /// Worker slot `i` is served by `agents[i % agents.len()]`.
    pub fn new(agents: Vec<Arc<dyn WorkerAgent>>, options: OrchestratorOptions) -> Self {
        let run = RunState::new();
        let (snapshots, _) = watch::channel(RunSnapshot::of(&run, &[], false));
        Self {
            run,
            watchdog: WatchdogSupervisor::new(options.watchdog.clone()),
            options,
            agents,
            policy: CensorshipRecoveryPolicy::disabled(),
            backend: Arc::new(NoopBackend),
            slots: Vec::new(),
            pending: VecDeque::new(),
            rewrites: HashMap::new(),
            timer: None,
            deferred: VecDeque::new(),
            original_queue: Vec::new(),
            auth_expired: false,
            next_ticket: 1,
            events: None,
            snapshots,
            watchdog_cancel: None,
        }
    }

    pub fn with_policy(mut self, policy: CensorshipRecoveryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_backend(mut self, backend: Arc<dyn ProjectBackend>) -> Self {
        self.backend = backend;
        self
    }

    /// Start the controller task. It runs until every handle is dropped and
    /// no spawned work is left.
    pub fn spawn(mut self) -> Result<OrchestratorHandle, OrchestratorError> {
        if self.agents.is_empty() {
            return Err(OrchestratorError::InvalidConfig(
                "at least one worker agent is required".into(),
            ));
        }
        let (tx, rx) = mpsc::channel(INPUT_BUFFER);
        self.events = Some(tx.downgrade());
        let snapshots = self.snapshots.subscribe();
        tokio::spawn(self.run_loop(rx));
        Ok(OrchestratorHandle {
            inputs: tx,
            snapshots,
        })
    }

    async fn run_loop(mut self, mut inputs: mpsc::Receiver<Input>) {
        while let Some(input) = inputs.recv().await {
            self.dispatch(input);
            self.publish();
        }
        self.stop_watchdog();
        tracing::debug!("Controller stopped");
    }

    fn dispatch(&mut self, input: Input) {
        match input {
            Input::Command(command) => self.handle_command(command),
            Input::Event(event) => self.handle_event(event),
        }
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Start {
                queue,
                settings,
                reply,
            } => {
                let result = self.start(queue, settings);
                self.publish();
                let _ = reply.send(result);
            }
            Command::Pause => self.pause(),
            Command::Resume => self.resume(),
            Command::Stop => self.stop(),
            Command::SkipCurrent => {
                if self.is_pipelined() {
                    self.pipeline_skip();
                } else {
                    self.sequential_skip();
                }
            }
            Command::RetryFailed { reply } => {
                let result = self.retry(None);
                self.publish();
                let _ = reply.send(result);
            }
            Command::RetrySelected { indices, reply } => {
                let result = self.retry(Some(&indices));
                self.publish();
                let _ = reply.send(result);
            }
            Command::GetState { reply } => {
                let _ = reply.send(self.snapshot());
            }
            Command::AuthExpired => self.on_auth_expired(),
            Command::WorkerLost { slot } => self.on_worker_lost(slot),
        }
    }

    fn handle_event(&mut self, event: Event) {
        match event {
            Event::AgentReady {
                slot,
                ticket,
                agent_id,
            } => {
                if self.is_bound(slot, ticket) {
                    tracing::debug!(slot, agent_id = %agent_id, "Agent ready");
                    self.slots[slot].ready = true;
                }
            }
            Event::JobStage {
                slot,
                ticket,
                stage,
            } => {
                if self.is_bound(slot, ticket) && !self.is_pipelined() {
                    self.sequential_stage(stage);
                }
            }
            Event::JobFinished {
                slot,
                ticket,
                outcome,
            } => {
                let Some(binding) = self.unbind(slot, ticket) else {
                    tracing::debug!(slot, ticket, "Dropping report from a stale submission");
                    return;
                };
                if self.is_pipelined() {
                    self.pipeline_finished(slot, binding.position, outcome);
                } else {
                    self.sequential_finished(outcome);
                }
            }
            Event::SlotTimeout { slot, ticket } => self.on_slot_timeout(slot, ticket),
            Event::TimerElapsed { ticket } => match self.timer.take() {
                Some(timer) if timer.ticket == ticket => self.on_timer(timer.kind),
                other => self.timer = other,
            },
            Event::RewriteFinished { ticket, result } => {
                let Some(rewrite) = self.rewrites.remove(&ticket) else {
                    return;
                };
                if self.is_pipelined() {
                    self.pipeline_rewritten(rewrite.position, rewrite.failure, result);
                } else {
                    let disposition = rewrite.disposition.unwrap_or(ErrorDisposition::GaveUp);
                    self.sequential_rewritten(disposition, rewrite.failure, result);
                }
            }
            Event::WatchdogTick => self.on_watchdog_tick(),
        }
    }

    fn start(
        &mut self,
        specs: Vec<JobSpec>,
        settings: RunSettings,
    ) -> Result<usize, OrchestratorError> {
        let state = self.run.state();
        if !state.is_finished() {
            return Err(OrchestratorError::RunInProgress(state));
        }
        if specs.is_empty() {
            return Err(OrchestratorError::EmptyQueue);
        }
        let queue: Vec<Job> = specs
            .into_iter()
            .enumerate()
            .map(|(position, spec)| Job::from_spec(position, spec))
            .collect();
        self.run.init(queue.clone(), settings)?;
        self.original_queue = queue;
        let count = self.run.queue().len();
        self.begin_run();
        Ok(count)
    }

    fn retry(&mut self, selection: Option<&[usize]>) -> Result<usize, OrchestratorError> {
        if self.run.state() != LifecycleState::Completed {
            return Err(OrchestratorError::NoFinishedRun);
        }
        let selector = RetrySelector::new(&self.original_queue, self.run.results());
        let plan = match selection {
            Some(indices) => selector.selected(indices),
            None => selector.failed(),
        };
        if plan.is_empty() {
            tracing::info!("Nothing to retry");
            return Ok(0);
        }

        let count = plan.len();
        let settings = self.run.settings().clone();
        self.run.init(plan.queue, settings)?;
        self.run.set_use_original_index(true);
        self.run.seed_results(plan.kept);
        tracing::info!(count, "Retry run prepared");
        self.begin_run();
        Ok(count)
    }

    fn begin_run(&mut self) {
        let concurrency = self.run.settings().concurrency;
        self.slots = (0..concurrency)
            .map(|i| WorkerSlot::new(self.agents[i % self.agents.len()].clone()))
            .collect();
        self.pending.clear();
        self.rewrites.clear();
        self.deferred.clear();
        self.cancel_timer();
        self.auth_expired = false;

        self.run.start();
        self.watchdog.reset(Instant::now());
        tracing::info!(
            run_id = %self.run.run_id(),
            items = self.run.queue().len(),
            concurrency,
            "Run started"
        );

        if self.run.state() == LifecycleState::Completed {
            self.finish_run();
            return;
        }
        self.start_watchdog();
        if self.is_pipelined() {
            self.pending = (0..self.run.queue().len()).collect();
            self.stagger_fill();
        } else {
            self.submit_current();
        }
    }

    fn pause(&mut self) {
        if !self.run.pause() {
            tracing::debug!(state = %self.run.state(), "Pause ignored");
            return;
        }
        self.cancel_timer();
        tracing::info!(cursor = self.run.cursor(), "Run paused");
    }

    fn resume(&mut self) {
        if !self.run.resume() {
            tracing::debug!(state = %self.run.state(), "Resume ignored");
            return;
        }
        self.auth_expired = false;
        for slot in &mut self.slots {
            slot.lost = false;
        }
        tracing::info!(cursor = self.run.cursor(), "Run resumed");
        if self.is_pipelined() {
            self.pipeline_resume();
        } else {
            self.sequential_resume();
        }
    }

    /// Discard the run: cancel every timer and in-flight job, tell the agents
    /// to abort and go back to `Idle`.
    fn stop(&mut self) {
        for slot in 0..self.slots.len() {
            if let Some(binding) = self.slots[slot].binding.take() {
                binding.cancel();
                self.stop_agent(slot);
            }
            self.slots[slot].lost = false;
        }
        for (_, rewrite) in self.rewrites.drain() {
            rewrite.task.abort();
        }
        self.cancel_timer();
        self.stop_watchdog();
        self.deferred.clear();
        self.pending.clear();
        self.auth_expired = false;
        self.run.reset();
        tracing::info!("Run stopped");
    }

    fn on_auth_expired(&mut self) {
        tracing::warn!("Project session expired, pausing run");
        self.auth_expired = true;
        self.pause();
    }

    fn on_worker_lost(&mut self, slot: usize) {
        let Some(worker) = self.slots.get_mut(slot) else {
            tracing::warn!(slot, "Loss reported for an unknown worker slot");
            return;
        };
        worker.lost = true;
        worker.ready = false;
        let orphan = worker.binding.take();
        tracing::warn!(slot, "Worker lost");

        if let Some(binding) = orphan {
            binding.cancel();
            if self.is_pipelined() {
                self.pending.push_front(binding.position);
            }
        }

        if self.slots.iter().all(|s| s.lost) {
            self.pause();
        } else if self.is_pipelined() {
            self.refill_any();
        }
    }

    fn on_timer(&mut self, kind: TimerKind) {
        match kind {
            TimerKind::Cooldown | TimerKind::Backoff => self.sequential_proceed(),
            TimerKind::Stagger => self.stagger_fill(),
        }
    }

    fn on_watchdog_tick(&mut self) {
        let now = Instant::now();
        let settings = self.run.settings();
        let deadline = self
            .watchdog
            .config()
            .deadline_for(&settings.platform, settings.media_kind);
        let verdict = self.watchdog.observe(
            self.run.state(),
            self.run.transitions(),
            self.run.state_entered_at(),
            deadline,
            now,
        );
        let WatchdogVerdict::Stuck {
            state, stuck_for, ..
        } = verdict
        else {
            return;
        };

        tracing::warn!(
            state = %state,
            stuck_secs = stuck_for.as_secs(),
            deadline_secs = deadline.as_secs(),
            "Run stuck, forcing failure"
        );
        let reason = format!("no progress in {state} for {}s", stuck_for.as_secs());
        if self.is_pipelined() {
            self.pipeline_force_fail(&reason, deadline, now);
        } else {
            self.sequential_force_fail(&reason);
        }
        self.watchdog.reset(now);
    }

    fn finish_run(&mut self) {
        self.cancel_timer();
        self.stop_watchdog();
        tracing::info!(
            run_id = %self.run.run_id(),
            completed = self.run.completed_count(),
            failed = self.run.failed_count(),
            "Run completed"
        );
    }

    /// Spawn the job task for `position` on `slot` and bind it.
    fn spawn_job(&mut self, slot: usize, position: usize, timeout: Option<Duration>) -> bool {
        let ticket = self.take_ticket();
        let Some(events) = self.sender() else {
            return false;
        };
        let Some(job) = self.run.job(position) else {
            return false;
        };
        let settings = self.run.settings();
        let request = ExecuteRequest {
            prompt: job.prompt.clone(),
            media_kind: settings.media_kind,
            platform: settings.platform.clone(),
            settings: self.options.agent_settings.clone(),
            source_media_ref: job.media_ref.clone(),
        };
        let index = self.run.resolve_index_for(position);
        let item = DeliveryItem {
            index,
            media_ref: String::new(),
            media_kind: settings.media_kind,
            segment_key: job.segment_key.clone(),
        };

        let worker = &self.slots[slot];
        let task = JobTask {
            slot,
            ticket,
            needs_ping: !worker.ready,
            agent: worker.agent.clone(),
            backend: self.backend.clone(),
            request,
            item,
            events: events.clone(),
        };
        let task = tokio::spawn(task.run()).abort_handle();
        let timeout =
            timeout.map(|after| send_after(after, events, Event::SlotTimeout { slot, ticket }));

        self.slots[slot].binding = Some(Binding {
            position,
            ticket,
            bound_at: Instant::now(),
            task,
            timeout,
        });
        tracing::info!(slot, index, ticket, "Job submitted");
        true
    }

    fn spawn_rewrite(
        &mut self,
        position: usize,
        source: String,
        failure: String,
        disposition: Option<ErrorDisposition>,
    ) -> bool {
        let Some(rewriter) = self.policy.rewriter() else {
            return false;
        };
        let Some(events) = self.sender() else {
            return false;
        };
        let ticket = self.take_ticket();
        let task = tokio::spawn(async move {
            let result = rewriter.rewrite(&source).await;
            let _ = events
                .send(Input::Event(Event::RewriteFinished { ticket, result }))
                .await;
        })
        .abort_handle();
        self.rewrites.insert(
            ticket,
            PendingRewrite {
                position,
                failure,
                disposition,
                task,
            },
        );
        true
    }

    fn schedule_timer(&mut self, kind: TimerKind, after: Duration) {
        self.cancel_timer();
        let ticket = self.take_ticket();
        let Some(events) = self.sender() else {
            return;
        };
        let task = send_after(after, events, Event::TimerElapsed { ticket });
        self.timer = Some(Timer { ticket, kind, task });
    }

    fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.task.abort();
        }
    }

    fn start_watchdog(&mut self) {
        self.stop_watchdog();
        let Some(events) = self.sender() else {
            return;
        };
        let cancel = CancellationToken::new();
        watchdog::spawn_ticker(
            self.watchdog.config().tick,
            events,
            || Input::Event(Event::WatchdogTick),
            cancel.clone(),
        );
        self.watchdog_cancel = Some(cancel);
    }

    fn stop_watchdog(&mut self) {
        if let Some(cancel) = self.watchdog_cancel.take() {
            cancel.cancel();
        }
    }

    fn stop_agent(&self, slot: usize) {
        let agent = self.slots[slot].agent.clone();
        tokio::spawn(async move { agent.stop().await });
    }

    fn is_bound(&self, slot: usize, ticket: u64) -> bool {
        self.slots
            .get(slot)
            .and_then(|s| s.binding.as_ref())
            .is_some_and(|b| b.ticket == ticket)
    }

    /// Release `slot` if it still holds the submission `ticket`.
    fn unbind(&mut self, slot: usize, ticket: u64) -> Option<Binding> {
        if !self.is_bound(slot, ticket) {
            return None;
        }
        let binding = self.slots[slot].binding.take()?;
        if let Some(timeout) = &binding.timeout {
            timeout.abort();
        }
        Some(binding)
    }

    fn is_pipelined(&self) -> bool {
        self.run.settings().concurrency > 1
    }

    fn take_ticket(&mut self) -> u64 {
        let ticket = self.next_ticket;
        self.next_ticket += 1;
        ticket
    }

    fn sender(&self) -> Option<mpsc::Sender<Input>> {
        self.events.as_ref().and_then(|weak| weak.upgrade())
    }

    fn snapshot(&self) -> RunSnapshot {
        RunSnapshot::of(&self.run, &self.slots, self.auth_expired)
    }

    fn publish(&self) {
        let next = self.snapshot();
        self.snapshots.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
    }
}

fn send_after(after: Duration, events: mpsc::Sender<Input>, event: Event) -> AbortHandle {
    tokio::spawn(async move {
        tokio::time::sleep(after).await;
        let _ = events.send(Input::Event(event)).await;
    })
    .abort_handle()
}

/// Cheap, cloneable access to a running [`Orchestrator`].
#[derive(Clone)]
pub struct OrchestratorHandle {
    inputs: mpsc::Sender<Input>,
    snapshots: watch::Receiver<RunSnapshot>,
}

impl OrchestratorHandle {
    /// Start a run. Returns the number of queued items.
    pub async fn start(
        &self,
        queue: Vec<JobSpec>,
        settings: RunSettings,
    ) -> Result<usize, OrchestratorError> {
        self.request(|reply| Command::Start {
            queue,
            settings,
            reply,
        })
        .await?
    }

    pub async fn pause(&self) -> Result<(), OrchestratorError> {
        self.send(Command::Pause).await
    }

    pub async fn resume(&self) -> Result<(), OrchestratorError> {
        self.send(Command::Resume).await
    }

    pub async fn stop(&self) -> Result<(), OrchestratorError> {
        self.send(Command::Stop).await
    }

    pub async fn skip_current(&self) -> Result<(), OrchestratorError> {
        self.send(Command::SkipCurrent).await
    }

    /// Re-run every failed item of the finished run. Returns how many.
    pub async fn retry_failed(&self) -> Result<usize, OrchestratorError> {
        self.request(|reply| Command::RetryFailed { reply }).await?
    }

    pub async fn retry_selected(&self, indices: Vec<usize>) -> Result<usize, OrchestratorError> {
        self.request(|reply| Command::RetrySelected { indices, reply })
            .await?
    }

    pub async fn get_state(&self) -> Result<RunSnapshot, OrchestratorError> {
        self.request(|reply| Command::GetState { reply }).await
    }

    pub async fn auth_expired(&self) -> Result<(), OrchestratorError> {
        self.send(Command::AuthExpired).await
    }

    pub async fn worker_lost(&self, slot: usize) -> Result<(), OrchestratorError> {
        self.send(Command::WorkerLost { slot }).await
    }

    /// Snapshots published after every change.
    pub fn subscribe(&self) -> watch::Receiver<RunSnapshot> {
        self.snapshots.clone()
    }

    /// Wait until the run is `Completed` or back to `Idle`.
    pub async fn wait_finished(&self) -> Result<RunSnapshot, OrchestratorError> {
        let mut rx = self.snapshots.clone();
        let snapshot = rx
            .wait_for(|s| s.lifecycle_state.is_finished())
            .await
            .map_err(|_| OrchestratorError::ControllerGone)?;
        Ok(snapshot.clone())
    }

    async fn send(&self, command: Command) -> Result<(), OrchestratorError> {
        self.inputs
            .send(Input::Command(command))
            .await
            .map_err(|_| OrchestratorError::ControllerGone)
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, OrchestratorError> {
        let (tx, rx) = oneshot::channel();
        self.send(command(tx)).await?;
        rx.await.map_err(|_| OrchestratorError::ControllerGone)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{AgentReply, AgentRequest};
    use crate::error::AgentError;
    use crate::state_machine::{CooldownRange, RetryConfig};
    use async_trait::async_trait;

    /// Never answers; the tests deliver reports by hand.
    struct SilentAgent;

    #[async_trait]
    impl WorkerAgent for SilentAgent {
        async fn send(&self, _request: AgentRequest) -> Result<AgentReply, AgentError> {
            std::future::pending().await
        }
    }

    /// A controller mid-run on a two-slot pipeline: slot 0 holds position 0,
    /// the other positions are pending. The returned sender keeps the
    /// controller's weak sender alive.
    fn pipeline_run(prompts: &[&str]) -> (Orchestrator, mpsc::Sender<Input>) {
        let agent: Arc<dyn WorkerAgent> = Arc::new(SilentAgent);
        let mut orchestrator = Orchestrator::new(vec![agent], OrchestratorOptions::default());
        let (tx, _rx) = mpsc::channel(INPUT_BUFFER);
        orchestrator.events = Some(tx.downgrade());

        let settings = RunSettings {
            concurrency: 2,
            cooldown: CooldownRange::new(Duration::ZERO, Duration::ZERO),
            retry: RetryConfig {
                max_retries: 1,
                base_delay_ms: 10,
            },
            ..Default::default()
        };
        let specs = prompts.iter().map(|p| JobSpec::new(*p)).collect();
        orchestrator.start(specs, settings).unwrap();
        (orchestrator, tx)
    }

    fn bound(orchestrator: &Orchestrator, slot: usize) -> (usize, u64) {
        let binding = orchestrator.slots[slot].binding.as_ref().unwrap();
        (binding.position, binding.ticket)
    }

    fn event(orchestrator: &mut Orchestrator, event: Event) {
        orchestrator.dispatch(Input::Event(event));
    }

    #[tokio::test]
    async fn completion_after_timeout_is_dropped() {
        let (mut orchestrator, _tx) = pipeline_run(&["a", "b", "c"]);
        let (position, stale) = bound(&orchestrator, 0);
        assert_eq!(position, 0);

        event(&mut orchestrator, Event::SlotTimeout { slot: 0, ticket: stale });
        let (position, fresh) = bound(&orchestrator, 0);
        assert_eq!(position, 1);
        assert_ne!(fresh, stale);

        event(
            &mut orchestrator,
            Event::JobFinished {
                slot: 0,
                ticket: stale,
                outcome: JobOutcome::Delivered {
                    media_ref: "blob:late".into(),
                },
            },
        );

        let results = orchestrator.run.results();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].index, 0);
        assert!(!results[0].success);
        assert!(results[0].error.as_deref().unwrap().starts_with("Timeout"));
        assert_eq!(bound(&orchestrator, 0), (1, fresh));
        assert_eq!(orchestrator.run.state(), LifecycleState::Generating);
    }

    #[tokio::test]
    async fn timeout_after_completion_is_ignored() {
        let (mut orchestrator, _tx) = pipeline_run(&["a", "b", "c"]);
        let (_, first) = bound(&orchestrator, 0);

        event(
            &mut orchestrator,
            Event::JobFinished {
                slot: 0,
                ticket: first,
                outcome: JobOutcome::Delivered {
                    media_ref: "blob:a".into(),
                },
            },
        );
        let (position, fresh) = bound(&orchestrator, 0);
        assert_eq!(position, 1);

        event(&mut orchestrator, Event::SlotTimeout { slot: 0, ticket: first });

        let results = orchestrator.run.results();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].index, 0);
        assert!(results[0].success);
        assert_eq!(bound(&orchestrator, 0), (1, fresh));
        assert_eq!(orchestrator.pending, VecDeque::from([2]));
    }

    #[tokio::test]
    async fn snapshot_lists_bound_jobs() {
        let (orchestrator, _tx) = pipeline_run(&["a", "b"]);
        let snapshot = orchestrator.snapshot();
        assert_eq!(snapshot.in_flight, vec![0]);
        assert_eq!(snapshot.total_count, 2);
        assert!(!snapshot.is_retry);
    }
}
