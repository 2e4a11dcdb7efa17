//! Coarse, run-level stuck detection.
//!
//! Per-job timeouts live in the pipeline scheduler. The watchdog covers
//! what the scheduler cannot see, such as an agent that never answers in
//! sequential mode. It ticks at a low frequency and flags a run that has
//! sat in GENERATING, DOWNLOADING or UPLOADING past its deadline.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::state_machine::{LifecycleState, MediaKind, Platform};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchdogConfig {
    pub tick: Duration,
    pub default_deadline: Duration,
    /// Used for the heavy `platform:media` combinations in `extended_targets`.
    pub extended_deadline: Duration,
    pub extended_targets: Vec<String>,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            tick: Duration::from_secs(24),
            default_deadline: Duration::from_secs(5 * 60),
            extended_deadline: Duration::from_secs(10 * 60),
            extended_targets: vec!["grok:video".to_string()],
        }
    }
}

impl WatchdogConfig {
    pub fn deadline_for(&self, platform: &Platform, media: MediaKind) -> Duration {
        let key = platform.target_key(media);
        if self.extended_targets.iter().any(|t| t.eq_ignore_ascii_case(&key)) {
            self.extended_deadline
        } else {
            self.default_deadline
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogVerdict {
    Healthy,
    Stuck {
        state: LifecycleState,
        stuck_for: Duration,
        deadline: Duration,
    },
}

/// Tracks how long the run has been in its current state.
///
/// A state is identified by `(state, transition count)` so that re-entering
/// the same state (e.g. GENERATING for the next item) restarts the clock.
#[derive(Debug)]
pub struct WatchdogSupervisor {
    config: WatchdogConfig,
    last_observed: Option<(LifecycleState, u64)>,
    entered_at: Instant,
}

impl WatchdogSupervisor {
    pub fn new(config: WatchdogConfig) -> Self {
        Self {
            config,
            last_observed: None,
            entered_at: Instant::now(),
        }
    }

    pub fn config(&self) -> &WatchdogConfig {
        &self.config
    }

    pub fn observe(
        &mut self,
        state: LifecycleState,
        transitions: u64,
        state_entered_at: Instant,
        deadline: Duration,
        now: Instant,
    ) -> WatchdogVerdict {
        if self.last_observed != Some((state, transitions)) {
            self.last_observed = Some((state, transitions));
            self.entered_at = state_entered_at;
        }

        if !state.is_stuck_prone() {
            return WatchdogVerdict::Healthy;
        }

        let stuck_for = now.saturating_duration_since(self.entered_at);
        if stuck_for >= deadline {
            WatchdogVerdict::Stuck {
                state,
                stuck_for,
                deadline,
            }
        } else {
            WatchdogVerdict::Healthy
        }
    }

    /// Restart the clock after a forced failure.
    pub fn reset(&mut self, now: Instant) {
        self.last_observed = None;
        self.entered_at = now;
    }
}

/// Send `event()` into `tx` every `period` until cancelled or the receiver
/// goes away.
pub fn spawn_ticker<T, F>(
    period: Duration,
    tx: mpsc::Sender<T>,
    event: F,
    cancel: CancellationToken,
) -> JoinHandle<()>
where
    T: Send + 'static,
    F: Fn() -> T + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        tracing::debug!(period_ms = period.as_millis() as u64, "Watchdog started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::debug!("Watchdog shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    if tx.send(event()).await.is_err() {
                        break;
                    }
                }
            }
        }
    })
}
