//! Per-worker diversion watchdog.
//!
//! A monitor owns one worker for the duration of one diversion:
//!
//! ```text
//! Idle -> Diverting -> Completed | TimedOut | Aborted
//! ```
//!
//! Leaving `Diverting` always clears the worker's diversion flag and removes
//! it from the target's active set, including on cancellation and panic.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::target::FeeTarget;
use crate::worker::{WorkerId, WorkerSession};

/// Diversion state of a monitored worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DiversionState {
    Idle,
    Diverting,
    Completed,
    TimedOut,
    Aborted,
}

/// Why a diversion was abandoned before producing a fee share
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AbortReason {
    /// Pool shutdown token fired
    Cancelled,

    /// Worker disconnected mid-diversion
    WorkerOffline,

    /// Worker was removed from the target's active set by someone else
    Evicted,

    /// Fee upstream went down mid-diversion
    UpstreamDisconnected,

    /// Monitor task panicked or was aborted by the runtime
    MonitorFailed,
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            AbortReason::Cancelled => "cancelled",
            AbortReason::WorkerOffline => "worker offline",
            AbortReason::Evicted => "evicted",
            AbortReason::UpstreamDisconnected => "fee upstream disconnected",
            AbortReason::MonitorFailed => "monitor failed",
        };
        f.write_str(reason)
    }
}

/// Terminal result of one monitor task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DiversionOutcome {
    /// At least one share was credited to the target
    Completed,

    /// No credited share within the diversion timeout; cooldown applied
    TimedOut,

    Aborted(AbortReason),

    /// Worker was already owned by another diversion, nothing was touched
    Skipped,
}

impl DiversionOutcome {
    pub fn state(&self) -> DiversionState {
        match self {
            DiversionOutcome::Completed => DiversionState::Completed,
            DiversionOutcome::TimedOut => DiversionState::TimedOut,
            DiversionOutcome::Aborted(_) => DiversionState::Aborted,
            DiversionOutcome::Skipped => DiversionState::Idle,
        }
    }
}

/// What happened to one worker during a round
#[derive(Debug, Clone)]
pub struct DiversionReport {
    pub worker_id: WorkerId,
    pub outcome: DiversionOutcome,

    /// `None` if the diversion never started
    pub started_at: Option<Instant>,

    pub finished_at: Instant,
}

/// Timing limits applied to every diversion
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiversionLimits {
    /// Interval between health/progress checks
    pub poll_interval: Duration,

    /// Ceiling on a diversion without a credited share
    pub timeout: Duration,

    /// Penalty added to a worker's next eligible time after a timeout
    pub cooldown: Duration,
}

impl Default for DiversionLimits {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(2),
            timeout: Duration::from_secs(120),
            cooldown: Duration::from_secs(240),
        }
    }
}

/// Stand-in cooldown when the configured one does not fit in an `Instant`
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

fn cooldown_deadline(finished_at: Instant, cooldown: Duration) -> Instant {
    finished_at
        .checked_add(cooldown)
        .or_else(|| finished_at.checked_add(FAR_FUTURE))
        .unwrap_or(finished_at)
}

/// Ownership of one worker's diversion; released when dropped
pub(crate) struct DiversionGuard<'a> {
    worker: &'a WorkerSession,
    target: &'a FeeTarget,

    /// Worker's credited share count for the target at claim time
    pub(crate) baseline: i64,

    pub(crate) started_at: Instant,
}

impl<'a> DiversionGuard<'a> {
    /// Move `worker` from `Idle` to `Diverting` for `target`.
    ///
    /// Returns `None` without touching any state if another diversion
    /// already owns the worker.
    pub(crate) fn claim(worker: &'a WorkerSession, target: &'a FeeTarget) -> Option<Self> {
        if !worker.try_claim_diversion() {
            return None;
        }
        let baseline = worker.fee_share_count(target.id());
        let started_at = worker.begin_fee_attempt();
        target.register_diversion(worker.id());
        Some(Self {
            worker,
            target,
            baseline,
            started_at,
        })
    }
}

impl Drop for DiversionGuard<'_> {
    fn drop(&mut self) {
        self.target.release_diversion(self.worker.id());
        self.worker.release_diversion();
        debug!("{} worker [{}] diversion ended", self.target, self.worker.id());
    }
}

/// Watchdog for a single worker diverted to a single target
pub(crate) struct DiversionMonitor {
    worker: Arc<WorkerSession>,
    target: Arc<FeeTarget>,
    limits: DiversionLimits,
    token: CancellationToken,
}

impl DiversionMonitor {
    pub(crate) fn new(
        worker: Arc<WorkerSession>,
        target: Arc<FeeTarget>,
        limits: DiversionLimits,
        token: CancellationToken,
    ) -> Self {
        Self {
            worker,
            target,
            limits,
            token,
        }
    }

    /// Run the diversion to a terminal state
    pub(crate) async fn run(self) -> DiversionReport {
        let worker = self.worker.as_ref();
        let target = self.target.as_ref();

        let Some(guard) = DiversionGuard::claim(worker, target) else {
            debug!("{} worker [{}] already diverted, skipping", target, worker.id());
            return DiversionReport {
                worker_id: worker.id().clone(),
                outcome: DiversionOutcome::Skipped,
                started_at: None,
                finished_at: Instant::now(),
            };
        };
        let (baseline, started_at) = (guard.baseline, guard.started_at);

        debug!(
            "{} worker [{}] diversion started | score: [{:.3}] | state: {:?}",
            target,
            worker.id(),
            worker.score(),
            DiversionState::Diverting
        );

        let outcome = self.watch(baseline, started_at).await;
        let finished_at = Instant::now();

        match outcome {
            DiversionOutcome::TimedOut => {
                warn!(
                    "{} worker [{}] got no fee share within {}s, cooling down for {}s",
                    target,
                    worker.id(),
                    self.limits.timeout.as_secs(),
                    self.limits.cooldown.as_secs()
                );
                worker.apply_cooldown(cooldown_deadline(finished_at, self.limits.cooldown));
            }
            DiversionOutcome::Aborted(AbortReason::Cancelled) => {
                debug!("{} worker [{}] diversion cancelled", target, worker.id());
            }
            DiversionOutcome::Aborted(reason) => {
                warn!(
                    "{} worker [{}] diversion aborted: {}",
                    target,
                    worker.id(),
                    reason
                );
            }
            DiversionOutcome::Completed | DiversionOutcome::Skipped => {}
        }

        debug!(
            "{} worker [{}] state: {:?} after {:.1}s",
            target,
            worker.id(),
            outcome.state(),
            finished_at.duration_since(started_at).as_secs_f64()
        );

        drop(guard);
        DiversionReport {
            worker_id: worker.id().clone(),
            outcome,
            started_at: Some(started_at),
            finished_at,
        }
    }

    async fn watch(&self, baseline: i64, started_at: Instant) -> DiversionOutcome {
        loop {
            tokio::select! {
                biased;
                _ = self.token.cancelled() => {
                    return DiversionOutcome::Aborted(AbortReason::Cancelled);
                }
                _ = sleep(self.limits.poll_interval) => {}
            }

            if let Some(outcome) = self.check(baseline, started_at) {
                return outcome;
            }
        }
    }

    /// One poll tick; checks run in priority order
    fn check(&self, baseline: i64, started_at: Instant) -> Option<DiversionOutcome> {
        let worker = self.worker.as_ref();
        let target = self.target.as_ref();

        if self.token.is_cancelled() {
            return Some(DiversionOutcome::Aborted(AbortReason::Cancelled));
        }
        if !worker.is_online() {
            return Some(DiversionOutcome::Aborted(AbortReason::WorkerOffline));
        }
        if !target.is_diverting(worker.id()) {
            return Some(DiversionOutcome::Aborted(AbortReason::Evicted));
        }
        if target.is_upstream_disconnected() {
            return Some(DiversionOutcome::Aborted(AbortReason::UpstreamDisconnected));
        }
        if worker.fee_share_count(target.id()) - baseline >= 1 {
            return Some(DiversionOutcome::Completed);
        }
        if started_at.elapsed() > self.limits.timeout {
            return Some(DiversionOutcome::TimedOut);
        }
        None
    }
}
