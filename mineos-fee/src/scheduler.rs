use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::FeeSchedulerConfig;
use crate::monitor::{
    AbortReason, DiversionMonitor, DiversionOutcome, DiversionReport, DiversionState,
};
use crate::ranker::{clamp_quota, rank_workers};
use crate::registry::WorkerRegistry;
use crate::target::{FeeTarget, FeeTargetId};
use crate::worker::{WorkerId, WorkerSession};

/// Scheduler statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeeStats {
    pub rounds_completed: u64,
    /// Selection ticks that found nothing to dispatch
    pub idle_ticks: u64,
    pub diversions_dispatched: u64,
    pub diversions_completed: u64,
    pub diversions_timed_out: u64,
    pub diversions_aborted: u64,
    pub diversions_skipped: u64,
}

/// Result of one dispatched round
#[derive(Debug, Clone)]
pub struct RoundSummary {
    pub target_id: FeeTargetId,

    /// Quota reported by the target before clamping
    pub share_diff: i64,

    /// Target's completed round count including this round
    pub round: u64,

    /// One report per dispatched worker, in ranking order
    pub diversions: Vec<DiversionReport>,
}

impl RoundSummary {
    pub fn dispatched(&self) -> usize {
        self.diversions.len()
    }

    /// Number of diversions that ended in `state`
    pub fn count(&self, state: DiversionState) -> usize {
        self.diversions
            .iter()
            .filter(|r| r.outcome.state() == state)
            .count()
    }

    pub fn worker_ids(&self) -> Vec<WorkerId> {
        self.diversions.iter().map(|r| r.worker_id.clone()).collect()
    }
}

type MonitorHandle = (Arc<WorkerSession>, JoinHandle<DiversionReport>);

/// Target and workers chosen by one successful selection tick
struct RoundPlan {
    target: Arc<FeeTarget>,
    share_diff: i64,
    workers: Vec<Arc<WorkerSession>>,
}

/// Pick the most behind fee target among those with a connected upstream.
///
/// Ties go to the first target in list order.
pub fn select_target(targets: &[Arc<FeeTarget>]) -> Option<&Arc<FeeTarget>> {
    let mut selected: Option<&Arc<FeeTarget>> = None;

    for target in targets {
        if target.is_upstream_disconnected() {
            warn!("{} fee upstream is reconnecting or disconnected", target);
            continue;
        }
        let more_behind = selected.map_or(true, |current| target.progress() < current.progress());
        if more_behind {
            selected = Some(target);
        }
    }

    selected
}

/// Decides which fee target is serviced next and diverts workers to it
pub struct FeeScheduler {
    /// Configuration
    config: FeeSchedulerConfig,

    /// Source of online workers
    registry: Arc<dyn WorkerRegistry>,

    /// Scheduling statistics
    stats: RwLock<FeeStats>,
}

impl FeeScheduler {
    /// Create a new fee scheduler, rejecting zero intervals
    pub fn new(
        config: FeeSchedulerConfig,
        registry: Arc<dyn WorkerRegistry>,
    ) -> crate::Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            registry,
            stats: RwLock::new(FeeStats::default()),
        })
    }

    pub fn config(&self) -> &FeeSchedulerConfig {
        &self.config
    }

    /// Get scheduling statistics
    pub fn stats(&self) -> FeeStats {
        self.stats.read().clone()
    }

    /// Run fee rounds back to back until `token` is cancelled
    pub async fn run(&self, token: &CancellationToken, targets: &[Arc<FeeTarget>]) {
        if targets.is_empty() {
            info!("No fee targets configured, fee scheduler idle");
            return;
        }

        info!("Starting fee scheduler with {} target(s)", targets.len());
        while !token.is_cancelled() {
            self.run_round(token, targets).await;
        }
        info!("Fee scheduler stopped");
    }

    /// Run at most one fee round.
    ///
    /// Waits one selection interval between attempts until a target with
    /// outstanding quota and eligible workers is found, then diverts the
    /// selected workers and waits for every diversion to end. Returns `None`
    /// when nothing was dispatched: no targets, or `token` was cancelled
    /// before a selection succeeded.
    pub async fn run_round(
        &self,
        token: &CancellationToken,
        targets: &[Arc<FeeTarget>],
    ) -> Option<RoundSummary> {
        if targets.is_empty() {
            return None;
        }

        let round_start = Instant::now();
        let plan = loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => return None,
                _ = sleep(self.config.selection_interval()) => {}
            }

            match self.plan_round(targets, round_start) {
                Some(plan) => break plan,
                None => self.stats.write().idle_ticks += 1,
            }
        };

        Some(self.dispatch(plan, token).await)
    }

    /// One selection tick
    fn plan_round(&self, targets: &[Arc<FeeTarget>], round_start: Instant) -> Option<RoundPlan> {
        let target = select_target(targets)?;
        debug!(
            "{}[{:.1}min] checking fee, selected target progress: {:.4}",
            target,
            round_start.elapsed().as_secs_f64() / 60.0,
            target.progress()
        );

        let share_diff = target.share_diff();
        debug!("{} shares needed: {}", target, share_diff);
        if share_diff <= 0 {
            return None;
        }

        let now = Instant::now();
        let eligible: Vec<_> = self
            .registry
            .online_workers()
            .into_iter()
            .filter(|w| w.is_online() && !w.is_diverted() && w.is_eligible(now))
            .collect();
        if eligible.is_empty() {
            debug!("{} no eligible workers online", target);
            return None;
        }

        let quota = clamp_quota(share_diff, eligible.len());
        let mut workers = rank_workers(eligible);
        workers.truncate(quota);
        debug!("{} final diversion count: {}", target, workers.len());

        Some(RoundPlan {
            target: target.clone(),
            share_diff,
            workers,
        })
    }

    /// Fan out one monitor per worker and join them all
    async fn dispatch(&self, plan: RoundPlan, token: &CancellationToken) -> RoundSummary {
        let RoundPlan {
            target,
            share_diff,
            workers,
        } = plan;
        let limits = self.config.diversion_limits();
        let dispatched_at = Instant::now();

        let handles: Vec<MonitorHandle> = workers
            .into_iter()
            .map(|worker| {
                let monitor =
                    DiversionMonitor::new(worker.clone(), target.clone(), limits, token.clone());
                (worker, tokio::spawn(monitor.run()))
            })
            .collect();

        self.join_monitors(target, share_diff, handles, dispatched_at).await
    }

    /// Wait for every monitor of a round, then close the round
    async fn join_monitors(
        &self,
        target: Arc<FeeTarget>,
        share_diff: i64,
        handles: Vec<MonitorHandle>,
        dispatched_at: Instant,
    ) -> RoundSummary {
        self.stats.write().diversions_dispatched += handles.len() as u64;

        let mut diversions = Vec::with_capacity(handles.len());
        for (worker, handle) in handles {
            let report = match handle.await {
                Ok(report) => report,
                Err(e) => {
                    error!("{} monitor for worker [{}] failed: {}", target, worker.id(), e);
                    // an attempt recorded after dispatch belongs to this round
                    let started_at = worker
                        .fee_attempt()
                        .last_attempt_at
                        .filter(|at| *at >= dispatched_at);
                    DiversionReport {
                        worker_id: worker.id().clone(),
                        outcome: DiversionOutcome::Aborted(AbortReason::MonitorFailed),
                        started_at,
                        finished_at: Instant::now(),
                    }
                }
            };
            diversions.push(report);
        }

        let round = target.finish_round();
        self.record_round(&diversions);

        let summary = RoundSummary {
            target_id: target.id(),
            share_diff,
            round,
            diversions,
        };
        info!(
            "{} fee round {} finished: {} dispatched, {} completed, {} timed out, {} aborted",
            target,
            round,
            summary.dispatched(),
            summary.count(DiversionState::Completed),
            summary.count(DiversionState::TimedOut),
            summary.count(DiversionState::Aborted)
        );
        summary
    }

    fn record_round(&self, diversions: &[DiversionReport]) {
        let mut stats = self.stats.write();
        stats.rounds_completed += 1;
        for report in diversions {
            match report.outcome {
                DiversionOutcome::Completed => stats.diversions_completed += 1,
                DiversionOutcome::TimedOut => stats.diversions_timed_out += 1,
                DiversionOutcome::Aborted(_) => stats.diversions_aborted += 1,
                DiversionOutcome::Skipped => stats.diversions_skipped += 1,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FeeError;
    use crate::monitor::DiversionGuard;
    use crate::registry::MockWorkerRegistry;
    use proptest::prelude::*;
    use std::time::Duration;

    fn target(id: u32, pool_shares: u64, fee_shares: u64) -> Arc<FeeTarget> {
        let target = Arc::new(FeeTarget::new(
            FeeTargetId(id),
            format!("0x{:03}", id),
            format!("fee{}", id),
            0.25,
        ));
        let credit_sink = WorkerSession::new("sink");
        for _ in 0..pool_shares {
            target.record_pool_share();
        }
        for _ in 0..fee_shares {
            target.record_fee_share(&credit_sink);
        }
        target
    }

    fn worker(id: &str, score: f64) -> Arc<WorkerSession> {
        Arc::new(WorkerSession::with_score(id, score))
    }

    fn scheduler_with(workers: Vec<Arc<WorkerSession>>) -> FeeScheduler {
        let mut registry = MockWorkerRegistry::new();
        registry
            .expect_online_workers()
            .returning(move || workers.clone());
        FeeScheduler::new(FeeSchedulerConfig::default(), Arc::new(registry)).unwrap()
    }

    #[test]
    fn test_select_most_behind() {
        let targets = vec![target(0, 40, 5), target(1, 40, 1), target(2, 40, 8)];
        let selected = select_target(&targets).unwrap();
        assert_eq!(selected.id(), FeeTargetId(1));
    }

    #[test]
    fn test_select_ties_first_wins() {
        let targets = vec![target(0, 40, 2), target(1, 40, 2)];
        assert_eq!(select_target(&targets).unwrap().id(), FeeTargetId(0));
    }

    #[test]
    fn test_select_skips_disconnected() {
        let targets = vec![target(0, 40, 0), target(1, 40, 5)];
        targets[0].set_upstream_connected(false);
        assert_eq!(select_target(&targets).unwrap().id(), FeeTargetId(1));

        targets[1].set_upstream_connected(false);
        assert!(select_target(&targets).is_none());
        assert!(select_target(&[]).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_plan_ranks_and_clamps() {
        let workers = vec![worker("a", 1.0), worker("b", 9.0), worker("c", 5.0)];
        let scheduler = scheduler_with(workers);
        // 8 pool shares at 25% -> 2 owed
        let targets = vec![target(0, 8, 0)];

        let plan = scheduler.plan_round(&targets, Instant::now()).unwrap();
        let ids: Vec<_> = plan.workers.iter().map(|w| w.id().to_string()).collect();
        assert_eq!(plan.share_diff, 2);
        assert_eq!(ids, vec!["b", "c"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_plan_skips_cooling_and_diverted_workers() {
        let cooling = worker("cooling", 9.0);
        cooling.apply_cooldown(Instant::now() + Duration::from_secs(60));
        let busy = worker("busy", 8.0);
        assert!(busy.try_claim_diversion());
        let idle = worker("idle", 1.0);

        let scheduler = scheduler_with(vec![cooling, busy, idle]);
        let targets = vec![target(0, 40, 0)];

        let plan = scheduler.plan_round(&targets, Instant::now()).unwrap();
        assert_eq!(plan.share_diff, 10);
        assert_eq!(plan.workers.len(), 1);
        assert_eq!(plan.workers[0].id().as_str(), "idle");
    }

    #[tokio::test(start_paused = true)]
    async fn test_plan_none_when_quota_satisfied() {
        let scheduler = scheduler_with(vec![worker("a", 1.0)]);
        let targets = vec![target(0, 6, 2)];
        assert!(scheduler.plan_round(&targets, Instant::now()).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_plan_none_without_workers() {
        let scheduler = scheduler_with(Vec::new());
        let targets = vec![target(0, 40, 0)];
        assert!(scheduler.plan_round(&targets, Instant::now()).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_targets_is_noop() {
        let mut registry = MockWorkerRegistry::new();
        registry.expect_online_workers().never();
        let scheduler =
            FeeScheduler::new(FeeSchedulerConfig::default(), Arc::new(registry)).unwrap();
        let token = CancellationToken::new();

        let before = Instant::now();
        assert!(scheduler.run_round(&token, &[]).await.is_none());
        scheduler.run(&token, &[]).await;
        assert_eq!(Instant::now(), before);
        assert_eq!(scheduler.stats(), FeeStats::default());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_before_selection() {
        let w = worker("a", 1.0);
        let scheduler = scheduler_with(vec![w.clone()]);
        let targets = vec![target(0, 40, 0)];
        let token = CancellationToken::new();
        token.cancel();

        assert!(scheduler.run_round(&token, &targets).await.is_none());
        assert!(!w.is_diverted());
        assert_eq!(targets[0].completed_rounds(), 0);
        assert_eq!(scheduler.stats().idle_ticks, 0);
    }

    #[test]
    fn test_new_rejects_zero_intervals() {
        for config in [
            FeeSchedulerConfig {
                poll_interval_secs: 0,
                ..Default::default()
            },
            FeeSchedulerConfig {
                selection_interval_secs: 0,
                ..Default::default()
            },
        ] {
            let result = FeeScheduler::new(config, Arc::new(MockWorkerRegistry::new()));
            assert!(matches!(result, Err(FeeError::InvalidConfiguration(_))));
        }
    }

    /// Claims the worker like a real monitor, then panics while diverting
    async fn failing_monitor(
        worker: Arc<WorkerSession>,
        target: Arc<FeeTarget>,
    ) -> DiversionReport {
        let _guard = DiversionGuard::claim(&worker, &target).unwrap();
        assert!(target.is_diverting(worker.id()));
        panic!("monitor failure");
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicked_monitor_counts_as_aborted() {
        let w = worker("a", 1.0);
        let t = target(0, 40, 0);
        let scheduler = scheduler_with(Vec::new());

        let dispatched_at = Instant::now();
        let handle = tokio::spawn(failing_monitor(w.clone(), t.clone()));
        let summary = scheduler
            .join_monitors(t.clone(), 10, vec![(w.clone(), handle)], dispatched_at)
            .await;

        let report = &summary.diversions[0];
        assert_eq!(
            report.outcome,
            DiversionOutcome::Aborted(AbortReason::MonitorFailed)
        );
        assert_eq!(report.started_at, Some(dispatched_at));
        assert_eq!(summary.round, 1);

        let stats = scheduler.stats();
        assert_eq!(stats.diversions_dispatched, 1);
        assert_eq!(stats.diversions_aborted, 1);
        assert_eq!(stats.rounds_completed, 1);

        assert!(!w.is_diverted());
        assert_eq!(t.active_diversions(), 0);
        assert_eq!(t.completed_rounds(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_monitor_without_attempt_has_no_start() {
        let w = worker("a", 1.0);
        let t = target(0, 40, 0);
        let scheduler = scheduler_with(Vec::new());

        let dispatched_at = Instant::now();
        let handle: JoinHandle<DiversionReport> = tokio::spawn(std::future::pending());
        handle.abort();
        let summary = scheduler
            .join_monitors(t, 10, vec![(w.clone(), handle)], dispatched_at)
            .await;

        assert!(summary.diversions[0].started_at.is_none());
        assert!(!w.is_diverted());
    }

    proptest! {
        #[test]
        fn prop_selected_target_is_min_connected(
            cases in prop::collection::vec((0u64..50, 0u64..20, any::<bool>()), 0..8)
        ) {
            let targets: Vec<_> = cases
                .iter()
                .enumerate()
                .map(|(i, (pool, fee, connected))| {
                    let t = target(i as u32, *pool, *fee);
                    t.set_upstream_connected(*connected);
                    t
                })
                .collect();

            let connected: Vec<_> = targets.iter().filter(|t| !t.is_upstream_disconnected()).collect();
            match select_target(&targets) {
                None => prop_assert!(connected.is_empty()),
                Some(selected) => {
                    prop_assert!(!selected.is_upstream_disconnected());
                    let min = connected
                        .iter()
                        .map(|t| t.progress())
                        .fold(f64::INFINITY, f64::min);
                    prop_assert_eq!(selected.progress(), min);
                    // first connected target with the minimum
                    let first = connected.iter().find(|t| t.progress() == min).unwrap();
                    prop_assert_eq!(selected.id(), first.id());
                }
            }
        }
    }
}
