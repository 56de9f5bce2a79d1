use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::time::Instant;

use crate::target::FeeTargetId;

/// Identifier of a connected worker (usually `wallet.rig`)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkerId(String);

impl WorkerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for WorkerId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for WorkerId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Bookkeeping for the most recent fee attempt of a worker
#[derive(Debug, Clone, Default)]
pub struct FeeAttempt {
    /// When the last diversion started
    pub last_attempt_at: Option<Instant>,

    /// Worker's total share count when the last diversion started
    pub share_baseline: u64,

    /// Worker may not be selected again before this instant
    pub next_eligible: Option<Instant>,
}

/// Live session of a connected miner.
///
/// The registry owns sessions; the fee scheduler only toggles the diversion
/// flag and the attempt bookkeeping. All state is internally synchronized so
/// a session can be shared as `Arc<WorkerSession>` between the proxy's
/// connection handler, the share pipeline and fee monitor tasks.
pub struct WorkerSession {
    id: WorkerId,

    /// Connection is alive and authorized
    online: AtomicBool,

    /// Shares submitted by this worker since connect
    total_shares: AtomicU64,

    /// Latest score published by the scoring heuristic (f64 bits)
    score: AtomicU64,

    /// Proxy routes this worker's work to a fee upstream while set
    diverted: AtomicBool,

    attempt: Mutex<FeeAttempt>,

    /// Shares credited to each fee target while diverted
    fee_shares: DashMap<FeeTargetId, AtomicI64>,
}

impl WorkerSession {
    /// Create a new online session
    pub fn new(id: impl Into<WorkerId>) -> Self {
        Self {
            id: id.into(),
            online: AtomicBool::new(true),
            total_shares: AtomicU64::new(0),
            score: AtomicU64::new(0f64.to_bits()),
            diverted: AtomicBool::new(false),
            attempt: Mutex::new(FeeAttempt::default()),
            fee_shares: DashMap::new(),
        }
    }

    /// Create a new online session with an initial score
    pub fn with_score(id: impl Into<WorkerId>, score: f64) -> Self {
        let session = Self::new(id);
        session.set_score(score);
        session
    }

    pub fn id(&self) -> &WorkerId {
        &self.id
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    pub fn total_shares(&self) -> u64 {
        self.total_shares.load(Ordering::SeqCst)
    }

    /// Count a share submitted by this worker
    pub fn record_share(&self) {
        self.total_shares.fetch_add(1, Ordering::SeqCst);
    }

    pub fn score(&self) -> f64 {
        f64::from_bits(self.score.load(Ordering::Relaxed))
    }

    /// Publish a new score for this worker
    pub fn set_score(&self, score: f64) {
        self.score.store(score.to_bits(), Ordering::Relaxed);
    }

    /// Whether the proxy should currently route this worker to a fee upstream
    pub fn is_diverted(&self) -> bool {
        self.diverted.load(Ordering::SeqCst)
    }

    /// Take ownership of this worker's diversion.
    ///
    /// Returns `false` if another diversion already owns the worker.
    pub(crate) fn try_claim_diversion(&self) -> bool {
        self.diverted
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub(crate) fn release_diversion(&self) {
        self.diverted.store(false, Ordering::SeqCst);
    }

    /// Record the start of a fee attempt and return its start time
    pub(crate) fn begin_fee_attempt(&self) -> Instant {
        let now = Instant::now();
        let mut attempt = self.attempt.lock();
        attempt.last_attempt_at = Some(now);
        attempt.share_baseline = self.total_shares();
        now
    }

    pub(crate) fn apply_cooldown(&self, until: Instant) {
        self.attempt.lock().next_eligible = Some(until);
    }

    pub fn fee_attempt(&self) -> FeeAttempt {
        self.attempt.lock().clone()
    }

    pub fn next_eligible(&self) -> Option<Instant> {
        self.attempt.lock().next_eligible
    }

    /// True when no cooldown is pending at `now`
    pub fn is_eligible(&self, now: Instant) -> bool {
        match self.attempt.lock().next_eligible {
            Some(until) => now >= until,
            None => true,
        }
    }

    /// Shares credited to `target` so far, inserting a zero counter if absent
    pub fn fee_share_count(&self, target: FeeTargetId) -> i64 {
        self.fee_shares
            .entry(target)
            .or_insert_with(|| AtomicI64::new(0))
            .load(Ordering::SeqCst)
    }

    pub(crate) fn credit_fee_share(&self, target: FeeTargetId) {
        self.fee_shares
            .entry(target)
            .or_insert_with(|| AtomicI64::new(0))
            .fetch_add(1, Ordering::SeqCst);
    }
}

impl fmt::Debug for WorkerSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerSession")
            .field("id", &self.id)
            .field("online", &self.is_online())
            .field("total_shares", &self.total_shares())
            .field("score", &self.score())
            .field("diverted", &self.is_diverted())
            .finish()
    }
}
