use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use dashmap::DashSet;

use crate::worker::{WorkerId, WorkerSession};

/// Identity of a fee target, assigned in configuration order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FeeTargetId(pub u32);

impl fmt::Display for FeeTargetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fee#{}", self.0)
    }
}

/// One configured fee destination (wallet + upstream connection)
pub struct FeeTarget {
    id: FeeTargetId,

    /// Wallet credited by the fee upstream
    wallet: String,

    /// Worker name prefix used on the fee upstream
    name_prefix: String,

    /// Fraction of aggregate work skimmed to this target
    pct: f64,

    /// Health of the fee upstream, owned by the upstream connection manager
    upstream_connected: AtomicBool,

    /// Shares forwarded to the normal pool during the current cycle
    pool_shares: AtomicU64,

    /// Shares credited to this target during the current cycle
    fee_shares: AtomicU64,

    /// Fully dispatched rounds
    completed_rounds: AtomicU64,

    /// Workers currently diverted to this target
    active: DashSet<WorkerId>,
}

impl FeeTarget {
    /// Create a new fee target with a connected upstream
    pub fn new(
        id: FeeTargetId,
        wallet: impl Into<String>,
        name_prefix: impl Into<String>,
        pct: f64,
    ) -> Self {
        Self {
            id,
            wallet: wallet.into(),
            name_prefix: name_prefix.into(),
            pct,
            upstream_connected: AtomicBool::new(true),
            pool_shares: AtomicU64::new(0),
            fee_shares: AtomicU64::new(0),
            completed_rounds: AtomicU64::new(0),
            active: DashSet::new(),
        }
    }

    pub fn id(&self) -> FeeTargetId {
        self.id
    }

    pub fn wallet(&self) -> &str {
        &self.wallet
    }

    pub fn name_prefix(&self) -> &str {
        &self.name_prefix
    }

    pub fn pct(&self) -> f64 {
        self.pct
    }

    // Upstream health

    pub fn is_upstream_disconnected(&self) -> bool {
        !self.upstream_connected.load(Ordering::SeqCst)
    }

    pub fn set_upstream_connected(&self, connected: bool) {
        self.upstream_connected.store(connected, Ordering::SeqCst);
    }

    // Share accounting

    /// Count a share forwarded to the normal pool
    pub fn record_pool_share(&self) {
        self.pool_shares.fetch_add(1, Ordering::SeqCst);
    }

    /// Count a share credited to this target by a diverted worker
    pub fn record_fee_share(&self, worker: &WorkerSession) {
        self.fee_shares.fetch_add(1, Ordering::SeqCst);
        worker.credit_fee_share(self.id);
    }

    pub fn pool_shares(&self) -> u64 {
        self.pool_shares.load(Ordering::SeqCst)
    }

    pub fn fee_shares(&self) -> u64 {
        self.fee_shares.load(Ordering::SeqCst)
    }

    /// Start a new accounting cycle
    pub fn reset_progress(&self) {
        self.pool_shares.store(0, Ordering::SeqCst);
        self.fee_shares.store(0, Ordering::SeqCst);
    }

    fn expected_fee_shares(&self) -> (f64, f64) {
        let fee = self.fee_shares() as f64;
        let total = self.pool_shares() as f64 + fee;
        (total * self.pct, fee)
    }

    /// Fraction of the owed fee satisfied this cycle (smaller = more behind)
    pub fn progress(&self) -> f64 {
        let (expected, fee) = self.expected_fee_shares();
        if expected <= 0.0 {
            return 1.0;
        }
        fee / expected
    }

    /// Worker shares still owed; negative when the target is ahead
    pub fn share_diff(&self) -> i64 {
        let (expected, fee) = self.expected_fee_shares();
        (expected - fee).ceil() as i64
    }

    // Rounds

    pub fn completed_rounds(&self) -> u64 {
        self.completed_rounds.load(Ordering::SeqCst)
    }

    pub(crate) fn finish_round(&self) -> u64 {
        self.completed_rounds.fetch_add(1, Ordering::SeqCst) + 1
    }

    // Active diversions

    /// Is `worker` currently diverted to this target
    pub fn is_diverting(&self, worker: &WorkerId) -> bool {
        self.active.contains(worker)
    }

    pub fn active_diversions(&self) -> usize {
        self.active.len()
    }

    /// Snapshot of the workers currently diverted to this target
    pub fn diverted_workers(&self) -> Vec<WorkerId> {
        self.active.iter().map(|id| id.key().clone()).collect()
    }

    /// Force a worker out of its diversion; its monitor aborts on the next tick
    pub fn evict(&self, worker: &WorkerId) -> bool {
        self.active.remove(worker).is_some()
    }

    pub(crate) fn register_diversion(&self, worker: &WorkerId) {
        self.active.insert(worker.clone());
    }

    pub(crate) fn release_diversion(&self, worker: &WorkerId) {
        self.active.remove(worker);
    }
}

/// Log tag in the proxy's `[prefix][wallet][pct]` form
impl fmt::Display for FeeTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}][{}][{:.4}]", self.name_prefix, self.wallet, self.pct)
    }
}

impl fmt::Debug for FeeTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FeeTarget")
            .field("id", &self.id)
            .field("name_prefix", &self.name_prefix)
            .field("wallet", &self.wallet)
            .field("pct", &self.pct)
            .field("progress", &self.progress())
            .field("upstream_connected", &!self.is_upstream_disconnected())
            .finish()
    }
}
