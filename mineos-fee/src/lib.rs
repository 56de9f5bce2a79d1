//! MineOS Fee Scheduler
//!
//! Decides which fee destination of the stratum proxy is serviced next and
//! temporarily diverts connected workers to it.
//!
//! # Overview
//!
//! - Each round picks the connected fee target with the lowest progress
//! - The target's outstanding quota is clamped to the eligible workers
//! - Workers are ranked by their published score, best first
//! - One monitor task per selected worker waits for a credited fee share,
//!   then reverts the diversion on success, timeout, disconnection or shutdown
//! - Workers that time out are cooled down before they can be picked again
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use mineos_fee::{FeeConfig, FeeScheduler, InMemoryRegistry, WorkerSession};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = FeeConfig::load("fee.toml")?;
//!     let targets = config.build_targets()?;
//!
//!     let registry = Arc::new(InMemoryRegistry::new());
//!     registry.register(Arc::new(WorkerSession::with_score("wallet.rig1", 0.9)));
//!
//!     let scheduler = FeeScheduler::new(config.scheduler.clone(), registry.clone())?;
//!     let token = CancellationToken::new();
//!
//!     // Runs round after round until the token is cancelled
//!     scheduler.run(&token, &targets).await;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod monitor;
pub mod ranker;
pub mod registry;
pub mod scheduler;
pub mod target;
pub mod worker;

// Re-export main types
pub use config::{FeeConfig, FeeSchedulerConfig, FeeTargetConfig};
pub use error::{FeeError, Result};
pub use monitor::{AbortReason, DiversionLimits, DiversionOutcome, DiversionReport, DiversionState};
pub use ranker::{clamp_quota, rank_workers};
pub use registry::{InMemoryRegistry, WorkerRegistry};
pub use scheduler::{select_target, FeeScheduler, FeeStats, RoundSummary};
pub use target::{FeeTarget, FeeTargetId};
pub use worker::{FeeAttempt, WorkerId, WorkerSession};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
