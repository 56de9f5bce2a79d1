use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{FeeError, Result};
use crate::monitor::DiversionLimits;
use crate::target::{FeeTarget, FeeTargetId};

/// One fee destination
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FeeTargetConfig {
    /// Wallet credited by the fee upstream
    pub wallet: String,

    /// Worker name prefix on the fee upstream
    pub name_prefix: String,

    /// Fraction of aggregate work to skim (0 < pct < 1)
    pub pct: f64,
}

/// Fee scheduler timing configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FeeSchedulerConfig {
    /// Delay between target selection attempts
    #[serde(default = "default_selection_interval_secs")]
    pub selection_interval_secs: u64,

    /// Delay between diversion health checks
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,

    /// Give up on a diversion without a credited share after this long
    #[serde(default = "default_diversion_timeout_secs")]
    pub diversion_timeout_secs: u64,

    /// Cooldown applied to a worker whose diversion timed out
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
}

impl Default for FeeSchedulerConfig {
    fn default() -> Self {
        Self {
            selection_interval_secs: default_selection_interval_secs(),
            poll_interval_secs: default_poll_interval_secs(),
            diversion_timeout_secs: default_diversion_timeout_secs(),
            cooldown_secs: default_cooldown_secs(),
        }
    }
}

impl FeeSchedulerConfig {
    pub fn selection_interval(&self) -> Duration {
        Duration::from_secs(self.selection_interval_secs)
    }

    pub fn diversion_limits(&self) -> DiversionLimits {
        DiversionLimits {
            poll_interval: Duration::from_secs(self.poll_interval_secs),
            timeout: Duration::from_secs(self.diversion_timeout_secs),
            cooldown: Duration::from_secs(self.cooldown_secs),
        }
    }

    pub fn validate(&self) -> Result<()> {
        let intervals = [
            ("selection_interval_secs", self.selection_interval_secs),
            ("poll_interval_secs", self.poll_interval_secs),
            ("diversion_timeout_secs", self.diversion_timeout_secs),
            ("cooldown_secs", self.cooldown_secs),
        ];
        for (name, value) in intervals {
            if value == 0 {
                return Err(FeeError::InvalidConfiguration(format!(
                    "{} must be greater than zero",
                    name
                )));
            }
        }
        Ok(())
    }
}

/// Fee configuration as loaded from the proxy's config file
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct FeeConfig {
    #[serde(default)]
    pub scheduler: FeeSchedulerConfig,

    #[serde(default)]
    pub targets: Vec<FeeTargetConfig>,
}

impl FeeConfig {
    /// Parse and validate a TOML document
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let config: FeeConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    pub fn validate(&self) -> Result<()> {
        self.scheduler.validate()?;

        let mut seen = HashSet::new();
        for target in &self.targets {
            if target.name_prefix.trim().is_empty() {
                return Err(FeeError::InvalidConfiguration(
                    "fee target name_prefix must not be empty".to_string(),
                ));
            }
            if target.wallet.trim().is_empty() {
                return Err(FeeError::InvalidConfiguration(format!(
                    "fee target {} has no wallet",
                    target.name_prefix
                )));
            }
            if !(target.pct > 0.0 && target.pct < 1.0) {
                return Err(FeeError::InvalidFeePercentage {
                    name: target.name_prefix.clone(),
                    pct: target.pct,
                });
            }
            if !seen.insert(target.name_prefix.as_str()) {
                return Err(FeeError::DuplicateTarget(target.name_prefix.clone()));
            }
        }
        Ok(())
    }

    /// Create one `FeeTarget` per configured destination, ids in list order
    pub fn build_targets(&self) -> Result<Vec<Arc<FeeTarget>>> {
        self.validate()?;
        let targets = self
            .targets
            .iter()
            .enumerate()
            .map(|(index, t)| {
                let id = u32::try_from(index).map_err(|_| {
                    FeeError::InvalidConfiguration("too many fee targets".to_string())
                })?;
                Ok(Arc::new(FeeTarget::new(
                    FeeTargetId(id),
                    t.wallet.clone(),
                    t.name_prefix.clone(),
                    t.pct,
                )))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(targets)
    }
}

// Default value functions for serde
fn default_selection_interval_secs() -> u64 { 8 }
fn default_poll_interval_secs() -> u64 { 2 }
fn default_diversion_timeout_secs() -> u64 { 120 }
fn default_cooldown_secs() -> u64 { 240 }
