use thiserror::Error;

/// Fee scheduler error types
#[derive(Error, Debug)]
pub enum FeeError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Fee target {name} has invalid percentage {pct} (expected 0 < pct < 1)")]
    InvalidFeePercentage { name: String, pct: f64 },

    #[error("Duplicate fee target name prefix: {0}")]
    DuplicateTarget(String),
}

pub type Result<T> = std::result::Result<T, FeeError>;
