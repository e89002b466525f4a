//! Error types for the training engine.

use thiserror::Error;

/// Result type for engine operations.
pub type TrainerResult<T> = Result<T, TrainerError>;

/// Errors that can occur while driving a training or evaluation epoch.
#[derive(Debug, Error)]
pub enum TrainerError {
    /// Tensor operation failed
    #[error("Candle error: {0}")]
    Candle(#[from] candle_core::Error),

    /// The primary loss degenerated to NaN or infinity.
    ///
    /// Raised before any optimizer state is touched, so the run can be
    /// restarted from the last checkpoint without a corrupted step.
    #[error("Loss is {value}, stopping training at iteration {iteration}")]
    NonFiniteLoss { value: f64, iteration: usize },

    /// Lookup of a meter that was never created
    #[error("Unknown metric: {0}")]
    UnknownMetric(String),

    /// A global average was requested from a meter with no samples
    #[error("Metric {0} has no recorded samples")]
    EmptyMeter(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Collective communication failure
    #[error("Distributed error: {0}")]
    Distributed(String),

    /// Training error
    #[error("Training error: {0}")]
    Training(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl TrainerError {
    /// Create an invalid config error
    pub fn invalid_config(msg: impl Into<String>) -> Self {
        Self::InvalidConfig(msg.into())
    }

    /// Create a distributed communication error
    pub fn distributed(msg: impl Into<String>) -> Self {
        Self::Distributed(msg.into())
    }

    /// Create a training error
    pub fn training(msg: impl Into<String>) -> Self {
        Self::Training(msg.into())
    }
}
