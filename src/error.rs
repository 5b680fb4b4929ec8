use thiserror::Error;

/// Errors raised while configuring, training or checkpointing a forecaster.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ForecastError {
    #[error("invalid scaler type `{0}`")]
    UnknownScaler(String),

    #[error("invalid cell type `{0}`")]
    UnknownCellType(String),

    #[error("invalid diffusion loss type `{0}`")]
    UnknownLossType(String),

    #[error("invalid beta schedule `{0}`")]
    UnknownBetaSchedule(String),

    #[error("invalid lag configuration: {0}")]
    InvalidLags(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The predictor handed to `train_from` wraps a network that cannot seed
    /// the network built by this estimator.
    #[error("incompatible predictor: expected {expected}, found {found}")]
    IncompatiblePredictor { expected: String, found: String },

    #[error("non-finite {metric} {value} at epoch {epoch}")]
    NonFiniteLoss {
        metric: &'static str,
        epoch: usize,
        value: f64,
    },

    #[error("checkpoint `{path}`: {reason}")]
    Checkpoint { path: String, reason: String },

    #[error("series `{item_id}` has {found} target dimensions, expected {expected}")]
    DimensionMismatch {
        item_id: String,
        expected: usize,
        found: usize,
    },

    #[error("no training instance could be sampled from {num_entries} entries")]
    NoInstances { num_entries: usize },
}

pub type Result<T> = std::result::Result<T, ForecastError>;
