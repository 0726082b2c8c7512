//! Error types for covgraph.

use thiserror::Error;

/// Result type alias for covgraph operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in covgraph operations.
#[derive(Error, Debug)]
pub enum Error {
    // Data errors
    #[error("Join of {source_name} produced no usable rows: {detail}")]
    DataJoin { source_name: String, detail: String },

    #[error("Malformed date in column '{column}': {value}")]
    MalformedDate { column: String, value: String },

    #[error("Insufficient history for {split} split: {timesteps} timesteps, need {required}")]
    InsufficientHistory {
        split: String,
        timesteps: usize,
        required: usize,
    },

    #[error("CSV error: {0}")]
    Csv(String),

    // Model errors
    #[error("Non-finite values after {stage} at timestep {step}")]
    NumericInstability { stage: String, step: usize },

    #[error("Shape mismatch: {0}")]
    ShapeMismatch(String),

    #[error("Tensor error: {0}")]
    Tensor(String),

    // Construction errors
    #[error("Region list is empty")]
    EmptyRegions,

    #[error("Unknown region: {0}")]
    UnknownRegion(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // Checkpoint errors
    #[error("Checkpoint corrupted: {0}")]
    CheckpointCorrupted(String),

    // Serialization errors
    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Deserialization error: {0}")]
    DeserializationError(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether the error only invalidates the current rollout/step rather
    /// than the whole run.
    pub fn is_step_local(&self) -> bool {
        matches!(self, Error::NumericInstability { .. })
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::SerializationError(err.to_string())
    }
}

impl From<bincode::Error> for Error {
    fn from(err: bincode::Error) -> Self {
        Error::SerializationError(err.to_string())
    }
}

impl From<candle_core::Error> for Error {
    fn from(err: candle_core::Error) -> Self {
        Error::Tensor(err.to_string())
    }
}

impl From<csv::Error> for Error {
    fn from(err: csv::Error) -> Self {
        Error::Csv(err.to_string())
    }
}
