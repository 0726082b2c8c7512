//! Graph Neural Network (GNN) Module
//!
//! Spatio-temporal case forecasting over the region graph:
//! - Graph attention encoder for spatial message passing
//! - GRU cell for temporal state
//! - SIR-style physics rollout from a learned rate
//! - Training driver with Adam and best-model checkpoints

pub mod attention;
pub mod checkpoint;
pub mod forecaster;
pub mod learner;
pub mod optim;
pub mod physics;
pub mod temporal;

pub use attention::{edge_softmax, EdgeIndex, EncoderStage, GatEncoder, GatHead, HeadMerge, MultiHeadGat};
pub use checkpoint::{Checkpoint, CHECKPOINT_VERSION};
pub use forecaster::{ForecastStage, ForecastTrace, Forecaster, ModelConfig, RateTrace};
pub use learner::{
    BatchMetrics, EpochMetrics, RegionForecast, RegionRollout, RolloutFailure, TrainConfig,
    Trainer,
};
pub use optim::{Adam, AdamParams, AdamState};
pub use physics::{rollout, sir_increments};
pub use temporal::GruCell;
