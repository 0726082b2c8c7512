//! Core utilities and common types for covgraph.

pub mod config;
pub mod error;
pub mod types;

pub use config::ForecastConfig;
pub use error::{Error, Result};
pub use types::*;
