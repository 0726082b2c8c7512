//! Run configuration.
//!
//! Every section has defaults, so a JSON file only needs the keys it
//! overrides.

use crate::core::{Error, Result};
use crate::data::WindowConfig;
use crate::gnn::{ModelConfig, TrainConfig};
use crate::graph::{GraphConfig, GravityConfig};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Complete configuration of a forecasting run.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ForecastConfig {
    pub gravity: GravityConfig,
    pub graph: GraphConfig,
    pub window: WindowConfig,
    pub model: ModelConfig,
    pub train: TrainConfig,
}

impl ForecastConfig {
    /// Width of one node's flattened history: `history_window × channels`.
    pub fn input_dim(&self) -> usize {
        self.window.history_window * self.train.feature_channels.len()
    }

    pub fn validate(&self) -> Result<()> {
        let g = &self.gravity;
        if !(g.r.is_finite() && g.r > 0.0) || !(g.epsilon.is_finite() && g.epsilon > 0.0) {
            return Err(Error::InvalidConfig(
                "gravity r and epsilon must be positive".to_string(),
            ));
        }
        if !g.alpha.is_finite() || !g.beta.is_finite() {
            return Err(Error::InvalidConfig(
                "gravity exponents must be finite".to_string(),
            ));
        }
        self.graph.validate()?;
        self.window.validate()?;
        self.model.validate()?;
        self.train.validate()?;
        Ok(())
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| Error::DeserializationError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn load_json(path: &Path) -> Result<Self> {
        Self::from_json(&fs::read_to_string(path)?)
    }

    pub fn save_json(&self, path: &Path) -> Result<()> {
        fs::write(path, self.to_json()?)?;
        Ok(())
    }
}
