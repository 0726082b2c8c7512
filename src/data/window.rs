//! Sliding-window examples and train/validation/test splits.

use crate::core::{Error, Result};
use crate::data::features::{FeatureSet, FeatureTensor};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Configuration for windowing and splits.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    /// History length H
    pub history_window: usize,
    /// Forecast length P
    pub pred_window: usize,
    /// Stride between window starts
    pub slide_step: usize,
    /// Timesteps reserved for validation
    pub valid_window: usize,
    /// Timesteps reserved for test
    pub test_window: usize,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            history_window: 5,
            pred_window: 10,
            slide_step: 1,
            valid_window: 25,
            test_window: 25,
        }
    }
}

impl WindowConfig {
    pub fn validate(&self) -> Result<()> {
        if self.history_window == 0 || self.pred_window == 0 || self.slide_step == 0 {
            return Err(Error::InvalidConfig(
                "history_window, pred_window and slide_step must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Timesteps one window spans.
    pub fn span(&self) -> usize {
        self.history_window + self.pred_window
    }
}

/// One example: history of every region plus anchors and targets.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Window {
    /// First timestep of the history slice
    pub start: usize,
    /// One row per region: `series[i, start..start+H, :]` flattened, `H · F` wide
    pub history: Vec<Vec<f32>>,
    /// Normalized infected delta at the last history step, per region
    pub anchor_current: Vec<f32>,
    /// Raw cumulative infected count at the last history step, per region
    pub anchor_last: Vec<f32>,
    /// One row per region: the `P` normalized infected deltas after the history
    pub target: Vec<Vec<f32>>,
}

/// Windows produced from one contiguous series.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WindowSet {
    pub history_window: usize,
    pub pred_window: usize,
    pub num_features: usize,
    /// Timesteps the set was cut from
    pub timesteps: usize,
    pub windows: Vec<Window>,
}

impl WindowSet {
    pub fn len(&self) -> usize {
        self.windows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }

    /// Error out if a split the caller must use produced no windows.
    pub fn ensure_nonempty(&self, split: &str) -> Result<()> {
        if self.windows.is_empty() {
            return Err(Error::InsufficientHistory {
                split: split.to_string(),
                timesteps: self.timesteps,
                required: self.history_window + self.pred_window,
            });
        }
        Ok(())
    }
}

/// Slide a window of `history_window + pred_window` over the series.
///
/// Window starts are `0, stride, 2·stride, …` while `start + H + P <= T`.
/// A series shorter than `H + P` yields an empty set.
pub fn prep_data(
    series: &FeatureTensor,
    raw_cumulative: &[Vec<f64>],
    history_window: usize,
    pred_window: usize,
    slide_step: usize,
) -> Result<WindowSet> {
    if history_window == 0 || pred_window == 0 || slide_step == 0 {
        return Err(Error::InvalidConfig(
            "window lengths and stride must be positive".to_string(),
        ));
    }
    let (n, t, f) = (series.num_regions, series.num_timesteps, series.num_features);
    if raw_cumulative.len() != n || raw_cumulative.iter().any(|s| s.len() != t) {
        return Err(Error::ShapeMismatch(format!(
            "raw series must be {n} x {t} to match features"
        )));
    }

    let mut windows = Vec::new();
    let mut start = 0;
    while start + history_window + pred_window <= t {
        let last = start + history_window - 1;
        let mut history = vec![vec![0.0f32; history_window * f]; n];
        let mut target = vec![vec![0.0f32; pred_window]; n];
        let mut anchor_current = Vec::with_capacity(n);
        let mut anchor_last = Vec::with_capacity(n);

        for i in 0..n {
            for h in 0..history_window {
                for k in 0..f {
                    history[i][h * f + k] = series.get(i, start + h, k);
                }
            }
            for p in 0..pred_window {
                target[i][p] = series.get(i, start + history_window + p, 0);
            }
            anchor_current.push(series.get(i, last, 0));
            anchor_last.push(raw_cumulative[i][last] as f32);
        }

        windows.push(Window {
            start,
            history,
            anchor_current,
            anchor_last,
            target,
        });
        start += slide_step;
    }

    Ok(WindowSet {
        history_window,
        pred_window,
        num_features: f,
        timesteps: t,
        windows,
    })
}

/// Windows for the three chronological splits.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SplitWindows {
    pub train: WindowSet,
    pub validation: WindowSet,
    pub test: WindowSet,
}

impl SplitWindows {
    /// Split `[0, T−valid−test)`, `[T−valid−test, T−test)`, `[T−test, T)`
    /// and window each part with its own slice of raw active cases.
    pub fn build(features: &FeatureSet, raw_active: &[Vec<f64>], config: &WindowConfig) -> Result<Self> {
        config.validate()?;
        let t = features.tensor.num_timesteps;
        let test_start = t.saturating_sub(config.test_window);
        let valid_start = test_start.saturating_sub(config.valid_window);

        let cut = |start: usize, end: usize| -> Result<WindowSet> {
            let series = features.tensor.slice_time(start, end);
            let raw: Vec<Vec<f64>> = raw_active
                .iter()
                .map(|s| s[start.min(s.len())..end.min(s.len())].to_vec())
                .collect();
            prep_data(
                &series,
                &raw,
                config.history_window,
                config.pred_window,
                config.slide_step,
            )
        };

        let splits = Self {
            train: cut(0, valid_start)?,
            validation: cut(valid_start, test_start)?,
            test: cut(test_start, t)?,
        };

        for (name, set) in [
            ("train", &splits.train),
            ("validation", &splits.validation),
            ("test", &splits.test),
        ] {
            if set.is_empty() {
                warn!(
                    split = name,
                    timesteps = set.timesteps,
                    required = config.span(),
                    "Split too short for a single window"
                );
            }
        }
        info!(
            train = splits.train.len(),
            validation = splits.validation.len(),
            test = splits.test.len(),
            "Windowed splits"
        );
        Ok(splits)
    }
}
