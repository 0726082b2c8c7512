//! Daily-delta features with per-region normalization.

use crate::core::{Error, Result};
use crate::data::loader::RegionDataset;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Added to the standard deviation before dividing.
pub const NORMALIZE_EPSILON: f64 = 1e-5;

/// A dynamic node feature derived from the raw series.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FeatureChannel {
    /// Daily change in active cases
    Infected,
    /// Daily change in recovered cases
    Recovered,
    /// Daily change in susceptible population
    Susceptible,
}

impl FeatureChannel {
    fn raw_series(&self, dataset: &RegionDataset) -> Vec<Vec<f64>> {
        match self {
            FeatureChannel::Infected => dataset.active.clone(),
            FeatureChannel::Recovered => dataset.recovered.clone(),
            FeatureChannel::Susceptible => dataset.susceptible(),
        }
    }
}

/// Day-over-day change, with a zero at day 0.
pub fn first_difference(series: &[f64]) -> Vec<f64> {
    let mut out = Vec::with_capacity(series.len());
    if series.is_empty() {
        return out;
    }
    out.push(0.0);
    out.extend(series.windows(2).map(|w| w[1] - w[0]));
    out
}

/// Per-region mean and standard deviation of one feature.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Normalizer {
    pub mean: Vec<f64>,
    pub std: Vec<f64>,
}

impl Normalizer {
    /// Fit on one series per region (population standard deviation).
    pub fn fit(series: &[Vec<f64>]) -> Self {
        let mut mean = Vec::with_capacity(series.len());
        let mut std = Vec::with_capacity(series.len());
        for s in series {
            let n = s.len().max(1) as f64;
            let m = s.iter().sum::<f64>() / n;
            let var = s.iter().map(|x| (x - m).powi(2)).sum::<f64>() / n;
            mean.push(m);
            std.push(var.sqrt());
        }
        Self { mean, std }
    }

    pub fn num_regions(&self) -> usize {
        self.mean.len()
    }

    pub fn normalize(&self, region: usize, x: f64) -> f64 {
        (x - self.mean[region]) / (self.std[region] + NORMALIZE_EPSILON)
    }

    pub fn denormalize(&self, region: usize, z: f64) -> f64 {
        z * (self.std[region] + NORMALIZE_EPSILON) + self.mean[region]
    }

    pub fn normalize_series(&self, series: &[Vec<f64>]) -> Vec<Vec<f64>> {
        series
            .iter()
            .enumerate()
            .map(|(i, s)| s.iter().map(|&x| self.normalize(i, x)).collect())
            .collect()
    }
}

/// Normalize every region's series independently, returning the fitted stats.
pub fn normalize_feature(series: &[Vec<f64>]) -> (Vec<Vec<f64>>, Normalizer) {
    let normalizer = Normalizer::fit(series);
    (normalizer.normalize_series(series), normalizer)
}

/// Dense `regions × timesteps × features` tensor.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FeatureTensor {
    pub num_regions: usize,
    pub num_timesteps: usize,
    pub num_features: usize,
    data: Vec<f32>,
}

impl FeatureTensor {
    pub fn zeros(num_regions: usize, num_timesteps: usize, num_features: usize) -> Self {
        Self {
            num_regions,
            num_timesteps,
            num_features,
            data: vec![0.0; num_regions * num_timesteps * num_features],
        }
    }

    /// Stack per-channel `regions × timesteps` series along the feature axis.
    pub fn from_channels(channels: &[Vec<Vec<f64>>]) -> Result<Self> {
        let first = channels
            .first()
            .ok_or_else(|| Error::InvalidConfig("no feature channels".to_string()))?;
        let n = first.len();
        let t = first.first().map_or(0, |s| s.len());
        if channels
            .iter()
            .any(|c| c.len() != n || c.iter().any(|s| s.len() != t))
        {
            return Err(Error::ShapeMismatch(
                "feature channels differ in shape".to_string(),
            ));
        }
        let mut tensor = Self::zeros(n, t, channels.len());
        for (f, channel) in channels.iter().enumerate() {
            for (i, series) in channel.iter().enumerate() {
                for (step, &v) in series.iter().enumerate() {
                    tensor.set(i, step, f, v as f32);
                }
            }
        }
        Ok(tensor)
    }

    #[inline]
    fn offset(&self, region: usize, step: usize, feature: usize) -> usize {
        (region * self.num_timesteps + step) * self.num_features + feature
    }

    pub fn get(&self, region: usize, step: usize, feature: usize) -> f32 {
        self.data[self.offset(region, step, feature)]
    }

    pub fn set(&mut self, region: usize, step: usize, feature: usize, value: f32) {
        let o = self.offset(region, step, feature);
        self.data[o] = value;
    }

    /// Copy of timesteps `start..end` (clamped to the available range).
    pub fn slice_time(&self, start: usize, end: usize) -> Self {
        let end = end.min(self.num_timesteps);
        let start = start.min(end);
        let mut out = Self::zeros(self.num_regions, end - start, self.num_features);
        for i in 0..self.num_regions {
            for step in start..end {
                for f in 0..self.num_features {
                    out.set(i, step - start, f, self.get(i, step, f));
                }
            }
        }
        out
    }
}

/// Normalized delta features plus the statistics needed to undo them.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FeatureSet {
    pub channels: Vec<FeatureChannel>,
    pub tensor: FeatureTensor,
    /// One normalizer per channel, in channel order
    pub normalizers: Vec<Normalizer>,
}

impl FeatureSet {
    /// Build features for the requested channels. Channel 0 must be
    /// `Infected`: targets and anchors are read from it.
    pub fn build(dataset: &RegionDataset, channels: &[FeatureChannel]) -> Result<Self> {
        dataset.validate()?;
        if channels.first() != Some(&FeatureChannel::Infected) {
            return Err(Error::InvalidConfig(
                "first feature channel must be Infected".to_string(),
            ));
        }

        let mut normalized = Vec::with_capacity(channels.len());
        let mut normalizers = Vec::with_capacity(channels.len());
        for channel in channels {
            let deltas: Vec<Vec<f64>> = channel
                .raw_series(dataset)
                .iter()
                .map(|s| first_difference(s))
                .collect();
            let (values, normalizer) = normalize_feature(&deltas);
            debug!(?channel, regions = values.len(), "Normalized feature channel");
            normalized.push(values);
            normalizers.push(normalizer);
        }

        Ok(Self {
            channels: channels.to_vec(),
            tensor: FeatureTensor::from_channels(&normalized)?,
            normalizers,
        })
    }

    /// Normalizer of the infected-delta channel.
    pub fn infected_normalizer(&self) -> &Normalizer {
        &self.normalizers[0]
    }
}
