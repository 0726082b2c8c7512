//! Gravity-law similarity between regions.
//!
//! `weight = exp(-distance / r) / (|pop1^alpha - pop2^beta| + epsilon)`,
//! with the great-circle distance in kilometres.

use crate::core::{Error, Region, Result};
use serde::{Deserialize, Serialize};

/// Mean Earth radius in kilometres.
pub const EARTH_RADIUS_KM: f64 = 6371.0088;

/// Configuration for the gravity law.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GravityConfig {
    /// Distance decay scale (km)
    pub r: f64,
    /// Exponent applied to the source population
    pub alpha: f64,
    /// Exponent applied to the target population
    pub beta: f64,
    /// Denominator stabilizer
    pub epsilon: f64,
}

impl Default for GravityConfig {
    fn default() -> Self {
        Self {
            r: 1e5,
            alpha: 0.1,
            beta: 0.1,
            epsilon: 1e-5,
        }
    }
}

/// Great-circle distance in kilometres between two points given in degrees.
pub fn haversine_km(lat1: f64, lng1: f64, lat2: f64, lng2: f64) -> f64 {
    let (phi1, phi2) = (lat1.to_radians(), lat2.to_radians());
    let d_phi = (lat2 - lat1).to_radians();
    let d_lambda = (lng2 - lng1).to_radians();
    let a = (d_phi / 2.0).sin().powi(2) + phi1.cos() * phi2.cos() * (d_lambda / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_KM * a.sqrt().min(1.0).asin()
}

/// Gravity-law affinity between two regions. Larger means more similar.
///
/// Self-pairs are not special-cased: they score `1 / epsilon` when
/// `alpha == beta` and are excluded downstream.
pub fn gravity_score(a: &Region, b: &Region, config: &GravityConfig) -> f64 {
    let distance = haversine_km(a.latitude, a.longitude, b.latitude, b.longitude);
    let pop_a = (a.population as f64).powf(config.alpha);
    let pop_b = (b.population as f64).powf(config.beta);
    (-distance / config.r).exp() / ((pop_a - pop_b).abs() + config.epsilon)
}

/// Square region × region affinity table, indexed by node order.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AffinityMatrix {
    names: Vec<String>,
    scores: Vec<f64>,
}

impl AffinityMatrix {
    /// Score every ordered pair of regions.
    pub fn compute(regions: &[Region], config: &GravityConfig) -> Result<Self> {
        if regions.is_empty() {
            return Err(Error::EmptyRegions);
        }
        let n = regions.len();
        let mut scores = Vec::with_capacity(n * n);
        for a in regions {
            for b in regions {
                let score = gravity_score(a, b, config);
                if !score.is_finite() {
                    return Err(Error::InvalidConfig(format!(
                        "non-finite affinity between {} and {}; check coordinates and population",
                        a.name, b.name
                    )));
                }
                scores.push(score);
            }
        }
        Ok(Self {
            names: regions.iter().map(|r| r.name.clone()).collect(),
            scores,
        })
    }

    /// Build from precomputed scores (row-major, `n × n`).
    pub fn from_scores(names: Vec<String>, scores: Vec<f64>) -> Result<Self> {
        if names.is_empty() {
            return Err(Error::EmptyRegions);
        }
        if scores.len() != names.len() * names.len() {
            return Err(Error::ShapeMismatch(format!(
                "{} scores for {} regions",
                scores.len(),
                names.len()
            )));
        }
        if scores.iter().any(|s| !s.is_finite() || *s < 0.0) {
            return Err(Error::InvalidConfig(
                "affinity scores must be finite and non-negative".to_string(),
            ));
        }
        Ok(Self { names, scores })
    }

    /// Number of regions.
    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn get(&self, i: usize, j: usize) -> f64 {
        self.scores[i * self.names.len() + j]
    }

    pub fn name(&self, i: usize) -> &str {
        &self.names[i]
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// Largest score in the matrix.
    pub fn max_score(&self) -> f64 {
        self.scores.iter().cloned().fold(f64::NEG_INFINITY, f64::max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn regions() -> Vec<Region> {
        vec![
            Region::new("California", 36.7, -119.4, 39_500_000, 250.0),
            Region::new("Nevada", 38.8, -116.4, 3_100_000, 28.0),
            Region::new("Oregon", 43.8, -120.5, 4_200_000, 44.0),
            Region::new("Ghost", 40.0, -100.0, 0, 0.0),
        ]
    }

    #[test]
    fn test_haversine_known_distance() {
        // New York to Los Angeles is roughly 3936 km.
        let d = haversine_km(40.7128, -74.0060, 34.0522, -118.2437);
        assert!((d - 3936.0).abs() < 10.0, "got {}", d);
        assert_eq!(haversine_km(10.0, 20.0, 10.0, 20.0), 0.0);
    }

    #[test]
    fn test_gravity_symmetry() {
        let config = GravityConfig::default();
        let rs = regions();
        for a in &rs {
            for b in &rs {
                let ab = gravity_score(a, b, &config);
                let ba = gravity_score(b, a, &config);
                assert!((ab - ba).abs() <= 1e-12 * ab.abs().max(1.0));
            }
        }
    }

    #[test]
    fn test_self_affinity_dominates() {
        let matrix = AffinityMatrix::compute(&regions(), &GravityConfig::default()).unwrap();
        let max = matrix.max_score();
        for i in 0..matrix.len() {
            assert_eq!(matrix.get(i, i), max);
        }
        assert!((matrix.get(0, 0) - 1e5).abs() < 1e-6);
    }

    #[test]
    fn test_zero_population_is_finite() {
        let config = GravityConfig::default();
        let rs = regions();
        let s = gravity_score(&rs[3], &rs[0], &config);
        assert!(s.is_finite());
        assert!(s > 0.0);
    }

    #[test]
    fn test_non_finite_affinity_rejected() {
        let mut rs = regions();
        rs[1].latitude = f64::NAN;
        match AffinityMatrix::compute(&rs, &GravityConfig::default()) {
            Err(Error::InvalidConfig(msg)) => assert!(msg.contains("Nevada")),
            other => panic!("expected invalid config, got {:?}", other.map(|m| m.len())),
        }

        let names = vec!["a".to_string(), "b".to_string()];
        assert!(AffinityMatrix::from_scores(names.clone(), vec![1.0, f64::INFINITY, 1.0, 1.0]).is_err());
        assert!(AffinityMatrix::from_scores(names, vec![1.0, f64::NAN, 1.0, 1.0]).is_err());
    }

    #[test]
    fn test_empty_regions_rejected() {
        assert!(matches!(
            AffinityMatrix::compute(&[], &GravityConfig::default()),
            Err(Error::EmptyRegions)
        ));
    }
}
