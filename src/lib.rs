//! # covgraph - Spatio-temporal graph forecasting of regional case counts
//!
//! Forecasts active cases per region with a physics-constrained graph
//! neural network:
//! - **graph**: gravity-law region similarity and degree-guaranteed edges
//! - **data**: CSV ingestion, normalized daily deltas, sliding windows
//! - **gnn**: graph attention + GRU forecaster with an SIR-style rollout
//! - **tensor**: candle parameter store, seeded initializers, host helpers
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use covgraph::core::ForecastConfig;
//! use covgraph::data::{load_dataset, DataPaths, DateRange, FeatureSet, SplitWindows};
//! use covgraph::gnn::{RegionRollout, Trainer};
//! use covgraph::graph::{build_graph, AffinityMatrix};
//! use std::path::Path;
//!
//! fn main() -> covgraph::Result<()> {
//!     let config = ForecastConfig::default();
//!     let paths = DataPaths {
//!         metadata: "uscounties.csv".into(),
//!         cases: "cases.csv".into(),
//!         daily: "daily.csv".into(),
//!     };
//!     let (dataset, _report) = load_dataset(&paths, &DateRange::default())?;
//!
//!     let affinity = AffinityMatrix::compute(&dataset.regions, &config.gravity)?;
//!     let built = build_graph(&affinity, &config.graph)?;
//!
//!     let features = FeatureSet::build(&dataset, &config.train.feature_channels)?;
//!     let splits = SplitWindows::build(&features, &dataset.active, &config.window)?;
//!     let normalizer = features.infected_normalizer();
//!     let train = RegionRollout::from_windows("train", &splits.train, &dataset.regions, 0, normalizer)?;
//!     let valid = RegionRollout::from_windows("validation", &splits.validation, &dataset.regions, 0, normalizer)?;
//!
//!     let mut trainer = Trainer::new(config, built.graph)?;
//!     trainer.fit(&[train], &[valid], Some(Path::new("best.ckpt")))?;
//!     Ok(())
//! }
//! ```

pub mod core;
pub mod data;
pub mod gnn;
pub mod graph;
pub mod tensor;

pub use core::error::{Error, Result};
