//! Region Similarity Graph Module
//!
//! Builds the static spatial graph the forecaster attends over:
//! - Gravity-law affinity between every pair of regions
//! - Threshold / top-k / minimum-degree edge policy

pub mod builder;
pub mod gravity;

pub use builder::{build_graph, AdjacencyMap, Edge, GraphBuild, GraphConfig, RegionGraph};
pub use gravity::{gravity_score, haversine_km, AffinityMatrix, GravityConfig};
