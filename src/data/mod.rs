//! Data Module
//!
//! Prepares model inputs from raw regional case counts:
//! - CSV ingestion and source joining
//! - Normalized daily-delta features
//! - Sliding windows and chronological splits

pub mod features;
pub mod loader;
pub mod window;

pub use features::{
    first_difference, normalize_feature, FeatureChannel, FeatureSet, FeatureTensor, Normalizer,
};
pub use loader::{
    join_sources, load_dataset, parse_date, DataPaths, DateRange, JoinReport, RegionDataset,
};
pub use window::{prep_data, SplitWindows, Window, WindowConfig, WindowSet};
