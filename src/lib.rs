//! Stack per-date Sentinel-2 window crops into one timeseries archive per
//! (year, window) location, and write a manifest of the generated archives.

pub mod manifest;
pub mod metadata;
pub mod npz;
pub mod pipeline;
pub mod timeseries;

pub use manifest::ManifestRow;
pub use metadata::{LocationKey, SampleRecord};
pub use pipeline::{run, RunSummary, StackConfig};
pub use timeseries::{TimeseriesBundle, BANDS};
