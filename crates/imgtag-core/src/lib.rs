pub mod config;
pub mod error;
pub mod manifest;
pub mod sample;
pub mod schema;

pub use config::{MirrorFailurePolicy, RetryPolicy, ServiceConfig, TrainConfig};
pub use error::CoreError;
pub use manifest::{DuplicatePolicy, Manifest, ManifestEntry, ResolvedSample};
pub use sample::{CorrectionRecord, Prediction, SampleState};
pub use schema::mirror;
