//! Service layer: keeps the model, the tag manifest, and the relational
//! mirror consistent across classification, correction, and retraining.

mod error;
pub use error::ServiceError;

pub mod jobs;
pub mod service;
pub mod slot;
pub mod workflow;

pub use jobs::{RetrainHandle, RetrainStatus, Retrainer};
pub use service::ImageTagService;
pub use slot::ModelSlot;
pub use workflow::{Committed, CorrectionWorkflow};

#[cfg(test)]
pub(crate) mod testing;
