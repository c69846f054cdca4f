use std::time::Duration;

use imgtag_ai::AiError;
use imgtag_store::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error(transparent)]
    Ai(#[from] AiError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("mirror write for {path} failed (manifest rolled back: {rolled_back}): {source}")]
    MirrorWrite {
        path: String,
        rolled_back: bool,
        source: StoreError,
    },

    #[error("manifest line for {path} kept, mirror write queued for reconciliation: {source}")]
    PartialWrite { path: String, source: StoreError },

    #[error("sample {path} is not in the manifest")]
    UnknownSample { path: String },

    #[error("no image file for {path} in the image store")]
    MissingImage { path: String },

    #[error("training timed out after {elapsed:?}")]
    TrainingTimeout { elapsed: Duration },

    #[error("a retraining job is already running")]
    RetrainInProgress,

    #[error("no trained model is loaded")]
    NoModel,

    #[error("background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}
