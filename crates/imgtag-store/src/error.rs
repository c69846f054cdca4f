use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("empty image payload for {0}")]
    EmptyPayload(String),

    #[error("invalid filename {0:?}")]
    InvalidFilename(String),

    #[error("invalid image {name}: {reason}")]
    InvalidImage { name: String, reason: String },

    #[error("field {0:?} cannot be written to the manifest")]
    InvalidField(String),

    #[error("manifest append to {path} failed after {attempts} attempts: {source}")]
    ManifestWrite {
        path: PathBuf,
        attempts: u32,
        source: std::io::Error,
    },

    #[error("cannot roll back {path}: {reason}")]
    Rollback { path: PathBuf, reason: String },

    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("arrow error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),

    #[error("mirror unavailable: {0}")]
    MirrorUnavailable(String),

    #[cfg(feature = "duckdb")]
    #[error("duckdb error: {0}")]
    DuckDb(#[from] ::duckdb::Error),

    #[error(transparent)]
    Core(#[from] imgtag_core::CoreError),
}

impl StoreError {
    pub(crate) fn io(path: impl Into<PathBuf>) -> impl FnOnce(std::io::Error) -> Self {
        let path = path.into();
        move |source| Self::Io { path, source }
    }
}
