use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AiError {
    #[error("invalid image: {reason}")]
    InvalidImage { reason: String },

    #[error("need at least 2 distinct labels to train, found {found}")]
    InsufficientClasses { found: usize },

    #[error("model vocabulary unusable: {0}")]
    UnknownVocabulary(String),

    #[error("model was trained with extractor {model}, engine uses {engine}")]
    ExtractorMismatch { model: String, engine: String },

    #[error("unreadable sample {path}: {reason}")]
    UnreadableSample { path: String, reason: String },

    #[error("training cancelled")]
    Cancelled,

    #[error("model file {path}: {source}")]
    ModelIo {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("model file {path} is malformed: {source}")]
    ModelFormat {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error(transparent)]
    Core(#[from] imgtag_core::CoreError),

    #[cfg(feature = "onnx")]
    #[error("onnx runtime: {0}")]
    Onnx(#[from] ort::Error),

    #[cfg(feature = "onnx")]
    #[error("onnx model: {0}")]
    OnnxModel(String),
}
