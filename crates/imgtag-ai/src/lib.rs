//! Transfer-learning core: a fixed feature extractor feeding a trainable
//! softmax-regression head, plus evaluation and single-sample prediction.

mod error;
pub use error::AiError;

pub mod classifier;
pub mod evaluate;
pub mod extractor;
pub mod model;
pub mod pipeline;
pub mod predict;
pub mod preprocess;
pub mod vocabulary;

pub use classifier::{CancelFlag, SoftmaxClassifier, TrainOptions};
pub use evaluate::{ClassLogLoss, EvaluationReport, Evaluator, SampleLine};
pub use extractor::{FeatureExtractor, PixelPoolExtractor};
pub use model::Model;
pub use pipeline::{TrainingPipeline, TrainingRun, TrainingSummary};
pub use predict::PredictionEngine;
pub use preprocess::Normalization;
pub use vocabulary::Vocabulary;

#[cfg(feature = "onnx")]
mod onnx;
#[cfg(feature = "onnx")]
pub use onnx::OnnxExtractor;
