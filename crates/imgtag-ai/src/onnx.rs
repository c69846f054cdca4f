//! ONNX Runtime feature extractor for pretrained image networks.
//!
//! The network receives the preprocessed NHWC tensor `[1, 224, 224, 3]` and
//! the activations of one named output are used as the embedding. The
//! default output is the Inception pre-softmax layer.

use std::path::Path;
use std::sync::Mutex;

use ort::session::Session;
use ort::value::Tensor;
use tracing::info;

use crate::AiError;
use crate::extractor::FeatureExtractor;
use crate::preprocess::{CHANNELS, INPUT_SIZE, Normalization, preprocess};

pub const DEFAULT_OUTPUT: &str = "softmax2_pre_activation";

/// Embedding length used when the model does not declare a static shape.
const FALLBACK_DIM: usize = 1008;

pub struct OnnxExtractor {
    session: Mutex<Session>,
    id: String,
    /// Model and output part of `id`.
    base: String,
    input: String,
    output: String,
    dim: usize,
    norm: Normalization,
}

impl OnnxExtractor {
    /// Load `model.onnx` from `path`, reading embeddings from `output`
    /// (or [`DEFAULT_OUTPUT`]).
    pub fn load(path: &Path, output: Option<&str>) -> Result<Self, AiError> {
        if !path.exists() {
            return Err(AiError::ModelIo {
                path: path.to_path_buf(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "onnx model not found"),
            });
        }
        let session = Session::builder()?.commit_from_file(path)?;
        let output = output.unwrap_or(DEFAULT_OUTPUT).to_string();

        let input = session
            .inputs()
            .first()
            .map(|i| i.name().to_string())
            .ok_or_else(|| AiError::OnnxModel(format!("{} declares no inputs", path.display())))?;
        let dim = session
            .outputs()
            .iter()
            .find(|o| o.name() == output)
            .and_then(|o| infer_dim(o.dtype()))
            .unwrap_or(FALLBACK_DIM);

        let stem = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("model");
        let base = format!("onnx:{stem}:{output}");
        let norm = Normalization::default();

        info!(dim, model = %path.display(), output = %output, "loaded onnx extractor");
        Ok(Self {
            session: Mutex::new(session),
            id: format!("{base}:{norm}"),
            base,
            input,
            output,
            dim,
            norm,
        })
    }

    pub fn with_normalization(mut self, norm: Normalization) -> Self {
        self.norm = norm;
        self.id = format!("{}:{norm}", self.base);
        self
    }
}

impl FeatureExtractor for OnnxExtractor {
    fn id(&self) -> &str {
        &self.id
    }

    fn dim(&self) -> usize {
        self.dim
    }

    fn extract(&self, bytes: &[u8]) -> Result<Vec<f32>, AiError> {
        let tensor = preprocess(bytes, self.norm)?;
        let side = INPUT_SIZE as i64;
        let shape = [1, side, side, CHANNELS as i64];
        let input = Tensor::from_array((shape, tensor.data.into_boxed_slice()))?;

        let mut session = self.session.lock().unwrap_or_else(|e| e.into_inner());
        let outputs = session.run(ort::inputs![self.input.as_str() => input])?;
        let value = outputs
            .get(self.output.as_str())
            .ok_or_else(|| AiError::OnnxModel(format!("network has no output {}", self.output)))?;
        let (_, data) = value.try_extract_tensor::<f32>()?;
        if data.len() != self.dim {
            return Err(AiError::ExtractorMismatch {
                model: format!("{} ({} dims)", self.id, self.dim),
                engine: format!("network output ({} dims)", data.len()),
            });
        }
        Ok(data.to_vec())
    }
}

/// Last static dimension of a tensor output.
fn infer_dim(output_type: &ort::value::ValueType) -> Option<usize> {
    match output_type {
        ort::value::ValueType::Tensor { shape, .. } => shape
            .last()
            .and_then(|&d| if d > 0 { Some(d as usize) } else { None }),
        _ => None,
    }
}
