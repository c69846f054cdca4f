//! Trained model bundle: extractor identity, vocabulary, and classifier head.

use std::io::Write;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::AiError;
use crate::classifier::SoftmaxClassifier;
use crate::vocabulary::Vocabulary;

/// Bumped whenever the JSON layout changes incompatibly.
pub const MODEL_FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Model {
    pub format_version: u32,
    pub extractor_id: String,
    pub embedding_dim: usize,
    pub vocabulary: Vocabulary,
    pub classifier: SoftmaxClassifier,
    /// Number of examples the head was fitted on.
    pub trained_on: usize,
}

impl Model {
    pub fn new(
        extractor_id: impl Into<String>,
        vocabulary: Vocabulary,
        classifier: SoftmaxClassifier,
        trained_on: usize,
    ) -> Self {
        Self {
            format_version: MODEL_FORMAT_VERSION,
            extractor_id: extractor_id.into(),
            embedding_dim: classifier.dim,
            vocabulary,
            classifier,
            trained_on,
        }
    }

    /// Check that vocabulary and weights describe one consistent head.
    pub fn validate(&self) -> Result<(), AiError> {
        if self.format_version != MODEL_FORMAT_VERSION {
            return Err(AiError::UnknownVocabulary(format!(
                "unsupported model format {} (expected {MODEL_FORMAT_VERSION})",
                self.format_version
            )));
        }
        if self.vocabulary.is_empty() {
            return Err(AiError::UnknownVocabulary("empty vocabulary".into()));
        }
        if !self.vocabulary.is_canonical() {
            return Err(AiError::UnknownVocabulary(
                "vocabulary is not sorted and unique".into(),
            ));
        }
        if self.classifier.classes != self.vocabulary.len() {
            return Err(AiError::UnknownVocabulary(format!(
                "classifier has {} classes, vocabulary has {} labels",
                self.classifier.classes,
                self.vocabulary.len()
            )));
        }
        if self.classifier.dim != self.embedding_dim {
            return Err(AiError::UnknownVocabulary(format!(
                "classifier expects {} features, model declares {}",
                self.classifier.dim, self.embedding_dim
            )));
        }
        self.classifier.validate()
    }

    /// Per-label probabilities for one feature vector, in vocabulary order.
    pub fn scores(&self, features: &[f32]) -> Result<Vec<(String, f32)>, AiError> {
        self.validate()?;
        if features.len() != self.embedding_dim {
            return Err(AiError::ExtractorMismatch {
                model: format!("{} ({} dims)", self.extractor_id, self.embedding_dim),
                engine: format!("{} dims", features.len()),
            });
        }
        let probs = self.classifier.probabilities(features);
        Ok(self
            .vocabulary
            .labels()
            .iter()
            .cloned()
            .zip(probs)
            .collect())
    }

    pub fn save(&self, path: &Path) -> Result<(), AiError> {
        let io = |source| AiError::ModelIo {
            path: path.to_path_buf(),
            source,
        };
        let json = serde_json::to_string_pretty(self).map_err(|source| AiError::ModelFormat {
            path: path.to_path_buf(),
            source,
        })?;
        let dir = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        std::fs::create_dir_all(dir).map_err(io)?;

        // Write beside the target and rename, so a failed save leaves the
        // previous model intact.
        let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(io)?;
        tmp.write_all(json.as_bytes())
            .and_then(|_| tmp.as_file().sync_data())
            .map_err(io)?;
        tmp.persist(path).map_err(|e| io(e.error))?;
        info!(
            path = %path.display(),
            labels = self.vocabulary.len(),
            extractor = %self.extractor_id,
            "saved model"
        );
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self, AiError> {
        let text = std::fs::read_to_string(path).map_err(|source| AiError::ModelIo {
            path: path.to_path_buf(),
            source,
        })?;
        let model: Self = serde_json::from_str(&text).map_err(|source| AiError::ModelFormat {
            path: path.to_path_buf(),
            source,
        })?;
        model.validate()?;
        info!(
            path = %path.display(),
            labels = model.vocabulary.len(),
            extractor = %model.extractor_id,
            "loaded model"
        );
        Ok(model)
    }
}
