//! Shared sample, prediction, and correction types.

use serde::{Deserialize, Serialize};

/// Lifecycle of a sample as recorded in the manifest.
///
/// `Unlabeled` → `Labeled` (first labeled line) → `Corrected` (any later
/// labeled line for the same path). There is no deletion state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SampleState {
    Unlabeled,
    Labeled,
    Corrected,
}

impl SampleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unlabeled => "unlabeled",
            Self::Labeled => "labeled",
            Self::Corrected => "corrected",
        }
    }
}

/// Classification result for a single sample.
///
/// `scores` holds one entry per vocabulary label, in vocabulary order, and
/// sums to 1.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub sample_path: String,
    pub scores: Vec<(String, f32)>,
    pub predicted_label: String,
    pub confidence: f32,
}

impl Prediction {
    /// Build a prediction from per-label scores, picking the argmax.
    ///
    /// Ties resolve to the earliest label in vocabulary order.
    pub fn from_scores(sample_path: impl Into<String>, scores: Vec<(String, f32)>) -> Self {
        let mut predicted_label = String::new();
        let mut confidence = f32::NEG_INFINITY;
        for (label, score) in &scores {
            if *score > confidence {
                confidence = *score;
                predicted_label.clone_from(label);
            }
        }
        if scores.is_empty() {
            confidence = 0.0;
        }
        Self {
            sample_path: sample_path.into(),
            scores,
            predicted_label,
            confidence,
        }
    }

    /// Score for `label`, if it is part of the vocabulary.
    pub fn score(&self, label: &str) -> Option<f32> {
        self.scores
            .iter()
            .find(|(l, _)| l == label)
            .map(|(_, s)| *s)
    }
}

/// A label correction for a previously classified sample.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CorrectionRecord {
    pub sample_path: String,
    pub old_label: Option<String>,
    pub new_label: String,
}
