//! Multinomial maximum-entropy classifier (softmax regression).
//!
//! Fitted with full-batch gradient descent and L2 regularisation. Weights
//! start from small seeded noise, so a fit is a pure function of the
//! examples, the options, and the seed.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use imgtag_core::TrainConfig;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::AiError;

#[derive(Debug, Clone, PartialEq)]
pub struct TrainOptions {
    pub epochs: usize,
    pub learning_rate: f32,
    pub l2: f32,
    pub seed: u64,
}

impl Default for TrainOptions {
    fn default() -> Self {
        Self::from(&TrainConfig::default())
    }
}

impl From<&TrainConfig> for TrainOptions {
    fn from(cfg: &TrainConfig) -> Self {
        Self {
            epochs: cfg.epochs,
            learning_rate: cfg.learning_rate,
            l2: cfg.l2,
            seed: cfg.seed,
        }
    }
}

/// Cooperative cancellation shared between a training job and its owner.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Row-major weights: class `c` owns `weights[c * dim..(c + 1) * dim]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SoftmaxClassifier {
    pub dim: usize,
    pub classes: usize,
    pub weights: Vec<f32>,
    pub bias: Vec<f32>,
}

impl SoftmaxClassifier {
    /// Fit on `x` (one feature row per example) with class keys `y`.
    pub fn fit(
        x: &[Vec<f32>],
        y: &[usize],
        classes: usize,
        options: &TrainOptions,
        cancel: &CancelFlag,
    ) -> Result<Self, AiError> {
        if classes < 2 {
            return Err(AiError::InsufficientClasses { found: classes });
        }
        let dim = x.first().map(Vec::len).unwrap_or(0);
        if x.len() != y.len() || x.iter().any(|row| row.len() != dim) {
            return Err(AiError::UnknownVocabulary(
                "inconsistent training rows".into(),
            ));
        }
        if let Some(&bad) = y.iter().find(|&&k| k >= classes) {
            return Err(AiError::UnknownVocabulary(format!(
                "class key {bad} outside vocabulary of {classes}"
            )));
        }

        let mut rng = StdRng::seed_from_u64(options.seed);
        let mut model = Self {
            dim,
            classes,
            weights: (0..classes * dim)
                .map(|_| (rng.random::<f32>() - 0.5) * 0.01)
                .collect(),
            bias: vec![0.0; classes],
        };

        let n = x.len().max(1) as f32;
        let lr = options.learning_rate;
        let l2 = options.l2.max(0.0);
        let mut grad_w = vec![0.0f32; model.weights.len()];
        let mut grad_b = vec![0.0f32; classes];

        for epoch in 0..options.epochs {
            if cancel.is_cancelled() {
                debug!(epoch, "fit cancelled");
                return Err(AiError::Cancelled);
            }
            grad_w.fill(0.0);
            grad_b.fill(0.0);
            for (row, &target) in x.iter().zip(y) {
                let probs = model.probabilities(row);
                for (c, p) in probs.iter().enumerate() {
                    let diff = p - if c == target { 1.0 } else { 0.0 };
                    let base = c * dim;
                    for (g, v) in grad_w[base..base + dim].iter_mut().zip(row) {
                        *g += diff * v;
                    }
                    grad_b[c] += diff;
                }
            }
            for (w, g) in model.weights.iter_mut().zip(&grad_w) {
                *w -= lr * (g / n + l2 * *w);
            }
            for (b, g) in model.bias.iter_mut().zip(&grad_b) {
                *b -= lr * g / n;
            }
        }

        Ok(model)
    }

    pub fn logits(&self, features: &[f32]) -> Vec<f32> {
        (0..self.classes)
            .map(|c| {
                let base = c * self.dim;
                self.weights[base..base + self.dim]
                    .iter()
                    .zip(features)
                    .fold(self.bias[c], |acc, (w, v)| acc + w * v)
            })
            .collect()
    }

    /// Class probabilities in key order; they sum to 1.
    pub fn probabilities(&self, features: &[f32]) -> Vec<f32> {
        softmax(&self.logits(features))
    }

    /// Mean cross-entropy over the examples.
    pub fn loss(&self, x: &[Vec<f32>], y: &[usize]) -> f64 {
        if x.is_empty() {
            return 0.0;
        }
        let total: f64 = x
            .iter()
            .zip(y)
            .map(|(row, &t)| -f64::from(self.probabilities(row)[t]).max(f64::MIN_POSITIVE).ln())
            .sum();
        total / x.len() as f64
    }

    /// Check that weight and bias lengths agree with `classes` and `dim`.
    pub fn validate(&self) -> Result<(), AiError> {
        if self.weights.len() != self.classes * self.dim {
            return Err(AiError::UnknownVocabulary(format!(
                "weights hold {} values, expected {} x {}",
                self.weights.len(),
                self.classes,
                self.dim
            )));
        }
        if self.bias.len() != self.classes {
            return Err(AiError::UnknownVocabulary(format!(
                "bias holds {} values, expected {}",
                self.bias.len(),
                self.classes
            )));
        }
        Ok(())
    }
}

/// Numerically stable softmax.
pub fn softmax(logits: &[f32]) -> Vec<f32> {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = logits.iter().map(|l| (l - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    if sum <= 0.0 || !sum.is_finite() {
        return vec![1.0 / logits.len().max(1) as f32; logits.len()];
    }
    exps.into_iter().map(|e| e / sum).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blobs() -> (Vec<Vec<f32>>, Vec<usize>) {
        let x = vec![
            vec![1.0, 0.1],
            vec![0.9, -0.1],
            vec![1.1, 0.0],
            vec![-1.0, 0.0],
            vec![-0.9, 0.2],
            vec![-1.2, -0.1],
        ];
        let y = vec![0, 0, 0, 1, 1, 1];
        (x, y)
    }

    #[test]
    fn softmax_sums_to_one() {
        let p = softmax(&[1.0, 2.0, 3.0]);
        assert!((p.iter().sum::<f32>() - 1.0).abs() < 1e-6);
        assert!(p[2] > p[1] && p[1] > p[0]);
        let big = softmax(&[1000.0, 0.0]);
        assert!((big[0] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn fit_separates_blobs() {
        let (x, y) = blobs();
        let clf = SoftmaxClassifier::fit(&x, &y, 2, &TrainOptions::default(), &CancelFlag::new())
            .unwrap();
        clf.validate().unwrap();
        assert!(clf.probabilities(&[1.0, 0.0])[0] > 0.9);
        assert!(clf.probabilities(&[-1.0, 0.0])[1] > 0.9);
        assert!(clf.loss(&x, &y) < 0.1);
    }

    #[test]
    fn fit_is_reproducible() {
        let (x, y) = blobs();
        let opts = TrainOptions::default();
        let a = SoftmaxClassifier::fit(&x, &y, 2, &opts, &CancelFlag::new()).unwrap();
        let b = SoftmaxClassifier::fit(&x, &y, 2, &opts, &CancelFlag::new()).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn single_class_rejected() {
        let err = SoftmaxClassifier::fit(
            &[vec![1.0]],
            &[0],
            1,
            &TrainOptions::default(),
            &CancelFlag::new(),
        )
        .unwrap_err();
        assert!(matches!(err, AiError::InsufficientClasses { found: 1 }));
    }

    #[test]
    fn cancelled_before_first_epoch() {
        let (x, y) = blobs();
        let cancel = CancelFlag::new();
        cancel.cancel();
        let err = SoftmaxClassifier::fit(&x, &y, 2, &TrainOptions::default(), &cancel).unwrap_err();
        assert!(matches!(err, AiError::Cancelled));
    }

    #[test]
    fn validate_catches_shape_mismatch() {
        let clf = SoftmaxClassifier {
            dim: 3,
            classes: 2,
            weights: vec![0.0; 5],
            bias: vec![0.0; 2],
        };
        assert!(matches!(clf.validate(), Err(AiError::UnknownVocabulary(_))));
    }
}
