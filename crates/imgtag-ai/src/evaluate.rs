//! Held-out evaluation: log-loss, per-class log-loss, and accuracy.

use std::fmt;
use std::path::Path;

use imgtag_core::Prediction;
use tracing::info;

use crate::vocabulary::Vocabulary;

/// Probabilities are clamped to `[EPSILON, 1]` before taking the log.
pub const EPSILON: f64 = 1e-15;

/// One evaluated sample, printed as the classic report line.
#[derive(Debug, Clone, PartialEq)]
pub struct SampleLine {
    pub path: String,
    pub expected: String,
    pub predicted: String,
    pub score: f32,
}

impl fmt::Display for SampleLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let file = Path::new(&self.path)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(&self.path);
        write!(
            f,
            "Image: {file} predicted as: {} with score: {}",
            self.predicted, self.score
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClassLogLoss {
    pub label: String,
    /// Mean log-loss over samples of this class; 0 when `support` is 0.
    pub log_loss: f64,
    pub support: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EvaluationReport {
    pub log_loss: f64,
    /// One entry per vocabulary label, in vocabulary order.
    pub per_class: Vec<ClassLogLoss>,
    pub micro_accuracy: f64,
    /// Mean per-class accuracy over classes with support.
    pub macro_accuracy: f64,
    pub samples: Vec<SampleLine>,
    /// Samples whose expected label is not in the vocabulary.
    pub unknown_labels: usize,
    /// Samples that could not be read or decoded.
    pub skipped: usize,
}

impl EvaluationReport {
    pub fn evaluated(&self) -> usize {
        self.samples.len()
    }

    /// Emit the report through `tracing`.
    pub fn log(&self) {
        for line in &self.samples {
            info!("{line}");
        }
        info!(
            log_loss = self.log_loss,
            micro_accuracy = self.micro_accuracy,
            macro_accuracy = self.macro_accuracy,
            evaluated = self.evaluated(),
            skipped = self.skipped,
            "evaluation finished"
        );
        for class in &self.per_class {
            info!(label = %class.label, log_loss = class.log_loss, support = class.support, "per-class log-loss");
        }
    }
}

impl fmt::Display for EvaluationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for line in &self.samples {
            writeln!(f, "{line}")?;
        }
        writeln!(f, "LogLoss: {:.4}", self.log_loss)?;
        writeln!(f, "PerClassLogLoss:")?;
        for class in &self.per_class {
            writeln!(
                f,
                "  {}: {:.4} (n={})",
                class.label, class.log_loss, class.support
            )?;
        }
        writeln!(f, "MicroAccuracy: {:.4}", self.micro_accuracy)?;
        write!(f, "MacroAccuracy: {:.4}", self.macro_accuracy)
    }
}

/// Accumulates predictions against expected labels.
pub struct Evaluator {
    vocabulary: Vocabulary,
    loss_sum: f64,
    class_loss: Vec<f64>,
    class_total: Vec<usize>,
    class_correct: Vec<usize>,
    correct: usize,
    unknown_labels: usize,
    skipped: usize,
    samples: Vec<SampleLine>,
}

impl Evaluator {
    pub fn new(vocabulary: &Vocabulary) -> Self {
        let k = vocabulary.len();
        Self {
            vocabulary: vocabulary.clone(),
            loss_sum: 0.0,
            class_loss: vec![0.0; k],
            class_total: vec![0; k],
            class_correct: vec![0; k],
            correct: 0,
            unknown_labels: 0,
            skipped: 0,
            samples: Vec::new(),
        }
    }

    pub fn record(&mut self, expected: &str, prediction: &Prediction) {
        let p = prediction.score(expected).map(f64::from).unwrap_or(0.0);
        let loss = -p.clamp(EPSILON, 1.0).ln();
        self.loss_sum += loss;

        let hit = prediction.predicted_label == expected;
        if hit {
            self.correct += 1;
        }
        match self.vocabulary.key(expected) {
            Some(k) => {
                self.class_loss[k] += loss;
                self.class_total[k] += 1;
                if hit {
                    self.class_correct[k] += 1;
                }
            }
            None => self.unknown_labels += 1,
        }

        self.samples.push(SampleLine {
            path: prediction.sample_path.clone(),
            expected: expected.to_string(),
            predicted: prediction.predicted_label.clone(),
            score: prediction.confidence,
        });
    }

    pub fn skip(&mut self) {
        self.skipped += 1;
    }

    pub fn finish(self) -> EvaluationReport {
        let n = self.samples.len();
        let ratio = |num: f64, den: usize| if den == 0 { 0.0 } else { num / den as f64 };

        let per_class = self
            .vocabulary
            .labels()
            .iter()
            .enumerate()
            .map(|(k, label)| ClassLogLoss {
                label: label.clone(),
                log_loss: ratio(self.class_loss[k], self.class_total[k]),
                support: self.class_total[k],
            })
            .collect();

        let supported: Vec<f64> = self
            .class_total
            .iter()
            .zip(&self.class_correct)
            .filter(|(total, _)| **total > 0)
            .map(|(total, correct)| *correct as f64 / *total as f64)
            .collect();

        EvaluationReport {
            log_loss: ratio(self.loss_sum, n),
            per_class,
            micro_accuracy: ratio(self.correct as f64, n),
            macro_accuracy: ratio(supported.iter().sum(), supported.len()),
            samples: self.samples,
            unknown_labels: self.unknown_labels,
            skipped: self.skipped,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pred(path: &str, cat: f32) -> Prediction {
        Prediction::from_scores(
            path,
            vec![("cat".to_string(), cat), ("dog".to_string(), 1.0 - cat)],
        )
    }

    #[test]
    fn perfect_predictions() {
        let vocab = Vocabulary::from_labels(["cat", "dog"]);
        let mut ev = Evaluator::new(&vocab);
        ev.record("cat", &pred("a.jpg", 1.0));
        ev.record("dog", &pred("b.jpg", 0.0));
        let report = ev.finish();
        assert!(report.log_loss.abs() < 1e-9);
        assert_eq!(report.micro_accuracy, 1.0);
        assert_eq!(report.macro_accuracy, 1.0);
    }

    #[test]
    fn log_loss_and_per_class() {
        let vocab = Vocabulary::from_labels(["cat", "dog"]);
        let mut ev = Evaluator::new(&vocab);
        ev.record("cat", &pred("a.jpg", 0.5));
        ev.record("cat", &pred("b.jpg", 0.25));
        ev.record("dog", &pred("c.jpg", 0.25));
        let report = ev.finish();

        let (ln2, ln4, ln4_3) = (2f64.ln(), 4f64.ln(), (4.0f64 / 3.0).ln());
        assert!((report.log_loss - (ln2 + ln4 + ln4_3) / 3.0).abs() < 1e-6);

        assert_eq!(report.per_class[0].label, "cat");
        assert_eq!(report.per_class[0].support, 2);
        assert!((report.per_class[0].log_loss - (ln2 + ln4) / 2.0).abs() < 1e-6);
        assert!((report.per_class[1].log_loss - ln4_3).abs() < 1e-6);

        // a.jpg ties and resolves to cat; b.jpg misses; c.jpg hits.
        assert!((report.micro_accuracy - 2.0 / 3.0).abs() < 1e-9);
        assert!((report.macro_accuracy - 0.75).abs() < 1e-9);
    }

    #[test]
    fn zero_probability_is_clamped() {
        let vocab = Vocabulary::from_labels(["cat", "dog"]);
        let mut ev = Evaluator::new(&vocab);
        ev.record("dog", &pred("a.jpg", 1.0));
        let report = ev.finish();
        assert!((report.log_loss - (-EPSILON.ln())).abs() < 1e-9);
    }

    #[test]
    fn unknown_label_counts_as_miss() {
        let vocab = Vocabulary::from_labels(["cat", "dog"]);
        let mut ev = Evaluator::new(&vocab);
        ev.record("bird", &pred("a.jpg", 0.9));
        ev.skip();
        let report = ev.finish();
        assert_eq!(report.unknown_labels, 1);
        assert_eq!(report.skipped, 1);
        assert_eq!(report.micro_accuracy, 0.0);
        assert_eq!(report.macro_accuracy, 0.0);
        assert!(report.per_class.iter().all(|c| c.support == 0));
    }

    #[test]
    fn sample_line_format() {
        let line = SampleLine {
            path: "assets/images/toaster2.png".into(),
            expected: "toaster".into(),
            predicted: "toaster".into(),
            score: 0.5,
        };
        assert_eq!(
            line.to_string(),
            "Image: toaster2.png predicted as: toaster with score: 0.5"
        );
    }
}
