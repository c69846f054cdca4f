//! Manifest → features → fitted model, with optional held-out evaluation.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use imgtag_core::{DuplicatePolicy, Manifest, ManifestEntry, ResolvedSample};
use tracing::{debug, info, warn};

use crate::AiError;
use crate::classifier::{CancelFlag, SoftmaxClassifier, TrainOptions};
use crate::evaluate::{EvaluationReport, Evaluator};
use crate::extractor::FeatureExtractor;
use crate::model::Model;
use crate::predict::PredictionEngine;
use crate::vocabulary::Vocabulary;

#[derive(Debug, Clone, PartialEq)]
pub struct TrainingSummary {
    /// Examples the head was fitted on.
    pub examples: usize,
    pub classes: usize,
    /// Manifest paths skipped because they could not be read or decoded.
    pub skipped: Vec<String>,
    /// Mean training log-loss of the fitted head.
    pub final_loss: f64,
    pub elapsed: Duration,
}

#[derive(Debug, Clone)]
pub struct TrainingRun {
    pub model: Model,
    pub summary: TrainingSummary,
    pub evaluation: Option<EvaluationReport>,
}

#[derive(Clone)]
pub struct TrainingPipeline {
    extractor: Arc<dyn FeatureExtractor>,
    image_root: PathBuf,
    options: TrainOptions,
    duplicate_policy: DuplicatePolicy,
    strict: bool,
    holdout: Option<PathBuf>,
    cancel: CancelFlag,
}

impl TrainingPipeline {
    /// Manifest paths are resolved against `image_root` unless absolute.
    pub fn new(extractor: Arc<dyn FeatureExtractor>, image_root: impl Into<PathBuf>) -> Self {
        Self {
            extractor,
            image_root: image_root.into(),
            options: TrainOptions::default(),
            duplicate_policy: DuplicatePolicy::default(),
            strict: false,
            holdout: None,
            cancel: CancelFlag::new(),
        }
    }

    pub fn with_options(mut self, options: TrainOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_duplicate_policy(mut self, policy: DuplicatePolicy) -> Self {
        self.duplicate_policy = policy;
        self
    }

    /// Fail on the first unreadable sample instead of skipping it.
    pub fn with_strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    /// Evaluate every trained model against this manifest.
    pub fn with_holdout(mut self, manifest: Option<PathBuf>) -> Self {
        self.holdout = manifest;
        self
    }

    pub fn with_cancel(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn extractor(&self) -> &Arc<dyn FeatureExtractor> {
        &self.extractor
    }

    pub fn image_root(&self) -> &Path {
        &self.image_root
    }

    pub fn train_manifest(&self, path: &Path) -> Result<TrainingRun, AiError> {
        let manifest = Manifest::load(path)?;
        info!(path = %path.display(), lines = manifest.len(), "training from manifest");
        self.train(&manifest)
    }

    /// Train from an already-read list of manifest lines.
    pub fn train_entries(&self, entries: &[ManifestEntry]) -> Result<TrainingRun, AiError> {
        self.train(&Manifest::new(entries.to_vec()))
    }

    fn train(&self, manifest: &Manifest) -> Result<TrainingRun, AiError> {
        let started = Instant::now();
        let mut samples = manifest.resolve(self.duplicate_policy);
        // Fit order is fixed by path so line order never changes the result.
        samples.sort_by(|a, b| (&a.path, &a.label).cmp(&(&b.path, &b.label)));

        let (features, labeled, skipped) = self.extract_all(&samples)?;

        let vocabulary = Vocabulary::from_labels(labeled.iter().map(|s| s.label.as_str()));
        if vocabulary.len() < 2 {
            return Err(AiError::InsufficientClasses {
                found: vocabulary.len(),
            });
        }
        let keys: Vec<usize> = labeled
            .iter()
            .map(|s| {
                vocabulary.key(&s.label).ok_or_else(|| {
                    AiError::UnknownVocabulary(format!("label {} missing from vocabulary", s.label))
                })
            })
            .collect::<Result<_, _>>()?;

        let classifier = SoftmaxClassifier::fit(
            &features,
            &keys,
            vocabulary.len(),
            &self.options,
            &self.cancel,
        )?;
        let final_loss = classifier.loss(&features, &keys);
        let model = Model::new(self.extractor.id(), vocabulary, classifier, features.len());

        let summary = TrainingSummary {
            examples: features.len(),
            classes: model.vocabulary.len(),
            skipped,
            final_loss,
            elapsed: started.elapsed(),
        };
        info!(
            examples = summary.examples,
            classes = summary.classes,
            skipped = summary.skipped.len(),
            final_loss = summary.final_loss,
            elapsed_ms = summary.elapsed.as_millis() as u64,
            "training finished"
        );

        let evaluation = match &self.holdout {
            Some(path) => {
                let report = self.evaluate_manifest(&model, path)?;
                report.log();
                Some(report)
            }
            None => None,
        };

        Ok(TrainingRun {
            model,
            summary,
            evaluation,
        })
    }

    /// Score `model` against the labeled lines of the manifest at `path`.
    pub fn evaluate_manifest(&self, model: &Model, path: &Path) -> Result<EvaluationReport, AiError> {
        let manifest = Manifest::load(path)?;
        let engine = PredictionEngine::new(Arc::clone(&self.extractor));
        let mut evaluator = Evaluator::new(&model.vocabulary);

        for sample in manifest.resolve(self.duplicate_policy) {
            let bytes = match self.read(&sample.path) {
                Ok(bytes) => bytes,
                Err(e) if !self.strict => {
                    warn!(path = %sample.path, error = %e, "skipping evaluation sample");
                    evaluator.skip();
                    continue;
                }
                Err(e) => return Err(e),
            };
            match engine.classify(model, &sample.path, &bytes) {
                Ok(prediction) => evaluator.record(&sample.label, &prediction),
                Err(AiError::InvalidImage { reason }) if !self.strict => {
                    warn!(path = %sample.path, reason = %reason, "skipping evaluation sample");
                    evaluator.skip();
                }
                Err(AiError::InvalidImage { reason }) => {
                    return Err(AiError::UnreadableSample {
                        path: sample.path,
                        reason,
                    });
                }
                Err(e) => return Err(e),
            }
        }
        Ok(evaluator.finish())
    }

    fn read(&self, manifest_path: &str) -> Result<Vec<u8>, AiError> {
        let p = Path::new(manifest_path);
        let full = if p.is_absolute() {
            p.to_path_buf()
        } else {
            self.image_root.join(p)
        };
        std::fs::read(&full).map_err(|e| AiError::UnreadableSample {
            path: manifest_path.to_string(),
            reason: e.to_string(),
        })
    }

    fn featurize(&self, sample: &ResolvedSample) -> Result<Vec<f32>, AiError> {
        let bytes = self.read(&sample.path)?;
        self.extractor
            .extract(&bytes)
            .map_err(|e| AiError::UnreadableSample {
                path: sample.path.clone(),
                reason: e.to_string(),
            })
    }

    #[allow(clippy::type_complexity)]
    fn extract_all<'a>(
        &self,
        samples: &'a [ResolvedSample],
    ) -> Result<(Vec<Vec<f32>>, Vec<&'a ResolvedSample>, Vec<String>), AiError> {
        let mut features = Vec::with_capacity(samples.len());
        let mut labeled = Vec::with_capacity(samples.len());
        let mut skipped = Vec::new();

        for sample in samples {
            if self.cancel.is_cancelled() {
                return Err(AiError::Cancelled);
            }
            match self.featurize(sample) {
                Ok(v) => {
                    debug!(path = %sample.path, label = %sample.label, "extracted features");
                    features.push(v);
                    labeled.push(sample);
                }
                Err(e) if self.strict => return Err(e),
                Err(e) => {
                    warn!(path = %sample.path, error = %e, "skipping unreadable sample");
                    skipped.push(sample.path.clone());
                }
            }
        }
        Ok((features, labeled, skipped))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extractor::PixelPoolExtractor;
    use crate::preprocess::tests::solid_png;

    const RED: [u8; 3] = [230, 20, 20];
    const BLUE: [u8; 3] = [20, 20, 230];

    fn write_images(dir: &Path) {
        std::fs::write(dir.join("img1.png"), solid_png(16, 16, RED)).unwrap();
        std::fs::write(dir.join("img2.png"), solid_png(16, 16, BLUE)).unwrap();
        std::fs::write(dir.join("img3.png"), solid_png(12, 20, [250, 40, 10])).unwrap();
        std::fs::write(dir.join("img4.png"), solid_png(20, 12, [10, 40, 250])).unwrap();
    }

    fn pipeline(dir: &Path) -> TrainingPipeline {
        TrainingPipeline::new(Arc::new(PixelPoolExtractor::default()), dir)
    }

    fn entries(pairs: &[(&str, &str)]) -> Vec<ManifestEntry> {
        pairs
            .iter()
            .map(|(p, l)| ManifestEntry::labeled(*p, *l))
            .collect()
    }

    #[test]
    fn two_labels_train_and_predict() {
        let tmp = tempfile::TempDir::new().unwrap();
        write_images(tmp.path());
        let run = pipeline(tmp.path())
            .train_entries(&entries(&[("img1.png", "toaster"), ("img2.png", "microwave")]))
            .unwrap();
        assert_eq!(run.model.vocabulary.labels(), ["microwave", "toaster"]);
        assert_eq!(run.summary.examples, 2);

        let engine = PredictionEngine::new(Arc::new(PixelPoolExtractor::default()));
        let bytes = std::fs::read(tmp.path().join("img1.png")).unwrap();
        let p = engine.classify(&run.model, "img1.png", &bytes).unwrap();
        assert_eq!(p.predicted_label, "toaster");
        assert_eq!(p.scores.len(), 2);
        assert!(p.score("toaster").unwrap() > p.score("microwave").unwrap());
        let sum: f32 = p.scores.iter().map(|(_, s)| s).sum();
        assert!((sum - 1.0).abs() < 1e-5);
    }

    #[test]
    fn single_label_is_insufficient() {
        let tmp = tempfile::TempDir::new().unwrap();
        write_images(tmp.path());
        let err = pipeline(tmp.path())
            .train_entries(&entries(&[("img1.png", "toaster"), ("img3.png", "toaster")]))
            .unwrap_err();
        assert!(matches!(err, AiError::InsufficientClasses { found: 1 }));
    }

    #[test]
    fn placeholders_are_not_training_data() {
        let tmp = tempfile::TempDir::new().unwrap();
        write_images(tmp.path());
        let mut lines = entries(&[("img1.png", "toaster")]);
        lines.push(ManifestEntry::unlabeled("img2.png"));
        let err = pipeline(tmp.path()).train_entries(&lines).unwrap_err();
        assert!(matches!(err, AiError::InsufficientClasses { found: 1 }));
    }

    #[test]
    fn shuffled_manifest_gives_same_model() {
        let tmp = tempfile::TempDir::new().unwrap();
        write_images(tmp.path());
        let pairs = [
            ("img1.png", "toaster"),
            ("img2.png", "microwave"),
            ("img3.png", "toaster"),
            ("img4.png", "microwave"),
        ];
        let mut reversed = pairs;
        reversed.reverse();

        let p = pipeline(tmp.path());
        let a = p.train_entries(&entries(&pairs)).unwrap();
        let b = p.train_entries(&entries(&reversed)).unwrap();
        let again = p.train_entries(&entries(&pairs)).unwrap();
        assert_eq!(a.model, b.model);
        assert_eq!(a.model, again.model);
    }

    #[test]
    fn missing_image_skipped_or_fatal() {
        let tmp = tempfile::TempDir::new().unwrap();
        write_images(tmp.path());
        let lines = entries(&[
            ("img1.png", "toaster"),
            ("img2.png", "microwave"),
            ("gone.png", "toaster"),
        ]);

        let run = pipeline(tmp.path()).train_entries(&lines).unwrap();
        assert_eq!(run.summary.skipped, vec!["gone.png".to_string()]);
        assert_eq!(run.summary.examples, 2);

        let err = pipeline(tmp.path())
            .with_strict(true)
            .train_entries(&lines)
            .unwrap_err();
        assert!(matches!(err, AiError::UnreadableSample { ref path, .. } if path == "gone.png"));
    }

    #[test]
    fn corrections_follow_duplicate_policy() {
        let tmp = tempfile::TempDir::new().unwrap();
        write_images(tmp.path());
        let lines = entries(&[
            ("img1.png", "toaster"),
            ("img2.png", "kettle"),
            ("img2.png", "microwave"),
        ]);

        let latest = pipeline(tmp.path()).train_entries(&lines).unwrap();
        assert_eq!(latest.summary.examples, 2);
        assert_eq!(latest.model.vocabulary.labels(), ["microwave", "toaster"]);

        let all = pipeline(tmp.path())
            .with_duplicate_policy(DuplicatePolicy::KeepAll)
            .train_entries(&lines)
            .unwrap();
        assert_eq!(all.summary.examples, 3);
        assert_eq!(all.model.vocabulary.len(), 3);
    }

    #[test]
    fn cancelled_pipeline_stops() {
        let tmp = tempfile::TempDir::new().unwrap();
        write_images(tmp.path());
        let cancel = CancelFlag::new();
        cancel.cancel();
        let err = pipeline(tmp.path())
            .with_cancel(cancel)
            .train_entries(&entries(&[("img1.png", "toaster"), ("img2.png", "microwave")]))
            .unwrap_err();
        assert!(matches!(err, AiError::Cancelled));
    }

    #[test]
    fn holdout_evaluation_from_files() {
        let tmp = tempfile::TempDir::new().unwrap();
        write_images(tmp.path());
        let train = tmp.path().join("tags.tsv");
        let test = tmp.path().join("test-tags.tsv");
        std::fs::write(&train, "img1.png\ttoaster\nimg2.png\tmicrowave\n").unwrap();
        std::fs::write(&test, "img3.png\ttoaster\nimg4.png\tmicrowave\nnope.png\ttoaster\n")
            .unwrap();

        let run = pipeline(tmp.path())
            .with_holdout(Some(test))
            .train_manifest(&train)
            .unwrap();
        let report = run.evaluation.unwrap();
        assert_eq!(report.evaluated(), 2);
        assert_eq!(report.skipped, 1);
        assert_eq!(report.micro_accuracy, 1.0);
        assert_eq!(report.per_class.len(), 2);
        assert!(report.samples[0].to_string().starts_with("Image: img3.png predicted as: toaster"));
    }
}
