//! Shared fixtures for the host tests.

use std::io::Cursor;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;

use image::{ImageFormat, Rgb, RgbImage};
use imgtag_ai::{AiError, FeatureExtractor, Model, PixelPoolExtractor, SoftmaxClassifier, Vocabulary};
use imgtag_core::{CorrectionRecord, RetryPolicy, ServiceConfig, TrainConfig};
use imgtag_store::{MemoryMirror, Mirror, MirrorExport, MirrorTables, MirrorWrite, StoreError};

pub const RED: [u8; 3] = [230, 20, 20];
pub const BLUE: [u8; 3] = [20, 20, 230];

pub fn solid_png(rgb: [u8; 3]) -> Vec<u8> {
    let img = RgbImage::from_pixel(12, 12, Rgb(rgb));
    let mut out = Vec::new();
    img.write_to(&mut Cursor::new(&mut out), ImageFormat::Png)
        .unwrap();
    out
}

/// Untrained model over `labels` for the default pixel-pool extractor.
pub fn toy_model(labels: &[&str]) -> Model {
    let dim = PixelPoolExtractor::default().dim();
    let vocabulary = Vocabulary::from_labels(labels.iter().copied());
    let classes = vocabulary.len();
    Model::new(
        PixelPoolExtractor::default().id(),
        vocabulary,
        SoftmaxClassifier {
            dim,
            classes,
            weights: vec![0.0; classes * dim],
            bias: vec![0.0; classes],
        },
        0,
    )
}

/// Config rooted in a temp directory, with fast retries and a short fit.
pub fn config_in(dir: &std::path::Path) -> ServiceConfig {
    let images = dir.join("images");
    let fast = RetryPolicy {
        attempts: 2,
        backoff_ms: 1,
    };
    ServiceConfig {
        manifest: images.join("tags.tsv"),
        test_manifest: None,
        images_dir: images,
        model_path: dir.join("model.json"),
        mirror_path: dir.join("mirror.jsonl"),
        reconciliation_log: dir.join("reconcile.jsonl"),
        train: TrainConfig {
            epochs: 100,
            ..TrainConfig::default()
        },
        manifest_retry: fast,
        mirror_retry: fast,
        ..ServiceConfig::default()
    }
}

/// Mirror that rejects the next `failures` applies, then delegates.
pub struct FlakyMirror {
    pub inner: MemoryMirror,
    failures: AtomicU32,
    pub attempts: AtomicU32,
}

impl FlakyMirror {
    pub fn failing(failures: u32) -> Self {
        Self {
            inner: MemoryMirror::new(),
            failures: AtomicU32::new(failures),
            attempts: AtomicU32::new(0),
        }
    }

    pub fn down() -> Self {
        Self::failing(u32::MAX)
    }

    pub fn heal(&self) {
        self.failures.store(0, Ordering::SeqCst);
    }

    pub fn tables(&self) -> MirrorTables {
        self.inner.tables()
    }
}

impl Mirror for FlakyMirror {
    fn insert_sample(&self, path: &str, label: &str) -> Result<(), StoreError> {
        self.apply(&MirrorWrite::sample(path, label))
    }

    fn insert_prediction(&self, path: &str, label: &str, score: f32) -> Result<(), StoreError> {
        self.inner.insert_prediction(path, label, score)
    }

    fn record_correction(&self, correction: &CorrectionRecord) -> Result<(), StoreError> {
        self.inner.record_correction(correction)
    }

    fn sample_label(&self, path: &str) -> Result<Option<String>, StoreError> {
        self.inner.sample_label(path)
    }

    fn export(&self) -> Result<MirrorExport, StoreError> {
        self.inner.export()
    }

    fn apply(&self, write: &MirrorWrite) -> Result<(), StoreError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let left = self.failures.load(Ordering::SeqCst);
        if left > 0 {
            if left != u32::MAX {
                self.failures.store(left - 1, Ordering::SeqCst);
            }
            return Err(StoreError::MirrorUnavailable("connection refused".into()));
        }
        self.inner.apply(write)
    }
}

/// Pixel-pool extractor that sleeps on every image and tracks how many
/// extractions overlap.
pub struct SlowExtractor {
    inner: PixelPoolExtractor,
    delay: Duration,
    current: AtomicUsize,
    peak: AtomicUsize,
}

impl SlowExtractor {
    pub fn new(delay: Duration) -> Self {
        Self {
            inner: PixelPoolExtractor::default(),
            delay,
            current: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    /// Most extractions ever in flight at once.
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

impl FeatureExtractor for SlowExtractor {
    fn id(&self) -> &str {
        self.inner.id()
    }

    fn dim(&self) -> usize {
        self.inner.dim()
    }

    fn extract(&self, bytes: &[u8]) -> Result<Vec<f32>, AiError> {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        std::thread::sleep(self.delay);
        let features = self.inner.extract(bytes);
        self.current.fetch_sub(1, Ordering::SeqCst);
        features
    }
}
