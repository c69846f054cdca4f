//! Ingestion and correction: every labeled write extends the manifest and
//! the mirror together, or reports exactly which side failed.
//!
//! The manifest lock is held across both phases. If the mirror write fails
//! the freshly appended line is either truncated away (`RollBack`) or kept
//! and the mirror write queued in the reconciliation log (`Reconcile`).

use std::sync::Arc;

use imgtag_core::{
    CorrectionRecord, ManifestEntry, MirrorFailurePolicy, RetryPolicy, SampleState, ServiceConfig,
};
use imgtag_store::{
    AppendReceipt, ImageStore, ManifestGuard, ManifestStore, Mirror, MirrorWrite, PredictionFact,
    ReconcileLog, ReplayOutcome, StoreError,
};
use tracing::{error, info, warn};

use crate::ServiceError;

/// A manifest line that is durable (and mirrored, when labeled).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Committed {
    pub path: String,
    pub label: Option<String>,
    pub state: SampleState,
}

pub struct CorrectionWorkflow {
    manifest: Arc<ManifestStore>,
    images: ImageStore,
    mirror: Arc<dyn Mirror>,
    reconcile: ReconcileLog,
    mirror_retry: RetryPolicy,
    failure_policy: MirrorFailurePolicy,
}

impl CorrectionWorkflow {
    pub fn new(
        manifest: Arc<ManifestStore>,
        images: ImageStore,
        mirror: Arc<dyn Mirror>,
        reconcile: ReconcileLog,
    ) -> Self {
        Self {
            manifest,
            images,
            mirror,
            reconcile,
            mirror_retry: RetryPolicy::default(),
            failure_policy: MirrorFailurePolicy::default(),
        }
    }

    /// Open the manifest, image directory, and reconciliation log named by
    /// `config`.
    pub fn open(config: &ServiceConfig, mirror: Arc<dyn Mirror>) -> Result<Self, ServiceError> {
        let manifest = ManifestStore::open(&config.manifest)?.with_retry(config.manifest_retry);
        let images = ImageStore::open(&config.images_dir)?;
        let reconcile = ReconcileLog::open(&config.reconciliation_log)?;
        Ok(Self::new(Arc::new(manifest), images, mirror, reconcile)
            .with_mirror_retry(config.mirror_retry)
            .with_failure_policy(config.mirror_failure_policy))
    }

    pub fn with_mirror_retry(mut self, retry: RetryPolicy) -> Self {
        self.mirror_retry = retry;
        self
    }

    pub fn with_failure_policy(mut self, policy: MirrorFailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    pub fn manifest(&self) -> &Arc<ManifestStore> {
        &self.manifest
    }

    pub fn images(&self) -> &ImageStore {
        &self.images
    }

    pub fn mirror(&self) -> &Arc<dyn Mirror> {
        &self.mirror
    }

    pub fn reconcile_log(&self) -> &ReconcileLog {
        &self.reconcile
    }

    /// Append `path<TAB>label` and record the sample (and the prediction
    /// score, if any) in the mirror.
    pub fn add_labeled_sample(
        &self,
        path: &str,
        label: &str,
        prediction_score: Option<f32>,
    ) -> Result<Committed, ServiceError> {
        self.require_image(path)?;
        let mut guard = self.manifest.lock();
        let previous = guard.snapshot()?.state(path);

        let receipt = guard.append(&ManifestEntry::labeled(path, label))?;
        let write = MirrorWrite {
            prediction: prediction_score.map(|score| PredictionFact {
                label: label.to_string(),
                score,
            }),
            ..MirrorWrite::sample(path, label)
        };
        self.commit_mirror(&mut guard, &receipt, &write)?;

        let state = match previous {
            Some(SampleState::Labeled | SampleState::Corrected) => SampleState::Corrected,
            _ => SampleState::Labeled,
        };
        info!(path, label, state = state.as_str(), "sample labeled");
        Ok(Committed {
            path: path.to_string(),
            label: Some(label.to_string()),
            state,
        })
    }

    /// Append a corrected label for a sample already in the manifest and
    /// record the change in the mirror's audit trail.
    pub fn correct_label(
        &self,
        path: &str,
        new_label: &str,
    ) -> Result<CorrectionRecord, ServiceError> {
        let mut guard = self.manifest.lock();
        let manifest = guard.snapshot()?;
        if manifest.state(path).is_none() {
            return Err(ServiceError::UnknownSample {
                path: path.to_string(),
            });
        }
        self.require_image(path)?;
        let record = CorrectionRecord {
            sample_path: path.to_string(),
            old_label: manifest.current_label(path).map(str::to_string),
            new_label: new_label.to_string(),
        };

        let receipt = guard.append(&ManifestEntry::labeled(path, new_label))?;
        let write = MirrorWrite {
            correction: Some(record.clone()),
            ..MirrorWrite::sample(path, new_label)
        };
        self.commit_mirror(&mut guard, &receipt, &write)?;

        info!(
            path,
            old = record.old_label.as_deref().unwrap_or("-"),
            new = new_label,
            "label corrected"
        );
        Ok(record)
    }

    /// Store an uploaded image and register it as unlabeled. The mirror only
    /// holds labeled facts, so it is not touched.
    pub fn ingest_unlabeled(&self, bytes: &[u8], filename: &str) -> Result<Committed, ServiceError> {
        let path = self.images.store(filename, bytes)?;
        let mut guard = self.manifest.lock();
        let previous = guard.snapshot()?.state(&path);
        guard.append(&ManifestEntry::unlabeled(path.as_str()))?;
        let state = previous.unwrap_or(SampleState::Unlabeled);
        info!(path = %path, state = state.as_str(), "sample ingested");
        Ok(Committed {
            path,
            label: None,
            state,
        })
    }

    /// Store an uploaded image together with its label.
    pub fn ingest_labeled(
        &self,
        bytes: &[u8],
        filename: &str,
        label: &str,
    ) -> Result<Committed, ServiceError> {
        let path = self.images.store(filename, bytes)?;
        self.add_labeled_sample(&path, label, None)
    }

    /// Replay mirror writes queued by earlier partial failures.
    ///
    /// Runs under the manifest lock so no label can change mid-replay.
    pub fn reconcile(&self) -> Result<ReplayOutcome, ServiceError> {
        let guard = self.manifest.lock();
        let manifest = guard.snapshot()?;
        Ok(self.reconcile.replay(self.mirror.as_ref(), &manifest)?)
    }

    /// Every manifest line must name a readable file in the image store.
    fn require_image(&self, path: &str) -> Result<(), ServiceError> {
        if self.images.resolve(path).is_file() {
            Ok(())
        } else {
            Err(ServiceError::MissingImage {
                path: path.to_string(),
            })
        }
    }

    fn commit_mirror(
        &self,
        guard: &mut ManifestGuard<'_>,
        receipt: &AppendReceipt,
        write: &MirrorWrite,
    ) -> Result<(), ServiceError> {
        let source = match self.apply_with_retry(write) {
            Ok(()) => return Ok(()),
            Err(e) => e,
        };
        let path = write.sample_path.clone();

        if self.failure_policy == MirrorFailurePolicy::RollBack {
            match guard.rollback(receipt) {
                Ok(()) => {
                    return Err(ServiceError::MirrorWrite {
                        path,
                        rolled_back: true,
                        source,
                    });
                }
                Err(rollback) => {
                    error!(path = %path, error = %rollback, "manifest rollback failed");
                }
            }
        }

        self.reconcile.record(write, &source.to_string())?;
        Err(ServiceError::PartialWrite { path, source })
    }

    fn apply_with_retry(&self, write: &MirrorWrite) -> Result<(), StoreError> {
        let attempts = self.mirror_retry.attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.mirror.apply(write) {
                Ok(()) => return Ok(()),
                Err(e) if attempt >= attempts => return Err(e),
                Err(e) => {
                    warn!(path = %write.sample_path, attempt, error = %e, "mirror write failed, retrying");
                    std::thread::sleep(self.mirror_retry.delay(attempt));
                    attempt += 1;
                }
            }
        }
    }
}
