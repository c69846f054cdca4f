//! Background retraining.
//!
//! A job snapshots the manifest, fits on a blocking thread, and publishes
//! the result to the [`ModelSlot`]. At most one job runs at a time, and a
//! job that outlives its wall-clock budget is cancelled. A timed-out job
//! reports `TimedOut` at once but holds the busy flag until the fit stops.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use imgtag_ai::{AiError, CancelFlag, TrainingPipeline, TrainingRun};
use imgtag_store::ManifestStore;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::ServiceError;
use crate::slot::ModelSlot;

#[derive(Debug, Clone, PartialEq)]
pub enum RetrainStatus {
    Running,
    Finished { examples: usize, classes: usize },
    Failed(String),
    Cancelled,
    TimedOut,
}

impl RetrainStatus {
    pub fn is_done(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

pub struct RetrainHandle {
    status: watch::Receiver<RetrainStatus>,
    cancel: CancelFlag,
    task: JoinHandle<Result<TrainingRun, ServiceError>>,
}

impl RetrainHandle {
    pub fn status(&self) -> RetrainStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<RetrainStatus> {
        self.status.clone()
    }

    /// Ask the job to stop at its next checkpoint.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub async fn wait(self) -> Result<TrainingRun, ServiceError> {
        self.task.await?
    }
}

/// Clears the busy flag when the job ends, however it ends.
struct Busy(Arc<AtomicBool>);

impl Drop for Busy {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct Retrainer {
    pipeline: TrainingPipeline,
    manifest: Arc<ManifestStore>,
    slot: Arc<ModelSlot>,
    model_path: Option<PathBuf>,
    timeout: Duration,
    busy: Arc<AtomicBool>,
}

impl Retrainer {
    pub fn new(
        pipeline: TrainingPipeline,
        manifest: Arc<ManifestStore>,
        slot: Arc<ModelSlot>,
        timeout: Duration,
    ) -> Self {
        Self {
            pipeline,
            manifest,
            slot,
            model_path: None,
            timeout,
            busy: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Save every published model to `path`.
    pub fn with_model_path(mut self, path: Option<PathBuf>) -> Self {
        self.model_path = path;
        self
    }

    pub fn pipeline(&self) -> &TrainingPipeline {
        &self.pipeline
    }

    pub fn is_running(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }

    /// Start a retraining job. Must be called inside a Tokio runtime.
    pub fn request(&self) -> Result<RetrainHandle, ServiceError> {
        if self
            .busy
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(ServiceError::RetrainInProgress);
        }
        let busy = Busy(Arc::clone(&self.busy));

        // Snapshot before spawning: later appends never leak into this run.
        let entries = self.manifest.snapshot()?.entries().to_vec();
        info!(lines = entries.len(), timeout_secs = self.timeout.as_secs(), "retrain requested");

        let cancel = CancelFlag::new();
        let pipeline = self.pipeline.clone().with_cancel(cancel.clone());
        let (tx, rx) = watch::channel(RetrainStatus::Running);
        let slot = Arc::clone(&self.slot);
        let model_path = self.model_path.clone();
        let timeout = self.timeout;
        let job_cancel = cancel.clone();

        let task = tokio::spawn(async move {
            let _busy = busy;
            let started = Instant::now();
            let mut job = tokio::task::spawn_blocking(move || pipeline.train_entries(&entries));

            let outcome = match tokio::time::timeout(timeout, &mut job).await {
                Ok(joined) => match joined {
                    Ok(result) => result.map_err(ServiceError::from),
                    Err(e) => Err(ServiceError::Join(e)),
                },
                Err(_) => {
                    job_cancel.cancel();
                    let elapsed = started.elapsed();
                    tx.send_replace(RetrainStatus::TimedOut);
                    warn!(
                        elapsed_ms = elapsed.as_millis() as u64,
                        "retrain timed out, waiting for the fit to stop"
                    );
                    // The blocking fit only stops at its next checkpoint; stay
                    // busy until it has.
                    let _ = job.await;
                    Err(ServiceError::TrainingTimeout { elapsed })
                }
            };

            let outcome = match outcome {
                Ok(run) => publish(&slot, model_path, run).await,
                Err(e) => Err(e),
            };

            let status = match &outcome {
                Ok(run) => RetrainStatus::Finished {
                    examples: run.summary.examples,
                    classes: run.summary.classes,
                },
                Err(ServiceError::Ai(AiError::Cancelled)) => RetrainStatus::Cancelled,
                Err(ServiceError::TrainingTimeout { .. }) => RetrainStatus::TimedOut,
                Err(e) => RetrainStatus::Failed(e.to_string()),
            };
            if let Err(e) = &outcome {
                warn!(error = %e, "retrain did not publish a model");
            }
            tx.send_replace(status);
            outcome
        });

        Ok(RetrainHandle {
            status: rx,
            cancel,
            task,
        })
    }
}

async fn publish(
    slot: &ModelSlot,
    model_path: Option<PathBuf>,
    run: TrainingRun,
) -> Result<TrainingRun, ServiceError> {
    if let Some(path) = model_path {
        let model = run.model.clone();
        tokio::task::spawn_blocking(move || model.save(&path)).await??;
    }
    slot.publish(run.model.clone());
    Ok(run)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{BLUE, RED, SlowExtractor, solid_png, toy_model};
    use imgtag_ai::{Model, PixelPoolExtractor, TrainOptions};
    use imgtag_core::ManifestEntry;
    use tempfile::TempDir;

    struct Fixture {
        _tmp: TempDir,
        manifest: Arc<ManifestStore>,
        slot: Arc<ModelSlot>,
        pipeline: TrainingPipeline,
        model_path: PathBuf,
    }

    fn fixture(epochs: usize) -> Fixture {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("toaster.png"), solid_png(RED)).unwrap();
        std::fs::write(tmp.path().join("microwave.png"), solid_png(BLUE)).unwrap();
        let manifest = Arc::new(ManifestStore::open(&tmp.path().join("tags.tsv")).unwrap());
        manifest
            .append(&ManifestEntry::labeled("toaster.png", "toaster"))
            .unwrap();
        manifest
            .append(&ManifestEntry::labeled("microwave.png", "microwave"))
            .unwrap();
        let pipeline = TrainingPipeline::new(Arc::new(PixelPoolExtractor::default()), tmp.path())
            .with_options(TrainOptions {
                epochs,
                ..TrainOptions::default()
            });
        Fixture {
            model_path: tmp.path().join("model.json"),
            _tmp: tmp,
            manifest,
            slot: Arc::new(ModelSlot::new()),
            pipeline,
        }
    }

    fn retrainer(f: &Fixture, timeout: Duration) -> Retrainer {
        Retrainer::new(
            f.pipeline.clone(),
            Arc::clone(&f.manifest),
            Arc::clone(&f.slot),
            timeout,
        )
        .with_model_path(Some(f.model_path.clone()))
    }

    #[tokio::test]
    async fn publishes_and_saves() {
        let f = fixture(50);
        let r = retrainer(&f, Duration::from_secs(60));
        let handle = r.request().unwrap();
        let mut status = handle.subscribe();
        let run = handle.wait().await.unwrap();

        assert_eq!(run.summary.classes, 2);
        assert_eq!(f.slot.generation(), 1);
        assert_eq!(*f.slot.get().unwrap(), run.model);
        assert_eq!(Model::load(&f.model_path).unwrap(), run.model);
        assert!(matches!(
            *status.borrow_and_update(),
            RetrainStatus::Finished { examples: 2, classes: 2 }
        ));
        assert!(!r.is_running());
    }

    #[tokio::test]
    async fn second_request_is_rejected_while_running() {
        let f = fixture(5_000_000);
        let r = retrainer(&f, Duration::from_secs(60));
        let first = r.request().unwrap();
        assert!(matches!(r.request(), Err(ServiceError::RetrainInProgress)));

        first.cancel();
        let err = first.wait().await.unwrap_err();
        assert!(matches!(err, ServiceError::Ai(AiError::Cancelled)));
        assert!(!r.is_running());
        assert!(f.slot.get().is_none());

        // Free again once the first job has ended.
        let again = r.request().unwrap();
        let status = again.subscribe();
        again.cancel();
        assert!(again.wait().await.is_err());
        assert!(status.borrow().is_done());
        assert!(!r.is_running());
    }

    #[tokio::test]
    async fn timeout_keeps_previous_model() {
        let f = fixture(5_000_000);
        f.slot.publish(toy_model(&["old", "model"]));
        let r = retrainer(&f, Duration::ZERO);

        let handle = r.request().unwrap();
        let mut status = handle.subscribe();
        let err = handle.wait().await.unwrap_err();
        assert!(matches!(err, ServiceError::TrainingTimeout { .. }));
        assert_eq!(*status.borrow_and_update(), RetrainStatus::TimedOut);

        let current = f.slot.get().unwrap();
        assert_eq!(current.vocabulary.labels(), ["model", "old"]);
        assert_eq!(f.slot.generation(), 1);
        assert!(!f.model_path.exists());
    }

    #[tokio::test]
    async fn appends_after_request_are_not_trained_on() {
        let f = fixture(20);
        let r = retrainer(&f, Duration::from_secs(60));
        let handle = r.request().unwrap();
        f.manifest
            .append(&ManifestEntry::labeled("toaster.png", "kettle"))
            .unwrap();
        let run = handle.wait().await.unwrap();
        assert_eq!(run.model.vocabulary.labels(), ["microwave", "toaster"]);
    }

    #[tokio::test]
    async fn timed_out_fit_stays_exclusive_until_it_stops() {
        let mut f = fixture(50);
        let slow = Arc::new(SlowExtractor::new(Duration::from_millis(200)));
        f.pipeline = TrainingPipeline::new(slow.clone(), f.manifest.path().parent().unwrap());
        let r = retrainer(&f, Duration::from_millis(50));

        let handle = r.request().unwrap();
        let mut status = handle.subscribe();
        status
            .wait_for(|s| *s == RetrainStatus::TimedOut)
            .await
            .unwrap();

        // The extractor is still sleeping inside the first sample.
        assert!(r.is_running());
        assert!(matches!(r.request(), Err(ServiceError::RetrainInProgress)));

        let err = handle.wait().await.unwrap_err();
        assert!(matches!(err, ServiceError::TrainingTimeout { .. }));
        assert!(!r.is_running());
        assert_eq!(slow.peak(), 1);
        assert!(f.slot.get().is_none());
    }
}
