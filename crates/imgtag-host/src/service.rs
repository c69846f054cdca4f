//! Async facade over prediction, the correction workflow, and retraining.
//!
//! File and CPU work runs on Tokio's blocking pool; the service itself is
//! cheap to share behind an `Arc`.

use std::sync::Arc;

use imgtag_ai::{
    EvaluationReport, FeatureExtractor, Model, PredictionEngine, TrainOptions, TrainingPipeline,
    TrainingRun,
};
use imgtag_core::{CorrectionRecord, Prediction, ServiceConfig};
use imgtag_store::{Mirror, ReplayOutcome};
use tracing::info;

use crate::ServiceError;
use crate::jobs::{RetrainHandle, Retrainer};
use crate::slot::ModelSlot;
use crate::workflow::{Committed, CorrectionWorkflow};

pub struct ImageTagService {
    config: ServiceConfig,
    engine: PredictionEngine,
    slot: Arc<ModelSlot>,
    workflow: Arc<CorrectionWorkflow>,
    retrainer: Retrainer,
}

impl ImageTagService {
    /// Wire up the stores named by `config` and load the saved model, if any.
    pub fn open(
        config: ServiceConfig,
        extractor: Arc<dyn FeatureExtractor>,
        mirror: Arc<dyn Mirror>,
    ) -> Result<Self, ServiceError> {
        let workflow = Arc::new(CorrectionWorkflow::open(&config, mirror)?);

        let slot = Arc::new(ModelSlot::new());
        if config.model_path.exists() {
            slot.publish(Model::load(&config.model_path)?);
        }

        let pipeline = TrainingPipeline::new(Arc::clone(&extractor), &config.images_dir)
            .with_options(TrainOptions::from(&config.train))
            .with_duplicate_policy(config.duplicate_policy)
            .with_strict(config.strict)
            .with_holdout(config.test_manifest.clone().filter(|p| p.exists()));
        let retrainer = Retrainer::new(
            pipeline,
            Arc::clone(workflow.manifest()),
            Arc::clone(&slot),
            config.training_timeout(),
        )
        .with_model_path(Some(config.model_path.clone()));

        info!(
            manifest = %config.manifest.display(),
            extractor = %extractor.id(),
            model_loaded = slot.get().is_some(),
            "service ready"
        );
        Ok(Self {
            engine: PredictionEngine::new(extractor),
            config,
            slot,
            workflow,
            retrainer,
        })
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn model(&self) -> Option<Arc<Model>> {
        self.slot.get()
    }

    pub fn slot(&self) -> &Arc<ModelSlot> {
        &self.slot
    }

    pub fn workflow(&self) -> &Arc<CorrectionWorkflow> {
        &self.workflow
    }

    /// Classify with the currently published model. Does not ingest.
    pub async fn classify(
        &self,
        sample_path: &str,
        bytes: Vec<u8>,
    ) -> Result<Prediction, ServiceError> {
        let model = self.slot.get().ok_or(ServiceError::NoModel)?;
        let engine = self.engine.clone();
        let path = sample_path.to_string();
        let prediction =
            tokio::task::spawn_blocking(move || engine.classify(&model, &path, &bytes)).await??;
        info!(
            path = %prediction.sample_path,
            label = %prediction.predicted_label,
            score = prediction.confidence,
            "classified"
        );
        Ok(prediction)
    }

    /// Classify an upload, then store it as an unlabeled sample.
    pub async fn classify_and_ingest(
        &self,
        filename: &str,
        bytes: Vec<u8>,
    ) -> Result<(Prediction, Committed), ServiceError> {
        let prediction = self.classify(filename, bytes.clone()).await?;
        let committed = self.ingest_unlabeled(filename, bytes).await?;
        Ok((prediction, committed))
    }

    pub async fn add_labeled_sample(
        &self,
        path: &str,
        label: &str,
        prediction_score: Option<f32>,
    ) -> Result<Committed, ServiceError> {
        let (path, label) = (path.to_string(), label.to_string());
        self.blocking(move |wf| wf.add_labeled_sample(&path, &label, prediction_score))
            .await
    }

    pub async fn correct_label(
        &self,
        path: &str,
        new_label: &str,
    ) -> Result<CorrectionRecord, ServiceError> {
        let (path, label) = (path.to_string(), new_label.to_string());
        self.blocking(move |wf| wf.correct_label(&path, &label)).await
    }

    pub async fn ingest_unlabeled(
        &self,
        filename: &str,
        bytes: Vec<u8>,
    ) -> Result<Committed, ServiceError> {
        let filename = filename.to_string();
        self.blocking(move |wf| wf.ingest_unlabeled(&bytes, &filename))
            .await
    }

    pub async fn ingest_labeled(
        &self,
        filename: &str,
        bytes: Vec<u8>,
        label: &str,
    ) -> Result<Committed, ServiceError> {
        let (filename, label) = (filename.to_string(), label.to_string());
        self.blocking(move |wf| wf.ingest_labeled(&bytes, &filename, &label))
            .await
    }

    pub async fn reconcile(&self) -> Result<ReplayOutcome, ServiceError> {
        self.blocking(|wf| wf.reconcile()).await
    }

    /// Start a background retrain from the current manifest.
    pub fn retrain(&self) -> Result<RetrainHandle, ServiceError> {
        self.retrainer.request()
    }

    /// Retrain and wait for the new model to be published.
    pub async fn train_now(&self) -> Result<TrainingRun, ServiceError> {
        self.retrain()?.wait().await
    }

    /// Evaluate the published model against the configured test manifest.
    pub async fn evaluate(&self) -> Result<Option<EvaluationReport>, ServiceError> {
        let model = self.slot.get().ok_or(ServiceError::NoModel)?;
        let Some(test) = self.config.test_manifest.clone() else {
            return Ok(None);
        };
        let pipeline = self.retrainer.pipeline().clone();
        let report =
            tokio::task::spawn_blocking(move || pipeline.evaluate_manifest(&model, &test))
                .await??;
        report.log();
        Ok(Some(report))
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T, ServiceError>
    where
        T: Send + 'static,
        F: FnOnce(&CorrectionWorkflow) -> Result<T, ServiceError> + Send + 'static,
    {
        let workflow = Arc::clone(&self.workflow);
        tokio::task::spawn_blocking(move || f(&workflow)).await?
    }
}
