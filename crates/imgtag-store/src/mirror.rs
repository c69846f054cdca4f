//! Relational mirror: a secondary record of sample, prediction, and
//! correction facts used for querying and auditing.
//!
//! The mirror is never authoritative for training. The ingestion workflow
//! only relies on the write contract of [`Mirror`]; every implementation can
//! export its tables as Arrow batches using the schemas in
//! [`imgtag_core::schema::mirror`].

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use arrow::array::{Float32Array, StringArray, TimestampMillisecondArray};
use arrow::record_batch::RecordBatch;
use chrono::{DateTime, Utc};
use imgtag_core::CorrectionRecord;
use imgtag_core::schema::mirror as schema;
use serde::{Deserialize, Serialize};

use crate::StoreError;

/// A score attached to a labeled sample write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionFact {
    pub label: String,
    pub score: f32,
}

/// Everything one workflow call needs the mirror to record, applied as a unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MirrorWrite {
    pub sample_path: String,
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prediction: Option<PredictionFact>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correction: Option<CorrectionRecord>,
}

impl MirrorWrite {
    pub fn sample(path: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            sample_path: path.into(),
            label: label.into(),
            prediction: None,
            correction: None,
        }
    }
}

/// Write contract of the relational mirror.
///
/// `insert_sample` is an upsert keyed by path, so replaying a write is
/// harmless. Prediction and correction rows are append-only facts.
pub trait Mirror: Send + Sync {
    fn insert_sample(&self, path: &str, label: &str) -> Result<(), StoreError>;

    fn insert_prediction(&self, sample_path: &str, label: &str, score: f32)
    -> Result<(), StoreError>;

    fn record_correction(&self, correction: &CorrectionRecord) -> Result<(), StoreError>;

    /// Current label of `path`, if the mirror knows it.
    fn sample_label(&self, path: &str) -> Result<Option<String>, StoreError>;

    /// Export all tables as Arrow batches.
    fn export(&self) -> Result<MirrorExport, StoreError>;

    /// Apply a whole write. Implementations with transactions override this
    /// so that either every row lands or none does.
    fn apply(&self, write: &MirrorWrite) -> Result<(), StoreError> {
        self.insert_sample(&write.sample_path, &write.label)?;
        if let Some(p) = &write.prediction {
            self.insert_prediction(&write.sample_path, &p.label, p.score)?;
        }
        if let Some(c) = &write.correction {
            self.record_correction(c)?;
        }
        Ok(())
    }
}

/// Arrow snapshot of the three mirror tables.
#[derive(Debug, Clone)]
pub struct MirrorExport {
    pub samples: RecordBatch,
    pub predictions: RecordBatch,
    pub corrections: RecordBatch,
}

impl MirrorExport {
    /// `(table name, batch)` pairs in a stable order.
    pub fn tables(&self) -> [(&'static str, &RecordBatch); 3] {
        [
            (schema::SAMPLES, &self.samples),
            (schema::PREDICTIONS, &self.predictions),
            (schema::CORRECTIONS, &self.corrections),
        ]
    }
}

// ── Row model shared by the in-process mirrors ──

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleRow {
    pub path: String,
    pub label: String,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionRow {
    pub sample_path: String,
    pub predicted_label: String,
    pub score: f32,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorrectionRow {
    pub sample_path: String,
    pub old_label: Option<String>,
    pub new_label: String,
    pub recorded_at: DateTime<Utc>,
}

/// Plain in-memory tables. Samples are keyed by path.
#[derive(Debug, Clone, Default)]
pub struct MirrorTables {
    pub samples: BTreeMap<String, SampleRow>,
    pub predictions: Vec<PredictionRow>,
    pub corrections: Vec<CorrectionRow>,
}

impl MirrorTables {
    pub fn upsert_sample(&mut self, row: SampleRow) {
        self.samples.insert(row.path.clone(), row);
    }

    pub fn push_prediction(
        &mut self,
        sample_path: &str,
        label: &str,
        score: f32,
        now: DateTime<Utc>,
    ) {
        self.predictions.push(PredictionRow {
            sample_path: sample_path.to_string(),
            predicted_label: label.to_string(),
            score,
            recorded_at: now,
        });
    }

    pub fn push_correction(&mut self, correction: &CorrectionRecord, now: DateTime<Utc>) {
        self.corrections.push(CorrectionRow {
            sample_path: correction.sample_path.clone(),
            old_label: correction.old_label.clone(),
            new_label: correction.new_label.clone(),
            recorded_at: now,
        });
    }

    /// Apply a write at time `now`.
    pub fn apply(&mut self, write: &MirrorWrite, now: DateTime<Utc>) {
        self.upsert_sample(SampleRow {
            path: write.sample_path.clone(),
            label: write.label.clone(),
            recorded_at: now,
        });
        if let Some(p) = &write.prediction {
            self.push_prediction(&write.sample_path, &p.label, p.score, now);
        }
        if let Some(c) = &write.correction {
            self.push_correction(c, now);
        }
    }

    pub fn to_export(&self) -> Result<MirrorExport, StoreError> {
        let samples = RecordBatch::try_new(
            Arc::new(schema::samples_schema()),
            vec![
                Arc::new(StringArray::from_iter_values(
                    self.samples.values().map(|r| r.path.as_str()),
                )),
                Arc::new(StringArray::from_iter_values(
                    self.samples.values().map(|r| r.label.as_str()),
                )),
                Arc::new(timestamps(self.samples.values().map(|r| r.recorded_at))),
            ],
        )?;

        let predictions = RecordBatch::try_new(
            Arc::new(schema::predictions_schema()),
            vec![
                Arc::new(StringArray::from_iter_values(
                    self.predictions.iter().map(|r| r.sample_path.as_str()),
                )),
                Arc::new(StringArray::from_iter_values(
                    self.predictions.iter().map(|r| r.predicted_label.as_str()),
                )),
                Arc::new(Float32Array::from_iter_values(
                    self.predictions.iter().map(|r| r.score),
                )),
                Arc::new(timestamps(self.predictions.iter().map(|r| r.recorded_at))),
            ],
        )?;

        let corrections = RecordBatch::try_new(
            Arc::new(schema::corrections_schema()),
            vec![
                Arc::new(StringArray::from_iter_values(
                    self.corrections.iter().map(|r| r.sample_path.as_str()),
                )),
                Arc::new(StringArray::from(
                    self.corrections
                        .iter()
                        .map(|r| r.old_label.as_deref())
                        .collect::<Vec<_>>(),
                )),
                Arc::new(StringArray::from_iter_values(
                    self.corrections.iter().map(|r| r.new_label.as_str()),
                )),
                Arc::new(timestamps(self.corrections.iter().map(|r| r.recorded_at))),
            ],
        )?;

        Ok(MirrorExport {
            samples,
            predictions,
            corrections,
        })
    }
}

fn timestamps(values: impl Iterator<Item = DateTime<Utc>>) -> TimestampMillisecondArray {
    TimestampMillisecondArray::from_iter_values(values.map(|t| t.timestamp_millis()))
        .with_timezone("UTC")
}

/// Mirror held entirely in process memory.
#[derive(Default)]
pub struct MemoryMirror {
    tables: Mutex<MirrorTables>,
}

impl MemoryMirror {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of the current tables.
    pub fn tables(&self) -> MirrorTables {
        self.lock().clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MirrorTables> {
        self.tables.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Mirror for MemoryMirror {
    fn insert_sample(&self, path: &str, label: &str) -> Result<(), StoreError> {
        self.apply(&MirrorWrite::sample(path, label))
    }

    fn insert_prediction(
        &self,
        sample_path: &str,
        label: &str,
        score: f32,
    ) -> Result<(), StoreError> {
        self.lock()
            .push_prediction(sample_path, label, score, Utc::now());
        Ok(())
    }

    fn record_correction(&self, correction: &CorrectionRecord) -> Result<(), StoreError> {
        self.lock().push_correction(correction, Utc::now());
        Ok(())
    }

    fn sample_label(&self, path: &str) -> Result<Option<String>, StoreError> {
        Ok(self.lock().samples.get(path).map(|r| r.label.clone()))
    }

    fn export(&self) -> Result<MirrorExport, StoreError> {
        self.lock().to_export()
    }

    fn apply(&self, write: &MirrorWrite) -> Result<(), StoreError> {
        self.lock().apply(write, Utc::now());
        Ok(())
    }
}
