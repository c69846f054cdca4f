//! File-backed mirror: an append-only JSON lines event log.
//!
//! Each mirror call appends one event; a whole [`MirrorWrite`] is one line,
//! so it either lands completely or not at all. The log is replayed into
//! [`MirrorTables`] on open and kept in memory for queries.

use std::fs::OpenOptions;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use imgtag_core::CorrectionRecord;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::StoreError;
use crate::manifest::append_record;
use crate::mirror::{Mirror, MirrorExport, MirrorTables, MirrorWrite};

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum MirrorEvent {
    Write {
        #[serde(flatten)]
        write: MirrorWrite,
        at: DateTime<Utc>,
    },
    Prediction {
        sample_path: String,
        label: String,
        score: f32,
        at: DateTime<Utc>,
    },
    Correction {
        #[serde(flatten)]
        record: CorrectionRecord,
        at: DateTime<Utc>,
    },
}

impl MirrorEvent {
    fn replay(&self, tables: &mut MirrorTables) {
        match self {
            Self::Write { write, at } => tables.apply(write, *at),
            Self::Prediction {
                sample_path,
                label,
                score,
                at,
            } => tables.push_prediction(sample_path, label, *score, *at),
            Self::Correction { record, at } => tables.push_correction(record, *at),
        }
    }
}

pub struct JsonlMirror {
    path: PathBuf,
    tables: Mutex<MirrorTables>,
}

impl JsonlMirror {
    /// Open the log at `path`, replaying existing events.
    ///
    /// A torn final line (crash mid-write) is skipped with a warning; the
    /// next event starts on a fresh line after it.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(StoreError::io(parent))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(path)
            .map_err(StoreError::io(path))?;

        let mut tables = MirrorTables::default();
        let mut events = 0usize;
        for (n, line) in BufReader::new(file).lines().enumerate() {
            let line = line.map_err(StoreError::io(path))?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<MirrorEvent>(&line) {
                Ok(event) => {
                    event.replay(&mut tables);
                    events += 1;
                }
                Err(e) => warn!(path = %path.display(), line = n + 1, error = %e, "skipping unreadable mirror event"),
            }
        }
        info!(path = %path.display(), events, samples = tables.samples.len(), "opened mirror log");

        Ok(Self {
            path: path.to_path_buf(),
            tables: Mutex::new(tables),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn record(&self, event: MirrorEvent) -> Result<(), StoreError> {
        let mut line = serde_json::to_string(&event)?;
        line.push('\n');

        let mut tables = self.tables.lock().unwrap_or_else(|e| e.into_inner());
        append_record(&self.path, &line).map_err(StoreError::io(&self.path))?;
        event.replay(&mut tables);
        Ok(())
    }
}

impl Mirror for JsonlMirror {
    fn insert_sample(&self, path: &str, label: &str) -> Result<(), StoreError> {
        self.apply(&MirrorWrite::sample(path, label))
    }

    fn insert_prediction(
        &self,
        sample_path: &str,
        label: &str,
        score: f32,
    ) -> Result<(), StoreError> {
        self.record(MirrorEvent::Prediction {
            sample_path: sample_path.to_string(),
            label: label.to_string(),
            score,
            at: Utc::now(),
        })
    }

    fn record_correction(&self, correction: &CorrectionRecord) -> Result<(), StoreError> {
        self.record(MirrorEvent::Correction {
            record: correction.clone(),
            at: Utc::now(),
        })
    }

    fn sample_label(&self, path: &str) -> Result<Option<String>, StoreError> {
        let tables = self.tables.lock().unwrap_or_else(|e| e.into_inner());
        Ok(tables.samples.get(path).map(|r| r.label.clone()))
    }

    fn export(&self) -> Result<MirrorExport, StoreError> {
        self.tables
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .to_export()
    }

    fn apply(&self, write: &MirrorWrite) -> Result<(), StoreError> {
        self.record(MirrorEvent::Write {
            write: write.clone(),
            at: Utc::now(),
        })
    }
}
