//! Reconciliation log: mirror writes that failed after their manifest line
//! was kept, queued for replay.
//!
//! The manifest is authoritative. Replay checks each queued write against
//! the manifest's current label for its path, so a write queued before a
//! later correction can never roll the mirror back to a stale label.

use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use imgtag_core::Manifest;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::StoreError;
use crate::manifest::append_record;
use crate::mirror::{Mirror, MirrorWrite};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingWrite {
    pub write: MirrorWrite,
    /// Last error seen for this write.
    pub error: String,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplayOutcome {
    pub replayed: usize,
    pub remaining: usize,
    /// Writes for paths the manifest no longer labels.
    pub dropped: usize,
}

pub struct ReconcileLog {
    path: PathBuf,
    lock: Mutex<()>,
}

impl ReconcileLog {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(StoreError::io(parent))?;
        }
        Ok(Self {
            path: path.to_path_buf(),
            lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Queue `write` for replay.
    pub fn record(&self, write: &MirrorWrite, error: &str) -> Result<(), StoreError> {
        let entry = PendingWrite {
            write: write.clone(),
            error: error.to_string(),
            recorded_at: Utc::now(),
        };
        let mut line = serde_json::to_string(&entry)?;
        line.push('\n');

        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        append_record(&self.path, &line).map_err(StoreError::io(&self.path))?;
        warn!(
            path = %self.path.display(),
            sample = %write.sample_path,
            error,
            "mirror write queued for reconciliation"
        );
        Ok(())
    }

    /// Writes still waiting for replay, oldest first.
    pub fn pending(&self) -> Result<Vec<PendingWrite>, StoreError> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        self.read_all()
    }

    /// Apply every pending write to `mirror`; writes that fail again stay
    /// queued with their new error.
    ///
    /// `manifest` must be read under the manifest lock and the lock held
    /// until replay returns. A write whose label has since been replaced is
    /// applied with the manifest's current label instead; a write for a path
    /// the manifest does not label is dropped.
    pub fn replay(
        &self,
        mirror: &dyn Mirror,
        manifest: &Manifest,
    ) -> Result<ReplayOutcome, StoreError> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let pending = self.read_all()?;
        if pending.is_empty() {
            return Ok(ReplayOutcome::default());
        }

        let mut remaining = Vec::new();
        let mut replayed = 0;
        let mut dropped = 0;
        for mut entry in pending {
            let sample = entry.write.sample_path.as_str();
            match manifest.current_label(sample) {
                Some(current) if current != entry.write.label => {
                    debug!(
                        sample,
                        queued = %entry.write.label,
                        current,
                        "queued label superseded, replaying current label"
                    );
                    entry.write.label = current.to_string();
                }
                Some(_) => {}
                None => {
                    warn!(sample, "dropping queued write for a path the manifest does not label");
                    dropped += 1;
                    continue;
                }
            }
            match mirror.apply(&entry.write) {
                Ok(()) => replayed += 1,
                Err(e) => {
                    entry.error = e.to_string();
                    remaining.push(entry);
                }
            }
        }
        self.rewrite(&remaining)?;

        let outcome = ReplayOutcome {
            replayed,
            remaining: remaining.len(),
            dropped,
        };
        info!(
            path = %self.path.display(),
            replayed = outcome.replayed,
            remaining = outcome.remaining,
            dropped = outcome.dropped,
            "reconciliation replay finished"
        );
        Ok(outcome)
    }

    fn read_all(&self) -> Result<Vec<PendingWrite>, StoreError> {
        let file = match std::fs::File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StoreError::io(&self.path)(e)),
        };
        let mut out = Vec::new();
        for (n, line) in BufReader::new(file).lines().enumerate() {
            let line = line.map_err(StoreError::io(&self.path))?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(&line) {
                Ok(entry) => out.push(entry),
                Err(e) => warn!(
                    path = %self.path.display(),
                    line = n + 1,
                    error = %e,
                    "skipping unreadable queued write"
                ),
            }
        }
        Ok(out)
    }

    fn rewrite(&self, entries: &[PendingWrite]) -> Result<(), StoreError> {
        let dir = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(StoreError::io(dir))?;
        for entry in entries {
            let mut line = serde_json::to_string(entry)?;
            line.push('\n');
            tmp.write_all(line.as_bytes())
                .map_err(StoreError::io(tmp.path().to_path_buf()))?;
        }
        tmp.as_file()
            .sync_data()
            .map_err(StoreError::io(tmp.path().to_path_buf()))?;
        tmp.persist(&self.path)
            .map_err(|e| StoreError::io(&self.path)(e.error))?;
        Ok(())
    }
}
