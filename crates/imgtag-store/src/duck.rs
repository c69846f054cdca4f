//! DuckDB-backed relational mirror.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use duckdb::{Connection, params};
use imgtag_core::CorrectionRecord;
use tracing::info;

use crate::StoreError;
use crate::mirror::{Mirror, MirrorExport, MirrorTables, MirrorWrite, SampleRow};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS samples (
    path        VARCHAR PRIMARY KEY,
    label       VARCHAR NOT NULL,
    recorded_at BIGINT  NOT NULL
);
CREATE TABLE IF NOT EXISTS predictions (
    sample_path     VARCHAR NOT NULL,
    predicted_label VARCHAR NOT NULL,
    score           REAL    NOT NULL,
    recorded_at     BIGINT  NOT NULL
);
CREATE TABLE IF NOT EXISTS corrections (
    sample_path VARCHAR NOT NULL,
    old_label   VARCHAR,
    new_label   VARCHAR NOT NULL,
    recorded_at BIGINT  NOT NULL
);
";

const UPSERT_SAMPLE: &str = "INSERT OR REPLACE INTO samples VALUES (?, ?, ?)";
const INSERT_PREDICTION: &str = "INSERT INTO predictions VALUES (?, ?, ?, ?)";
const INSERT_CORRECTION: &str = "INSERT INTO corrections VALUES (?, ?, ?, ?)";

/// Mirror stored in DuckDB tables `samples`, `predictions`, and `corrections`.
///
/// Timestamps are kept as epoch milliseconds. [`Mirror::apply`] runs in one
/// transaction.
pub struct DuckMirror {
    conn: Mutex<Connection>,
}

impl DuckMirror {
    /// Open an in-memory database.
    pub fn open() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    /// Open or create a database file at `path`.
    pub fn open_persistent(path: &Path) -> Result<Self, StoreError> {
        let mirror = Self::init(Connection::open(path)?)?;
        info!(path = %path.display(), "opened duckdb mirror");
        Ok(mirror)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn read_tables(conn: &Connection) -> Result<MirrorTables, StoreError> {
        let mut tables = MirrorTables::default();

        let mut stmt =
            conn.prepare("SELECT path, label, recorded_at FROM samples ORDER BY path")?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
            ))
        })?;
        for row in rows {
            let (path, label, at) = row?;
            tables.upsert_sample(SampleRow {
                path,
                label,
                recorded_at: from_millis(at),
            });
        }

        let mut stmt = conn.prepare(
            "SELECT sample_path, predicted_label, score, recorded_at FROM predictions \
             ORDER BY recorded_at",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, f32>(2)?,
                row.get::<_, i64>(3)?,
            ))
        })?;
        for row in rows {
            let (path, label, score, at) = row?;
            tables.push_prediction(&path, &label, score, from_millis(at));
        }

        let mut stmt = conn.prepare(
            "SELECT sample_path, old_label, new_label, recorded_at FROM corrections \
             ORDER BY recorded_at",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                CorrectionRecord {
                    sample_path: row.get(0)?,
                    old_label: row.get(1)?,
                    new_label: row.get(2)?,
                },
                row.get::<_, i64>(3)?,
            ))
        })?;
        for row in rows {
            let (record, at) = row?;
            tables.push_correction(&record, from_millis(at));
        }

        Ok(tables)
    }
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

impl Mirror for DuckMirror {
    fn insert_sample(&self, path: &str, label: &str) -> Result<(), StoreError> {
        let now = Utc::now().timestamp_millis();
        self.conn()
            .execute(UPSERT_SAMPLE, params![path, label, now])?;
        Ok(())
    }

    fn insert_prediction(
        &self,
        sample_path: &str,
        label: &str,
        score: f32,
    ) -> Result<(), StoreError> {
        let now = Utc::now().timestamp_millis();
        self.conn()
            .execute(INSERT_PREDICTION, params![sample_path, label, score, now])?;
        Ok(())
    }

    fn record_correction(&self, correction: &CorrectionRecord) -> Result<(), StoreError> {
        let now = Utc::now().timestamp_millis();
        self.conn().execute(
            INSERT_CORRECTION,
            params![
                correction.sample_path,
                correction.old_label,
                correction.new_label,
                now
            ],
        )?;
        Ok(())
    }

    fn sample_label(&self, path: &str) -> Result<Option<String>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT label FROM samples WHERE path = ?")?;
        let mut rows = stmt.query_map([path], |row| row.get::<_, String>(0))?;
        Ok(rows.next().transpose()?)
    }

    fn export(&self) -> Result<MirrorExport, StoreError> {
        Self::read_tables(&self.conn())?.to_export()
    }

    fn apply(&self, write: &MirrorWrite) -> Result<(), StoreError> {
        let now = Utc::now().timestamp_millis();
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        tx.execute(
            UPSERT_SAMPLE,
            params![write.sample_path, write.label, now],
        )?;
        if let Some(p) = &write.prediction {
            tx.execute(
                INSERT_PREDICTION,
                params![write.sample_path, p.label, p.score, now],
            )?;
        }
        if let Some(c) = &write.correction {
            tx.execute(
                INSERT_CORRECTION,
                params![c.sample_path, c.old_label, c.new_label, now],
            )?;
        }
        tx.commit()?;
        Ok(())
    }
}
