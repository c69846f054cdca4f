//! Storage layer: the tag manifest, the managed image directory, and the
//! relational mirror (in-memory, JSON lines, or DuckDB).

mod error;
pub use error::StoreError;

pub mod images;
pub mod jsonl;
pub mod manifest;
pub mod mirror;
pub mod reconcile;

pub use images::ImageStore;
pub use jsonl::JsonlMirror;
pub use manifest::{AppendReceipt, ManifestGuard, ManifestStore};
pub use mirror::{MemoryMirror, Mirror, MirrorExport, MirrorTables, MirrorWrite, PredictionFact};
pub use reconcile::{PendingWrite, ReconcileLog, ReplayOutcome};

#[cfg(feature = "duckdb")]
mod duck;
#[cfg(feature = "duckdb")]
pub use duck::DuckMirror;
