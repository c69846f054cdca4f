//! Currently published model.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use imgtag_ai::Model;
use tracing::info;

/// Holds the serving model behind an `Arc`.
///
/// Readers clone the pointer and keep using it after a newer model is
/// published; publishing swaps the pointer inside one write lock.
#[derive(Default)]
pub struct ModelSlot {
    current: RwLock<Option<Arc<Model>>>,
    generation: AtomicU64,
}

impl ModelSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_model(model: Model) -> Self {
        let slot = Self::new();
        slot.publish(model);
        slot
    }

    pub fn get(&self) -> Option<Arc<Model>> {
        self.current
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Replace the serving model; returns the new generation number.
    pub fn publish(&self, model: Model) -> u64 {
        let labels = model.vocabulary.len();
        let model = Arc::new(model);
        let mut current = self.current.write().unwrap_or_else(|e| e.into_inner());
        *current = Some(model);
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        drop(current);
        info!(generation, labels, "published model");
        generation
    }

    /// Number of models published so far.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }
}
