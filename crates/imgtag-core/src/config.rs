//! Service configuration, loaded from an optional TOML file.
//!
//! Every key has a default, so an empty file (or no file) gives the layout
//! `assets/images/tags.tsv` + `assets/images/test-tags.tsv`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::CoreError;
use crate::manifest::DuplicatePolicy;

/// What the ingestion workflow does when the mirror write fails after the
/// manifest line was appended.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MirrorFailurePolicy {
    /// Truncate the manifest back to its previous length.
    #[default]
    RollBack,
    /// Keep the manifest line and queue the mirror write for replay.
    Reconcile,
}

/// Bounded retry with exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff_ms: 20,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(10);
        Duration::from_millis(self.backoff_ms.saturating_mul(factor))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainConfig {
    pub epochs: usize,
    pub learning_rate: f32,
    pub l2: f32,
    pub seed: u64,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            epochs: 300,
            learning_rate: 0.5,
            l2: 1e-4,
            seed: 42,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub images_dir: PathBuf,
    pub manifest: PathBuf,
    pub test_manifest: Option<PathBuf>,
    pub model_path: PathBuf,
    pub mirror_path: PathBuf,
    pub reconciliation_log: PathBuf,
    /// Fail training on unreadable samples instead of skipping them.
    pub strict: bool,
    pub duplicate_policy: DuplicatePolicy,
    pub train: TrainConfig,
    pub training_timeout_secs: u64,
    pub manifest_retry: RetryPolicy,
    pub mirror_retry: RetryPolicy,
    pub mirror_failure_policy: MirrorFailurePolicy,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        let assets = PathBuf::from("assets");
        let images = assets.join("images");
        Self {
            manifest: images.join("tags.tsv"),
            test_manifest: Some(images.join("test-tags.tsv")),
            images_dir: images,
            model_path: assets.join("model.json"),
            mirror_path: assets.join("mirror.jsonl"),
            reconciliation_log: assets.join("reconcile.jsonl"),
            strict: false,
            duplicate_policy: DuplicatePolicy::default(),
            train: TrainConfig::default(),
            training_timeout_secs: 600,
            manifest_retry: RetryPolicy::default(),
            mirror_retry: RetryPolicy::default(),
            mirror_failure_policy: MirrorFailurePolicy::default(),
        }
    }
}

impl ServiceConfig {
    /// Parse a TOML document; missing keys take their defaults.
    pub fn from_toml(text: &str, origin: &Path) -> Result<Self, CoreError> {
        toml::from_str(text).map_err(|source| CoreError::Config {
            path: origin.to_path_buf(),
            source,
        })
    }

    /// Load from `path`.
    pub fn load(path: &Path) -> Result<Self, CoreError> {
        let text = std::fs::read_to_string(path).map_err(|source| CoreError::ConfigRead {
            path: path.to_path_buf(),
            source,
        })?;
        let cfg = Self::from_toml(&text, path)?;
        tracing::info!(path = %path.display(), "loaded config");
        Ok(cfg)
    }

    pub fn training_timeout(&self) -> Duration {
        Duration::from_secs(self.training_timeout_secs)
    }
}
