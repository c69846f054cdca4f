//! Fixed feature extractors.
//!
//! An extractor is an opaque deterministic function from raw image bytes to
//! a vector of constant length. The model records the extractor id it was
//! trained with so that predictions never mix embedding spaces.

use crate::AiError;
use crate::preprocess::{CHANNELS, InputTensor, Normalization, preprocess};

pub trait FeatureExtractor: Send + Sync {
    /// Stable identity, stored in trained models.
    fn id(&self) -> &str;

    /// Length of every vector returned by [`extract`](Self::extract).
    fn dim(&self) -> usize;

    fn extract(&self, bytes: &[u8]) -> Result<Vec<f32>, AiError>;
}

/// Average-pools the preprocessed tensor over a `grid`×`grid` layout,
/// one value per cell and channel.
#[derive(Debug, Clone)]
pub struct PixelPoolExtractor {
    id: String,
    grid: usize,
    norm: Normalization,
}

impl Default for PixelPoolExtractor {
    fn default() -> Self {
        Self::new(8)
    }
}

impl PixelPoolExtractor {
    /// Pooling values are scaled into roughly `[-1, 1]`.
    const SCALE: f32 = 1.0 / 128.0;

    /// `grid` is clamped to `1..=224`.
    pub fn new(grid: usize) -> Self {
        let grid = grid.clamp(1, crate::preprocess::INPUT_SIZE as usize);
        let norm = Normalization::default();
        Self {
            id: Self::make_id(grid, norm),
            grid,
            norm,
        }
    }

    /// The id changes with the normalization, since it changes the features.
    pub fn with_normalization(mut self, norm: Normalization) -> Self {
        self.norm = norm;
        self.id = Self::make_id(self.grid, norm);
        self
    }

    fn make_id(grid: usize, norm: Normalization) -> String {
        format!("pixel-pool-{grid}x{grid}-{norm}")
    }

    pub fn grid(&self) -> usize {
        self.grid
    }

    fn pool(&self, t: &InputTensor) -> Vec<f32> {
        let g = self.grid;
        let mut out = Vec::with_capacity(g * g * CHANNELS);
        for gy in 0..g {
            let (y0, y1) = (gy * t.height / g, (gy + 1) * t.height / g);
            for gx in 0..g {
                let (x0, x1) = (gx * t.width / g, (gx + 1) * t.width / g);
                let mut sums = [0.0f32; CHANNELS];
                for y in y0..y1 {
                    for x in x0..x1 {
                        for (c, s) in sums.iter_mut().enumerate() {
                            *s += t.at(x, y, c);
                        }
                    }
                }
                let n = ((y1 - y0) * (x1 - x0)).max(1) as f32;
                out.extend(sums.iter().map(|s| s / n * Self::SCALE));
            }
        }
        out
    }
}

impl FeatureExtractor for PixelPoolExtractor {
    fn id(&self) -> &str {
        &self.id
    }

    fn dim(&self) -> usize {
        self.grid * self.grid * CHANNELS
    }

    fn extract(&self, bytes: &[u8]) -> Result<Vec<f32>, AiError> {
        let tensor = preprocess(bytes, self.norm)?;
        Ok(self.pool(&tensor))
    }
}
