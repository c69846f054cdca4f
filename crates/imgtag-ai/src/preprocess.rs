//! Image decoding and normalisation ahead of feature extraction.
//!
//! Every extractor sees the same tensor: 224×224 RGB, channels-last
//! (interleaved HWC), each value mapped as `(v - offset) * scale`.

use std::fmt;

use image::imageops::FilterType;
use serde::{Deserialize, Serialize};

use crate::AiError;

/// Side length of the square network input.
pub const INPUT_SIZE: u32 = 224;
pub const CHANNELS: usize = 3;

/// Per-channel value normalisation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Normalization {
    pub offset: f32,
    pub scale: f32,
}

impl Default for Normalization {
    /// Inception-style mean subtraction.
    fn default() -> Self {
        Self {
            offset: 117.0,
            scale: 1.0,
        }
    }
}

/// Rendered into extractor ids, e.g. `n117:1`.
impl fmt::Display for Normalization {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "n{}:{}", self.offset, self.scale)
    }
}

impl Normalization {
    #[inline]
    pub fn apply(&self, v: u8) -> f32 {
        (f32::from(v) - self.offset) * self.scale
    }
}

/// Decoded, resized and normalised image in HWC layout.
#[derive(Debug, Clone)]
pub struct InputTensor {
    pub width: usize,
    pub height: usize,
    pub data: Vec<f32>,
}

impl InputTensor {
    #[inline]
    pub fn at(&self, x: usize, y: usize, channel: usize) -> f32 {
        self.data[(y * self.width + x) * CHANNELS + channel]
    }
}

/// Decode `bytes` (any format the `image` crate understands) into a
/// normalised `INPUT_SIZE`×`INPUT_SIZE` tensor.
pub fn preprocess(bytes: &[u8], norm: Normalization) -> Result<InputTensor, AiError> {
    if bytes.is_empty() {
        return Err(AiError::InvalidImage {
            reason: "empty payload".into(),
        });
    }
    let img = image::load_from_memory(bytes).map_err(|e| AiError::InvalidImage {
        reason: e.to_string(),
    })?;
    if img.width() == 0 || img.height() == 0 {
        return Err(AiError::InvalidImage {
            reason: format!("zero-sized image {}x{}", img.width(), img.height()),
        });
    }

    let rgb = img
        .resize_exact(INPUT_SIZE, INPUT_SIZE, FilterType::Triangle)
        .to_rgb8();
    let data = rgb.as_raw().iter().map(|&v| norm.apply(v)).collect();

    Ok(InputTensor {
        width: INPUT_SIZE as usize,
        height: INPUT_SIZE as usize,
        data,
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use image::{ImageFormat, Rgb, RgbImage};
    use std::io::Cursor;

    /// Solid-colour PNG, shared by the other test modules.
    pub(crate) fn solid_png(w: u32, h: u32, rgb: [u8; 3]) -> Vec<u8> {
        let img = RgbImage::from_pixel(w, h, Rgb(rgb));
        let mut out = Vec::new();
        img.write_to(&mut Cursor::new(&mut out), ImageFormat::Png)
            .unwrap();
        out
    }

    #[test]
    fn resizes_to_input_size() {
        let t = preprocess(&solid_png(17, 5, [10, 20, 30]), Normalization::default()).unwrap();
        assert_eq!(t.width, 224);
        assert_eq!(t.height, 224);
        assert_eq!(t.data.len(), 224 * 224 * 3);
    }

    #[test]
    fn channels_last_with_mean_subtraction() {
        let t = preprocess(&solid_png(8, 8, [255, 117, 0]), Normalization::default()).unwrap();
        assert_eq!(t.at(0, 0, 0), 138.0);
        assert_eq!(t.at(0, 0, 1), 0.0);
        assert_eq!(t.at(100, 50, 2), -117.0);
    }

    #[test]
    fn custom_normalization() {
        let norm = Normalization {
            offset: 0.0,
            scale: 1.0 / 255.0,
        };
        let t = preprocess(&solid_png(4, 4, [255, 255, 255]), norm).unwrap();
        assert!((t.at(3, 3, 1) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn rejects_garbage_and_empty() {
        let err = preprocess(b"GIF89a nope", Normalization::default()).unwrap_err();
        assert!(matches!(err, AiError::InvalidImage { .. }));
        let err = preprocess(&[], Normalization::default()).unwrap_err();
        assert!(matches!(err, AiError::InvalidImage { .. }));
    }
}
