//! Managed image directory: the ingestion boundary for raw uploads.
//!
//! Manifest paths are stored relative to this directory.

use std::io::{Cursor, Write};
use std::path::{Component, Path, PathBuf};

use image::ImageReader;
use imgtag_core::manifest::is_valid_field;
use tracing::info;

use crate::StoreError;

pub struct ImageStore {
    root: PathBuf,
}

impl ImageStore {
    /// Open (creating if needed) the image directory at `root`.
    pub fn open(root: &Path) -> Result<Self, StoreError> {
        std::fs::create_dir_all(root).map_err(StoreError::io(root))?;
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Filesystem location of a manifest path. Absolute paths pass through.
    pub fn resolve(&self, manifest_path: &str) -> PathBuf {
        let p = Path::new(manifest_path);
        if p.is_absolute() {
            p.to_path_buf()
        } else {
            self.root.join(p)
        }
    }

    pub fn read(&self, manifest_path: &str) -> Result<Vec<u8>, StoreError> {
        let path = self.resolve(manifest_path);
        std::fs::read(&path).map_err(StoreError::io(path))
    }

    /// Validate and write an uploaded image, returning its manifest path.
    ///
    /// Rejects empty payloads, names with directory components, and bytes
    /// that do not decode to an image with non-zero dimensions. An existing
    /// file with the same name is replaced.
    pub fn store(&self, filename: &str, bytes: &[u8]) -> Result<String, StoreError> {
        validate_filename(filename)?;
        if bytes.is_empty() {
            return Err(StoreError::EmptyPayload(filename.to_string()));
        }
        let (width, height) = read_dimensions(filename, bytes)?;

        let target = self.root.join(filename);
        let mut tmp =
            tempfile::NamedTempFile::new_in(&self.root).map_err(StoreError::io(&self.root))?;
        tmp.write_all(bytes)
            .and_then(|_| tmp.as_file().sync_data())
            .map_err(StoreError::io(tmp.path().to_path_buf()))?;
        tmp.persist(&target)
            .map_err(|e| StoreError::io(&target)(e.error))?;

        info!(file = %filename, width, height, bytes = bytes.len(), "stored image");
        Ok(filename.to_string())
    }
}

fn validate_filename(filename: &str) -> Result<(), StoreError> {
    let invalid = || StoreError::InvalidFilename(filename.to_string());
    if !is_valid_field(filename) {
        return Err(invalid());
    }
    let mut components = Path::new(filename).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(name)), None) if name.to_str() == Some(filename) => Ok(()),
        _ => Err(invalid()),
    }
}

fn read_dimensions(filename: &str, bytes: &[u8]) -> Result<(u32, u32), StoreError> {
    let invalid = |reason: String| StoreError::InvalidImage {
        name: filename.to_string(),
        reason,
    };
    let reader = ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .map_err(|e| invalid(e.to_string()))?;
    if reader.format().is_none() {
        return Err(invalid("unrecognised image format".into()));
    }
    let (w, h) = reader.into_dimensions().map_err(|e| invalid(e.to_string()))?;
    if w == 0 || h == 0 {
        return Err(invalid(format!("zero-sized image {w}x{h}")));
    }
    Ok((w, h))
}
