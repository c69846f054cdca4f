//! Single-writer access to the tag manifest file.
//!
//! Every append goes through one mutex, and each line is written with a
//! single `write_all` so concurrent requests can never interleave partial
//! lines. Callers that need to pair an append with another write (the mirror)
//! take a [`ManifestGuard`] and keep it until both sides are settled; while
//! the guard is held nobody else can append, so truncating back to the
//! pre-append length is a safe rollback.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use imgtag_core::manifest::is_valid_field;
use imgtag_core::{CoreError, Manifest, ManifestEntry, RetryPolicy};
use tracing::{debug, warn};

use crate::StoreError;

/// Proof of a successful append, used to undo it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppendReceipt {
    /// File length before the append.
    pub previous_len: u64,
    /// Bytes written, including any separator and terminator.
    pub written: u64,
    pub line: String,
}

pub struct ManifestStore {
    path: PathBuf,
    retry: RetryPolicy,
    lock: Mutex<()>,
}

impl ManifestStore {
    /// Open the manifest at `path`, creating it (and its directory) if missing.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(StoreError::io(parent))?;
        }
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(StoreError::io(path))?;
        Ok(Self {
            path: path.to_path_buf(),
            retry: RetryPolicy::default(),
            lock: Mutex::new(()),
        })
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Take exclusive write access.
    pub fn lock(&self) -> ManifestGuard<'_> {
        let guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        ManifestGuard {
            store: self,
            _guard: guard,
        }
    }

    /// Append one entry, taking the lock for the duration of the write.
    pub fn append(&self, entry: &ManifestEntry) -> Result<AppendReceipt, StoreError> {
        self.lock().append(entry)
    }

    /// Read a consistent copy of the manifest (no append can be in flight).
    pub fn snapshot(&self) -> Result<Manifest, StoreError> {
        self.lock().snapshot()
    }
}

/// Exclusive handle on the manifest file.
pub struct ManifestGuard<'a> {
    store: &'a ManifestStore,
    _guard: MutexGuard<'a, ()>,
}

impl ManifestGuard<'_> {
    /// Current contents. A manifest file removed since open reads as empty;
    /// the next append then reports the failure.
    pub fn snapshot(&self) -> Result<Manifest, StoreError> {
        match Manifest::load(&self.store.path) {
            Err(CoreError::ManifestRead { source, .. })
                if source.kind() == std::io::ErrorKind::NotFound =>
            {
                Ok(Manifest::default())
            }
            other => Ok(other?),
        }
    }

    /// Append `entry` as one line, retrying with backoff on I/O failure.
    pub fn append(&mut self, entry: &ManifestEntry) -> Result<AppendReceipt, StoreError> {
        if !is_valid_field(&entry.path) {
            return Err(StoreError::InvalidField(entry.path.clone()));
        }
        if let Some(label) = &entry.label
            && !is_valid_field(label)
        {
            return Err(StoreError::InvalidField(label.clone()));
        }

        let line = entry.to_line();
        let retry = self.store.retry;
        let attempts = retry.attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.try_append(&line) {
                Ok(receipt) => {
                    debug!(path = %self.store.path.display(), line = %line, "manifest append");
                    return Ok(receipt);
                }
                Err(source) if attempt >= attempts => {
                    return Err(StoreError::ManifestWrite {
                        path: self.store.path.clone(),
                        attempts,
                        source,
                    });
                }
                Err(err) => {
                    warn!(
                        path = %self.store.path.display(),
                        attempt,
                        error = %err,
                        "manifest append failed, retrying"
                    );
                    std::thread::sleep(retry.delay(attempt));
                    attempt += 1;
                }
            }
        }
    }

    fn try_append(&self, line: &str) -> std::io::Result<AppendReceipt> {
        let mut file = OpenOptions::new()
            .read(true)
            .append(true)
            .open(&self.store.path)?;
        let previous_len = file.metadata()?.len();

        let mut buf = String::with_capacity(line.len() + 2);
        if previous_len > 0 && !ends_with_newline(&mut file, previous_len)? {
            buf.push('\n');
        }
        buf.push_str(line);
        buf.push('\n');

        if let Err(err) = file.write_all(buf.as_bytes()).and_then(|_| file.sync_data()) {
            // Drop whatever part of the line made it to disk.
            if let Err(cleanup) = file.set_len(previous_len) {
                warn!(
                    path = %self.store.path.display(),
                    error = %cleanup,
                    "could not truncate partial manifest line"
                );
            }
            return Err(err);
        }

        Ok(AppendReceipt {
            previous_len,
            written: buf.len() as u64,
            line: line.to_string(),
        })
    }

    /// Undo `receipt`, provided nothing was appended after it.
    pub fn rollback(&mut self, receipt: &AppendReceipt) -> Result<(), StoreError> {
        let path = &self.store.path;
        let file = OpenOptions::new()
            .write(true)
            .open(path)
            .map_err(StoreError::io(path))?;
        let len = file.metadata().map_err(StoreError::io(path))?.len();
        if len != receipt.previous_len + receipt.written {
            return Err(StoreError::Rollback {
                path: path.clone(),
                reason: format!(
                    "length {len} does not match receipt ({} + {})",
                    receipt.previous_len, receipt.written
                ),
            });
        }
        file.set_len(receipt.previous_len)
            .and_then(|_| file.sync_data())
            .map_err(StoreError::io(path))?;
        warn!(path = %path.display(), line = %receipt.line, "manifest append rolled back");
        Ok(())
    }
}

/// Append one `\n`-terminated record to a line log, creating the file if
/// needed. A torn final record is closed off first so the new one starts on
/// its own line.
pub(crate) fn append_record(path: &Path, record: &str) -> std::io::Result<()> {
    let mut file = OpenOptions::new()
        .create(true)
        .read(true)
        .append(true)
        .open(path)?;
    let len = file.metadata()?.len();
    let mut buf = String::with_capacity(record.len() + 1);
    if len > 0 && !ends_with_newline(&mut file, len)? {
        buf.push('\n');
    }
    buf.push_str(record);
    file.write_all(buf.as_bytes())?;
    file.sync_data()
}

fn ends_with_newline(file: &mut File, len: u64) -> std::io::Result<bool> {
    let mut last = [0u8; 1];
    file.seek(SeekFrom::Start(len - 1))?;
    file.read_exact(&mut last)?;
    Ok(last[0] == b'\n')
}
