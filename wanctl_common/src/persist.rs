//! Atomic, corruption-tolerant JSON state persistence.
//!
//! The only sanctioned way to write controller state. Writes go through
//! `<path>.tmp` (mode 0600) + fsync + rename; the previous good file is kept
//! as `<path>.backup`. A SHA-256 hash of the serialization is compared before
//! each write so identical state costs zero I/O — together with the rate
//! limiter this bounds flash wear on hosts with the state dir on NAND.
//!
//! Loading tolerates every corruption mode observed in the field: missing
//! file, empty file, whitespace, truncated JSON, binary garbage, invalid
//! UTF-8. Undecodable bytes are renamed to `<path>.corrupt` and the caller's
//! default is returned; syntactically valid JSON that merely fails the schema
//! (`{}`, `null`, arrays) is not treated as corruption.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde::de::DeserializeOwned;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

/// Persistence error.
#[derive(Debug, thiserror::Error)]
pub enum PersistError {
    /// Filesystem error.
    #[error("state file I/O: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error (a bug in the state types, not the file).
    #[error("state serialization: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// `<path>.<suffix>` with the suffix appended, not substituted for the
/// extension (`state.json` → `state.json.tmp`).
fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut os = path.as_os_str().to_os_string();
    os.push(".");
    os.push(suffix);
    PathBuf::from(os)
}

/// Read a state file without taking ownership of it.
///
/// Used by the steering daemon to observe the autorate daemon's baselines.
/// Never renames or rewrites anything; any failure simply yields `None`.
pub fn read_peer<T: DeserializeOwned>(path: &Path) -> Option<T> {
    let bytes = fs::read(path).ok()?;
    let text = String::from_utf8(bytes).ok()?;
    serde_json::from_str(&text).ok()
}

/// Handle to one exclusively owned state file.
#[derive(Debug)]
pub struct StateFile {
    path: PathBuf,
    last_hash: Option<[u8; 32]>,
}

impl StateFile {
    /// Create a handle. No I/O happens until [`load_or`] / [`save`].
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            last_hash: None,
        }
    }

    /// Path of the owned file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the file, falling back to `default` on any failure.
    ///
    /// Corrupt (undecodable) content is preserved as `<path>.corrupt` before
    /// the default is returned. Valid JSON of the wrong shape falls back to
    /// `default` without the rename.
    pub fn load_or<T: DeserializeOwned>(&mut self, default: T) -> T {
        let bytes = match fs::read(&self.path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return default,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "state file unreadable; using defaults");
                return default;
            }
        };

        let text = match String::from_utf8(bytes) {
            Ok(t) => t,
            Err(_) => {
                self.quarantine("invalid UTF-8");
                return default;
            }
        };

        if text.trim().is_empty() {
            self.quarantine("empty file");
            return default;
        }

        match serde_json::from_str::<T>(&text) {
            Ok(v) => v,
            Err(_) => {
                // Distinguish corrupt bytes from a schema mismatch: `{}`,
                // `null` and arrays are valid JSON and must not be renamed.
                if serde_json::from_str::<serde_json::Value>(&text).is_ok() {
                    warn!(path = %self.path.display(), "state file schema mismatch; using defaults");
                } else {
                    self.quarantine("JSON parse error");
                }
                default
            }
        }
    }

    /// Serialize `value` and atomically replace the file if it changed.
    ///
    /// Returns `true` when bytes actually hit the disk, `false` on the
    /// equal-hash skip.
    pub fn save<T: Serialize>(&mut self, value: &T) -> Result<bool, PersistError> {
        let serialized = serde_json::to_vec_pretty(value)?;
        let hash: [u8; 32] = Sha256::digest(&serialized).into();
        if self.last_hash == Some(hash) {
            return Ok(false);
        }

        let tmp = sibling(&self.path, "tmp");
        {
            let mut f: File = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .mode(0o600)
                .open(&tmp)?;
            f.write_all(&serialized)?;
            f.sync_all()?;
        }

        // Keep the previous good file around for post-mortems.
        if self.path.exists() {
            let backup = sibling(&self.path, "backup");
            if let Err(e) = fs::copy(&self.path, &backup) {
                debug!(path = %self.path.display(), error = %e, "state backup copy failed");
            }
        }

        fs::rename(&tmp, &self.path)?;
        self.last_hash = Some(hash);
        Ok(true)
    }

    fn quarantine(&self, why: &str) {
        let corrupt = sibling(&self.path, "corrupt");
        match fs::rename(&self.path, &corrupt) {
            Ok(()) => warn!(
                path = %self.path.display(),
                backup = %corrupt.display(),
                "state file corrupt ({why}); backed up and using defaults"
            ),
            Err(e) => warn!(
                path = %self.path.display(),
                error = %e,
                "state file corrupt ({why}); backup rename failed"
            ),
        }
    }
}
