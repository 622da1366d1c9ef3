//! PID lock files for controller mutual exclusion.
//!
//! One lock file per controller name, checked at startup. A lock whose PID no
//! longer exists is stale and is cleaned; a live conflict is fatal and the
//! caller exits with a clear message.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use nix::sys::signal::kill;
use nix::unistd::Pid;
use tracing::{info, warn};

/// Lock acquisition error.
#[derive(Debug, thiserror::Error)]
pub enum LockError {
    /// Another live process holds the lock.
    #[error("lock file {path} held by running pid {pid}")]
    Held { path: String, pid: i32 },

    /// Filesystem error while probing or writing the lock.
    #[error("lock file I/O: {0}")]
    Io(#[from] std::io::Error),
}

/// A held lock file; removed on drop.
#[derive(Debug)]
pub struct LockFile {
    path: PathBuf,
    held: bool,
}

impl LockFile {
    /// Acquire the lock at `path`, cleaning a stale one if present.
    pub fn acquire(path: impl Into<PathBuf>) -> Result<Self, LockError> {
        let path = path.into();

        if path.exists() {
            match read_pid(&path) {
                Some(pid) if pid_alive(pid) => {
                    return Err(LockError::Held {
                        path: path.display().to_string(),
                        pid,
                    });
                }
                Some(pid) => {
                    warn!(path = %path.display(), pid, "removing stale lock from dead process");
                    fs::remove_file(&path)?;
                }
                None => {
                    warn!(path = %path.display(), "removing unparsable lock file");
                    fs::remove_file(&path)?;
                }
            }
        }

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let mut f = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)?;
        writeln!(f, "{}", std::process::id())?;
        info!(path = %path.display(), "lock acquired");

        Ok(Self { path, held: true })
    }

    /// Release early (idempotent; also happens on drop).
    pub fn release(&mut self) {
        if self.held {
            if let Err(e) = fs::remove_file(&self.path) {
                warn!(path = %self.path.display(), error = %e, "lock file removal failed");
            }
            self.held = false;
        }
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        self.release();
    }
}

fn read_pid(path: &Path) -> Option<i32> {
    let text = fs::read_to_string(path).ok()?;
    text.trim().parse::<i32>().ok()
}

fn pid_alive(pid: i32) -> bool {
    if pid <= 0 {
        return false;
    }
    // Signal 0 probes existence without delivering anything.
    kill(Pid::from_raw(pid), None).is_ok()
}
