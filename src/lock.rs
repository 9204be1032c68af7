//! Per-model advisory lock. Only one process downloads a given model at a
//! time; the OS drops the lock when its holder exits, however it exits.

use fs2::FileExt;
use std::fs::File;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LockError {
    #[error("another download of {model_id} is already running (lock {})", .path.display())]
    Held { model_id: String, path: PathBuf },
    #[error("lock file {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Held for the lifetime of a download run.
#[derive(Debug)]
pub struct JobLock {
    file: File,
}

fn open(path: &Path) -> Result<File, LockError> {
    let io = |source| LockError::Io {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(io)?;
    }
    File::options()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
        .map_err(io)
}

fn contended(e: &std::io::Error) -> bool {
    e.kind() == ErrorKind::WouldBlock || e.kind() == fs2::lock_contended_error().kind()
}

impl JobLock {
    /// Takes the lock without waiting and writes the holder's pid into it.
    pub fn acquire(path: &Path, model_id: &str) -> Result<Self, LockError> {
        let mut file = open(path)?;
        if let Err(e) = FileExt::try_lock_exclusive(&file) {
            if contended(&e) {
                return Err(LockError::Held {
                    model_id: model_id.to_string(),
                    path: path.to_path_buf(),
                });
            }
            return Err(LockError::Io {
                path: path.to_path_buf(),
                source: e,
            });
        }
        let stamp = file
            .set_len(0)
            .and_then(|_| write!(file, "{}", std::process::id()));
        if let Err(e) = stamp {
            tracing::debug!(path = %path.display(), error = %e, "could not write pid to lock file");
        }
        Ok(Self { file })
    }

    /// Whether some process currently holds the lock at `path`.
    pub fn is_held(path: &Path) -> Result<bool, LockError> {
        if !path.exists() {
            return Ok(false);
        }
        let file = open(path)?;
        match FileExt::try_lock_exclusive(&file) {
            Ok(()) => {
                let _ = FileExt::unlock(&file);
                Ok(false)
            }
            Err(e) if contended(&e) => Ok(true),
            Err(e) => Err(LockError::Io {
                path: path.to_path_buf(),
                source: e,
            }),
        }
    }
}

impl Drop for JobLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}
