//! Per-file driver: pre-allocation, chunk scheduling, verification and the
//! whole-file retry on digest mismatch.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::fs::OpenOptions;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::downloader::{ChunkOutcome, ChunkWorker};
use crate::integrity::{self, IntegrityError, Verdict};
use crate::models::{Chunk, ChunkState, FileState, FileTask, Job};
use crate::state_manager::{StateError, StatusStore};
use crate::transport::{RangeTransport, TransferError};

#[derive(Debug, Error)]
pub enum FileError {
    #[error("chunk at offset {offset} failed after {attempts} attempt(s): {source}")]
    Transfer {
        offset: u64,
        attempts: u32,
        #[source]
        source: TransferError,
    },
    #[error("checksum mismatch: expected {expected}, got {actual}")]
    Integrity { expected: String, actual: String },
    #[error("{}: {source}", .path.display())]
    Resource {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid remote path {0:?}")]
    InvalidPath(String),
    #[error("status store error: {0}")]
    State(#[from] StateError),
    #[error("chunk worker aborted: {0}")]
    Aborted(String),
    #[error("download interrupted")]
    Interrupted,
}

impl FileError {
    fn resource(path: &Path, source: std::io::Error) -> Self {
        FileError::Resource {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Final outcome of one file.
#[derive(Debug)]
pub struct FileResult {
    pub path: String,
    pub state: FileState,
    pub verified: bool,
    pub bytes: u64,
    pub error: Option<FileError>,
}

impl FileResult {
    pub fn is_completed(&self) -> bool {
        self.state == FileState::Completed
    }

    pub fn is_failed(&self) -> bool {
        self.state == FileState::Failed
    }

    pub fn is_interrupted(&self) -> bool {
        matches!(self.error, Some(FileError::Interrupted))
    }
}

pub struct FileTaskManager<T, S> {
    job: Arc<Job>,
    worker: ChunkWorker<T, S>,
    store: Arc<S>,
    cancel: CancellationToken,
}

impl<T: RangeTransport, S: StatusStore> FileTaskManager<T, S> {
    pub fn new(job: Arc<Job>, worker: ChunkWorker<T, S>, store: Arc<S>, cancel: CancellationToken) -> Self {
        Self { job, worker, store, cancel }
    }

    /// Drives one file to a terminal state (or back to `Pending` when the job
    /// is interrupted) and records the outcome.
    pub async fn process(&self, mut task: FileTask) -> FileResult {
        let outcome = self.drive(&mut task).await;
        let model_id = self.job.model_id.as_str();

        let error = match outcome {
            Ok(()) => {
                info!(
                    file = %task.remote_path,
                    bytes = task.total_size,
                    verified = task.verified,
                    "file completed"
                );
                None
            }
            Err(FileError::Interrupted) => {
                task.state = FileState::Pending;
                if let Err(e) = self
                    .store
                    .record_file_state(model_id, &task.remote_path, FileState::Pending, false, None)
                    .await
                {
                    debug!(file = %task.remote_path, error = %e, "could not record interruption");
                }
                Some(FileError::Interrupted)
            }
            Err(e) => {
                task.state = FileState::Failed;
                error!(file = %task.remote_path, error = %e, "file failed");
                if let Err(store_err) = self
                    .store
                    .record_file_state(model_id, &task.remote_path, FileState::Failed, false, Some(e.to_string()))
                    .await
                {
                    error!(file = %task.remote_path, error = %store_err, "could not record file failure");
                }
                Some(e)
            }
        };

        FileResult {
            bytes: task.downloaded_bytes(),
            path: task.remote_path,
            state: task.state,
            verified: task.verified,
            error,
        }
    }

    async fn drive(&self, task: &mut FileTask) -> Result<(), FileError> {
        self.preallocate(task).await?;
        self.set_state(task, FileState::Downloading).await?;

        let mut integrity_failures = 0u32;
        loop {
            self.transfer_pending(task).await?;

            self.set_state(task, FileState::Verifying).await?;
            let part_path = task.part_path();
            let verdict = integrity::check(&part_path, task.checksum.as_deref(), self.job.verify)
                .await
                .map_err(|IntegrityError::Io(e)| FileError::resource(&part_path, e))?;

            match verdict {
                Verdict::Mismatch { actual } => {
                    integrity_failures += 1;
                    let expected = task.checksum.clone().unwrap_or_default();
                    if integrity_failures > self.job.retry_limit {
                        return Err(FileError::Integrity { expected, actual });
                    }
                    warn!(
                        file = %task.remote_path,
                        %expected,
                        %actual,
                        round = integrity_failures,
                        "checksum mismatch, downloading the whole file again"
                    );
                    for chunk in task.chunks.iter_mut() {
                        chunk.state = ChunkState::Pending;
                        chunk.attempts = 0;
                    }
                    self.store
                        .reset_chunks(&self.job.model_id, &task.remote_path, &task.chunks)
                        .await?;
                    self.set_state(task, FileState::Downloading).await?;
                }
                verdict => {
                    task.verified = verdict == Verdict::Verified;
                    if !task.verified {
                        debug!(file = %task.remote_path, "no checksum to verify against, trusting file");
                    }
                    finalize(task).await?;
                    self.set_state(task, FileState::Completed).await?;
                    return Ok(());
                }
            }
        }
    }

    /// Creates the `.part` file at its final size so every chunk can be
    /// written at its own offset.
    async fn preallocate(&self, task: &FileTask) -> Result<(), FileError> {
        let part = task.part_path();
        if let Some(parent) = part.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| FileError::resource(parent, e))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(&part)
            .await
            .map_err(|e| FileError::resource(&part, e))?;
        let existing = file
            .metadata()
            .await
            .map_err(|e| FileError::resource(&part, e))?
            .len();
        if existing != task.total_size {
            file.set_len(task.total_size)
                .await
                .map_err(|e| FileError::resource(&part, e))?;
        }
        Ok(())
    }

    /// Runs every chunk that is not `Done`, at most `max_workers` at a time.
    /// Siblings of a failed chunk are allowed to finish so their progress is
    /// kept for the next run.
    async fn transfer_pending(&self, task: &mut FileTask) -> Result<(), FileError> {
        let mut pending = task
            .chunks
            .iter()
            .filter(|c| !c.is_done())
            .cloned()
            .collect::<Vec<_>>()
            .into_iter();
        if pending.len() == 0 {
            return Ok(());
        }
        debug!(file = %task.remote_path, chunks = pending.len(), "transferring chunks");

        let target = task.target(&self.job.model_id);
        let limit = self.job.max_workers.max(1);
        let mut running = JoinSet::new();
        let mut failure: Option<FileError> = None;
        let mut interrupted = false;

        loop {
            while running.len() < limit && failure.is_none() && !self.cancel.is_cancelled() {
                let Some(chunk) = pending.next() else { break };
                let worker = self.worker.clone();
                let target = target.clone();
                running.spawn(async move { worker.fetch(&target, chunk).await });
            }

            let Some(joined) = running.join_next().await else { break };
            let outcome = match joined {
                Ok(outcome) => outcome,
                Err(e) => {
                    failure.get_or_insert(FileError::Aborted(e.to_string()));
                    continue;
                }
            };

            let (chunk, error) = match outcome {
                ChunkOutcome::Done(chunk) => (chunk, None),
                ChunkOutcome::Cancelled(chunk) => {
                    interrupted = true;
                    (chunk, None)
                }
                ChunkOutcome::Failed(chunk, TransferError::Io { path, source }) => {
                    (chunk, Some(FileError::Resource { path, source }))
                }
                ChunkOutcome::Failed(chunk, source) => {
                    let err = FileError::Transfer {
                        offset: chunk.offset,
                        attempts: chunk.attempts,
                        source,
                    };
                    (chunk, Some(err))
                }
                ChunkOutcome::StoreFailed(chunk, e) => (chunk, Some(FileError::State(e))),
            };
            if let Some(err) = error {
                failure.get_or_insert(err);
            }
            update_chunk(&mut task.chunks, chunk);
        }

        if let Some(err) = failure {
            return Err(err);
        }
        if interrupted || self.cancel.is_cancelled() {
            return Err(FileError::Interrupted);
        }
        Ok(())
    }

    async fn set_state(&self, task: &mut FileTask, state: FileState) -> Result<(), StateError> {
        task.state = state;
        self.store
            .record_file_state(&self.job.model_id, &task.remote_path, state, task.verified, None)
            .await
    }
}

fn update_chunk(chunks: &mut [Chunk], finished: Chunk) {
    if let Some(slot) = chunks.iter_mut().find(|c| c.offset == finished.offset) {
        *slot = finished;
    }
}

/// Moves the completed `.part` file onto its final name.
async fn finalize(task: &FileTask) -> Result<(), FileError> {
    let part = task.part_path();
    tokio::fs::rename(&part, &task.local_path)
        .await
        .map_err(|e| FileError::resource(&task.local_path, e))
}
