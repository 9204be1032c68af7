// src/manager.rs

use crate::catalog::{Catalog, CatalogError};
use crate::downloader::ChunkWorker;
use crate::file_task::{FileError, FileResult, FileTaskManager};
use crate::integrity;
use crate::models::{
    Chunk, ChunkState, FileRecord, FileState, FileTask, Job, JobState, RemoteFile, StatusRecord,
};
use crate::state_manager::{StateError, StatusStore};
use crate::transport::RangeTransport;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("catalog error: {0}")]
    Catalog(#[from] CatalogError),
    #[error("status store error: {0}")]
    State(#[from] StateError),
}

/// Aggregated outcome of one `run`, files in catalog order.
#[derive(Debug)]
pub struct JobResult {
    pub model_id: String,
    pub state: JobState,
    pub files: Vec<FileResult>,
}

impl JobResult {
    pub fn completed_count(&self) -> usize {
        self.files.iter().filter(|f| f.is_completed()).count()
    }

    pub fn failed_count(&self) -> usize {
        self.files.iter().filter(|f| f.is_failed()).count()
    }

    pub fn is_success(&self) -> bool {
        self.state == JobState::Completed
    }
}

/// Drives one model download from catalog listing to the terminal job state.
pub struct DownloadManager<C, T, S> {
    catalog: Arc<C>,
    transport: Arc<T>,
    store: Arc<S>,
    cancel: CancellationToken,
}

impl<C, T, S> DownloadManager<C, T, S>
where
    C: Catalog,
    T: RangeTransport,
    S: StatusStore,
{
    pub fn new(catalog: Arc<C>, transport: Arc<T>, store: Arc<S>, cancel: CancellationToken) -> Self {
        Self {
            catalog,
            transport,
            store,
            cancel,
        }
    }

    pub async fn run(&self, job: Job) -> Result<JobResult, ManagerError> {
        let job = Arc::new(job);
        info!(
            model = %job.model_id,
            save_dir = %job.save_dir.display(),
            workers = job.max_workers,
            "starting download"
        );

        let remote_files = self.catalog.list_files(&job.model_id).await?;
        let (previous, unreadable) = match self.store.load(&job.model_id).await {
            Ok(record) => (record, false),
            Err(e) => {
                warn!(model = %job.model_id, error = %e, "status record unreadable, rechecking local files");
                (None, true)
            }
        };
        if let Some(record) = &previous {
            debug!(model = %job.model_id, state = record.state.as_str(), "resuming from status record");
        }

        let mut records = Vec::with_capacity(remote_files.len());
        let mut settled: Vec<(usize, FileResult)> = Vec::new();
        let mut pending: Vec<(usize, FileTask)> = Vec::new();

        for (position, remote) in remote_files.iter().enumerate() {
            let url = self.catalog.download_url(&job.model_id, &remote.path);
            let Some(task) = FileTask::new(&job, remote, url) else {
                let err = FileError::InvalidPath(remote.path.clone());
                error!(model = %job.model_id, file = %remote.path, "refusing to download outside the save directory");
                records.push(invalid_record(remote, &err));
                settled.push((position, FileResult {
                    path: remote.path.clone(),
                    state: FileState::Failed,
                    verified: false,
                    bytes: 0,
                    error: Some(err),
                }));
                continue;
            };

            let prior = previous.as_ref().and_then(|r| r.file(&remote.path));
            let task = resume_plan(task, prior, unreadable, job.verify).await;
            records.push(task.to_record());
            if task.state == FileState::Completed {
                debug!(file = %task.remote_path, "already complete, skipping");
                settled.push((position, FileResult {
                    bytes: task.total_size,
                    path: task.remote_path,
                    state: FileState::Completed,
                    verified: task.verified,
                    error: None,
                }));
            } else {
                pending.push((position, task));
            }
        }

        self.store
            .save_record(&StatusRecord {
                model_id: job.model_id.clone(),
                save_dir: job.save_dir.clone(),
                state: JobState::Running,
                files: records,
                updated_at: 0,
            })
            .await?;
        info!(
            model = %job.model_id,
            files = remote_files.len(),
            to_download = pending.len(),
            "download plan recorded"
        );

        let mut results = settled;
        results.extend(self.download_all(&job, pending).await);
        results.sort_by_key(|(position, _)| *position);
        let files: Vec<FileResult> = results.into_iter().map(|(_, r)| r).collect();

        let state = if self.cancel.is_cancelled() || files.iter().any(FileResult::is_interrupted) {
            JobState::Interrupted
        } else if files.iter().any(FileResult::is_failed) {
            JobState::Failed
        } else {
            JobState::Completed
        };
        self.store.record_job_state(&job.model_id, state).await?;

        let result = JobResult {
            model_id: job.model_id.clone(),
            state,
            files,
        };
        info!(
            model = %result.model_id,
            state = state.as_str(),
            completed = result.completed_count(),
            failed = result.failed_count(),
            "download finished"
        );
        Ok(result)
    }

    /// One task per file, at most `max_workers` files at a time, sharing a
    /// job-wide pool of `max_workers` transfer slots.
    async fn download_all(&self, job: &Arc<Job>, pending: Vec<(usize, FileTask)>) -> Vec<(usize, FileResult)> {
        let limit = job.max_workers.max(1);
        let slots = Arc::new(Semaphore::new(limit));
        let file_gate = Arc::new(Semaphore::new(limit));
        let worker = ChunkWorker::new(
            self.transport.clone(),
            self.store.clone(),
            slots,
            job.retry_limit,
            job.retry_backoff,
            self.cancel.clone(),
        );
        let files = Arc::new(FileTaskManager::new(
            job.clone(),
            worker,
            self.store.clone(),
            self.cancel.clone(),
        ));

        let mut handles: Vec<(usize, String, JoinHandle<FileResult>)> = Vec::with_capacity(pending.len());
        for (position, task) in pending {
            let files = files.clone();
            let gate = file_gate.clone();
            let cancel = self.cancel.clone();
            let path = task.remote_path.clone();
            let handle = tokio::spawn(async move {
                let permit = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => None,
                    permit = gate.acquire_owned() => permit.ok(),
                };
                match permit {
                    Some(_permit) => files.process(task).await,
                    None => FileResult {
                        bytes: task.downloaded_bytes(),
                        path: task.remote_path,
                        state: FileState::Pending,
                        verified: false,
                        error: Some(FileError::Interrupted),
                    },
                }
            });
            handles.push((position, path, handle));
        }

        let mut results = Vec::with_capacity(handles.len());
        for (position, path, handle) in handles {
            let result = match handle.await {
                Ok(result) => result,
                Err(e) => {
                    error!(file = %path, error = %e, "file task aborted");
                    let err = FileError::Aborted(e.to_string());
                    if let Err(store_err) = self
                        .store
                        .record_file_state(&job.model_id, &path, FileState::Failed, false, Some(err.to_string()))
                        .await
                    {
                        error!(file = %path, error = %store_err, "could not record aborted file");
                    }
                    FileResult {
                        path,
                        state: FileState::Failed,
                        verified: false,
                        bytes: 0,
                        error: Some(err),
                    }
                }
            };
            results.push((position, result));
        }
        results
    }
}

fn invalid_record(remote: &RemoteFile, err: &FileError) -> FileRecord {
    FileRecord {
        path: remote.path.clone(),
        size: remote.size,
        checksum: remote.checksum.clone(),
        verified: false,
        state: FileState::Failed,
        error: Some(err.to_string()),
        chunks: Vec::new(),
    }
}

async fn file_len(path: &Path) -> Option<u64> {
    tokio::fs::metadata(path)
        .await
        .ok()
        .filter(|m| m.is_file())
        .map(|m| m.len())
}

fn same_checksum(a: Option<&str>, b: Option<&str>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => a.eq_ignore_ascii_case(b),
        (None, None) => true,
        _ => false,
    }
}

fn mark_completed(task: &mut FileTask, verified: bool) {
    task.state = FileState::Completed;
    task.verified = verified;
    task.error = None;
    for chunk in task.chunks.iter_mut() {
        chunk.state = ChunkState::Done;
    }
}

/// Decides how much of a file still has to be fetched, given what the status
/// record says about it.
///
/// A record is only adopted when it describes the same remote file, its
/// chunks partition the file and the bytes it claims are actually on disk.
/// Everything else goes through [`reverify`].
pub async fn resume_plan(
    mut task: FileTask,
    previous: Option<&FileRecord>,
    unreadable: bool,
    verify: bool,
) -> FileTask {
    let Some(prev) = previous else {
        if unreadable {
            return reverify(task, false, verify).await;
        }
        return task;
    };

    let same_file = prev.size == task.total_size
        && same_checksum(prev.checksum.as_deref(), task.checksum.as_deref());
    if !same_file {
        debug!(file = %task.remote_path, "remote file changed since last run");
        return reverify(task, false, verify).await;
    }
    if !prev.is_consistent() {
        warn!(file = %task.remote_path, "chunk records do not cover the file, rechecking");
        return reverify(task, false, verify).await;
    }

    if prev.state == FileState::Completed {
        if file_len(&task.local_path).await == Some(task.total_size) {
            mark_completed(&mut task, prev.verified);
            return task;
        }
        return reverify(task, true, verify).await;
    }

    let has_done = prev.chunks.iter().any(Chunk::is_done);
    if has_done && file_len(&task.part_path()).await != Some(task.total_size) {
        return reverify(task, prev.all_chunks_done(), verify).await;
    }

    task.chunks = prev
        .chunks
        .iter()
        .map(|c| match c.state {
            ChunkState::Done => c.clone(),
            _ => Chunk::new(c.offset, c.length),
        })
        .collect();
    task
}

/// Re-verification pass over whatever is on disk. A full-size local or
/// `.part` file is accepted when its digest matches, or, when there is
/// nothing to compare against, if the record claimed every chunk done.
/// Otherwise the file starts over.
async fn reverify(mut task: FileTask, claimed_done: bool, verify: bool) -> FileTask {
    let part = task.part_path();
    for candidate in [task.local_path.clone(), part.clone()] {
        if file_len(&candidate).await != Some(task.total_size) {
            continue;
        }
        let accepted = match task.checksum.as_deref() {
            Some(sum) if verify => match integrity::verify_sha256(&candidate, sum).await {
                Ok(matches) => matches.then_some(true),
                Err(e) => {
                    warn!(file = %candidate.display(), error = %e, "could not hash existing file");
                    None
                }
            },
            _ if claimed_done => Some(false),
            _ => None,
        };
        let Some(verified) = accepted else { continue };

        if candidate == part {
            if let Err(e) = tokio::fs::rename(&part, &task.local_path).await {
                warn!(file = %part.display(), error = %e, "could not move finished part file");
                continue;
            }
        }
        info!(file = %task.remote_path, verified, "existing file accepted");
        mark_completed(&mut task, verified);
        return task;
    }

    debug!(file = %task.remote_path, "starting file from scratch");
    task
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::plan_chunks;
    use sha2::{Digest, Sha256};
    use tempfile::TempDir;

    fn sha(data: &[u8]) -> String {
        format!("{:x}", Sha256::digest(data))
    }

    fn task_in(dir: &TempDir, size: u64, checksum: Option<String>) -> FileTask {
        let mut job = Job::new("m", dir.path());
        job.chunk_size = 4;
        let remote = RemoteFile { path: "w.bin".into(), size, checksum };
        FileTask::new(&job, &remote, "http://host/w.bin".into()).unwrap()
    }

    fn record_of(task: &FileTask, states: &[ChunkState]) -> FileRecord {
        let mut record = task.to_record();
        record.state = FileState::Downloading;
        for (chunk, state) in record.chunks.iter_mut().zip(states) {
            chunk.state = *state;
            chunk.attempts = 2;
        }
        record
    }

    #[tokio::test]
    async fn adopts_done_chunks_and_resets_the_rest() {
        let dir = TempDir::new().unwrap();
        let task = task_in(&dir, 10, None);
        std::fs::write(task.part_path(), vec![0u8; 10]).unwrap();
        let prev = record_of(&task, &[ChunkState::Done, ChunkState::InFlight, ChunkState::Failed]);

        let planned = resume_plan(task, Some(&prev), false, true).await;
        let states: Vec<_> = planned.chunks.iter().map(|c| c.state).collect();
        assert_eq!(states, vec![ChunkState::Done, ChunkState::Pending, ChunkState::Pending]);
        assert_eq!(planned.chunks[1].attempts, 0);
        assert_eq!(planned.state, FileState::Pending);
    }

    #[tokio::test]
    async fn done_chunks_without_part_file_start_over() {
        let dir = TempDir::new().unwrap();
        let task = task_in(&dir, 10, None);
        let prev = record_of(&task, &[ChunkState::Done, ChunkState::Done, ChunkState::Pending]);

        let planned = resume_plan(task, Some(&prev), false, true).await;
        assert!(planned.chunks.iter().all(|c| c.state == ChunkState::Pending));
    }

    #[tokio::test]
    async fn completed_file_on_disk_is_skipped() {
        let dir = TempDir::new().unwrap();
        let task = task_in(&dir, 10, None);
        std::fs::write(&task.local_path, vec![1u8; 10]).unwrap();
        let mut prev = record_of(&task, &[ChunkState::Done; 3]);
        prev.state = FileState::Completed;
        prev.verified = true;

        let planned = resume_plan(task, Some(&prev), false, true).await;
        assert_eq!(planned.state, FileState::Completed);
        assert!(planned.verified);
    }

    #[tokio::test]
    async fn inconsistent_record_is_reverified_against_checksum() {
        let dir = TempDir::new().unwrap();
        let data = vec![7u8; 10];
        let task = task_in(&dir, 10, Some(sha(&data)));
        std::fs::write(&task.local_path, &data).unwrap();
        let mut prev = task.to_record();
        prev.chunks = vec![Chunk::new(0, 4)];

        let planned = resume_plan(task, Some(&prev), false, true).await;
        assert_eq!(planned.state, FileState::Completed);
        assert!(planned.verified);
    }

    #[tokio::test]
    async fn finished_part_file_is_moved_into_place() {
        let dir = TempDir::new().unwrap();
        let data = vec![5u8; 10];
        let task = task_in(&dir, 10, Some(sha(&data)));
        std::fs::write(task.part_path(), &data).unwrap();
        let local = task.local_path.clone();

        let planned = resume_plan(task, None, true, true).await;
        assert_eq!(planned.state, FileState::Completed);
        assert_eq!(std::fs::read(local).unwrap(), data);
    }

    #[tokio::test]
    async fn unchecked_file_is_trusted_only_when_record_claimed_it_done() {
        let dir = TempDir::new().unwrap();
        let task = task_in(&dir, 10, None);
        std::fs::write(&task.local_path, vec![0u8; 10]).unwrap();

        let fresh = resume_plan(task.clone(), None, true, true).await;
        assert_eq!(fresh.state, FileState::Pending);

        let mut prev = record_of(&task, &[ChunkState::Done; 3]);
        prev.state = FileState::Verifying;
        let trusted = resume_plan(task, Some(&prev), false, true).await;
        assert_eq!(trusted.state, FileState::Completed);
        assert!(!trusted.verified);
    }

    #[tokio::test]
    async fn changed_remote_file_is_not_adopted() {
        let dir = TempDir::new().unwrap();
        let task = task_in(&dir, 12, None);
        std::fs::write(task.part_path(), vec![0u8; 12]).unwrap();
        let mut prev = task.to_record();
        prev.size = 10;
        prev.chunks = plan_chunks(10, 4);
        prev.chunks[0].state = ChunkState::Done;

        let planned = resume_plan(task, Some(&prev), false, true).await;
        assert_eq!(planned.chunks.len(), 3);
        assert!(planned.chunks.iter().all(|c| c.state == ChunkState::Pending));
    }
}
