#![allow(dead_code)]

use bytes::Bytes;
use futures_util::StreamExt;
use modelget::prelude::*;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub const MODEL: &str = "org/tiny-model";

pub fn sha(data: &[u8]) -> String {
    format!("{:x}", Sha256::digest(data))
}

/// Deterministic, non-repeating content for a file.
pub fn content(seed: u8, len: usize) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u32).wrapping_mul(31).wrapping_add(seed as u32) as u8)
        .collect()
}

pub fn url_for(path: &str) -> String {
    format!("fake://{}/{}", MODEL, path)
}

/// Catalog serving a fixed file list.
pub struct FakeCatalog {
    pub files: Vec<RemoteFile>,
}

impl FakeCatalog {
    pub fn new(files: &[(&str, &[u8], bool)]) -> Self {
        let files = files
            .iter()
            .map(|(path, data, with_checksum)| RemoteFile {
                path: path.to_string(),
                size: data.len() as u64,
                checksum: with_checksum.then(|| sha(data)),
            })
            .collect();
        Self { files }
    }
}

impl Catalog for FakeCatalog {
    async fn list_files(&self, _model_id: &str) -> Result<Vec<RemoteFile>, CatalogError> {
        Ok(self.files.clone())
    }

    fn download_url(&self, _model_id: &str, remote_path: &str) -> String {
        url_for(remote_path)
    }
}

/// In-memory content host that records every range it serves.
#[derive(Default)]
pub struct FakeTransport {
    contents: HashMap<String, Vec<u8>>,
    /// Urls that always answer with a server error.
    broken: HashSet<String>,
    /// Urls whose first N full-file passes come back with a flipped byte.
    corrupt: Mutex<HashMap<String, usize>>,
    requests: Mutex<Vec<(String, u64, u64)>>,
    /// Cancel this token once that many ranges have been opened.
    cancel_after: Option<(usize, CancellationToken)>,
    opened: AtomicUsize,
    delay: Duration,
}

impl FakeTransport {
    pub fn new(files: &[(&str, &[u8])]) -> Self {
        Self {
            contents: files
                .iter()
                .map(|(path, data)| (url_for(path), data.to_vec()))
                .collect(),
            ..Default::default()
        }
    }

    pub fn broken(mut self, path: &str) -> Self {
        self.broken.insert(url_for(path));
        self
    }

    pub fn corrupt(self, path: &str, rounds: usize) -> Self {
        if let Ok(mut corrupt) = self.corrupt.lock() {
            corrupt.insert(url_for(path), rounds);
        }
        self
    }

    pub fn cancel_after(mut self, ranges: usize, token: CancellationToken) -> Self {
        self.cancel_after = Some((ranges, token));
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn requests(&self) -> Vec<(String, u64, u64)> {
        self.requests.lock().unwrap().clone()
    }

    pub fn requests_for(&self, path: &str) -> Vec<(u64, u64)> {
        let url = url_for(path);
        self.requests()
            .into_iter()
            .filter(|(u, _, _)| *u == url)
            .map(|(_, offset, length)| (offset, length))
            .collect()
    }
}

impl RangeTransport for FakeTransport {
    async fn open_range(&self, url: &str, offset: u64, length: u64) -> Result<ByteStream, TransferError> {
        self.requests
            .lock()
            .unwrap()
            .push((url.to_string(), offset, length));
        let opened = self.opened.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some((limit, token)) = &self.cancel_after {
            if opened >= *limit {
                token.cancel();
            }
        }
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        if self.broken.contains(url) {
            return Err(TransferError::UnexpectedStatus {
                status: 503,
                offset,
                length,
            });
        }
        let data = self
            .contents
            .get(url)
            .ok_or_else(|| TransferError::Connection(format!("no such url {}", url)))?;
        let mut body = data[offset as usize..(offset + length) as usize].to_vec();

        // The last chunk of a pass decides whether that pass is corrupted.
        if offset + length == data.len() as u64 {
            let mut corrupt = self.corrupt.lock().unwrap();
            if let Some(left) = corrupt.get_mut(url).filter(|left| **left > 0) {
                *left -= 1;
                body[0] ^= 0xFF;
            }
        }

        // Split the body to exercise multi-part writes.
        let mid = body.len() / 2;
        let second = body.split_off(mid);
        let parts = vec![Ok(Bytes::from(body)), Ok(Bytes::from(second))];
        Ok(futures_util::stream::iter(parts).boxed())
    }
}

/// Store wrapper asserting that every chunk reported `Done` is already on
/// disk with the right bytes.
pub struct CheckingStore {
    pub inner: MemoryStatusStore,
    save_dir: PathBuf,
    chunk_size: u64,
    contents: HashMap<String, Vec<u8>>,
    pub checked: AtomicUsize,
    pub violations: Mutex<Vec<String>>,
}

impl CheckingStore {
    pub fn new(save_dir: PathBuf, chunk_size: u64, files: &[(&str, &[u8])]) -> Self {
        Self {
            inner: MemoryStatusStore::new(),
            save_dir,
            chunk_size,
            contents: files
                .iter()
                .map(|(path, data)| (path.to_string(), data.to_vec()))
                .collect(),
            checked: AtomicUsize::new(0),
            violations: Mutex::new(Vec::new()),
        }
    }

    fn check_on_disk(&self, file_path: &str, offset: u64) {
        let Some(expected) = self.contents.get(file_path) else { return };
        let end = (offset + self.chunk_size).min(expected.len() as u64) as usize;
        let part = self.save_dir.join(format!("{}.part", file_path));
        let on_disk = std::fs::read(&part).unwrap_or_default();
        let ok = on_disk.len() >= end && on_disk[offset as usize..end] == expected[offset as usize..end];
        self.checked.fetch_add(1, Ordering::SeqCst);
        if !ok {
            self.violations
                .lock()
                .unwrap()
                .push(format!("{}@{}", file_path, offset));
        }
    }
}

impl StatusStore for CheckingStore {
    async fn save_record(&self, record: &StatusRecord) -> Result<(), StateError> {
        self.inner.save_record(record).await
    }

    async fn record_chunk(
        &self,
        model_id: &str,
        file_path: &str,
        offset: u64,
        state: ChunkState,
        attempts: u32,
    ) -> Result<(), StateError> {
        if state == ChunkState::Done {
            self.check_on_disk(file_path, offset);
        }
        self.inner
            .record_chunk(model_id, file_path, offset, state, attempts)
            .await
    }

    async fn record_file_state(
        &self,
        model_id: &str,
        file_path: &str,
        state: FileState,
        verified: bool,
        error: Option<String>,
    ) -> Result<(), StateError> {
        self.inner
            .record_file_state(model_id, file_path, state, verified, error)
            .await
    }

    async fn reset_chunks(&self, model_id: &str, file_path: &str, chunks: &[Chunk]) -> Result<(), StateError> {
        self.inner.reset_chunks(model_id, file_path, chunks).await
    }

    async fn record_job_state(&self, model_id: &str, state: JobState) -> Result<(), StateError> {
        self.inner.record_job_state(model_id, state).await
    }

    async fn load(&self, model_id: &str) -> Result<Option<StatusRecord>, StateError> {
        self.inner.load(model_id).await
    }

    async fn snapshot(&self, model_id: &str) -> Result<Option<StatusRecord>, StateError> {
        self.inner.snapshot(model_id).await
    }

    async fn delete(&self, model_id: &str) -> Result<bool, StateError> {
        self.inner.delete(model_id).await
    }
}

pub fn job(save_dir: &std::path::Path, chunk_size: u64, workers: usize) -> Job {
    let mut job = Job::new(MODEL, save_dir);
    job.chunk_size = chunk_size;
    job.max_workers = workers;
    job.retry_limit = 2;
    job.retry_backoff = Duration::from_millis(1);
    job
}
