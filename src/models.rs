// src/models.rs

use serde::{Deserialize, Serialize};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_CHUNK_SIZE: u64 = 8 * 1024 * 1024;
pub const DEFAULT_MAX_WORKERS: usize = 4;
pub const DEFAULT_RETRY_LIMIT: u32 = 3;
pub const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_secs(1);

/// The state of a single byte range.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ChunkState {
    Pending,
    InFlight,
    Done,
    Failed,
}

impl ChunkState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChunkState::Pending => "pending",
            ChunkState::InFlight => "in_flight",
            ChunkState::Done => "done",
            ChunkState::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(ChunkState::Pending),
            "in_flight" => Some(ChunkState::InFlight),
            "done" => Some(ChunkState::Done),
            "failed" => Some(ChunkState::Failed),
            _ => None,
        }
    }
}

/// Aggregate state of one remote file.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FileState {
    Pending,
    Downloading,
    Verifying,
    Completed,
    Failed,
}

impl FileState {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileState::Pending => "pending",
            FileState::Downloading => "downloading",
            FileState::Verifying => "verifying",
            FileState::Completed => "completed",
            FileState::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(FileState::Pending),
            "downloading" => Some(FileState::Downloading),
            "verifying" => Some(FileState::Verifying),
            "completed" => Some(FileState::Completed),
            "failed" => Some(FileState::Failed),
            _ => None,
        }
    }
}

/// State of a whole job as persisted in the status record.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Running,
    Completed,
    Failed,
    Interrupted,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Running => "running",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Interrupted => "interrupted",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "running" => Some(JobState::Running),
            "completed" => Some(JobState::Completed),
            "failed" => Some(JobState::Failed),
            "interrupted" => Some(JobState::Interrupted),
            _ => None,
        }
    }
}

/// A contiguous byte range `[offset, offset + length)` of one file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Chunk {
    pub offset: u64,
    pub length: u64,
    pub state: ChunkState,
    pub attempts: u32,
}

impl Chunk {
    pub fn new(offset: u64, length: u64) -> Self {
        Self {
            offset,
            length,
            state: ChunkState::Pending,
            attempts: 0,
        }
    }

    /// Exclusive end of the range.
    pub fn end(&self) -> u64 {
        self.offset + self.length
    }

    pub fn is_done(&self) -> bool {
        self.state == ChunkState::Done
    }
}

/// Splits `total_size` bytes into ranges of `chunk_size`, the last one
/// truncated to the remainder. An empty file has no chunks.
pub fn plan_chunks(total_size: u64, chunk_size: u64) -> Vec<Chunk> {
    let chunk_size = chunk_size.max(1);
    let count = total_size.div_ceil(chunk_size);
    (0..count)
        .map(|i| {
            let offset = i * chunk_size;
            Chunk::new(offset, chunk_size.min(total_size - offset))
        })
        .collect()
}

/// Whether `chunks`, in order, cover `[0, total_size)` with no gap or overlap.
pub fn chunks_partition(chunks: &[Chunk], total_size: u64) -> bool {
    let mut expected = 0u64;
    for chunk in chunks {
        if chunk.offset != expected || chunk.length == 0 {
            return false;
        }
        expected = match expected.checked_add(chunk.length) {
            Some(end) => end,
            None => return false,
        };
    }
    expected == total_size
}

/// One entry of a model's file list, as supplied by the catalog.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RemoteFile {
    pub path: String,
    pub size: u64,
    pub checksum: Option<String>,
}

/// Parameters of one download invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub model_id: String,
    pub save_dir: PathBuf,
    pub max_workers: usize,
    pub retry_limit: u32,
    pub chunk_size: u64,
    pub verify: bool,
    /// Base delay of the exponential backoff between chunk attempts.
    pub retry_backoff: Duration,
}

impl Job {
    pub fn new(model_id: impl Into<String>, save_dir: impl Into<PathBuf>) -> Self {
        Self {
            model_id: model_id.into(),
            save_dir: save_dir.into(),
            max_workers: DEFAULT_MAX_WORKERS,
            retry_limit: DEFAULT_RETRY_LIMIT,
            chunk_size: DEFAULT_CHUNK_SIZE,
            verify: true,
            retry_backoff: DEFAULT_RETRY_BACKOFF,
        }
    }
}

/// Joins a catalog path onto the save directory, refusing anything that
/// could escape it.
pub fn local_path_for(save_dir: &Path, remote_path: &str) -> Option<PathBuf> {
    let relative = Path::new(remote_path);
    let mut normal = 0;
    for component in relative.components() {
        match component {
            Component::Normal(_) => normal += 1,
            Component::CurDir => {}
            _ => return None,
        }
    }
    if normal == 0 {
        return None;
    }
    Some(save_dir.join(relative))
}

/// Where the bytes of `local_path` live until the file completes.
/// e.g. "/models/a/model.bin" -> "/models/a/model.bin.part"
pub fn part_path_for(local_path: &Path) -> PathBuf {
    let mut name = local_path.as_os_str().to_os_string();
    name.push(".part");
    PathBuf::from(name)
}

/// One remote file to materialize locally.
#[derive(Debug, Clone)]
pub struct FileTask {
    pub remote_path: String,
    pub local_path: PathBuf,
    pub url: String,
    pub total_size: u64,
    pub checksum: Option<String>,
    pub chunks: Vec<Chunk>,
    pub state: FileState,
    pub verified: bool,
    pub error: Option<String>,
}

impl FileTask {
    /// Builds a fresh task with every chunk pending. Returns `None` when the
    /// remote path cannot be mapped under the save directory.
    pub fn new(job: &Job, remote: &RemoteFile, url: String) -> Option<Self> {
        let local_path = local_path_for(&job.save_dir, &remote.path)?;
        Some(Self {
            remote_path: remote.path.clone(),
            local_path,
            url,
            total_size: remote.size,
            checksum: remote.checksum.clone(),
            chunks: plan_chunks(remote.size, job.chunk_size),
            state: FileState::Pending,
            verified: false,
            error: None,
        })
    }

    pub fn part_path(&self) -> PathBuf {
        part_path_for(&self.local_path)
    }

    pub fn downloaded_bytes(&self) -> u64 {
        if self.state == FileState::Completed {
            return self.total_size;
        }
        self.chunks
            .iter()
            .filter(|c| c.is_done())
            .map(|c| c.length)
            .sum()
    }

    /// Everything a chunk worker needs to know about the file it writes to.
    pub fn target(&self, model_id: &str) -> Arc<ChunkTarget> {
        Arc::new(ChunkTarget {
            model_id: model_id.to_string(),
            remote_path: self.remote_path.clone(),
            url: self.url.clone(),
            part_path: self.part_path(),
        })
    }

    pub fn to_record(&self) -> FileRecord {
        FileRecord {
            path: self.remote_path.clone(),
            size: self.total_size,
            checksum: self.checksum.clone(),
            verified: self.verified,
            state: self.state,
            error: self.error.clone(),
            chunks: self.chunks.clone(),
        }
    }
}

/// Immutable description of the destination a chunk is written into.
#[derive(Debug, Clone)]
pub struct ChunkTarget {
    pub model_id: String,
    pub remote_path: String,
    pub url: String,
    pub part_path: PathBuf,
}

/// Persisted state of one file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileRecord {
    pub path: String,
    pub size: u64,
    pub checksum: Option<String>,
    pub verified: bool,
    pub state: FileState,
    pub error: Option<String>,
    pub chunks: Vec<Chunk>,
}

impl FileRecord {
    pub fn downloaded_bytes(&self) -> u64 {
        if self.state == FileState::Completed {
            return self.size;
        }
        self.chunks
            .iter()
            .filter(|c| c.is_done())
            .map(|c| c.length)
            .sum()
    }

    pub fn is_consistent(&self) -> bool {
        chunks_partition(&self.chunks, self.size)
    }

    pub fn all_chunks_done(&self) -> bool {
        self.chunks.iter().all(Chunk::is_done)
    }
}

/// The durable projection of one job, keyed by model id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StatusRecord {
    pub model_id: String,
    pub save_dir: PathBuf,
    pub state: JobState,
    pub files: Vec<FileRecord>,
    /// Unix timestamp (seconds) of the last write.
    pub updated_at: i64,
}

impl StatusRecord {
    pub fn file(&self, path: &str) -> Option<&FileRecord> {
        self.files.iter().find(|f| f.path == path)
    }
}
