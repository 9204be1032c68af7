//! Progress reporting from a read-only snapshot of the status store.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

use crate::models::{FileRecord, FileState, JobState, StatusRecord};
use crate::state_manager::{StateError, StatusStore};

#[derive(Debug, Error)]
pub enum StatusError {
    #[error("no download recorded for {0}")]
    NotFound(String),
    #[error("status store error: {0}")]
    State(#[from] StateError),
}

/// Job state as seen by an observer.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OverallState {
    InProgress,
    Completed,
    Failed,
    Interrupted,
}

impl OverallState {
    pub fn as_str(&self) -> &'static str {
        match self {
            OverallState::InProgress => "in progress",
            OverallState::Completed => "completed",
            OverallState::Failed => "failed",
            OverallState::Interrupted => "interrupted",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FileSummary {
    pub path: String,
    pub size: u64,
    pub downloaded: u64,
    pub percent: f64,
    pub state: FileState,
    pub verified: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Summary {
    pub model_id: String,
    pub save_dir: PathBuf,
    pub state: OverallState,
    pub total_bytes: u64,
    pub downloaded_bytes: u64,
    pub percent: f64,
    pub completed: usize,
    pub failed: usize,
    pub remaining: usize,
    pub updated_at: DateTime<Utc>,
    pub files: Vec<FileSummary>,
}

fn percent(done: u64, total: u64, complete: bool) -> f64 {
    if total == 0 {
        return if complete { 100.0 } else { 0.0 };
    }
    done as f64 * 100.0 / total as f64
}

fn summarize_file(file: &FileRecord) -> FileSummary {
    let downloaded = file.downloaded_bytes();
    FileSummary {
        path: file.path.clone(),
        size: file.size,
        downloaded,
        percent: percent(downloaded, file.size, file.state == FileState::Completed),
        state: file.state,
        verified: file.verified,
        error: file.error.clone(),
    }
}

/// Builds the observer view of a record. Pure; only the record is consulted.
pub fn summarize(record: &StatusRecord) -> Summary {
    let files: Vec<FileSummary> = record.files.iter().map(summarize_file).collect();
    let completed = files.iter().filter(|f| f.state == FileState::Completed).count();
    let failed = files.iter().filter(|f| f.state == FileState::Failed).count();
    let remaining = files.len() - completed - failed;
    let total_bytes: u64 = files.iter().map(|f| f.size).sum();
    let downloaded_bytes: u64 = files.iter().map(|f| f.downloaded).sum();

    let state = if completed == files.len() {
        OverallState::Completed
    } else if failed > 0 && remaining == 0 {
        OverallState::Failed
    } else if record.state == JobState::Interrupted {
        OverallState::Interrupted
    } else {
        OverallState::InProgress
    };

    Summary {
        model_id: record.model_id.clone(),
        save_dir: record.save_dir.clone(),
        state,
        total_bytes,
        downloaded_bytes,
        percent: percent(downloaded_bytes, total_bytes, completed == files.len()),
        completed,
        failed,
        remaining,
        updated_at: DateTime::from_timestamp(record.updated_at, 0).unwrap_or_default(),
        files,
    }
}

impl Summary {
    /// A record still marked running while no process holds the model's
    /// lock belongs to a run that died without recording its end.
    pub fn without_live_run(mut self) -> Self {
        if self.state == OverallState::InProgress {
            self.state = OverallState::Interrupted;
        }
        self
    }
}

/// Read side of the status store.
pub struct StatusQuery<S> {
    store: Arc<S>,
}

impl<S: StatusStore> StatusQuery<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    pub async fn status(&self, model_id: &str) -> Result<Summary, StatusError> {
        let record = self
            .store
            .snapshot(model_id)
            .await?
            .ok_or_else(|| StatusError::NotFound(model_id.to_string()))?;
        Ok(summarize(&record))
    }
}

/// e.g. 1536 -> "1.5 KiB"
fn human_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} B", bytes)
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}

impl fmt::Display for Summary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{} [{}] {:.1}% ({} / {})",
            self.model_id,
            self.state.as_str(),
            self.percent,
            human_bytes(self.downloaded_bytes),
            human_bytes(self.total_bytes)
        )?;
        writeln!(f, "  save dir: {}", self.save_dir.display())?;
        writeln!(
            f,
            "  files: {} completed, {} failed, {} remaining",
            self.completed, self.failed, self.remaining
        )?;
        writeln!(f, "  updated: {}", self.updated_at.format("%Y-%m-%d %H:%M:%S UTC"))?;
        for file in &self.files {
            let mark = if file.verified { " (verified)" } else { "" };
            write!(
                f,
                "  {:>11} {:>6.1}%  {}{}",
                file.state.as_str(),
                file.percent,
                file.path,
                mark
            )?;
            if let Some(error) = &file.error {
                write!(f, ": {}", error)?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{plan_chunks, ChunkState};
    use crate::state_manager::MemoryStatusStore;

    fn file(path: &str, size: u64, state: FileState, done: usize) -> FileRecord {
        let mut chunks = plan_chunks(size, 4);
        for chunk in chunks.iter_mut().take(done) {
            chunk.state = ChunkState::Done;
        }
        FileRecord {
            path: path.into(),
            size,
            checksum: None,
            verified: state == FileState::Completed,
            state,
            error: (state == FileState::Failed).then(|| "checksum mismatch".to_string()),
            chunks,
        }
    }

    fn record(state: JobState, files: Vec<FileRecord>) -> StatusRecord {
        StatusRecord {
            model_id: "org/model".into(),
            save_dir: PathBuf::from("/models"),
            state,
            files,
            updated_at: 1_700_000_000,
        }
    }

    #[test]
    fn counts_only_done_chunks() {
        let summary = summarize(&record(
            JobState::Running,
            vec![
                file("a", 8, FileState::Completed, 2),
                file("b", 10, FileState::Downloading, 1),
                file("c", 2, FileState::Pending, 0),
            ],
        ));
        assert_eq!(summary.total_bytes, 20);
        assert_eq!(summary.downloaded_bytes, 12);
        assert_eq!(summary.percent, 60.0);
        assert_eq!(summary.files[1].percent, 40.0);
        assert_eq!((summary.completed, summary.failed, summary.remaining), (1, 0, 2));
        assert_eq!(summary.state, OverallState::InProgress);
    }

    #[test]
    fn derives_overall_state() {
        let done = summarize(&record(JobState::Running, vec![file("a", 4, FileState::Completed, 1)]));
        assert_eq!(done.state, OverallState::Completed);

        let failed = summarize(&record(
            JobState::Failed,
            vec![file("a", 4, FileState::Completed, 1), file("b", 4, FileState::Failed, 0)],
        ));
        assert_eq!(failed.state, OverallState::Failed);
        assert_eq!(failed.files[1].error.as_deref(), Some("checksum mismatch"));

        let interrupted = summarize(&record(JobState::Interrupted, vec![file("a", 8, FileState::Pending, 1)]));
        assert_eq!(interrupted.state, OverallState::Interrupted);
    }

    #[test]
    fn running_record_without_a_live_run_is_interrupted() {
        let summary = summarize(&record(
            JobState::Running,
            vec![file("a", 8, FileState::Downloading, 1)],
        ));
        assert_eq!(summary.state, OverallState::InProgress);
        let orphaned = summary.without_live_run();
        assert_eq!(orphaned.state, OverallState::Interrupted);
        assert!(orphaned.to_string().contains("[interrupted]"));

        let done = summarize(&record(JobState::Running, vec![file("a", 4, FileState::Completed, 1)]));
        assert_eq!(done.without_live_run().state, OverallState::Completed);
    }

    #[test]
    fn empty_completed_file_is_full() {
        let summary = summarize(&record(JobState::Completed, vec![file("empty", 0, FileState::Completed, 0)]));
        assert_eq!(summary.files[0].percent, 100.0);
        assert_eq!(summary.percent, 100.0);
    }

    #[test]
    fn renders_text_and_json() {
        let summary = summarize(&record(
            JobState::Running,
            vec![file("a", 4, FileState::Completed, 1), file("b", 4, FileState::Failed, 0)],
        ));
        let text = summary.to_string();
        assert!(text.contains("org/model"));
        assert!(text.contains("(verified)"));
        assert!(text.contains("b: checksum mismatch"));
        assert!(text.contains("2023-11-14"));

        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["state"], "failed");
        assert_eq!(json["files"][0]["state"], "completed");
        assert_eq!(json["files"][1]["state"], "failed");
    }

    #[test]
    fn human_readable_sizes() {
        assert_eq!(human_bytes(12), "12 B");
        assert_eq!(human_bytes(1536), "1.5 KiB");
        assert_eq!(human_bytes(3 * 1024 * 1024 * 1024), "3.0 GiB");
    }

    #[tokio::test]
    async fn unknown_model_is_not_found() {
        let query = StatusQuery::new(Arc::new(MemoryStatusStore::new()));
        assert!(matches!(query.status("nope").await, Err(StatusError::NotFound(_))));
    }

    #[tokio::test]
    async fn reads_from_store_snapshot() {
        let store = Arc::new(MemoryStatusStore::new());
        store
            .save_record(&record(JobState::Running, vec![file("a", 8, FileState::Downloading, 1)]))
            .await
            .unwrap();
        let summary = StatusQuery::new(store).status("org/model").await.unwrap();
        assert_eq!(summary.downloaded_bytes, 4);
    }
}
