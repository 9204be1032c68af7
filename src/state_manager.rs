// src/state_manager.rs

use crate::models::{Chunk, ChunkState, FileRecord, FileState, JobState, StatusRecord};
use rusqlite::{params, OptionalExtension};
use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::RwLock;
use tokio_rusqlite::Connection;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum StateError {
    #[error("database error: {0}")]
    Database(#[from] tokio_rusqlite::Error),
    #[error("database query failed: {0}")]
    Query(#[from] rusqlite::Error),
    #[error("status directory unavailable: {0}")]
    Io(#[from] std::io::Error),
    #[error("no status record for {model_id}, file {path}")]
    UnknownFile { model_id: String, path: String },
    #[error("no chunk at offset {offset} of {path} ({model_id})")]
    UnknownChunk {
        model_id: String,
        path: String,
        offset: u64,
    },
}

/// Durable job/file/chunk state, one record per model id.
///
/// Implementations serialize writes for a model id and make every write
/// durable before returning, so a `Done` chunk reported here is never lost.
/// `snapshot` must not be blocked by an ongoing stream of writes.
pub trait StatusStore: Send + Sync + 'static {
    /// Replaces the whole record (job row, file set and chunk rows).
    fn save_record(
        &self,
        record: &StatusRecord,
    ) -> impl Future<Output = Result<(), StateError>> + Send;

    fn record_chunk(
        &self,
        model_id: &str,
        file_path: &str,
        offset: u64,
        state: ChunkState,
        attempts: u32,
    ) -> impl Future<Output = Result<(), StateError>> + Send;

    fn record_file_state(
        &self,
        model_id: &str,
        file_path: &str,
        state: FileState,
        verified: bool,
        error: Option<String>,
    ) -> impl Future<Output = Result<(), StateError>> + Send;

    /// Replaces the chunk rows of one file.
    fn reset_chunks(
        &self,
        model_id: &str,
        file_path: &str,
        chunks: &[Chunk],
    ) -> impl Future<Output = Result<(), StateError>> + Send;

    fn record_job_state(
        &self,
        model_id: &str,
        state: JobState,
    ) -> impl Future<Output = Result<(), StateError>> + Send;

    fn load(
        &self,
        model_id: &str,
    ) -> impl Future<Output = Result<Option<StatusRecord>, StateError>> + Send;

    /// Read-only consistent view for status queries.
    fn snapshot(
        &self,
        model_id: &str,
    ) -> impl Future<Output = Result<Option<StatusRecord>, StateError>> + Send;

    /// Drops the record of a model id. Local files are left alone.
    fn delete(&self, model_id: &str) -> impl Future<Output = Result<bool, StateError>> + Send;
}

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS jobs (
        model_id    TEXT PRIMARY KEY,
        save_dir    TEXT NOT NULL,
        state       TEXT NOT NULL,
        updated_at  INTEGER NOT NULL
    );
    CREATE TABLE IF NOT EXISTS files (
        model_id    TEXT NOT NULL,
        path        TEXT NOT NULL,
        position    INTEGER NOT NULL,
        size        INTEGER NOT NULL,
        checksum    TEXT,
        verified    INTEGER NOT NULL DEFAULT 0,
        state       TEXT NOT NULL,
        error       TEXT,
        PRIMARY KEY (model_id, path)
    );
    CREATE TABLE IF NOT EXISTS chunks (
        model_id    TEXT NOT NULL,
        path        TEXT NOT NULL,
        start_byte  INTEGER NOT NULL,
        length      INTEGER NOT NULL,
        state       TEXT NOT NULL,
        attempts    INTEGER NOT NULL DEFAULT 0,
        PRIMARY KEY (model_id, path, start_byte)
    );
";

/// Persists status records to an SQLite database.
///
/// All writes go through one connection (tokio-rusqlite runs it on a single
/// background thread), one transaction per update. Snapshots use a second
/// connection; with the WAL journal a reader sees the last committed state
/// and is never blocked by the writer.
pub struct SqliteStatusStore {
    writer: Connection,
    reader: Connection,
}

impl SqliteStatusStore {
    /// Opens (creating if needed) the database file at `db_path`.
    pub async fn open(db_path: &Path) -> Result<Self, StateError> {
        if let Some(parent) = db_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let writer = Connection::open(db_path).await?;
        writer
            .call(|conn| {
                conn.busy_timeout(Duration::from_secs(10))?;
                conn.execute_batch(
                    "PRAGMA journal_mode = WAL;
                     PRAGMA synchronous = FULL;",
                )?;
                conn.execute_batch(SCHEMA)?;
                Ok(())
            })
            .await?;

        let reader = Connection::open(db_path).await?;
        reader
            .call(|conn| {
                conn.busy_timeout(Duration::from_secs(10))?;
                Ok(())
            })
            .await?;

        debug!(path = %db_path.display(), "status store opened");
        Ok(Self {
            writer,
            reader,
        })
    }
}

fn touch_job(tx: &rusqlite::Transaction<'_>, model_id: &str) -> rusqlite::Result<()> {
    tx.execute(
        "UPDATE jobs SET updated_at = ?1 WHERE model_id = ?2",
        params![now(), model_id],
    )?;
    Ok(())
}

fn insert_chunks(
    tx: &rusqlite::Transaction<'_>,
    model_id: &str,
    path: &str,
    chunks: &[Chunk],
) -> rusqlite::Result<()> {
    let mut stmt = tx.prepare(
        "INSERT INTO chunks (model_id, path, start_byte, length, state, attempts)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
    )?;
    for chunk in chunks {
        stmt.execute(params![
            model_id,
            path,
            chunk.offset as i64,
            chunk.length as i64,
            chunk.state.as_str(),
            chunk.attempts,
        ])?;
    }
    Ok(())
}

/// Reads one record inside a single transaction so files and chunks come
/// from the same committed state.
fn read_record(
    conn: &mut rusqlite::Connection,
    model_id: &str,
) -> rusqlite::Result<Option<StatusRecord>> {
    let tx = conn.transaction()?;

    let job = tx
        .query_row(
            "SELECT save_dir, state, updated_at FROM jobs WHERE model_id = ?1",
            params![model_id],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                ))
            },
        )
        .optional()?;
    let Some((save_dir, job_state, updated_at)) = job else {
        return Ok(None);
    };

    let mut chunks: HashMap<String, Vec<Chunk>> = HashMap::new();
    {
        let mut stmt = tx.prepare(
            "SELECT path, start_byte, length, state, attempts FROM chunks
             WHERE model_id = ?1 ORDER BY path, start_byte",
        )?;
        let rows = stmt.query_map(params![model_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, u32>(4)?,
            ))
        })?;
        for row in rows {
            let (path, offset, length, state, attempts) = row?;
            // An unreadable row leaves a gap; the orchestrator treats the
            // file as inconsistent and re-verifies it.
            let Some(state) = ChunkState::parse(&state) else {
                warn!(model = %model_id, %path, offset, %state, "dropping chunk row with unknown state");
                continue;
            };
            if offset < 0 || length < 0 {
                warn!(model = %model_id, %path, offset, length, "dropping chunk row with negative range");
                continue;
            }
            chunks.entry(path).or_default().push(Chunk {
                offset: offset as u64,
                length: length as u64,
                state,
                attempts,
            });
        }
    }

    let mut files = Vec::new();
    {
        let mut stmt = tx.prepare(
            "SELECT path, size, checksum, verified, state, error FROM files
             WHERE model_id = ?1 ORDER BY position",
        )?;
        let rows = stmt.query_map(params![model_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, Option<String>>(2)?,
                row.get::<_, bool>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, Option<String>>(5)?,
            ))
        })?;
        for row in rows {
            let (path, size, checksum, verified, state, error) = row?;
            let state = FileState::parse(&state).unwrap_or_else(|| {
                warn!(model = %model_id, %path, %state, "unknown file state, treating as pending");
                FileState::Pending
            });
            let file_chunks = chunks.remove(&path).unwrap_or_default();
            files.push(FileRecord {
                path,
                size: size.max(0) as u64,
                checksum,
                verified,
                state,
                error,
                chunks: file_chunks,
            });
        }
    }

    let state = JobState::parse(&job_state).unwrap_or(JobState::Interrupted);
    Ok(Some(StatusRecord {
        model_id: model_id.to_string(),
        save_dir: PathBuf::from(save_dir),
        state,
        files,
        updated_at,
    }))
}

impl StatusStore for SqliteStatusStore {
    async fn save_record(&self, record: &StatusRecord) -> Result<(), StateError> {
        let record = record.clone();
        self.writer
            .call(move |conn| {
                let tx = conn.transaction()?;
                let model_id = record.model_id.as_str();
                tx.execute(
                    "INSERT OR REPLACE INTO jobs (model_id, save_dir, state, updated_at)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![
                        model_id,
                        record.save_dir.to_string_lossy().into_owned(),
                        record.state.as_str(),
                        now(),
                    ],
                )?;
                tx.execute("DELETE FROM chunks WHERE model_id = ?1", params![model_id])?;
                tx.execute("DELETE FROM files WHERE model_id = ?1", params![model_id])?;
                for (position, file) in record.files.iter().enumerate() {
                    tx.execute(
                        "INSERT INTO files (model_id, path, position, size, checksum, verified, state, error)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                        params![
                            model_id,
                            file.path,
                            position as i64,
                            file.size as i64,
                            file.checksum,
                            file.verified,
                            file.state.as_str(),
                            file.error,
                        ],
                    )?;
                    insert_chunks(&tx, model_id, &file.path, &file.chunks)?;
                }
                tx.commit()?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    async fn record_chunk(
        &self,
        model_id: &str,
        file_path: &str,
        offset: u64,
        state: ChunkState,
        attempts: u32,
    ) -> Result<(), StateError> {
        let (id, path) = (model_id.to_string(), file_path.to_string());
        let updated = self
            .writer
            .call(move |conn| {
                let tx = conn.transaction()?;
                let n = tx.execute(
                    "UPDATE chunks SET state = ?1, attempts = ?2
                     WHERE model_id = ?3 AND path = ?4 AND start_byte = ?5",
                    params![state.as_str(), attempts, id, path, offset as i64],
                )?;
                touch_job(&tx, &id)?;
                tx.commit()?;
                Ok(n)
            })
            .await?;
        if updated == 0 {
            return Err(StateError::UnknownChunk {
                model_id: model_id.to_string(),
                path: file_path.to_string(),
                offset,
            });
        }
        Ok(())
    }

    async fn record_file_state(
        &self,
        model_id: &str,
        file_path: &str,
        state: FileState,
        verified: bool,
        error: Option<String>,
    ) -> Result<(), StateError> {
        let (id, path) = (model_id.to_string(), file_path.to_string());
        let updated = self
            .writer
            .call(move |conn| {
                let tx = conn.transaction()?;
                let n = tx.execute(
                    "UPDATE files SET state = ?1, verified = ?2, error = ?3
                     WHERE model_id = ?4 AND path = ?5",
                    params![state.as_str(), verified, error, id, path],
                )?;
                touch_job(&tx, &id)?;
                tx.commit()?;
                Ok(n)
            })
            .await?;
        if updated == 0 {
            return Err(StateError::UnknownFile {
                model_id: model_id.to_string(),
                path: file_path.to_string(),
            });
        }
        Ok(())
    }

    async fn reset_chunks(
        &self,
        model_id: &str,
        file_path: &str,
        chunks: &[Chunk],
    ) -> Result<(), StateError> {
        let (id, path, chunks) = (model_id.to_string(), file_path.to_string(), chunks.to_vec());
        self.writer
            .call(move |conn| {
                let tx = conn.transaction()?;
                tx.execute(
                    "DELETE FROM chunks WHERE model_id = ?1 AND path = ?2",
                    params![id, path],
                )?;
                insert_chunks(&tx, &id, &path, &chunks)?;
                touch_job(&tx, &id)?;
                tx.commit()?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    async fn record_job_state(&self, model_id: &str, state: JobState) -> Result<(), StateError> {
        let id = model_id.to_string();
        self.writer
            .call(move |conn| {
                conn.execute(
                    "UPDATE jobs SET state = ?1, updated_at = ?2 WHERE model_id = ?3",
                    params![state.as_str(), now(), id],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    async fn load(&self, model_id: &str) -> Result<Option<StatusRecord>, StateError> {
        let id = model_id.to_string();
        let record = self
            .writer
            .call(move |conn| Ok(read_record(conn, &id)?))
            .await?;
        Ok(record)
    }

    async fn snapshot(&self, model_id: &str) -> Result<Option<StatusRecord>, StateError> {
        let id = model_id.to_string();
        let record = self
            .reader
            .call(move |conn| Ok(read_record(conn, &id)?))
            .await?;
        Ok(record)
    }

    async fn delete(&self, model_id: &str) -> Result<bool, StateError> {
        let id = model_id.to_string();
        let removed = self
            .writer
            .call(move |conn| {
                let tx = conn.transaction()?;
                tx.execute("DELETE FROM chunks WHERE model_id = ?1", params![id])?;
                tx.execute("DELETE FROM files WHERE model_id = ?1", params![id])?;
                let n = tx.execute("DELETE FROM jobs WHERE model_id = ?1", params![id])?;
                tx.commit()?;
                Ok(n)
            })
            .await?;
        Ok(removed > 0)
    }
}

/// In-memory store. Nothing survives the process; used by tests and by
/// callers that do not need resume.
#[derive(Debug, Default)]
pub struct MemoryStatusStore {
    records: RwLock<HashMap<String, StatusRecord>>,
}

impl MemoryStatusStore {
    pub fn new() -> Self {
        Self::default()
    }

    async fn with_file<R>(
        &self,
        model_id: &str,
        file_path: &str,
        update: impl FnOnce(&mut FileRecord) -> Result<R, StateError>,
    ) -> Result<R, StateError> {
        let mut records = self.records.write().await;
        let record = records.get_mut(model_id);
        let file = record.and_then(|r| {
            r.updated_at = now();
            r.files.iter_mut().find(|f| f.path == file_path)
        });
        match file {
            Some(file) => update(file),
            None => Err(StateError::UnknownFile {
                model_id: model_id.to_string(),
                path: file_path.to_string(),
            }),
        }
    }
}

impl StatusStore for MemoryStatusStore {
    async fn save_record(&self, record: &StatusRecord) -> Result<(), StateError> {
        let mut record = record.clone();
        record.updated_at = now();
        self.records
            .write()
            .await
            .insert(record.model_id.clone(), record);
        Ok(())
    }

    async fn record_chunk(
        &self,
        model_id: &str,
        file_path: &str,
        offset: u64,
        state: ChunkState,
        attempts: u32,
    ) -> Result<(), StateError> {
        self.with_file(model_id, file_path, |file| {
            match file.chunks.iter_mut().find(|c| c.offset == offset) {
                Some(chunk) => {
                    chunk.state = state;
                    chunk.attempts = attempts;
                    Ok(())
                }
                None => Err(StateError::UnknownChunk {
                    model_id: model_id.to_string(),
                    path: file_path.to_string(),
                    offset,
                }),
            }
        })
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
        self.with_file(model_id, file_path, |file| {
            file.state = state;
            file.verified = verified;
            file.error = error;
            Ok(())
        })
        .await
    }

    async fn reset_chunks(
        &self,
        model_id: &str,
        file_path: &str,
        chunks: &[Chunk],
    ) -> Result<(), StateError> {
        self.with_file(model_id, file_path, |file| {
            file.chunks = chunks.to_vec();
            Ok(())
        })
        .await
    }

    async fn record_job_state(&self, model_id: &str, state: JobState) -> Result<(), StateError> {
        if let Some(record) = self.records.write().await.get_mut(model_id) {
            record.state = state;
            record.updated_at = now();
        }
        Ok(())
    }

    async fn load(&self, model_id: &str) -> Result<Option<StatusRecord>, StateError> {
        Ok(self.records.read().await.get(model_id).cloned())
    }

    async fn snapshot(&self, model_id: &str) -> Result<Option<StatusRecord>, StateError> {
        self.load(model_id).await
    }

    async fn delete(&self, model_id: &str) -> Result<bool, StateError> {
        Ok(self.records.write().await.remove(model_id).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::plan_chunks;
    use tempfile::TempDir;

    fn sample_record() -> StatusRecord {
        StatusRecord {
            model_id: "org/model".into(),
            save_dir: PathBuf::from("/models/org"),
            state: JobState::Running,
            files: vec![
                FileRecord {
                    path: "config.json".into(),
                    size: 10,
                    checksum: Some("abc".into()),
                    verified: false,
                    state: FileState::Pending,
                    error: None,
                    chunks: plan_chunks(10, 4),
                },
                FileRecord {
                    path: "weights/model.bin".into(),
                    size: 0,
                    checksum: None,
                    verified: false,
                    state: FileState::Pending,
                    error: None,
                    chunks: Vec::new(),
                },
            ],
            updated_at: 0,
        }
    }

    async fn exercise_store(store: &impl StatusStore) {
        let record = sample_record();
        store.save_record(&record).await.unwrap();

        store
            .record_chunk("org/model", "config.json", 4, ChunkState::Done, 1)
            .await
            .unwrap();
        store
            .record_file_state("org/model", "weights/model.bin", FileState::Completed, false, None)
            .await
            .unwrap();

        let loaded = store.load("org/model").await.unwrap().unwrap();
        assert_eq!(loaded.files.len(), 2);
        assert_eq!(loaded.files[0].path, "config.json");
        let config = loaded.file("config.json").unwrap();
        assert!(config.is_consistent());
        assert_eq!(config.chunks[1].state, ChunkState::Done);
        assert_eq!(config.chunks[1].attempts, 1);
        assert_eq!(config.downloaded_bytes(), 4);
        assert_eq!(
            loaded.file("weights/model.bin").unwrap().state,
            FileState::Completed
        );
        assert!(loaded.updated_at > 0);

        let err = store
            .record_chunk("org/model", "config.json", 5, ChunkState::Done, 1)
            .await;
        assert!(matches!(err, Err(StateError::UnknownChunk { offset: 5, .. })));
        let err = store
            .record_file_state("org/model", "missing", FileState::Failed, false, None)
            .await;
        assert!(matches!(err, Err(StateError::UnknownFile { .. })));

        let mut fresh = plan_chunks(10, 4);
        fresh[0].attempts = 0;
        store.reset_chunks("org/model", "config.json", &fresh).await.unwrap();
        let snapshot = store.snapshot("org/model").await.unwrap().unwrap();
        assert_eq!(snapshot.file("config.json").unwrap().downloaded_bytes(), 0);

        store.record_job_state("org/model", JobState::Completed).await.unwrap();
        assert_eq!(
            store.load("org/model").await.unwrap().unwrap().state,
            JobState::Completed
        );

        assert!(store.delete("org/model").await.unwrap());
        assert!(store.load("org/model").await.unwrap().is_none());
        assert!(!store.delete("org/model").await.unwrap());
    }

    #[tokio::test]
    async fn memory_store_behaviour() {
        exercise_store(&MemoryStatusStore::new()).await;
    }

    #[tokio::test]
    async fn sqlite_store_behaviour() {
        let dir = TempDir::new().unwrap();
        let store = SqliteStatusStore::open(&dir.path().join("status.db")).await.unwrap();
        exercise_store(&store).await;
    }

    #[tokio::test]
    async fn sqlite_record_is_visible_to_another_store_instance() {
        let dir = TempDir::new().unwrap();
        let db = dir.path().join("nested").join("status.db");
        let writer = SqliteStatusStore::open(&db).await.unwrap();
        writer.save_record(&sample_record()).await.unwrap();
        writer
            .record_chunk("org/model", "config.json", 0, ChunkState::Done, 1)
            .await
            .unwrap();

        let reader = SqliteStatusStore::open(&db).await.unwrap();
        let snapshot = reader.snapshot("org/model").await.unwrap().unwrap();
        assert_eq!(snapshot.file("config.json").unwrap().chunks[0].state, ChunkState::Done);
        assert!(reader.snapshot("other/model").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn sqlite_unknown_chunk_state_leaves_a_gap() {
        let dir = TempDir::new().unwrap();
        let db = dir.path().join("status.db");
        let store = SqliteStatusStore::open(&db).await.unwrap();
        store.save_record(&sample_record()).await.unwrap();

        store
            .writer
            .call(|conn| {
                conn.execute(
                    "UPDATE chunks SET state = 'garbage' WHERE start_byte = 4",
                    [],
                )?;
                Ok(())
            })
            .await
            .unwrap();

        let loaded = store.load("org/model").await.unwrap().unwrap();
        let config = loaded.file("config.json").unwrap();
        assert_eq!(config.chunks.len(), 2);
        assert!(!config.is_consistent());
    }
}
