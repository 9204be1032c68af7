pub mod catalog;
pub mod config;
pub mod downloader;
pub mod file_task;
pub mod integrity;
pub mod lock;
pub mod manager;
pub mod models;
pub mod state_manager;
pub mod status;
pub mod transport;

#[cfg(test)]
mod test_support;

/// Convenient type alias exposing common structs.
pub mod prelude {
    pub use crate::catalog::{Catalog, CatalogError, HubCatalog};
    pub use crate::config::DownloaderConfig;
    pub use crate::file_task::{FileError, FileResult};
    pub use crate::manager::{DownloadManager, JobResult, ManagerError};
    pub use crate::models::{
        Chunk, ChunkState, FileRecord, FileState, Job, JobState, RemoteFile, StatusRecord,
    };
    pub use crate::state_manager::{MemoryStatusStore, SqliteStatusStore, StateError, StatusStore};
    pub use crate::status::{OverallState, StatusError, StatusQuery, Summary};
    pub use crate::transport::{ByteStream, HttpTransport, RangeTransport, TransferError};
}
