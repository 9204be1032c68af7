//! Model file catalog.
//!
//! The orchestrator consumes the catalog through [`Catalog`]: the ordered file
//! list of a model (path, size, optional SHA-256) and the URL each file is
//! served from. [`HubCatalog`] talks to a ModelScope-compatible hub.

use std::future::Future;

use reqwest::Client;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::models::RemoteFile;

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("hub rejected file listing for {model_id}: {message}")]
    Rejected { model_id: String, message: String },
}

pub trait Catalog: Send + Sync + 'static {
    fn list_files(
        &self,
        model_id: &str,
    ) -> impl Future<Output = Result<Vec<RemoteFile>, CatalogError>> + Send;

    fn download_url(&self, model_id: &str, remote_path: &str) -> String;
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct FilesResponse {
    #[serde(default)]
    code: Option<i64>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    data: Option<FilesData>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct FilesData {
    /// Entries are decoded one by one so a malformed one can be skipped.
    #[serde(default)]
    files: Vec<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct HubFile {
    #[serde(default)]
    path: Option<String>,
    #[serde(default)]
    size: u64,
    #[serde(default)]
    sha256: Option<String>,
    #[serde(rename = "Type", default)]
    kind: String,
    #[serde(default = "downloadable_by_default")]
    downloadable: bool,
}

fn downloadable_by_default() -> bool {
    true
}

/// Keeps the downloadable blobs of a listing, in order. Directory entries,
/// entries marked not downloadable and entries that cannot be read are
/// skipped.
fn downloadable_files(model_id: &str, entries: Vec<serde_json::Value>) -> Vec<RemoteFile> {
    let mut files = Vec::with_capacity(entries.len());
    for entry in entries {
        let file: HubFile = match serde_json::from_value(entry) {
            Ok(file) => file,
            Err(e) => {
                warn!(model = %model_id, error = %e, "skipping malformed file entry");
                continue;
            }
        };
        if file.kind == "tree" {
            continue;
        }
        let Some(path) = file.path.filter(|p| !p.is_empty()) else {
            warn!(model = %model_id, "skipping file entry without a path");
            continue;
        };
        if !file.downloadable {
            info!(model = %model_id, file = %path, "skipping file that is not downloadable");
            continue;
        }
        files.push(RemoteFile {
            path,
            size: file.size,
            checksum: file.sha256.filter(|s| !s.is_empty()),
        });
    }
    files
}

/// File listing of a ModelScope-style hub.
#[derive(Debug, Clone)]
pub struct HubCatalog {
    client: Client,
    endpoint: String,
}

impl HubCatalog {
    pub fn new(endpoint: impl Into<String>) -> Result<Self, CatalogError> {
        let client = Client::builder()
            .user_agent(concat!("modelget/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
        })
    }
}

impl Catalog for HubCatalog {
    async fn list_files(&self, model_id: &str) -> Result<Vec<RemoteFile>, CatalogError> {
        let url = format!("{}/api/v1/models/{}/repo/files", self.endpoint, model_id);
        debug!(%url, "listing model files");
        let resp: FilesResponse = self
            .client
            .get(&url)
            .query(&[("Revision", "master"), ("Recursive", "True")])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let data = match (resp.code, resp.data) {
            (Some(200) | None, Some(data)) => data,
            _ => {
                return Err(CatalogError::Rejected {
                    model_id: model_id.to_string(),
                    message: resp.message.unwrap_or_else(|| "no file data".to_string()),
                })
            }
        };

        let files = downloadable_files(model_id, data.files);
        if files.is_empty() {
            warn!(model = %model_id, "catalog returned no downloadable files");
        }
        info!(model = %model_id, files = files.len(), "catalog listed files");
        Ok(files)
    }

    fn download_url(&self, model_id: &str, remote_path: &str) -> String {
        format!(
            "{}/models/{}/resolve/master/{}",
            self.endpoint, model_id, remote_path
        )
    }
}
