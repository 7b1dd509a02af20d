//! Attachment storage on the local filesystem.
//!
//! Each upload is written as `<uuid>` next to a `<uuid>.json` sidecar holding
//! the original file name and content type.

use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::ServerError;

/// Verify that a resolved path stays within the expected base directory.
fn ensure_within(base: &Path, target: &Path) -> Result<PathBuf, ServerError> {
    // target may not exist yet, so only the base is canonicalized
    let canonical_base = base.canonicalize().unwrap_or_else(|_| base.to_path_buf());
    let mut resolved = canonical_base.clone();
    for component in target
        .strip_prefix(base)
        .or_else(|_| target.strip_prefix(&canonical_base))
        .unwrap_or(target)
        .components()
    {
        match component {
            Component::Normal(c) => resolved.push(c),
            Component::ParentDir => {
                return Err(ServerError::BadRequest("Path traversal detected".to_string()));
            }
            _ => {}
        }
    }
    if !resolved.starts_with(&canonical_base) {
        return Err(ServerError::BadRequest("Path traversal detected".to_string()));
    }
    Ok(resolved)
}

/// Metadata of one stored attachment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StoredFile {
    pub id: Uuid,
    pub name: String,
    pub size: u64,
    pub content_type: String,
}

#[derive(Debug, Clone)]
pub struct BlobStore {
    base_path: PathBuf,
    max_size: usize,
}

impl BlobStore {
    pub async fn new(base_path: PathBuf, max_size: usize) -> Result<Self, ServerError> {
        fs::create_dir_all(&base_path).await.map_err(|e| {
            ServerError::FileStorage(format!(
                "Failed to create upload directory '{}': {}",
                base_path.display(),
                e
            ))
        })?;

        info!(path = %base_path.display(), "Blob store initialized");

        Ok(Self {
            base_path,
            max_size,
        })
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub async fn store_file(
        &self,
        data: &[u8],
        name: &str,
        content_type: Option<&str>,
    ) -> Result<StoredFile, ServerError> {
        if data.is_empty() {
            return Err(ServerError::BadRequest("Empty file".to_string()));
        }
        if data.len() > self.max_size {
            return Err(ServerError::FileTooLarge {
                size: data.len(),
                max: self.max_size,
            });
        }

        let id = Uuid::new_v4();
        let meta = StoredFile {
            id,
            name: sanitize_name(name),
            size: data.len() as u64,
            content_type: content_type
                .filter(|t| !t.is_empty())
                .unwrap_or("application/octet-stream")
                .to_string(),
        };

        let (data_path, meta_path) = self.paths(&id)?;
        fs::write(&data_path, data)
            .await
            .map_err(|e| ServerError::FileStorage(format!("Failed to write file {}: {}", id, e)))?;

        let encoded = serde_json::to_vec(&meta)
            .map_err(|e| ServerError::Internal(format!("Failed to encode metadata: {e}")))?;
        fs::write(&meta_path, encoded).await.map_err(|e| {
            ServerError::FileStorage(format!("Failed to write metadata {}: {}", id, e))
        })?;

        debug!(id = %id, size = data.len(), name = %meta.name, "Stored file");
        Ok(meta)
    }

    pub async fn get_file(&self, id: Uuid) -> Result<(StoredFile, Vec<u8>), ServerError> {
        let (data_path, meta_path) = self.paths(&id)?;

        if !fs::try_exists(&data_path).await.unwrap_or(false) {
            return Err(ServerError::FileNotFound(id));
        }

        let data = fs::read(&data_path)
            .await
            .map_err(|e| ServerError::FileStorage(format!("Failed to read file {}: {}", id, e)))?;

        let meta = match fs::read(&meta_path).await {
            Ok(raw) => serde_json::from_slice(&raw).map_err(|e| {
                ServerError::FileStorage(format!("Corrupt metadata for {}: {}", id, e))
            })?,
            Err(_) => StoredFile {
                id,
                name: id.to_string(),
                size: data.len() as u64,
                content_type: "application/octet-stream".to_string(),
            },
        };

        debug!(id = %id, size = data.len(), "Retrieved file");
        Ok((meta, data))
    }

    fn paths(&self, id: &Uuid) -> Result<(PathBuf, PathBuf), ServerError> {
        let data = ensure_within(&self.base_path, &self.base_path.join(id.to_string()))?;
        let meta = ensure_within(&self.base_path, &self.base_path.join(format!("{id}.json")))?;
        Ok((data, meta))
    }
}

/// Keep only the final path segment of a client-supplied file name.
fn sanitize_name(name: &str) -> String {
    let name = name
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or("")
        .trim()
        .trim_start_matches('.');
    if name.is_empty() {
        "file".to_string()
    } else {
        name.to_string()
    }
}
