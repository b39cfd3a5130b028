//! JSON-file state store
//!
//! One file per record under `{root}/{collection}/{id}.json`. Writes go to a
//! temporary sibling first and are renamed into place.

use super::{Collection, StateStore};
use crate::error::AppError;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, warn};

pub struct FileStateStore {
    root: PathBuf,
}

impl FileStateStore {
    /// Create the store, making sure the collection directories exist
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, AppError> {
        let root = root.into();
        for collection in [
            Collection::Environments,
            Collection::CloneOperations,
            Collection::Backups,
            Collection::Checkpoints,
        ] {
            fs::create_dir_all(root.join(collection.as_str())).await?;
        }
        debug!("File state store opened at {}", root.display());
        Ok(Self { root })
    }

    fn path(&self, collection: Collection, id: &str) -> Result<PathBuf, AppError> {
        if id.is_empty() || id.contains(['/', '\\']) || id.starts_with('.') {
            return Err(AppError::Validation(format!("invalid record id '{}'", id)));
        }
        Ok(self.root.join(collection.as_str()).join(format!("{}.json", id)))
    }

    async fn read_document(path: &Path) -> Result<Option<serde_json::Value>, AppError> {
        match fs::read(path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl StateStore for FileStateStore {
    async fn put(&self, collection: Collection, id: &str, document: serde_json::Value) -> Result<(), AppError> {
        let path = self.path(collection, id)?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(&document)?).await?;
        fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn get(&self, collection: Collection, id: &str) -> Result<Option<serde_json::Value>, AppError> {
        let path = self.path(collection, id)?;
        Self::read_document(&path).await
    }

    async fn list(&self, collection: Collection) -> Result<Vec<serde_json::Value>, AppError> {
        let mut documents = Vec::new();
        let mut entries = fs::read_dir(self.root.join(collection.as_str())).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match Self::read_document(&path).await {
                Ok(Some(document)) => documents.push(document),
                Ok(None) => {}
                Err(e) => warn!("Skipping unreadable record {}: {}", path.display(), e),
            }
        }
        Ok(documents)
    }

    async fn delete(&self, collection: Collection, id: &str) -> Result<bool, AppError> {
        let path = self.path(collection, id)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}
