//! Write-through record index
//!
//! Typed view over one collection of a [`StateStore`] with an in-memory
//! cache. Writes hit the store before the cache; listing always refreshes
//! from the store so records written by other processes become visible.

use super::{Collection, StateStore};
use crate::error::AppError;
use serde::{de::DeserializeOwned, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::warn;

/// A document type that lives in one collection
pub trait Record: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {
    const COLLECTION: Collection;

    fn record_id(&self) -> String;
}

pub struct RecordIndex<T: Record> {
    store: Arc<dyn StateStore>,
    cache: RwLock<HashMap<String, T>>,
}

impl<T: Record> RecordIndex<T> {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self {
            store,
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub async fn put(&self, record: &T) -> Result<(), AppError> {
        let id = record.record_id();
        self.store
            .put(T::COLLECTION, &id, serde_json::to_value(record)?)
            .await?;
        self.cache.write().await.insert(id, record.clone());
        Ok(())
    }

    pub async fn get(&self, id: &str) -> Result<Option<T>, AppError> {
        if let Some(record) = self.cache.read().await.get(id) {
            return Ok(Some(record.clone()));
        }

        let Some(document) = self.store.get(T::COLLECTION, id).await? else {
            return Ok(None);
        };
        let record: T = serde_json::from_value(document)?;
        self.cache.write().await.insert(id.to_string(), record.clone());
        Ok(Some(record))
    }

    /// Like [`get`](Self::get) but a missing record is `NotFound`
    pub async fn require(&self, id: &str) -> Result<T, AppError> {
        self.get(id).await?.ok_or_else(|| {
            AppError::NotFound(format!("{} record {} not found", T::COLLECTION, id))
        })
    }

    /// Bypass the cache; used when another process may have written the record
    pub async fn reload(&self, id: &str) -> Result<Option<T>, AppError> {
        self.cache.write().await.remove(id);
        self.get(id).await
    }

    pub async fn list(&self) -> Result<Vec<T>, AppError> {
        let documents = self.store.list(T::COLLECTION).await?;
        let mut fresh = HashMap::with_capacity(documents.len());
        for document in documents {
            match serde_json::from_value::<T>(document) {
                Ok(record) => {
                    fresh.insert(record.record_id(), record);
                }
                Err(e) => warn!("Skipping malformed {} record: {}", T::COLLECTION, e),
            }
        }

        let records = fresh.values().cloned().collect();
        *self.cache.write().await = fresh;
        Ok(records)
    }

    pub async fn delete(&self, id: &str) -> Result<bool, AppError> {
        let removed = self.store.delete(T::COLLECTION, id).await?;
        self.cache.write().await.remove(id);
        Ok(removed)
    }

    /// Read-modify-write of a single record
    pub async fn update<F>(&self, id: &str, mutate: F) -> Result<T, AppError>
    where
        F: FnOnce(&mut T),
    {
        let mut record = self.require(id).await?;
        mutate(&mut record);
        self.put(&record).await?;
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::FileStateStore;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Note {
        id: String,
        text: String,
    }

    impl Record for Note {
        const COLLECTION: Collection = Collection::Checkpoints;

        fn record_id(&self) -> String {
            self.id.clone()
        }
    }

    fn note(id: &str, text: &str) -> Note {
        Note {
            id: id.to_string(),
            text: text.to_string(),
        }
    }

    #[tokio::test]
    async fn test_write_through_and_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn StateStore> = Arc::new(FileStateStore::open(dir.path()).await.unwrap());
        let index = RecordIndex::<Note>::new(store);

        index.put(&note("n1", "first")).await.unwrap();
        assert_eq!(index.get("n1").await.unwrap(), Some(note("n1", "first")));
        assert!(index.get("missing").await.unwrap().is_none());
        assert!(matches!(index.require("missing").await, Err(AppError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_second_index_sees_writes_of_first() {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn StateStore> = Arc::new(FileStateStore::open(dir.path()).await.unwrap());
        let a = RecordIndex::<Note>::new(store.clone());
        let b = RecordIndex::<Note>::new(store);

        a.put(&note("n1", "from a")).await.unwrap();
        assert_eq!(b.get("n1").await.unwrap().unwrap().text, "from a");

        a.update("n1", |n| n.text = "updated".to_string()).await.unwrap();
        assert_eq!(b.reload("n1").await.unwrap().unwrap().text, "updated");
        assert_eq!(b.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_delete_removes_from_cache_and_store() {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn StateStore> = Arc::new(FileStateStore::open(dir.path()).await.unwrap());
        let index = RecordIndex::<Note>::new(store);

        index.put(&note("n1", "x")).await.unwrap();
        assert!(index.delete("n1").await.unwrap());
        assert!(index.get("n1").await.unwrap().is_none());
    }
}
