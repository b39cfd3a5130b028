//! Durable state
//!
//! Environments, clone operations, backups and checkpoints are persisted as
//! JSON documents through a [`StateStore`] and read through a
//! [`RecordIndex`] cache, so records survive restarts and several service
//! processes share one view.

mod file;
mod index;
mod postgres;

pub use file::FileStateStore;
pub use index::{Record, RecordIndex};
pub use postgres::PostgresStateStore;

use crate::error::AppError;
use async_trait::async_trait;
use std::fmt;

/// Record collections kept by the service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Collection {
    Environments,
    CloneOperations,
    Backups,
    Checkpoints,
}

impl Collection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Collection::Environments => "environments",
            Collection::CloneOperations => "clone_operations",
            Collection::Backups => "backups",
            Collection::Checkpoints => "checkpoints",
        }
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Document store keyed by `(collection, id)`
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Insert or replace a document.
    async fn put(&self, collection: Collection, id: &str, document: serde_json::Value) -> Result<(), AppError>;

    async fn get(&self, collection: Collection, id: &str) -> Result<Option<serde_json::Value>, AppError>;

    /// All documents of a collection, in no particular order.
    async fn list(&self, collection: Collection) -> Result<Vec<serde_json::Value>, AppError>;

    /// Returns whether a document was removed.
    async fn delete(&self, collection: Collection, id: &str) -> Result<bool, AppError>;
}
