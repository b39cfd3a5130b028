//! Environment drivers
//!
//! The boundary between the clone core and a concrete database. Rows travel
//! as JSON objects so phases stay independent of column types. Every driver
//! handed to the core is wrapped in a [`GuardedDriver`], which runs the
//! production safety guard before any mutating call.

mod postgres;

pub use postgres::{build_pool, PostgresDriver, PostgresProvider};

use crate::environment::Environment;
use crate::error::AppError;
use crate::safety::{OperationKind, ProductionSafetyGuard};
use crate::schema::{SchemaDifference, TableRef};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// A row as a JSON object keyed by column name
pub type Row = serde_json::Map<String, serde_json::Value>;

/// A page of rows
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RowWindow {
    pub offset: u64,
    pub limit: u64,
    /// Columns giving a stable page order, usually the primary key
    #[serde(default)]
    pub order_by: Vec<String>,
    #[serde(default)]
    pub predicate: Option<String>,
}

impl RowWindow {
    pub fn page(offset: u64, limit: u64, order_by: Vec<String>) -> Self {
        Self {
            offset,
            limit,
            order_by,
            predicate: None,
        }
    }

    pub fn with_predicate(mut self, predicate: Option<String>) -> Self {
        self.predicate = predicate;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConflictPolicy {
    /// Fail the batch on a key conflict
    #[default]
    Error,
    /// Skip conflicting rows
    DoNothing,
}

#[async_trait]
pub trait EnvironmentDriver: Send + Sync {
    /// Run one or more statements
    async fn execute(&self, sql: &str) -> Result<(), AppError>;

    async fn fetch_rows(&self, table: &TableRef, window: &RowWindow) -> Result<Vec<Row>, AppError>;

    /// Insert rows, returning how many were written
    async fn insert_rows(&self, table: &TableRef, rows: &[Row], policy: ConflictPolicy) -> Result<u64, AppError>;

    /// Update rows matched on `key_columns`
    async fn update_rows(&self, table: &TableRef, key_columns: &[String], rows: &[Row]) -> Result<u64, AppError>;

    /// Empty `tables`, given parents-first. Rows go children-first, and the
    /// call fails while a table outside the set still references them.
    async fn truncate(&self, tables: &[TableRef]) -> Result<(), AppError>;

    async fn count_rows(&self, table: &TableRef) -> Result<u64, AppError>;

    /// Perform one schema difference using its generated SQL
    async fn apply_difference(&self, difference: &SchemaDifference, sql: &str) -> Result<(), AppError> {
        let _ = difference;
        self.execute(sql).await
    }
}

/// Opens drivers for registered environments
#[async_trait]
pub trait DriverProvider: Send + Sync {
    async fn open(&self, env: &Environment) -> Result<Arc<dyn EnvironmentDriver>, AppError>;
}

/// Hands out guarded drivers
#[derive(Clone)]
pub struct EnvironmentConnector {
    provider: Arc<dyn DriverProvider>,
    guard: Arc<ProductionSafetyGuard>,
}

impl EnvironmentConnector {
    pub fn new(provider: Arc<dyn DriverProvider>, guard: Arc<ProductionSafetyGuard>) -> Self {
        Self { provider, guard }
    }

    pub fn guard(&self) -> &Arc<ProductionSafetyGuard> {
        &self.guard
    }

    pub async fn connect(&self, env: &Environment) -> Result<GuardedDriver, AppError> {
        let inner = self.provider.open(env).await?;
        Ok(GuardedDriver {
            inner,
            env: env.clone(),
            guard: self.guard.clone(),
        })
    }
}

/// Driver that consults the safety guard before every write
#[derive(Clone)]
pub struct GuardedDriver {
    inner: Arc<dyn EnvironmentDriver>,
    env: Environment,
    guard: Arc<ProductionSafetyGuard>,
}

impl GuardedDriver {
    pub fn environment(&self) -> &Environment {
        &self.env
    }

    fn check(&self, operation: OperationKind) -> Result<(), AppError> {
        self.guard.enforce_read_only(&self.env, operation)
    }
}

#[async_trait]
impl EnvironmentDriver for GuardedDriver {
    async fn execute(&self, sql: &str) -> Result<(), AppError> {
        self.check(OperationKind::SchemaChange)?;
        self.inner.execute(sql).await
    }

    async fn fetch_rows(&self, table: &TableRef, window: &RowWindow) -> Result<Vec<Row>, AppError> {
        self.inner.fetch_rows(table, window).await
    }

    async fn insert_rows(&self, table: &TableRef, rows: &[Row], policy: ConflictPolicy) -> Result<u64, AppError> {
        self.check(OperationKind::DataWrite)?;
        self.inner.insert_rows(table, rows, policy).await
    }

    async fn update_rows(&self, table: &TableRef, key_columns: &[String], rows: &[Row]) -> Result<u64, AppError> {
        self.check(OperationKind::DataWrite)?;
        self.inner.update_rows(table, key_columns, rows).await
    }

    async fn truncate(&self, tables: &[TableRef]) -> Result<(), AppError> {
        self.check(OperationKind::Delete)?;
        self.inner.truncate(tables).await
    }

    async fn count_rows(&self, table: &TableRef) -> Result<u64, AppError> {
        self.inner.count_rows(table).await
    }

    async fn apply_difference(&self, difference: &SchemaDifference, sql: &str) -> Result<(), AppError> {
        self.check(OperationKind::SchemaChange)?;
        self.inner.apply_difference(difference, sql).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CloneConfig;
    use crate::environment::EnvironmentType;
    use crate::testing::{fixtures, MemoryCluster};

    #[tokio::test]
    async fn test_guarded_driver_blocks_production_writes_only() {
        let guard = Arc::new(ProductionSafetyGuard::new(&CloneConfig::default()).unwrap());
        let cluster = Arc::new(MemoryCluster::new());
        let prod = Environment::new("main", EnvironmentType::Production, "postgres://app@db-main/app")
            .with_allow_writes(Some(false));
        cluster.install(&prod, fixtures::shop_schema());

        let connector = EnvironmentConnector::new(cluster.clone(), guard.clone());
        let driver = connector.connect(&prod).await.unwrap();
        let table = TableRef::new("public", "orders");

        assert!(driver.fetch_rows(&table, &RowWindow::page(0, 10, vec![])).await.is_ok());
        assert!(matches!(driver.execute("SELECT 1").await, Err(AppError::ProductionAccess(_))));
        assert!(matches!(
            driver.insert_rows(&table, &[], ConflictPolicy::Error).await,
            Err(AppError::ProductionAccess(_))
        ));
        assert!(matches!(driver.truncate(&[table]).await, Err(AppError::ProductionAccess(_))));

        assert_eq!(cluster.database(prod.id).unwrap().mutation_count(), 0);
        assert_eq!(guard.recent_alerts(10).len(), 3);
    }
}
