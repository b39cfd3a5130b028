//! Pluggable pieces of the clone workflow and their default implementations

use super::report::CloneReport;
use super::types::AnonymizationRule;
use crate::driver::{ConflictPolicy, EnvironmentDriver, Row, RowWindow};
use crate::error::AppError;
use crate::schema::model::SchemaObject;
use crate::schema::{SchemaDefinition, TableDefinition, TableRef};
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

/// Copies table rows from source to target
#[async_trait]
pub trait DataCloner: Send + Sync {
    /// `tables` arrive parents-first; returns rows copied per table key
    async fn clone_tables(
        &self,
        source: &dyn EnvironmentDriver,
        target: &dyn EnvironmentDriver,
        tables: &[TableDefinition],
    ) -> Result<BTreeMap<String, u64>, AppError>;
}

/// Masks sensitive values, one record at a time
pub trait Anonymizer: Send + Sync {
    fn apply(&self, record: Row, rules: &[AnonymizationRule]) -> Result<Row, AppError>;
}

/// What a specialized system gets to work with
pub struct SystemContext<'a> {
    pub source: &'a dyn EnvironmentDriver,
    pub target: &'a dyn EnvironmentDriver,
    pub source_schema: &'a SchemaDefinition,
    pub batch_size: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemOutcome {
    pub records: u64,
    pub message: String,
}

/// A named subsystem cloned with bespoke logic
#[async_trait]
pub trait SpecializedSystem: Send + Sync {
    fn name(&self) -> &str;

    /// Checked before the clone starts
    fn validate_options(&self, options: &Value) -> Result<(), AppError> {
        let _ = options;
        Ok(())
    }

    async fn clone_system(&self, ctx: &SystemContext<'_>, options: &Value) -> Result<SystemOutcome, AppError>;
}

/// Receives the final report of every clone
pub trait ReportSink: Send + Sync {
    fn deliver(&self, report: &CloneReport);
}

/// Batched copy through the environment drivers
pub struct DriverDataCloner {
    batch_size: u64,
}

impl DriverDataCloner {
    pub fn new(batch_size: u64) -> Self {
        Self {
            batch_size: batch_size.max(1),
        }
    }

    async fn copy_table(
        &self,
        source: &dyn EnvironmentDriver,
        target: &dyn EnvironmentDriver,
        table: &TableDefinition,
    ) -> Result<u64, AppError> {
        let table_ref = table.table_ref();
        let order_by = table.primary_key_columns();
        let mut offset = 0;
        let mut copied = 0;

        loop {
            let page = source
                .fetch_rows(&table_ref, &RowWindow::page(offset, self.batch_size, order_by.clone()))
                .await?;
            let fetched = page.len() as u64;
            if fetched > 0 {
                copied += target.insert_rows(&table_ref, &page, ConflictPolicy::Error).await?;
            }
            if fetched < self.batch_size {
                break;
            }
            offset += fetched;
        }
        Ok(copied)
    }
}

#[async_trait]
impl DataCloner for DriverDataCloner {
    async fn clone_tables(
        &self,
        source: &dyn EnvironmentDriver,
        target: &dyn EnvironmentDriver,
        tables: &[TableDefinition],
    ) -> Result<BTreeMap<String, u64>, AppError> {
        let refs: Vec<TableRef> = tables.iter().map(TableDefinition::table_ref).collect();
        if !refs.is_empty() {
            target.truncate(&refs).await?;
        }

        let mut counts = BTreeMap::new();
        for table in tables {
            let copied = self.copy_table(source, target, table).await?;
            debug!("Copied {} rows into {}", copied, table.key());
            counts.insert(table.key(), copied);
        }
        Ok(counts)
    }
}

/// Logs the report through tracing
pub struct TracingReportSink;

impl ReportSink for TracingReportSink {
    fn deliver(&self, report: &CloneReport) {
        info!(
            operation_id = %report.operation_id,
            status = ?report.summary.status,
            duration_ms = report.summary.duration_ms.unwrap_or_default(),
            "📋 Clone report: {} tables, {} records, {} issues",
            report.statistics.tables_cloned,
            report.statistics.records_cloned,
            report.issues.len()
        );
        for issue in &report.issues {
            warn!(operation_id = %report.operation_id, code = %issue.code, "{}", issue.message);
        }
        for recommendation in &report.recommendations {
            info!(operation_id = %report.operation_id, "Recommendation: {}", recommendation);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::SchemaDefinition;
    use crate::testing::{fixtures, rows, MemoryDriver};
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_driver_cloner_pages_and_replaces_rows() {
        let mut schema = SchemaDefinition::empty();
        schema.tables.push(fixtures::customers_table());
        schema.tables.push(fixtures::orders_table());

        let source = MemoryDriver::new(schema.clone());
        source.set_rows("public.customers", rows::customer_rows(5));
        source.set_rows("public.orders", rows::order_rows(3, 5));
        let target = MemoryDriver::new(schema.clone());
        target.set_rows("public.customers", rows::customer_rows(9));

        let counts = DriverDataCloner::new(2)
            .clone_tables(&source, &target, &schema.tables)
            .await
            .unwrap();

        assert_eq!(counts.get("public.customers"), Some(&5));
        assert_eq!(counts.get("public.orders"), Some(&3));
        assert_eq!(target.rows("public.customers"), rows::customer_rows(5));
        // 3 pages for customers, 2 for orders
        assert_eq!(source.row_reads(), 5);
    }

    #[tokio::test]
    async fn test_driver_cloner_replaces_parent_and_child_rows() {
        let mut schema = SchemaDefinition::empty();
        schema.tables.push(fixtures::customers_table());
        schema.tables.push(fixtures::orders_table());

        let source = MemoryDriver::new(schema.clone());
        source.set_rows("public.customers", rows::customer_rows(2));
        source.set_rows("public.orders", rows::order_rows(1, 2));
        let target = MemoryDriver::new(schema.clone());
        target.set_rows("public.customers", rows::customer_rows(4));
        target.set_rows("public.orders", rows::order_rows(6, 4));

        DriverDataCloner::new(10)
            .clone_tables(&source, &target, &schema.tables)
            .await
            .unwrap();

        assert_eq!(target.rows("public.customers"), rows::customer_rows(2));
        assert_eq!(target.rows("public.orders"), rows::order_rows(1, 2));
    }

    #[tokio::test]
    async fn test_driver_cloner_will_not_orphan_referencing_rows() {
        let mut schema = SchemaDefinition::empty();
        schema.tables.push(fixtures::customers_table());
        schema.tables.push(fixtures::orders_table());

        let source = MemoryDriver::new(schema.clone());
        source.set_rows("public.customers", rows::customer_rows(2));
        let target = MemoryDriver::new(schema.clone());
        target.set_rows("public.customers", rows::customer_rows(4));
        target.set_rows("public.orders", rows::order_rows(3, 4));

        let result = DriverDataCloner::new(10)
            .clone_tables(&source, &target, &[fixtures::customers_table()])
            .await;

        assert!(matches!(result, Err(AppError::OperationFailed(msg)) if msg.contains("public.orders")));
        assert_eq!(target.rows("public.customers"), rows::customer_rows(4));
        assert_eq!(target.rows("public.orders").len(), 3);
    }
}
