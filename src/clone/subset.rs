//! Built-in specialized system: copy a filtered subset of tables
//!
//! Options: `{"tables": [{"table": "public.customers", "predicate": "region = 'eu'"}]}`.
//! Rows already present on the target are left alone.

use super::collaborators::{SpecializedSystem, SystemContext, SystemOutcome};
use crate::driver::{ConflictPolicy, RowWindow};
use crate::error::AppError;
use crate::migration::sql::ensure_fragment;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

pub const SUBSET_COPY: &str = "subset_copy";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubsetOptions {
    tables: Vec<SubsetTable>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubsetTable {
    table: String,
    #[serde(default)]
    predicate: Option<String>,
}

#[derive(Debug, Default)]
pub struct SubsetCopySystem;

impl SubsetCopySystem {
    fn parse(options: &Value) -> Result<SubsetOptions, AppError> {
        let parsed: SubsetOptions = serde_json::from_value(options.clone())
            .map_err(|e| AppError::Validation(format!("{} options: {}", SUBSET_COPY, e)))?;
        if parsed.tables.is_empty() {
            return Err(AppError::Validation(format!("{} needs at least one table", SUBSET_COPY)));
        }
        for entry in &parsed.tables {
            if let Some(predicate) = &entry.predicate {
                ensure_fragment(&entry.table, predicate)?;
            }
        }
        Ok(parsed)
    }
}

#[async_trait]
impl SpecializedSystem for SubsetCopySystem {
    fn name(&self) -> &str {
        SUBSET_COPY
    }

    fn validate_options(&self, options: &Value) -> Result<(), AppError> {
        Self::parse(options).map(|_| ())
    }

    async fn clone_system(&self, ctx: &SystemContext<'_>, options: &Value) -> Result<SystemOutcome, AppError> {
        let options = Self::parse(options)?;
        let batch = ctx.batch_size.max(1);
        let mut records = 0;

        for entry in &options.tables {
            let table = ctx
                .source_schema
                .table(&entry.table)
                .ok_or_else(|| AppError::NotFound(format!("Table {} is not in the source schema", entry.table)))?;
            let table_ref = table.table_ref();
            let order_by = table.primary_key_columns();

            let mut offset = 0;
            loop {
                let window = RowWindow::page(offset, batch, order_by.clone()).with_predicate(entry.predicate.clone());
                let page = ctx.source.fetch_rows(&table_ref, &window).await?;
                let fetched = page.len() as u64;
                if fetched > 0 {
                    records += ctx.target.insert_rows(&table_ref, &page, ConflictPolicy::DoNothing).await?;
                }
                if fetched < batch {
                    break;
                }
                offset += fetched;
            }
            debug!("Subset copy of {} done", entry.table);
        }

        Ok(SystemOutcome {
            records,
            message: format!("copied {} rows across {} tables", records, options.tables.len()),
        })
    }
}
