//! Migration execution

use super::types::{MigrationOperation, MigrationScript};
use crate::driver::EnvironmentDriver;
use crate::error::AppError;
use crate::schema::SchemaDifference;
use std::time::Duration;
use tracing::{debug, info};

/// Run one operation under its timeout
pub async fn apply_operation(
    driver: &dyn EnvironmentDriver,
    operation: &MigrationOperation,
    difference: &SchemaDifference,
) -> Result<(), AppError> {
    if operation.object_key != difference.object_key() {
        return Err(AppError::Internal(format!(
            "Operation {} does not belong to difference {}",
            operation.id,
            difference.object_key()
        )));
    }

    debug!("Applying {}", operation.id);
    let timeout = Duration::from_millis(operation.timeout_ms);
    match tokio::time::timeout(timeout, driver.apply_difference(difference, &operation.sql)).await {
        Err(_) => Err(AppError::Timeout(format!(
            "{} exceeded {} ms",
            operation.id, operation.timeout_ms
        ))),
        Ok(Err(e @ (AppError::Database(_) | AppError::Pool(_)))) => {
            Err(AppError::OperationFailed(format!("{}: {}", operation.id, e)))
        }
        Ok(result) => result,
    }
}

/// Run every operation of a script in order; stops at the first failure
pub async fn apply_script(
    driver: &dyn EnvironmentDriver,
    script: &MigrationScript,
    differences: &[SchemaDifference],
) -> Result<usize, AppError> {
    if script.operations.len() != differences.len() {
        return Err(AppError::Internal(format!(
            "Script has {} operations for {} differences",
            script.operations.len(),
            differences.len()
        )));
    }

    for (operation, difference) in script.operations.iter().zip(differences) {
        apply_operation(driver, operation, difference).await?;
    }

    if !script.operations.is_empty() {
        info!("Applied {} migration operations", script.operations.len());
    }
    Ok(script.operations.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migration::{MigrationGenerator, MigrationGeneratorOptions};
    use crate::schema::{ComparisonOptions, SchemaComparator, SchemaDefinition};
    use crate::testing::{fixtures, MemoryDriver};
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_apply_script_reaches_source_schema() {
        let source = fixtures::shop_schema();
        let db = MemoryDriver::new(SchemaDefinition::empty());

        let diff = SchemaComparator::compare(&source, &db.schema(), &ComparisonOptions::default()).unwrap();
        let script = MigrationGenerator::generate(&diff, &MigrationGeneratorOptions::default()).unwrap();
        let applied = apply_script(&db, &script, &diff.differences).await.unwrap();

        assert_eq!(applied, 9);
        assert!(db.schema().structurally_equal(&source));
        assert_eq!(db.executed().len(), 9);
    }

    #[tokio::test]
    async fn test_operation_timeout_is_a_failure() {
        let db = MemoryDriver::new(SchemaDefinition::empty());
        db.set_delay(Duration::from_millis(200));

        let mut source = SchemaDefinition::empty();
        source.tables.push(fixtures::customers_table());
        let diff = SchemaComparator::compare(&source, &db.schema(), &ComparisonOptions::default()).unwrap();
        let options = MigrationGeneratorOptions::default().with_timeout(Duration::from_millis(20));
        let script = MigrationGenerator::generate(&diff, &options).unwrap();

        let err = apply_script(&db, &script, &diff.differences).await.unwrap_err();
        assert!(matches!(err, AppError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_mismatched_operation_is_rejected() {
        let db = MemoryDriver::new(SchemaDefinition::empty());
        let mut source = SchemaDefinition::empty();
        source.tables.push(fixtures::customers_table());
        source.tables.push(fixtures::orders_table());
        let diff = SchemaComparator::compare(&source, &db.schema(), &ComparisonOptions::default()).unwrap();
        let script = MigrationGenerator::generate(&diff, &MigrationGeneratorOptions::default()).unwrap();

        let err = apply_operation(&db, &script.operations[0], &diff.differences[1]).await.unwrap_err();
        assert!(matches!(err, AppError::Internal(_)));
        assert!(db.executed().is_empty());
    }
}
