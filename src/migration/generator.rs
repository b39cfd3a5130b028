//! Migration generator
//!
//! Turns an ordered `SchemaDiff` into a `MigrationScript`. Pure function of its
//! inputs: the same diff and options always produce the same script id.

use super::sql;
use super::types::{MigrationGeneratorOptions, MigrationOperation, MigrationScript, RiskLevel};
use crate::error::AppError;
use crate::schema::model::*;
use crate::schema::{DiffAction, ObjectChanges, SchemaDiff, SchemaDifference};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use tracing::debug;

/// Index builds get at least this multiple of their estimate as timeout
const INDEX_TIMEOUT_FACTOR: u64 = 10;

pub struct MigrationGenerator;

impl MigrationGenerator {
    pub fn generate(
        diff: &SchemaDiff,
        options: &MigrationGeneratorOptions,
    ) -> Result<MigrationScript, AppError> {
        Self::generate_from(&diff.differences, options)
    }

    /// Generate from differences already in execution order
    pub fn generate_from(
        differences: &[SchemaDifference],
        options: &MigrationGeneratorOptions,
    ) -> Result<MigrationScript, AppError> {
        let ids: HashMap<String, String> = differences
            .iter()
            .map(|d| (d.object_key(), operation_id(d)))
            .collect();

        let mut operations = Vec::with_capacity(differences.len());
        for difference in differences {
            operations.push(Self::operation(difference, &ids, options)?);
        }

        let mut warnings = Vec::new();
        let non_reversible: Vec<String> = operations
            .iter()
            .filter(|op| !op.reversible)
            .map(|op| op.id.clone())
            .collect();
        for id in &non_reversible {
            warnings.push(format!(
                "Operation {} is not reversible by script; restore requires a backup",
                id
            ));
        }

        let rollback_operations = if options.include_rollback {
            Self::rollback_operations(&operations, options)
        } else {
            Vec::new()
        };

        let risk_level = operations
            .iter()
            .map(|op| op.risk_level)
            .max()
            .unwrap_or(RiskLevel::Low);
        let estimated_duration_ms = operations.iter().map(|op| op.estimated_duration_ms).sum();

        let script = MigrationScript {
            id: script_id(&operations),
            requires_backup: !non_reversible.is_empty(),
            operations,
            rollback_operations,
            risk_level,
            estimated_duration_ms,
            non_reversible,
            warnings,
        };

        debug!(
            "Generated migration {} with {} operations (risk {:?}, ~{} ms)",
            &script.id[..12],
            script.operations.len(),
            script.risk_level,
            script.estimated_duration_ms
        );
        Ok(script)
    }

    fn operation(
        difference: &SchemaDifference,
        ids: &HashMap<String, String>,
        options: &MigrationGeneratorOptions,
    ) -> Result<MigrationOperation, AppError> {
        difference.validate()?;

        let description = describe(difference);
        let mut sql = render(difference, options.safe_mode)?;
        let reversible = is_reversible(difference);

        let mut rollback_sql = if options.include_rollback && !is_data_destroying_drop(difference) {
            Some(render(&difference.inverted(), options.safe_mode)?)
        } else {
            None
        };

        if options.add_comments {
            sql = format!("-- {}\n{}", description, sql);
            rollback_sql = rollback_sql.map(|r| format!("-- Revert: {}\n{}", description, r));
        }

        let dependencies = difference
            .dependencies
            .iter()
            .filter_map(|dep| ids.get(dep).cloned())
            .collect();

        let estimated_duration_ms = estimate_duration(difference);
        let timeout_ms = if difference.object_type == ObjectType::Index
            && difference.action != DiffAction::Drop
        {
            options
                .operation_timeout_ms
                .max(estimated_duration_ms.saturating_mul(INDEX_TIMEOUT_FACTOR))
        } else {
            options.operation_timeout_ms
        };

        Ok(MigrationOperation {
            id: operation_id(difference),
            description,
            object_type: difference.object_type,
            action: difference.action,
            object_key: difference.object_key(),
            sql,
            rollback_sql,
            reversible,
            dependencies,
            estimated_duration_ms,
            risk_level: risk_level(difference.object_type, difference.action),
            timeout_ms,
        })
    }

    /// Reverse order; a rollback waits for the rollbacks of everything that
    /// depended on its forward operation
    fn rollback_operations(
        operations: &[MigrationOperation],
        options: &MigrationGeneratorOptions,
    ) -> Vec<MigrationOperation> {
        operations
            .iter()
            .rev()
            .filter_map(|op| {
                let rollback_sql = op.rollback_sql.clone()?;
                let action = op.action.inverse();
                let dependencies = operations
                    .iter()
                    .filter(|other| other.dependencies.contains(&op.id) && other.rollback_sql.is_some())
                    .map(|other| format!("rollback_{}", other.id))
                    .collect();

                Some(MigrationOperation {
                    id: format!("rollback_{}", op.id),
                    description: format!("Revert: {}", op.description),
                    object_type: op.object_type,
                    action,
                    object_key: op.object_key.clone(),
                    sql: rollback_sql,
                    rollback_sql: Some(op.sql.clone()),
                    reversible: true,
                    dependencies,
                    estimated_duration_ms: op.estimated_duration_ms,
                    risk_level: risk_level(op.object_type, action),
                    timeout_ms: op.timeout_ms.max(options.operation_timeout_ms),
                })
            })
            .collect()
    }
}

pub fn operation_id(difference: &SchemaDifference) -> String {
    format!("{}_{}", difference.action.as_str(), difference.object_key())
}

fn script_id(operations: &[MigrationOperation]) -> String {
    let mut hasher = Sha256::new();
    for op in operations {
        hasher.update(op.sql.as_bytes());
        hasher.update(b"\n");
    }
    hex::encode(hasher.finalize())
}

pub fn risk_level(object_type: ObjectType, action: DiffAction) -> RiskLevel {
    match (object_type, action) {
        (ObjectType::Table, DiffAction::Create) => RiskLevel::Low,
        (ObjectType::Table, DiffAction::Alter) => RiskLevel::Medium,
        (ObjectType::Table, DiffAction::Drop) => RiskLevel::High,
        (ObjectType::Function, DiffAction::Drop) => RiskLevel::Medium,
        (ObjectType::Extension, DiffAction::Drop) => RiskLevel::Medium,
        _ => RiskLevel::Low,
    }
}

fn estimate_duration(difference: &SchemaDifference) -> u64 {
    use DiffAction::*;
    match (difference.object_type, difference.action) {
        (ObjectType::Extension, Drop) => 200,
        (ObjectType::Extension, _) => 1_000,
        (ObjectType::Table, Create) => 500,
        (ObjectType::Table, Drop) => 300,
        (ObjectType::Table, Alter) => {
            let changes = match &difference.details.changes {
                Some(ObjectChanges::Table(t)) => t.change_count() as u64,
                _ => 1,
            };
            1_000 + 250 * changes
        }
        (ObjectType::Function, _) => 200,
        (ObjectType::Trigger, _) | (ObjectType::Policy, _) => 100,
        (ObjectType::Index, Create) => 5_000,
        (ObjectType::Index, Drop) => 200,
        (ObjectType::Index, Alter) => 5_200,
    }
}

fn is_data_destroying_drop(difference: &SchemaDifference) -> bool {
    difference.object_type == ObjectType::Table && difference.action == DiffAction::Drop
}

/// Dropping a table or a column loses rows a generated script cannot bring back
fn is_reversible(difference: &SchemaDifference) -> bool {
    if is_data_destroying_drop(difference) {
        return false;
    }
    if difference.object_type == ObjectType::Table && difference.action == DiffAction::Alter {
        if let Some(ObjectChanges::Table(changes)) = &difference.details.changes {
            return changes.columns_dropped.is_empty();
        }
    }
    true
}

fn describe(difference: &SchemaDifference) -> String {
    let verb = match difference.action {
        DiffAction::Create => "Create",
        DiffAction::Drop => "Drop",
        DiffAction::Alter => "Alter",
    };
    format!("{} {} {}", verb, difference.object_type, difference.key).replace(['\n', '\r'], " ")
}

fn mismatch(difference: &SchemaDifference) -> AppError {
    AppError::MigrationGeneration {
        object: difference.object_key(),
        message: "definition does not match the difference type".to_string(),
    }
}

fn render(difference: &SchemaDifference, safe: bool) -> Result<String, AppError> {
    let before = difference.details.before.as_ref();
    let after = difference.details.after.as_ref();

    match difference.action {
        DiffAction::Create => match after {
            Some(ObjectDefinition::Extension(e)) => Ok(sql::create_extension(e, safe)),
            Some(ObjectDefinition::Table(t)) => sql::create_table(t, safe),
            Some(ObjectDefinition::Function(f)) => sql::create_function(f, safe),
            Some(ObjectDefinition::Trigger(t)) => sql::create_trigger(t, safe),
            Some(ObjectDefinition::Index(i)) => sql::create_index(i, safe),
            Some(ObjectDefinition::Policy(p)) => sql::create_policy(p, safe),
            None => Err(mismatch(difference)),
        },
        DiffAction::Drop => match before {
            Some(ObjectDefinition::Extension(e)) => Ok(sql::drop_extension(e, safe)),
            Some(ObjectDefinition::Table(t)) => Ok(sql::drop_table(t, safe)),
            Some(ObjectDefinition::Function(f)) => Ok(sql::drop_function(f, safe)),
            Some(ObjectDefinition::Trigger(t)) => Ok(sql::drop_trigger(t, safe)),
            Some(ObjectDefinition::Index(i)) => Ok(sql::drop_index(i, safe)),
            Some(ObjectDefinition::Policy(p)) => Ok(sql::drop_policy(p, safe)),
            None => Err(mismatch(difference)),
        },
        DiffAction::Alter => render_alter(difference, safe),
    }
}

fn render_alter(difference: &SchemaDifference, safe: bool) -> Result<String, AppError> {
    let (before, after) = match (&difference.details.before, &difference.details.after) {
        (Some(b), Some(a)) => (b, a),
        _ => return Err(mismatch(difference)),
    };
    let changes = difference.details.changes.as_ref().ok_or_else(|| mismatch(difference))?;

    match (before, after, changes) {
        (ObjectDefinition::Extension(b), ObjectDefinition::Extension(a), _) => {
            Ok(sql::alter_extension(b, a))
        }
        (ObjectDefinition::Table(_), ObjectDefinition::Table(a), ObjectChanges::Table(t)) => {
            sql::alter_table(a, t, safe)
        }
        (ObjectDefinition::Function(b), ObjectDefinition::Function(a), ObjectChanges::Attributes { changes }) => {
            let replace_impossible = changes
                .iter()
                .any(|c| c.attribute == "returnType" || c.attribute == "parameters");
            sql::alter_function(b, a, replace_impossible)
        }
        (ObjectDefinition::Trigger(b), ObjectDefinition::Trigger(a), _) => {
            if b.table != a.table {
                Ok(format!("{}\n{}", sql::drop_trigger(b, true), sql::create_trigger(a, false)?))
            } else {
                sql::create_trigger(a, true)
            }
        }
        (ObjectDefinition::Index(b), ObjectDefinition::Index(a), _) => Ok(format!(
            "{}\n{}",
            sql::drop_index(b, true),
            sql::create_index(a, safe)?
        )),
        (ObjectDefinition::Policy(b), ObjectDefinition::Policy(a), _) => Ok(format!(
            "{}\n{}",
            sql::drop_policy(b, true),
            sql::create_policy(a, false)?
        )),
        _ => Err(mismatch(difference)),
    }
}
