//! Structural application of differences to a snapshot
//!
//! Computes the schema a migration is expected to produce without touching a
//! database. Used for final validation and for round-trip checks.

use crate::error::AppError;
use crate::schema::diff::{DiffAction, ObjectChanges, SchemaDifference, TableChanges};
use crate::schema::model::*;

/// Apply `differences` in order to a copy of `schema`
pub fn apply_differences(
    schema: &SchemaDefinition,
    differences: &[SchemaDifference],
) -> Result<SchemaDefinition, AppError> {
    let mut result = schema.clone();
    for difference in differences {
        apply_one(&mut result, difference)?;
    }
    Ok(result)
}

fn apply_one(schema: &mut SchemaDefinition, difference: &SchemaDifference) -> Result<(), AppError> {
    difference.validate()?;

    match difference.action {
        DiffAction::Drop => {
            let removed = match difference.object_type {
                ObjectType::Extension => remove(&mut schema.extensions, &difference.key),
                ObjectType::Table => remove(&mut schema.tables, &difference.key),
                ObjectType::Function => remove(&mut schema.functions, &difference.key),
                ObjectType::Trigger => remove(&mut schema.triggers, &difference.key),
                ObjectType::Index => remove(&mut schema.indexes, &difference.key),
                ObjectType::Policy => remove(&mut schema.policies, &difference.key),
            };
            if !removed {
                return Err(missing(difference));
            }
        }
        DiffAction::Create => {
            if let Some(definition) = &difference.details.after {
                upsert_definition(schema, definition.clone());
            }
        }
        DiffAction::Alter => match (&difference.details.changes, &difference.details.after) {
            (Some(ObjectChanges::Table(changes)), _) => {
                let table = schema
                    .tables
                    .iter_mut()
                    .find(|t| t.key() == difference.key)
                    .ok_or_else(|| missing(difference))?;
                apply_table_changes(table, changes);
            }
            (_, Some(definition)) => upsert_definition(schema, definition.clone()),
            (_, None) => return Err(missing(difference)),
        },
    }

    Ok(())
}

fn apply_table_changes(table: &mut TableDefinition, changes: &TableChanges) {
    table
        .columns
        .retain(|c| !changes.columns_dropped.iter().any(|d| d.name == c.name));
    for modified in &changes.columns_modified {
        if let Some(column) = table.columns.iter_mut().find(|c| c.name == modified.name) {
            *column = modified.after.clone();
        }
    }
    for added in &changes.columns_added {
        if table.column(&added.name).is_none() {
            table.columns.push(added.clone());
        }
    }
    table.columns.sort_by_key(|c| c.ordinal_position);

    table
        .constraints
        .retain(|c| !changes.constraints_dropped.iter().any(|d| d.name == c.name));
    for added in &changes.constraints_added {
        table.constraints.retain(|c| c.name != added.name);
        table.constraints.push(added.clone());
    }

    if let Some(comment) = &changes.comment {
        table.comment = comment.after.clone();
    }
    if let Some(rls) = &changes.row_level_security {
        table.row_level_security = rls.after;
    }
}

fn upsert_definition(schema: &mut SchemaDefinition, definition: ObjectDefinition) {
    match definition {
        ObjectDefinition::Extension(o) => upsert(&mut schema.extensions, o),
        ObjectDefinition::Table(o) => upsert(&mut schema.tables, o),
        ObjectDefinition::Function(o) => upsert(&mut schema.functions, o),
        ObjectDefinition::Trigger(o) => upsert(&mut schema.triggers, o),
        ObjectDefinition::Index(o) => upsert(&mut schema.indexes, o),
        ObjectDefinition::Policy(o) => upsert(&mut schema.policies, o),
    }
}

fn upsert<T: SchemaObject>(items: &mut Vec<T>, object: T) {
    let key = object.key();
    match items.iter().position(|o| o.key() == key) {
        Some(i) => items[i] = object,
        None => items.push(object),
    }
}

fn remove<T: SchemaObject>(items: &mut Vec<T>, key: &str) -> bool {
    let before = items.len();
    items.retain(|o| o.key() != key);
    items.len() != before
}

fn missing(difference: &SchemaDifference) -> AppError {
    AppError::SchemaDiff {
        object: difference.object_key(),
        message: format!("cannot {} an object that is not present", difference.action.as_str()),
    }
}
