//! Schema Comparator
//!
//! Diffs two schema snapshots into an ordered list of differences. The
//! `source` snapshot is the desired state and the `target` snapshot is the
//! current state; applying the differences in order turns target into source.

use crate::error::AppError;
use crate::schema::model::*;
use crate::schema::topology::cyclic_tables;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::{debug, warn};

/// What a difference does to the target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiffAction {
    Create,
    Drop,
    Alter,
}

impl DiffAction {
    pub fn inverse(&self) -> DiffAction {
        match self {
            DiffAction::Create => DiffAction::Drop,
            DiffAction::Drop => DiffAction::Create,
            DiffAction::Alter => DiffAction::Alter,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DiffAction::Create => "create",
            DiffAction::Drop => "drop",
            DiffAction::Alter => "alter",
        }
    }
}

/// A before/after pair for a scalar attribute
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValueChange<T> {
    pub before: T,
    pub after: T,
}

impl<T: Clone> ValueChange<T> {
    fn inverted(&self) -> Self {
        Self {
            before: self.after.clone(),
            after: self.before.clone(),
        }
    }
}

/// Column present on both sides with differing type, nullability or default
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnChange {
    pub name: String,
    pub before: ColumnDefinition,
    pub after: ColumnDefinition,
}

impl ColumnChange {
    pub fn type_changed(&self) -> bool {
        normalize_type(&self.before.data_type) != normalize_type(&self.after.data_type)
    }

    pub fn nullability_changed(&self) -> bool {
        self.before.nullable != self.after.nullable
    }

    pub fn default_changed(&self) -> bool {
        normalize_expression(self.before.default_value.as_deref())
            != normalize_expression(self.after.default_value.as_deref())
    }
}

/// Per-sub-attribute changes of an altered table
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TableChanges {
    #[serde(rename = "columns.add", default, skip_serializing_if = "Vec::is_empty")]
    pub columns_added: Vec<ColumnDefinition>,
    #[serde(rename = "columns.drop", default, skip_serializing_if = "Vec::is_empty")]
    pub columns_dropped: Vec<ColumnDefinition>,
    #[serde(rename = "columns.modify", default, skip_serializing_if = "Vec::is_empty")]
    pub columns_modified: Vec<ColumnChange>,
    #[serde(rename = "constraints.add", default, skip_serializing_if = "Vec::is_empty")]
    pub constraints_added: Vec<ConstraintDefinition>,
    #[serde(rename = "constraints.drop", default, skip_serializing_if = "Vec::is_empty")]
    pub constraints_dropped: Vec<ConstraintDefinition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<ValueChange<Option<String>>>,
    #[serde(rename = "rowLevelSecurity", default, skip_serializing_if = "Option::is_none")]
    pub row_level_security: Option<ValueChange<bool>>,
}

impl TableChanges {
    pub fn is_empty(&self) -> bool {
        self.columns_added.is_empty()
            && self.columns_dropped.is_empty()
            && self.columns_modified.is_empty()
            && self.constraints_added.is_empty()
            && self.constraints_dropped.is_empty()
            && self.comment.is_none()
            && self.row_level_security.is_none()
    }

    pub fn change_count(&self) -> usize {
        self.columns_added.len()
            + self.columns_dropped.len()
            + self.columns_modified.len()
            + self.constraints_added.len()
            + self.constraints_dropped.len()
            + usize::from(self.comment.is_some())
            + usize::from(self.row_level_security.is_some())
    }

    fn inverted(&self) -> TableChanges {
        TableChanges {
            columns_added: self.columns_dropped.clone(),
            columns_dropped: self.columns_added.clone(),
            columns_modified: self
                .columns_modified
                .iter()
                .map(|c| ColumnChange {
                    name: c.name.clone(),
                    before: c.after.clone(),
                    after: c.before.clone(),
                })
                .collect(),
            constraints_added: self.constraints_dropped.clone(),
            constraints_dropped: self.constraints_added.clone(),
            comment: self.comment.as_ref().map(ValueChange::inverted),
            row_level_security: self.row_level_security.as_ref().map(ValueChange::inverted),
        }
    }
}

/// Generic top-level attribute change for non-table objects
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeChange {
    pub attribute: String,
    pub before: serde_json::Value,
    pub after: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ObjectChanges {
    Table(TableChanges),
    Attributes { changes: Vec<AttributeChange> },
}

impl ObjectChanges {
    fn inverted(&self) -> ObjectChanges {
        match self {
            ObjectChanges::Table(t) => ObjectChanges::Table(t.inverted()),
            ObjectChanges::Attributes { changes } => ObjectChanges::Attributes {
                changes: changes
                    .iter()
                    .map(|c| AttributeChange {
                        attribute: c.attribute.clone(),
                        before: c.after.clone(),
                        after: c.before.clone(),
                    })
                    .collect(),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DifferenceDetails {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before: Option<ObjectDefinition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after: Option<ObjectDefinition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub changes: Option<ObjectChanges>,
}

/// A single structural delta between two snapshots
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemaDifference {
    #[serde(rename = "type")]
    pub object_type: ObjectType,
    pub action: DiffAction,
    pub object_name: String,
    pub schema_name: String,
    /// Fully-qualified identity within the object category
    pub key: String,
    pub details: DifferenceDetails,
    /// Object keys (`type:key`) this difference depends on
    pub dependencies: Vec<String>,
    pub priority: i32,
}

impl SchemaDifference {
    /// Category-qualified key used in dependency edges
    pub fn object_key(&self) -> String {
        object_key(self.object_type, &self.key)
    }

    /// The definition the difference is "about": `after` unless dropping
    pub fn subject(&self) -> Option<&ObjectDefinition> {
        match self.action {
            DiffAction::Drop => self.details.before.as_ref(),
            _ => self.details.after.as_ref(),
        }
    }

    /// Swap before/after and invert the action; used to derive rollbacks
    pub fn inverted(&self) -> SchemaDifference {
        let action = self.action.inverse();
        SchemaDifference {
            object_type: self.object_type,
            action,
            object_name: self.object_name.clone(),
            schema_name: self.schema_name.clone(),
            key: self.key.clone(),
            details: DifferenceDetails {
                before: self.details.after.clone(),
                after: self.details.before.clone(),
                changes: self.details.changes.as_ref().map(ObjectChanges::inverted),
            },
            dependencies: self.dependencies.clone(),
            priority: base_priority(self.object_type, action),
        }
    }

    /// Check the create/drop/alter payload invariants
    pub fn validate(&self) -> Result<(), AppError> {
        let ok = match self.action {
            DiffAction::Create => self.details.after.is_some() && self.details.before.is_none(),
            DiffAction::Drop => self.details.before.is_some() && self.details.after.is_none(),
            DiffAction::Alter => {
                self.details.before.is_some()
                    && self.details.after.is_some()
                    && self.details.changes.is_some()
            }
        };
        if ok {
            Ok(())
        } else {
            Err(AppError::SchemaDiff {
                object: self.object_key(),
                message: format!("malformed {} difference payload", self.action.as_str()),
            })
        }
    }
}

pub fn object_key(object_type: ObjectType, key: &str) -> String {
    format!("{}:{}", object_type, key)
}

/// Base execution priority by type and action
pub fn base_priority(object_type: ObjectType, action: DiffAction) -> i32 {
    use DiffAction::*;
    use ObjectType::*;
    match (object_type, action) {
        (Extension, Create) => 0,
        (Extension, Alter) => 0,
        (Table, Create) => 1,
        (Trigger, Drop) => 2,
        (Policy, Drop) => 2,
        (Function, Create) => 3,
        (Index, Drop) => 4,
        (Table, Alter) => 5,
        (Function, Alter) => 6,
        (Trigger, Create) => 7,
        (Trigger, Alter) => 7,
        (Policy, Create) => 8,
        (Policy, Alter) => 8,
        (Function, Drop) => 8,
        (Index, Create) => 9,
        (Index, Alter) => 9,
        (Table, Drop) => 10,
        (Extension, Drop) => 11,
    }
}

/// Options controlling which categories are compared
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ComparisonOptions {
    pub ignore_indexes: bool,
    pub ignore_policies: bool,
    pub ignore_extensions: bool,
    pub dependency_analysis: bool,
}

impl Default for ComparisonOptions {
    fn default() -> Self {
        Self {
            ignore_indexes: false,
            ignore_policies: false,
            ignore_extensions: false,
            dependency_analysis: true,
        }
    }
}

/// Summary statistics for the diff
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiffSummary {
    pub total_differences: usize,
    pub creates: usize,
    pub drops: usize,
    pub alters: usize,
    pub by_object_type: BTreeMap<String, usize>,
    pub source_checksum: String,
    pub target_checksum: String,
    pub warnings: Vec<String>,
}

/// Complete comparison result
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemaDiff {
    pub differences: Vec<SchemaDifference>,
    pub summary: DiffSummary,
}

impl SchemaDiff {
    pub fn is_empty(&self) -> bool {
        self.differences.is_empty()
    }
}

/// The comparator that diffs schema snapshots
pub struct SchemaComparator;

impl SchemaComparator {
    /// Compare `source` (desired) against `target` (current)
    pub fn compare(
        source: &SchemaDefinition,
        target: &SchemaDefinition,
        options: &ComparisonOptions,
    ) -> Result<SchemaDiff, AppError> {
        let mut differences = Vec::new();

        if !options.ignore_extensions {
            Self::diff_category(&source.extensions, &target.extensions, &mut differences, Self::compare_attributes)?;
        }
        Self::diff_category(&source.tables, &target.tables, &mut differences, Self::compare_tables)?;
        let mut warnings = Self::defer_cyclic_foreign_keys(&mut differences);
        Self::diff_category(&source.functions, &target.functions, &mut differences, Self::compare_functions)?;
        Self::diff_category(&source.triggers, &target.triggers, &mut differences, Self::compare_attributes)?;
        if !options.ignore_indexes {
            Self::diff_category(&source.indexes, &target.indexes, &mut differences, Self::compare_attributes)?;
        }
        if !options.ignore_policies {
            Self::diff_category(&source.policies, &target.policies, &mut differences, Self::compare_attributes)?;
        }

        if options.dependency_analysis {
            for difference in &mut differences {
                difference.dependencies = Self::dependencies_of(difference);
            }
            Self::adjust_priorities(&mut differences);
            warnings.extend(Self::detect_cycles(&differences)?);
        }

        let (differences, order_warnings) = Self::order(differences);
        warnings.extend(order_warnings);

        for warning in &warnings {
            warn!("Schema comparison warning: {}", warning);
        }

        let summary = Self::calculate_summary(&differences, source, target, warnings);
        debug!(
            "Compared schemas: {} differences ({} create, {} drop, {} alter)",
            summary.total_differences, summary.creates, summary.drops, summary.alters
        );

        Ok(SchemaDiff {
            differences,
            summary,
        })
    }

    fn diff_category<T, F>(
        source: &[T],
        target: &[T],
        differences: &mut Vec<SchemaDifference>,
        compare: F,
    ) -> Result<(), AppError>
    where
        T: SchemaObject,
        F: Fn(&T, &T) -> Result<Option<ObjectChanges>, AppError>,
    {
        let source_map = Self::key_map(source)?;
        let target_map = Self::key_map(target)?;

        // Only in source: create
        for (key, object) in &source_map {
            if !target_map.contains_key(key) {
                differences.push(Self::difference(
                    *object,
                    DiffAction::Create,
                    DifferenceDetails {
                        before: None,
                        after: Some((*object).clone().into_definition()),
                        changes: None,
                    },
                ));
            }
        }

        // Only in target: drop
        for (key, object) in &target_map {
            if !source_map.contains_key(key) {
                differences.push(Self::difference(
                    *object,
                    DiffAction::Drop,
                    DifferenceDetails {
                        before: Some((*object).clone().into_definition()),
                        after: None,
                        changes: None,
                    },
                ));
            }
        }

        // In both but structurally unequal: alter
        for (key, desired) in &source_map {
            if let Some(current) = target_map.get(key) {
                if let Some(changes) = compare(current, desired)? {
                    differences.push(Self::difference(
                        *desired,
                        DiffAction::Alter,
                        DifferenceDetails {
                            before: Some((*current).clone().into_definition()),
                            after: Some((*desired).clone().into_definition()),
                            changes: Some(changes),
                        },
                    ));
                }
            }
        }

        Ok(())
    }

    fn key_map<T: SchemaObject>(objects: &[T]) -> Result<BTreeMap<String, &T>, AppError> {
        let mut map = BTreeMap::new();
        for object in objects {
            let key = object.key();
            if map.insert(key.clone(), object).is_some() {
                return Err(AppError::SchemaDiff {
                    object: object_key(T::OBJECT_TYPE, &key),
                    message: "object defined more than once in snapshot".to_string(),
                });
            }
        }
        Ok(map)
    }

    fn difference<T: SchemaObject>(
        object: &T,
        action: DiffAction,
        details: DifferenceDetails,
    ) -> SchemaDifference {
        SchemaDifference {
            object_type: T::OBJECT_TYPE,
            action,
            object_name: object.object_name().to_string(),
            schema_name: object.schema_name().to_string(),
            key: object.key(),
            details,
            dependencies: Vec::new(),
            priority: base_priority(T::OBJECT_TYPE, action),
        }
    }

    fn compare_tables(
        current: &TableDefinition,
        desired: &TableDefinition,
    ) -> Result<Option<ObjectChanges>, AppError> {
        let mut changes = TableChanges::default();

        let current_cols: HashMap<&str, &ColumnDefinition> =
            current.columns.iter().map(|c| (c.name.as_str(), c)).collect();
        let desired_cols: HashMap<&str, &ColumnDefinition> =
            desired.columns.iter().map(|c| (c.name.as_str(), c)).collect();

        // Iterate declared order so generated DDL is stable
        for col in &desired.columns {
            match current_cols.get(col.name.as_str()) {
                None => changes.columns_added.push(col.clone()),
                Some(before) => {
                    let change = ColumnChange {
                        name: col.name.clone(),
                        before: (*before).clone(),
                        after: col.clone(),
                    };
                    if change.type_changed() || change.nullability_changed() || change.default_changed() {
                        changes.columns_modified.push(change);
                    }
                }
            }
        }
        for col in &current.columns {
            if !desired_cols.contains_key(col.name.as_str()) {
                changes.columns_dropped.push(col.clone());
            }
        }

        let current_cons: HashMap<&str, &ConstraintDefinition> =
            current.constraints.iter().map(|c| (c.name.as_str(), c)).collect();
        let desired_cons: HashMap<&str, &ConstraintDefinition> =
            desired.constraints.iter().map(|c| (c.name.as_str(), c)).collect();

        for con in &desired.constraints {
            match current_cons.get(con.name.as_str()) {
                None => changes.constraints_added.push(con.clone()),
                Some(before) if !Self::constraints_equal(before, con) => {
                    changes.constraints_dropped.push((*before).clone());
                    changes.constraints_added.push(con.clone());
                }
                Some(_) => {}
            }
        }
        for con in &current.constraints {
            if !desired_cons.contains_key(con.name.as_str()) {
                changes.constraints_dropped.push(con.clone());
            }
        }

        if normalize_expression(current.comment.as_deref()) != normalize_expression(desired.comment.as_deref()) {
            changes.comment = Some(ValueChange {
                before: current.comment.clone(),
                after: desired.comment.clone(),
            });
        }
        if current.row_level_security != desired.row_level_security {
            changes.row_level_security = Some(ValueChange {
                before: current.row_level_security,
                after: desired.row_level_security,
            });
        }

        if changes.is_empty() {
            Ok(None)
        } else {
            Ok(Some(ObjectChanges::Table(changes)))
        }
    }

    /// New tables that reference each other cannot carry those foreign keys
    /// in CREATE TABLE. The keys move to a table alter that runs after the
    /// creates.
    fn defer_cyclic_foreign_keys(differences: &mut Vec<SchemaDifference>) -> Vec<String> {
        let created: Vec<TableDefinition> = differences
            .iter()
            .filter(|d| d.object_type == ObjectType::Table && d.action == DiffAction::Create)
            .filter_map(|d| match &d.details.after {
                Some(ObjectDefinition::Table(t)) => Some(t.clone()),
                _ => None,
            })
            .collect();
        let cyclic = cyclic_tables(&created);
        if cyclic.is_empty() {
            return Vec::new();
        }

        let mut deferred = Vec::new();
        for difference in differences.iter_mut() {
            if difference.action != DiffAction::Create || !cyclic.contains(&difference.key) {
                continue;
            }
            let Some(ObjectDefinition::Table(full)) = difference.details.after.clone() else {
                continue;
            };
            let (moved, kept): (Vec<ConstraintDefinition>, Vec<ConstraintDefinition>) =
                full.constraints.iter().cloned().partition(|c| {
                    c.kind == ConstraintKind::ForeignKey
                        && c.references
                            .as_ref()
                            .map_or(false, |r| r.key() != full.key() && cyclic.contains(&r.key()))
                });
            if moved.is_empty() {
                continue;
            }

            let mut bare = full.clone();
            bare.constraints = kept;
            difference.details.after = Some(ObjectDefinition::Table(bare.clone()));
            deferred.push(SchemaDifference {
                object_type: ObjectType::Table,
                action: DiffAction::Alter,
                object_name: difference.object_name.clone(),
                schema_name: difference.schema_name.clone(),
                key: difference.key.clone(),
                details: DifferenceDetails {
                    before: Some(ObjectDefinition::Table(bare)),
                    after: Some(ObjectDefinition::Table(full)),
                    changes: Some(ObjectChanges::Table(TableChanges {
                        constraints_added: moved,
                        ..Default::default()
                    })),
                },
                dependencies: Vec::new(),
                priority: base_priority(ObjectType::Table, DiffAction::Alter),
            });
        }

        let keys: Vec<&str> = cyclic.iter().map(String::as_str).collect();
        let warning = format!(
            "foreign-key cycle between new tables {}; their foreign keys are added after creation",
            keys.join(", ")
        );
        differences.extend(deferred);
        vec![warning]
    }

    fn constraints_equal(a: &ConstraintDefinition, b: &ConstraintDefinition) -> bool {
        a.kind == b.kind
            && normalize_expression(Some(&a.definition)) == normalize_expression(Some(&b.definition))
    }

    fn compare_functions(
        current: &FunctionDefinition,
        desired: &FunctionDefinition,
    ) -> Result<Option<ObjectChanges>, AppError> {
        let mut changes = Vec::new();

        let mut push = |attribute: &str, before: serde_json::Value, after: serde_json::Value| {
            changes.push(AttributeChange {
                attribute: attribute.to_string(),
                before,
                after,
            });
        };

        if normalize_type(&current.return_type) != normalize_type(&desired.return_type) {
            push("returnType", current.return_type.clone().into(), desired.return_type.clone().into());
        }
        if current.body.trim() != desired.body.trim() {
            push("body", current.body.clone().into(), desired.body.clone().into());
        }
        if !current.language.eq_ignore_ascii_case(&desired.language) {
            push("language", current.language.clone().into(), desired.language.clone().into());
        }
        if current.volatility != desired.volatility {
            push(
                "volatility",
                serde_json::to_value(current.volatility)?,
                serde_json::to_value(desired.volatility)?,
            );
        }
        if current.security_definer != desired.security_definer {
            push("securityDefiner", current.security_definer.into(), desired.security_definer.into());
        }
        if current.parameters != desired.parameters {
            push(
                "parameters",
                serde_json::to_value(&current.parameters)?,
                serde_json::to_value(&desired.parameters)?,
            );
        }

        if changes.is_empty() {
            Ok(None)
        } else {
            Ok(Some(ObjectChanges::Attributes { changes }))
        }
    }

    /// Deep equality over the serialized object, reporting top-level fields
    fn compare_attributes<T: SchemaObject>(
        current: &T,
        desired: &T,
    ) -> Result<Option<ObjectChanges>, AppError> {
        if current == desired {
            return Ok(None);
        }

        let before = serde_json::to_value(current)?;
        let after = serde_json::to_value(desired)?;
        let empty = serde_json::Map::new();
        let before_map = before.as_object().unwrap_or(&empty);
        let after_map = after.as_object().unwrap_or(&empty);

        let fields: BTreeSet<&String> = before_map.keys().chain(after_map.keys()).collect();
        let changes: Vec<AttributeChange> = fields
            .into_iter()
            .filter_map(|field| {
                let b = before_map.get(field).cloned().unwrap_or(serde_json::Value::Null);
                let a = after_map.get(field).cloned().unwrap_or(serde_json::Value::Null);
                (b != a).then(|| AttributeChange {
                    attribute: field.clone(),
                    before: b,
                    after: a,
                })
            })
            .collect();

        Ok(Some(ObjectChanges::Attributes { changes }))
    }

    /// Explicit dependency edges: trigger→table+function, index→table, policy→table
    fn dependencies_of(difference: &SchemaDifference) -> Vec<String> {
        let mut deps = match difference.subject() {
            Some(ObjectDefinition::Trigger(t)) => vec![
                object_key(ObjectType::Table, &t.table_ref().key()),
                object_key(ObjectType::Function, &t.function_key()),
            ],
            Some(ObjectDefinition::Index(i)) => {
                vec![object_key(ObjectType::Table, &i.table_ref().key())]
            }
            Some(ObjectDefinition::Policy(p)) => {
                vec![object_key(ObjectType::Table, &p.table_ref().key())]
            }
            _ => Vec::new(),
        };
        deps.sort();
        deps.dedup();
        deps
    }

    /// Resolve dependency edges to indices of differences present in the diff
    fn edges(differences: &[SchemaDifference]) -> Vec<(usize, usize)> {
        let index: HashMap<String, usize> = differences
            .iter()
            .enumerate()
            .map(|(i, d)| (d.object_key(), i))
            .collect();

        let mut edges = Vec::new();
        for (i, difference) in differences.iter().enumerate() {
            for dep in &difference.dependencies {
                if let Some(&j) = index.get(dep) {
                    if i != j {
                        edges.push((i, j));
                    }
                }
            }
        }
        edges
    }

    /// Creates of referents never run before creates of what they reference;
    /// drops of referents never run after drops of what they reference.
    fn adjust_priorities(differences: &mut [SchemaDifference]) {
        let edges = Self::edges(differences);
        for _ in 0..=differences.len() {
            let mut changed = false;
            for &(dependent, dependency) in &edges {
                let dep_action = differences[dependency].action;
                let own_action = differences[dependent].action;
                let dep_priority = differences[dependency].priority;

                if own_action != DiffAction::Drop && dep_action != DiffAction::Drop {
                    if differences[dependent].priority < dep_priority {
                        differences[dependent].priority = dep_priority;
                        changed = true;
                    }
                } else if own_action == DiffAction::Drop && dep_action == DiffAction::Drop
                    && differences[dependent].priority > dep_priority
                {
                    differences[dependent].priority = dep_priority;
                    changed = true;
                }
            }
            if !changed {
                break;
            }
        }
    }

    /// Cycles among alters are warnings; any cycle touching a create/drop is an error
    fn detect_cycles(differences: &[SchemaDifference]) -> Result<Vec<String>, AppError> {
        let mut adjacency: Vec<Vec<usize>> = vec![Vec::new(); differences.len()];
        for (from, to) in Self::edges(differences) {
            adjacency[from].push(to);
        }

        // 0 = unvisited, 1 = on stack, 2 = done
        let mut state = vec![0u8; differences.len()];
        let mut warnings = Vec::new();

        fn visit(
            node: usize,
            adjacency: &[Vec<usize>],
            state: &mut [u8],
            stack: &mut Vec<usize>,
            cycles: &mut Vec<Vec<usize>>,
        ) {
            state[node] = 1;
            stack.push(node);
            for &next in &adjacency[node] {
                if state[next] == 1 {
                    if let Some(pos) = stack.iter().position(|&n| n == next) {
                        cycles.push(stack[pos..].to_vec());
                    }
                } else if state[next] == 0 {
                    visit(next, adjacency, state, stack, cycles);
                }
            }
            stack.pop();
            state[node] = 2;
        }

        let mut cycles = Vec::new();
        for node in 0..differences.len() {
            if state[node] == 0 {
                let mut stack = Vec::new();
                visit(node, &adjacency, &mut state, &mut stack, &mut cycles);
            }
        }

        for cycle in cycles {
            let names: Vec<String> = cycle.iter().map(|&i| differences[i].object_key()).collect();
            if cycle.iter().all(|&i| differences[i].action == DiffAction::Alter) {
                warnings.push(format!(
                    "dependency cycle among alter operations: {} (alters applied independently)",
                    names.join(" -> ")
                ));
            } else {
                return Err(AppError::SchemaDiff {
                    object: names[0].clone(),
                    message: format!("dependency cycle: {}", names.join(" -> ")),
                });
            }
        }

        Ok(warnings)
    }

    /// Sort by priority, then order each priority band topologically
    fn order(mut differences: Vec<SchemaDifference>) -> (Vec<SchemaDifference>, Vec<String>) {
        differences.sort_by(|a, b| {
            (a.priority, a.object_type, &a.key).cmp(&(b.priority, b.object_type, &b.key))
        });

        let index: HashMap<String, usize> = differences
            .iter()
            .enumerate()
            .map(|(i, d)| (d.object_key(), i))
            .collect();

        // must_precede[i] = indices that have to run before i
        let mut must_precede: Vec<BTreeSet<usize>> = vec![BTreeSet::new(); differences.len()];
        for (i, difference) in differences.iter().enumerate() {
            let mut referenced = difference.dependencies.clone();
            // Alters run once every table exists, so only creates and drops follow foreign keys
            if let (ObjectType::Table, Some(ObjectDefinition::Table(table)), false) = (
                difference.object_type,
                difference.subject(),
                difference.action == DiffAction::Alter,
            ) {
                referenced.extend(
                    table
                        .referenced_tables()
                        .iter()
                        .map(|k| object_key(ObjectType::Table, k)),
                );
            }

            for dep in referenced {
                let Some(&j) = index.get(&dep) else { continue };
                if i == j || differences[i].priority != differences[j].priority {
                    continue;
                }
                match (difference.action, differences[j].action) {
                    (DiffAction::Drop, DiffAction::Drop) => {
                        must_precede[j].insert(i);
                    }
                    (DiffAction::Drop, _) | (_, DiffAction::Drop) => {}
                    _ => {
                        must_precede[i].insert(j);
                    }
                }
            }
        }

        let mut warnings = Vec::new();
        let mut placed = vec![false; differences.len()];
        let mut order = Vec::with_capacity(differences.len());

        let mut start = 0;
        while start < differences.len() {
            let priority = differences[start].priority;
            let end = differences[start..]
                .iter()
                .position(|d| d.priority != priority)
                .map(|p| start + p)
                .unwrap_or(differences.len());

            loop {
                let ready = (start..end).find(|&i| {
                    !placed[i] && must_precede[i].iter().all(|&j| placed[j])
                });
                match ready {
                    Some(i) => {
                        placed[i] = true;
                        order.push(i);
                    }
                    None => break,
                }
            }

            let stuck: Vec<usize> = (start..end).filter(|&i| !placed[i]).collect();
            if !stuck.is_empty() {
                let names: Vec<String> = stuck.iter().map(|&i| differences[i].object_key()).collect();
                warnings.push(format!(
                    "circular references among {}; keeping declaration order",
                    names.join(", ")
                ));
                for i in stuck {
                    placed[i] = true;
                    order.push(i);
                }
            }
            start = end;
        }

        let mut slots: Vec<Option<SchemaDifference>> = differences.into_iter().map(Some).collect();
        let ordered = order.into_iter().filter_map(|i| slots[i].take()).collect();
        (ordered, warnings)
    }

    fn calculate_summary(
        differences: &[SchemaDifference],
        source: &SchemaDefinition,
        target: &SchemaDefinition,
        warnings: Vec<String>,
    ) -> DiffSummary {
        let mut summary = DiffSummary {
            total_differences: differences.len(),
            source_checksum: source.checksum(),
            target_checksum: target.checksum(),
            warnings,
            ..DiffSummary::default()
        };

        for difference in differences {
            match difference.action {
                DiffAction::Create => summary.creates += 1,
                DiffAction::Drop => summary.drops += 1,
                DiffAction::Alter => summary.alters += 1,
            }
            *summary
                .by_object_type
                .entry(difference.object_type.to_string())
                .or_insert(0) += 1;
        }

        summary
    }
}

/// Lowercase, collapse whitespace and fold common type aliases
pub fn normalize_type(data_type: &str) -> String {
    let collapsed = data_type
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase();

    let (base, suffix) = match collapsed.find('(') {
        Some(pos) => (collapsed[..pos].trim_end().to_string(), collapsed[pos..].replace(' ', "")),
        None => (collapsed.clone(), String::new()),
    };

    let base = match base.as_str() {
        "int" | "int4" => "integer",
        "int8" => "bigint",
        "int2" => "smallint",
        "bool" => "boolean",
        "varchar" => "character varying",
        "char" | "bpchar" => "character",
        "float8" => "double precision",
        "float4" => "real",
        "decimal" => "numeric",
        "timestamptz" => "timestamp with time zone",
        "timestamp" => "timestamp without time zone",
        other => other,
    };

    format!("{}{}", base, suffix)
}

fn normalize_expression(expr: Option<&str>) -> Option<String> {
    expr.map(|e| e.split_whitespace().collect::<Vec<_>>().join(" "))
        .filter(|e| !e.is_empty())
}
