//! Schema snapshot model
//!
//! Immutable, point-in-time description of an environment's database
//! structure. Two snapshots are the inputs of every comparison; neither is
//! ever mutated by the comparator or the generator.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use uuid::Uuid;

/// Categories of schema objects, in declared comparison order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectType {
    Extension,
    Table,
    Function,
    Trigger,
    Index,
    Policy,
}

impl ObjectType {
    pub const ALL: [ObjectType; 6] = [
        ObjectType::Extension,
        ObjectType::Table,
        ObjectType::Function,
        ObjectType::Trigger,
        ObjectType::Index,
        ObjectType::Policy,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectType::Extension => "extension",
            ObjectType::Table => "table",
            ObjectType::Function => "function",
            ObjectType::Trigger => "trigger",
            ObjectType::Index => "index",
            ObjectType::Policy => "policy",
        }
    }
}

impl fmt::Display for ObjectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Quote a PostgreSQL identifier, doubling embedded quotes
pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// Schema-qualified table reference
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TableRef {
    pub schema: String,
    pub name: String,
}

impl TableRef {
    pub fn new(schema: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            name: name.into(),
        }
    }

    /// Parse `schema.table`, defaulting to `public` when unqualified
    pub fn parse(qualified: &str) -> Self {
        match qualified.split_once('.') {
            Some((schema, name)) => Self::new(schema, name),
            None => Self::new("public", qualified),
        }
    }

    pub fn key(&self) -> String {
        format!("{}.{}", self.schema, self.name)
    }

    pub fn quoted(&self) -> String {
        format!("{}.{}", quote_ident(&self.schema), quote_ident(&self.name))
    }
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.schema, self.name)
    }
}

/// Column representation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ColumnDefinition {
    pub name: String,
    pub data_type: String,
    pub nullable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_value: Option<String>,
    #[serde(default)]
    pub ordinal_position: i32,
}

impl ColumnDefinition {
    /// Sequence fed by a `nextval('...')` default, if any
    pub fn sequence_name(&self) -> Option<String> {
        let default = self.default_value.as_deref()?;
        let start = default.find("nextval('")? + "nextval('".len();
        let rest = &default[start..];
        let end = rest.find('\'')?;
        Some(rest[..end].to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConstraintKind {
    PrimaryKey,
    ForeignKey,
    Unique,
    Check,
    Exclusion,
}

/// Table constraint. `definition` is the full constraint body as rendered by
/// the catalog, e.g. `FOREIGN KEY (customer_id) REFERENCES public.customers(id)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConstraintDefinition {
    pub name: String,
    pub kind: ConstraintKind,
    #[serde(default)]
    pub columns: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub references: Option<TableRef>,
    pub definition: String,
}

/// Table representation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableDefinition {
    pub schema: String,
    pub name: String,
    pub columns: Vec<ColumnDefinition>,
    #[serde(default)]
    pub constraints: Vec<ConstraintDefinition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    #[serde(default)]
    pub row_level_security: bool,
}

impl TableDefinition {
    pub fn table_ref(&self) -> TableRef {
        TableRef::new(&self.schema, &self.name)
    }

    pub fn column(&self, name: &str) -> Option<&ColumnDefinition> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn primary_key_columns(&self) -> Vec<String> {
        self.constraints
            .iter()
            .find(|c| c.kind == ConstraintKind::PrimaryKey)
            .map(|c| c.columns.clone())
            .unwrap_or_default()
    }

    /// Keys of the tables this table references through foreign keys
    pub fn referenced_tables(&self) -> Vec<String> {
        let own = self.table_ref().key();
        let mut refs: Vec<String> = self
            .constraints
            .iter()
            .filter(|c| c.kind == ConstraintKind::ForeignKey)
            .filter_map(|c| c.references.as_ref().map(TableRef::key))
            .filter(|k| *k != own)
            .collect();
        refs.sort();
        refs.dedup();
        refs
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ParameterMode {
    #[default]
    In,
    Out,
    InOut,
    Variadic,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FunctionParameter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub data_type: String,
    #[serde(default)]
    pub mode: ParameterMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Volatility {
    Immutable,
    Stable,
    #[default]
    Volatile,
}

impl Volatility {
    pub fn as_sql(&self) -> &'static str {
        match self {
            Volatility::Immutable => "IMMUTABLE",
            Volatility::Stable => "STABLE",
            Volatility::Volatile => "VOLATILE",
        }
    }
}

/// Stored function or procedure
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FunctionDefinition {
    pub schema: String,
    pub name: String,
    #[serde(default)]
    pub parameters: Vec<FunctionParameter>,
    pub return_type: String,
    pub body: String,
    pub language: String,
    #[serde(default)]
    pub volatility: Volatility,
    #[serde(default)]
    pub security_definer: bool,
}

impl FunctionDefinition {
    /// Argument types that form the function's identity (OUT parameters excluded)
    pub fn identity_arguments(&self) -> String {
        self.parameters
            .iter()
            .filter(|p| p.mode != ParameterMode::Out)
            .map(|p| p.data_type.trim().to_lowercase())
            .collect::<Vec<_>>()
            .join(",")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerTiming {
    Before,
    After,
    InsteadOf,
}

impl TriggerTiming {
    pub fn as_sql(&self) -> &'static str {
        match self {
            TriggerTiming::Before => "BEFORE",
            TriggerTiming::After => "AFTER",
            TriggerTiming::InsteadOf => "INSTEAD OF",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerEvent {
    Insert,
    Update,
    Delete,
    Truncate,
}

impl TriggerEvent {
    pub fn as_sql(&self) -> &'static str {
        match self {
            TriggerEvent::Insert => "INSERT",
            TriggerEvent::Update => "UPDATE",
            TriggerEvent::Delete => "DELETE",
            TriggerEvent::Truncate => "TRUNCATE",
        }
    }
}

fn default_true() -> bool {
    true
}

/// Trigger bound to a table, firing a trigger function
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerDefinition {
    pub schema: String,
    pub name: String,
    pub table: String,
    pub timing: TriggerTiming,
    pub events: Vec<TriggerEvent>,
    #[serde(default = "default_true")]
    pub for_each_row: bool,
    pub function_schema: String,
    pub function_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
}

impl TriggerDefinition {
    pub fn table_ref(&self) -> TableRef {
        TableRef::new(&self.schema, &self.table)
    }

    /// Key of the referenced trigger function (trigger functions take no arguments)
    pub fn function_key(&self) -> String {
        format!("{}.{}()", self.function_schema, self.function_name)
    }
}

fn default_index_type() -> String {
    "btree".to_string()
}

/// Index representation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexDefinition {
    pub schema: String,
    pub name: String,
    pub table: String,
    pub columns: Vec<String>,
    #[serde(default)]
    pub unique: bool,
    #[serde(default = "default_index_type")]
    pub index_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub predicate: Option<String>,
}

impl IndexDefinition {
    pub fn table_ref(&self) -> TableRef {
        TableRef::new(&self.schema, &self.table)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PolicyCommand {
    #[default]
    All,
    Select,
    Insert,
    Update,
    Delete,
}

impl PolicyCommand {
    pub fn as_sql(&self) -> &'static str {
        match self {
            PolicyCommand::All => "ALL",
            PolicyCommand::Select => "SELECT",
            PolicyCommand::Insert => "INSERT",
            PolicyCommand::Update => "UPDATE",
            PolicyCommand::Delete => "DELETE",
        }
    }
}

/// Row-security policy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyDefinition {
    pub schema: String,
    pub table: String,
    pub name: String,
    #[serde(default)]
    pub command: PolicyCommand,
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub using_expression: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub check_expression: Option<String>,
    #[serde(default = "default_true")]
    pub permissive: bool,
}

impl PolicyDefinition {
    pub fn table_ref(&self) -> TableRef {
        TableRef::new(&self.schema, &self.table)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtensionDefinition {
    pub name: String,
    pub schema: String,
    pub version: String,
}

/// Views are carried for completeness; they are not a comparison category.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ViewDefinition {
    pub schema: String,
    pub name: String,
    pub definition: String,
}

/// Common view over the six comparable object categories
pub trait SchemaObject: Clone + PartialEq + Serialize {
    const OBJECT_TYPE: ObjectType;

    /// Fully-qualified identity used to match objects across snapshots
    fn key(&self) -> String;
    fn schema_name(&self) -> &str;
    fn object_name(&self) -> &str;
    fn into_definition(self) -> ObjectDefinition;
}

impl SchemaObject for ExtensionDefinition {
    const OBJECT_TYPE: ObjectType = ObjectType::Extension;

    fn key(&self) -> String {
        self.name.clone()
    }
    fn schema_name(&self) -> &str {
        &self.schema
    }
    fn object_name(&self) -> &str {
        &self.name
    }
    fn into_definition(self) -> ObjectDefinition {
        ObjectDefinition::Extension(self)
    }
}

impl SchemaObject for TableDefinition {
    const OBJECT_TYPE: ObjectType = ObjectType::Table;

    fn key(&self) -> String {
        format!("{}.{}", self.schema, self.name)
    }
    fn schema_name(&self) -> &str {
        &self.schema
    }
    fn object_name(&self) -> &str {
        &self.name
    }
    fn into_definition(self) -> ObjectDefinition {
        ObjectDefinition::Table(self)
    }
}

impl SchemaObject for FunctionDefinition {
    const OBJECT_TYPE: ObjectType = ObjectType::Function;

    fn key(&self) -> String {
        format!("{}.{}({})", self.schema, self.name, self.identity_arguments())
    }
    fn schema_name(&self) -> &str {
        &self.schema
    }
    fn object_name(&self) -> &str {
        &self.name
    }
    fn into_definition(self) -> ObjectDefinition {
        ObjectDefinition::Function(self)
    }
}

impl SchemaObject for TriggerDefinition {
    const OBJECT_TYPE: ObjectType = ObjectType::Trigger;

    fn key(&self) -> String {
        format!("{}.{}.{}", self.schema, self.table, self.name)
    }
    fn schema_name(&self) -> &str {
        &self.schema
    }
    fn object_name(&self) -> &str {
        &self.name
    }
    fn into_definition(self) -> ObjectDefinition {
        ObjectDefinition::Trigger(self)
    }
}

impl SchemaObject for IndexDefinition {
    const OBJECT_TYPE: ObjectType = ObjectType::Index;

    fn key(&self) -> String {
        format!("{}.{}", self.schema, self.name)
    }
    fn schema_name(&self) -> &str {
        &self.schema
    }
    fn object_name(&self) -> &str {
        &self.name
    }
    fn into_definition(self) -> ObjectDefinition {
        ObjectDefinition::Index(self)
    }
}

impl SchemaObject for PolicyDefinition {
    const OBJECT_TYPE: ObjectType = ObjectType::Policy;

    fn key(&self) -> String {
        format!("{}.{}.{}", self.schema, self.table, self.name)
    }
    fn schema_name(&self) -> &str {
        &self.schema
    }
    fn object_name(&self) -> &str {
        &self.name
    }
    fn into_definition(self) -> ObjectDefinition {
        ObjectDefinition::Policy(self)
    }
}

/// Typed payload of a difference's `before` / `after`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ObjectDefinition {
    Extension(ExtensionDefinition),
    Table(TableDefinition),
    Function(FunctionDefinition),
    Trigger(TriggerDefinition),
    Index(IndexDefinition),
    Policy(PolicyDefinition),
}

impl ObjectDefinition {
    pub fn object_type(&self) -> ObjectType {
        match self {
            ObjectDefinition::Extension(_) => ObjectType::Extension,
            ObjectDefinition::Table(_) => ObjectType::Table,
            ObjectDefinition::Function(_) => ObjectType::Function,
            ObjectDefinition::Trigger(_) => ObjectType::Trigger,
            ObjectDefinition::Index(_) => ObjectType::Index,
            ObjectDefinition::Policy(_) => ObjectType::Policy,
        }
    }

    pub fn key(&self) -> String {
        match self {
            ObjectDefinition::Extension(o) => o.key(),
            ObjectDefinition::Table(o) => o.key(),
            ObjectDefinition::Function(o) => o.key(),
            ObjectDefinition::Trigger(o) => o.key(),
            ObjectDefinition::Index(o) => o.key(),
            ObjectDefinition::Policy(o) => o.key(),
        }
    }
}

/// Complete schema snapshot at a point in time
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemaDefinition {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment_id: Option<Uuid>,
    pub captured_at: DateTime<Utc>,
    #[serde(default)]
    pub extensions: Vec<ExtensionDefinition>,
    #[serde(default)]
    pub tables: Vec<TableDefinition>,
    #[serde(default)]
    pub views: Vec<ViewDefinition>,
    #[serde(default)]
    pub functions: Vec<FunctionDefinition>,
    #[serde(default)]
    pub triggers: Vec<TriggerDefinition>,
    #[serde(default)]
    pub indexes: Vec<IndexDefinition>,
    #[serde(default)]
    pub policies: Vec<PolicyDefinition>,
}

impl SchemaDefinition {
    pub fn empty() -> Self {
        Self {
            environment_id: None,
            captured_at: Utc::now(),
            extensions: Vec::new(),
            tables: Vec::new(),
            views: Vec::new(),
            functions: Vec::new(),
            triggers: Vec::new(),
            indexes: Vec::new(),
            policies: Vec::new(),
        }
    }

    pub fn table(&self, key: &str) -> Option<&TableDefinition> {
        self.tables.iter().find(|t| t.key() == key)
    }

    /// Copy with every category sorted by key, for order-independent comparison
    pub fn normalized(&self) -> SchemaDefinition {
        fn sorted<T: SchemaObject>(items: &[T]) -> Vec<T> {
            let mut items = items.to_vec();
            items.sort_by_key(|o| o.key());
            items
        }

        let mut tables = sorted(&self.tables);
        for table in &mut tables {
            table.constraints.sort_by(|a, b| a.name.cmp(&b.name));
        }
        let mut views = self.views.clone();
        views.sort_by(|a, b| (&a.schema, &a.name).cmp(&(&b.schema, &b.name)));

        SchemaDefinition {
            environment_id: None,
            captured_at: self.captured_at,
            extensions: sorted(&self.extensions),
            tables,
            views,
            functions: sorted(&self.functions),
            triggers: sorted(&self.triggers),
            indexes: sorted(&self.indexes),
            policies: sorted(&self.policies),
        }
    }

    /// Structural equality, ignoring capture metadata and declaration order
    pub fn structurally_equal(&self, other: &SchemaDefinition) -> bool {
        let a = self.normalized();
        let b = other.normalized();
        a.extensions == b.extensions
            && a.tables == b.tables
            && a.functions == b.functions
            && a.triggers == b.triggers
            && a.indexes == b.indexes
            && a.policies == b.policies
    }

    /// SHA-256 over the canonical (normalized, metadata-free) serialization
    pub fn checksum(&self) -> String {
        let normalized = self.normalized();
        let canonical = serde_json::json!({
            "extensions": normalized.extensions,
            "tables": normalized.tables,
            "views": normalized.views,
            "functions": normalized.functions,
            "triggers": normalized.triggers,
            "indexes": normalized.indexes,
            "policies": normalized.policies,
        });

        let mut hasher = Sha256::new();
        hasher.update(canonical.to_string().as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Keep only objects accepted by the predicate `(type, schema, key)`
    pub fn retain_scope<F>(&self, keep: F) -> SchemaDefinition
    where
        F: Fn(ObjectType, &str, &str) -> bool,
    {
        fn filter<T: SchemaObject>(items: &[T], keep: &dyn Fn(ObjectType, &str, &str) -> bool) -> Vec<T> {
            items
                .iter()
                .filter(|o| keep(T::OBJECT_TYPE, o.schema_name(), &o.key()))
                .cloned()
                .collect()
        }

        SchemaDefinition {
            environment_id: self.environment_id,
            captured_at: self.captured_at,
            extensions: filter(&self.extensions, &keep),
            tables: filter(&self.tables, &keep),
            views: Vec::new(),
            functions: filter(&self.functions, &keep),
            triggers: filter(&self.triggers, &keep),
            indexes: filter(&self.indexes, &keep),
            policies: filter(&self.policies, &keep),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::fixtures;

    #[test]
    fn test_checksum_ignores_declaration_order() {
        let schema = fixtures::shop_schema();
        let mut reversed = schema.clone();
        reversed.tables.reverse();
        reversed.indexes.reverse();

        assert_eq!(schema.checksum(), reversed.checksum());
        assert!(schema.structurally_equal(&reversed));
    }

    #[test]
    fn test_checksum_changes_with_structure() {
        let schema = fixtures::shop_schema();
        let mut altered = schema.clone();
        altered.tables[0].columns[0].data_type = "bigint".to_string();

        assert_ne!(schema.checksum(), altered.checksum());
    }

    #[test]
    fn test_function_key_includes_identity_arguments() {
        let function = fixtures::function("public", "calc_tax", &["numeric", "text"]);
        assert_eq!(function.key(), "public.calc_tax(numeric,text)");
    }

    #[test]
    fn test_sequence_name_from_default() {
        let column = ColumnDefinition {
            name: "id".to_string(),
            data_type: "integer".to_string(),
            nullable: false,
            default_value: Some("nextval('orders_id_seq'::regclass)".to_string()),
            ordinal_position: 1,
        };
        assert_eq!(column.sequence_name().as_deref(), Some("orders_id_seq"));
    }

    #[test]
    fn test_quote_ident_escapes_quotes() {
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
        assert_eq!(TableRef::parse("orders").key(), "public.orders");
    }
}
