//! Schema collection
//!
//! Produces a `SchemaDefinition` snapshot of an environment. Collection is
//! read-only regardless of environment type: the PostgreSQL collector runs
//! every catalog query inside a `READ ONLY` transaction.

use super::model::*;
use crate::driver::PostgresProvider;
use crate::environment::Environment;
use crate::error::AppError;
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CollectOptions {
    pub include_views: bool,
    pub include_functions: bool,
    pub include_triggers: bool,
    pub include_policies: bool,
    pub include_indexes: bool,
    pub include_extensions: bool,
    /// Schemas to collect; empty means every non-system schema
    pub schemas: Vec<String>,
    /// Object names or keys to skip; a trailing `*` matches a prefix
    pub exclude: Vec<String>,
}

impl Default for CollectOptions {
    fn default() -> Self {
        Self {
            include_views: true,
            include_functions: true,
            include_triggers: true,
            include_policies: true,
            include_indexes: true,
            include_extensions: true,
            schemas: Vec::new(),
            exclude: Vec::new(),
        }
    }
}

impl CollectOptions {
    fn includes_type(&self, object_type: ObjectType) -> bool {
        match object_type {
            ObjectType::Extension => self.include_extensions,
            ObjectType::Table => true,
            ObjectType::Function => self.include_functions,
            ObjectType::Trigger => self.include_triggers,
            ObjectType::Index => self.include_indexes,
            ObjectType::Policy => self.include_policies,
        }
    }

    fn includes_schema(&self, schema: &str) -> bool {
        self.schemas.is_empty() || self.schemas.iter().any(|s| s == schema)
    }

    fn excluded(&self, key: &str) -> bool {
        let name = key.rsplit('.').next().unwrap_or(key);
        self.exclude.iter().any(|pattern| match pattern.strip_suffix('*') {
            Some(prefix) => key.starts_with(prefix) || name.starts_with(prefix),
            None => key == pattern || name == pattern,
        })
    }

    /// Whether an object belongs to the collection scope
    pub fn includes(&self, object_type: ObjectType, schema: &str, key: &str) -> bool {
        if !self.includes_type(object_type) || self.excluded(key) {
            return false;
        }
        // Extensions are database-wide; their install schema does not scope them
        object_type == ObjectType::Extension || self.includes_schema(schema)
    }

    /// Narrow a full snapshot to this scope
    pub fn apply(&self, schema: &SchemaDefinition) -> SchemaDefinition {
        let mut scoped = schema.retain_scope(|t, s, k| self.includes(t, s, k));
        if self.include_views {
            scoped.views = schema
                .views
                .iter()
                .filter(|v| self.includes_schema(&v.schema) && !self.excluded(&format!("{}.{}", v.schema, v.name)))
                .cloned()
                .collect();
        }
        scoped
    }
}

#[async_trait]
pub trait SchemaCollector: Send + Sync {
    async fn collect(&self, env: &Environment, options: &CollectOptions) -> Result<SchemaDefinition, AppError>;
}

const USER_SCHEMAS: &str = "n.nspname NOT IN ('pg_catalog', 'information_schema') \
     AND n.nspname NOT LIKE 'pg_toast%' AND n.nspname NOT LIKE 'pg_temp%'";

/// Catalog-based collector for PostgreSQL
pub struct PostgresCollector {
    provider: Arc<PostgresProvider>,
}

impl PostgresCollector {
    pub fn new(provider: Arc<PostgresProvider>) -> Self {
        Self { provider }
    }

    async fn get_tables(tx: &deadpool_postgres::Transaction<'_>) -> Result<Vec<TableDefinition>, AppError> {
        let table_query = format!(
            r#"
            SELECT n.nspname::text AS schema, c.relname::text AS name,
                   obj_description(c.oid, 'pg_class') AS comment,
                   c.relrowsecurity AS rls
            FROM pg_class c
            JOIN pg_namespace n ON n.oid = c.relnamespace
            WHERE c.relkind IN ('r', 'p') AND {}
              AND NOT EXISTS (SELECT 1 FROM pg_depend d WHERE d.objid = c.oid AND d.deptype = 'e')
            ORDER BY 1, 2
            "#,
            USER_SCHEMAS
        );
        let mut columns = Self::get_columns(tx).await?;
        let mut constraints = Self::get_constraints(tx).await?;

        let rows = tx.query(table_query.as_str(), &[]).await?;
        Ok(rows
            .iter()
            .map(|row| {
                let schema: String = row.get("schema");
                let name: String = row.get("name");
                let key = (schema.clone(), name.clone());
                TableDefinition {
                    columns: columns.remove(&key).unwrap_or_default(),
                    constraints: constraints.remove(&key).unwrap_or_default(),
                    comment: row.get("comment"),
                    row_level_security: row.get("rls"),
                    schema,
                    name,
                }
            })
            .collect())
    }

    async fn get_columns(
        tx: &deadpool_postgres::Transaction<'_>,
    ) -> Result<HashMap<(String, String), Vec<ColumnDefinition>>, AppError> {
        let query = format!(
            r#"
            SELECT n.nspname::text AS schema, c.relname::text AS table_name,
                   a.attname::text AS name,
                   format_type(a.atttypid, a.atttypmod) AS data_type,
                   NOT a.attnotnull AS nullable,
                   pg_get_expr(d.adbin, d.adrelid) AS default_value,
                   a.attnum::int4 AS position
            FROM pg_attribute a
            JOIN pg_class c ON c.oid = a.attrelid
            JOIN pg_namespace n ON n.oid = c.relnamespace
            LEFT JOIN pg_attrdef d ON d.adrelid = a.attrelid AND d.adnum = a.attnum
            WHERE c.relkind IN ('r', 'p') AND a.attnum > 0 AND NOT a.attisdropped AND {}
            ORDER BY 1, 2, a.attnum
            "#,
            USER_SCHEMAS
        );

        let mut columns: HashMap<(String, String), Vec<ColumnDefinition>> = HashMap::new();
        for row in tx.query(query.as_str(), &[]).await? {
            columns
                .entry((row.get("schema"), row.get("table_name")))
                .or_default()
                .push(ColumnDefinition {
                    name: row.get("name"),
                    data_type: row.get("data_type"),
                    nullable: row.get("nullable"),
                    default_value: row.get("default_value"),
                    ordinal_position: row.get("position"),
                });
        }
        Ok(columns)
    }

    async fn get_constraints(
        tx: &deadpool_postgres::Transaction<'_>,
    ) -> Result<HashMap<(String, String), Vec<ConstraintDefinition>>, AppError> {
        let query = format!(
            r#"
            SELECT n.nspname::text AS schema, c.relname::text AS table_name,
                   con.conname::text AS name, con.contype::text AS kind,
                   ARRAY(
                       SELECT a.attname::text
                       FROM unnest(con.conkey) WITH ORDINALITY AS k(attnum, ord)
                       JOIN pg_attribute a ON a.attrelid = con.conrelid AND a.attnum = k.attnum
                       ORDER BY k.ord
                   ) AS columns,
                   rn.nspname::text AS ref_schema, rc.relname::text AS ref_table,
                   pg_get_constraintdef(con.oid) AS definition
            FROM pg_constraint con
            JOIN pg_class c ON c.oid = con.conrelid
            JOIN pg_namespace n ON n.oid = c.relnamespace
            LEFT JOIN pg_class rc ON rc.oid = con.confrelid
            LEFT JOIN pg_namespace rn ON rn.oid = rc.relnamespace
            WHERE con.contype IN ('p', 'f', 'u', 'c', 'x') AND {}
            ORDER BY 1, 2, 3
            "#,
            USER_SCHEMAS
        );

        let mut constraints: HashMap<(String, String), Vec<ConstraintDefinition>> = HashMap::new();
        for row in tx.query(query.as_str(), &[]).await? {
            let kind = match row.get::<_, String>("kind").as_str() {
                "p" => ConstraintKind::PrimaryKey,
                "f" => ConstraintKind::ForeignKey,
                "u" => ConstraintKind::Unique,
                "c" => ConstraintKind::Check,
                _ => ConstraintKind::Exclusion,
            };
            let references = match (
                row.get::<_, Option<String>>("ref_schema"),
                row.get::<_, Option<String>>("ref_table"),
            ) {
                (Some(schema), Some(table)) => Some(TableRef::new(schema, table)),
                _ => None,
            };
            constraints
                .entry((row.get("schema"), row.get("table_name")))
                .or_default()
                .push(ConstraintDefinition {
                    name: row.get("name"),
                    kind,
                    columns: row.get("columns"),
                    references,
                    definition: row.get("definition"),
                });
        }
        Ok(constraints)
    }

    async fn get_functions(tx: &deadpool_postgres::Transaction<'_>) -> Result<Vec<FunctionDefinition>, AppError> {
        let query = format!(
            r#"
            SELECT n.nspname::text AS schema, p.proname::text AS name,
                   pg_get_function_result(p.oid) AS return_type,
                   p.prosrc AS body, l.lanname::text AS language,
                   p.provolatile::text AS volatility, p.prosecdef AS security_definer,
                   COALESCE(p.proargnames, ARRAY[]::text[]) AS arg_names,
                   COALESCE(p.proargmodes::text[], ARRAY[]::text[]) AS arg_modes,
                   ARRAY(
                       SELECT format_type(u.t, NULL)
                       FROM unnest(COALESCE(p.proallargtypes, p.proargtypes::oid[])) WITH ORDINALITY AS u(t, ord)
                       ORDER BY u.ord
                   ) AS arg_types
            FROM pg_proc p
            JOIN pg_namespace n ON n.oid = p.pronamespace
            JOIN pg_language l ON l.oid = p.prolang
            WHERE p.prokind = 'f' AND l.lanname NOT IN ('internal', 'c') AND {}
              AND NOT EXISTS (SELECT 1 FROM pg_depend d WHERE d.objid = p.oid AND d.deptype = 'e')
            ORDER BY 1, 2
            "#,
            USER_SCHEMAS
        );

        let rows = tx.query(query.as_str(), &[]).await?;
        Ok(rows
            .iter()
            .map(|row| {
                let names: Vec<String> = row.get("arg_names");
                let modes: Vec<String> = row.get("arg_modes");
                let types: Vec<String> = row.get("arg_types");

                let parameters = types
                    .into_iter()
                    .enumerate()
                    .filter_map(|(i, data_type)| {
                        let mode = match modes.get(i).map(String::as_str) {
                            None | Some("i") => ParameterMode::In,
                            Some("o") => ParameterMode::Out,
                            Some("b") => ParameterMode::InOut,
                            Some("v") => ParameterMode::Variadic,
                            // RETURNS TABLE columns live in the return type
                            _ => return None,
                        };
                        Some(FunctionParameter {
                            name: names.get(i).filter(|n| !n.is_empty()).cloned(),
                            data_type,
                            mode,
                        })
                    })
                    .collect();

                FunctionDefinition {
                    schema: row.get("schema"),
                    name: row.get("name"),
                    parameters,
                    return_type: row.get("return_type"),
                    body: row.get("body"),
                    language: row.get("language"),
                    volatility: match row.get::<_, String>("volatility").as_str() {
                        "i" => Volatility::Immutable,
                        "s" => Volatility::Stable,
                        _ => Volatility::Volatile,
                    },
                    security_definer: row.get("security_definer"),
                }
            })
            .collect())
    }

    async fn get_triggers(tx: &deadpool_postgres::Transaction<'_>) -> Result<Vec<TriggerDefinition>, AppError> {
        let query = format!(
            r#"
            SELECT n.nspname::text AS schema, t.tgname::text AS name, c.relname::text AS table_name,
                   t.tgtype::int4 AS tgtype,
                   fn.nspname::text AS function_schema, p.proname::text AS function_name,
                   pg_get_triggerdef(t.oid) AS definition
            FROM pg_trigger t
            JOIN pg_class c ON c.oid = t.tgrelid
            JOIN pg_namespace n ON n.oid = c.relnamespace
            JOIN pg_proc p ON p.oid = t.tgfoid
            JOIN pg_namespace fn ON fn.oid = p.pronamespace
            WHERE NOT t.tgisinternal AND {}
            ORDER BY 1, 3, 2
            "#,
            USER_SCHEMAS
        );

        let rows = tx.query(query.as_str(), &[]).await?;
        Ok(rows
            .iter()
            .map(|row| {
                let tgtype: i32 = row.get("tgtype");
                let definition: String = row.get("definition");
                let (timing, events) = decode_trigger_type(tgtype);
                TriggerDefinition {
                    schema: row.get("schema"),
                    name: row.get("name"),
                    table: row.get("table_name"),
                    timing,
                    events,
                    for_each_row: tgtype & 1 != 0,
                    function_schema: row.get("function_schema"),
                    function_name: row.get("function_name"),
                    condition: trigger_condition(&definition),
                }
            })
            .collect())
    }

    async fn get_indexes(tx: &deadpool_postgres::Transaction<'_>) -> Result<Vec<IndexDefinition>, AppError> {
        let query = format!(
            r#"
            SELECT n.nspname::text AS schema, ic.relname::text AS name, tc.relname::text AS table_name,
                   i.indisunique AS is_unique, am.amname::text AS index_type,
                   ARRAY(
                       SELECT pg_get_indexdef(i.indexrelid, k, true)
                       FROM generate_series(1, i.indnkeyatts::int) AS k
                   ) AS columns,
                   pg_get_expr(i.indpred, i.indrelid) AS predicate
            FROM pg_index i
            JOIN pg_class ic ON ic.oid = i.indexrelid
            JOIN pg_class tc ON tc.oid = i.indrelid
            JOIN pg_namespace n ON n.oid = ic.relnamespace
            JOIN pg_am am ON am.oid = ic.relam
            WHERE {}
              AND NOT EXISTS (SELECT 1 FROM pg_constraint con WHERE con.conindid = i.indexrelid)
            ORDER BY 1, 2
            "#,
            USER_SCHEMAS
        );

        let rows = tx.query(query.as_str(), &[]).await?;
        Ok(rows
            .iter()
            .map(|row| IndexDefinition {
                schema: row.get("schema"),
                name: row.get("name"),
                table: row.get("table_name"),
                columns: row
                    .get::<_, Vec<String>>("columns")
                    .iter()
                    .map(|c| unquote_ident(c))
                    .collect(),
                unique: row.get("is_unique"),
                index_type: row.get("index_type"),
                predicate: row.get("predicate"),
            })
            .collect())
    }

    async fn get_policies(tx: &deadpool_postgres::Transaction<'_>) -> Result<Vec<PolicyDefinition>, AppError> {
        let rows = tx
            .query(
                r#"
                SELECT schemaname::text AS schema, tablename::text AS table_name,
                       policyname::text AS name, permissive, roles::text[] AS roles,
                       cmd, qual, with_check
                FROM pg_policies
                ORDER BY 1, 2, 3
                "#,
                &[],
            )
            .await?;

        Ok(rows
            .iter()
            .map(|row| PolicyDefinition {
                schema: row.get("schema"),
                table: row.get("table_name"),
                name: row.get("name"),
                command: match row.get::<_, String>("cmd").to_uppercase().as_str() {
                    "SELECT" => PolicyCommand::Select,
                    "INSERT" => PolicyCommand::Insert,
                    "UPDATE" => PolicyCommand::Update,
                    "DELETE" => PolicyCommand::Delete,
                    _ => PolicyCommand::All,
                },
                roles: row.get("roles"),
                using_expression: row.get("qual"),
                check_expression: row.get("with_check"),
                permissive: row.get::<_, String>("permissive").eq_ignore_ascii_case("PERMISSIVE"),
            })
            .collect())
    }

    async fn get_extensions(tx: &deadpool_postgres::Transaction<'_>) -> Result<Vec<ExtensionDefinition>, AppError> {
        let rows = tx
            .query(
                r#"
                SELECT e.extname::text AS name, n.nspname::text AS schema, e.extversion AS version
                FROM pg_extension e
                JOIN pg_namespace n ON n.oid = e.extnamespace
                WHERE e.extname <> 'plpgsql'
                ORDER BY 1
                "#,
                &[],
            )
            .await?;

        Ok(rows
            .iter()
            .map(|row| ExtensionDefinition {
                name: row.get("name"),
                schema: row.get("schema"),
                version: row.get("version"),
            })
            .collect())
    }

    async fn get_views(tx: &deadpool_postgres::Transaction<'_>) -> Result<Vec<ViewDefinition>, AppError> {
        let rows = tx
            .query(
                r#"
                SELECT schemaname::text AS schema, viewname::text AS name, definition
                FROM pg_views
                WHERE schemaname NOT IN ('pg_catalog', 'information_schema')
                ORDER BY 1, 2
                "#,
                &[],
            )
            .await?;

        Ok(rows
            .iter()
            .map(|row| ViewDefinition {
                schema: row.get("schema"),
                name: row.get("name"),
                definition: row.get("definition"),
            })
            .collect())
    }
}

#[async_trait]
impl SchemaCollector for PostgresCollector {
    async fn collect(&self, env: &Environment, options: &CollectOptions) -> Result<SchemaDefinition, AppError> {
        let pool = self.provider.pool(env).await?;
        let mut client = pool.get().await?;
        let tx = client.build_transaction().read_only(true).start().await?;

        let mut schema = SchemaDefinition::empty();
        schema.environment_id = Some(env.id);
        schema.captured_at = Utc::now();
        schema.tables = Self::get_tables(&tx).await?;
        if options.include_functions {
            schema.functions = Self::get_functions(&tx).await?;
        }
        if options.include_triggers {
            schema.triggers = Self::get_triggers(&tx).await?;
        }
        if options.include_indexes {
            schema.indexes = Self::get_indexes(&tx).await?;
        }
        if options.include_policies {
            schema.policies = Self::get_policies(&tx).await?;
        }
        if options.include_extensions {
            schema.extensions = Self::get_extensions(&tx).await?;
        }
        if options.include_views {
            schema.views = Self::get_views(&tx).await?;
        }
        tx.commit().await?;

        let scoped = options.apply(&schema);
        debug!(
            "Collected schema of {}: {} tables, {} functions, {} triggers, {} indexes, {} policies, {} extensions",
            env.name,
            scoped.tables.len(),
            scoped.functions.len(),
            scoped.triggers.len(),
            scoped.indexes.len(),
            scoped.policies.len(),
            scoped.extensions.len()
        );
        Ok(scoped)
    }
}

/// Decode `pg_trigger.tgtype` bits into timing and events
fn decode_trigger_type(tgtype: i32) -> (TriggerTiming, Vec<TriggerEvent>) {
    let timing = if tgtype & 64 != 0 {
        TriggerTiming::InsteadOf
    } else if tgtype & 2 != 0 {
        TriggerTiming::Before
    } else {
        TriggerTiming::After
    };

    let mut events = Vec::new();
    if tgtype & 4 != 0 {
        events.push(TriggerEvent::Insert);
    }
    if tgtype & 16 != 0 {
        events.push(TriggerEvent::Update);
    }
    if tgtype & 8 != 0 {
        events.push(TriggerEvent::Delete);
    }
    if tgtype & 32 != 0 {
        events.push(TriggerEvent::Truncate);
    }
    (timing, events)
}

/// Extract the `WHEN (...)` condition from a rendered trigger definition
fn trigger_condition(definition: &str) -> Option<String> {
    let start = definition.find(" WHEN (")? + " WHEN (".len();
    let end = definition.rfind(") EXECUTE ")?;
    (end > start).then(|| definition[start..end].to_string())
}

fn unquote_ident(ident: &str) -> String {
    match ident.strip_prefix('"').and_then(|s| s.strip_suffix('"')) {
        Some(inner) => inner.replace("\"\"", "\""),
        None => ident.to_string(),
    }
}
