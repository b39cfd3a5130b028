//! Test support: schema fixtures plus in-memory stand-ins for the database
//! driver and the schema collector.

pub mod fixtures {
    use crate::schema::model::*;

    fn column(name: &str, data_type: &str, nullable: bool, default: Option<&str>, position: i32) -> ColumnDefinition {
        ColumnDefinition {
            name: name.to_string(),
            data_type: data_type.to_string(),
            nullable,
            default_value: default.map(str::to_string),
            ordinal_position: position,
        }
    }

    fn primary_key(table: &str) -> ConstraintDefinition {
        ConstraintDefinition {
            name: format!("{}_pkey", table),
            kind: ConstraintKind::PrimaryKey,
            columns: vec!["id".to_string()],
            references: None,
            definition: "PRIMARY KEY (id)".to_string(),
        }
    }

    pub fn customers_table() -> TableDefinition {
        TableDefinition {
            schema: "public".to_string(),
            name: "customers".to_string(),
            columns: vec![
                column("id", "integer", false, Some("nextval('customers_id_seq'::regclass)"), 1),
                column("email", "text", false, None, 2),
                column("name", "text", true, None, 3),
            ],
            constraints: vec![primary_key("customers")],
            comment: None,
            row_level_security: false,
        }
    }

    pub fn orders_table() -> TableDefinition {
        TableDefinition {
            schema: "public".to_string(),
            name: "orders".to_string(),
            columns: vec![
                column("id", "integer", false, Some("nextval('orders_id_seq'::regclass)"), 1),
                column("amount", "numeric(10,2)", false, None, 2),
                column("customer_id", "integer", false, None, 3),
                column("note", "text", true, None, 4),
                column("updated_at", "timestamp with time zone", true, Some("now()"), 5),
            ],
            constraints: vec![
                primary_key("orders"),
                ConstraintDefinition {
                    name: "orders_customer_id_fkey".to_string(),
                    kind: ConstraintKind::ForeignKey,
                    columns: vec!["customer_id".to_string()],
                    references: Some(TableRef::new("public", "customers")),
                    definition: "FOREIGN KEY (customer_id) REFERENCES public.customers(id)".to_string(),
                },
            ],
            comment: Some("Customer orders".to_string()),
            row_level_security: true,
        }
    }

    pub fn function(schema: &str, name: &str, arg_types: &[&str]) -> FunctionDefinition {
        FunctionDefinition {
            schema: schema.to_string(),
            name: name.to_string(),
            parameters: arg_types
                .iter()
                .enumerate()
                .map(|(i, t)| FunctionParameter {
                    name: Some(format!("arg{}", i + 1)),
                    data_type: t.to_string(),
                    mode: ParameterMode::In,
                })
                .collect(),
            return_type: "numeric".to_string(),
            body: "SELECT $1 * 0.2".to_string(),
            language: "sql".to_string(),
            volatility: Volatility::Immutable,
            security_definer: false,
        }
    }

    pub fn touch_function() -> FunctionDefinition {
        FunctionDefinition {
            schema: "public".to_string(),
            name: "touch_updated_at".to_string(),
            parameters: Vec::new(),
            return_type: "trigger".to_string(),
            body: "BEGIN NEW.updated_at := now(); RETURN NEW; END;".to_string(),
            language: "plpgsql".to_string(),
            volatility: Volatility::Volatile,
            security_definer: false,
        }
    }

    /// Two tables, two functions, a trigger, two indexes, a policy and an extension
    pub fn shop_schema() -> SchemaDefinition {
        let mut schema = SchemaDefinition::empty();
        schema.extensions.push(ExtensionDefinition {
            name: "pgcrypto".to_string(),
            schema: "public".to_string(),
            version: "1.3".to_string(),
        });
        schema.tables.push(customers_table());
        schema.tables.push(orders_table());
        schema.functions.push(touch_function());
        schema.functions.push(function("public", "calc_tax", &["numeric"]));
        schema.triggers.push(TriggerDefinition {
            schema: "public".to_string(),
            name: "orders_touch".to_string(),
            table: "orders".to_string(),
            timing: TriggerTiming::Before,
            events: vec![TriggerEvent::Update],
            for_each_row: true,
            function_schema: "public".to_string(),
            function_name: "touch_updated_at".to_string(),
            condition: None,
        });
        schema.indexes.push(IndexDefinition {
            schema: "public".to_string(),
            name: "orders_customer_idx".to_string(),
            table: "orders".to_string(),
            columns: vec!["customer_id".to_string()],
            unique: false,
            index_type: "btree".to_string(),
            predicate: None,
        });
        schema.indexes.push(IndexDefinition {
            schema: "public".to_string(),
            name: "customers_email_key".to_string(),
            table: "customers".to_string(),
            columns: vec!["email".to_string()],
            unique: true,
            index_type: "btree".to_string(),
            predicate: None,
        });
        schema.policies.push(PolicyDefinition {
            schema: "public".to_string(),
            table: "orders".to_string(),
            name: "orders_owner".to_string(),
            command: PolicyCommand::Select,
            roles: vec!["app_user".to_string()],
            using_expression: Some("(customer_id = current_setting('app.customer')::integer)".to_string()),
            check_expression: None,
            permissive: true,
        });
        schema
    }

    /// Keep the objects whose position (across all categories) has its bit set in `mask`
    pub fn subset(schema: &SchemaDefinition, mask: u32) -> SchemaDefinition {
        let mut bit = 0u32;
        let mut keep = || {
            let selected = mask & (1 << bit) != 0;
            bit += 1;
            selected
        };

        let mut out = SchemaDefinition::empty();
        out.captured_at = schema.captured_at;
        out.extensions = schema.extensions.iter().filter(|_| keep()).cloned().collect();
        out.tables = schema.tables.iter().filter(|_| keep()).cloned().collect();
        out.functions = schema.functions.iter().filter(|_| keep()).cloned().collect();
        out.triggers = schema.triggers.iter().filter(|_| keep()).cloned().collect();
        out.indexes = schema.indexes.iter().filter(|_| keep()).cloned().collect();
        out.policies = schema.policies.iter().filter(|_| keep()).cloned().collect();
        out
    }
}

pub mod rows {
    use crate::driver::Row;
    use serde_json::json;

    fn row(value: serde_json::Value) -> Row {
        match value {
            serde_json::Value::Object(map) => map,
            _ => Row::new(),
        }
    }

    /// Customers with ids `1..=count`
    pub fn customer_rows(count: u64) -> Vec<Row> {
        (1..=count)
            .map(|i| {
                row(json!({
                    "id": i,
                    "email": format!("customer{}@example.com", i),
                    "name": format!("Customer {}", i),
                }))
            })
            .collect()
    }

    /// Orders with ids `1..=count`, spread over the first `customers` customers
    pub fn order_rows(count: u64, customers: u64) -> Vec<Row> {
        (1..=count)
            .map(|i| {
                row(json!({
                    "id": i,
                    "amount": 10.0 * i as f64,
                    "customer_id": (i - 1) % customers.max(1) + 1,
                    "note": null,
                    "updated_at": null,
                }))
            })
            .collect()
    }
}

use crate::backup::BackupManager;
use crate::clone::CloneOrchestrator;
use crate::state::AppState;
use crate::config::CloneConfig;
use crate::driver::{ConflictPolicy, DriverProvider, EnvironmentConnector, EnvironmentDriver, Row, RowWindow};
use crate::environment::{Environment, EnvironmentType};
use crate::error::AppError;
use crate::locks::EnvironmentLocks;
use crate::safety::ProductionSafetyGuard;
use crate::schema::model::SchemaObject;
use crate::schema::{
    apply_differences, CollectOptions, DiffAction, ObjectType, SchemaCollector, SchemaDefinition, SchemaDifference,
    TableRef,
};
use crate::store::{FileStateStore, StateStore};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

struct MemoryState {
    schema: SchemaDefinition,
    rows: BTreeMap<String, Vec<Row>>,
    executed: Vec<String>,
    mutations: usize,
    row_reads: usize,
    fail_inserts_into: Option<String>,
    fail_statements_containing: Option<String>,
    delay: Option<Duration>,
}

/// One in-memory database: a schema snapshot plus rows per table key
pub struct MemoryDriver {
    state: Mutex<MemoryState>,
}

impl MemoryDriver {
    pub fn new(schema: SchemaDefinition) -> Self {
        Self {
            state: Mutex::new(MemoryState {
                schema,
                rows: BTreeMap::new(),
                executed: Vec::new(),
                mutations: 0,
                row_reads: 0,
                fail_inserts_into: None,
                fail_statements_containing: None,
                delay: None,
            }),
        }
    }

    pub fn schema(&self) -> SchemaDefinition {
        self.state.lock().schema.clone()
    }

    pub fn mutate_schema(&self, mutate: impl FnOnce(&mut SchemaDefinition)) {
        mutate(&mut self.state.lock().schema);
    }

    pub fn set_rows(&self, table: &str, rows: Vec<Row>) {
        self.state.lock().rows.insert(table.to_string(), rows);
    }

    pub fn rows(&self, table: &str) -> Vec<Row> {
        self.state.lock().rows.get(table).cloned().unwrap_or_default()
    }

    /// Statements run so far, in order
    pub fn executed(&self) -> Vec<String> {
        self.state.lock().executed.clone()
    }

    pub fn mutation_count(&self) -> usize {
        self.state.lock().mutations
    }

    /// Number of `fetch_rows` calls served
    pub fn row_reads(&self) -> usize {
        self.state.lock().row_reads
    }

    pub fn set_delay(&self, delay: Duration) {
        self.state.lock().delay = Some(delay);
    }

    pub fn fail_inserts_into(&self, table: &str) {
        self.state.lock().fail_inserts_into = Some(table.to_string());
    }

    pub fn fail_statements_containing(&self, text: &str) {
        self.state.lock().fail_statements_containing = Some(text.to_string());
    }

    async fn pause(&self) {
        let delay = self.state.lock().delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }

    fn check_statement(state: &MemoryState, sql: &str) -> Result<(), AppError> {
        match &state.fail_statements_containing {
            Some(text) if sql.contains(text.as_str()) => {
                Err(AppError::OperationFailed(format!("injected failure running: {}", sql)))
            }
            _ => Ok(()),
        }
    }

    fn require_table(state: &MemoryState, table: &TableRef) -> Result<Vec<String>, AppError> {
        state
            .schema
            .table(&table.key())
            .map(|t| t.primary_key_columns())
            .ok_or_else(|| AppError::OperationFailed(format!("relation {} does not exist", table.quoted())))
    }
}

fn same_key(a: &Row, b: &Row, columns: &[String]) -> bool {
    !columns.is_empty() && columns.iter().all(|c| a.get(c) == b.get(c))
}

/// Understands `col = value` and `col IN (a, b)`
fn matches_predicate(row: &Row, predicate: &str) -> bool {
    let (column, values): (&str, Vec<&str>) = if let Some((column, list)) = predicate.split_once(" IN ") {
        let list = list.trim().trim_start_matches('(').trim_end_matches(')');
        (column, list.split(',').map(str::trim).collect())
    } else if let Some((column, value)) = predicate.split_once('=') {
        (column, vec![value.trim()])
    } else {
        return true;
    };

    let actual = match row.get(column.trim().trim_matches('"')) {
        Some(Value::String(s)) => s.clone(),
        Some(value) => value.to_string(),
        None => return false,
    };
    values.iter().any(|v| v.trim_matches('\'') == actual)
}

#[async_trait]
impl EnvironmentDriver for MemoryDriver {
    async fn execute(&self, sql: &str) -> Result<(), AppError> {
        self.pause().await;
        let mut state = self.state.lock();
        Self::check_statement(&state, sql)?;
        state.executed.push(sql.to_string());
        state.mutations += 1;
        Ok(())
    }

    async fn fetch_rows(&self, table: &TableRef, window: &RowWindow) -> Result<Vec<Row>, AppError> {
        let mut state = self.state.lock();
        Self::require_table(&state, table)?;
        state.row_reads += 1;

        let limit = if window.limit == 0 { usize::MAX } else { window.limit as usize };
        Ok(state
            .rows
            .get(&table.key())
            .map(|rows| {
                rows.iter()
                    .filter(|r| window.predicate.as_deref().map_or(true, |p| matches_predicate(r, p)))
                    .skip(window.offset as usize)
                    .take(limit)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn insert_rows(&self, table: &TableRef, rows: &[Row], policy: ConflictPolicy) -> Result<u64, AppError> {
        self.pause().await;
        let mut state = self.state.lock();
        if state.fail_inserts_into.as_deref() == Some(table.key().as_str()) {
            return Err(AppError::OperationFailed(format!(
                "injected failure inserting into {}",
                table.key()
            )));
        }
        let key_columns = Self::require_table(&state, table)?;
        state.mutations += 1;

        let stored = state.rows.entry(table.key()).or_default();
        let mut inserted = 0;
        for row in rows {
            if stored.iter().any(|existing| same_key(existing, row, &key_columns)) {
                match policy {
                    ConflictPolicy::DoNothing => continue,
                    ConflictPolicy::Error => {
                        return Err(AppError::OperationFailed(format!(
                            "duplicate key value in {}",
                            table.key()
                        )))
                    }
                }
            }
            stored.push(row.clone());
            inserted += 1;
        }
        Ok(inserted)
    }

    async fn update_rows(&self, table: &TableRef, key_columns: &[String], rows: &[Row]) -> Result<u64, AppError> {
        let mut state = self.state.lock();
        Self::require_table(&state, table)?;
        state.mutations += 1;

        let stored = state.rows.entry(table.key()).or_default();
        let mut updated = 0;
        for row in rows {
            for existing in stored.iter_mut().filter(|r| same_key(r, row, key_columns)) {
                for (column, value) in row {
                    existing.insert(column.clone(), value.clone());
                }
                updated += 1;
            }
        }
        Ok(updated)
    }

    async fn truncate(&self, tables: &[TableRef]) -> Result<(), AppError> {
        let mut state = self.state.lock();
        for table in tables {
            Self::require_table(&state, table)?;
        }

        // Children-first, like the row deletes a real server would need
        let mut remaining = state.rows.clone();
        for table in tables.iter().rev() {
            let parent = table.key();
            remaining.remove(&parent);
            let blocked = state
                .schema
                .tables
                .iter()
                .filter(|t| t.referenced_tables().contains(&parent))
                .find(|t| remaining.get(&t.key()).map_or(false, |rows| !rows.is_empty()));
            if let Some(child) = blocked {
                return Err(AppError::OperationFailed(format!(
                    "cannot empty {}: rows in {} still reference it",
                    parent,
                    child.key()
                )));
            }
        }
        state.rows = remaining;
        state.mutations += 1;
        Ok(())
    }

    async fn count_rows(&self, table: &TableRef) -> Result<u64, AppError> {
        let state = self.state.lock();
        Self::require_table(&state, table)?;
        Ok(state.rows.get(&table.key()).map_or(0, |rows| rows.len() as u64))
    }

    async fn apply_difference(&self, difference: &SchemaDifference, sql: &str) -> Result<(), AppError> {
        self.pause().await;
        let mut state = self.state.lock();
        Self::check_statement(&state, sql)?;

        state.schema = apply_differences(&state.schema, std::slice::from_ref(difference))?;
        if difference.object_type == ObjectType::Table && difference.action == DiffAction::Drop {
            state.rows.remove(&difference.key);
        }
        state.executed.push(sql.to_string());
        state.mutations += 1;
        Ok(())
    }
}

/// Several in-memory databases keyed by environment id. Serves as both the
/// driver provider and the schema collector.
#[derive(Default)]
pub struct MemoryCluster {
    databases: Mutex<HashMap<Uuid, Arc<MemoryDriver>>>,
    opens: Mutex<HashMap<Uuid, usize>>,
    collects: Mutex<HashMap<Uuid, usize>>,
}

impl MemoryCluster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn install(&self, env: &Environment, schema: SchemaDefinition) -> Arc<MemoryDriver> {
        let db = Arc::new(MemoryDriver::new(schema));
        self.databases.lock().insert(env.id, db.clone());
        db
    }

    pub fn database(&self, environment_id: Uuid) -> Option<Arc<MemoryDriver>> {
        self.databases.lock().get(&environment_id).cloned()
    }

    pub fn open_count(&self, environment_id: Uuid) -> usize {
        self.opens.lock().get(&environment_id).copied().unwrap_or(0)
    }

    pub fn collect_count(&self, environment_id: Uuid) -> usize {
        self.collects.lock().get(&environment_id).copied().unwrap_or(0)
    }

    fn require(&self, env: &Environment) -> Result<Arc<MemoryDriver>, AppError> {
        self.database(env.id)
            .ok_or_else(|| AppError::NotFound(format!("No database for environment {}", env.name)))
    }
}

#[async_trait]
impl DriverProvider for MemoryCluster {
    async fn open(&self, env: &Environment) -> Result<Arc<dyn EnvironmentDriver>, AppError> {
        let db = self.require(env)?;
        *self.opens.lock().entry(env.id).or_default() += 1;
        Ok(db)
    }
}

#[async_trait]
impl SchemaCollector for MemoryCluster {
    async fn collect(&self, env: &Environment, options: &CollectOptions) -> Result<SchemaDefinition, AppError> {
        let db = self.require(env)?;
        *self.collects.lock().entry(env.id).or_default() += 1;

        let mut schema = db.schema();
        schema.environment_id = Some(env.id);
        schema.captured_at = Utc::now();
        Ok(options.apply(&schema))
    }
}

/// Wiring for component tests: file state store and backup directory in a
/// temp dir, in-memory databases, one guard
pub struct TestHarness {
    pub dir: tempfile::TempDir,
    pub config: CloneConfig,
    pub guard: Arc<ProductionSafetyGuard>,
    pub cluster: Arc<MemoryCluster>,
    pub store: Arc<dyn StateStore>,
    pub locks: Arc<EnvironmentLocks>,
}

impl TestHarness {
    pub async fn new() -> Self {
        let dir = tempfile::tempdir().expect("temp dir");
        let config = CloneConfig {
            backup_dir: dir.path().join("backups"),
            state_dir: dir.path().join("state"),
            batch_size: 2,
            ..CloneConfig::default()
        };
        let guard = Arc::new(ProductionSafetyGuard::new(&config).expect("guard"));
        let store: Arc<dyn StateStore> = Arc::new(FileStateStore::open(config.state_dir.clone()).await.expect("store"));

        Self {
            dir,
            config,
            guard,
            cluster: Arc::new(MemoryCluster::new()),
            store,
            locks: Arc::new(EnvironmentLocks::new()),
        }
    }

    pub fn connector(&self) -> EnvironmentConnector {
        EnvironmentConnector::new(self.cluster.clone(), self.guard.clone())
    }

    pub fn backup_manager(&self) -> BackupManager {
        BackupManager::new(
            &self.config,
            self.connector(),
            self.cluster.clone(),
            self.store.clone(),
            self.locks.clone(),
        )
    }

    pub fn orchestrator(&self) -> CloneOrchestrator {
        CloneOrchestrator::new(
            &self.config,
            self.connector(),
            self.cluster.clone(),
            Arc::new(self.backup_manager()),
            self.store.clone(),
            self.locks.clone(),
        )
    }

    /// Full application state over the in-memory cluster
    pub fn app_state(&self, jwt_secret: &str) -> Arc<AppState> {
        Arc::new(AppState::new(
            &self.config,
            self.connector(),
            self.cluster.clone(),
            self.store.clone(),
            jwt_secret.to_string(),
        ))
    }

    /// Register an environment backed by a fresh in-memory database
    pub fn environment(
        &self,
        name: &str,
        environment_type: EnvironmentType,
        schema: SchemaDefinition,
    ) -> (Environment, Arc<MemoryDriver>) {
        let env = Environment::new(name, environment_type, format!("postgres://app@localhost:5432/{}", name));
        let db = self.cluster.install(&env, schema);
        (env, db)
    }
}
