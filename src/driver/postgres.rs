//! PostgreSQL driver
//!
//! One deadpool pool per environment, created on first use. TLS is enabled
//! when the host or the `sslmode` parameter asks for it.

use super::{ConflictPolicy, DriverProvider, EnvironmentDriver, Row, RowWindow};
use crate::environment::{ConnectionParams, Environment};
use crate::error::AppError;
use crate::migration::sql::ensure_fragment;
use crate::schema::model::quote_ident;
use crate::schema::TableRef;
use async_trait::async_trait;
use deadpool_postgres::{Config, ManagerConfig, Pool, PoolConfig, RecyclingMethod, Runtime};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio_postgres::NoTls;
use tracing::{debug, info};
use uuid::Uuid;

const REFERENCING_TABLES_QUERY: &str = r#"
    SELECT DISTINCT n.nspname || '.' || c.relname
    FROM pg_constraint k
    JOIN pg_class c ON c.oid = k.conrelid
    JOIN pg_namespace n ON n.oid = c.relnamespace
    WHERE k.contype = 'f'
      AND k.conrelid <> k.confrelid
      AND k.confrelid = ANY(($1::text[])::regclass[])
"#;

/// Create a connection pool for the given parameters
pub fn build_pool(params: &ConnectionParams, max_size: usize) -> Result<Pool, AppError> {
    let mut cfg = Config::new();
    cfg.host = Some(params.host.clone());
    cfg.port = Some(params.port);
    cfg.user = Some(params.user.clone());
    cfg.password = Some(params.password.clone());
    cfg.dbname = Some(params.database.clone());
    cfg.manager = Some(ManagerConfig {
        recycling_method: RecyclingMethod::Fast,
    });
    cfg.pool = Some(PoolConfig::new(max_size));

    if params.require_tls {
        let certs = rustls_native_certs::load_native_certs();
        let mut root_store = rustls::RootCertStore::empty();
        for cert in certs.certs {
            root_store.add(cert).ok();
        }

        let tls_config = rustls::ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth();

        let tls = tokio_postgres_rustls::MakeRustlsConnect::new(tls_config);
        cfg.create_pool(Some(Runtime::Tokio1), tls)
            .map_err(|e| AppError::Config(format!("Failed to create TLS pool: {}", e)))
    } else {
        cfg.create_pool(Some(Runtime::Tokio1), NoTls)
            .map_err(|e| AppError::Config(format!("Failed to create pool: {}", e)))
    }
}

/// Pools per environment id
pub struct PostgresProvider {
    pools: RwLock<HashMap<Uuid, Pool>>,
    max_pool_size: usize,
}

impl PostgresProvider {
    pub fn new(max_pool_size: usize) -> Self {
        Self {
            pools: RwLock::new(HashMap::new()),
            max_pool_size,
        }
    }

    /// Get or create the pool for an environment
    pub async fn pool(&self, env: &Environment) -> Result<Pool, AppError> {
        if let Some(pool) = self.pools.read().await.get(&env.id) {
            return Ok(pool.clone());
        }

        let params = ConnectionParams::from_connection_string(&env.connection_ref)?;
        let mut pools = self.pools.write().await;
        // Another task may have built it while we waited for the lock
        if let Some(pool) = pools.get(&env.id) {
            return Ok(pool.clone());
        }
        let pool = build_pool(&params, self.max_pool_size)?;
        info!(
            "Opened pool for environment {} ({}, TLS: {})",
            env.name,
            params.to_display_string(),
            params.require_tls
        );
        pools.insert(env.id, pool.clone());
        Ok(pool)
    }
}

#[async_trait]
impl DriverProvider for PostgresProvider {
    async fn open(&self, env: &Environment) -> Result<Arc<dyn EnvironmentDriver>, AppError> {
        Ok(Arc::new(PostgresDriver::new(self.pool(env).await?)))
    }
}

pub struct PostgresDriver {
    pool: Pool,
}

impl PostgresDriver {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

fn rows_param(rows: &[Row]) -> serde_json::Value {
    serde_json::Value::Array(rows.iter().cloned().map(serde_json::Value::Object).collect())
}

#[async_trait]
impl EnvironmentDriver for PostgresDriver {
    async fn execute(&self, sql: &str) -> Result<(), AppError> {
        let client = self.pool.get().await?;
        client.batch_execute(sql).await?;
        Ok(())
    }

    async fn fetch_rows(&self, table: &TableRef, window: &RowWindow) -> Result<Vec<Row>, AppError> {
        let mut query = format!("SELECT to_jsonb(t.*) FROM {} AS t", table.quoted());
        if let Some(predicate) = &window.predicate {
            ensure_fragment(&table.key(), predicate)?;
            query.push_str(&format!(" WHERE {}", predicate));
        }
        if window.order_by.is_empty() {
            query.push_str(" ORDER BY t.ctid");
        } else {
            let order: Vec<String> = window.order_by.iter().map(|c| format!("t.{}", quote_ident(c))).collect();
            query.push_str(&format!(" ORDER BY {}", order.join(", ")));
        }
        query.push_str(" LIMIT $1 OFFSET $2");

        let client = self.pool.get().await?;
        let rows = client
            .query(&query, &[&(window.limit as i64), &(window.offset as i64)])
            .await?;

        rows.iter()
            .map(|row| match row.get::<_, serde_json::Value>(0) {
                serde_json::Value::Object(map) => Ok(map),
                other => Err(AppError::Internal(format!(
                    "Unexpected row shape from {}: {}",
                    table.key(),
                    other
                ))),
            })
            .collect()
    }

    async fn insert_rows(&self, table: &TableRef, rows: &[Row], policy: ConflictPolicy) -> Result<u64, AppError> {
        if rows.is_empty() {
            return Ok(0);
        }
        let quoted = table.quoted();
        let query = format!(
            "INSERT INTO {} SELECT * FROM jsonb_populate_recordset(NULL::{}, $1::jsonb){}",
            quoted,
            quoted,
            match policy {
                ConflictPolicy::Error => "",
                ConflictPolicy::DoNothing => " ON CONFLICT DO NOTHING",
            }
        );

        let client = self.pool.get().await?;
        let written = client.execute(&query, &[&rows_param(rows)]).await?;
        debug!("Inserted {} rows into {}", written, table.key());
        Ok(written)
    }

    async fn update_rows(&self, table: &TableRef, key_columns: &[String], rows: &[Row]) -> Result<u64, AppError> {
        let Some(first) = rows.first() else {
            return Ok(0);
        };
        if key_columns.is_empty() {
            return Err(AppError::BadRequest(format!(
                "Updating {} requires key columns",
                table.key()
            )));
        }

        let assignments: Vec<String> = first
            .keys()
            .filter(|c| !key_columns.contains(c))
            .map(|c| format!("{} = s.{}", quote_ident(c), quote_ident(c)))
            .collect();
        if assignments.is_empty() {
            return Ok(0);
        }
        let matches: Vec<String> = key_columns
            .iter()
            .map(|c| format!("t.{} = s.{}", quote_ident(c), quote_ident(c)))
            .collect();

        let quoted = table.quoted();
        let query = format!(
            "UPDATE {} AS t SET {} FROM jsonb_populate_recordset(NULL::{}, $1::jsonb) AS s WHERE {}",
            quoted,
            assignments.join(", "),
            quoted,
            matches.join(" AND ")
        );

        let client = self.pool.get().await?;
        Ok(client.execute(&query, &[&rows_param(rows)]).await?)
    }

    async fn truncate(&self, tables: &[TableRef]) -> Result<(), AppError> {
        if tables.is_empty() {
            return Ok(());
        }
        let list: Vec<String> = tables.iter().map(TableRef::quoted).collect();
        let keys: Vec<String> = tables.iter().map(TableRef::key).collect();
        let mut client = self.pool.get().await?;

        let referencing: Vec<String> = client
            .query(REFERENCING_TABLES_QUERY, &[&list])
            .await?
            .iter()
            .map(|row| row.get::<_, String>(0))
            .filter(|key| !keys.contains(key))
            .collect();

        if referencing.is_empty() {
            client
                .batch_execute(&format!("TRUNCATE TABLE {}", list.join(", ")))
                .await?;
            return Ok(());
        }

        // TRUNCATE refuses outright here; row deletes only fail on rows still referenced
        debug!("Deleting children-first, referenced from {}", referencing.join(", "));
        let tx = client.transaction().await?;
        for quoted in list.iter().rev() {
            tx.execute(&format!("DELETE FROM {}", quoted), &[]).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn count_rows(&self, table: &TableRef) -> Result<u64, AppError> {
        let client = self.pool.get().await?;
        let row = client
            .query_one(&format!("SELECT COUNT(*) FROM {}", table.quoted()), &[])
            .await?;
        let count: i64 = row.get(0);
        Ok(count as u64)
    }
}
