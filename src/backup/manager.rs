//! Backup/rollback manager
//!
//! Creates checksummed artifacts of an environment, validates them, and
//! restores them fully or by scoped target. Restores re-apply the artifact
//! schema through the migration generator in safe mode, then reload rows
//! parents-first.

use super::artifact::*;
use crate::config::CloneConfig;
use crate::driver::{ConflictPolicy, EnvironmentConnector, EnvironmentDriver, Row, RowWindow};
use crate::environment::Environment;
use crate::error::AppError;
use crate::locks::{EnvironmentLease, EnvironmentLocks};
use crate::migration::{apply_script, MigrationGenerator, MigrationGeneratorOptions};
use crate::safety::OperationKind;
use crate::schema::model::SchemaObject;
use crate::schema::{
    dependency_order, CollectOptions, ComparisonOptions, DiffAction, ObjectType, SchemaCollector,
    SchemaComparator, SchemaDefinition, TableDefinition, TableRef,
};
use crate::store::{RecordIndex, StateStore};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BackupOptions {
    pub scope: RollbackScope,
    /// Table keys whose rows to keep; empty keeps every table
    pub tables: Vec<String>,
    pub include_data: bool,
    pub description: Option<String>,
}

impl Default for BackupOptions {
    fn default() -> Self {
        Self {
            scope: RollbackScope::Full,
            tables: Vec::new(),
            include_data: true,
            description: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RestoreResult {
    pub backup_id: Uuid,
    pub environment_id: Uuid,
    pub tables_restored: usize,
    pub records_restored: u64,
    pub schema_operations: usize,
    pub warnings: Vec<String>,
}

/// One unit of a granular rollback, e.g. `{scope: table, name: "public.orders"}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RollbackTarget {
    pub scope: RollbackScope,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl RollbackTarget {
    pub fn new(scope: RollbackScope, name: Option<&str>) -> Self {
        Self {
            scope,
            name: name.map(str::to_string),
        }
    }

    fn label(&self) -> String {
        match &self.name {
            Some(name) => format!("{:?}:{}", self.scope, name).to_lowercase(),
            None => format!("{:?}", self.scope).to_lowercase(),
        }
    }

    fn require_name(&self) -> Result<&str, AppError> {
        self.name
            .as_deref()
            .ok_or_else(|| AppError::BadRequest(format!("{} rollback target needs a name", self.label())))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RollbackOptions {
    /// Keep objects and rows created after the backup
    pub preserve_new_data: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetOutcome {
    pub target: RollbackTarget,
    pub success: bool,
    pub message: String,
    pub schema_operations: usize,
    pub records_restored: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GranularRollbackResult {
    pub backup_id: Uuid,
    pub environment_id: Uuid,
    pub results: Vec<TargetOutcome>,
    pub errors: Vec<String>,
}

impl GranularRollbackResult {
    pub fn success(&self) -> bool {
        self.errors.is_empty()
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TableCountCheck {
    pub table: String,
    pub expected: u64,
    pub actual: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RestoreVerification {
    pub backup_id: Uuid,
    pub scratch_environment_id: Uuid,
    pub verified: bool,
    pub schema_differences: usize,
    pub table_counts: Vec<TableCountCheck>,
    pub problems: Vec<String>,
}

pub struct BackupManager {
    backup_dir: PathBuf,
    retention: usize,
    batch_size: u64,
    operation_timeout_ms: u64,
    connector: EnvironmentConnector,
    collector: Arc<dyn SchemaCollector>,
    locks: Arc<EnvironmentLocks>,
    backups: RecordIndex<BackupMetadata>,
    checkpoints: RecordIndex<RollbackCheckpoint>,
}

impl BackupManager {
    pub fn new(
        config: &CloneConfig,
        connector: EnvironmentConnector,
        collector: Arc<dyn SchemaCollector>,
        store: Arc<dyn StateStore>,
        locks: Arc<EnvironmentLocks>,
    ) -> Self {
        Self {
            backup_dir: config.backup_dir.clone(),
            retention: config.backup_retention,
            batch_size: config.batch_size as u64,
            operation_timeout_ms: config.operation_timeout_secs.saturating_mul(1_000),
            connector,
            collector,
            locks,
            backups: RecordIndex::new(store.clone()),
            checkpoints: RecordIndex::new(store),
        }
    }

    fn restore_options(&self) -> MigrationGeneratorOptions {
        MigrationGeneratorOptions {
            include_rollback: false,
            add_comments: false,
            safe_mode: true,
            operation_timeout_ms: self.operation_timeout_ms,
        }
    }

    // ------------------------------------------------------------ creation

    pub async fn create_backup(&self, env: &Environment, options: &BackupOptions) -> Result<BackupMetadata, AppError> {
        self.connector.guard().enforce_read_only(env, OperationKind::Backup)?;
        let lease = self.locks.acquire(env.id).await;
        self.create_backup_leased(env, options, &lease).await
    }

    /// Create a backup while already holding the environment's lease
    pub async fn create_backup_leased(
        &self,
        env: &Environment,
        options: &BackupOptions,
        lease: &EnvironmentLease,
    ) -> Result<BackupMetadata, AppError> {
        lease.ensure_covers(env.id)?;
        self.connector.guard().enforce_read_only(env, OperationKind::Backup)?;

        let schema = self.collector.collect(env, &CollectOptions::default()).await?;
        let driver = self.connector.connect(env).await?;

        let mut data = BTreeMap::new();
        if options.include_data {
            for table in schema
                .tables
                .iter()
                .filter(|t| options.tables.is_empty() || options.tables.contains(&t.key()))
            {
                data.insert(table.key(), self.read_table(&driver, table).await?);
            }
        }

        let id = Uuid::new_v4();
        let created_at = Utc::now();
        let artifact = BackupArtifact::new(
            ArtifactManifest {
                backup_id: id,
                environment_id: env.id,
                environment_name: env.name.clone(),
                created_at,
                scope: options.scope,
                description: options.description.clone(),
            },
            schema,
            data,
        );
        let (path, size, checksum) = write_artifact(&self.backup_dir, &artifact).await?;

        let metadata = BackupMetadata {
            id,
            environment_id: env.id,
            environment_name: env.name.clone(),
            created_at,
            size,
            checksum,
            is_valid: true,
            file_path: path.display().to_string(),
            scope: options.scope,
            tables: artifact.data.keys().cloned().collect(),
            record_count: artifact.record_count(),
            schema_checksum: artifact.schema.checksum(),
            description: options.description.clone(),
        };
        self.backups.put(&metadata).await?;
        info!(
            "💾 Backup {} of {} created ({} tables, {} records, {} bytes)",
            id,
            env.name,
            metadata.tables.len(),
            metadata.record_count,
            size
        );

        self.prune(env.id).await?;
        Ok(metadata)
    }

    async fn read_table(&self, driver: &dyn EnvironmentDriver, table: &TableDefinition) -> Result<Vec<Row>, AppError> {
        let table_ref = table.table_ref();
        let order_by = table.primary_key_columns();
        let mut rows = Vec::new();
        let mut offset = 0;
        loop {
            let page = driver
                .fetch_rows(&table_ref, &RowWindow::page(offset, self.batch_size, order_by.clone()))
                .await?;
            let fetched = page.len() as u64;
            rows.extend(page);
            if fetched < self.batch_size {
                break;
            }
            offset += fetched;
        }
        Ok(rows)
    }

    /// Backup plus a checkpoint describing what it can restore
    pub async fn create_checkpoint(
        &self,
        env: &Environment,
        scope: RollbackScope,
        targets: Vec<String>,
        operation_id: Option<Uuid>,
    ) -> Result<RollbackCheckpoint, AppError> {
        let options = BackupOptions {
            scope,
            tables: if scope == RollbackScope::Table { targets.clone() } else { Vec::new() },
            include_data: matches!(scope, RollbackScope::Table | RollbackScope::Data | RollbackScope::Full),
            description: Some(format!("{:?} checkpoint", scope).to_lowercase()),
        };
        let backup = self.create_backup(env, &options).await?;

        let checkpoint = RollbackCheckpoint {
            id: Uuid::new_v4(),
            backup_id: backup.id,
            environment_id: env.id,
            created_at: Utc::now(),
            scope,
            targets,
            operation_id,
        };
        self.checkpoints.put(&checkpoint).await?;
        info!("Checkpoint {} ({:?}) recorded for {}", checkpoint.id, scope, env.name);
        Ok(checkpoint)
    }

    // ---------------------------------------------------------- inspection

    pub async fn get_backup(&self, id: Uuid) -> Result<BackupMetadata, AppError> {
        self.backups.require(&id.to_string()).await
    }

    async fn inspect(&self, metadata: &BackupMetadata) -> (BackupValidation, Option<BackupArtifact>) {
        match tokio::fs::read(&metadata.file_path).await {
            Ok(bytes) => inspect(&bytes, metadata),
            Err(e) => (
                BackupValidation {
                    backup_id: metadata.id,
                    is_valid: false,
                    checksum_matches: false,
                    problems: vec![format!("artifact unreadable: {}", e)],
                },
                None,
            ),
        }
    }

    async fn record_validity(&self, metadata: &BackupMetadata, is_valid: bool) -> Result<(), AppError> {
        if metadata.is_valid != is_valid {
            self.backups
                .update(&metadata.id.to_string(), |m| m.is_valid = is_valid)
                .await?;
            if !is_valid {
                warn!("Backup {} marked invalid", metadata.id);
            }
        }
        Ok(())
    }

    /// Re-read the artifact, recompute its checksum and check its structure
    pub async fn validate_backup(&self, id: Uuid) -> Result<BackupValidation, AppError> {
        let metadata = self.get_backup(id).await?;
        let (validation, _) = self.inspect(&metadata).await;
        self.record_validity(&metadata, validation.is_valid).await?;
        Ok(validation)
    }

    async fn load_artifact(&self, id: Uuid) -> Result<(BackupMetadata, BackupArtifact), AppError> {
        let metadata = self.get_backup(id).await?;
        let (validation, artifact) = self.inspect(&metadata).await;
        self.record_validity(&metadata, validation.is_valid).await?;
        match artifact {
            Some(artifact) => Ok((metadata, artifact)),
            None => Err(AppError::BackupIntegrity(format!(
                "Backup {}: {}",
                id,
                validation.problems.join("; ")
            ))),
        }
    }

    /// Newest first. With `validate`, corrupt artifacts are marked invalid
    /// rather than failing the listing.
    pub async fn list_backups(&self, environment_id: Option<Uuid>, validate: bool) -> Result<Vec<BackupMetadata>, AppError> {
        let mut backups: Vec<BackupMetadata> = self
            .backups
            .list()
            .await?
            .into_iter()
            .filter(|b| environment_id.map_or(true, |id| b.environment_id == id))
            .collect();
        backups.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        if validate {
            for backup in &mut backups {
                let (validation, _) = self.inspect(backup).await;
                if let Err(e) = self.record_validity(backup, validation.is_valid).await {
                    warn!("Could not record validity of backup {}: {}", backup.id, e);
                }
                backup.is_valid = validation.is_valid;
            }
        }
        Ok(backups)
    }

    // ------------------------------------------------------------- restore

    pub async fn restore_backup(&self, env: &Environment, backup_id: Uuid) -> Result<RestoreResult, AppError> {
        self.connector.guard().enforce_read_only(env, OperationKind::Restore)?;
        let lease = self.locks.acquire(env.id).await;
        self.restore_backup_leased(env, backup_id, &lease).await
    }

    pub async fn restore_backup_leased(
        &self,
        env: &Environment,
        backup_id: Uuid,
        lease: &EnvironmentLease,
    ) -> Result<RestoreResult, AppError> {
        lease.ensure_covers(env.id)?;
        self.connector.guard().enforce_read_only(env, OperationKind::Restore)?;

        let (metadata, artifact) = self.load_artifact(backup_id).await?;
        Self::ensure_owned(&metadata, env)?;
        let result = self.restore_artifact(env, &artifact).await?;
        info!(
            "♻️  Restored backup {} into {} ({} tables, {} records, {} schema operations)",
            backup_id, env.name, result.tables_restored, result.records_restored, result.schema_operations
        );
        Ok(result)
    }

    fn ensure_owned(metadata: &BackupMetadata, env: &Environment) -> Result<(), AppError> {
        if metadata.environment_id == env.id {
            Ok(())
        } else {
            Err(AppError::BadRequest(format!(
                "Backup {} belongs to environment {}, not {}",
                metadata.id, metadata.environment_name, env.name
            )))
        }
    }

    async fn restore_artifact(&self, env: &Environment, artifact: &BackupArtifact) -> Result<RestoreResult, AppError> {
        let driver = self.connector.connect(env).await?;
        let schema_operations = self
            .restore_schema(&driver, env, &artifact.schema, &|_, _, _| true, false)
            .await?;
        let (tables_restored, records_restored, warnings) = self.reload_data(&driver, artifact, None, false).await?;

        Ok(RestoreResult {
            backup_id: artifact.metadata.backup_id,
            environment_id: env.id,
            tables_restored,
            records_restored,
            schema_operations,
            warnings,
        })
    }

    /// Bring the in-scope part of the environment's schema back to `desired`
    async fn restore_schema(
        &self,
        driver: &dyn EnvironmentDriver,
        env: &Environment,
        desired: &SchemaDefinition,
        keep: &(dyn Fn(ObjectType, &str, &str) -> bool + Sync),
        preserve_new: bool,
    ) -> Result<usize, AppError> {
        let current = self.collector.collect(env, &CollectOptions::default()).await?;
        let diff = SchemaComparator::compare(
            &desired.retain_scope(|t, s, k| keep(t, s, k)),
            &current.retain_scope(|t, s, k| keep(t, s, k)),
            &ComparisonOptions::default(),
        )?;

        let differences: Vec<_> = diff
            .differences
            .into_iter()
            .filter(|d| !(preserve_new && d.action == DiffAction::Drop))
            .collect();
        let script = MigrationGenerator::generate_from(&differences, &self.restore_options())?;
        apply_script(driver, &script, &differences).await
    }

    /// Truncate then reload rows parents-first; with `preserve_new`, existing
    /// rows stay and conflicting backup rows are skipped
    async fn reload_data(
        &self,
        driver: &dyn EnvironmentDriver,
        artifact: &BackupArtifact,
        only: Option<&str>,
        preserve_new: bool,
    ) -> Result<(usize, u64, Vec<String>), AppError> {
        let tables: Vec<TableDefinition> = artifact
            .schema
            .tables
            .iter()
            .filter(|t| artifact.data.contains_key(&t.key()))
            .filter(|t| only.map_or(true, |key| t.key() == key))
            .cloned()
            .collect();
        let (order, warnings) = dependency_order(&tables);

        if !preserve_new && !order.is_empty() {
            driver.truncate(&order).await?;
        }

        let policy = if preserve_new { ConflictPolicy::DoNothing } else { ConflictPolicy::Error };
        let mut records = 0;
        for table in &order {
            let Some(rows) = artifact.data.get(&table.key()) else {
                continue;
            };
            for chunk in rows.chunks(self.batch_size.max(1) as usize) {
                records += driver.insert_rows(table, chunk, policy).await?;
            }
        }
        Ok((order.len(), records, warnings))
    }

    // ----------------------------------------------------- granular rollback

    pub async fn perform_granular_rollback(
        &self,
        env: &Environment,
        backup_id: Uuid,
        targets: &[RollbackTarget],
        options: &RollbackOptions,
    ) -> Result<GranularRollbackResult, AppError> {
        self.connector.guard().enforce_read_only(env, OperationKind::Restore)?;
        let lease = self.locks.acquire(env.id).await;
        self.perform_granular_rollback_leased(env, backup_id, targets, options, &lease)
            .await
    }

    /// Each target is restored independently; failures are collected, not fatal
    pub async fn perform_granular_rollback_leased(
        &self,
        env: &Environment,
        backup_id: Uuid,
        targets: &[RollbackTarget],
        options: &RollbackOptions,
        lease: &EnvironmentLease,
    ) -> Result<GranularRollbackResult, AppError> {
        lease.ensure_covers(env.id)?;
        self.connector.guard().enforce_read_only(env, OperationKind::Restore)?;
        let (metadata, artifact) = self.load_artifact(backup_id).await?;
        Self::ensure_owned(&metadata, env)?;
        let driver = self.connector.connect(env).await?;

        let mut results = Vec::with_capacity(targets.len());
        let mut errors = Vec::new();
        for target in targets {
            match self
                .rollback_target(&driver, env, &artifact, target, options.preserve_new_data)
                .await
            {
                Ok((schema_operations, records_restored)) => results.push(TargetOutcome {
                    target: target.clone(),
                    success: true,
                    message: format!("{} restored", target.label()),
                    schema_operations,
                    records_restored,
                }),
                Err(e) => {
                    warn!("Granular rollback of {} failed: {}", target.label(), e);
                    errors.push(format!("{}: {}", target.label(), e));
                    results.push(TargetOutcome {
                        target: target.clone(),
                        success: false,
                        message: e.to_string(),
                        schema_operations: 0,
                        records_restored: 0,
                    });
                }
            }
        }

        info!(
            "Granular rollback of {} from backup {}: {}/{} targets restored",
            env.name,
            backup_id,
            results.iter().filter(|r| r.success).count(),
            results.len()
        );
        Ok(GranularRollbackResult {
            backup_id,
            environment_id: env.id,
            results,
            errors,
        })
    }

    async fn rollback_target(
        &self,
        driver: &dyn EnvironmentDriver,
        env: &Environment,
        artifact: &BackupArtifact,
        target: &RollbackTarget,
        preserve_new: bool,
    ) -> Result<(usize, u64), AppError> {
        match target.scope {
            RollbackScope::Full => {
                let ops = self
                    .restore_schema(driver, env, &artifact.schema, &|_, _, _| true, preserve_new)
                    .await?;
                let (_, records, _) = self.reload_data(driver, artifact, None, preserve_new).await?;
                Ok((ops, records))
            }
            RollbackScope::Data => {
                let (_, records, _) = self.reload_data(driver, artifact, None, preserve_new).await?;
                Ok((0, records))
            }
            RollbackScope::Schema => {
                let name = target.require_name()?;
                let ops = self
                    .restore_schema(driver, env, &artifact.schema, &|t, s, _| t != ObjectType::Extension && s == name, preserve_new)
                    .await?;
                Ok((ops, 0))
            }
            RollbackScope::Function | RollbackScope::Trigger => {
                let name = target.require_name()?;
                let wanted = if target.scope == RollbackScope::Function {
                    ObjectType::Function
                } else {
                    ObjectType::Trigger
                };
                if !object_exists(&artifact.schema, wanted, name) {
                    return Err(AppError::NotFound(format!("{} {} is not in backup", wanted, name)));
                }
                let ops = self
                    .restore_schema(driver, env, &artifact.schema, &|t, _, k| t == wanted && k == name, false)
                    .await?;
                Ok((ops, 0))
            }
            RollbackScope::Table => {
                let name = target.require_name()?;
                if artifact.schema.table(name).is_none() {
                    return Err(AppError::NotFound(format!("Table {} is not in backup", name)));
                }
                if !artifact.data.contains_key(name) {
                    return Err(AppError::BackupIntegrity(format!("Backup carries no rows for {}", name)));
                }
                let prefix = format!("{}.", name);
                let ops = self
                    .restore_schema(
                        driver,
                        env,
                        &artifact.schema,
                        &|t, _, k| match t {
                            ObjectType::Table => k == name,
                            ObjectType::Trigger | ObjectType::Policy => k.starts_with(&prefix),
                            _ => false,
                        },
                        false,
                    )
                    .await?;

                let (_, records, _) = self.reload_data(driver, artifact, Some(name), preserve_new).await?;
                Ok((ops, records))
            }
        }
    }

    // -------------------------------------------------------- verification

    /// Restore into a scratch environment and check the result against the artifact
    pub async fn verify_restore(&self, backup_id: Uuid, scratch: &Environment) -> Result<RestoreVerification, AppError> {
        self.connector.guard().validate_clone_target(scratch)?;
        let (metadata, artifact) = self.load_artifact(backup_id).await?;
        if metadata.environment_id == scratch.id {
            return Err(AppError::BadRequest(
                "Restore verification needs a scratch environment other than the backup's own".to_string(),
            ));
        }

        let _lease = self.locks.acquire(scratch.id).await;
        let mut problems = Vec::new();
        self.restore_artifact(scratch, &artifact).await?;

        let collected = self.collector.collect(scratch, &CollectOptions::default()).await?;
        let diff = SchemaComparator::compare(&artifact.schema, &collected, &ComparisonOptions::default())?;
        if !diff.is_empty() {
            problems.push(format!("{} schema differences after restore", diff.differences.len()));
        }

        let driver = self.connector.connect(scratch).await?;
        let mut table_counts = Vec::with_capacity(artifact.data.len());
        for (key, rows) in &artifact.data {
            let actual = driver.count_rows(&TableRef::parse(key)).await?;
            let expected = rows.len() as u64;
            if actual != expected {
                problems.push(format!("{} has {} rows, expected {}", key, actual, expected));
            }
            table_counts.push(TableCountCheck {
                table: key.clone(),
                expected,
                actual,
            });
        }

        let verification = RestoreVerification {
            backup_id,
            scratch_environment_id: scratch.id,
            verified: problems.is_empty(),
            schema_differences: diff.differences.len(),
            table_counts,
            problems,
        };
        info!(
            "Restore verification of backup {} into {}: {}",
            backup_id,
            scratch.name,
            if verification.verified { "verified" } else { "FAILED" }
        );
        Ok(verification)
    }

    // ------------------------------------------------------------ retention

    pub async fn delete_backup(&self, id: Uuid) -> Result<(), AppError> {
        let metadata = self.get_backup(id).await?;
        match tokio::fs::remove_file(&metadata.file_path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        self.backups.delete(&id.to_string()).await?;

        for checkpoint in self.checkpoints.list().await? {
            if checkpoint.backup_id == id {
                self.checkpoints.delete(&checkpoint.id.to_string()).await?;
            }
        }
        info!("Deleted backup {}", id);
        Ok(())
    }

    /// Keep the newest `retention` backups of an environment
    async fn prune(&self, environment_id: Uuid) -> Result<usize, AppError> {
        let backups = self.list_backups(Some(environment_id), false).await?;
        let mut pruned = 0;
        for backup in backups.iter().skip(self.retention.max(1)) {
            self.delete_backup(backup.id).await?;
            pruned += 1;
        }
        if pruned > 0 {
            info!("Pruned {} old backups of environment {}", pruned, environment_id);
        }
        Ok(pruned)
    }
}

fn object_exists(schema: &SchemaDefinition, object_type: ObjectType, key: &str) -> bool {
    match object_type {
        ObjectType::Function => schema.functions.iter().any(|f| f.key() == key),
        ObjectType::Trigger => schema.triggers.iter().any(|t| t.key() == key),
        ObjectType::Table => schema.table(key).is_some(),
        ObjectType::Index => schema.indexes.iter().any(|i| i.key() == key),
        ObjectType::Policy => schema.policies.iter().any(|p| p.key() == key),
        ObjectType::Extension => schema.extensions.iter().any(|e| e.key() == key),
    }
}
