//! One clone run: the phase sequence and the failure path

use super::collaborators::SystemContext;
use super::control::{OperationControl, PausableDriver};
use super::orchestrator::CloneOrchestrator;
use super::report::CloneReport;
use super::types::*;
use crate::backup::{BackupOptions, RollbackScope};
use crate::driver::{EnvironmentDriver, GuardedDriver, RowWindow};
use crate::environment::Environment;
use crate::error::AppError;
use crate::locks::EnvironmentLease;
use crate::migration::sql::quote_literal;
use crate::migration::{apply_operation, MigrationGenerator, MigrationGeneratorOptions, MigrationScript};
use crate::schema::model::{quote_ident, SchemaObject};
use crate::schema::{dependency_order, ComparisonOptions, SchemaComparator, SchemaDefinition, TableDefinition, TableRef};
use chrono::Utc;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

type PhaseFailure = (AppError, Option<ClonePhase>);

pub(super) struct CloneRun<'a> {
    orchestrator: &'a CloneOrchestrator,
    source: &'a Environment,
    target: &'a Environment,
    control: &'a OperationControl,
    lease: &'a EnvironmentLease,
    operation: CloneOperation,
    issues: Vec<CloneIssue>,
    source_schema: Option<Arc<SchemaDefinition>>,
    script: Option<MigrationScript>,
    timeout_ms: u64,
}

impl<'a> CloneRun<'a> {
    pub(super) fn new(
        orchestrator: &'a CloneOrchestrator,
        operation: CloneOperation,
        source: &'a Environment,
        target: &'a Environment,
        control: &'a OperationControl,
        lease: &'a EnvironmentLease,
    ) -> Self {
        let timeout_ms = operation
            .options
            .operation_timeout_secs
            .map_or(orchestrator.operation_timeout_ms, |secs| secs.saturating_mul(1_000));
        Self {
            orchestrator,
            source,
            target,
            control,
            lease,
            operation,
            issues: Vec::new(),
            source_schema: None,
            script: None,
            timeout_ms,
        }
    }

    // ------------------------------------------------------------ bookkeeping

    fn log(&mut self, level: LogLevel, phase: Option<ClonePhase>, message: impl Into<String>, details: Option<Value>) {
        let message = message.into();
        let id = self.operation.id;
        match level {
            LogLevel::Debug => debug!(operation_id = %id, phase = ?phase, "{}", message),
            LogLevel::Info => info!(operation_id = %id, phase = ?phase, "{}", message),
            LogLevel::Warn => warn!(operation_id = %id, phase = ?phase, "{}", message),
            LogLevel::Error => error!(operation_id = %id, phase = ?phase, "{}", message),
        }
        self.operation.push_log(level, phase, message, details);
    }

    fn warn(&mut self, phase: ClonePhase, message: impl Into<String>) {
        let message = message.into();
        self.issues.push(CloneIssue::warning(message.clone(), Some(phase)));
        self.log(LogLevel::Warn, Some(phase), message, None);
    }

    fn publish(&mut self, phase: ClonePhase, progress: u8, message: impl Into<String>) {
        self.operation.progress = self
            .orchestrator
            .progress
            .update(self.operation.id, progress, Some(phase), message);
        self.operation.current_phase = Some(phase);
    }

    async fn persist(&self) {
        if let Err(e) = self.orchestrator.operations.put(&self.operation).await {
            warn!("Could not persist clone operation {}: {}", self.operation.id, e);
        }
    }

    fn schema(&self) -> Result<Arc<SchemaDefinition>, AppError> {
        self.source_schema
            .clone()
            .ok_or_else(|| AppError::Internal("source schema not collected yet".to_string()))
    }

    /// Drivers handed to phase work wait out a pause before each call
    fn pausable<'d>(&self, driver: &'d GuardedDriver) -> PausableDriver<'d>
    where
        'a: 'd,
    {
        PausableDriver::new(driver, self.control, self.timeout_ms)
    }

    /// Hold here while paused; cancellation still waits for the phase boundary
    async fn pause_point(&mut self, phase: ClonePhase) {
        if !self.control.is_paused() {
            return;
        }
        self.log(LogLevel::Info, Some(phase), format!("Paused during {} phase", phase), None);
        self.persist().await;
        self.control.wait_while_paused().await;
        self.log(LogLevel::Info, Some(phase), format!("Resumed {} phase", phase), None);
    }

    fn begin(&mut self, phase: ClonePhase) {
        self.operation.timeline.push(PhaseTiming {
            phase,
            started_at: Utc::now(),
            completed_at: None,
            duration_ms: None,
            skipped: false,
            succeeded: false,
        });
        self.publish(phase, phase.band().0, format!("{} phase started", phase));
        self.log(LogLevel::Info, Some(phase), format!("{} phase started", phase), None);
    }

    fn finish(&mut self, phase: ClonePhase, succeeded: bool) {
        let now = Utc::now();
        if let Some(timing) = self.operation.timeline.iter_mut().rev().find(|t| t.phase == phase) {
            timing.completed_at = Some(now);
            timing.duration_ms = Some((now - timing.started_at).num_milliseconds());
            timing.succeeded = succeeded;
        }
        if succeeded {
            self.publish(phase, phase.band().1, format!("{} phase complete", phase));
        }
    }

    fn skip(&mut self, phase: ClonePhase, reason: &str) {
        let now = Utc::now();
        self.operation.timeline.push(PhaseTiming {
            phase,
            started_at: now,
            completed_at: Some(now),
            duration_ms: Some(0),
            skipped: true,
            succeeded: true,
        });
        self.publish(phase, phase.band().1, format!("{} phase skipped", phase));
        self.log(LogLevel::Debug, Some(phase), format!("Skipped: {}", reason), None);
    }

    async fn boundary(&mut self, phase: ClonePhase) -> Result<(), AppError> {
        if self.control.is_paused() {
            self.log(LogLevel::Info, Some(phase), format!("Paused before {} phase", phase), None);
            self.persist().await;
        }
        self.control.checkpoint().await
    }

    // ------------------------------------------------------------------ run

    pub(super) async fn run(mut self) -> CloneResult {
        self.operation.status = CloneStatus::InProgress;
        self.operation.started_at = Some(Utc::now());
        self.publish(ClonePhase::Safety, 0, "Safety checks passed");
        self.log(
            LogLevel::Info,
            Some(ClonePhase::Safety),
            format!("Cloning {} into {}", self.source.name, self.target.name),
            Some(json!({"sourceEnvId": self.source.id, "targetEnvId": self.target.id})),
        );
        self.persist().await;

        let rollback = match self.execute_phases().await {
            Ok(()) => {
                self.operation.status = CloneStatus::Completed;
                self.publish(ClonePhase::Validation, 100, "Clone completed");
                self.log(LogLevel::Info, None, "✅ Clone completed", None);
                None
            }
            Err((e @ AppError::Cancelled(_), phase)) => {
                self.operation.status = CloneStatus::Cancelled;
                self.issues.push(CloneIssue::from_error(&e, phase));
                self.log(LogLevel::Warn, phase, "Clone cancelled", None);
                None
            }
            Err((e, phase)) => {
                self.operation.status = CloneStatus::Failed;
                self.operation.error = Some(e.to_string());
                self.issues.push(CloneIssue::from_error(&e, phase));
                self.log(LogLevel::Error, phase, format!("❌ Clone failed: {}", e), None);
                self.roll_back().await
            }
        };

        self.operation.completed_at = Some(Utc::now());
        self.persist().await;
        self.into_result(rollback)
    }

    fn into_result(self, rollback: Option<RollbackOutcome>) -> CloneResult {
        let report = CloneReport::build(&self.operation, &self.issues, rollback.as_ref(), self.script.as_ref());
        for sink in &self.orchestrator.report_sinks {
            sink.deliver(&report);
        }

        let (errors, warnings): (Vec<CloneIssue>, Vec<CloneIssue>) = self
            .issues
            .into_iter()
            .partition(|i| i.severity == IssueSeverity::Error);
        CloneResult {
            operation_id: self.operation.id,
            success: self.operation.status == CloneStatus::Completed,
            status: self.operation.status,
            errors,
            warnings: warnings.into_iter().map(|w| w.message).collect(),
            backup_id: self.operation.backup_id,
            rollback,
            migration_script: self.script,
            statistics: self.operation.statistics,
            report,
        }
    }

    async fn execute_phases(&mut self) -> Result<(), PhaseFailure> {
        self.boundary(ClonePhase::Schema).await.map_err(|e| (e, None))?;

        let connector = &self.orchestrator.connector;
        let source = connector.connect(self.source).await.map_err(|e| (e, None))?;
        let target = connector.connect(self.target).await.map_err(|e| (e, None))?;

        if self.operation.options.create_backup {
            self.create_backup().await.map_err(|e| (e, None))?;
        }

        for phase in &ClonePhase::ALL[1..] {
            let phase = *phase;
            self.boundary(phase).await.map_err(|e| (e, Some(phase)))?;

            if let Some(reason) = self.skip_reason(phase) {
                self.skip(phase, reason);
                continue;
            }

            self.begin(phase);
            let result = match phase {
                ClonePhase::Schema => self.schema_phase(&target).await,
                ClonePhase::Data => self.data_phase(&source, &target).await,
                ClonePhase::Anonymization => self.anonymization_phase(&target).await,
                ClonePhase::Specialized => self.specialized_phase(&source, &target).await,
                ClonePhase::PostClone => self.post_clone_phase(&target).await,
                ClonePhase::Validation => self.validation_phase(&target).await,
                ClonePhase::Safety => Ok(()),
            };
            self.finish(phase, result.is_ok());
            result.map_err(|e| (e, Some(phase)))?;
            self.persist().await;
        }
        Ok(())
    }

    fn skip_reason(&self, phase: ClonePhase) -> Option<&'static str> {
        let options = &self.operation.options;
        match phase {
            ClonePhase::Data if !options.include_data => Some("data copy disabled"),
            ClonePhase::Anonymization if !options.anonymize_data => Some("anonymization disabled"),
            ClonePhase::Specialized if options.specialized_systems.is_empty() => Some("no specialized systems requested"),
            _ => None,
        }
    }

    async fn create_backup(&mut self) -> Result<(), AppError> {
        let options = BackupOptions {
            scope: RollbackScope::Full,
            tables: Vec::new(),
            include_data: true,
            description: Some(format!("Pre-clone backup for operation {}", self.operation.id)),
        };
        let backup = self
            .orchestrator
            .backups
            .create_backup_leased(self.target, &options, self.lease)
            .await?;
        self.operation.backup_id = Some(backup.id);
        self.log(
            LogLevel::Info,
            None,
            format!("Pre-clone backup {} created", backup.id),
            Some(json!({"backupId": backup.id, "records": backup.record_count})),
        );
        self.persist().await;
        Ok(())
    }

    async fn roll_back(&mut self) -> Option<RollbackOutcome> {
        let backup_id = self.operation.backup_id?;
        self.log(
            LogLevel::Warn,
            None,
            format!("Restore attempted from backup {}", backup_id),
            Some(json!({"backupId": backup_id})),
        );

        match self
            .orchestrator
            .backups
            .restore_backup_leased(self.target, backup_id, self.lease)
            .await
        {
            Ok(restored) => {
                self.log(
                    LogLevel::Info,
                    None,
                    format!(
                        "Target restored from backup {} ({} tables, {} records)",
                        backup_id, restored.tables_restored, restored.records_restored
                    ),
                    None,
                );
                Some(RollbackOutcome {
                    backup_id,
                    attempted: true,
                    succeeded: true,
                    error: None,
                })
            }
            Err(e) => {
                self.log(LogLevel::Error, None, format!("Restore from backup {} failed: {}", backup_id, e), None);
                self.issues.push(CloneIssue::from_error(&e, None));
                Some(RollbackOutcome {
                    backup_id,
                    attempted: true,
                    succeeded: false,
                    error: Some(e.to_string()),
                })
            }
        }
    }

    // --------------------------------------------------------------- phases

    async fn schema_phase(&mut self, target: &GuardedDriver) -> Result<(), AppError> {
        let phase = ClonePhase::Schema;
        let collect = self.operation.options.collect.clone();
        let collector = &self.orchestrator.collector;
        let source_schema = collector.collect(self.source, &collect).await?;
        let target_schema = collector.collect(self.target, &collect).await?;
        self.publish(phase, phase.progress_at(0.1), "Schemas collected");

        let diff = SchemaComparator::compare(&source_schema, &target_schema, &ComparisonOptions::default())?;
        for warning in &diff.summary.warnings {
            self.warn(phase, warning.clone());
        }

        let options = MigrationGeneratorOptions {
            include_rollback: true,
            add_comments: false,
            safe_mode: self.operation.options.safe_mode,
            operation_timeout_ms: self.timeout_ms,
        };
        let script = MigrationGenerator::generate(&diff, &options)?;
        for warning in &script.warnings {
            self.warn(phase, warning.clone());
        }
        self.source_schema = Some(Arc::new(source_schema));

        if script.requires_backup && self.operation.backup_id.is_none() {
            let count = script.non_reversible.len();
            self.script = Some(script);
            return Err(AppError::EnvironmentValidation(format!(
                "{} non-reversible operations need a pre-clone backup; enable createBackup",
                count
            )));
        }

        let total = script.operations.len();
        self.log(
            LogLevel::Info,
            Some(phase),
            format!("Applying {} migration operations (risk {:?})", total, script.risk_level),
            Some(json!({"scriptId": script.id})),
        );
        for (i, (operation, difference)) in script.operations.iter().zip(&diff.differences).enumerate() {
            self.pause_point(phase).await;
            apply_operation(target, operation, difference).await?;
            let fraction = 0.1 + 0.9 * (i + 1) as f64 / total as f64;
            self.publish(phase, phase.progress_at(fraction), operation.description.clone());
        }

        self.operation.statistics.schema_operations = total;
        self.script = Some(script);
        Ok(())
    }

    async fn data_phase(&mut self, source: &GuardedDriver, target: &GuardedDriver) -> Result<(), AppError> {
        let phase = ClonePhase::Data;
        let schema = self.schema()?;
        let tables: Vec<TableDefinition> = schema
            .tables
            .iter()
            .filter(|t| self.operation.options.copies_table(&t.key()))
            .cloned()
            .collect();

        let (order, warnings) = dependency_order(&tables);
        for warning in warnings {
            self.warn(phase, warning);
        }
        let ordered: Vec<TableDefinition> = order
            .iter()
            .filter_map(|r| tables.iter().find(|t| t.key() == r.key()))
            .cloned()
            .collect();

        self.publish(phase, phase.progress_at(0.05), format!("Copying {} tables", ordered.len()));
        let counts = self
            .orchestrator
            .data_cloner
            .clone_tables(&self.pausable(source), &self.pausable(target), &ordered)
            .await?;

        let statistics = &mut self.operation.statistics;
        statistics.tables_cloned = counts.len();
        statistics.records_cloned = counts.values().sum();
        statistics.table_counts = counts;
        let message = format!(
            "Copied {} records across {} tables",
            statistics.records_cloned, statistics.tables_cloned
        );
        self.log(LogLevel::Info, Some(phase), message, None);
        Ok(())
    }

    async fn anonymization_phase(&mut self, target: &GuardedDriver) -> Result<(), AppError> {
        let phase = ClonePhase::Anonymization;
        let target = self.pausable(target);
        let mut by_table: BTreeMap<String, Vec<AnonymizationRule>> = BTreeMap::new();
        for rule in &self.operation.options.anonymization_rules {
            by_table.entry(rule.table.clone()).or_default().push(rule.clone());
        }

        let total = by_table.len();
        for (i, (table, rules)) in by_table.into_iter().enumerate() {
            let mandatory = rules.iter().any(|r| r.mandatory);
            match self.anonymize_table(&target, &table, &rules).await {
                Ok(count) => self.operation.statistics.records_anonymized += count,
                Err(e) if mandatory => return Err(e),
                Err(e) => self.warn(phase, format!("Anonymization of {} skipped: {}", table, e)),
            }
            self.publish(phase, phase.progress_at((i + 1) as f64 / total as f64), format!("{} anonymized", table));
        }
        Ok(())
    }

    async fn anonymize_table(
        &mut self,
        target: &dyn EnvironmentDriver,
        table_key: &str,
        rules: &[AnonymizationRule],
    ) -> Result<u64, AppError> {
        let phase = ClonePhase::Anonymization;
        let schema = self.schema()?;
        let table = schema
            .table(table_key)
            .ok_or_else(|| AppError::NotFound(format!("Table {} is not in the source schema", table_key)))?;
        let key_columns = table.primary_key_columns();
        if key_columns.is_empty() {
            return Err(AppError::Validation(format!("{} has no primary key to update masked rows by", table_key)));
        }

        let mut active = Vec::with_capacity(rules.len());
        for rule in rules {
            let problem = if table.column(&rule.column).is_none() {
                Some(format!("{}.{} does not exist", table_key, rule.column))
            } else if key_columns.contains(&rule.column) {
                Some(format!("{}.{} is a key column and cannot be masked", table_key, rule.column))
            } else {
                None
            };
            match problem {
                Some(problem) if rule.mandatory => return Err(AppError::Validation(problem)),
                Some(problem) => self.warn(phase, problem),
                None => active.push(rule.clone()),
            }
        }
        if active.is_empty() {
            return Ok(0);
        }

        let anonymizer = self.orchestrator.anonymizer.clone();
        let batch = self.orchestrator.batch_size;
        let table_ref = table.table_ref();
        let mut failures: BTreeMap<String, (u64, String)> = BTreeMap::new();
        let mut offset = 0;
        let mut masked = 0;

        loop {
            self.pause_point(phase).await;
            let page = target
                .fetch_rows(&table_ref, &RowWindow::page(offset, batch, key_columns.clone()))
                .await?;
            let fetched = page.len() as u64;

            let mut updated = Vec::with_capacity(page.len());
            for row in page {
                let mut row = row;
                for rule in &active {
                    match anonymizer.apply(row.clone(), std::slice::from_ref(rule)) {
                        Ok(next) => row = next,
                        Err(e) if rule.mandatory => return Err(e),
                        Err(e) => {
                            let entry = failures.entry(rule.column.clone()).or_insert((0, e.to_string()));
                            entry.0 += 1;
                        }
                    }
                }
                updated.push(row);
            }
            if !updated.is_empty() {
                masked += target.update_rows(&table_ref, &key_columns, &updated).await?;
            }
            if fetched < batch {
                break;
            }
            offset += fetched;
        }

        for (column, (rows, message)) in failures {
            self.warn(
                phase,
                format!("{}.{} left unmasked on {} rows: {}", table_key, column, rows, message),
            );
        }
        Ok(masked)
    }

    async fn specialized_phase(&mut self, source: &GuardedDriver, target: &GuardedDriver) -> Result<(), AppError> {
        let phase = ClonePhase::Specialized;
        let schema = self.schema()?;
        let requests = self.operation.options.specialized_systems.clone();
        let (source, target) = (self.pausable(source), self.pausable(target));
        let ctx = SystemContext {
            source: &source,
            target: &target,
            source_schema: &schema,
            batch_size: self.orchestrator.batch_size,
        };

        let total = requests.len();
        for (i, request) in requests.iter().enumerate() {
            let system = self
                .orchestrator
                .systems
                .get(&request.name)
                .cloned()
                .ok_or_else(|| AppError::NotFound(format!("Specialized system {} is not registered", request.name)))?;
            let outcome = system.clone_system(&ctx, &request.options).await?;

            self.operation.statistics.specialized_systems += 1;
            self.operation.statistics.specialized_records += outcome.records;
            self.log(
                LogLevel::Info,
                Some(phase),
                format!("{}: {}", request.name, outcome.message),
                Some(json!({"records": outcome.records})),
            );
            self.publish(phase, phase.progress_at((i + 1) as f64 / total as f64), format!("{} cloned", request.name));
        }
        Ok(())
    }

    async fn post_clone_phase(&mut self, target: &GuardedDriver) -> Result<(), AppError> {
        let phase = ClonePhase::PostClone;
        let target = self.pausable(target);
        let schema = self.schema()?;
        let rebuild_indexes = self.operation.options.rebuild_indexes;

        let mut statements = Vec::new();
        let mut sequences = 0;
        for table in &schema.tables {
            let quoted = table.table_ref().quoted();
            for column in table.columns.iter().filter(|c| c.sequence_name().is_some()) {
                statements.push(format!(
                    "SELECT setval(pg_get_serial_sequence({}, {}), COALESCE((SELECT MAX({}) FROM {}), 0) + 1, false)",
                    quote_literal(&quoted),
                    quote_literal(&column.name),
                    quote_ident(&column.name),
                    quoted
                ));
                sequences += 1;
            }
            if rebuild_indexes {
                statements.push(format!("REINDEX TABLE {}", quoted));
            }
            statements.push(format!("ANALYZE {}", quoted));
        }

        let total = statements.len();
        for (i, sql) in statements.iter().enumerate() {
            self.pause_point(phase).await;
            target.execute(sql).await?;
            self.publish(phase, phase.progress_at((i + 1) as f64 / total as f64), "Post-clone setup");
        }

        self.operation.statistics.sequences_reset = sequences;
        self.log(
            LogLevel::Info,
            Some(phase),
            format!("Reset {} sequences, analyzed {} tables", sequences, schema.tables.len()),
            None,
        );
        Ok(())
    }

    async fn validation_phase(&mut self, target: &GuardedDriver) -> Result<(), AppError> {
        let phase = ClonePhase::Validation;
        let schema = self.schema()?;
        let collected = self
            .orchestrator
            .collector
            .collect(self.target, &self.operation.options.collect)
            .await?;

        let diff = SchemaComparator::compare(&schema, &collected, &ComparisonOptions::default())?;
        if let Some(first) = diff.differences.first() {
            return Err(AppError::OperationFailed(format!(
                "final validation found {} schema differences (first: {} {} {})",
                diff.differences.len(),
                first.action.as_str(),
                first.object_type,
                first.key
            )));
        }
        self.publish(phase, phase.progress_at(0.5), "Target schema matches source");

        let mut mismatches = Vec::new();
        for (table, expected) in &self.operation.statistics.table_counts {
            let actual = target.count_rows(&TableRef::parse(table)).await?;
            if actual != *expected {
                mismatches.push(format!("{} has {} rows, expected {}", table, actual, expected));
            }
        }
        if !mismatches.is_empty() {
            return Err(AppError::OperationFailed(format!(
                "final validation: {}",
                mismatches.join("; ")
            )));
        }

        self.log(LogLevel::Info, Some(phase), "Final validation passed", None);
        Ok(())
    }
}
