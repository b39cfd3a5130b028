//! Clone orchestrator
//!
//! Owns the clone workflow: safety checks up front, then the phases in order
//! under the target's write lease, with automatic restore from the pre-clone
//! backup when a phase fails.

use super::anonymize::MaskingAnonymizer;
use super::collaborators::{Anonymizer, DataCloner, DriverDataCloner, ReportSink, SpecializedSystem, TracingReportSink};
use super::control::OperationControl;
use super::phases::CloneRun;
use super::progress::{ProgressSink, ProgressTracker};
use super::subset::SubsetCopySystem;
use super::types::*;
use crate::backup::BackupManager;
use crate::config::CloneConfig;
use crate::driver::EnvironmentConnector;
use crate::environment::Environment;
use crate::error::{validation_error, AppError};
use crate::locks::{EnvironmentLease, EnvironmentLocks};
use crate::schema::SchemaCollector;
use crate::store::{RecordIndex, StateStore};
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;
use validator::Validate;

pub struct CloneOrchestrator {
    pub(super) connector: EnvironmentConnector,
    pub(super) collector: Arc<dyn SchemaCollector>,
    pub(super) backups: Arc<BackupManager>,
    pub(super) operations: RecordIndex<CloneOperation>,
    pub(super) progress: Arc<ProgressTracker>,
    pub(super) data_cloner: Arc<dyn DataCloner>,
    pub(super) anonymizer: Arc<dyn Anonymizer>,
    pub(super) systems: HashMap<String, Arc<dyn SpecializedSystem>>,
    pub(super) report_sinks: Vec<Arc<dyn ReportSink>>,
    pub(super) batch_size: u64,
    pub(super) operation_timeout_ms: u64,
    locks: Arc<EnvironmentLocks>,
    controls: Mutex<HashMap<Uuid, Arc<OperationControl>>>,
}

impl CloneOrchestrator {
    pub fn new(
        config: &CloneConfig,
        connector: EnvironmentConnector,
        collector: Arc<dyn SchemaCollector>,
        backups: Arc<BackupManager>,
        store: Arc<dyn StateStore>,
        locks: Arc<EnvironmentLocks>,
    ) -> Self {
        let batch_size = config.batch_size.max(1) as u64;
        let subset: Arc<dyn SpecializedSystem> = Arc::new(SubsetCopySystem);
        Self {
            connector,
            collector,
            backups,
            operations: RecordIndex::new(store),
            progress: Arc::new(ProgressTracker::default()),
            data_cloner: Arc::new(DriverDataCloner::new(batch_size)),
            anonymizer: Arc::new(MaskingAnonymizer::with_salt(config.anonymization_salt.clone())),
            systems: HashMap::from([(subset.name().to_string(), subset)]),
            report_sinks: vec![Arc::new(TracingReportSink)],
            batch_size,
            operation_timeout_ms: config.operation_timeout_secs.saturating_mul(1_000),
            locks,
            controls: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_data_cloner(mut self, cloner: Arc<dyn DataCloner>) -> Self {
        self.data_cloner = cloner;
        self
    }

    pub fn with_anonymizer(mut self, anonymizer: Arc<dyn Anonymizer>) -> Self {
        self.anonymizer = anonymizer;
        self
    }

    pub fn with_specialized_system(mut self, system: Arc<dyn SpecializedSystem>) -> Self {
        self.systems.insert(system.name().to_string(), system);
        self
    }

    pub fn with_report_sink(mut self, sink: Arc<dyn ReportSink>) -> Self {
        self.report_sinks.push(sink);
        self
    }

    pub fn with_progress_sink(self, sink: Arc<dyn ProgressSink>) -> Self {
        self.progress.add_sink(sink);
        self
    }

    pub fn progress(&self) -> &Arc<ProgressTracker> {
        &self.progress
    }

    /// Safety phase: everything that must hold before anything is touched
    fn preflight(&self, source: &Environment, target: &Environment, options: &CloneOptions) -> Result<(), AppError> {
        let guard = self.connector.guard();
        guard.validate_clone_source(source)?;
        guard.validate_clone_target(target)?;

        if source.id == target.id {
            return Err(AppError::EnvironmentValidation(
                "source and target must be different environments".to_string(),
            ));
        }
        options.validate().map_err(|e| validation_error(e.to_string()))?;
        if options.anonymize_data && options.anonymization_rules.is_empty() {
            return Err(AppError::Validation(
                "anonymizeData is set but no anonymization rules were given".to_string(),
            ));
        }
        for request in &options.specialized_systems {
            let system = self
                .systems
                .get(&request.name)
                .ok_or_else(|| AppError::Validation(format!("Unknown specialized system '{}'", request.name)))?;
            system.validate_options(&request.options)?;
        }
        Ok(())
    }

    async fn register(&self, source: &Environment, target: &Environment, options: CloneOptions) -> Result<(CloneOperation, Arc<OperationControl>), AppError> {
        self.preflight(source, target, &options)?;
        let operation = CloneOperation::new(source.id, target.id, options);
        self.operations.put(&operation).await?;

        let control = Arc::new(OperationControl::new());
        self.controls.lock().insert(operation.id, control.clone());
        info!(
            "🧬 Clone {} registered: {} -> {}",
            operation.id, source.name, target.name
        );
        Ok((operation, control))
    }

    async fn execute(
        &self,
        operation: CloneOperation,
        source: &Environment,
        target: &Environment,
        control: &OperationControl,
        lease: &EnvironmentLease,
    ) -> CloneResult {
        let id = operation.id;
        let result = CloneRun::new(self, operation, source, target, control, lease).run().await;
        self.controls.lock().remove(&id);
        self.progress.forget(id);
        result
    }

    /// Run a clone to completion. Safety failures are returned as errors
    /// before any operation is recorded; later failures land in the result.
    pub async fn clone_environment(
        &self,
        source: &Environment,
        target: &Environment,
        options: CloneOptions,
    ) -> Result<CloneResult, AppError> {
        let (operation, control) = self.register(source, target, options).await?;
        let lease = self.locks.acquire(target.id).await;
        Ok(self.execute(operation, source, target, &control, &lease).await)
    }

    /// Validate, record the pending operation and run it in the background
    pub async fn start_clone(
        self: &Arc<Self>,
        source: Environment,
        target: Environment,
        options: CloneOptions,
    ) -> Result<CloneOperation, AppError> {
        let (operation, control) = self.register(&source, &target, options).await?;

        let this = Arc::clone(self);
        let pending = operation.clone();
        tokio::spawn(async move {
            let lease = this.locks.acquire(target.id).await;
            let result = this.execute(pending, &source, &target, &control, &lease).await;
            info!(
                "Clone {} finished with status {:?} ({} errors)",
                result.operation_id,
                result.status,
                result.errors.len()
            );
        });
        Ok(operation)
    }

    pub async fn get(&self, id: Uuid) -> Result<CloneOperation, AppError> {
        self.operations.require(&id.to_string()).await
    }

    /// Newest first
    pub async fn list(&self) -> Result<Vec<CloneOperation>, AppError> {
        let mut operations = self.operations.list().await?;
        operations.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(operations)
    }

    fn control(&self, id: Uuid) -> Option<Arc<OperationControl>> {
        self.controls.lock().get(&id).cloned()
    }

    async fn running(&self, id: Uuid) -> Result<(CloneOperation, Arc<OperationControl>), AppError> {
        let operation = self.get(id).await?;
        if operation.status.is_terminal() {
            return Err(AppError::Conflict(format!(
                "Clone {} already finished ({:?})",
                id, operation.status
            )));
        }
        let control = self
            .control(id)
            .ok_or_else(|| AppError::Conflict(format!("Clone {} is not running in this process", id)))?;
        Ok((operation, control))
    }

    /// Request cancellation; it takes effect at the next phase boundary
    pub async fn cancel(&self, id: Uuid) -> Result<CloneOperation, AppError> {
        let (operation, control) = self.running(id).await?;
        control.cancel();
        info!("Cancellation requested for clone {}", id);
        Ok(operation)
    }

    pub async fn pause(&self, id: Uuid) -> Result<CloneOperation, AppError> {
        let (operation, control) = self.running(id).await?;
        control.pause();
        info!("Pause requested for clone {}", id);
        Ok(operation)
    }

    pub async fn resume(&self, id: Uuid) -> Result<CloneOperation, AppError> {
        let (operation, control) = self.running(id).await?;
        control.resume();
        info!("Clone {} resumed", id);
        Ok(operation)
    }

    /// Mark operations left unfinished by a previous process as failed
    pub async fn recover_interrupted(&self) -> Result<usize, AppError> {
        let mut recovered = 0;
        for operation in self.operations.list().await? {
            if operation.status.is_terminal() || self.control(operation.id).is_some() {
                continue;
            }
            self.operations
                .update(&operation.id.to_string(), |op| {
                    op.status = CloneStatus::Failed;
                    op.completed_at = Some(Utc::now());
                    op.error = Some("interrupted by service restart".to_string());
                    op.push_log(LogLevel::Error, op.current_phase, "Interrupted by service restart", None);
                })
                .await?;
            warn!("Clone {} was interrupted and is now marked failed", operation.id);
            recovered += 1;
        }
        Ok(recovered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::environment::EnvironmentType;
    use crate::schema::SchemaDefinition;
    use crate::testing::{fixtures, rows, MemoryDriver, TestHarness};
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::time::Duration;

    struct Shop {
        harness: TestHarness,
        orchestrator: Arc<CloneOrchestrator>,
        source: Environment,
        source_db: Arc<MemoryDriver>,
        target: Environment,
        target_db: Arc<MemoryDriver>,
    }

    async fn shop(target_schema: SchemaDefinition) -> Shop {
        let harness = TestHarness::new().await;
        let orchestrator = Arc::new(harness.orchestrator());
        let (source, source_db) = harness.environment("staging", EnvironmentType::Test, fixtures::shop_schema());
        source_db.set_rows("public.customers", rows::customer_rows(3));
        source_db.set_rows("public.orders", rows::order_rows(5, 3));
        let (target, target_db) = harness.environment("dev", EnvironmentType::Development, target_schema);
        Shop {
            harness,
            orchestrator,
            source,
            source_db,
            target,
            target_db,
        }
    }

    fn customers_only() -> SchemaDefinition {
        let mut schema = SchemaDefinition::empty();
        schema.tables.push(fixtures::customers_table());
        schema
    }

    async fn wait_until_terminal(orchestrator: &CloneOrchestrator, id: Uuid) -> CloneOperation {
        for _ in 0..500 {
            let operation = orchestrator.get(id).await.unwrap();
            if operation.status.is_terminal() {
                return operation;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("clone {} did not finish", id);
    }

    #[tokio::test]
    async fn test_clone_copies_schema_and_data() {
        let s = shop(SchemaDefinition::empty()).await;
        let result = s
            .orchestrator
            .clone_environment(&s.source, &s.target, CloneOptions::default())
            .await
            .unwrap();

        assert!(result.success, "{:?}", result.errors);
        assert_eq!(result.status, CloneStatus::Completed);
        assert!(s.target_db.schema().structurally_equal(&fixtures::shop_schema()));
        assert_eq!(s.target_db.rows("public.orders"), rows::order_rows(5, 3));
        assert_eq!(result.statistics.schema_operations, 9);
        assert_eq!(result.statistics.records_cloned, 8);
        assert_eq!(result.statistics.sequences_reset, 2);
        assert!(result.backup_id.is_some());
        assert_eq!(s.source_db.mutation_count(), 0);

        let executed = s.target_db.executed();
        assert!(executed.iter().any(|sql| sql.starts_with("SELECT setval(pg_get_serial_sequence('\"public\".\"orders\"', 'id')")));
        assert!(executed.iter().any(|sql| sql == "ANALYZE \"public\".\"customers\""));

        let operation = s.orchestrator.get(result.operation_id).await.unwrap();
        assert_eq!(operation.progress, 100);
        let phases: Vec<ClonePhase> = operation.timeline.iter().map(|t| t.phase).collect();
        assert_eq!(phases, ClonePhase::ALL[1..].to_vec());
        assert!(operation.timeline.iter().any(|t| t.phase == ClonePhase::Anonymization && t.skipped));
        assert_eq!(result.report.timeline.len(), 6);
    }

    #[tokio::test]
    async fn test_clone_into_production_is_refused_without_touching_either_side() {
        let s = shop(SchemaDefinition::empty()).await;
        let (production, production_db) =
            s.harness
                .environment("main", EnvironmentType::Production, fixtures::shop_schema());

        let err = s
            .orchestrator
            .clone_environment(&s.source, &production, CloneOptions::default())
            .await
            .unwrap_err();

        assert!(matches!(err, AppError::ProductionAccess(_)));
        for (env, db) in [(&s.source, &s.source_db), (&production, &production_db)] {
            assert_eq!(db.mutation_count(), 0);
            assert_eq!(db.row_reads(), 0);
            assert_eq!(s.harness.cluster.open_count(env.id), 0);
            assert_eq!(s.harness.cluster.collect_count(env.id), 0);
        }
        assert!(s.orchestrator.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_data_phase_failure_restores_from_backup() {
        let s = shop(customers_only()).await;
        s.target_db.set_rows("public.customers", rows::customer_rows(1));
        s.target_db.fail_inserts_into("public.orders");

        let result = s
            .orchestrator
            .clone_environment(&s.source, &s.target, CloneOptions::default())
            .await
            .unwrap();

        assert!(!result.success);
        assert_eq!(result.status, CloneStatus::Failed);
        assert_eq!(result.errors.len(), 1);
        assert_eq!(result.errors[0].phase, Some(ClonePhase::Data));
        let backup_id = result.backup_id.unwrap();
        let rollback = result.rollback.clone().unwrap();
        assert!(rollback.attempted && rollback.succeeded);
        assert_eq!(rollback.backup_id, backup_id);

        let operation = s.orchestrator.get(result.operation_id).await.unwrap();
        let restore_log = operation
            .logs
            .iter()
            .find(|l| l.message.starts_with("Restore attempted"))
            .unwrap();
        assert_eq!(restore_log.details, Some(json!({"backupId": backup_id})));

        // the target is back to where it was
        assert!(s.target_db.schema().structurally_equal(&customers_only()));
        assert_eq!(s.target_db.rows("public.customers"), rows::customer_rows(1));

        // a retry plans the same script
        let retry = s
            .orchestrator
            .clone_environment(&s.source, &s.target, CloneOptions::default())
            .await
            .unwrap();
        assert_eq!(
            retry.migration_script.unwrap().id,
            result.migration_script.unwrap().id
        );
    }

    #[tokio::test]
    async fn test_non_reversible_script_without_backup_stops_before_mutation() {
        let mut target_schema = customers_only();
        let mut legacy = fixtures::customers_table();
        legacy.name = "legacy".to_string();
        target_schema.tables.push(legacy);
        let s = shop(target_schema).await;

        let options = CloneOptions {
            create_backup: false,
            ..CloneOptions::default()
        };
        let result = s
            .orchestrator
            .clone_environment(&s.source, &s.target, options)
            .await
            .unwrap();

        assert!(!result.success);
        assert_eq!(result.errors.len(), 1);
        assert_eq!(result.errors[0].code, "ENVIRONMENT_VALIDATION_ERROR");
        assert!(result.rollback.is_none());
        assert_eq!(s.target_db.mutation_count(), 0);
        assert!(result.report.recommendations.iter().any(|r| r.contains("createBackup")));
    }

    #[tokio::test]
    async fn test_anonymization_masks_target_only() {
        let s = shop(SchemaDefinition::empty()).await;
        let options: CloneOptions = serde_json::from_value(json!({
            "anonymizeData": true,
            "anonymizationRules": [
                {"table": "public.customers", "column": "email", "strategy": "email_mask", "mandatory": true},
                {"table": "public.customers", "column": "name", "strategy": "null"},
                {"table": "public.customers", "column": "phone", "strategy": "hash"}
            ]
        }))
        .unwrap();

        let result = s
            .orchestrator
            .clone_environment(&s.source, &s.target, options)
            .await
            .unwrap();

        assert!(result.success, "{:?}", result.errors);
        assert_eq!(result.statistics.records_anonymized, 3);
        assert!(result.warnings.iter().any(|w| w.contains("public.customers.phone")));
        for row in s.target_db.rows("public.customers") {
            assert!(row["email"].as_str().unwrap().starts_with("user_"));
            assert!(row["name"].is_null());
        }
        assert_eq!(s.source_db.rows("public.customers"), rows::customer_rows(3));
    }

    #[tokio::test]
    async fn test_failing_mandatory_rule_fails_the_clone() {
        let s = shop(SchemaDefinition::empty()).await;
        let options: CloneOptions = serde_json::from_value(json!({
            "anonymizeData": true,
            "anonymizationRules": [
                {"table": "public.customers", "column": "name", "strategy": "email_mask", "mandatory": true}
            ]
        }))
        .unwrap();

        let result = s
            .orchestrator
            .clone_environment(&s.source, &s.target, options)
            .await
            .unwrap();

        assert!(!result.success);
        assert_eq!(result.errors[0].phase, Some(ClonePhase::Anonymization));
        assert!(result.rollback.unwrap().succeeded);
        assert!(s.target_db.schema().tables.is_empty());
    }

    #[tokio::test]
    async fn test_subset_copy_without_full_data() {
        let s = shop(SchemaDefinition::empty()).await;
        let options: CloneOptions = serde_json::from_value(json!({
            "includeData": false,
            "specializedSystems": [
                {"name": "subset_copy", "options": {"tables": [{"table": "public.customers", "predicate": "id IN (2, 3)"}]}}
            ]
        }))
        .unwrap();

        let result = s
            .orchestrator
            .clone_environment(&s.source, &s.target, options)
            .await
            .unwrap();

        assert!(result.success, "{:?}", result.errors);
        assert_eq!(result.statistics.specialized_records, 2);
        assert_eq!(s.target_db.rows("public.customers").len(), 2);
        assert!(s.target_db.rows("public.orders").is_empty());
    }

    #[tokio::test]
    async fn test_unknown_specialized_system_is_rejected_up_front() {
        let s = shop(SchemaDefinition::empty()).await;
        let options = CloneOptions {
            specialized_systems: vec![SpecializedSystemRequest {
                name: "ledger".to_string(),
                options: json!({}),
            }],
            ..CloneOptions::default()
        };
        let err = s
            .orchestrator
            .clone_environment(&s.source, &s.target, options)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
        assert_eq!(s.target_db.mutation_count(), 0);
    }

    #[tokio::test]
    async fn test_cancel_is_observed_at_a_phase_boundary() {
        let s = shop(SchemaDefinition::empty()).await;
        s.target_db.set_delay(Duration::from_millis(20));

        let operation = s
            .orchestrator
            .start_clone(s.source.clone(), s.target.clone(), CloneOptions::default())
            .await
            .unwrap();
        assert_eq!(operation.status, CloneStatus::Pending);
        s.orchestrator.cancel(operation.id).await.unwrap();

        let finished = wait_until_terminal(&s.orchestrator, operation.id).await;
        assert_eq!(finished.status, CloneStatus::Cancelled);
        assert!(finished.completed_at.is_some());
        assert!(matches!(
            s.orchestrator.cancel(operation.id).await,
            Err(AppError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn test_pause_holds_the_next_phase_until_resume() {
        let s = shop(SchemaDefinition::empty()).await;
        s.target_db.set_delay(Duration::from_millis(5));

        let operation = s
            .orchestrator
            .start_clone(s.source.clone(), s.target.clone(), CloneOptions::default())
            .await
            .unwrap();
        s.orchestrator.pause(operation.id).await.unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        let paused = s.orchestrator.get(operation.id).await.unwrap();
        assert_eq!(paused.status, CloneStatus::InProgress);
        assert!(paused.logs.iter().any(|l| l.message.starts_with("Paused before")));
        let executed = s.target_db.executed().len();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(s.target_db.executed().len(), executed);

        s.orchestrator.resume(operation.id).await.unwrap();
        let finished = wait_until_terminal(&s.orchestrator, operation.id).await;
        assert_eq!(finished.status, CloneStatus::Completed);
    }

    #[tokio::test]
    async fn test_out_of_range_timeout_is_rejected_up_front() {
        let s = shop(SchemaDefinition::empty()).await;
        let options = CloneOptions {
            operation_timeout_secs: Some(u64::MAX / 10),
            ..CloneOptions::default()
        };

        let result = s
            .orchestrator
            .start_clone(s.source.clone(), s.target.clone(), options)
            .await;
        assert!(matches!(result, Err(AppError::Validation(_))));
        assert!(s.orchestrator.list().await.unwrap().is_empty());
        assert_eq!(s.target_db.mutation_count(), 0);
    }

    #[tokio::test]
    async fn test_pause_holds_migration_operations_mid_phase() {
        let s = shop(SchemaDefinition::empty()).await;
        s.target_db.set_delay(Duration::from_millis(30));
        let options = CloneOptions {
            include_data: false,
            ..CloneOptions::default()
        };

        let operation = s
            .orchestrator
            .start_clone(s.source.clone(), s.target.clone(), options)
            .await
            .unwrap();
        for _ in 0..200 {
            if s.target_db.mutation_count() > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        s.orchestrator.pause(operation.id).await.unwrap();

        // the operation already in flight may still land
        tokio::time::sleep(Duration::from_millis(100)).await;
        let held = s.target_db.mutation_count();
        assert!(held < 9, "{} of 9 migration operations ran before the pause took hold", held);

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(s.target_db.mutation_count(), held);
        let paused = s.orchestrator.get(operation.id).await.unwrap();
        assert_eq!(paused.status, CloneStatus::InProgress);
        assert!(paused.logs.iter().any(|l| l.message.starts_with("Paused during")));

        s.orchestrator.resume(operation.id).await.unwrap();
        let finished = wait_until_terminal(&s.orchestrator, operation.id).await;
        assert_eq!(finished.status, CloneStatus::Completed);
        assert!(s.target_db.schema().structurally_equal(&fixtures::shop_schema()));
    }

    #[tokio::test]
    async fn test_progress_updates_are_monotonic_and_reach_100() {
        let s = shop(SchemaDefinition::empty()).await;
        let mut rx = s.orchestrator.progress().subscribe();

        let result = s
            .orchestrator
            .clone_environment(&s.source, &s.target, CloneOptions::default())
            .await
            .unwrap();
        assert!(result.success);

        let mut observed = Vec::new();
        while let Ok(update) = rx.try_recv() {
            assert_eq!(update.operation_id, result.operation_id);
            observed.push(update.progress);
        }
        assert!(observed.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(observed.last(), Some(&100));
    }

    #[tokio::test]
    async fn test_interrupted_operations_are_marked_failed() {
        let s = shop(SchemaDefinition::empty()).await;
        let mut stale = CloneOperation::new(s.source.id, s.target.id, CloneOptions::default());
        stale.status = CloneStatus::InProgress;
        s.orchestrator.operations.put(&stale).await.unwrap();

        assert_eq!(s.orchestrator.recover_interrupted().await.unwrap(), 1);
        let recovered = s.orchestrator.get(stale.id).await.unwrap();
        assert_eq!(recovered.status, CloneStatus::Failed);
        assert!(recovered.error.unwrap().contains("restart"));
    }
}
