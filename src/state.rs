//! Application state management
//!
//! Contains shared state accessible across all handlers.

use crate::backup::BackupManager;
use crate::clone::CloneOrchestrator;
use crate::config::CloneConfig;
use crate::driver::EnvironmentConnector;
use crate::environment::EnvironmentRegistry;
use crate::locks::EnvironmentLocks;
use crate::safety::ProductionSafetyGuard;
use crate::schema::SchemaCollector;
use crate::store::StateStore;
use std::sync::Arc;

/// Application state shared across all handlers
pub struct AppState {
    /// Registered environments
    pub environments: EnvironmentRegistry,

    /// Production classification, enforcement and the security alert ring
    pub guard: Arc<ProductionSafetyGuard>,

    /// Read-only schema snapshots of environments
    pub collector: Arc<dyn SchemaCollector>,

    /// Backups, restores and granular rollback
    pub backups: Arc<BackupManager>,

    /// Clone workflow
    pub orchestrator: Arc<CloneOrchestrator>,

    /// Secret shared with the identity provider for JWT verification
    pub jwt_secret: String,
}

impl AppState {
    /// Wire the core services over one connector, store and lock table
    pub fn new(
        config: &CloneConfig,
        connector: EnvironmentConnector,
        collector: Arc<dyn SchemaCollector>,
        store: Arc<dyn StateStore>,
        jwt_secret: String,
    ) -> Self {
        let guard = connector.guard().clone();
        let locks = Arc::new(EnvironmentLocks::new());
        let backups = Arc::new(BackupManager::new(
            config,
            connector.clone(),
            collector.clone(),
            store.clone(),
            locks.clone(),
        ));
        let orchestrator = Arc::new(CloneOrchestrator::new(
            config,
            connector,
            collector.clone(),
            backups.clone(),
            store.clone(),
            locks,
        ));

        Self {
            environments: EnvironmentRegistry::new(store, guard.clone()),
            guard,
            collector,
            backups,
            orchestrator,
            jwt_secret,
        }
    }
}

/// Type alias for shared state
pub type SharedState = Arc<AppState>;
