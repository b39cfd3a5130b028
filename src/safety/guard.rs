//! Production Safety Guard
//!
//! Every read or write that crosses an environment boundary passes through
//! one explicitly constructed guard instance. Classification is
//! over-inclusive: any single production signal makes an environment
//! production.

use crate::config::CloneConfig;
use crate::environment::{ConnectionParams, Environment, EnvironmentType};
use crate::error::AppError;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use tracing::warn;
use uuid::Uuid;

/// Independent rules that can mark an environment as production
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ProductionSignal {
    /// `type = production`
    DeclaredType,
    /// `isProduction = true`
    ExplicitFlag,
    /// Connection host or database matches a production pattern
    ConnectionPattern,
    /// Display name contains a production marker
    NameMarker,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Classification {
    pub environment_id: Uuid,
    pub declared_type: EnvironmentType,
    pub effective_type: EnvironmentType,
    pub signals: Vec<ProductionSignal>,
}

impl Classification {
    pub fn is_production(&self) -> bool {
        self.effective_type == EnvironmentType::Production
    }
}

/// What an operation intends to do to an environment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Read,
    SchemaChange,
    DataWrite,
    /// Backups are only ever taken of clone targets
    Backup,
    Restore,
    Delete,
}

impl OperationKind {
    pub fn is_write(&self) -> bool {
        !matches!(self, OperationKind::Read)
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OperationKind::Read => "read",
            OperationKind::SchemaChange => "schema_change",
            OperationKind::DataWrite => "data_write",
            OperationKind::Backup => "backup",
            OperationKind::Restore => "restore",
            OperationKind::Delete => "delete",
        };
        f.write_str(s)
    }
}

/// Structured record of a refused access
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityAlert {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub environment_id: Uuid,
    pub environment_name: String,
    pub operation: String,
    pub reason: String,
    pub signals: Vec<ProductionSignal>,
}

pub struct ProductionSafetyGuard {
    host_patterns: Vec<Regex>,
    name_markers: Vec<Regex>,
    retention: usize,
    alerts: Mutex<VecDeque<SecurityAlert>>,
}

/// Case-insensitive substring match, so `billingProd` and `prodsql01` both count
fn marker_regex(marker: &str) -> Result<Regex, AppError> {
    Regex::new(&format!("(?i){}", regex::escape(marker)))
        .map_err(|e| AppError::Config(format!("invalid production pattern '{}': {}", marker, e)))
}

impl ProductionSafetyGuard {
    pub fn new(config: &CloneConfig) -> Result<Self, AppError> {
        let host_patterns = config
            .production_host_patterns
            .iter()
            .map(|p| marker_regex(p))
            .collect::<Result<Vec<_>, _>>()?;
        let name_markers = config
            .production_name_markers
            .iter()
            .map(|p| marker_regex(p))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            host_patterns,
            name_markers,
            retention: config.alert_retention.max(1),
            alerts: Mutex::new(VecDeque::new()),
        })
    }

    /// Effective type plus every production signal that fired
    pub fn classify(&self, env: &Environment) -> Classification {
        let mut signals = Vec::new();

        if env.environment_type == EnvironmentType::Production {
            signals.push(ProductionSignal::DeclaredType);
        }
        if env.is_production {
            signals.push(ProductionSignal::ExplicitFlag);
        }
        if self.connection_matches(&env.connection_ref) {
            signals.push(ProductionSignal::ConnectionPattern);
        }
        if self.name_markers.iter().any(|re| re.is_match(&env.name)) {
            signals.push(ProductionSignal::NameMarker);
        }

        Classification {
            environment_id: env.id,
            declared_type: env.environment_type,
            effective_type: if signals.is_empty() {
                env.environment_type
            } else {
                EnvironmentType::Production
            },
            signals,
        }
    }

    fn connection_matches(&self, connection_ref: &str) -> bool {
        let targets = match ConnectionParams::from_connection_string(connection_ref) {
            Ok(params) => vec![params.host, params.database],
            // Opaque references are matched as a whole
            Err(_) => vec![connection_ref.to_string()],
        };
        targets
            .iter()
            .any(|t| self.host_patterns.iter().any(|re| re.is_match(t)))
    }

    /// Refuse any write to an environment classified as production
    pub fn enforce_read_only(&self, env: &Environment, operation: OperationKind) -> Result<(), AppError> {
        if !operation.is_write() {
            return Ok(());
        }
        let classification = self.classify(env);
        if classification.is_production() {
            return Err(self.refuse(
                env,
                &operation.to_string(),
                format!("{} refused: environment '{}' is production", operation, env.name),
                classification.signals,
            ));
        }
        Ok(())
    }

    /// A production source must explicitly assert `allowWrites = false`
    pub fn validate_clone_source(&self, env: &Environment) -> Result<Classification, AppError> {
        self.validate_environment(env)?;
        let classification = self.classify(env);
        if classification.is_production() && env.allow_writes != Some(false) {
            return Err(self.refuse(
                env,
                "clone_source",
                format!(
                    "production source '{}' must explicitly set allowWrites=false",
                    env.name
                ),
                classification.signals,
            ));
        }
        Ok(classification)
    }

    /// Production can never be a clone target
    pub fn validate_clone_target(&self, env: &Environment) -> Result<Classification, AppError> {
        let classification = self.classify(env);
        if classification.is_production() {
            return Err(self.refuse(
                env,
                "clone_target",
                format!("environment '{}' is production and can never be a clone target", env.name),
                classification.signals,
            ));
        }
        self.validate_environment(env)?;
        Ok(classification)
    }

    /// Configuration pre-flight
    pub fn validate_environment(&self, env: &Environment) -> Result<(), AppError> {
        let problem = if env.name.trim().is_empty() {
            Some("environment name must not be empty".to_string())
        } else if env.connection_ref.trim().is_empty() {
            Some(format!("environment '{}' has no connection reference", env.name))
        } else if env.environment_type == EnvironmentType::Production && env.allow_writes == Some(true) {
            Some(format!(
                "production environment '{}' cannot set allowWrites=true",
                env.name
            ))
        } else {
            None
        };

        match problem {
            Some(reason) => {
                let signals = self.classify(env).signals;
                self.record_alert(env, "validate_environment", &reason, signals);
                Err(AppError::EnvironmentValidation(reason))
            }
            None => Ok(()),
        }
    }

    /// Newest first
    pub fn recent_alerts(&self, limit: usize) -> Vec<SecurityAlert> {
        self.alerts.lock().iter().rev().take(limit).cloned().collect()
    }

    fn refuse(
        &self,
        env: &Environment,
        operation: &str,
        reason: String,
        signals: Vec<ProductionSignal>,
    ) -> AppError {
        self.record_alert(env, operation, &reason, signals);
        AppError::ProductionAccess(reason)
    }

    fn record_alert(&self, env: &Environment, operation: &str, reason: &str, signals: Vec<ProductionSignal>) {
        warn!(
            target: "envclone::security",
            environment_id = %env.id,
            environment = %env.name,
            operation = operation,
            signals = ?signals,
            "🚨 Security alert: {}",
            reason
        );

        let alert = SecurityAlert {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            environment_id: env.id,
            environment_name: env.name.clone(),
            operation: operation.to_string(),
            reason: reason.to_string(),
            signals,
        };

        let mut alerts = self.alerts.lock();
        alerts.push_back(alert);
        while alerts.len() > self.retention {
            alerts.pop_front();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn guard() -> ProductionSafetyGuard {
        ProductionSafetyGuard::new(&CloneConfig::default()).unwrap()
    }

    /// Environment with exactly the signals selected by the low four bits of `mask`
    fn env_with_signals(mask: u8) -> Environment {
        let environment_type = if mask & 1 != 0 {
            EnvironmentType::Production
        } else {
            EnvironmentType::Test
        };
        let host = if mask & 4 != 0 { "db-prod.internal" } else { "db-qa.internal" };
        let name = if mask & 8 != 0 { "billing live" } else { "billing staging" };

        Environment::new(name, environment_type, format!("postgres://app:secret@{}:5432/billing", host))
            .with_production_flag(mask & 2 != 0)
            .with_allow_writes(Some(false))
    }

    #[test]
    fn test_every_signal_combination_blocks_clone_target() {
        let guard = guard();
        for mask in 0u8..16 {
            let env = env_with_signals(mask);
            let result = guard.validate_clone_target(&env);
            if mask == 0 {
                assert!(result.is_ok(), "no signals should be allowed");
            } else {
                assert!(
                    matches!(result, Err(AppError::ProductionAccess(_))),
                    "mask {:04b} must be refused",
                    mask
                );
                assert_eq!(guard.classify(&env).signals.len(), mask.count_ones() as usize);
            }
        }
    }

    #[test]
    fn test_single_signal_is_enough() {
        let guard = guard();
        let env = Environment::new("analytics", EnvironmentType::Test, "postgres://app@prod01.db/analytics");
        let classification = guard.classify(&env);
        assert!(classification.is_production());
        assert_eq!(classification.signals, vec![ProductionSignal::ConnectionPattern]);
    }

    #[test]
    fn test_markers_embedded_in_words_are_production() {
        let guard = guard();
        let cases = [
            Environment::new("ProductionDB", EnvironmentType::Test, "postgres://app@db-a.corp/app"),
            Environment::new("billingProd", EnvironmentType::Test, "postgres://app@db-b.corp/app"),
            Environment::new("reporting", EnvironmentType::Test, "postgres://app@prodsql01.corp/app"),
            Environment::new("shop", EnvironmentType::Test, "postgres://app@db-c.corp/liveshop"),
        ];

        for env in cases {
            let classification = guard.classify(&env);
            assert!(classification.is_production(), "{} should be production", env.name);
            assert!(matches!(
                guard.validate_clone_target(&env),
                Err(AppError::ProductionAccess(_))
            ));
        }
    }

    #[test]
    fn test_unmarked_environment_is_not_production() {
        let guard = guard();
        let env = Environment::new("catalogue", EnvironmentType::Test, "postgres://app@catalogue.db/catalogue");
        assert!(!guard.classify(&env).is_production());
    }

    #[test]
    fn test_source_requires_asserted_read_only() {
        let guard = guard();
        let unset = Environment::new("main", EnvironmentType::Production, "postgres://app@db/app");
        assert!(matches!(
            guard.validate_clone_source(&unset),
            Err(AppError::ProductionAccess(_))
        ));

        let asserted = unset.clone().with_allow_writes(Some(false));
        assert!(guard.validate_clone_source(&asserted).is_ok());

        let test_env = Environment::new("qa", EnvironmentType::Test, "postgres://app@qa/app");
        assert!(guard.validate_clone_source(&test_env).is_ok());
    }

    #[test]
    fn test_enforce_read_only_allows_reads() {
        let guard = guard();
        let prod = env_with_signals(1);
        assert!(guard.enforce_read_only(&prod, OperationKind::Read).is_ok());
        for op in [
            OperationKind::SchemaChange,
            OperationKind::DataWrite,
            OperationKind::Backup,
            OperationKind::Restore,
            OperationKind::Delete,
        ] {
            assert!(guard.enforce_read_only(&prod, op).is_err());
        }
    }

    #[test]
    fn test_failures_emit_alerts_and_ring_is_bounded() {
        let config = CloneConfig {
            alert_retention: 3,
            ..CloneConfig::default()
        };
        let guard = ProductionSafetyGuard::new(&config).unwrap();
        let prod = env_with_signals(1);

        for _ in 0..5 {
            let _ = guard.validate_clone_target(&prod);
        }
        let alerts = guard.recent_alerts(10);
        assert_eq!(alerts.len(), 3);
        assert_eq!(alerts[0].operation, "clone_target");
        assert!(alerts[0].timestamp >= alerts[2].timestamp);
        assert_eq!(guard.recent_alerts(1).len(), 1);
    }

    #[test]
    fn test_validate_environment_rejects_blank_fields() {
        let guard = guard();
        let blank = Environment::new(" ", EnvironmentType::Local, "postgres://app@localhost/app");
        assert!(matches!(
            guard.validate_environment(&blank),
            Err(AppError::EnvironmentValidation(_))
        ));
        assert_eq!(guard.recent_alerts(10).len(), 1);
    }
}
