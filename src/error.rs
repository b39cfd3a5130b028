//! Error handling module
//!
//! Provides unified error types and handling for the entire application.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;
use tracing::error;

/// Application-wide error type
#[derive(Error, Debug)]
pub enum AppError {
    /// Safety guard violation. Always fatal to the operation, never retried.
    #[error("Production access denied: {0}")]
    ProductionAccess(String),

    /// Pre-flight environment configuration is invalid.
    #[error("Environment validation failed: {0}")]
    EnvironmentValidation(String),

    #[error("Schema comparison failed for {object}: {message}")]
    SchemaDiff { object: String, message: String },

    #[error("Migration generation failed for {object}: {message}")]
    MigrationGeneration { object: String, message: String },

    #[error("Backup integrity check failed: {0}")]
    BackupIntegrity(String),

    /// Wraps the underlying failure of a clone phase.
    #[error("Operation failed: {0}")]
    OperationFailed(String),

    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    #[error("Database error: {0}")]
    Database(#[from] tokio_postgres::Error),

    #[error("Pool error: {0}")]
    Pool(#[from] deadpool_postgres::PoolError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl AppError {
    /// Machine-readable code exposed to API clients
    pub fn code(&self) -> &'static str {
        match self {
            AppError::ProductionAccess(_) => "PRODUCTION_ACCESS_DENIED",
            AppError::EnvironmentValidation(_) => "ENVIRONMENT_VALIDATION_ERROR",
            AppError::SchemaDiff { .. } => "SCHEMA_DIFF_ERROR",
            AppError::MigrationGeneration { .. } => "MIGRATION_GENERATION_ERROR",
            AppError::BackupIntegrity(_) => "BACKUP_INTEGRITY_ERROR",
            AppError::OperationFailed(_) => "OPERATION_FAILED",
            AppError::Timeout(_) => "OPERATION_TIMEOUT",
            AppError::Cancelled(_) => "OPERATION_CANCELLED",
            AppError::Database(_) => "DATABASE_ERROR",
            AppError::Pool(_) => "POOL_EXHAUSTED",
            AppError::Io(_) => "IO_ERROR",
            AppError::Serialization(_) => "SERIALIZATION_ERROR",
            AppError::Validation(_) => "VALIDATION_ERROR",
            AppError::NotFound(_) => "NOT_FOUND",
            AppError::Conflict(_) => "CONFLICT",
            AppError::BadRequest(_) => "BAD_REQUEST",
            AppError::Unauthorized(_) => "UNAUTHORIZED",
            AppError::Forbidden(_) => "FORBIDDEN",
            AppError::Internal(_) => "INTERNAL_ERROR",
            AppError::Config(_) => "CONFIG_ERROR",
        }
    }

    /// Safety and validation errors abort before any mutation, so no rollback is needed.
    pub fn is_pre_mutation(&self) -> bool {
        matches!(
            self,
            AppError::ProductionAccess(_) | AppError::EnvironmentValidation(_)
        )
    }
}

/// Error response structure
#[derive(Serialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let code = self.code();
        let (status, message, details) = match &self {
            AppError::ProductionAccess(msg) => (StatusCode::FORBIDDEN, msg.clone(), None),
            AppError::EnvironmentValidation(msg) => {
                (StatusCode::UNPROCESSABLE_ENTITY, msg.clone(), None)
            }
            AppError::SchemaDiff { object, message }
            | AppError::MigrationGeneration { object, message } => (
                StatusCode::UNPROCESSABLE_ENTITY,
                message.clone(),
                Some(object.clone()),
            ),
            AppError::BackupIntegrity(msg) => {
                (StatusCode::UNPROCESSABLE_ENTITY, msg.clone(), None)
            }
            AppError::OperationFailed(msg) => {
                error!("Operation failed: {}", msg);
                (StatusCode::INTERNAL_SERVER_ERROR, msg.clone(), None)
            }
            AppError::Timeout(msg) => (StatusCode::GATEWAY_TIMEOUT, msg.clone(), None),
            AppError::Cancelled(msg) => (StatusCode::CONFLICT, msg.clone(), None),
            AppError::Database(e) => {
                error!("Database error: {:?}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "A database error occurred".to_string(),
                    Some(e.to_string()),
                )
            }
            AppError::Pool(e) => {
                error!("Pool error: {:?}", e);
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    "Database connection pool exhausted".to_string(),
                    Some(e.to_string()),
                )
            }
            AppError::Io(e) => {
                error!("I/O error: {:?}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "A storage error occurred".to_string(),
                    Some(e.to_string()),
                )
            }
            AppError::Serialization(e) => (
                StatusCode::BAD_REQUEST,
                "Malformed document".to_string(),
                Some(e.to_string()),
            ),
            AppError::Validation(msg) | AppError::BadRequest(msg) => {
                (StatusCode::BAD_REQUEST, msg.clone(), None)
            }
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone(), None),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, msg.clone(), None),
            AppError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg.clone(), None),
            AppError::Forbidden(msg) => (StatusCode::FORBIDDEN, msg.clone(), None),
            AppError::Internal(msg) => {
                error!("Internal error: {}", msg);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "An internal error occurred".to_string(),
                    Some(msg.clone()),
                )
            }
            AppError::Config(msg) => {
                error!("Configuration error: {}", msg);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "A configuration error occurred".to_string(),
                    Some(msg.clone()),
                )
            }
        };

        let body = Json(ErrorResponse {
            success: false,
            message,
            error: details,
            code: Some(code.to_string()),
        });

        (status, body).into_response()
    }
}

/// Result type alias for API handlers
pub type ApiResult<T> = Result<T, AppError>;

/// Helper function to create a validation error
pub fn validation_error(msg: impl Into<String>) -> AppError {
    AppError::Validation(msg.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_production_access_maps_to_forbidden() {
        let response = AppError::ProductionAccess("prod".into()).into_response();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[test]
    fn test_pre_mutation_classification() {
        assert!(AppError::ProductionAccess("x".into()).is_pre_mutation());
        assert!(AppError::EnvironmentValidation("x".into()).is_pre_mutation());
        assert!(!AppError::OperationFailed("x".into()).is_pre_mutation());
    }
}
