//! Data models and DTOs (Data Transfer Objects)
//!
//! Contains the request/response structures used by the API.

pub mod backup;
pub mod clone;
pub mod environment;
pub mod schema;

// Re-export commonly used types
pub use backup::*;
pub use clone::*;
pub use environment::*;
pub use schema::*;

use serde::Serialize;

/// Generic success response
#[derive(Serialize)]
pub struct SuccessResponse<T: Serialize> {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

impl<T: Serialize> SuccessResponse<T> {
    pub fn with_data(message: impl Into<String>, data: T) -> Self {
        Self {
            success: true,
            message: message.into(),
            data: Some(data),
        }
    }
}

impl SuccessResponse<()> {
    pub fn message_only(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            data: None,
        }
    }
}

/// Struct-level check shared by the two-environment requests
pub(crate) fn distinct_environments(
    source: uuid::Uuid,
    target: uuid::Uuid,
) -> Result<(), validator::ValidationError> {
    if source == target {
        let mut err = validator::ValidationError::new("same_environment");
        err.message = Some("Source and target must be different environments".into());
        return Err(err);
    }
    Ok(())
}
