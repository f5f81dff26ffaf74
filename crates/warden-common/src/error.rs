//! Centralized error types for warden.
//!
//! The engine raises one closed sum type; the HTTP layer is the sole
//! translator to the wire envelope `{"errorCode", "errorMessage",
//! "errorData"?}` defined by the U2F validation protocol.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

use crate::models::device::DeviceDescriptor;

/// Core application error type used across all warden services.
#[derive(Debug, thiserror::Error)]
pub enum WardenError {
    /// Malformed input, unknown transaction, failed U2F verification.
    #[error("{0}")]
    BadInput(String),

    /// The user has no devices that could complete a sign ceremony.
    #[error("{message}")]
    NoEligibleDevices {
        message: String,
        descriptors: Vec<DeviceDescriptor>,
    },

    /// Counter regression, or a ceremony against a latched device.
    #[error("{message}")]
    DeviceCompromised {
        message: String,
        descriptor: Box<DeviceDescriptor>,
    },

    #[error("{resource} not found")]
    NotFound { resource: String },

    // === Infrastructure errors ===
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Cache error: {0}")]
    Cache(#[from] redis::RedisError),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

/// JSON error envelope sent to relying-party clients.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ErrorBody {
    error_code: i32,
    error_message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    error_data: Option<serde_json::Value>,
}

impl WardenError {
    /// Protocol error code (`errorCode` in the envelope).
    pub fn error_code(&self) -> i32 {
        match self {
            Self::BadInput(_) => 10,
            Self::NoEligibleDevices { .. } => 11,
            Self::DeviceCompromised { .. } => 12,
            Self::NotFound { .. } => 404,
            Self::Database(_) | Self::Cache(_) | Self::Internal(_) => -1,
        }
    }

    /// Map error to HTTP status code.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::BadInput(_)
            | Self::NoEligibleDevices { .. }
            | Self::DeviceCompromised { .. } => StatusCode::BAD_REQUEST,
            Self::NotFound { .. } => StatusCode::NOT_FOUND,
            Self::Database(_) | Self::Cache(_) | Self::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    fn error_data(&self) -> Option<serde_json::Value> {
        match self {
            Self::NoEligibleDevices { descriptors, .. } => {
                serde_json::to_value(descriptors).ok()
            }
            Self::DeviceCompromised { descriptor, .. } => {
                serde_json::to_value(descriptor).ok()
            }
            _ => None,
        }
    }
}

impl IntoResponse for WardenError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        // Don't leak internal details to clients
        let message = match &self {
            WardenError::Database(e) => {
                tracing::error!("Database error: {e}");
                "An internal error occurred".to_string()
            }
            WardenError::Cache(e) => {
                tracing::error!("Cache error: {e}");
                "An internal error occurred".to_string()
            }
            WardenError::Internal(e) => {
                tracing::error!("Internal error: {e:#}");
                "An internal error occurred".to_string()
            }
            other => other.to_string(),
        };

        let body = ErrorBody {
            error_code: self.error_code(),
            error_message: message,
            error_data: self.error_data(),
        };

        (status, axum::Json(body)).into_response()
    }
}

/// Derived-validation failures are input errors. Only the first complaint
/// per field is reported, fields in stable order, so the message stays one
/// line no matter how many rules a field trips.
impl From<validator::ValidationErrors> for WardenError {
    fn from(errors: validator::ValidationErrors) -> Self {
        let fields = errors.field_errors();
        let mut names: Vec<_> = fields.keys().copied().collect();
        names.sort_unstable();
        let detail: Vec<String> = names
            .iter()
            .filter_map(|name| {
                let first = fields.get(name)?.first()?;
                Some(match &first.message {
                    Some(message) => message.to_string(),
                    None => format!("invalid value for '{name}'"),
                })
            })
            .collect();
        WardenError::BadInput(detail.join("; "))
    }
}

/// Convenience type alias for Results using WardenError.
pub type WardenResult<T> = Result<T, WardenError>;
