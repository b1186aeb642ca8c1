use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Invalid {field}: {reason}")]
    InvalidIdentifier { field: &'static str, reason: String },

    #[error("Invalid {field}: {reason}")]
    InvalidInput { field: &'static str, reason: String },

    #[error("{resource} not found: {id}")]
    NotFound { resource: &'static str, id: String },

    #[error("Request body too large (limit {limit} bytes)")]
    PayloadTooLarge { limit: usize },

    #[error("Capture store unavailable")]
    StoreUnavailable,
}

impl AppError {
    pub fn invalid_identifier(field: &'static str, reason: impl Into<String>) -> Self {
        AppError::InvalidIdentifier {
            field,
            reason: reason.into(),
        }
    }

    pub fn invalid_input(field: &'static str, reason: impl Into<String>) -> Self {
        AppError::InvalidInput {
            field,
            reason: reason.into(),
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::InvalidIdentifier { .. } | AppError::InvalidInput { .. } => {
                StatusCode::BAD_REQUEST
            }
            AppError::NotFound { .. } => StatusCode::NOT_FOUND,
            AppError::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            AppError::StoreUnavailable => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let (error_message, field, reason) = match &self {
            AppError::InvalidIdentifier { field, reason } => {
                ("Invalid identifier", Some(*field), Some(reason.clone()))
            }
            AppError::InvalidInput { field, reason } => {
                ("Invalid input", Some(*field), Some(reason.clone()))
            }
            AppError::NotFound { resource, id } => (
                "Resource not found",
                Some(*resource),
                Some(format!("no {resource} with id '{id}'")),
            ),
            AppError::PayloadTooLarge { limit } => (
                "Request body too large",
                Some("body"),
                Some(format!("body exceeds {limit} bytes")),
            ),
            AppError::StoreUnavailable => ("Capture store unavailable", None, None),
        };

        tracing::warn!("Error occurred: {}", self);

        let body = Json(json!({
            "error": error_message,
            "status": status.as_u16(),
            "field": field,
            "reason": reason,
            "retryable": matches!(self, AppError::StoreUnavailable),
        }));

        (status, body).into_response()
    }
}
