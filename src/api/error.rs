//! API errors and their JSON bodies.

use axum::{
    extract::rejection::JsonRejection,
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::client::ClientError;
use crate::controller::validation::ValidationError;

pub type Result<T> = std::result::Result<T, ApiError>;

/// Error returned by an API handler
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{message}")]
    BadRequest {
        message: String,
        reason: &'static str,
    },

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    Forbidden(String),

    #[error("cluster unavailable: {0}")]
    Unavailable(String),
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::BadRequest { .. } => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApiError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    pub fn reason(&self) -> &'static str {
        match self {
            ApiError::BadRequest { reason, .. } => reason,
            ApiError::NotFound(_) => "NotFound",
            ApiError::Conflict(_) => "AlreadyExists",
            ApiError::Forbidden(_) => "Forbidden",
            ApiError::Unavailable(_) => "Unavailable",
        }
    }
}

/// JSON body of every error response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    pub reason: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: self.to_string(),
            reason: self.reason().to_string(),
        };
        (self.status_code(), Json(body)).into_response()
    }
}

impl From<ValidationError> for ApiError {
    fn from(err: ValidationError) -> Self {
        ApiError::BadRequest {
            message: err.to_string(),
            reason: err.reason(),
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(err: JsonRejection) -> Self {
        ApiError::BadRequest {
            message: err.body_text(),
            reason: "InvalidBody",
        }
    }
}

impl From<ClientError> for ApiError {
    fn from(err: ClientError) -> Self {
        match err {
            ClientError::NotFound(m) => ApiError::NotFound(m),
            ClientError::AlreadyExists(m) | ClientError::Conflict(m) => ApiError::Conflict(m),
            ClientError::Unavailable(m) => ApiError::Unavailable(m),
            ClientError::Forbidden(m) => ApiError::Forbidden(m),
            ClientError::Invalid(m) => ApiError::BadRequest {
                message: m,
                reason: "Invalid",
            },
        }
    }
}

impl From<tokio::time::error::Elapsed> for ApiError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        ApiError::Unavailable("cluster call timed out".to_string())
    }
}
