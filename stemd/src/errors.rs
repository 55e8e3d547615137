use crate::separator::SeparationError;
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use thiserror::Error as ThisError;

/// Message returned to clients for every failed separation, whatever the cause.
pub const SEPARATION_FAILED_MESSAGE: &str = "Error processing file";

#[derive(ThisError, Debug)]
pub enum Error {
    /// Invalid request data, e.g. a missing or duplicated `file` part
    #[error("{message}")]
    BadRequest { message: String },

    /// Uploaded file exceeds the configured size limit
    #[error("{message}")]
    PayloadTooLarge { message: String },

    /// Separation capacity exhausted
    #[error("{message}")]
    TooManyRequests { message: String },

    /// The external separation tool could not be run or reported failure
    #[error(transparent)]
    Separation(#[from] SeparationError),

    /// Generic internal service error
    #[error("Failed to {operation}")]
    Internal { operation: String },

    /// Unexpected error with full context chain
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// JSON body for every error response.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}

impl Error {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::BadRequest { .. } => StatusCode::BAD_REQUEST,
            Error::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            Error::TooManyRequests { .. } => StatusCode::TOO_MANY_REQUESTS,
            Error::Separation(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Error::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Error::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Returns a user-safe error message, without leaking internal implementation details
    pub fn user_message(&self) -> String {
        match self {
            Error::BadRequest { message } => message.clone(),
            Error::PayloadTooLarge { message } => message.clone(),
            Error::TooManyRequests { message } => message.clone(),
            Error::Separation(_) => SEPARATION_FAILED_MESSAGE.to_string(),
            Error::Internal { .. } => "Internal server error".to_string(),
            Error::Other(_) => "Internal server error".to_string(),
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        // Log full error details for debugging - different log levels based on severity
        match &self {
            Error::Separation(_) => {
                tracing::error!("Error executing separation tool: {:#}", self);
            }
            Error::Internal { .. } | Error::Other(_) => {
                tracing::error!("Internal service error: {:#}", self);
            }
            Error::TooManyRequests { .. } => {
                tracing::warn!("Separation capacity exhausted: {}", self);
            }
            Error::BadRequest { .. } | Error::PayloadTooLarge { .. } => {
                tracing::debug!("Client error: {}", self);
            }
        }

        let body = ErrorBody {
            error: self.user_message(),
        };
        (self.status_code(), Json(body)).into_response()
    }
}

/// Convert filesystem errors raised while persisting uploads
impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Other(anyhow::Error::new(err).context("write uploaded file"))
    }
}

/// Type alias for service operation results
pub type Result<T> = std::result::Result<T, Error>;
