//! API error types.
//!
//! Handler failures come in two classes. Rejections carry a message meant
//! for the client (bad input, unknown verb, business rejects) with a 4xx
//! status. Everything else is internal: clients receive a fixed generic
//! message while the real error is logged, so database details never leak.

use axum::http::StatusCode;
use thiserror::Error;
use validana_core::CoreError;
use validana_store::StoreError;

/// Body sent for every internal error.
pub const INTERNAL_ERROR_MESSAGE: &str = "Error occurred during request.";

/// API error type.
#[derive(Debug, Error)]
pub enum ApiError {
    /// A client-caused failure; the message is the response body.
    #[error("{message}")]
    Reject { status: StatusCode, message: String },

    /// An internal failure; logged in full, never shown to clients.
    #[error("internal error: {0}")]
    Internal(String),

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

impl ApiError {
    /// A 400 rejection.
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::Reject {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    /// A 401 rejection.
    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::Reject {
            status: StatusCode::UNAUTHORIZED,
            message: message.into(),
        }
    }

    /// A 422 rejection carrying the processor's diagnostic.
    pub fn unprocessable(message: impl Into<String>) -> Self {
        Self::Reject {
            status: StatusCode::UNPROCESSABLE_ENTITY,
            message: message.into(),
        }
    }

    /// The HTTP status for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Reject { status, .. } => *status,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Store(StoreError::AlreadyExists(_)) => StatusCode::BAD_REQUEST,
            Self::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// The response body for this error. Internal causes are replaced by
    /// the generic message.
    pub fn client_message(&self) -> String {
        match self {
            Self::Reject { message, .. } => message.clone(),
            Self::Internal(_) => INTERNAL_ERROR_MESSAGE.to_string(),
            Self::Store(StoreError::AlreadyExists(what)) => {
                // Duplicate submissions are a client mistake, phrased like one.
                let what = what.strip_prefix("transaction ").unwrap_or(what);
                format!("Transaction with id {what} already exists.")
            }
            Self::Store(_) => INTERNAL_ERROR_MESSAGE.to_string(),
        }
    }

    /// Whether this error is logged at error level (internal class).
    pub fn is_internal(&self) -> bool {
        self.status_code().is_server_error()
    }
}

impl From<CoreError> for ApiError {
    fn from(err: CoreError) -> Self {
        match err {
            // Malformed submissions are the client's fault.
            CoreError::InvalidTransaction(detail) => Self::bad_request(detail),
            CoreError::CacheMissing(key) => Self::Internal(format!("cache key {key} missing")),
            CoreError::CacheRefresh => Self::Internal(err.to_string()),
        }
    }
}

/// Result type for verb handlers.
pub type ApiResult<T> = std::result::Result<T, ApiError>;
