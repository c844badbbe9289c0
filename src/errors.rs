//! # Error Handling
//!
//! Parse and operator-compile problems never surface as errors: they fall back to defaults and
//! are logged at debug level. What remains are the failures a handler can hit while talking to
//! the store or resolving configuration, represented by [`QueryError`]:
//!
//! - Returns appropriate HTTP status codes
//! - Sends sanitized, user-friendly error messages
//! - Logs store internals through `tracing` instead of sending them to clients
//!
//! ## Usage
//!
//! ```rust,ignore
//! use docfilter::QueryError;
//!
//! async fn show_user(query: Query) -> Result<Json<Document>, QueryError> {
//!     let user = handler
//!         .find_one(&mut query, FindOneOptions::default())
//!         .await?
//!         .ok_or_else(|| QueryError::not_found("User", None))?;
//!     Ok(Json(user))
//! }
//! ```

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use std::fmt;

use crate::core::store::StoreError;

/// A per-field validation problem reported by the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldError {
    pub path: String,
    pub message: String,
}

impl FieldError {
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

/// Error type for query handling with sanitized responses
#[derive(Debug)]
pub enum QueryError {
    /// 404 Not Found - Document or history entry doesn't exist
    NotFound {
        /// Resource type (e.g., "Document", "History")
        resource: String,
        /// Optional ID that wasn't found
        id: Option<String>,
    },

    /// 400 Bad Request - Invalid input, optionally with per-field errors
    BadRequest {
        message: String,
        errors: Vec<FieldError>,
    },

    /// 409 Conflict - Duplicate key
    Conflict {
        message: String,
        detail: Option<String>,
    },

    /// 501 Not Implemented - Missing configuration (e.g. an unknown sub-document)
    NotImplemented {
        message: String,
        detail: Option<String>,
    },

    /// 500 Internal Server Error - Store error (details logged, not exposed)
    Store {
        message: String,
        internal: StoreError,
    },

    /// 500 Internal Server Error - Generic internal error
    Internal {
        message: String,
        internal: Option<String>,
    },
}

impl QueryError {
    pub fn not_found(resource: impl Into<String>, id: Option<String>) -> Self {
        Self::NotFound {
            resource: resource.into(),
            id,
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest {
            message: message.into(),
            errors: Vec::new(),
        }
    }

    /// 400 with the fields that failed validation.
    pub fn validation(errors: Vec<FieldError>) -> Self {
        Self::BadRequest {
            message: "Validation failed".to_string(),
            errors,
        }
    }

    pub fn conflict(message: impl Into<String>, detail: Option<String>) -> Self {
        Self::Conflict {
            message: message.into(),
            detail,
        }
    }

    pub fn not_implemented(message: impl Into<String>, detail: Option<String>) -> Self {
        Self::NotImplemented {
            message: message.into(),
            detail,
        }
    }

    /// The sub-document has no entry in the configured `subs`.
    #[must_use]
    pub fn missing_subdocument() -> Self {
        Self::not_implemented(
            "Subdocument not found",
            Some("Missing options for subdocument".to_string()),
        )
    }

    /// Create a 500 error from a store error; the details are logged, never sent.
    #[must_use]
    pub fn store(err: StoreError) -> Self {
        Self::Store {
            message: "Database error".to_string(),
            internal: err,
        }
    }

    pub fn internal(message: impl Into<String>, internal: Option<String>) -> Self {
        Self::Internal {
            message: message.into(),
            internal,
        }
    }

    /// Get the HTTP status code for this error
    #[must_use]
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::NotFound { .. } => StatusCode::NOT_FOUND,
            Self::BadRequest { .. } => StatusCode::BAD_REQUEST,
            Self::Conflict { .. } => StatusCode::CONFLICT,
            Self::NotImplemented { .. } => StatusCode::NOT_IMPLEMENTED,
            Self::Store { .. } | Self::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the user-facing error message (sanitized)
    #[must_use]
    pub fn user_message(&self) -> String {
        match self {
            Self::NotFound { resource, id } => match id {
                Some(id) => format!("{resource} with ID '{id}' not found"),
                None => format!("{resource} not found"),
            },
            Self::BadRequest { message, .. }
            | Self::Conflict { message, .. }
            | Self::NotImplemented { message, .. }
            | Self::Store { message, .. }
            | Self::Internal { message, .. } => message.clone(),
        }
    }

    /// User-facing detail, if any.
    #[must_use]
    pub fn detail(&self) -> Option<&str> {
        match self {
            Self::Conflict { detail, .. } | Self::NotImplemented { detail, .. } => {
                detail.as_deref()
            }
            _ => None,
        }
    }

    fn log_internal(&self) {
        match self {
            Self::Store { internal, .. } => {
                tracing::error!(error = ?internal, "Store error occurred");
            }
            Self::Internal {
                internal: Some(details),
                ..
            } => {
                tracing::error!(details = %details, "Internal error occurred");
            }
            _ => {
                tracing::debug!(
                    error = %self.user_message(),
                    status = %self.status_code(),
                    "Query error"
                );
            }
        }
    }
}

/// Error response sent to users (sanitized)
#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    errors: Vec<FieldError>,
}

impl IntoResponse for QueryError {
    fn into_response(self) -> Response {
        self.log_internal();

        let status = self.status_code();
        let response = ErrorResponse {
            error: self.user_message(),
            detail: self.detail().map(ToString::to_string),
            errors: match self {
                Self::BadRequest { errors, .. } => errors,
                _ => Vec::new(),
            },
        };

        (status, Json(response)).into_response()
    }
}

impl fmt::Display for QueryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.user_message())
    }
}

impl std::error::Error for QueryError {}

/// Convert a store error to a `QueryError`
///
/// - `StoreError::DuplicateKey` → 409 Conflict ("Duplicate document")
/// - `StoreError::Validation` → 400 Bad Request with the per-field errors
/// - `StoreError::Other` → 500 Internal Server Error (logged, sanitized for users)
impl From<StoreError> for QueryError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::DuplicateKey(detail) => {
                Self::conflict("Duplicate document", Some(detail))
            }
            StoreError::Validation(errors) => Self::validation(errors),
            other @ StoreError::Other(_) => Self::store(other),
        }
    }
}
