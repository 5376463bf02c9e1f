//! Error types for the Shelfkeeper server

use axum::{
    http::{header::RETRY_AFTER, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

/// Name of the partial unique index guarding one open loan per (book, borrower).
pub const OPEN_LOAN_INDEX: &str = "loan_records_one_open_per_borrower";

/// Numeric error codes returned in error bodies
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ErrorCode {
    Success = 0,
    Failure = 1,
    NotAuthorized = 2,
    DbFailure = 3,
    NoSuchData = 4,
    ItemNotAvailable = 5,
    AlreadyBorrowed = 6,
    Forbidden = 7,
    BadValue = 8,
    Duplicate = 9,
    TemporarilyUnavailable = 10,
}

/// Main application error type
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// The book has no copy left to lend.
    #[error("Unavailable: {0}")]
    Unavailable(String),

    /// The borrower already holds an open loan for the book.
    #[error("Duplicate loan: {0}")]
    DuplicateLoan(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    /// Lock timeout, deadlock or lost connectivity. The whole operation may be retried.
    #[error("Temporarily unavailable: {0}")]
    Transient(String),

    #[error("Database error: {0}")]
    Database(#[source] sqlx::Error),

    #[error("Internal server error: {0}")]
    Internal(String),
}

impl AppError {
    /// Whether the caller may retry the failed operation unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(self, AppError::Transient(_))
    }
}

/// SQLSTATE codes the store reports for contention rather than for a real fault.
const TRANSIENT_SQLSTATES: &[&str] = &[
    "55P03", // lock_not_available (lock_timeout)
    "40P01", // deadlock_detected
    "40001", // serialization_failure
    "57014", // query_canceled (statement_timeout)
];

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                AppError::Transient(err.to_string())
            }
            sqlx::Error::Database(db) => {
                let code = db.code();
                if code
                    .as_deref()
                    .map(|c| TRANSIENT_SQLSTATES.contains(&c))
                    .unwrap_or(false)
                {
                    AppError::Transient(db.message().to_string())
                } else if db.is_unique_violation() && db.constraint() == Some(OPEN_LOAN_INDEX) {
                    AppError::DuplicateLoan(
                        "You have already borrowed this book and not yet returned it".to_string(),
                    )
                } else {
                    AppError::Database(err)
                }
            }
            _ => AppError::Database(err),
        }
    }
}

/// Error response body
#[derive(Serialize, utoipa::ToSchema)]
pub struct ErrorResponse {
    pub code: u32,
    pub error: String,
    pub message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            AppError::Authentication(msg) => {
                (StatusCode::UNAUTHORIZED, ErrorCode::NotAuthorized, msg.clone())
            }
            AppError::Forbidden(msg) => (StatusCode::FORBIDDEN, ErrorCode::Forbidden, msg.clone()),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, ErrorCode::NoSuchData, msg.clone()),
            AppError::Unavailable(msg) => {
                (StatusCode::CONFLICT, ErrorCode::ItemNotAvailable, msg.clone())
            }
            AppError::DuplicateLoan(msg) => {
                (StatusCode::CONFLICT, ErrorCode::AlreadyBorrowed, msg.clone())
            }
            AppError::InvalidArgument(msg) => {
                (StatusCode::BAD_REQUEST, ErrorCode::BadValue, msg.clone())
            }
            AppError::Conflict(msg) => (StatusCode::CONFLICT, ErrorCode::Duplicate, msg.clone()),
            AppError::Transient(msg) => {
                tracing::warn!("Transient failure: {}", msg);
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    ErrorCode::TemporarilyUnavailable,
                    "Service temporarily unavailable, retry later".to_string(),
                )
            }
            AppError::Database(e) => {
                tracing::error!("Database error: {:?}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ErrorCode::DbFailure,
                    "Database error".to_string(),
                )
            }
            AppError::Internal(msg) => {
                tracing::error!("Internal error: {}", msg);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ErrorCode::Failure,
                    "Internal server error".to_string(),
                )
            }
        };

        let body = Json(ErrorResponse {
            code: code as u32,
            error: format!("{:?}", code),
            message,
        });

        let mut response = (status, body).into_response();
        if self.is_retryable() {
            response
                .headers_mut()
                .insert(RETRY_AFTER, HeaderValue::from_static("1"));
        }
        response
    }
}

/// Result type alias for application operations
pub type AppResult<T> = Result<T, AppError>;
