//! Service-specific error types

use std::net::SocketAddr;

use axum::Json;
use axum::extract::rejection::BytesRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use provider::{ClassifiedError, ErrorKind};
use thiserror::Error;

/// Lifecycle errors from `ProxyServer`.
///
/// Per-request failures never propagate as this type; they are rendered
/// through `ApiError`.
#[derive(Error, Debug)]
pub enum Error {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("server is already running on {0}")]
    AlreadyRunning(SocketAddr),
}

/// Result alias using service Error
pub type Result<T> = std::result::Result<T, Error>;

/// Client-visible error: `{type:"error", error:{type, message}}` with the
/// classified status.
#[derive(Debug)]
pub struct ApiError(pub ClassifiedError);

impl ApiError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self(ClassifiedError::new(ErrorKind::Validation, message))
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self(ClassifiedError::new(ErrorKind::NotFound, message))
    }

    /// Pool exhausted or unusable for the request.
    pub fn no_accounts() -> Self {
        Self(ClassifiedError::new(ErrorKind::Upstream, "No accounts available").with_status(503))
    }
}

impl From<ClassifiedError> for ApiError {
    fn from(error: ClassifiedError) -> Self {
        Self(error)
    }
}

impl From<account_pool::Error> for ApiError {
    fn from(error: account_pool::Error) -> Self {
        match error {
            account_pool::Error::Initialization(_) => Self(
                ClassifiedError::new(ErrorKind::Upstream, error.to_string()).with_status(503),
            ),
        }
    }
}

/// Unreadable or oversized request bodies keep the rejection's status.
impl From<BytesRejection> for ApiError {
    fn from(rejection: BytesRejection) -> Self {
        Self(
            ClassifiedError::new(ErrorKind::Validation, rejection.body_text())
                .with_status(rejection.status().as_u16()),
        )
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.0.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(self.0.to_body())).into_response()
    }
}
