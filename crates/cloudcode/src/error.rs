//! Error types for Cloud Code operations

/// Errors from token refresh, API calls and the account store.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("cloud code returned {status}: {body}")]
    Upstream { status: u16, body: String },

    #[error("invalid credentials: {0}")]
    InvalidCredentials(String),

    #[error("account file parse error: {0}")]
    CredentialParse(String),

    #[error("duplicate account in store: {0}")]
    DuplicateAccount(String),

    #[error("I/O error: {0}")]
    Io(String),
}

/// Result alias for Cloud Code operations.
pub type Result<T> = std::result::Result<T, Error>;

impl From<Error> for provider::UpstreamError {
    fn from(err: Error) -> Self {
        match err {
            Error::Http(message) => provider::UpstreamError::transport(message),
            Error::Upstream { status, body } => provider::UpstreamError::http(status, body),
            // A rejected refresh token surfaces as a 401 without a body so the
            // classifier reports it as an authentication failure.
            Error::InvalidCredentials(message) => provider::UpstreamError {
                status: Some(401),
                body: None,
                message,
            },
            other => provider::UpstreamError::transport(other.to_string()),
        }
    }
}
