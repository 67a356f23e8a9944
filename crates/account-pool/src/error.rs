//! Error types for pool operations

/// Errors from pool operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// No usable account could be loaded. Fatal for the request, not the process.
    #[error("account pool initialization failed: {0}")]
    Initialization(String),
}

/// Result alias for pool operations.
pub type Result<T> = std::result::Result<T, Error>;
