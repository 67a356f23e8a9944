//! Upstream abstraction for the conversational backend
//!
//! Defines the `Upstream` trait that decouples dispatch and the account pool
//! from the concrete backend. The Cloud Code implementation lives in the
//! gateway service; tests substitute scripted implementations.
//!
//! Every failure crossing this seam is an `UpstreamError` with known fields
//! (status, body, message). `classify` turns it into the small taxonomy that
//! drives both the client-visible error and the pool's side effects.

pub mod classify;

pub use classify::{ClassifiedError, ErrorKind, classify, parse_reset_delay};

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;

use bytes::Bytes;
use futures_util::Stream;
use serde::{Deserialize, Serialize};

/// Raw failure from the upstream or the transport in front of it.
///
/// `status` and `body` are present when the upstream answered; a transport
/// failure (connect refused, reset, timeout) carries only `message`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct UpstreamError {
    pub status: Option<u16>,
    pub body: Option<String>,
    pub message: String,
}

impl UpstreamError {
    /// Failure with an upstream HTTP answer attached.
    pub fn http(status: u16, body: impl Into<String>) -> Self {
        let body = body.into();
        Self {
            status: Some(status),
            message: format!("upstream returned {status}"),
            body: Some(body),
        }
    }

    /// Failure below HTTP (connect, TLS, read).
    pub fn transport(message: impl Into<String>) -> Self {
        Self {
            status: None,
            body: None,
            message: message.into(),
        }
    }
}

/// Result alias for upstream operations.
pub type Result<T> = std::result::Result<T, UpstreamError>;

/// Boxed future used by the dyn-compatible trait methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Raw upstream response body delivered incrementally.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;

/// Short-lived bearer token issued for a long-lived credential.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenGrant {
    pub access_token: String,
    /// Seconds until the token expires (delta, not absolute)
    pub expires_in: u64,
}

/// Project binding and subscription tier reported for a token.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProjectInfo {
    pub project_id: Option<String>,
    pub tier: Option<String>,
}

/// Remaining quota for one model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelQuota {
    pub remaining_fraction: Option<f64>,
    pub reset_time: Option<String>,
}

/// Backend the gateway dispatches to.
///
/// Uses `Pin<Box<dyn Future>>` return types so callers can hold `Arc<dyn Upstream>`.
pub trait Upstream: Send + Sync {
    /// Identifier for logging (e.g. "cloudcode")
    fn id(&self) -> &str;

    /// Exchange a long-lived refresh credential for a bearer token.
    fn refresh_access_token<'a>(&'a self, refresh_token: &'a str) -> BoxFuture<'a, Result<TokenGrant>>;

    /// Discover the upstream project and subscription tier for a token.
    fn load_project<'a>(&'a self, access_token: &'a str) -> BoxFuture<'a, Result<ProjectInfo>>;

    /// Per-model quota table visible to a token. The keys double as the
    /// model list exposed on `/v1/models`.
    fn fetch_model_quotas<'a>(
        &'a self,
        access_token: &'a str,
        project_id: Option<&'a str>,
    ) -> BoxFuture<'a, Result<BTreeMap<String, ModelQuota>>>;

    /// Single-payload generation call.
    fn generate<'a>(
        &'a self,
        access_token: &'a str,
        body: &'a serde_json::Value,
    ) -> BoxFuture<'a, Result<serde_json::Value>>;

    /// Incremental generation call. Resolves once the upstream has accepted
    /// the request (2xx); failures before that point are returned as errors
    /// so dispatch can still fall back to another account.
    fn stream_generate<'a>(
        &'a self,
        access_token: &'a str,
        body: &'a serde_json::Value,
    ) -> BoxFuture<'a, Result<ByteStream>>;
}
