//! Error classification for upstream failures
//!
//! Maps a raw `UpstreamError` onto the gateway taxonomy. The classification
//! drives the client-visible error (type + HTTP status) and the pool side
//! effects: `RateLimit` cools the account down for the model,
//! `Authentication` invalidates it, everything else leaves pool state alone.

use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::UpstreamError;

/// Message fragments that identify quota exhaustion when the upstream gave
/// no structured error body.
const QUOTA_PATTERNS: &[&str] = &[
    "quota",
    "rate limit",
    "rate-limit",
    "resource_exhausted",
    "resource has been exhausted",
    "usage limit",
    "limit exceeded",
    "exhausted your capacity",
];

/// Error taxonomy shared by the HTTP surface and the dispatch loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    #[serde(rename = "authentication_error")]
    Authentication,
    #[serde(rename = "rate_limit_error")]
    RateLimit,
    #[serde(rename = "upstream_error")]
    Upstream,
    #[serde(rename = "validation_error")]
    Validation,
    #[serde(rename = "not_found_error")]
    NotFound,
}

impl ErrorKind {
    /// Wire name used in `{type:"error", error:{type: ...}}` bodies.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Authentication => "authentication_error",
            ErrorKind::RateLimit => "rate_limit_error",
            ErrorKind::Upstream => "upstream_error",
            ErrorKind::Validation => "validation_error",
            ErrorKind::NotFound => "not_found_error",
        }
    }

    /// Default HTTP status for the kind.
    pub fn default_status(&self) -> u16 {
        match self {
            ErrorKind::Authentication => 401,
            ErrorKind::RateLimit => 429,
            ErrorKind::Upstream => 500,
            ErrorKind::Validation => 400,
            ErrorKind::NotFound => 404,
        }
    }

    /// Whether another account may succeed where this one failed.
    ///
    /// Authentication failures are final for the account that hit them but
    /// not for the pool, so they are retried on a different account.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorKind::RateLimit | ErrorKind::Upstream | ErrorKind::Authentication
        )
    }

    /// Parse a declared wire type. Unknown upstream types (`api_error`,
    /// `overloaded_error`, ...) fold into `Upstream`.
    pub fn from_wire(value: &str) -> Self {
        match value {
            "authentication_error" | "permission_error" => ErrorKind::Authentication,
            "rate_limit_error" => ErrorKind::RateLimit,
            "invalid_request_error" | "validation_error" => ErrorKind::Validation,
            "not_found_error" => ErrorKind::NotFound,
            _ => ErrorKind::Upstream,
        }
    }

    fn from_status(status: u16) -> Self {
        match status {
            401 | 403 => ErrorKind::Authentication,
            429 => ErrorKind::RateLimit,
            400 | 413 | 422 => ErrorKind::Validation,
            404 => ErrorKind::NotFound,
            _ => ErrorKind::Upstream,
        }
    }

    /// Google RPC status names used by Cloud Code error bodies.
    fn from_rpc_status(status: &str) -> Option<Self> {
        match status {
            "RESOURCE_EXHAUSTED" => Some(ErrorKind::RateLimit),
            "UNAUTHENTICATED" | "PERMISSION_DENIED" => Some(ErrorKind::Authentication),
            "INVALID_ARGUMENT" | "FAILED_PRECONDITION" => Some(ErrorKind::Validation),
            "NOT_FOUND" => Some(ErrorKind::NotFound),
            _ => None,
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classified failure: what the client sees and what the pool should do.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct ClassifiedError {
    pub kind: ErrorKind,
    pub status: u16,
    pub message: String,
    /// Reset delay reported by the upstream for rate limits
    pub retry_after: Option<Duration>,
}

impl ClassifiedError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            status: kind.default_status(),
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = status;
        self
    }

    /// `{type:"error", error:{type, message}}` body shared by JSON responses
    /// and terminal stream events.
    pub fn to_body(&self) -> Value {
        serde_json::json!({
            "type": "error",
            "error": {
                "type": self.kind.as_str(),
                "message": self.message,
            }
        })
    }
}

/// Classify an upstream failure.
///
/// Rules, in order:
/// 1. A structured error body supplies the message, and its declared type
///    (or Google RPC status, or HTTP status) the kind.
/// 2. Without a structured body, a message mentioning quota or limit
///    exhaustion is a `RateLimit` with status 429.
/// 3. An HTTP status without a body picks the kind from the status.
/// 4. Anything else is `Upstream` with status 500.
pub fn classify(error: &UpstreamError) -> ClassifiedError {
    let retry_after = error
        .body
        .as_deref()
        .and_then(parse_reset_delay)
        .or_else(|| parse_reset_delay(&error.message));

    if let Some(structured) = error.body.as_deref().and_then(structured_error) {
        let kind = structured
            .declared_type
            .as_deref()
            .map(ErrorKind::from_wire)
            .or_else(|| structured.rpc_status.as_deref().and_then(ErrorKind::from_rpc_status))
            .or_else(|| error.status.map(ErrorKind::from_status))
            .unwrap_or(ErrorKind::Upstream);
        let status = match (kind, error.status) {
            (ErrorKind::Upstream, Some(s)) if s >= 500 => s,
            (ErrorKind::Upstream, _) => 500,
            (k, _) => k.default_status(),
        };
        return ClassifiedError {
            kind,
            status,
            message: structured.message.unwrap_or_else(|| error.message.clone()),
            retry_after: retry_after.filter(|_| kind == ErrorKind::RateLimit),
        };
    }

    let text = error.body.as_deref().unwrap_or(&error.message);
    if mentions_quota(text) || mentions_quota(&error.message) {
        return ClassifiedError {
            kind: ErrorKind::RateLimit,
            status: 429,
            message: error.message.clone(),
            retry_after,
        };
    }

    match error.status {
        Some(status) => {
            let kind = ErrorKind::from_status(status);
            let status = if kind == ErrorKind::Upstream && status < 500 {
                500
            } else if kind == ErrorKind::Upstream {
                status
            } else {
                kind.default_status()
            };
            ClassifiedError {
                kind,
                status,
                message: error
                    .body
                    .as_deref()
                    .filter(|b| !b.trim().is_empty())
                    .map(str::to_string)
                    .unwrap_or_else(|| error.message.clone()),
                retry_after: retry_after.filter(|_| kind == ErrorKind::RateLimit),
            }
        }
        None => ClassifiedError::new(ErrorKind::Upstream, error.message.clone()),
    }
}

struct StructuredError {
    declared_type: Option<String>,
    rpc_status: Option<String>,
    message: Option<String>,
}

/// Extract `{error:{type?, status?, message?}}` from an upstream body.
fn structured_error(body: &str) -> Option<StructuredError> {
    let json: Value = serde_json::from_str(body.trim()).ok()?;
    // Cloud Code sometimes wraps error bodies in a one-element array
    let json = match json {
        Value::Array(mut items) if !items.is_empty() => items.swap_remove(0),
        other => other,
    };
    let error = json.get("error")?.as_object()?;
    Some(StructuredError {
        declared_type: error.get("type").and_then(Value::as_str).map(str::to_string),
        rpc_status: error.get("status").and_then(Value::as_str).map(str::to_string),
        message: error.get("message").and_then(Value::as_str).map(str::to_string),
    })
}

fn mentions_quota(text: &str) -> bool {
    let lower = text.to_lowercase();
    QUOTA_PATTERNS.iter().any(|p| lower.contains(p))
}

fn reset_after_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)reset(?:s)? (?:after|in) ((?:\d+(?:\.\d+)?(?:ms|h|m|s))+)")
            .expect("reset-after regex is valid")
    })
}

fn retry_seconds_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)(?:retry after|try again in|wait) (\d+(?:\.\d+)?) ?s(?:ec(?:ond)?s?)?\b")
            .expect("retry-seconds regex is valid")
    })
}

/// Extract the reset delay an upstream reported for a rate limit.
///
/// Looks at Google `RetryInfo.retryDelay` and `ErrorInfo.metadata.quotaResetDelay`
/// entries first, then at "reset after 1h2m3s" / "retry after N seconds" text.
pub fn parse_reset_delay(text: &str) -> Option<Duration> {
    if let Ok(json) = serde_json::from_str::<Value>(text.trim()) {
        let error = json
            .get("error")
            .or_else(|| json.get(0).and_then(|first| first.get("error")));
        if let Some(details) = error.and_then(|e| e.get("details")).and_then(Value::as_array) {
            for detail in details {
                let candidate = detail
                    .get("retryDelay")
                    .or_else(|| detail.get("metadata").and_then(|m| m.get("quotaResetDelay")))
                    .and_then(Value::as_str);
                if let Some(delay) = candidate.and_then(parse_duration) {
                    return Some(delay);
                }
            }
        }
    }

    if let Some(caps) = reset_after_regex().captures(text)
        && let Some(delay) = parse_duration(&caps[1])
    {
        return Some(delay);
    }

    retry_seconds_regex()
        .captures(text)
        .and_then(|caps| caps[1].parse::<f64>().ok())
        .map(|secs| Duration::from_millis((secs * 1000.0).ceil() as u64))
}

/// Parse Go-style durations: `3.957s`, `500ms`, `1h2m3s`.
pub fn parse_duration(value: &str) -> Option<Duration> {
    let mut total_ms = 0f64;
    let mut rest = value.trim();
    let mut matched = false;

    while !rest.is_empty() {
        let num_len = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(rest.len());
        if num_len == 0 {
            return None;
        }
        let number: f64 = rest[..num_len].parse().ok()?;
        rest = &rest[num_len..];

        let unit_len = rest
            .find(|c: char| !c.is_ascii_alphabetic())
            .unwrap_or(rest.len());
        let factor = match &rest[..unit_len] {
            "h" => 3_600_000.0,
            "m" => 60_000.0,
            "s" => 1_000.0,
            "ms" => 1.0,
            _ => return None,
        };
        rest = &rest[unit_len..];
        total_ms += number * factor;
        matched = true;
    }

    matched.then(|| Duration::from_millis(total_ms.ceil() as u64))
}
