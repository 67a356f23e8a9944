//! Cloud Code constants
//!
//! Endpoints and client identification for the Antigravity flavour of the
//! Cloud Code API. The OAuth client id and secret are operator configuration,
//! not constants.

/// Google OAuth token endpoint used for refresh-token grants
pub const TOKEN_ENDPOINT: &str = "https://oauth2.googleapis.com/token";

/// Cloud Code base URLs, tried in order until one answers without a 5xx.
pub const DEFAULT_BASE_URLS: &[&str] = &[
    "https://daily-cloudcode-pa.sandbox.googleapis.com",
    "https://daily-cloudcode-pa.googleapis.com",
    "https://cloudcode-pa.googleapis.com",
];

/// IDE type reported to `loadCodeAssist`
pub const IDE_TYPE: &str = "ANTIGRAVITY";

/// `userAgent` field inside generation request wrappers
pub const REQUEST_USER_AGENT: &str = "antigravity";

/// HTTP User-Agent header for every Cloud Code call
pub const HTTP_USER_AGENT: &str = "antigravity/1.11.5 linux/amd64";

/// Project used when `loadCodeAssist` does not report one for the account.
pub const DEFAULT_PROJECT_ID: &str = "bamboo-precept-lgxtn";
