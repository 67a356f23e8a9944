//! OAuth token refresh
//!
//! The gateway never runs the authorization-code flow itself. Accounts arrive
//! with a long-lived refresh token and this module trades it for a short-lived
//! bearer token at Google's token endpoint.

use common::Secret;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::constants::TOKEN_ENDPOINT;
use crate::error::{Error, Result};

/// Response from the token endpoint for a refresh grant.
///
/// `expires_in` is a delta in seconds. Google does not rotate refresh tokens
/// on refresh, so `refresh_token` is usually absent.
#[derive(Debug, Deserialize, Serialize)]
pub struct TokenResponse {
    pub access_token: String,
    /// Seconds until the access token expires (delta, not absolute)
    pub expires_in: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
}

/// OAuth client identity used for refresh grants.
#[derive(Debug, Clone)]
pub struct TokenClient {
    http: reqwest::Client,
    endpoint: String,
    client_id: String,
    client_secret: Secret<String>,
}

impl TokenClient {
    pub fn new(http: reqwest::Client, client_id: String, client_secret: Secret<String>) -> Self {
        Self {
            http,
            endpoint: TOKEN_ENDPOINT.to_string(),
            client_id,
            client_secret,
        }
    }

    /// Point the client at a different token endpoint.
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    /// Exchange a refresh token for a fresh access token.
    ///
    /// Any 4xx answer (`invalid_grant`, `unauthorized_client`) means the
    /// refresh token is revoked or expired and is reported as
    /// `InvalidCredentials`. 5xx answers are transient.
    pub async fn refresh(&self, refresh: &str) -> Result<TokenResponse> {
        let response = self
            .http
            .post(&self.endpoint)
            .form(&[
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.expose().as_str()),
                ("refresh_token", refresh),
                ("grant_type", "refresh_token"),
            ])
            .send()
            .await
            .map_err(|e| Error::Http(format!("token refresh request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| String::from("<no body>"));

            if status.is_client_error() {
                return Err(Error::InvalidCredentials(format!(
                    "refresh token rejected ({status}): {body}"
                )));
            }

            return Err(Error::Upstream {
                status: status.as_u16(),
                body,
            });
        }

        let token = response
            .json::<TokenResponse>()
            .await
            .map_err(|e| Error::Http(format!("invalid refresh response: {e}")))?;
        debug!(expires_in = token.expires_in, "access token refreshed");
        Ok(token)
    }
}
