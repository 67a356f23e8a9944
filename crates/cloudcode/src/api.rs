//! Cloud Code `v1internal` API client
//!
//! Wraps the four calls the gateway makes: `loadCodeAssist` (project and tier
//! discovery), `fetchAvailableModels` (model list plus quota), and the two
//! generation calls. Every call walks the configured base URLs in order and
//! moves on after a transport failure or a 5xx; a 4xx answer is final.

use std::collections::BTreeMap;

use futures_util::StreamExt;
use provider::{ByteStream, ModelQuota, UpstreamError};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::constants::{DEFAULT_BASE_URLS, HTTP_USER_AGENT, IDE_TYPE};
use crate::error::{Error, Result};

/// Project binding and tier from `loadCodeAssist`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CodeAssistInfo {
    pub project_id: Option<String>,
    /// Paid tier id when present, else the current tier id
    pub tier: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LoadCodeAssistResponse {
    cloudaicompanion_project: Option<ProjectField>,
    current_tier: Option<Tier>,
    paid_tier: Option<Tier>,
}

/// `cloudaicompanionProject` is either a bare id or `{id, name}`.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ProjectField {
    Id(String),
    Object { id: Option<String> },
}

#[derive(Debug, Deserialize)]
struct Tier {
    id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AvailableModelsResponse {
    #[serde(default)]
    models: BTreeMap<String, ModelEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ModelEntry {
    quota_info: Option<ModelQuota>,
}

/// Client for the Cloud Code API with ordered endpoint fallback.
#[derive(Debug, Clone)]
pub struct CloudCodeClient {
    http: reqwest::Client,
    base_urls: Vec<String>,
}

impl CloudCodeClient {
    pub fn new(http: reqwest::Client, base_urls: Vec<String>) -> Self {
        let base_urls = if base_urls.is_empty() {
            DEFAULT_BASE_URLS.iter().map(|s| s.to_string()).collect()
        } else {
            base_urls
        };
        Self { http, base_urls }
    }

    pub fn base_urls(&self) -> &[String] {
        &self.base_urls
    }

    /// POST `body` to `path` on the first base URL that answers.
    async fn post(
        &self,
        path: &str,
        access_token: &str,
        body: &Value,
        accept_sse: bool,
    ) -> Result<reqwest::Response> {
        let mut last_error = Error::Http("no cloud code endpoints configured".into());

        for base in &self.base_urls {
            let url = format!("{}/{}", base.trim_end_matches('/'), path);
            let mut request = self
                .http
                .post(&url)
                .bearer_auth(access_token)
                .header(reqwest::header::USER_AGENT, HTTP_USER_AGENT)
                .json(body);
            if accept_sse {
                request = request.header(reqwest::header::ACCEPT, "text/event-stream");
            }

            match request.send().await {
                Ok(response) if response.status().is_success() => {
                    debug!(url = %url, "cloud code call accepted");
                    return Ok(response);
                }
                Ok(response) => {
                    let status = response.status();
                    let text = response.text().await.unwrap_or_default();
                    if status.is_server_error() {
                        warn!(url = %url, status = status.as_u16(), "cloud code endpoint failed, trying next");
                        last_error = Error::Upstream {
                            status: status.as_u16(),
                            body: text,
                        };
                        continue;
                    }
                    return Err(Error::Upstream {
                        status: status.as_u16(),
                        body: text,
                    });
                }
                Err(e) => {
                    warn!(url = %url, error = %e, "cloud code endpoint unreachable, trying next");
                    last_error = Error::Http(format!("request to {url} failed: {e}"));
                }
            }
        }

        Err(last_error)
    }

    /// Discover the account's project and subscription tier.
    pub async fn load_code_assist(&self, access_token: &str) -> Result<CodeAssistInfo> {
        let body = json!({ "metadata": { "ideType": IDE_TYPE } });
        let response = self
            .post("v1internal:loadCodeAssist", access_token, &body, false)
            .await?;
        let data: LoadCodeAssistResponse = response
            .json()
            .await
            .map_err(|e| Error::Http(format!("invalid loadCodeAssist response: {e}")))?;

        let project_id = data.cloudaicompanion_project.and_then(|p| match p {
            ProjectField::Id(id) => Some(id),
            ProjectField::Object { id } => id,
        });
        let tier = data
            .paid_tier
            .and_then(|t| t.id)
            .or_else(|| data.current_tier.and_then(|t| t.id));

        Ok(CodeAssistInfo { project_id, tier })
    }

    /// Per-model quota table. Models without `quotaInfo` get an empty entry.
    pub async fn fetch_available_models(
        &self,
        access_token: &str,
        project_id: Option<&str>,
    ) -> Result<BTreeMap<String, ModelQuota>> {
        let body = match project_id {
            Some(project) => json!({ "project": project }),
            None => json!({}),
        };
        let response = self
            .post("v1internal:fetchAvailableModels", access_token, &body, false)
            .await?;
        let data: AvailableModelsResponse = response
            .json()
            .await
            .map_err(|e| Error::Http(format!("invalid fetchAvailableModels response: {e}")))?;

        Ok(data
            .models
            .into_iter()
            .map(|(id, entry)| {
                let quota = entry.quota_info.unwrap_or(ModelQuota {
                    remaining_fraction: None,
                    reset_time: None,
                });
                (id, quota)
            })
            .collect())
    }

    /// Single-payload generation. Returns the unwrapped Gemini response.
    pub async fn generate_content(&self, access_token: &str, body: &Value) -> Result<Value> {
        let response = self
            .post("v1internal:generateContent", access_token, body, false)
            .await?;
        let value: Value = response
            .json()
            .await
            .map_err(|e| Error::Http(format!("invalid generateContent response: {e}")))?;
        Ok(unwrap_response(value))
    }

    /// Incremental generation. Resolves once the upstream accepted the call;
    /// the returned stream yields raw SSE bytes.
    pub async fn stream_generate_content(
        &self,
        access_token: &str,
        body: &Value,
    ) -> Result<ByteStream> {
        let response = self
            .post("v1internal:streamGenerateContent?alt=sse", access_token, body, true)
            .await?;
        let stream = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(|e| UpstreamError::transport(format!("stream read failed: {e}"))));
        Ok(Box::pin(stream))
    }
}

/// Strip the `{response: ...}` envelope Cloud Code puts around Gemini payloads.
pub fn unwrap_response(value: Value) -> Value {
    match value {
        Value::Object(mut map) if map.contains_key("response") => {
            map.remove("response").unwrap_or(Value::Null)
        }
        other => other,
    }
}
