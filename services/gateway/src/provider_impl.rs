//! Cloud Code implementation of the `Upstream` seam.
//!
//! Thin adapter over `cloudcode::TokenClient` and `cloudcode::CloudCodeClient`;
//! every `cloudcode::Error` is converted into a structured `UpstreamError` so
//! the classifier sees status and body instead of formatted strings.

use std::collections::BTreeMap;

use cloudcode::{CloudCodeClient, TokenClient};
use provider::{BoxFuture, ByteStream, ModelQuota, ProjectInfo, TokenGrant, Upstream};
use serde_json::Value;
use tracing::debug;

/// Google Cloud Code backend.
pub struct CloudCodeUpstream {
    tokens: TokenClient,
    api: CloudCodeClient,
}

impl CloudCodeUpstream {
    pub fn new(tokens: TokenClient, api: CloudCodeClient) -> Self {
        Self { tokens, api }
    }
}

impl Upstream for CloudCodeUpstream {
    fn id(&self) -> &str {
        "cloudcode"
    }

    fn refresh_access_token<'a>(
        &'a self,
        refresh_token: &'a str,
    ) -> BoxFuture<'a, provider::Result<TokenGrant>> {
        Box::pin(async move {
            let response = self.tokens.refresh(refresh_token).await?;
            Ok(TokenGrant {
                access_token: response.access_token,
                expires_in: response.expires_in,
            })
        })
    }

    fn load_project<'a>(&'a self, access_token: &'a str) -> BoxFuture<'a, provider::Result<ProjectInfo>> {
        Box::pin(async move {
            let info = self.api.load_code_assist(access_token).await?;
            debug!(project = ?info.project_id, tier = ?info.tier, "loadCodeAssist answered");
            Ok(ProjectInfo {
                project_id: info.project_id,
                tier: info.tier,
            })
        })
    }

    fn fetch_model_quotas<'a>(
        &'a self,
        access_token: &'a str,
        project_id: Option<&'a str>,
    ) -> BoxFuture<'a, provider::Result<BTreeMap<String, ModelQuota>>> {
        Box::pin(async move {
            Ok(self
                .api
                .fetch_available_models(access_token, project_id)
                .await?)
        })
    }

    fn generate<'a>(
        &'a self,
        access_token: &'a str,
        body: &'a Value,
    ) -> BoxFuture<'a, provider::Result<Value>> {
        Box::pin(async move { Ok(self.api.generate_content(access_token, body).await?) })
    }

    fn stream_generate<'a>(
        &'a self,
        access_token: &'a str,
        body: &'a Value,
    ) -> BoxFuture<'a, provider::Result<ByteStream>> {
        Box::pin(async move { Ok(self.api.stream_generate_content(access_token, body).await?) })
    }
}
