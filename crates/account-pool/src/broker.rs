//! Token broker: bearer tokens and project bindings per account
//!
//! Tokens are cached on the `Account` itself. A missing token, or one that
//! expires within the refresh margin, is refreshed through the upstream. At
//! most one refresh per account is in flight: the first caller stores a
//! shared future in `inflight` and every concurrent caller awaits a clone of
//! it. The entry is removed once the future resolves, success or failure, so
//! the next caller after a failure tries again.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared};
use provider::{ClassifiedError, ErrorKind, Upstream, UpstreamError, classify};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::pool::{AccountPool, now_millis};

type RefreshFuture = Shared<BoxFuture<'static, Result<String, ClassifiedError>>>;

/// Hands out usable bearer tokens and project ids for pool accounts.
pub struct TokenBroker {
    pool: Arc<AccountPool>,
    upstream: Arc<dyn Upstream>,
    refresh_margin: Duration,
    inflight: Mutex<HashMap<String, RefreshFuture>>,
}

impl TokenBroker {
    pub fn new(pool: Arc<AccountPool>, upstream: Arc<dyn Upstream>, refresh_margin: Duration) -> Self {
        Self {
            pool,
            upstream,
            refresh_margin,
            inflight: Mutex::new(HashMap::new()),
        }
    }

    pub fn pool(&self) -> &Arc<AccountPool> {
        &self.pool
    }

    pub fn upstream(&self) -> &Arc<dyn Upstream> {
        &self.upstream
    }

    /// Refresh margin in milliseconds.
    pub fn margin_ms(&self) -> u64 {
        u64::try_from(self.refresh_margin.as_millis()).unwrap_or(u64::MAX)
    }

    /// A bearer token for `email`, refreshed if missing or near expiry.
    ///
    /// A rejected refresh credential is an `Authentication` error; the
    /// caller decides whether to invalidate the account.
    pub async fn get_token(&self, email: &str) -> Result<String, ClassifiedError> {
        let account = self.pool.get(email).await.ok_or_else(|| {
            ClassifiedError::new(ErrorKind::Authentication, format!("unknown account {email}"))
        })?;
        if let Some(token) = account.fresh_token(now_millis(), self.margin_ms()) {
            return Ok(token.to_string());
        }

        let refresh = {
            let mut inflight = self.inflight.lock().await;
            match inflight.get(email) {
                Some(existing) => {
                    debug!(account_id = email, "joining in-flight token refresh");
                    existing.clone()
                }
                None => {
                    // A refresh may have completed between the cache check and the lock
                    if let Some(account) = self.pool.get(email).await
                        && let Some(token) = account.fresh_token(now_millis(), self.margin_ms())
                    {
                        return Ok(token.to_string());
                    }
                    let future = run_refresh(
                        self.pool.clone(),
                        self.upstream.clone(),
                        email.to_string(),
                        account.refresh_token.clone(),
                    )
                    .boxed()
                    .shared();
                    inflight.insert(email.to_string(), future.clone());
                    future
                }
            }
        };

        let result = refresh.clone().await;

        let mut inflight = self.inflight.lock().await;
        if inflight
            .get(email)
            .is_some_and(|current| current.ptr_eq(&refresh))
        {
            inflight.remove(email);
        }
        result
    }

    /// Drop the cached token and refresh unconditionally.
    pub async fn force_refresh(&self, email: &str) -> Result<String, ClassifiedError> {
        self.pool.clear_token(email).await;
        self.get_token(email).await
    }

    /// Drop every cached token.
    pub async fn clear_token_cache(&self) {
        self.pool.clear_tokens().await;
        info!("token cache cleared");
    }

    /// Drop every cached project binding.
    pub async fn clear_project_cache(&self) {
        self.pool.clear_projects().await;
        info!("project cache cleared");
    }

    /// Upstream project for `email`, discovered on first use and cached.
    ///
    /// Accounts without a reported project fall back to the shared default.
    pub async fn project_for(&self, email: &str, access_token: &str) -> Result<String, ClassifiedError> {
        if let Some(project) = self.pool.get(email).await.and_then(|a| a.project_id) {
            return Ok(project);
        }

        let info = self
            .upstream
            .load_project(access_token)
            .await
            .map_err(|e| classify(&e))?;
        let project = info
            .project_id
            .unwrap_or_else(|| cloudcode::DEFAULT_PROJECT_ID.to_string());
        debug!(account_id = email, project = %project, "discovered upstream project");
        self.pool.store_project(email, project.clone()).await;
        Ok(project)
    }
}

async fn run_refresh(
    pool: Arc<AccountPool>,
    upstream: Arc<dyn Upstream>,
    email: String,
    refresh_token: String,
) -> Result<String, ClassifiedError> {
    match upstream.refresh_access_token(&refresh_token).await {
        Ok(grant) => {
            let expires_at = now_millis().saturating_add(grant.expires_in.saturating_mul(1000));
            pool.store_token(&email, grant.access_token.clone(), expires_at)
                .await;
            metrics::counter!("gateway_token_refreshes_total", "outcome" => "success").increment(1);
            debug!(account_id = %email, expires_in = grant.expires_in, "token refreshed");
            Ok(grant.access_token)
        }
        Err(e) => {
            let classified = refresh_failure(&e);
            metrics::counter!("gateway_token_refreshes_total", "outcome" => "failure").increment(1);
            warn!(account_id = %email, error = %classified.message, kind = %classified.kind, "token refresh failed");
            Err(classified)
        }
    }
}

/// Any 4xx from the token endpoint means the refresh credential is dead.
fn refresh_failure(error: &UpstreamError) -> ClassifiedError {
    match error.status {
        Some(status) if (400..500).contains(&status) => ClassifiedError::new(
            ErrorKind::Authentication,
            format!(
                "token refresh rejected: {}",
                error.body.as_deref().unwrap_or(&error.message)
            ),
        ),
        _ => classify(error),
    }
}
