//! Test doubles shared by the pool, broker and refresh tests.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use cloudcode::{Account, AccountStore};
use provider::{BoxFuture, ByteStream, ModelQuota, ProjectInfo, TokenGrant, Upstream, UpstreamError};

use crate::pool::AccountPool;

/// Write an account file into `dir` and return a store for it.
pub async fn write_accounts(dir: &tempfile::TempDir, accounts: &[Account]) -> Arc<AccountStore> {
    let path = dir.path().join("accounts.json");
    let json = serde_json::json!({ "accounts": accounts });
    tokio::fs::write(&path, json.to_string()).await.unwrap();
    Arc::new(AccountStore::new(path))
}

/// Initialized pool with one fresh account per email.
pub async fn test_pool(dir: &tempfile::TempDir, emails: &[&str]) -> AccountPool {
    let accounts: Vec<Account> = emails
        .iter()
        .map(|e| Account::new(*e, format!("rt_{e}")))
        .collect();
    let pool = AccountPool::new(write_accounts(dir, &accounts).await);
    pool.initialize().await.unwrap();
    pool
}

/// Upstream that issues numbered tokens and counts calls.
pub struct MockUpstream {
    pub refresh_calls: AtomicUsize,
    pub project_calls: AtomicUsize,
    refresh_delay: Duration,
    refresh_failure: Mutex<Option<UpstreamError>>,
}

impl MockUpstream {
    pub fn new() -> Self {
        Self {
            refresh_calls: AtomicUsize::new(0),
            project_calls: AtomicUsize::new(0),
            refresh_delay: Duration::ZERO,
            refresh_failure: Mutex::new(None),
        }
    }

    pub fn with_refresh_delay(mut self, delay: Duration) -> Self {
        self.refresh_delay = delay;
        self
    }

    pub fn fail_refresh_with(&self, error: UpstreamError) {
        *self.refresh_failure.lock().unwrap() = Some(error);
    }

    pub fn clear_refresh_failure(&self) {
        *self.refresh_failure.lock().unwrap() = None;
    }
}

impl Upstream for MockUpstream {
    fn id(&self) -> &str {
        "mock"
    }

    fn refresh_access_token<'a>(
        &'a self,
        refresh_token: &'a str,
    ) -> BoxFuture<'a, provider::Result<TokenGrant>> {
        Box::pin(async move {
            let n = self.refresh_calls.fetch_add(1, Ordering::SeqCst) + 1;
            if !self.refresh_delay.is_zero() {
                tokio::time::sleep(self.refresh_delay).await;
            }
            if let Some(error) = self.refresh_failure.lock().unwrap().clone() {
                return Err(error);
            }
            Ok(TokenGrant {
                access_token: format!("ya29.{refresh_token}.{n}"),
                expires_in: 3600,
            })
        })
    }

    fn load_project<'a>(&'a self, _access_token: &'a str) -> BoxFuture<'a, provider::Result<ProjectInfo>> {
        Box::pin(async move {
            self.project_calls.fetch_add(1, Ordering::SeqCst);
            Ok(ProjectInfo {
                project_id: Some("proj-mock".into()),
                tier: Some("free-tier".into()),
            })
        })
    }

    fn fetch_model_quotas<'a>(
        &'a self,
        _access_token: &'a str,
        _project_id: Option<&'a str>,
    ) -> BoxFuture<'a, provider::Result<BTreeMap<String, ModelQuota>>> {
        Box::pin(async { Ok(BTreeMap::new()) })
    }

    fn generate<'a>(
        &'a self,
        _access_token: &'a str,
        _body: &'a serde_json::Value,
    ) -> BoxFuture<'a, provider::Result<serde_json::Value>> {
        Box::pin(async { Err(UpstreamError::transport("generate not scripted")) })
    }

    fn stream_generate<'a>(
        &'a self,
        _access_token: &'a str,
        _body: &'a serde_json::Value,
    ) -> BoxFuture<'a, provider::Result<ByteStream>> {
        Box::pin(async { Err(UpstreamError::transport("stream not scripted")) })
    }
}
