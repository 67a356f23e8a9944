//! Test doubles for dispatch and HTTP surface tests.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use account_pool::AccountPool;
use bytes::Bytes;
use cloudcode::{Account, AccountStore};
use provider::{BoxFuture, ByteStream, ModelQuota, ProjectInfo, TokenGrant, Upstream, UpstreamError};
use serde_json::{Value, json};

/// Write `accounts` to `dir/accounts.json` and return an initialized pool.
pub async fn pool_with(dir: &tempfile::TempDir, accounts: &[Account]) -> Arc<AccountPool> {
    let path = dir.path().join("accounts.json");
    let json = json!({ "accounts": accounts });
    tokio::fs::write(&path, json.to_string()).await.unwrap();
    let pool = AccountPool::new(Arc::new(AccountStore::new(path)));
    pool.initialize().await.unwrap();
    Arc::new(pool)
}

/// Initialized pool with one fresh account per email (refresh token `rt_<email>`).
pub async fn test_pool(dir: &tempfile::TempDir, emails: &[&str]) -> Arc<AccountPool> {
    let accounts: Vec<Account> = emails
        .iter()
        .map(|e| Account::new(*e, format!("rt_{e}")))
        .collect();
    pool_with(dir, &accounts).await
}

/// Single-payload Gemini answer with one text part.
pub fn gemini_text(text: &str) -> Value {
    json!({
        "candidates": [{
            "content": { "role": "model", "parts": [{ "text": text }] },
            "finishReason": "STOP"
        }],
        "usageMetadata": { "promptTokenCount": 12, "candidatesTokenCount": 3 }
    })
}

/// SSE chunk wrapping `payload` in the Cloud Code envelope.
pub fn sse_chunk(payload: &Value) -> Bytes {
    Bytes::from(format!("data: {}\n\n", json!({ "response": payload })))
}

/// 429 RESOURCE_EXHAUSTED with a 30s retry delay.
pub fn rate_limited() -> UpstreamError {
    UpstreamError::http(
        429,
        json!({
            "error": {
                "code": 429,
                "status": "RESOURCE_EXHAUSTED",
                "message": "Resource has been exhausted (e.g. check quota).",
                "details": [{
                    "@type": "type.googleapis.com/google.rpc.RetryInfo",
                    "retryDelay": "30s"
                }]
            }
        })
        .to_string(),
    )
}

type StreamScript = provider::Result<Vec<provider::Result<Bytes>>>;

/// Upstream with scripted generate/stream answers and recorded calls.
///
/// Scripts are consumed front to back; once empty, generate answers
/// `gemini_text("ok")` and stream answers a two-chunk completion.
pub struct ScriptedUpstream {
    generate_script: Mutex<VecDeque<provider::Result<Value>>>,
    stream_script: Mutex<VecDeque<StreamScript>>,
    rejected_refresh: Mutex<HashSet<String>>,
    /// (access token, request body) per generate or stream call
    pub calls: Mutex<Vec<(String, Value)>>,
    pub refresh_calls: AtomicUsize,
    pub quotas: BTreeMap<String, ModelQuota>,
}

impl ScriptedUpstream {
    pub fn new() -> Self {
        let mut quotas = BTreeMap::new();
        quotas.insert(
            "gemini-3-pro-high".to_string(),
            ModelQuota {
                remaining_fraction: Some(0.4),
                reset_time: Some("2026-10-16T18:00:00Z".into()),
            },
        );
        quotas.insert(
            "claude-sonnet-4-5".to_string(),
            ModelQuota {
                remaining_fraction: None,
                reset_time: None,
            },
        );
        Self {
            generate_script: Mutex::new(VecDeque::new()),
            stream_script: Mutex::new(VecDeque::new()),
            rejected_refresh: Mutex::new(HashSet::new()),
            calls: Mutex::new(Vec::new()),
            refresh_calls: AtomicUsize::new(0),
            quotas,
        }
    }

    pub fn push_generate(&self, result: provider::Result<Value>) {
        self.generate_script.lock().unwrap().push_back(result);
    }

    pub fn push_stream(&self, result: StreamScript) {
        self.stream_script.lock().unwrap().push_back(result);
    }

    /// Refreshes for `refresh_token` answer 400 invalid_grant.
    pub fn reject_refresh(&self, refresh_token: &str) {
        self.rejected_refresh
            .lock()
            .unwrap()
            .insert(refresh_token.to_string());
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    /// Model field of the nth upstream call.
    pub fn model_of_call(&self, n: usize) -> String {
        self.calls.lock().unwrap()[n].1["model"]
            .as_str()
            .unwrap_or_default()
            .to_string()
    }

    /// Access token used by the nth upstream call.
    pub fn token_of_call(&self, n: usize) -> String {
        self.calls.lock().unwrap()[n].0.clone()
    }

    fn record(&self, access_token: &str, body: &Value) {
        self.calls
            .lock()
            .unwrap()
            .push((access_token.to_string(), body.clone()));
    }
}

impl Upstream for ScriptedUpstream {
    fn id(&self) -> &str {
        "scripted"
    }

    fn refresh_access_token<'a>(&'a self, refresh_token: &'a str) -> BoxFuture<'a, provider::Result<TokenGrant>> {
        Box::pin(async move {
            self.refresh_calls.fetch_add(1, Ordering::SeqCst);
            if self.rejected_refresh.lock().unwrap().contains(refresh_token) {
                return Err(UpstreamError::http(
                    400,
                    r#"{"error":"invalid_grant","error_description":"Token has been expired or revoked."}"#,
                ));
            }
            Ok(TokenGrant {
                access_token: format!("ya29.{refresh_token}"),
                expires_in: 3600,
            })
        })
    }

    fn load_project<'a>(&'a self, _access_token: &'a str) -> BoxFuture<'a, provider::Result<ProjectInfo>> {
        Box::pin(async move {
            Ok(ProjectInfo {
                project_id: Some("proj-test".into()),
                tier: Some("free-tier".into()),
            })
        })
    }

    fn fetch_model_quotas<'a>(
        &'a self,
        _access_token: &'a str,
        _project_id: Option<&'a str>,
    ) -> BoxFuture<'a, provider::Result<BTreeMap<String, ModelQuota>>> {
        Box::pin(async move { Ok(self.quotas.clone()) })
    }

    fn generate<'a>(&'a self, access_token: &'a str, body: &'a Value) -> BoxFuture<'a, provider::Result<Value>> {
        Box::pin(async move {
            self.record(access_token, body);
            self.generate_script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(gemini_text("ok")))
        })
    }

    fn stream_generate<'a>(
        &'a self,
        access_token: &'a str,
        body: &'a Value,
    ) -> BoxFuture<'a, provider::Result<ByteStream>> {
        Box::pin(async move {
            self.record(access_token, body);
            let scripted = self.stream_script.lock().unwrap().pop_front();
            let chunks = match scripted {
                Some(result) => result?,
                None => vec![
                    Ok(sse_chunk(&json!({
                        "candidates": [{ "content": { "parts": [{ "text": "Hello" }] } }]
                    }))),
                    Ok(sse_chunk(&json!({
                        "candidates": [{ "content": { "parts": [{ "text": " world" }] }, "finishReason": "STOP" }]
                    }))),
                ],
            };
            let stream: ByteStream = Box::pin(futures_util::stream::iter(chunks));
            Ok(stream)
        })
    }
}
