//! Dispatch fallback loop
//!
//! Runs one client request against the upstream: resolve the model, pick an
//! account, get its token and project, call, and classify any failure. A
//! rate limit always cools the account down for the model and an
//! authentication failure always invalidates it, whether or not fallback is
//! enabled. With fallback enabled, retryable failures move on to the next
//! eligible account; once every account has been tried the request may
//! switch to the configured fallback model.
//!
//! The account budget per model is the pool size and each model is visited
//! at most once, so the loop always terminates.
//!
//! A stream that fails after it started cannot be retried, but its
//! classified failure still cools down or invalidates the account.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use account_pool::{AccountPool, TokenBroker, now_millis};
use provider::{BoxFuture, ByteStream, ClassifiedError, ErrorKind, Upstream, classify};
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::config::ModelMappingEntry;
use crate::stream::{StreamEvent, spawn_translator};
use crate::translate::{MessagesRequest, build_upstream_request, resolve_model, translate_response};
use crate::usage::UsageHistory;

/// Routing tables and cooldown policy.
#[derive(Debug, Clone, Default)]
pub struct DispatchSettings {
    pub model_mapping: HashMap<String, ModelMappingEntry>,
    pub model_fallbacks: HashMap<String, String>,
    /// Cooldown applied when the upstream gives no reset time
    pub default_cooldown: Duration,
}

/// A successful call and the account and model that served it.
struct Served<T> {
    output: T,
    account: String,
    model: String,
}

/// One kind of upstream generation call.
trait Call: Copy + Send + Sync {
    type Output: Send;

    fn invoke<'a>(
        self,
        upstream: &'a dyn Upstream,
        access_token: &'a str,
        body: &'a Value,
    ) -> BoxFuture<'a, provider::Result<Self::Output>>;
}

#[derive(Clone, Copy)]
struct Generate;

impl Call for Generate {
    type Output = Value;

    fn invoke<'a>(
        self,
        upstream: &'a dyn Upstream,
        access_token: &'a str,
        body: &'a Value,
    ) -> BoxFuture<'a, provider::Result<Value>> {
        upstream.generate(access_token, body)
    }
}

#[derive(Clone, Copy)]
struct StreamGenerate;

impl Call for StreamGenerate {
    type Output = ByteStream;

    fn invoke<'a>(
        self,
        upstream: &'a dyn Upstream,
        access_token: &'a str,
        body: &'a Value,
    ) -> BoxFuture<'a, provider::Result<ByteStream>> {
        upstream.stream_generate(access_token, body)
    }
}

pub struct Dispatcher {
    broker: Arc<TokenBroker>,
    settings: DispatchSettings,
    usage: Arc<UsageHistory>,
    shutdown: watch::Receiver<bool>,
}

impl Dispatcher {
    pub fn new(
        broker: Arc<TokenBroker>,
        settings: DispatchSettings,
        usage: Arc<UsageHistory>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            broker,
            settings,
            usage,
            shutdown,
        }
    }

    /// Single-payload request. Returns the Messages API response object.
    pub async fn send_message(
        &self,
        request: &MessagesRequest,
        pool: &AccountPool,
        fallback_enabled: bool,
    ) -> Result<Value, ClassifiedError> {
        let served = self
            .execute(request, pool, fallback_enabled, Generate)
            .await?;
        Ok(translate_response(&served.output, &request.model))
    }

    /// Streaming request. Failures before the upstream accepts the call are
    /// returned as errors; later failures arrive as a terminal error event.
    pub async fn send_message_stream(
        &self,
        request: &MessagesRequest,
        pool: &AccountPool,
        fallback_enabled: bool,
    ) -> Result<mpsc::Receiver<StreamEvent>, ClassifiedError> {
        let Served {
            output,
            account,
            model,
        } = self
            .execute(request, pool, fallback_enabled, StreamGenerate)
            .await?;
        let (events, failure) = spawn_translator(
            output,
            request.model.clone(),
            self.shutdown.clone(),
        );

        let pool = self.broker.pool().clone();
        let default_cooldown = self.settings.default_cooldown;
        tokio::spawn(async move {
            if let Ok(error) = failure.await {
                crate::metrics::record_upstream_error(error.kind.as_str());
                warn!(
                    account_id = %account,
                    model = %model,
                    kind = %error.kind,
                    error = %error.message,
                    "stream failed after start"
                );
                apply_side_effects(&pool, default_cooldown, &account, &model, &error).await;
            }
        });

        Ok(events)
    }

    async fn execute<C: Call>(
        &self,
        request: &MessagesRequest,
        pool: &AccountPool,
        fallback_enabled: bool,
        call: C,
    ) -> Result<Served<C::Output>, ClassifiedError> {
        let mut model = resolve_model(&self.settings.model_mapping, &request.model);
        if model != request.model {
            debug!(requested = %request.model, model = %model, "model mapped");
        }

        if pool.is_all_rate_limited(&model).await {
            warn!(model = %model, "every account is rate-limited, resetting cooldowns");
            crate::metrics::record_pool_reset();
            pool.reset_all_rate_limits().await;
        }

        let budget = pool.len().await;
        let mut visited_models = HashSet::from([model.clone()]);
        let mut attempt = 0u32;

        loop {
            let mut tried: HashSet<String> = HashSet::new();
            let mut last_error: Option<ClassifiedError> = None;

            while tried.len() < budget {
                let Some(account) = pool.pick_next_excluding(&model, &tried).await else {
                    break;
                };
                tried.insert(account.email.clone());
                attempt += 1;
                if attempt > 1 {
                    crate::metrics::record_fallback();
                }

                match self.attempt(&account.email, &model, request, call).await {
                    Ok(output) => {
                        self.usage.record(&model);
                        if attempt > 1 {
                            info!(account_id = %account.email, model = %model, attempt, "request succeeded after fallback");
                        }
                        return Ok(Served {
                            output,
                            account: account.email,
                            model,
                        });
                    }
                    Err(error) => {
                        crate::metrics::record_upstream_error(error.kind.as_str());
                        apply_side_effects(
                            pool,
                            self.settings.default_cooldown,
                            &account.email,
                            &model,
                            &error,
                        )
                        .await;

                        if !fallback_enabled || !error.kind.is_retryable() {
                            return Err(error);
                        }
                        warn!(
                            account_id = %account.email,
                            model = %model,
                            attempt,
                            kind = %error.kind,
                            error = %error.message,
                            "attempt failed, trying next account"
                        );
                        last_error = Some(error);
                    }
                }
            }

            if fallback_enabled
                && let Some(next) = self.settings.model_fallbacks.get(&model)
                && visited_models.insert(next.clone())
            {
                warn!(from = %model, to = %next, "accounts exhausted, switching to fallback model");
                model = next.clone();
                continue;
            }

            return Err(match last_error {
                Some(error) => error,
                None => self.no_account_error(pool, &model).await,
            });
        }
    }

    async fn attempt<C: Call>(
        &self,
        email: &str,
        model: &str,
        request: &MessagesRequest,
        call: C,
    ) -> Result<C::Output, ClassifiedError> {
        let token = self.broker.get_token(email).await?;
        let project = self.broker.project_for(email, &token).await?;
        let body = build_upstream_request(request, model, &project);
        debug!(account_id = email, model, project = %project, "calling upstream");
        call.invoke(self.broker.upstream().as_ref(), &token, &body)
            .await
            .map_err(|e| classify(&e))
    }

    async fn no_account_error(&self, pool: &AccountPool, model: &str) -> ClassifiedError {
        if pool.is_all_rate_limited(model).await {
            ClassifiedError::new(
                ErrorKind::RateLimit,
                format!("All accounts are rate-limited for {model}"),
            )
        } else {
            ClassifiedError::new(ErrorKind::Upstream, "No accounts available").with_status(503)
        }
    }
}

/// Pool consequences of a classified failure.
async fn apply_side_effects(
    pool: &AccountPool,
    default_cooldown: Duration,
    email: &str,
    model: &str,
    error: &ClassifiedError,
) {
    match error.kind {
        ErrorKind::RateLimit => {
            let cooldown = error.retry_after.unwrap_or(default_cooldown);
            let cooldown_ms = u64::try_from(cooldown.as_millis()).unwrap_or(u64::MAX);
            let reset_at = now_millis().saturating_add(cooldown_ms);
            pool.mark_rate_limited(email, model, reset_at).await;
        }
        ErrorKind::Authentication => pool.mark_invalid(email, &error.message).await,
        ErrorKind::Upstream | ErrorKind::Validation | ErrorKind::NotFound => {}
    }
}
