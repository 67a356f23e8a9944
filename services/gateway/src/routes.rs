//! HTTP surface
//!
//! | Route | Purpose |
//! |-------|---------|
//! | `GET /health` | Per-account status, counts and quota snapshots |
//! | `GET /account-limits` | Per-account, per-model quota table, optional usage history |
//! | `POST /refresh-token` | Drop token/project caches and force a refresh |
//! | `GET /v1/models` | Models visible to one available account |
//! | `POST /v1/messages` | Messages API, single payload or SSE |
//! | `GET /metrics` | Prometheus exposition |
//!
//! Every route except `/metrics` initializes the pool on first use. Errors
//! render as `{type:"error", error:{type, message}}`.

use std::collections::{BTreeMap, BTreeSet};
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Instant;

use account_pool::{AccountPool, TokenBroker, now_millis};
use axum::body::{Body, Bytes};
use axum::extract::rejection::BytesRejection;
use axum::extract::{DefaultBodyLimit, MatchedPath, Query, Request, State};
use axum::http::header::{CACHE_CONTROL, CONTENT_TYPE};
use axum::http::{Method, StatusCode, Uri};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, SecondsFormat, Utc};
use cloudcode::{Account, QuotaSnapshot, Subscription};
use common::Secret;
use metrics_exporter_prometheus::PrometheusHandle;
use provider::{ClassifiedError, ErrorKind, ModelQuota, classify};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tower::limit::ConcurrencyLimitLayer;
use tracing::{info, instrument, warn};

use crate::dispatch::Dispatcher;
use crate::error::ApiError;
use crate::stream::StreamEvent;
use crate::translate::MessagesRequest;
use crate::usage::UsageHistory;

/// Shared application state accessible from all handlers
#[derive(Clone)]
pub struct AppState {
    pub pool: Arc<AccountPool>,
    pub broker: Arc<TokenBroker>,
    pub dispatcher: Arc<Dispatcher>,
    pub usage: Arc<UsageHistory>,
    pub fallback_enabled: bool,
    pub prometheus: PrometheusHandle,
}

/// Build the axum router with all routes and shared state.
///
/// `max_connections` bounds concurrent requests; `body_limit` is in bytes.
pub fn build_router(state: AppState, max_connections: usize, body_limit: usize) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/account-limits", get(account_limits))
        .route("/refresh-token", post(refresh_token))
        .route("/v1/models", get(list_models))
        .route("/v1/messages", post(messages))
        .route("/metrics", get(metrics_handler))
        .method_not_allowed_fallback(not_found)
        .fallback(not_found)
        .layer(middleware::from_fn(track_requests))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(ConcurrencyLimitLayer::new(max_connections))
        .with_state(state)
}

fn request_id() -> String {
    format!("req_{}", uuid::Uuid::new_v4().as_simple())
}

async fn track_requests(request: Request, next: Next) -> Response {
    let route = request
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_owned())
        .unwrap_or_else(|| "unmatched".to_owned());
    let started = Instant::now();
    let response = next.run(request).await;
    crate::metrics::record_request(
        &route,
        response.status().as_u16(),
        started.elapsed().as_secs_f64(),
    );
    response
}

async fn not_found(method: Method, uri: Uri) -> ApiError {
    let path = uri
        .path_and_query()
        .map(|p| p.as_str())
        .unwrap_or_else(|| uri.path());
    ApiError::not_found(format!("Endpoint {method} {path} not found"))
}

fn iso_millis(ms: u64) -> Option<String> {
    DateTime::from_timestamp_millis(ms as i64).map(|t| t.to_rfc3339_opts(SecondsFormat::Millis, true))
}

fn now_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// `{remaining: "40%", remainingFraction, resetTime}`
fn format_quota(quota: &ModelQuota) -> Value {
    json!({
        "remaining": quota
            .remaining_fraction
            .map(|f| format!("{}%", (f * 100.0).round() as i64))
            .unwrap_or_else(|| "N/A".to_string()),
        "remainingFraction": quota.remaining_fraction,
        "resetTime": quota.reset_time,
    })
}

/// Quota table for one account, refreshing its token if needed.
async fn quotas_for(
    state: &AppState,
    account: &Account,
) -> Result<BTreeMap<String, ModelQuota>, ClassifiedError> {
    let token = state.broker.get_token(&account.email).await?;
    state
        .broker
        .upstream()
        .fetch_model_quotas(&token, account.project_id.as_deref())
        .await
        .map_err(|e| classify(&e))
}

#[instrument(skip_all, fields(request_id = %request_id()))]
async fn health(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    state.pool.initialize().await?;
    let started = Instant::now();
    let status = state.pool.status().await;
    let accounts = state.pool.accounts().await;

    let details = futures_util::future::join_all(
        accounts.iter().map(|account| account_health(&state, account)),
    )
    .await;

    Ok(Json(json!({
        "status": "ok",
        "timestamp": now_iso(),
        "latencyMs": started.elapsed().as_millis() as u64,
        "summary": status.summary,
        "counts": {
            "total": status.total,
            "available": status.available,
            "rateLimited": status.rate_limited,
            "invalid": status.invalid,
            "disabled": status.disabled,
        },
        "accounts": details,
    })))
}

async fn account_health(state: &AppState, account: &Account) -> Value {
    let now = now_millis();
    let soonest = account.soonest_reset(now);
    let mut detail = json!({
        "email": account.email,
        "enabled": account.enabled,
        "lastUsed": account.last_used.and_then(iso_millis),
        "modelRateLimits": account.model_rate_limits,
        "rateLimitCooldownRemaining": soonest.map(|reset| reset.saturating_sub(now)).unwrap_or(0),
    });

    let (status, error, models) = if account.is_invalid {
        ("invalid", account.invalid_reason.clone(), json!({}))
    } else {
        match quotas_for(state, account).await {
            Ok(quotas) => {
                let models: serde_json::Map<String, Value> = quotas
                    .iter()
                    .map(|(model, quota)| (model.clone(), format_quota(quota)))
                    .collect();
                let status = if soonest.is_some() { "rate-limited" } else { "ok" };
                (status, None, Value::Object(models))
            }
            Err(e) => {
                warn!(account_id = %account.email, error = %e.message, "health probe failed");
                ("error", Some(e.message), json!({}))
            }
        }
    };

    detail["status"] = json!(status);
    detail["models"] = models;
    if let Some(error) = error {
        detail["error"] = json!(error);
    }
    detail
}

#[derive(Debug, Deserialize)]
struct LimitsQuery {
    #[serde(rename = "includeHistory")]
    include_history: Option<String>,
}

/// Outcome of probing one account for `/account-limits`.
struct LimitsProbe {
    email: String,
    status: &'static str,
    error: Option<String>,
    subscription: Option<Subscription>,
    models: BTreeMap<String, ModelQuota>,
}

#[instrument(skip_all, fields(request_id = %request_id()))]
async fn account_limits(
    State(state): State<AppState>,
    Query(query): Query<LimitsQuery>,
) -> Result<Json<Value>, ApiError> {
    state.pool.initialize().await?;
    let accounts = state.pool.accounts().await;

    let probes = futures_util::future::join_all(
        accounts.iter().map(|account| probe_limits(&state, account)),
    )
    .await;

    let models: BTreeSet<&String> = probes.iter().flat_map(|p| p.models.keys()).collect();

    // Re-read so the metadata recorded by the probes is visible
    let current = state.pool.accounts().await;
    let rows: Vec<Value> = probes
        .iter()
        .map(|probe| {
            let account = current.iter().find(|a| a.email == probe.email);
            let limits: serde_json::Map<String, Value> = models
                .iter()
                .map(|model| {
                    let limit = probe.models.get(*model).map(format_quota).unwrap_or(Value::Null);
                    ((*model).clone(), limit)
                })
                .collect();
            let subscription = probe
                .subscription
                .clone()
                .or_else(|| account.and_then(|a| a.subscription.clone()))
                .map(|s| json!(s))
                .unwrap_or_else(|| json!({ "tier": "unknown", "projectId": null }));

            let mut row = json!({
                "email": probe.email,
                "status": probe.status,
                "source": account.map(|a| a.source.as_str()).unwrap_or("unknown"),
                "enabled": account.is_none_or(|a| a.enabled),
                "projectId": account.and_then(|a| a.project_id.clone()),
                "isInvalid": account.is_some_and(|a| a.is_invalid),
                "invalidReason": account.and_then(|a| a.invalid_reason.clone()),
                "lastUsed": account.and_then(|a| a.last_used),
                "modelRateLimits": account.map(|a| json!(a.model_rate_limits)).unwrap_or_else(|| json!({})),
                "subscription": subscription,
                "models": probe.models,
                "limits": limits,
            });
            if let Some(error) = &probe.error {
                row["error"] = json!(error);
            }
            row
        })
        .collect();

    let mut body = json!({
        "timestamp": now_iso(),
        "totalAccounts": accounts.len(),
        "models": models,
        "accounts": rows,
    });
    if query.include_history.as_deref() == Some("true") {
        body["history"] = json!(state.usage.history());
    }
    Ok(Json(body))
}

async fn probe_limits(state: &AppState, account: &Account) -> LimitsProbe {
    let mut probe = LimitsProbe {
        email: account.email.clone(),
        status: "ok",
        error: None,
        subscription: None,
        models: BTreeMap::new(),
    };
    if account.is_invalid {
        probe.status = "invalid";
        probe.error = account.invalid_reason.clone();
        return probe;
    }

    let probed = async {
        let token = state.broker.get_token(&account.email).await?;
        let upstream = state.broker.upstream();
        let info = upstream
            .load_project(&token)
            .await
            .map_err(|e| classify(&e))?;
        let project = info.project_id.clone().or_else(|| account.project_id.clone());
        let quotas = upstream
            .fetch_model_quotas(&token, project.as_deref())
            .await
            .map_err(|e| classify(&e))?;
        Ok::<_, ClassifiedError>((info, quotas))
    }
    .await;

    match probed {
        Ok((info, quotas)) => {
            let now = now_millis();
            let subscription = Subscription {
                tier: info.tier.unwrap_or_else(|| "unknown".to_string()),
                project_id: info.project_id,
                detected_at: now,
            };
            let snapshot = QuotaSnapshot {
                models: quotas.clone(),
                last_checked: now,
            };
            state
                .pool
                .update_metadata(&account.email, Some(subscription.clone()), Some(snapshot))
                .await;
            probe.subscription = Some(subscription);
            probe.models = quotas;
        }
        Err(e) => {
            warn!(account_id = %account.email, error = %e.message, "limits probe failed");
            probe.status = "error";
            probe.error = Some(e.message);
        }
    }
    probe
}

#[instrument(skip_all, fields(request_id = %request_id()))]
async fn refresh_token(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    state.pool.initialize().await?;
    state.broker.clear_token_cache().await;
    state.broker.clear_project_cache().await;

    let account = state.pool.pick_any().await.ok_or_else(ApiError::no_accounts)?;
    let token = match state.broker.force_refresh(&account.email).await {
        Ok(token) => Secret::new(token),
        Err(e) => {
            if e.kind == ErrorKind::Authentication {
                state.pool.mark_invalid(&account.email, &e.message).await;
            }
            return Err(e.into());
        }
    };

    info!(account_id = %account.email, "token force-refreshed");
    Ok(Json(json!({
        "status": "ok",
        "account": account.email,
        "tokenPrefix": token.preview(10),
    })))
}

#[instrument(skip_all, fields(request_id = %request_id()))]
async fn list_models(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    state.pool.initialize().await?;
    let account = state.pool.pick_any().await.ok_or_else(ApiError::no_accounts)?;
    let quotas = quotas_for(&state, &account).await?;

    let created = Utc::now().timestamp();
    let data: Vec<Value> = quotas
        .keys()
        .map(|id| {
            json!({
                "id": id,
                "object": "model",
                "created": created,
                "owned_by": "anthropic",
            })
        })
        .collect();
    Ok(Json(json!({ "object": "list", "data": data })))
}

#[instrument(skip_all, fields(request_id = %request_id()))]
async fn messages(
    State(state): State<AppState>,
    body: Result<Bytes, BytesRejection>,
) -> Result<Response, ApiError> {
    let request = MessagesRequest::from_slice(&body?)?;
    state.pool.initialize().await?;
    info!(
        model = %request.model,
        stream = request.stream,
        messages = request.messages.len(),
        "messages request"
    );

    if request.stream {
        let events = state
            .dispatcher
            .send_message_stream(&request, &state.pool, state.fallback_enabled)
            .await?;
        Ok(sse_response(events))
    } else {
        let response = state
            .dispatcher
            .send_message(&request, &state.pool, state.fallback_enabled)
            .await?;
        Ok(Json(response).into_response())
    }
}

/// Write each event as soon as the translator produces it.
fn sse_response(events: mpsc::Receiver<StreamEvent>) -> Response {
    let body = futures_util::stream::unfold(events, |mut events| async move {
        let event = events.recv().await?;
        Some((Ok::<_, Infallible>(Bytes::from(event.to_sse())), events))
    });
    (
        StatusCode::OK,
        [(CONTENT_TYPE, "text/event-stream"), (CACHE_CONTROL, "no-cache")],
        Body::from_stream(body),
    )
        .into_response()
}

/// Prometheus metrics endpoint: text exposition format.
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        state.prometheus.render(),
    )
}
