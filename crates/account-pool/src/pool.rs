//! Account pool: selection, rate-limit tracking and persistence
//!
//! The pool owns the in-memory copy of every `Account` behind a single
//! `RwLock`. Selection and every mutation take the write lock, so two
//! concurrent requests never both see an account as eligible once one of them
//! has cooled it down. Cooldowns expire lazily: an entry whose reset time has
//! passed is ignored without being cleared.
//!
//! Every mutation publishes a snapshot on a `watch` channel read by a single
//! writer task, so a burst of mutations collapses into a write of the newest
//! state. Snapshots are numbered under the write lock. A failed write is
//! logged and never reaches the request path.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use cloudcode::{Account, AccountStore, ModelRateLimit, QuotaSnapshot, Subscription};
use serde::Serialize;
use tokio::sync::{OnceCell, RwLock, watch};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// Current wall-clock time as unix milliseconds.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Aggregate pool counts for health reporting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolStatus {
    pub total: usize,
    pub available: usize,
    pub rate_limited: usize,
    pub invalid: usize,
    pub disabled: usize,
    pub summary: String,
}

/// Numbered copy of the accounts awaiting a write.
type Snapshot = Arc<(u64, Vec<Account>)>;

/// The set of accounts the gateway dispatches through.
pub struct AccountPool {
    store: Arc<AccountStore>,
    accounts: RwLock<Vec<Account>>,
    initialized: OnceCell<()>,
    generation: AtomicU64,
    snapshots: watch::Sender<Option<Snapshot>>,
    writer_started: AtomicBool,
}

impl AccountPool {
    pub fn new(store: Arc<AccountStore>) -> Self {
        Self {
            store,
            accounts: RwLock::new(Vec::new()),
            initialized: OnceCell::new(),
            generation: AtomicU64::new(0),
            snapshots: watch::Sender::new(None),
            writer_started: AtomicBool::new(false),
        }
    }

    /// Load accounts from the store exactly once.
    ///
    /// Concurrent callers wait on the first attempt. A failed attempt leaves
    /// the pool uninitialized so the next caller tries again.
    pub async fn initialize(&self) -> Result<()> {
        self.initialized
            .get_or_try_init(|| async {
                let accounts = self
                    .store
                    .load()
                    .await
                    .map_err(|e| Error::Initialization(e.to_string()))?;
                if accounts.is_empty() {
                    return Err(Error::Initialization(format!(
                        "no accounts in {}",
                        self.store.path().display()
                    )));
                }
                let count = accounts.len();
                *self.accounts.write().await = accounts;
                info!(accounts = count, "account pool initialized");
                Ok(())
            })
            .await
            .map(|_| ())
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.initialized()
    }

    /// Least-recently-used eligible account for `model`.
    ///
    /// Eligible means enabled, not invalid, and no active cooldown for
    /// `model`. Ties on `last_used` break on email order. The chosen
    /// account's `last_used` is bumped before the lock is released.
    pub async fn pick_next(&self, model: &str) -> Option<Account> {
        self.select(Some(model), &HashSet::new()).await
    }

    /// `pick_next` skipping accounts already tried by the current request.
    pub async fn pick_next_excluding(
        &self,
        model: &str,
        exclude: &HashSet<String>,
    ) -> Option<Account> {
        self.select(Some(model), exclude).await
    }

    /// Any enabled, valid account regardless of cooldowns.
    pub async fn pick_any(&self) -> Option<Account> {
        self.select(None, &HashSet::new()).await
    }

    async fn select(&self, model: Option<&str>, exclude: &HashSet<String>) -> Option<Account> {
        let now = now_millis();
        let mut accounts = self.accounts.write().await;
        let chosen = accounts
            .iter_mut()
            .filter(|a| a.is_usable() && !exclude.contains(&a.email))
            .filter(|a| model.is_none_or(|m| !a.is_rate_limited_for(m, now)))
            .min_by(|a, b| {
                a.last_used
                    .unwrap_or(0)
                    .cmp(&b.last_used.unwrap_or(0))
                    .then_with(|| a.email.cmp(&b.email))
            })?;
        chosen.last_used = Some(now);
        let picked = chosen.clone();
        debug!(account_id = %picked.email, model = model.unwrap_or("*"), "selected account");
        self.persist(&accounts);
        Some(picked)
    }

    /// True iff there is at least one usable account and every usable
    /// account has an active cooldown for `model`.
    pub async fn is_all_rate_limited(&self, model: &str) -> bool {
        let now = now_millis();
        let accounts = self.accounts.read().await;
        let mut usable = accounts.iter().filter(|a| a.is_usable()).peekable();
        usable.peek().is_some() && usable.all(|a| a.is_rate_limited_for(model, now))
    }

    /// Clear every cooldown on every account.
    pub async fn reset_all_rate_limits(&self) {
        let mut accounts = self.accounts.write().await;
        for account in accounts.iter_mut() {
            account.model_rate_limits.clear();
        }
        warn!(accounts = accounts.len(), "cleared all rate limits");
        self.persist(&accounts);
    }

    /// Cool `email` down for `model` until `reset_at` (unix ms).
    pub async fn mark_rate_limited(&self, email: &str, model: &str, reset_at: u64) {
        self.mutate(email, |account| {
            account.model_rate_limits.insert(
                model.to_string(),
                ModelRateLimit {
                    is_rate_limited: true,
                    reset_time: Some(reset_at),
                },
            );
            info!(
                account_id = email,
                model,
                cooldown_ms = reset_at.saturating_sub(now_millis()),
                "account rate-limited for model"
            );
        })
        .await;
    }

    /// Invalidate `email` after an unrecoverable credential failure.
    pub async fn mark_invalid(&self, email: &str, reason: &str) {
        self.mutate(email, |account| {
            account.is_invalid = true;
            account.invalid_reason = Some(reason.to_string());
            account.access_token = None;
            account.token_expires_at = None;
            warn!(account_id = email, reason, "account marked invalid");
        })
        .await;
    }

    /// Cache a refreshed bearer token.
    pub async fn store_token(&self, email: &str, access_token: String, expires_at: u64) {
        self.mutate(email, |account| {
            account.access_token = Some(access_token);
            account.token_expires_at = Some(expires_at);
        })
        .await;
    }

    /// Cache the upstream project binding.
    pub async fn store_project(&self, email: &str, project_id: String) {
        self.mutate(email, |account| account.project_id = Some(project_id))
            .await;
    }

    /// Drop one account's cached token.
    pub async fn clear_token(&self, email: &str) {
        self.mutate(email, |account| {
            account.access_token = None;
            account.token_expires_at = None;
        })
        .await;
    }

    /// Drop every cached token.
    pub async fn clear_tokens(&self) {
        let mut accounts = self.accounts.write().await;
        for account in accounts.iter_mut() {
            account.access_token = None;
            account.token_expires_at = None;
        }
        self.persist(&accounts);
    }

    /// Drop every cached project binding.
    pub async fn clear_projects(&self) {
        let mut accounts = self.accounts.write().await;
        for account in accounts.iter_mut() {
            account.project_id = None;
        }
        self.persist(&accounts);
    }

    /// Record subscription tier and quota snapshot from a status probe.
    pub async fn update_metadata(
        &self,
        email: &str,
        subscription: Option<Subscription>,
        quota: Option<QuotaSnapshot>,
    ) {
        self.mutate(email, |account| {
            if subscription.is_some() {
                account.subscription = subscription;
            }
            if quota.is_some() {
                account.quota = quota;
            }
        })
        .await;
    }

    /// Clone of one account.
    pub async fn get(&self, email: &str) -> Option<Account> {
        self.accounts
            .read()
            .await
            .iter()
            .find(|a| a.email == email)
            .cloned()
    }

    /// Clone of every account in store order.
    pub async fn accounts(&self) -> Vec<Account> {
        self.accounts.read().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.accounts.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Counts by state. An account counts as rate-limited when any model
    /// has an active cooldown.
    pub async fn status(&self) -> PoolStatus {
        let now = now_millis();
        let accounts = self.accounts.read().await;
        let total = accounts.len();
        let mut available = 0usize;
        let mut rate_limited = 0usize;
        let mut invalid = 0usize;
        let mut disabled = 0usize;

        for account in accounts.iter() {
            if account.is_invalid {
                invalid += 1;
            } else if !account.enabled {
                disabled += 1;
            } else if account.soonest_reset(now).is_some() {
                rate_limited += 1;
            } else {
                available += 1;
            }
        }

        PoolStatus {
            total,
            available,
            rate_limited,
            invalid,
            disabled,
            summary: format!(
                "{total} total, {available} available, {rate_limited} rate-limited, {invalid} invalid"
            ),
        }
    }

    async fn mutate(&self, email: &str, f: impl FnOnce(&mut Account)) {
        let mut accounts = self.accounts.write().await;
        match accounts.iter_mut().find(|a| a.email == email) {
            Some(account) => {
                f(account);
                self.persist(&accounts);
            }
            None => debug!(account_id = email, "mutation for unknown account ignored"),
        }
    }

    /// Publish a snapshot for the writer task. Called with the write lock
    /// held so the generation order matches the mutation order.
    fn persist(&self, accounts: &[Account]) {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.snapshots
            .send_replace(Some(Arc::new((generation, accounts.to_vec()))));
        if !self.writer_started.swap(true, Ordering::SeqCst) {
            tokio::spawn(write_snapshots(
                self.store.clone(),
                self.snapshots.subscribe(),
            ));
        }
    }
}

/// Write the newest published snapshot until the pool is dropped.
///
/// Snapshots published while a write is in flight replace each other, so
/// only the latest one reaches disk.
async fn write_snapshots(store: Arc<AccountStore>, mut rx: watch::Receiver<Option<Snapshot>>) {
    loop {
        let latest = rx.borrow_and_update().clone();
        if let Some(snapshot) = latest {
            let (generation, accounts) = snapshot.as_ref();
            match store.save_snapshot(*generation, accounts).await {
                Ok(true) => debug!(generation, writes = store.write_count(), "account snapshot written"),
                Ok(false) => {}
                Err(e) => warn!(error = %e, generation, "failed to persist account snapshot"),
            }
        }
        if rx.changed().await.is_err() {
            break;
        }
    }
}
