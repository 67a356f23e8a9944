//! Proactive background token refresh
//!
//! Periodically walks the pool and refreshes tokens that are missing or close
//! to expiry, so most requests find a cached token. Refreshes go through the
//! `TokenBroker`, sharing its single-flight map with the request path.

use std::sync::Arc;
use std::time::Duration;

use provider::ErrorKind;
use tracing::{debug, info, warn};

use crate::broker::TokenBroker;
use crate::pool::now_millis;

/// Spawn a background task that refreshes expiring tokens every `interval`.
///
/// A rejected refresh credential invalidates the account. Transient failures
/// leave it unchanged for the next cycle.
pub fn spawn_refresh_task(broker: Arc<TokenBroker>, interval: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // The first tick completes immediately; requests refresh on demand at startup
        ticker.tick().await;

        loop {
            ticker.tick().await;
            refresh_cycle(&broker).await;
        }
    })
}

/// Run one refresh cycle over every usable account.
async fn refresh_cycle(broker: &TokenBroker) {
    let pool = broker.pool();
    let now = now_millis();
    let mut refreshed = 0usize;

    for account in pool.accounts().await {
        if !account.is_usable() || account.fresh_token(now, broker.margin_ms()).is_some() {
            continue;
        }

        debug!(account_id = %account.email, "token expiring within margin, refreshing");

        match broker.get_token(&account.email).await {
            Ok(_) => refreshed += 1,
            Err(e) if e.kind == ErrorKind::Authentication => {
                warn!(account_id = %account.email, error = %e.message, "refresh token rejected, invalidating account");
                pool.mark_invalid(&account.email, &e.message).await;
            }
            Err(e) => {
                warn!(account_id = %account.email, error = %e.message, "background refresh failed (transient), will retry next cycle");
            }
        }
    }

    if refreshed > 0 {
        info!(refreshed, "background token refresh cycle complete");
    }
}
