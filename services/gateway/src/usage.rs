//! In-memory request history for `/account-limits?includeHistory=true`.
//!
//! Counts successful dispatches per hour and per upstream model. History is
//! process-local and bounded to the last `RETENTION_HOURS` hours.

use std::collections::BTreeMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Hours of history kept.
pub const RETENTION_HOURS: usize = 24 * 7;

/// Requests recorded in one hour.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HourBucket {
    pub total: u64,
    pub models: BTreeMap<String, u64>,
}

#[derive(Debug, Default)]
pub struct UsageHistory {
    // Keys are RFC 3339 hour starts, so lexical order is chronological
    buckets: Mutex<BTreeMap<String, HourBucket>>,
}

impl UsageHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one request for `model` in the current hour.
    pub fn record(&self, model: &str) {
        self.record_at(model, Utc::now());
    }

    fn record_at(&self, model: &str, at: DateTime<Utc>) {
        let key = at.format("%Y-%m-%dT%H:00:00Z").to_string();
        let mut buckets = self.buckets.lock().unwrap_or_else(|e| e.into_inner());
        let bucket = buckets.entry(key).or_default();
        bucket.total += 1;
        *bucket.models.entry(model.to_string()).or_insert(0) += 1;

        while buckets.len() > RETENTION_HOURS {
            buckets.pop_first();
        }
    }

    /// Snapshot keyed by hour start.
    pub fn history(&self) -> BTreeMap<String, HourBucket> {
        self.buckets
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}
