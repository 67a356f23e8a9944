//! Account pool for the Cloud Code gateway
//!
//! Holds every upstream account, picks the least-recently-used eligible one
//! for each request, tracks per-model cooldowns, and brokers bearer tokens
//! with single-flight refresh. State is persisted to the account file on a
//! detached task after every mutation.
//!
//! Account lifecycle:
//! 1. `AccountPool::initialize()` loads the account file once
//! 2. `pick_next(model)` selects an account with no active cooldown for `model`
//! 3. `TokenBroker::get_token()` returns a cached or freshly refreshed token
//! 4. A rate limit cools the account down for that model until the reset time
//! 5. A rejected refresh credential marks the account invalid for good
//! 6. Expired cooldowns are ignored without an explicit clear

pub mod broker;
pub mod error;
pub mod pool;
pub mod refresh;

#[cfg(test)]
mod testing;

pub use broker::TokenBroker;
pub use error::{Error, Result};
pub use pool::{AccountPool, PoolStatus, now_millis};
pub use refresh::spawn_refresh_task;
