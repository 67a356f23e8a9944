//! Cloud Code backend primitives
//!
//! Token refresh against Google OAuth, the `v1internal` API calls the gateway
//! needs, and the persisted account records. Standalone library with no
//! dependency on the gateway binary.
//!
//! Account flow:
//! 1. `credentials::AccountStore::load()` reads the account file at startup
//! 2. `token::TokenClient::refresh()` trades a refresh token for a bearer token
//! 3. `api::CloudCodeClient::load_code_assist()` binds the account to a project
//! 4. Generation calls go through `api::CloudCodeClient`
//! 5. Mutated accounts are written back with `AccountStore::save_snapshot()`

pub mod api;
pub mod constants;
pub mod credentials;
pub mod error;
pub mod token;

pub use api::{CloudCodeClient, CodeAssistInfo, unwrap_response};
pub use constants::*;
pub use credentials::{
    Account, AccountSource, AccountStore, ModelRateLimit, QuotaSnapshot, Subscription,
};
pub use error::{Error, Result};
pub use token::{TokenClient, TokenResponse};
