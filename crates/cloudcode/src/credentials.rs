//! Account records and their on-disk store
//!
//! The account file is a JSON document `{"accounts": [...]}` holding every
//! field of every `Account`. Writes use atomic temp-file + rename with 0600
//! permissions. A tokio Mutex serializes writers and remembers the generation
//! of the last snapshot written, so a slow writer can never overwrite a newer
//! snapshot with an older one.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use provider::ModelQuota;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::{Error, Result};

/// How an account's credential was obtained.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountSource {
    #[default]
    Oauth,
    Database,
    Manual,
}

impl AccountSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccountSource::Oauth => "oauth",
            AccountSource::Database => "database",
            AccountSource::Manual => "manual",
        }
    }
}

/// Cooldown entry for one model on one account.
///
/// `reset_time` is a unix timestamp in milliseconds. An entry whose reset
/// time has passed is treated as cleared without being rewritten.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelRateLimit {
    pub is_rate_limited: bool,
    pub reset_time: Option<u64>,
}

impl ModelRateLimit {
    /// Whether the cooldown still blocks the account at `now_ms`.
    pub fn is_active(&self, now_ms: u64) -> bool {
        self.is_rate_limited && self.reset_time.is_some_and(|reset| reset > now_ms)
    }
}

/// Subscription tier detected through `loadCodeAssist`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Subscription {
    pub tier: String,
    pub project_id: Option<String>,
    pub detected_at: u64,
}

/// Last fetched per-model quota table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotaSnapshot {
    pub models: BTreeMap<String, ModelQuota>,
    pub last_checked: u64,
}

/// One upstream identity.
///
/// Timestamps are unix milliseconds. `access_token`/`token_expires_at` and
/// `project_id` are caches owned by the token broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Account {
    pub email: String,
    #[serde(default)]
    pub source: AccountSource,
    pub refresh_token: String,
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default)]
    pub token_expires_at: Option<u64>,
    #[serde(default)]
    pub project_id: Option<String>,
    #[serde(default)]
    pub model_rate_limits: BTreeMap<String, ModelRateLimit>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub is_invalid: bool,
    #[serde(default)]
    pub invalid_reason: Option<String>,
    #[serde(default)]
    pub last_used: Option<u64>,
    #[serde(default)]
    pub subscription: Option<Subscription>,
    #[serde(default)]
    pub quota: Option<QuotaSnapshot>,
}

fn default_enabled() -> bool {
    true
}

impl Account {
    pub fn new(email: impl Into<String>, refresh_token: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            source: AccountSource::default(),
            refresh_token: refresh_token.into(),
            access_token: None,
            token_expires_at: None,
            project_id: None,
            model_rate_limits: BTreeMap::new(),
            enabled: true,
            is_invalid: false,
            invalid_reason: None,
            last_used: None,
            subscription: None,
            quota: None,
        }
    }

    /// Enabled and not invalidated.
    pub fn is_usable(&self) -> bool {
        self.enabled && !self.is_invalid
    }

    /// Whether `model` is under an active cooldown at `now_ms`.
    pub fn is_rate_limited_for(&self, model: &str, now_ms: u64) -> bool {
        self.model_rate_limits
            .get(model)
            .is_some_and(|limit| limit.is_active(now_ms))
    }

    /// Earliest active cooldown reset across all models.
    pub fn soonest_reset(&self, now_ms: u64) -> Option<u64> {
        self.model_rate_limits
            .values()
            .filter(|limit| limit.is_active(now_ms))
            .filter_map(|limit| limit.reset_time)
            .min()
    }

    /// Cached access token if it stays valid for at least `margin_ms`.
    pub fn fresh_token(&self, now_ms: u64, margin_ms: u64) -> Option<&str> {
        match (&self.access_token, self.token_expires_at) {
            (Some(token), Some(expires)) if expires > now_ms.saturating_add(margin_ms) => {
                Some(token.as_str())
            }
            _ => None,
        }
    }
}

#[derive(Serialize, Deserialize)]
struct AccountFile {
    accounts: Vec<Account>,
}

/// Persistent account store.
///
/// Loading never creates the file: a missing, unreadable or corrupt file is
/// an error the pool surfaces as an initialization failure.
pub struct AccountStore {
    path: PathBuf,
    /// Generation of the last snapshot written
    written: Mutex<u64>,
    writes: AtomicU64,
}

impl AccountStore {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            written: Mutex::new(0),
            writes: AtomicU64::new(0),
        }
    }

    /// Number of snapshots written to disk.
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read every account from disk.
    pub async fn load(&self) -> Result<Vec<Account>> {
        let contents = tokio::fs::read_to_string(&self.path).await.map_err(|e| {
            Error::Io(format!(
                "reading account file {}: {e}",
                self.path.display()
            ))
        })?;
        let file: AccountFile = serde_json::from_str(&contents)
            .map_err(|e| Error::CredentialParse(format!("parsing account file: {e}")))?;

        let mut seen = HashSet::new();
        for account in &file.accounts {
            if !seen.insert(account.email.as_str()) {
                return Err(Error::DuplicateAccount(account.email.clone()));
            }
        }

        info!(path = %self.path.display(), accounts = file.accounts.len(), "loaded accounts");
        Ok(file.accounts)
    }

    /// Persist a snapshot tagged with `generation`.
    ///
    /// Returns `Ok(false)` without touching the file when a snapshot with the
    /// same or a newer generation was already written.
    pub async fn save_snapshot(&self, generation: u64, accounts: &[Account]) -> Result<bool> {
        let mut written = self.written.lock().await;
        if generation <= *written {
            debug!(generation, written = *written, "skipping stale account snapshot");
            return Ok(false);
        }
        write_atomic(&self.path, accounts).await?;
        *written = generation;
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(true)
    }
}

/// Write the account file atomically with 0600 permissions.
async fn write_atomic(path: &Path, accounts: &[Account]) -> Result<()> {
    let json = serde_json::to_string_pretty(&AccountFile {
        accounts: accounts.to_vec(),
    })
    .map_err(|e| Error::CredentialParse(format!("serializing accounts: {e}")))?;

    let dir = path
        .parent()
        .ok_or_else(|| Error::Io("account path has no parent directory".into()))?;

    let tmp_path = dir.join(format!(".accounts.tmp.{}", std::process::id()));

    tokio::fs::write(&tmp_path, json.as_bytes())
        .await
        .map_err(|e| Error::Io(format!("writing temp account file: {e}")))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        tokio::fs::set_permissions(&tmp_path, perms)
            .await
            .map_err(|e| Error::Io(format!("setting account file permissions: {e}")))?;
    }

    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(|e| Error::Io(format!("renaming temp account file: {e}")))?;

    debug!(path = %path.display(), "persisted accounts");
    Ok(())
}
