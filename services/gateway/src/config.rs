//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults.
//! The OAuth client secret is loaded from ACROXY_OAUTH_CLIENT_SECRET or
//! client_secret_file, never stored in the TOML directly.

use common::Secret;
use serde::Deserialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

/// Env var holding the OAuth client secret
pub const CLIENT_SECRET_ENV: &str = "ACROXY_OAUTH_CLIENT_SECRET";

/// Root configuration
#[derive(Debug, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub accounts: AccountsConfig,
    pub oauth: OAuthConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    /// Inbound model name -> upstream model name
    #[serde(default)]
    pub model_mapping: HashMap<String, ModelMappingEntry>,
    /// Model to switch to once every account is exhausted for a model
    #[serde(default)]
    pub model_fallbacks: HashMap<String, String>,
}

/// HTTP listener settings
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(default = "default_body_limit_mb")]
    pub body_limit_mb: usize,
}

/// Cloud Code endpoints
#[derive(Debug, Deserialize)]
pub struct UpstreamConfig {
    #[serde(default = "default_base_urls")]
    pub base_urls: Vec<String>,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

/// Credential store and token handling
#[derive(Debug, Deserialize)]
pub struct AccountsConfig {
    #[serde(default = "default_accounts_path")]
    pub path: PathBuf,
    #[serde(default = "default_cooldown")]
    pub default_cooldown_secs: u64,
    #[serde(default = "default_refresh_margin")]
    pub token_refresh_margin_secs: u64,
    /// 0 disables the background refresh task
    #[serde(default = "default_background_refresh")]
    pub background_refresh_secs: u64,
}

/// OAuth client used for token refresh
#[derive(Debug, Deserialize)]
pub struct OAuthConfig {
    pub client_id: String,
    #[serde(skip)]
    pub client_secret: Option<Secret<String>>,
    #[serde(default)]
    pub client_secret_file: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
pub struct DispatchConfig {
    #[serde(default)]
    pub fallback: bool,
}

/// One `[model_mapping."<inbound>"]` table
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ModelMappingEntry {
    #[serde(default)]
    pub mapping: Option<String>,
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8080))
}

fn default_max_connections() -> usize {
    1000
}

fn default_body_limit_mb() -> usize {
    50
}

fn default_base_urls() -> Vec<String> {
    cloudcode::DEFAULT_BASE_URLS
        .iter()
        .map(|u| u.to_string())
        .collect()
}

fn default_timeout() -> u64 {
    600
}

fn default_accounts_path() -> PathBuf {
    PathBuf::from("accounts.json")
}

fn default_cooldown() -> u64 {
    60
}

fn default_refresh_margin() -> u64 {
    300
}

fn default_background_refresh() -> u64 {
    900
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            max_connections: default_max_connections(),
            body_limit_mb: default_body_limit_mb(),
        }
    }
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_urls: default_base_urls(),
            timeout_secs: default_timeout(),
        }
    }
}

impl Default for AccountsConfig {
    fn default() -> Self {
        Self {
            path: default_accounts_path(),
            default_cooldown_secs: default_cooldown(),
            token_refresh_margin_secs: default_refresh_margin(),
            background_refresh_secs: default_background_refresh(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file, then overlay environment variables.
    ///
    /// Client secret resolution order:
    /// 1. ACROXY_OAUTH_CLIENT_SECRET env var
    /// 2. client_secret_file path from config
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| common::Error::io(path, e))?;
        let mut config: Config = toml::from_str(&contents)?;

        config.apply_env()?;
        config.validate()?;

        if let Ok(secret) = std::env::var(CLIENT_SECRET_ENV) {
            config.oauth.client_secret = Some(Secret::new(secret));
        } else if let Some(ref secret_file) = config.oauth.client_secret_file {
            let secret = std::fs::read_to_string(secret_file).map_err(|e| {
                common::Error::Config(format!(
                    "failed to read client_secret_file {}: {e}",
                    secret_file.display()
                ))
            })?;
            let secret = secret.trim().to_owned();
            if !secret.is_empty() {
                config.oauth.client_secret = Some(Secret::new(secret));
            }
        }

        if config.oauth.client_secret.is_none() {
            return Err(common::Error::Config(format!(
                "OAuth client secret missing: set {CLIENT_SECRET_ENV} or oauth.client_secret_file"
            )));
        }

        Ok(config)
    }

    /// PORT replaces the listen port; FALLBACK=true turns fallback on.
    fn apply_env(&mut self) -> common::Result<()> {
        if let Ok(port) = std::env::var("PORT") {
            let port: u16 = port
                .trim()
                .parse()
                .map_err(|_| common::Error::Config(format!("PORT must be a port number, got: {port}")))?;
            self.server.listen_addr.set_port(port);
        }
        if std::env::var("FALLBACK").is_ok_and(|v| v.eq_ignore_ascii_case("true")) {
            self.dispatch.fallback = true;
        }
        Ok(())
    }

    fn validate(&self) -> common::Result<()> {
        if self.upstream.base_urls.is_empty() {
            return Err(common::Error::Config(
                "upstream.base_urls must not be empty".into(),
            ));
        }
        for url in &self.upstream.base_urls {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                return Err(common::Error::Config(format!(
                    "base_urls entries must start with http:// or https://, got: {url}"
                )));
            }
        }

        if self.upstream.timeout_secs == 0 {
            return Err(common::Error::Config(
                "timeout_secs must be greater than 0".into(),
            ));
        }

        if self.server.max_connections == 0 {
            return Err(common::Error::Config(
                "max_connections must be greater than 0".into(),
            ));
        }

        if self.server.body_limit_mb == 0 {
            return Err(common::Error::Config(
                "body_limit_mb must be greater than 0".into(),
            ));
        }

        if self.oauth.client_id.trim().is_empty() {
            return Err(common::Error::Config("oauth.client_id must be set".into()));
        }

        Ok(())
    }

    /// Apply command-line flags that override the file (`--fallback`).
    pub fn apply_cli(&mut self, args: &[String]) {
        if args.iter().any(|a| a == "--fallback") {
            self.dispatch.fallback = true;
        }
    }

    /// Body limit in bytes.
    pub fn body_limit_bytes(&self) -> usize {
        self.server.body_limit_mb * 1024 * 1024
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("acroxy.toml")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Serializes tests that mutate environment variables.
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    /// SAFETY: Callers must hold ENV_MUTEX to prevent concurrent env mutation.
    unsafe fn set_env(key: &str, val: &str) {
        unsafe { std::env::set_var(key, val) };
    }

    unsafe fn remove_env(key: &str) {
        unsafe { std::env::remove_var(key) };
    }

    /// SAFETY: Callers must hold ENV_MUTEX.
    unsafe fn clear_overrides() {
        unsafe {
            remove_env("PORT");
            remove_env("FALLBACK");
            remove_env(CLIENT_SECRET_ENV);
        }
    }

    fn valid_toml() -> &'static str {
        r#"
[server]
listen_addr = "127.0.0.1:8080"

[accounts]
path = "/var/lib/acroxy/accounts.json"

[oauth]
client_id = "1234.apps.googleusercontent.com"

[model_mapping."claude-3-5-sonnet-20241022"]
mapping = "gemini-3-pro-high"

[model_fallbacks]
"claude-opus-4-5-thinking" = "gemini-3-pro-high"
"#
    }

    fn write_config(name: &str, contents: &str) -> (PathBuf, PathBuf) {
        let dir = std::env::temp_dir().join(format!("acroxy-config-{name}"));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.toml");
        std::fs::write(&path, contents).unwrap();
        (dir, path)
    }

    #[test]
    fn test_load_valid_config() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let (dir, path) = write_config("valid", valid_toml());

        unsafe {
            clear_overrides();
            set_env(CLIENT_SECRET_ENV, "GOCSPX-test");
        }

        let config = Config::load(&path).unwrap();
        assert_eq!(config.server.listen_addr.port(), 8080);
        assert_eq!(config.server.max_connections, 1000);
        assert_eq!(config.body_limit_bytes(), 50 * 1024 * 1024);
        assert_eq!(config.upstream.timeout_secs, 600);
        assert_eq!(config.upstream.base_urls.len(), 3);
        assert_eq!(config.accounts.default_cooldown_secs, 60);
        assert_eq!(config.accounts.token_refresh_margin_secs, 300);
        assert_eq!(config.accounts.background_refresh_secs, 900);
        assert!(!config.dispatch.fallback);
        assert_eq!(
            config.model_mapping["claude-3-5-sonnet-20241022"]
                .mapping
                .as_deref(),
            Some("gemini-3-pro-high")
        );
        assert_eq!(
            config.model_fallbacks["claude-opus-4-5-thinking"],
            "gemini-3-pro-high"
        );
        assert_eq!(
            config.oauth.client_secret.as_ref().unwrap().expose(),
            "GOCSPX-test"
        );

        unsafe { clear_overrides() };
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_load_missing_file() {
        let result = Config::load(Path::new("/nonexistent/path/acroxy.toml"));
        assert!(result.is_err());
    }

    #[test]
    fn test_load_invalid_toml() {
        let (dir, path) = write_config("invalid", "not valid {{{{ toml");

        let result = Config::load(&path);
        assert!(result.is_err());

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_missing_client_secret_is_rejected() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let (dir, path) = write_config("no-secret", valid_toml());

        unsafe { clear_overrides() };
        let err = Config::load(&path).unwrap_err();
        assert!(err.to_string().contains(CLIENT_SECRET_ENV), "got: {err}");

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_client_secret_from_file() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let dir = std::env::temp_dir().join("acroxy-config-secret-file");
        std::fs::create_dir_all(&dir).unwrap();
        let secret_path = dir.join("client_secret");
        std::fs::write(&secret_path, "GOCSPX-from-file\n").unwrap();

        let toml_content = format!(
            r#"
[oauth]
client_id = "1234.apps.googleusercontent.com"
client_secret_file = "{}"
"#,
            secret_path.display()
        );
        let config_path = dir.join("config.toml");
        std::fs::write(&config_path, &toml_content).unwrap();

        unsafe { clear_overrides() };
        let config = Config::load(&config_path).unwrap();
        assert_eq!(
            config.oauth.client_secret.as_ref().unwrap().expose(),
            "GOCSPX-from-file"
        );

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_env_secret_takes_precedence_over_file() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let dir = std::env::temp_dir().join("acroxy-config-secret-precedence");
        std::fs::create_dir_all(&dir).unwrap();
        let secret_path = dir.join("client_secret");
        std::fs::write(&secret_path, "from-file").unwrap();

        let toml_content = format!(
            r#"
[oauth]
client_id = "1234.apps.googleusercontent.com"
client_secret_file = "{}"
"#,
            secret_path.display()
        );
        let config_path = dir.join("config.toml");
        std::fs::write(&config_path, &toml_content).unwrap();

        unsafe {
            clear_overrides();
            set_env(CLIENT_SECRET_ENV, "from-env");
        }
        let config = Config::load(&config_path).unwrap();
        assert_eq!(
            config.oauth.client_secret.as_ref().unwrap().expose(),
            "from-env"
        );

        unsafe { clear_overrides() };
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_port_and_fallback_env_overrides() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let (dir, path) = write_config("env-overrides", valid_toml());

        unsafe {
            clear_overrides();
            set_env(CLIENT_SECRET_ENV, "secret");
            set_env("PORT", "9191");
            set_env("FALLBACK", "true");
        }
        let config = Config::load(&path).unwrap();
        assert_eq!(config.server.listen_addr.port(), 9191);
        assert_eq!(config.server.listen_addr.ip().to_string(), "127.0.0.1");
        assert!(config.dispatch.fallback);

        unsafe { clear_overrides() };
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_invalid_port_env_is_rejected() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let (dir, path) = write_config("bad-port", valid_toml());

        unsafe {
            clear_overrides();
            set_env(CLIENT_SECRET_ENV, "secret");
            set_env("PORT", "eighty");
        }
        assert!(Config::load(&path).is_err());

        unsafe { clear_overrides() };
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_rejects_non_http_base_url() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let (dir, path) = write_config(
            "bad-url",
            r#"
[upstream]
base_urls = ["ftp://cloudcode-pa.googleapis.com"]

[oauth]
client_id = "1234.apps.googleusercontent.com"
"#,
        );

        unsafe {
            clear_overrides();
            set_env(CLIENT_SECRET_ENV, "secret");
        }
        let err = Config::load(&path).unwrap_err();
        assert!(err.to_string().contains("http://"), "got: {err}");

        unsafe { clear_overrides() };
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_rejects_zero_limits() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe {
            clear_overrides();
            set_env(CLIENT_SECRET_ENV, "secret");
        }

        for (name, body) in [
            ("zero-timeout", "[upstream]\ntimeout_secs = 0\n"),
            ("zero-conns", "[server]\nmax_connections = 0\n"),
            ("zero-body", "[server]\nbody_limit_mb = 0\n"),
        ] {
            let contents = format!(
                "{body}\n[oauth]\nclient_id = \"1234.apps.googleusercontent.com\"\n"
            );
            let (dir, path) = write_config(name, &contents);
            assert!(Config::load(&path).is_err(), "{name} should be rejected");
            std::fs::remove_dir_all(&dir).unwrap();
        }

        unsafe { clear_overrides() };
    }

    #[test]
    fn test_cli_fallback_flag() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let (dir, path) = write_config("cli-fallback", valid_toml());
        unsafe {
            clear_overrides();
            set_env(CLIENT_SECRET_ENV, "secret");
        }

        let mut config = Config::load(&path).unwrap();
        config.apply_cli(&["acroxy".into(), "--fallback".into()]);
        assert!(config.dispatch.fallback);

        unsafe { clear_overrides() };
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_resolve_path_precedence() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { remove_env("CONFIG_PATH") };
        assert_eq!(Config::resolve_path(None), PathBuf::from("acroxy.toml"));

        unsafe { set_env("CONFIG_PATH", "/etc/acroxy/acroxy.toml") };
        assert_eq!(
            Config::resolve_path(None),
            PathBuf::from("/etc/acroxy/acroxy.toml")
        );
        assert_eq!(
            Config::resolve_path(Some("/tmp/cli.toml")),
            PathBuf::from("/tmp/cli.toml")
        );
        unsafe { remove_env("CONFIG_PATH") };
    }
}
