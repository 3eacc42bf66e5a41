//! Configuration types and loading.
//!
//! Config is loaded from a JSON file (e.g. `~/.relay/config.json`) and
//! environment. Covers gateway bind, token verification, the upstream
//! prediction endpoint, and connection rate limits.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level application config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Gateway server settings.
    #[serde(default)]
    pub gateway: GatewayConfig,

    /// Token verification settings and the local user directory.
    #[serde(default)]
    pub auth: AuthConfig,

    /// Upstream LLM orchestration endpoint (Flowise-style prediction API).
    #[serde(default)]
    pub upstream: UpstreamConfig,

    /// Connection rate limits.
    #[serde(default)]
    pub limits: RateLimitConfig,
}

/// Gateway bind and port settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayConfig {
    /// Port for HTTP and WebSocket (default 8321).
    #[serde(default = "default_gateway_port")]
    pub port: u16,

    /// Bind address (default "127.0.0.1").
    #[serde(default = "default_gateway_bind")]
    pub bind: String,
}

fn default_gateway_port() -> u16 {
    8321
}

fn default_gateway_bind() -> String {
    "127.0.0.1".to_string()
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: default_gateway_port(),
            bind: default_gateway_bind(),
        }
    }
}

/// Token verification: HS256 secret plus the users the gateway can resolve.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthConfig {
    /// HS256 signing secret shared with the token issuer. Overridden by
    /// RELAY_JWT_SECRET env.
    pub secret: Option<String>,

    /// Known users; connections resolve token user ids against this list.
    #[serde(default)]
    pub users: Vec<UserEntry>,
}

/// One known user: opaque id and display name.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserEntry {
    pub id: String,
    pub username: String,
}

/// Upstream prediction endpoint settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpstreamConfig {
    /// Base URL of the upstream service (default "http://127.0.0.1:3000").
    #[serde(default = "default_upstream_base_url")]
    pub base_url: String,

    /// Flow id appended to /api/v1/prediction/.
    #[serde(default)]
    pub flow_id: String,

    /// Per-request timeout in seconds (default 30). Independent of the
    /// retry delay.
    #[serde(default = "default_upstream_timeout_secs")]
    pub timeout_secs: u64,

    /// Attempts before giving up (default 3, kept within 3..=10).
    #[serde(default = "default_upstream_max_retries")]
    pub max_retries: u32,

    /// Fixed delay between attempts in milliseconds (default 1000). Not
    /// exponential.
    #[serde(default = "default_upstream_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

fn default_upstream_base_url() -> String {
    "http://127.0.0.1:3000".to_string()
}

fn default_upstream_timeout_secs() -> u64 {
    30
}

fn default_upstream_max_retries() -> u32 {
    3
}

fn default_upstream_retry_delay_ms() -> u64 {
    1000
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: default_upstream_base_url(),
            flow_id: String::new(),
            timeout_secs: default_upstream_timeout_secs(),
            max_retries: default_upstream_max_retries(),
            retry_delay_ms: default_upstream_retry_delay_ms(),
        }
    }
}

/// Fixed-window connection rate limit per source address.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitConfig {
    /// Window length in seconds (default 60).
    #[serde(default = "default_rate_window_secs")]
    pub window_secs: u64,

    /// Connections admitted per source per window (default 5).
    #[serde(default = "default_rate_max_connections")]
    pub max_connections: u64,
}

fn default_rate_window_secs() -> u64 {
    60
}

fn default_rate_max_connections() -> u64 {
    5
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window_secs: default_rate_window_secs(),
            max_connections: default_rate_max_connections(),
        }
    }
}

/// Resolve the JWT secret: env RELAY_JWT_SECRET overrides config.
pub fn resolve_jwt_secret(config: &Config) -> Option<String> {
    std::env::var("RELAY_JWT_SECRET")
        .ok()
        .and_then(|s| {
            let t = s.trim();
            if t.is_empty() {
                None
            } else {
                Some(t.to_string())
            }
        })
        .or_else(|| {
            config
                .auth
                .secret
                .as_ref()
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
        })
}

/// Resolve config path from env or default.
pub fn default_config_path() -> PathBuf {
    std::env::var("RELAY_CONFIG_PATH").map(PathBuf::from).unwrap_or_else(|_| {
        dirs::home_dir()
            .map(|h| h.join(".relay").join("config.json"))
            .unwrap_or_else(|| PathBuf::from("config.json"))
    })
}

/// Load config from the default path (or RELAY_CONFIG_PATH). Missing file
/// => default config. Returns the config and the path that was used.
pub fn load_config(path: Option<PathBuf>) -> Result<(Config, PathBuf)> {
    let path = path.unwrap_or_else(default_config_path);
    let config = if !path.exists() {
        log::debug!("config file not found, using defaults: {}", path.display());
        Config::default()
    } else {
        let s = std::fs::read_to_string(&path)
            .with_context(|| format!("reading config from {}", path.display()))?;
        serde_json::from_str(&s)
            .with_context(|| format!("parsing config from {}", path.display()))?
    };
    Ok((config, path))
}

/// Write a starter config at `path`: generated secret, one sample user.
/// Fails if the file already exists.
pub fn init_config(path: &std::path::Path) -> Result<Config> {
    if path.exists() {
        anyhow::bail!("config already exists at {}", path.display());
    }
    let mut config = Config::default();
    config.auth.secret = Some(uuid::Uuid::new_v4().simple().to_string());
    config.auth.users.push(UserEntry {
        id: "1".to_string(),
        username: "local".to_string(),
    });
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    let json = serde_json::to_string_pretty(&config)?;
    std::fs::write(path, json)
        .with_context(|| format!("writing config to {}", path.display()))?;
    Ok(config)
}
