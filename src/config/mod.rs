use anyhow::bail;
use serde::Deserialize;
use tracing::warn;

use crate::vault::{ENCRYPTION_KEY_ENV, SESSION_SECRET_ENV};

/// OAuth scopes requested for delegated mail access.
///
/// Fixed set: mail read/write, offline access for refresh tokens, and the
/// identity claims used to display the signed-in account.
pub const OAUTH_SCOPES: &[&str] = &[
    "Mail.Read",
    "Mail.ReadWrite",
    "offline_access",
    "openid",
    "profile",
];

/// Environment variable pointing at the TOML config file.
pub const CONFIG_PATH_ENV: &str = "MAILPILOT_CONFIG";

/// Environment variable overriding the listen port.
pub const PORT_ENV: &str = "MAILPILOT_PORT";

/// Environment variable overriding the public base URL.
pub const BASE_URL_ENV: &str = "MAILPILOT_BASE_URL";

/// Environment variable overriding the vault file path.
pub const VAULT_PATH_ENV: &str = "MAILPILOT_VAULT_PATH";

/// Environment variable selecting the runtime environment
/// (`production` enables the strict secret policy and secure cookies).
pub const ENV_MODE_ENV: &str = "MAILPILOT_ENV";

/// Minimum session secret length accepted in production.
const MIN_SESSION_SECRET_LEN: usize = 16;

/// Complete Mailpilot configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    /// Public base URL; the OAuth redirect URI is derived from it
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_vault_path")]
    pub vault_path: String,
    #[serde(default)]
    pub session: SessionConfig,
}

fn default_port() -> u16 {
    3000
}

fn default_base_url() -> String {
    "http://localhost:3000".to_string()
}

fn default_vault_path() -> String {
    ".credentials.enc".to_string()
}

/// Session store configuration
#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    /// Session lifetime from creation (hours)
    #[serde(default = "default_ttl_hours")]
    pub ttl_hours: i64,
    /// How often expired sessions are swept (seconds)
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_seconds: u64,
}

fn default_ttl_hours() -> i64 {
    24
}

fn default_sweep_interval() -> u64 {
    300
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ttl_hours: default_ttl_hours(),
            sweep_interval_seconds: default_sweep_interval(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            base_url: default_base_url(),
            vault_path: default_vault_path(),
            session: SessionConfig::default(),
        }
    }
}

impl AppConfig {
    /// Applies environment overrides on top of the file values.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(port) = std::env::var(PORT_ENV) {
            if let Ok(port) = port.trim().parse() {
                self.port = port;
            }
        }
        if let Some(base_url) = read_env(BASE_URL_ENV) {
            self.base_url = base_url;
        }
        if let Some(vault_path) = read_env(VAULT_PATH_ENV) {
            self.vault_path = vault_path;
        }
    }
}

/// Load configuration from TOML file
pub fn load_config(path: &str) -> Result<AppConfig, Box<dyn std::error::Error>> {
    let contents = std::fs::read_to_string(path)?;
    let config: AppConfig = toml::from_str(&contents)?;
    Ok(config)
}

/// True when the service runs with `MAILPILOT_ENV=production`.
pub fn is_production() -> bool {
    std::env::var(ENV_MODE_ENV)
        .map(|value| value == "production")
        .unwrap_or(false)
}

/// Validates the secret environment inputs before the service starts.
///
/// Production requires either a dedicated encryption key or a session
/// secret of at least 16 characters; the process refuses to start
/// otherwise. Outside production the development fallback is allowed but
/// logged.
pub fn validate_startup() -> anyhow::Result<()> {
    let encryption_key = read_env(ENCRYPTION_KEY_ENV);
    let session_secret = read_env(SESSION_SECRET_ENV);
    let production = is_production();

    if let Err(message) = check_secret_policy(
        production,
        encryption_key.as_deref(),
        session_secret.as_deref(),
    ) {
        bail!(message);
    }

    if !production && encryption_key.is_none() && session_secret.is_none() {
        warn!("no encryption secret configured, vault falls back to the development session secret");
    }

    Ok(())
}

fn check_secret_policy(
    production: bool,
    encryption_key: Option<&str>,
    session_secret: Option<&str>,
) -> Result<(), String> {
    if !production {
        return Ok(());
    }

    match (encryption_key, session_secret) {
        (Some(_), _) => Ok(()),
        (None, Some(secret)) if secret.len() >= MIN_SESSION_SECRET_LEN => Ok(()),
        (None, Some(_)) => Err(format!(
            "{} must be at least {} characters in production",
            SESSION_SECRET_ENV, MIN_SESSION_SECRET_LEN
        )),
        (None, None) => Err(format!(
            "{} or {} must be set in production",
            ENCRYPTION_KEY_ENV, SESSION_SECRET_ENV
        )),
    }
}

fn read_env(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}
