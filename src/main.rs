use anyhow::{anyhow, Context, Result};
use mailpilot::api::{create_router, run_session_sweep, AppState, SessionStore};
use mailpilot::auth::{ClientFactory, MicrosoftIdentityClient, TokenManager};
use mailpilot::config::{self, AppConfig, CONFIG_PATH_ENV};
use mailpilot::vault::{CredentialVault, SecretCipher};
use std::path::Path;
use std::sync::Arc;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing subscriber
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mailpilot=info".into()),
        )
        .init();

    info!("Mailpilot starting...");

    // Load configuration (the file is optional, env overrides apply on top)
    let config_path =
        std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| "mailpilot.toml".to_string());
    let mut config = if Path::new(&config_path).exists() {
        config::load_config(&config_path)
            .map_err(|e| anyhow!("failed to load {}: {}", config_path, e))?
    } else {
        AppConfig::default()
    };
    config.apply_env_overrides();
    config::validate_startup()?;

    info!(
        port = config.port,
        base_url = %config.base_url,
        vault_path = %config.vault_path,
        "Configuration loaded"
    );

    // Credential vault (lazy: the file is read on first access)
    let vault = Arc::new(CredentialVault::new(
        &config.vault_path,
        SecretCipher::from_env(),
    ));
    if vault.is_configured() {
        info!("Provider credentials present");
    } else {
        info!("Provider credentials not configured yet, POST /api/config to set them");
    }

    // Token manager over the vault-backed identity client factory
    let factory = ClientFactory::new(Arc::clone(&vault));
    let provider = Arc::new(MicrosoftIdentityClient::new());
    let tokens = Arc::new(TokenManager::new(factory, provider, &config.base_url));

    // Session store with a periodic expiry sweep
    let sessions = SessionStore::new(config.session.ttl_hours);
    tokio::spawn(run_session_sweep(
        sessions.clone(),
        config.session.sweep_interval_seconds,
    ));

    let state = AppState {
        vault,
        tokens,
        sessions,
        secure_cookies: config::is_production(),
    };
    let router = create_router(state);

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", config.port))
        .await
        .context("Failed to bind server port")?;
    info!(port = config.port, "Mailpilot listening");

    let server_handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router).await {
            tracing::error!(error = %e, "Server error");
        }
    });

    // Wait for shutdown signal
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl_c signal")?;
    info!("Shutdown signal received");

    server_handle.abort();
    Ok(())
}
