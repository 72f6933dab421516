//! Browser-facing HTTP API.
//!
//! Sign-in flow:
//! 1. UI calls GET /api/csrf, then POST /api/config with the operator's
//!    provider credentials
//! 2. GET /login → Redirect to the identity provider
//! 3. User authorizes on the provider's site
//! 4. Provider redirects to /auth/callback
//! 5. Exchange code for tokens, store them in the session
//! 6. GET /api/me now reports the session as authenticated

pub mod session;

pub use session::{run_session_sweep, SessionStore, SESSION_COOKIE};

use crate::auth::{AuthError, TokenManager};
use crate::vault::{CredentialVault, DefaultBlocks, ProviderCredentials, VaultError};
use axum::{
    extract::{Query, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Json, Redirect, Response},
    routing::{get, post},
    Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info, warn};

/// Header carrying the CSRF token on configuration writes.
pub const CSRF_HEADER: &str = "x-csrf-token";

/// Error response
#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

/// Application error types for the HTTP API
enum AppError {
    BadRequest(String),
    Unauthorized(String),
    Forbidden(String),
    ServerError(String),
    BadGateway(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_message) = match self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg),
            AppError::Forbidden(msg) => (StatusCode::FORBIDDEN, msg),
            AppError::ServerError(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
            AppError::BadGateway(msg) => (StatusCode::BAD_GATEWAY, msg),
        };

        let body = Json(ErrorResponse {
            error: error_message,
        });

        (status, body).into_response()
    }
}

/// Shared application state for the HTTP API
#[derive(Clone)]
pub struct AppState {
    pub vault: Arc<CredentialVault>,
    pub tokens: Arc<TokenManager>,
    pub sessions: SessionStore,
    pub secure_cookies: bool,
}

/// Credentials submitted by the operator.
///
/// Every field defaults to empty so validation happens in the vault, which
/// reports missing client credentials with a stable message.
#[derive(Deserialize)]
pub struct CredentialsForm {
    #[serde(default)]
    client_id: String,
    #[serde(default)]
    client_secret: String,
    #[serde(default)]
    tenant_id: String,
    #[serde(default)]
    openai_api_key: String,
    #[serde(default)]
    opener: String,
    #[serde(default)]
    closing: String,
    #[serde(default)]
    signature: String,
    /// Fallback for clients that cannot set the CSRF header
    #[serde(default)]
    csrf_token: Option<String>,
}

/// Identity provider callback query parameters
#[derive(Deserialize)]
pub struct AuthCallback {
    code: Option<String>,
    state: Option<String>,
    error: Option<String>,
    error_description: Option<String>,
}

#[derive(Serialize)]
struct HealthResponse {
    ok: bool,
    configured: bool,
    timestamp: String,
}

#[derive(Serialize)]
struct ConfigStatusResponse {
    configured: bool,
}

#[derive(Serialize)]
struct CsrfResponse {
    csrf_token: String,
}

/// Session status for the UI
#[derive(Serialize)]
struct MeResponse {
    configured: bool,
    authenticated: bool,
    user: Option<String>,
    csrf_token: String,
}

/// Create the application router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/login", get(login))
        .route("/auth/callback", get(auth_callback))
        .route("/logout", get(logout))
        .route("/api/me", get(me))
        .route("/api/csrf", get(csrf))
        .route("/api/config", post(set_config))
        .route("/api/config/status", get(config_status))
        .route("/api/config/default-blocks", get(default_blocks))
        .with_state(Arc::new(state))
}

/// Attaches the session cookie when a new session was created.
fn with_session_cookie(
    mut response: Response,
    state: &AppState,
    session_id: &str,
    is_new: bool,
) -> Response {
    if is_new {
        let cookie = session::session_cookie(
            session_id,
            state.sessions.cookie_max_age(),
            state.secure_cookies,
        );
        if let Ok(value) = HeaderValue::from_str(&cookie) {
            response.headers_mut().insert(header::SET_COOKIE, value);
        }
    }
    response
}

async fn root() -> &'static str {
    "Mailpilot is running. Sign in at /login."
}

/// GET /health
async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        ok: true,
        configured: state.vault.is_configured(),
        timestamp: Utc::now().to_rfc3339(),
    })
}

/// GET /api/config/status
async fn config_status(State(state): State<Arc<AppState>>) -> Json<ConfigStatusResponse> {
    Json(ConfigStatusResponse {
        configured: state.vault.is_configured(),
    })
}

/// GET /api/csrf
///
/// Returns the session's CSRF token, creating the session if needed.
async fn csrf(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    let (session_id, record, is_new) = state.sessions.establish(&headers);
    let csrf_token = record.lock().await.csrf_token();

    let response = Json(CsrfResponse { csrf_token }).into_response();
    with_session_cookie(response, &state, &session_id, is_new)
}

/// POST /api/config
///
/// Stores the operator's provider credentials in the vault and invalidates
/// the cached identity client.
///
/// # Security
/// - Requires the session's CSRF token (header or body field)
/// - Secrets are never echoed back or logged
async fn set_config(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(form): Json<CredentialsForm>,
) -> Result<StatusCode, AppError> {
    let presented = headers
        .get(CSRF_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or_else(|| form.csrf_token.clone());

    let Some(presented) = presented else {
        warn!("configuration write without a CSRF token");
        return Err(AppError::Forbidden("missing CSRF token".to_string()));
    };

    let Some((_session_id, record)) = state.sessions.lookup(&headers) else {
        warn!("configuration write without a session");
        return Err(AppError::Forbidden("invalid CSRF token".to_string()));
    };

    if !record.lock().await.csrf_matches(&presented) {
        warn!("configuration write with a mismatched CSRF token");
        return Err(AppError::Forbidden("invalid CSRF token".to_string()));
    }

    let candidate = ProviderCredentials {
        client_id: form.client_id,
        client_secret: form.client_secret,
        tenant_id: form.tenant_id,
        openai_api_key: form.openai_api_key,
        default_blocks: DefaultBlocks {
            opener: form.opener,
            closing: form.closing,
            signature: form.signature,
        },
    };

    state.vault.set(candidate).map_err(|e| match e {
        VaultError::MissingClientCredentials => AppError::BadRequest(e.to_string()),
        other => {
            error!(error = %other, "failed to store credentials");
            AppError::ServerError("failed to store credentials".to_string())
        }
    })?;

    // The cached identity client descriptor is stale now
    state.tokens.invalidate_client();

    info!("provider credentials updated");
    Ok(StatusCode::NO_CONTENT)
}

/// GET /api/config/default-blocks
async fn default_blocks(State(state): State<Arc<AppState>>) -> Json<DefaultBlocks> {
    Json(state.vault.default_blocks().unwrap_or_default())
}

/// GET /login
///
/// Starts the sign-in flow by redirecting to the identity provider.
///
/// # Security
/// - Generates a single-use state token bound to the session
/// - Falls back to the home page when credentials are not configured
async fn login(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    if !state.vault.is_configured() {
        info!("login requested before configuration, redirecting home");
        return Ok(Redirect::to("/").into_response());
    }

    let (session_id, record, is_new) = state.sessions.establish(&headers);
    let login_state = record.lock().await.issue_login_state();

    let auth_url = state
        .tokens
        .authorization_url(Some(&login_state))
        .map_err(|e| AppError::ServerError(e.to_string()))?;

    info!("redirecting to identity provider");
    let response = Redirect::temporary(&auth_url).into_response();
    Ok(with_session_cookie(response, &state, &session_id, is_new))
}

/// GET /auth/callback
///
/// Identity provider callback. Exchanges the authorization code for tokens
/// and stores them in the session.
///
/// # Security
/// - Validates the single-use state token (consumed on first check)
/// - A failed exchange never retries the code
async fn auth_callback(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(callback): Query<AuthCallback>,
) -> Result<Response, AppError> {
    if let Some(error) = callback.error {
        let description = callback
            .error_description
            .unwrap_or_else(|| "Unknown error".to_string());
        warn!(
            error = %error,
            description = %description,
            "sign-in rejected by identity provider"
        );
        return Err(AppError::BadRequest(format!(
            "authorization failed: {} - {}",
            error, description
        )));
    }

    let code = callback
        .code
        .ok_or_else(|| AppError::BadRequest("Missing 'code' parameter".to_string()))?;

    let (session_id, record, is_new) = state.sessions.establish(&headers);
    let mut record = record.lock().await;

    let expected = record.take_login_state();
    if expected.is_none() || expected != callback.state {
        warn!("sign-in state mismatch");
        return Err(AppError::Unauthorized(
            "invalid or expired sign-in state".to_string(),
        ));
    }

    let token_set = state.tokens.redeem_code(&code).await.map_err(|e| match e {
        AuthError::NotConfigured => AppError::ServerError(e.to_string()),
        other => {
            error!(error = %other, "authorization code exchange failed");
            AppError::BadGateway(other.to_string())
        }
    })?;

    let user = token_set
        .account
        .as_ref()
        .map(|a| a.username.clone())
        .unwrap_or_else(|| "unknown".to_string());

    record.tokens.access_token = Some(token_set.access_token);
    record.tokens.refresh_token = token_set.refresh_token;
    record.tokens.account = token_set.account;

    info!(user = %user, "sign-in complete");
    let response = Redirect::to("/").into_response();
    Ok(with_session_cookie(response, &state, &session_id, is_new))
}

/// GET /logout
///
/// Destroys the session and clears the cookie. Always redirects home.
async fn logout(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    if let Some((session_id, record)) = state.sessions.lookup(&headers) {
        let user = {
            let record = record.lock().await;
            record.tokens.account.as_ref().map(|a| a.username.clone())
        };
        state.sessions.remove(&session_id);
        match user {
            Some(user) => info!(user = %user, "signed out"),
            None => info!("session destroyed"),
        }
    }

    let mut response = Redirect::to("/").into_response();
    if let Ok(value) = HeaderValue::from_str(&session::expired_session_cookie()) {
        response.headers_mut().insert(header::SET_COOKIE, value);
    }
    response
}

/// GET /api/me
///
/// Session status for the UI. Refreshes the access token if the session
/// holds only a refresh token; a session whose tokens cannot be refreshed
/// reads as signed out.
async fn me(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    let (session_id, record, is_new) = state.sessions.establish(&headers);
    let mut record = record.lock().await;

    let csrf_token = record.csrf_token();
    let authenticated = state
        .tokens
        .valid_access_token(&mut record.tokens)
        .await
        .is_some();
    let user = record.tokens.account.as_ref().map(|a| a.username.clone());

    let response = Json(MeResponse {
        configured: state.vault.is_configured(),
        authenticated,
        user,
        csrf_token,
    })
    .into_response();
    with_session_cookie(response, &state, &session_id, is_new)
}
