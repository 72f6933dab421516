//! Identity-provider token endpoint client.
//!
//! The token manager talks to the provider only through the
//! [`IdentityClient`] trait, so tests can inject a counting mock and the
//! manager never performs raw HTTP. [`MicrosoftIdentityClient`] targets the
//! Microsoft identity platform v2 endpoints.

use super::factory::ClientDescriptor;
use super::{AccountInfo, AuthError, TokenSet};
use async_trait::async_trait;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use serde::Deserialize;
use std::time::Duration;

/// Per-request timeout for token endpoint calls.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Outbound OAuth operations against the identity provider.
///
/// Both operations take the descriptor explicitly so a rebuilt descriptor
/// (after a credential change) is picked up on the next call.
#[async_trait]
pub trait IdentityClient: Send + Sync {
    /// Redeems a single-use authorization code for a token set.
    async fn redeem_code(
        &self,
        descriptor: &ClientDescriptor,
        code: &str,
        redirect_uri: &str,
        scopes: &[&str],
    ) -> Result<TokenSet, AuthError>;

    /// Exchanges a refresh token for a new token set.
    async fn refresh_token(
        &self,
        descriptor: &ClientDescriptor,
        refresh_token: &str,
        scopes: &[&str],
    ) -> Result<TokenSet, AuthError>;
}

/// Token response from the provider's token endpoint.
///
/// Only `access_token` is guaranteed; everything else is
/// provider-optional.
#[derive(Debug, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,

    #[serde(default)]
    pub refresh_token: Option<String>,

    #[serde(default)]
    pub expires_in: Option<i64>,

    #[serde(default)]
    pub id_token: Option<String>,

    #[serde(default)]
    pub token_type: Option<String>,

    #[serde(default)]
    pub scope: Option<String>,
}

impl TokenResponse {
    /// Converts the wire response into the domain token set.
    pub fn into_token_set(self) -> TokenSet {
        let account = self.id_token.as_deref().and_then(account_from_id_token);
        TokenSet {
            access_token: self.access_token,
            refresh_token: self.refresh_token,
            account,
        }
    }
}

/// Extracts the account identity from an ID token's claims segment.
///
/// Best-effort: any malformed token yields `None` rather than an error, so
/// a provider that omits or mangles the ID token only costs the display
/// identity, never the sign-in.
pub fn account_from_id_token(id_token: &str) -> Option<AccountInfo> {
    let claims = id_token.split('.').nth(1)?;
    let decoded = URL_SAFE_NO_PAD.decode(claims.trim_end_matches('=')).ok()?;
    let claims: serde_json::Value = serde_json::from_slice(&decoded).ok()?;

    let username = ["preferred_username", "upn", "email"]
        .iter()
        .find_map(|claim| claims.get(*claim).and_then(|value| value.as_str()))
        .map(str::to_string)?;
    let name = claims
        .get("name")
        .and_then(|value| value.as_str())
        .map(str::to_string);

    Some(AccountInfo { username, name })
}

/// Token endpoint client for the Microsoft identity platform.
///
/// Endpoints are derived from the descriptor's authority URL
/// (`{authority}/oauth2/v2.0/token`), so the tenant baked into the
/// authority selects the issuer.
pub struct MicrosoftIdentityClient {
    http: reqwest::Client,
}

impl MicrosoftIdentityClient {
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::new(),
        }
    }

    /// Posts a grant request and decodes the token response.
    ///
    /// Returns the failure reason as a plain string; callers wrap it in the
    /// error variant for their operation.
    async fn post_grant(
        &self,
        descriptor: &ClientDescriptor,
        form: &[(&str, &str)],
    ) -> Result<TokenResponse, String> {
        let token_url = format!("{}/oauth2/v2.0/token", descriptor.authority);

        let response = self
            .http
            .post(&token_url)
            .timeout(REQUEST_TIMEOUT)
            .header("Accept", "application/json")
            .form(form)
            .send()
            .await
            .map_err(|err| format!("token request failed: {}", err))?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(format!("token endpoint returned {}: {}", status, body));
        }

        response
            .json::<TokenResponse>()
            .await
            .map_err(|err| format!("invalid token response: {}", err))
    }
}

impl Default for MicrosoftIdentityClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl IdentityClient for MicrosoftIdentityClient {
    async fn redeem_code(
        &self,
        descriptor: &ClientDescriptor,
        code: &str,
        redirect_uri: &str,
        scopes: &[&str],
    ) -> Result<TokenSet, AuthError> {
        let scope = scopes.join(" ");
        let form = [
            ("client_id", descriptor.client_id.as_str()),
            ("client_secret", descriptor.client_secret.as_str()),
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", redirect_uri),
            ("scope", scope.as_str()),
        ];

        let response = self
            .post_grant(descriptor, &form)
            .await
            .map_err(AuthError::Exchange)?;
        Ok(response.into_token_set())
    }

    async fn refresh_token(
        &self,
        descriptor: &ClientDescriptor,
        refresh_token: &str,
        scopes: &[&str],
    ) -> Result<TokenSet, AuthError> {
        let scope = scopes.join(" ");
        let form = [
            ("client_id", descriptor.client_id.as_str()),
            ("client_secret", descriptor.client_secret.as_str()),
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("scope", scope.as_str()),
        ];

        let response = self
            .post_grant(descriptor, &form)
            .await
            .map_err(AuthError::Refresh)?;
        Ok(response.into_token_set())
    }
}
