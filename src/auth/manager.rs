//! Session-scoped access/refresh token lifecycle.
//!
//! All operations read and mutate a caller-supplied [`SessionTokens`]; the
//! manager holds no per-session state of its own. Request handlers use one
//! entry point, [`TokenManager::valid_access_token`], which never raises
//! and reports only presence or absence.

use super::client::IdentityClient;
use super::factory::ClientFactory;
use super::{AuthError, SessionTokens, TokenSet};
use crate::config::OAUTH_SCOPES;
use std::sync::Arc;
use tracing::{info, warn};

/// Result of a refresh attempt.
///
/// Failure carries the reason for logging, but the lifecycle contract is
/// presence-or-absence: callers that only need the token use
/// [`into_token`](Self::into_token).
#[derive(Debug)]
pub enum RefreshOutcome {
    /// A new access token was obtained and stored in the session.
    Refreshed(String),

    /// The session holds no refresh token; no call was made.
    NoRefreshToken,

    /// The refresh call failed. The stored refresh token is left in place;
    /// dropping it is session policy, not the manager's call.
    Failed(AuthError),
}

impl RefreshOutcome {
    pub fn into_token(self) -> Option<String> {
        match self {
            RefreshOutcome::Refreshed(token) => Some(token),
            RefreshOutcome::NoRefreshToken | RefreshOutcome::Failed(_) => None,
        }
    }
}

/// Drives authorization, code redemption, and token refresh for sessions.
pub struct TokenManager {
    factory: ClientFactory,
    provider: Arc<dyn IdentityClient>,
    redirect_uri: String,
}

impl TokenManager {
    /// Creates a manager whose callback URL is derived from the service's
    /// own base URL.
    pub fn new(factory: ClientFactory, provider: Arc<dyn IdentityClient>, base_url: &str) -> Self {
        Self {
            factory,
            provider,
            redirect_uri: format!("{}/auth/callback", base_url.trim_end_matches('/')),
        }
    }

    /// The redirect URI presented to the provider.
    pub fn redirect_uri(&self) -> &str {
        &self.redirect_uri
    }

    /// Builds the provider authorization URL for the fixed scope set.
    ///
    /// # Returns
    /// * `Ok(String)` - Redirect target for the browser
    /// * `Err(AuthError::NotConfigured)` - No usable client credentials
    pub fn authorization_url(&self, state: Option<&str>) -> Result<String, AuthError> {
        let descriptor = self.factory.descriptor()?;
        let scope = OAUTH_SCOPES.join(" ");

        let mut url = format!(
            "{}/oauth2/v2.0/authorize?client_id={}&response_type=code&redirect_uri={}&response_mode=query&scope={}",
            descriptor.authority,
            urlencoding::encode(&descriptor.client_id),
            urlencoding::encode(&self.redirect_uri),
            urlencoding::encode(&scope)
        );
        if let Some(state) = state {
            url.push_str(&format!("&state={}", urlencoding::encode(state)));
        }

        Ok(url)
    }

    /// Redeems a single-use authorization code.
    ///
    /// One shot: a failed exchange propagates and is never retried, since
    /// the code is already spent. On success the caller stores all three
    /// fields of the returned set into the session.
    pub async fn redeem_code(&self, code: &str) -> Result<TokenSet, AuthError> {
        let descriptor = self.factory.descriptor()?;
        self.provider
            .redeem_code(&descriptor, code, &self.redirect_uri, OAUTH_SCOPES)
            .await
    }

    /// Pure read of the session's access token. No network, no refresh.
    pub fn current_access_token(&self, session: &SessionTokens) -> Option<String> {
        session.access_token.clone()
    }

    /// Attempts a refresh with the session's stored refresh token.
    ///
    /// On success the access token is always replaced, while the refresh
    /// token and account are replaced only when the provider returned new
    /// values (rotation is provider-controlled). On failure the session is
    /// left untouched, refresh token included.
    pub async fn refresh_access_token(&self, session: &mut SessionTokens) -> RefreshOutcome {
        let Some(refresh_token) = session.refresh_token.clone() else {
            return RefreshOutcome::NoRefreshToken;
        };

        let descriptor = match self.factory.descriptor() {
            Ok(descriptor) => descriptor,
            Err(err) => return RefreshOutcome::Failed(err),
        };

        match self
            .provider
            .refresh_token(&descriptor, &refresh_token, OAUTH_SCOPES)
            .await
        {
            Ok(set) => {
                session.access_token = Some(set.access_token.clone());
                if set.refresh_token.is_some() {
                    session.refresh_token = set.refresh_token;
                }
                if set.account.is_some() {
                    session.account = set.account;
                }
                RefreshOutcome::Refreshed(set.access_token)
            }
            Err(err) => RefreshOutcome::Failed(err),
        }
    }

    /// Returns a valid access token for the session, or none.
    ///
    /// Composite: the stored token if present, else one refresh attempt.
    /// Never raises; a refresh failure is logged here and reported as
    /// absence so the caller can fall back to a fresh sign-in.
    pub async fn valid_access_token(&self, session: &mut SessionTokens) -> Option<String> {
        if let Some(token) = self.current_access_token(session) {
            return Some(token);
        }

        match self.refresh_access_token(session).await {
            RefreshOutcome::Refreshed(token) => {
                info!("access token refreshed");
                Some(token)
            }
            RefreshOutcome::NoRefreshToken => None,
            RefreshOutcome::Failed(err) => {
                warn!(error = %err, "token refresh failed, treating session as signed out");
                None
            }
        }
    }

    /// Drops the memoized client descriptor (see [`ClientFactory::invalidate`]).
    pub fn invalidate_client(&self) {
        self.factory.invalidate();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::factory::ClientDescriptor;
    use crate::auth::AccountInfo;
    use crate::vault::{CredentialVault, DerivedKey, ProviderCredentials, SecretCipher};
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tempfile::TempDir;

    #[derive(Default)]
    struct CallCounts {
        redeem: usize,
        refresh: usize,
    }

    /// Provider double with canned responses and call counters.
    struct MockProvider {
        redeem_response: Option<TokenSet>,
        refresh_response: Option<TokenSet>,
        calls: Mutex<CallCounts>,
    }

    impl MockProvider {
        fn new() -> Self {
            Self {
                redeem_response: None,
                refresh_response: None,
                calls: Mutex::new(CallCounts::default()),
            }
        }

        fn with_refresh(mut self, set: TokenSet) -> Self {
            self.refresh_response = Some(set);
            self
        }

        fn with_redeem(mut self, set: TokenSet) -> Self {
            self.redeem_response = Some(set);
            self
        }

        fn refresh_calls(&self) -> usize {
            self.calls.lock().unwrap().refresh
        }

        fn redeem_calls(&self) -> usize {
            self.calls.lock().unwrap().redeem
        }
    }

    #[async_trait]
    impl IdentityClient for MockProvider {
        async fn redeem_code(
            &self,
            _descriptor: &ClientDescriptor,
            _code: &str,
            _redirect_uri: &str,
            _scopes: &[&str],
        ) -> Result<TokenSet, AuthError> {
            self.calls.lock().unwrap().redeem += 1;
            self.redeem_response
                .clone()
                .ok_or_else(|| AuthError::Exchange("exchange rejected".to_string()))
        }

        async fn refresh_token(
            &self,
            _descriptor: &ClientDescriptor,
            _refresh_token: &str,
            _scopes: &[&str],
        ) -> Result<TokenSet, AuthError> {
            self.calls.lock().unwrap().refresh += 1;
            self.refresh_response
                .clone()
                .ok_or_else(|| AuthError::Refresh("refresh rejected".to_string()))
        }
    }

    fn token_set(access: &str, refresh: Option<&str>) -> TokenSet {
        TokenSet {
            access_token: access.to_string(),
            refresh_token: refresh.map(str::to_string),
            account: None,
        }
    }

    fn create_manager(
        provider: MockProvider,
        configured: bool,
    ) -> (TempDir, Arc<MockProvider>, TokenManager) {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let vault = Arc::new(CredentialVault::new(
            dir.path().join(".credentials.enc"),
            SecretCipher::new(DerivedKey::from_master_secret("test-secret")),
        ));
        if configured {
            vault
                .set(ProviderCredentials {
                    client_id: "app-id".to_string(),
                    client_secret: "app-secret".to_string(),
                    ..ProviderCredentials::default()
                })
                .expect("Failed to seed vault");
        }

        let provider = Arc::new(provider);
        let manager = TokenManager::new(
            ClientFactory::new(vault),
            provider.clone(),
            "http://localhost:3000",
        );
        (dir, provider, manager)
    }

    #[test]
    fn test_authorization_url_parameters() {
        let (_dir, _provider, manager) = create_manager(MockProvider::new(), true);

        let url = manager
            .authorization_url(Some("state-token"))
            .expect("url missing");
        assert!(url.starts_with(
            "https://login.microsoftonline.com/common/oauth2/v2.0/authorize?client_id=app-id"
        ));
        assert!(url.contains("response_type=code"));
        assert!(url.contains("redirect_uri=http%3A%2F%2Flocalhost%3A3000%2Fauth%2Fcallback"));
        assert!(url.contains("scope=Mail.Read%20Mail.ReadWrite%20offline_access%20openid%20profile"));
        assert!(url.contains("state=state-token"));
    }

    #[test]
    fn test_authorization_url_without_state() {
        let (_dir, _provider, manager) = create_manager(MockProvider::new(), true);

        let url = manager.authorization_url(None).unwrap();
        assert!(!url.contains("state="));
    }

    #[test]
    fn test_authorization_url_not_configured() {
        let (_dir, _provider, manager) = create_manager(MockProvider::new(), false);
        assert!(matches!(
            manager.authorization_url(None),
            Err(AuthError::NotConfigured)
        ));
    }

    #[tokio::test]
    async fn test_redeem_code_returns_token_set() {
        let provider = MockProvider::new().with_redeem(TokenSet {
            access_token: "at-1".to_string(),
            refresh_token: Some("rt-1".to_string()),
            account: Some(AccountInfo {
                username: "pat@contoso.com".to_string(),
                name: None,
            }),
        });
        let (_dir, provider, manager) = create_manager(provider, true);

        let set = manager.redeem_code("auth-code").await.expect("redeem failed");
        assert_eq!(set.access_token, "at-1");
        assert_eq!(set.refresh_token, Some("rt-1".to_string()));
        assert_eq!(provider.redeem_calls(), 1);
    }

    #[tokio::test]
    async fn test_redeem_code_propagates_failure() {
        let (_dir, provider, manager) = create_manager(MockProvider::new(), true);

        let result = manager.redeem_code("spent-code").await;
        assert!(matches!(result, Err(AuthError::Exchange(_))));

        // One shot, never retried
        assert_eq!(provider.redeem_calls(), 1);
    }

    #[tokio::test]
    async fn test_redeem_code_not_configured_skips_provider() {
        let (_dir, provider, manager) = create_manager(MockProvider::new(), false);

        let result = manager.redeem_code("auth-code").await;
        assert!(matches!(result, Err(AuthError::NotConfigured)));
        assert_eq!(provider.redeem_calls(), 0);
    }

    #[tokio::test]
    async fn test_current_token_is_pure_read() {
        let (_dir, provider, manager) = create_manager(MockProvider::new(), true);

        let session = SessionTokens {
            access_token: Some("at-1".to_string()),
            ..SessionTokens::default()
        };
        assert_eq!(
            manager.current_access_token(&session),
            Some("at-1".to_string())
        );
        assert_eq!(provider.refresh_calls(), 0);
    }

    #[tokio::test]
    async fn test_valid_token_uses_stored_token_without_network() {
        let (_dir, provider, manager) = create_manager(MockProvider::new(), true);

        let mut session = SessionTokens {
            access_token: Some("at-1".to_string()),
            refresh_token: Some("rt-1".to_string()),
            ..SessionTokens::default()
        };
        assert_eq!(
            manager.valid_access_token(&mut session).await,
            Some("at-1".to_string())
        );
        assert_eq!(provider.refresh_calls(), 0);
    }

    #[tokio::test]
    async fn test_valid_token_refreshes_and_keeps_old_refresh_token() {
        // Provider returns a new access token but no rotated refresh token
        let provider = MockProvider::new().with_refresh(token_set("at-2", None));
        let (_dir, provider, manager) = create_manager(provider, true);

        let mut session = SessionTokens {
            access_token: None,
            refresh_token: Some("rt1".to_string()),
            ..SessionTokens::default()
        };

        assert_eq!(
            manager.valid_access_token(&mut session).await,
            Some("at-2".to_string())
        );
        assert_eq!(session.access_token, Some("at-2".to_string()));
        assert_eq!(session.refresh_token, Some("rt1".to_string()));
        assert_eq!(provider.refresh_calls(), 1);
    }

    #[tokio::test]
    async fn test_refresh_rotates_token_when_provider_returns_one() {
        let provider = MockProvider::new().with_refresh(TokenSet {
            access_token: "at-2".to_string(),
            refresh_token: Some("rt2".to_string()),
            account: Some(AccountInfo {
                username: "pat@contoso.com".to_string(),
                name: Some("Pat Jones".to_string()),
            }),
        });
        let (_dir, _provider, manager) = create_manager(provider, true);

        let mut session = SessionTokens {
            access_token: None,
            refresh_token: Some("rt1".to_string()),
            ..SessionTokens::default()
        };

        let outcome = manager.refresh_access_token(&mut session).await;
        assert!(matches!(outcome, RefreshOutcome::Refreshed(_)));
        assert_eq!(session.refresh_token, Some("rt2".to_string()));
        assert_eq!(session.account.as_ref().unwrap().username, "pat@contoso.com");
    }

    #[tokio::test]
    async fn test_refresh_failure_returns_absent_and_keeps_refresh_token() {
        // MockProvider::new() fails every refresh
        let (_dir, provider, manager) = create_manager(MockProvider::new(), true);

        let mut session = SessionTokens {
            access_token: None,
            refresh_token: Some("expired".to_string()),
            ..SessionTokens::default()
        };

        assert_eq!(manager.valid_access_token(&mut session).await, None);

        // The dead refresh token is left for session policy to clear
        assert_eq!(session.refresh_token, Some("expired".to_string()));
        assert_eq!(session.access_token, None);
        assert_eq!(provider.refresh_calls(), 1);
    }

    #[tokio::test]
    async fn test_no_refresh_token_makes_no_network_call() {
        let (_dir, provider, manager) = create_manager(MockProvider::new(), true);

        let mut session = SessionTokens::default();
        assert_eq!(manager.valid_access_token(&mut session).await, None);

        let outcome = manager.refresh_access_token(&mut session).await;
        assert!(matches!(outcome, RefreshOutcome::NoRefreshToken));
        assert_eq!(provider.refresh_calls(), 0);
    }

    #[tokio::test]
    async fn test_refresh_outcome_into_token() {
        assert_eq!(
            RefreshOutcome::Refreshed("at".to_string()).into_token(),
            Some("at".to_string())
        );
        assert_eq!(RefreshOutcome::NoRefreshToken.into_token(), None);
        assert_eq!(
            RefreshOutcome::Failed(AuthError::Refresh("x".to_string())).into_token(),
            None
        );
    }
}
