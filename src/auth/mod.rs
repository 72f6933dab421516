//! OAuth client construction and token lifecycle.
//!
//! Three pieces layered over the credential vault:
//!
//! - [`ClientFactory`] builds and memoizes the OAuth client descriptor from
//!   the merged environment+vault credentials
//! - [`IdentityClient`] is the outbound provider abstraction (code
//!   redemption, refresh grant); [`MicrosoftIdentityClient`] is the shipped
//!   implementation
//! - [`TokenManager`] drives per-session access/refresh token state and
//!   exposes the one query request handlers need: a valid access token or
//!   none

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod client;
pub mod factory;
pub mod manager;

pub use client::{IdentityClient, MicrosoftIdentityClient};
pub use factory::{ClientDescriptor, ClientFactory};
pub use manager::{RefreshOutcome, TokenManager};

/// Errors crossing the auth component boundary.
#[derive(Debug, Error)]
pub enum AuthError {
    /// Provider credentials are incomplete; sign-in cannot be offered.
    #[error("identity provider credentials are not configured")]
    NotConfigured,

    /// Authorization-code exchange failed. Codes are single-use, so the
    /// exchange is never retried.
    #[error("authorization code exchange failed: {0}")]
    Exchange(String),

    /// Refresh-token grant failed.
    #[error("token refresh failed: {0}")]
    Refresh(String),
}

/// Identity claims describing the signed-in account.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AccountInfo {
    /// Primary identifier shown to the user (usually their email address)
    pub username: String,

    /// Display name, when the provider supplies one
    pub name: Option<String>,
}

/// Token material returned by a successful exchange or refresh.
///
/// The provider may omit the refresh token and account; callers keep their
/// previous values in that case.
#[derive(Clone, Debug, PartialEq)]
pub struct TokenSet {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub account: Option<AccountInfo>,
}

/// Per-session token state, owned by the session store.
///
/// The token manager reads and mutates these three fields and nothing
/// else; it never creates or destroys the session itself.
#[derive(Clone, Debug, Default)]
pub struct SessionTokens {
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub account: Option<AccountInfo>,
}
