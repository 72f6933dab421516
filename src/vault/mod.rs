//! Encrypted single-record credential vault.
//!
//! Stores the operator's provider credentials (identity client ID and
//! secret, tenant ID, LLM API key) together with default content blocks in
//! one AES-256-GCM encrypted file.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │       CredentialVault                    │
//! │  - get / set / merged view               │
//! │  - in-memory cache, write generation     │
//! └─────────────────────────────────────────┘
//!          ↓                    ↑
//!    (encrypt)            (decrypt)
//!          ↓                    ↑
//! ┌─────────────────────────────────────────┐
//! │       SecretCipher                       │
//! │  - AES-256-GCM                           │
//! │  - Key derived from operator secret      │
//! └─────────────────────────────────────────┘
//!          ↓                    ↑
//! ┌─────────────────────────────────────────┐
//! │       Vault file                         │
//! │  - base64(ciphertext || nonce || tag)    │
//! │  - owner-only permissions                │
//! └─────────────────────────────────────────┘
//! ```
//!
//! # Security
//!
//! - The whole record is encrypted at rest with AES-256-GCM
//! - Every write uses a fresh random nonce
//! - The key is derived per process from an operator secret, never stored
//! - Authenticated encryption (tampering surfaces as an empty vault)
//! - A corrupt or missing file reads as "not configured", never as a crash

use serde::{Deserialize, Serialize};
use thiserror::Error;

mod cipher;
mod store;

pub use cipher::{
    CipherError, DerivedKey, SecretCipher, DEV_SESSION_SECRET, ENCRYPTION_KEY_ENV,
    SESSION_SECRET_ENV,
};
pub use store::{CredentialVault, EnvOverrides, MergedCredentials};

/// Sentinel tenant ID meaning "any tenant" on the identity provider.
pub const DEFAULT_TENANT: &str = "common";

/// Errors produced by vault writes.
///
/// Reads never surface errors; a vault that cannot be read is reported as
/// absent.
#[derive(Debug, Error)]
pub enum VaultError {
    /// The candidate record is missing a client ID or client secret.
    #[error("client ID and client secret are required")]
    MissingClientCredentials,

    /// The record could not be serialized for encryption.
    #[error("failed to serialize credentials: {0}")]
    Serialize(#[from] serde_json::Error),

    /// Encryption failed.
    #[error("failed to encrypt credentials: {0}")]
    Cipher(#[from] CipherError),

    /// The vault file could not be written.
    #[error("failed to write vault file: {0}")]
    Io(#[from] std::io::Error),
}

/// Static text fragments used when drafting replies.
///
/// Not secrets, but stored alongside the credentials for convenience.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DefaultBlocks {
    #[serde(default)]
    pub opener: String,

    #[serde(default)]
    pub closing: String,

    #[serde(default)]
    pub signature: String,
}

/// The vaulted secret record.
///
/// Replaced wholesale on every `set`; there is no partial-field update. A
/// record is valid only when both `client_id` and `client_secret` are
/// non-empty.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ProviderCredentials {
    /// Identity-provider application (client) ID
    pub client_id: String,

    /// Identity-provider client secret
    pub client_secret: String,

    /// Identity-provider tenant ID (defaults to the "common" sentinel)
    #[serde(default)]
    pub tenant_id: String,

    /// LLM API key (may be empty; drafting degrades rather than fails)
    #[serde(default)]
    pub openai_api_key: String,

    /// Default content blocks for drafted replies
    #[serde(default)]
    pub default_blocks: DefaultBlocks,
}

impl ProviderCredentials {
    /// Trims every string field and applies the tenant sentinel.
    pub(crate) fn normalize(&mut self) {
        self.client_id = self.client_id.trim().to_string();
        self.client_secret = self.client_secret.trim().to_string();
        self.tenant_id = self.tenant_id.trim().to_string();
        self.openai_api_key = self.openai_api_key.trim().to_string();
        self.default_blocks.opener = self.default_blocks.opener.trim().to_string();
        self.default_blocks.closing = self.default_blocks.closing.trim().to_string();
        self.default_blocks.signature = self.default_blocks.signature.trim().to_string();

        if self.tenant_id.is_empty() {
            self.tenant_id = DEFAULT_TENANT.to_string();
        }
    }
}
