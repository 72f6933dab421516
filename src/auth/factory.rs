//! Lazily constructed OAuth client descriptor.
//!
//! One descriptor exists at a time, built on first use from the merged
//! environment+vault credentials and memoized until invalidated or until
//! the vault is written again.

use super::AuthError;
use crate::vault::CredentialVault;
use std::sync::{Arc, RwLock};

/// Authority base URL for the Microsoft identity platform.
pub const AUTHORITY_BASE: &str = "https://login.microsoftonline.com";

/// The OAuth client identity used for all token operations.
///
/// Logical value, never persisted. The authority URL carries the tenant,
/// so a tenant change produces a different descriptor.
#[derive(Clone, Debug, PartialEq)]
pub struct ClientDescriptor {
    pub client_id: String,
    pub client_secret: String,
    pub authority: String,
}

struct CachedDescriptor {
    generation: u64,
    descriptor: Arc<ClientDescriptor>,
}

/// Builds and memoizes the client descriptor.
///
/// The memo is tagged with the vault's write generation: a descriptor built
/// before the latest credential write is rebuilt on the next call, so even
/// a caller that forgets [`invalidate`](Self::invalidate) can never operate
/// with a stale secret.
pub struct ClientFactory {
    vault: Arc<CredentialVault>,
    cached: RwLock<Option<CachedDescriptor>>,
}

impl ClientFactory {
    pub fn new(vault: Arc<CredentialVault>) -> Self {
        Self {
            vault,
            cached: RwLock::new(None),
        }
    }

    /// Returns the current descriptor, building it if needed.
    ///
    /// # Returns
    /// * `Ok(Arc<ClientDescriptor>)` - Memoized or freshly built descriptor
    /// * `Err(AuthError::NotConfigured)` - Merged credentials are incomplete
    pub fn descriptor(&self) -> Result<Arc<ClientDescriptor>, AuthError> {
        let generation = self.vault.generation();
        if let Some(cached) = self.cached.read().unwrap().as_ref() {
            if cached.generation == generation {
                return Ok(Arc::clone(&cached.descriptor));
            }
        }

        let merged = self.vault.merged();
        if !merged.has_client_credentials() {
            return Err(AuthError::NotConfigured);
        }

        let descriptor = Arc::new(ClientDescriptor {
            client_id: merged.client_id,
            client_secret: merged.client_secret,
            authority: format!("{}/{}", AUTHORITY_BASE, merged.tenant_id),
        });

        *self.cached.write().unwrap() = Some(CachedDescriptor {
            generation,
            descriptor: Arc::clone(&descriptor),
        });
        Ok(descriptor)
    }

    /// Drops the memoized descriptor so the next call rebuilds it.
    ///
    /// Called after every successful credential write, and available to
    /// operators rotating environment overrides at runtime.
    pub fn invalidate(&self) {
        *self.cached.write().unwrap() = None;
    }
}
