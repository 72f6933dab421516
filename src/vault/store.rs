//! Durable storage for the provider credential record.
//!
//! One record, one encrypted file. Reads are cache-first; a missing or
//! undecryptable file reads as an empty vault. Writes replace the record
//! wholesale and update the cache only after the file write lands.

use super::{DefaultBlocks, ProviderCredentials, SecretCipher, VaultError, DEFAULT_TENANT};
use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tracing::{debug, warn};

/// Environment variable overriding the vaulted client ID.
pub const CLIENT_ID_ENV: &str = "MAILPILOT_CLIENT_ID";

/// Environment variable overriding the vaulted client secret.
pub const CLIENT_SECRET_ENV: &str = "MAILPILOT_CLIENT_SECRET";

/// Environment variable overriding the vaulted tenant ID.
pub const TENANT_ID_ENV: &str = "MAILPILOT_TENANT_ID";

/// Environment variable overriding the vaulted LLM API key.
pub const OPENAI_API_KEY_ENV: &str = "MAILPILOT_OPENAI_API_KEY";

/// Credential fields supplied by the process environment.
///
/// Blank values count as absent, so an empty exported variable does not
/// mask a vaulted value.
#[derive(Clone, Debug, Default)]
pub struct EnvOverrides {
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub tenant_id: Option<String>,
    pub openai_api_key: Option<String>,
}

impl EnvOverrides {
    /// Reads the override variables from the process environment.
    pub fn from_env() -> Self {
        Self {
            client_id: read_env(CLIENT_ID_ENV),
            client_secret: read_env(CLIENT_SECRET_ENV),
            tenant_id: read_env(TENANT_ID_ENV),
            openai_api_key: read_env(OPENAI_API_KEY_ENV),
        }
    }
}

fn read_env(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

/// The environment-over-vault credential view, merged field by field.
///
/// Fields may be empty strings when neither source provides them; the
/// tenant ID always falls back to the "common" sentinel.
#[derive(Clone, Debug, PartialEq)]
pub struct MergedCredentials {
    pub client_id: String,
    pub client_secret: String,
    pub tenant_id: String,
    pub openai_api_key: String,
}

impl MergedCredentials {
    /// True when both client ID and client secret are present.
    pub fn has_client_credentials(&self) -> bool {
        !self.client_id.is_empty() && !self.client_secret.is_empty()
    }
}

/// Encrypted single-record credential store.
///
/// # Thread Safety
/// - The cache mutex is held across the whole validate-encrypt-write
///   sequence, so concurrent `set` calls cannot interleave partial writes
/// - Reads lock the same mutex, so a read never observes a half-applied
///   replacement
///
/// # Security
/// - The record is encrypted before it touches disk
/// - The file is written with owner-only permissions (mode 0600 on unix)
/// - Writes go to a sibling temp file first and are renamed into place, so
///   a failed write never corrupts the previous record
pub struct CredentialVault {
    path: PathBuf,
    cipher: SecretCipher,
    cache: Mutex<Option<ProviderCredentials>>,
    generation: AtomicU64,
}

impl CredentialVault {
    /// Creates a vault over the given file path.
    ///
    /// The file is not touched until the first read or write; a vault whose
    /// file does not exist yet simply reads as empty.
    pub fn new(path: impl Into<PathBuf>, cipher: SecretCipher) -> Self {
        Self {
            path: path.into(),
            cipher,
            cache: Mutex::new(None),
            generation: AtomicU64::new(0),
        }
    }

    /// Replaces the stored record.
    ///
    /// The candidate is trimmed and validated first; a record without a
    /// client ID or client secret is rejected before anything is persisted.
    /// The in-memory cache is updated only after the file write completes,
    /// so a failed write keeps serving the previous record.
    ///
    /// # Returns
    /// * `Ok(())` - Record encrypted, written, and cached
    /// * `Err(VaultError::MissingClientCredentials)` - Validation failed
    /// * `Err` - Serialization, encryption, or file write failed
    pub fn set(&self, mut candidate: ProviderCredentials) -> Result<(), VaultError> {
        let mut cache = self.cache.lock().unwrap();

        candidate.normalize();
        if candidate.client_id.is_empty() || candidate.client_secret.is_empty() {
            return Err(VaultError::MissingClientCredentials);
        }

        let plaintext = serde_json::to_vec(&candidate)?;
        let blob = self.cipher.encrypt(&plaintext)?;
        self.write_blob(&blob)?;

        *cache = Some(candidate);
        self.generation.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    /// Returns the stored record, if one can be read.
    ///
    /// Cache-first; on a cold cache the file is read and decrypted. A
    /// missing file, a failed decryption, and an unparsable record all
    /// yield `None` rather than an error, since "no usable vault" is a
    /// normal state.
    pub fn get(&self) -> Option<ProviderCredentials> {
        let mut cache = self.cache.lock().unwrap();
        if let Some(credentials) = cache.as_ref() {
            return Some(credentials.clone());
        }

        let loaded = self.load_from_file()?;
        *cache = Some(loaded.clone());
        Some(loaded)
    }

    /// Returns the stored default content blocks, if a record exists.
    pub fn default_blocks(&self) -> Option<DefaultBlocks> {
        self.get().map(|credentials| credentials.default_blocks)
    }

    /// True when the merged environment+vault view has complete client
    /// credentials. This is the gate request handlers use to decide whether
    /// sign-in can be offered.
    pub fn is_configured(&self) -> bool {
        self.merged().has_client_credentials()
    }

    /// Returns the environment-over-vault merged view.
    ///
    /// The environment is re-read on every call, so exported overrides take
    /// effect without a restart.
    pub fn merged(&self) -> MergedCredentials {
        self.merged_with(EnvOverrides::from_env())
    }

    /// Merges the given overrides over the vaulted record, field by field.
    ///
    /// An override replaces only its own field; absent overrides fall
    /// through to the vaulted value.
    pub fn merged_with(&self, env: EnvOverrides) -> MergedCredentials {
        let vaulted = self.get().unwrap_or_default();

        let tenant_id = env.tenant_id.unwrap_or(vaulted.tenant_id);
        MergedCredentials {
            client_id: env.client_id.unwrap_or(vaulted.client_id),
            client_secret: env.client_secret.unwrap_or(vaulted.client_secret),
            tenant_id: if tenant_id.is_empty() {
                DEFAULT_TENANT.to_string()
            } else {
                tenant_id
            },
            openai_api_key: env.openai_api_key.unwrap_or(vaulted.openai_api_key),
        }
    }

    /// Write generation counter, bumped once per successful `set`.
    ///
    /// Lets the client factory detect that its memoized descriptor predates
    /// the latest credential write.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    fn load_from_file(&self) -> Option<ProviderCredentials> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return None,
            Err(err) => {
                debug!(error = %err, "vault file unreadable, treating as empty");
                return None;
            }
        };

        let plaintext = match self.cipher.decrypt(raw.trim()) {
            Ok(plaintext) => plaintext,
            Err(err) => {
                warn!(error = %err, "vault file undecryptable, treating as empty");
                return None;
            }
        };

        match serde_json::from_slice(&plaintext) {
            Ok(credentials) => Some(credentials),
            Err(err) => {
                warn!(error = %err, "vault record unparsable, treating as empty");
                None
            }
        }
    }

    fn write_blob(&self, blob: &str) -> Result<(), VaultError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        // A leftover temp file from an interrupted write would make
        // create_new fail; clear it first.
        let tmp_path = self.path.with_extension("enc.tmp");
        let _ = fs::remove_file(&tmp_path);

        // Owner-only from the moment the file exists, not via a later chmod.
        let mut options = fs::OpenOptions::new();
        options.write(true).create_new(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }

        {
            let mut file = options.open(&tmp_path)?;
            file.write_all(blob.as_bytes())?;
            file.sync_all()?;
        }

        fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }
}
