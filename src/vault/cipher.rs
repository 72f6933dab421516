//! AES-256-GCM encryption for the credential vault.
//!
//! The vault record is encrypted as a whole with a unique nonce per write.
//! The 32-byte key is derived from an operator secret and lives in memory
//! only; it is never persisted.

use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use pbkdf2::pbkdf2_hmac;
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Size of the encryption key in bytes (256 bits)
const KEY_SIZE: usize = 32;

/// Size of the nonce in bytes (96 bits, standard for GCM)
const NONCE_SIZE: usize = 12;

/// Size of the authentication tag in bytes (128 bits)
const TAG_SIZE: usize = 16;

/// Salt for the session-secret derivation path. Carries a version tag so a
/// future change to the derivation never silently reinterprets old blobs.
const KDF_SALT: &[u8] = b"mailpilot-credentials-v1";

/// PBKDF2-HMAC-SHA256 iteration count for the session-secret path.
const KDF_ROUNDS: u32 = 600_000;

/// Environment variable for the dedicated high-entropy master secret.
pub const ENCRYPTION_KEY_ENV: &str = "MAILPILOT_ENCRYPTION_KEY";

/// Environment variable for the lower-entropy session secret fallback.
pub const SESSION_SECRET_ENV: &str = "MAILPILOT_SESSION_SECRET";

/// Session secret used outside production when none is configured.
pub const DEV_SESSION_SECRET: &str = "dev-secret";

/// Errors produced by vault encryption and decryption.
///
/// Decryption fails closed: a wrong key, a tampered blob, and a truncated
/// blob all surface as errors here and never as partial plaintext.
#[derive(Debug, Error)]
pub enum CipherError {
    /// Blob is not valid base64 or is shorter than nonce + tag.
    #[error("encrypted blob is malformed")]
    MalformedBlob,

    /// Cipher construction or sealing failed.
    #[error("encryption failed")]
    EncryptFailed,

    /// Authentication tag did not verify (wrong key or corrupted data).
    #[error("decryption failed (wrong key or corrupted data)")]
    DecryptFailed,
}

/// 32-byte symmetric key derived from an operator secret.
///
/// Two derivation paths, tried in priority order:
/// 1. A dedicated encryption secret is hashed once with SHA-256. The secret
///    is expected to be high-entropy, so no stretching is applied.
/// 2. The session secret is stretched with PBKDF2-HMAC-SHA256 under a fixed
///    versioned salt, since session secrets tend to be low-entropy
///    passphrases.
///
/// Key bytes never leave this module; other components hold a
/// [`SecretCipher`], not the key.
pub struct DerivedKey([u8; KEY_SIZE]);

impl DerivedKey {
    /// Derives the key from a dedicated high-entropy master secret.
    pub fn from_master_secret(secret: &str) -> Self {
        Self(Sha256::digest(secret.as_bytes()).into())
    }

    /// Derives the key from a session secret via the expensive KDF path.
    pub fn from_session_secret(secret: &str) -> Self {
        let mut key = [0u8; KEY_SIZE];
        pbkdf2_hmac::<Sha256>(secret.as_bytes(), KDF_SALT, KDF_ROUNDS, &mut key);
        Self(key)
    }

    /// Derives the key from the process environment.
    ///
    /// Prefers `MAILPILOT_ENCRYPTION_KEY`; falls back to
    /// `MAILPILOT_SESSION_SECRET`, and finally to the development session
    /// secret. Startup validation rejects the development fallback in
    /// production before this runs.
    pub fn from_env() -> Self {
        Self::from_secrets(
            std::env::var(ENCRYPTION_KEY_ENV).ok(),
            std::env::var(SESSION_SECRET_ENV).ok(),
        )
    }

    /// Applies the derivation priority order to already-read secrets.
    ///
    /// Values are trimmed, and blank values count as absent, the same
    /// filtering the startup secret checks apply.
    fn from_secrets(encryption_key: Option<String>, session_secret: Option<String>) -> Self {
        if let Some(secret) = non_blank(encryption_key) {
            return Self::from_master_secret(&secret);
        }
        match non_blank(session_secret) {
            Some(secret) => Self::from_session_secret(&secret),
            None => Self::from_session_secret(DEV_SESSION_SECRET),
        }
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Authenticated encryption for the vault file.
///
/// Produces and consumes the at-rest blob format:
/// `base64(ciphertext || nonce(12) || tag(16))`. A fresh random nonce is
/// generated inside `encrypt` on every call, so nonce reuse cannot be
/// caused by a caller.
pub struct SecretCipher {
    key: DerivedKey,
}

impl SecretCipher {
    /// Creates a cipher from an already-derived key.
    pub fn new(key: DerivedKey) -> Self {
        Self { key }
    }

    /// Creates a cipher keyed from the process environment.
    pub fn from_env() -> Self {
        Self::new(DerivedKey::from_env())
    }

    /// Encrypts plaintext into a base64 blob.
    ///
    /// # Returns
    /// * `Ok(String)` - `base64(ciphertext || nonce || tag)`
    /// * `Err(CipherError::EncryptFailed)` - If sealing fails
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<String, CipherError> {
        let cipher =
            Aes256Gcm::new_from_slice(&self.key.0).map_err(|_| CipherError::EncryptFailed)?;

        // Generate random nonce (never reuse!)
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);

        // aes-gcm returns ciphertext with the tag appended; the blob layout
        // places the nonce between them.
        let sealed = cipher
            .encrypt(&nonce, plaintext)
            .map_err(|_| CipherError::EncryptFailed)?;
        let tag_at = sealed.len() - TAG_SIZE;

        let mut blob = Vec::with_capacity(sealed.len() + NONCE_SIZE);
        blob.extend_from_slice(&sealed[..tag_at]);
        blob.extend_from_slice(&nonce);
        blob.extend_from_slice(&sealed[tag_at..]);

        Ok(BASE64.encode(&blob))
    }

    /// Decrypts a base64 blob produced by [`encrypt`](Self::encrypt).
    ///
    /// A blob shorter than nonce + tag is rejected before any decryption is
    /// attempted.
    ///
    /// # Returns
    /// * `Ok(Vec<u8>)` - Verified plaintext
    /// * `Err(CipherError::MalformedBlob)` - Bad base64 or truncated blob
    /// * `Err(CipherError::DecryptFailed)` - Tag verification failed
    pub fn decrypt(&self, blob: &str) -> Result<Vec<u8>, CipherError> {
        let bytes = BASE64.decode(blob).map_err(|_| CipherError::MalformedBlob)?;
        if bytes.len() < NONCE_SIZE + TAG_SIZE {
            return Err(CipherError::MalformedBlob);
        }

        let tag_at = bytes.len() - TAG_SIZE;
        let nonce_at = tag_at - NONCE_SIZE;

        // Reassemble ciphertext || tag, the layout aes-gcm verifies.
        let mut sealed = Vec::with_capacity(bytes.len() - NONCE_SIZE);
        sealed.extend_from_slice(&bytes[..nonce_at]);
        sealed.extend_from_slice(&bytes[tag_at..]);

        let cipher =
            Aes256Gcm::new_from_slice(&self.key.0).map_err(|_| CipherError::DecryptFailed)?;
        let nonce = Nonce::from_slice(&bytes[nonce_at..tag_at]);

        cipher
            .decrypt(nonce, sealed.as_ref())
            .map_err(|_| CipherError::DecryptFailed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_cipher() -> SecretCipher {
        SecretCipher::new(DerivedKey::from_master_secret("test-master-secret"))
    }

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let cipher = test_cipher();
        let plaintext = b"{\"identity_client_id\":\"abc\"}";

        let blob = cipher.encrypt(plaintext).expect("Encryption failed");
        assert_ne!(blob.as_bytes(), plaintext);

        let decrypted = cipher.decrypt(&blob).expect("Decryption failed");
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn test_blob_layout() {
        let cipher = test_cipher();
        let plaintext = b"ten bytes!";

        let blob = cipher.encrypt(plaintext).unwrap();
        let bytes = BASE64.decode(&blob).unwrap();

        // ciphertext || nonce(12) || tag(16)
        assert_eq!(bytes.len(), plaintext.len() + NONCE_SIZE + TAG_SIZE);
    }

    #[test]
    fn test_empty_plaintext_roundtrip() {
        let cipher = test_cipher();

        let blob = cipher.encrypt(b"").unwrap();
        let bytes = BASE64.decode(&blob).unwrap();
        assert_eq!(bytes.len(), NONCE_SIZE + TAG_SIZE);

        assert_eq!(cipher.decrypt(&blob).unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn test_different_nonces() {
        let cipher = test_cipher();
        let plaintext = b"same-plaintext";

        // Encrypt twice
        let blob1 = cipher.encrypt(plaintext).unwrap();
        let blob2 = cipher.encrypt(plaintext).unwrap();

        // Blobs should differ (random nonces)
        assert_ne!(blob1, blob2);

        // Both should decrypt correctly
        assert_eq!(cipher.decrypt(&blob1).unwrap(), plaintext);
        assert_eq!(cipher.decrypt(&blob2).unwrap(), plaintext);
    }

    #[test]
    fn test_same_secret_decrypts_across_instances() {
        let blob = SecretCipher::new(DerivedKey::from_master_secret("shared"))
            .encrypt(b"secret")
            .unwrap();

        let other = SecretCipher::new(DerivedKey::from_master_secret("shared"));
        assert_eq!(other.decrypt(&blob).unwrap(), b"secret");
    }

    #[test]
    fn test_wrong_key_fails() {
        let blob = SecretCipher::new(DerivedKey::from_master_secret("secret-one"))
            .encrypt(b"secret")
            .unwrap();

        let other = SecretCipher::new(DerivedKey::from_master_secret("secret-two"));
        assert!(matches!(
            other.decrypt(&blob),
            Err(CipherError::DecryptFailed)
        ));
    }

    #[test]
    fn test_session_secret_roundtrip() {
        let cipher = SecretCipher::new(DerivedKey::from_session_secret("session-passphrase"));
        let plaintext = b"{\"identity_client_id\":\"abc\"}";

        let blob = cipher.encrypt(plaintext).expect("Encryption failed");
        assert_eq!(cipher.decrypt(&blob).expect("Decryption failed"), plaintext);

        // A second instance stretched from the same secret reads the blob
        let other = SecretCipher::new(DerivedKey::from_session_secret("session-passphrase"));
        assert_eq!(other.decrypt(&blob).unwrap(), plaintext);
    }

    #[test]
    fn test_derivation_paths_differ() {
        // The same operator secret must yield different keys on the hash
        // path and the KDF path.
        let hashed = SecretCipher::new(DerivedKey::from_master_secret("secret"));
        let stretched = SecretCipher::new(DerivedKey::from_session_secret("secret"));

        let blob = hashed.encrypt(b"payload").unwrap();
        assert!(stretched.decrypt(&blob).is_err());
        assert_eq!(hashed.decrypt(&blob).unwrap(), b"payload");
    }

    #[test]
    fn test_blank_secrets_fall_back_to_dev() {
        // An exported-but-blank secret keys the vault the same way as an
        // absent one.
        let blank = SecretCipher::new(DerivedKey::from_secrets(
            Some("".to_string()),
            Some("   ".to_string()),
        ));
        let dev = SecretCipher::new(DerivedKey::from_session_secret(DEV_SESSION_SECRET));

        let blob = blank.encrypt(b"payload").unwrap();
        assert_eq!(dev.decrypt(&blob).unwrap(), b"payload");
    }

    #[test]
    fn test_dedicated_key_preferred_and_trimmed() {
        let resolved = SecretCipher::new(DerivedKey::from_secrets(
            Some("  master  ".to_string()),
            Some("session".to_string()),
        ));
        let master = SecretCipher::new(DerivedKey::from_master_secret("master"));

        let blob = resolved.encrypt(b"payload").unwrap();
        assert_eq!(master.decrypt(&blob).unwrap(), b"payload");
    }

    #[test]
    fn test_tampered_blob_fails() {
        let cipher = test_cipher();
        let blob = cipher.encrypt(b"secret payload").unwrap();

        // Flip one bit anywhere in the decoded blob
        let bytes = BASE64.decode(&blob).unwrap();
        for i in 0..bytes.len() {
            let mut tampered = bytes.clone();
            tampered[i] ^= 0x01;
            assert!(
                cipher.decrypt(&BASE64.encode(&tampered)).is_err(),
                "bit flip at byte {} went undetected",
                i
            );
        }

        // Sanity: untouched blob still decrypts
        assert!(cipher.decrypt(&BASE64.encode(&bytes)).is_ok());
    }

    #[test]
    fn test_short_blob_rejected() {
        let cipher = test_cipher();

        // One byte short of nonce + tag
        let short = BASE64.encode(&[0u8; NONCE_SIZE + TAG_SIZE - 1]);
        assert!(matches!(
            cipher.decrypt(&short),
            Err(CipherError::MalformedBlob)
        ));

        assert!(matches!(
            cipher.decrypt(""),
            Err(CipherError::MalformedBlob)
        ));
    }

    #[test]
    fn test_invalid_base64_rejected() {
        let cipher = test_cipher();
        assert!(matches!(
            cipher.decrypt("not-valid-base64!@#$"),
            Err(CipherError::MalformedBlob)
        ));
    }
}
