//! Encryption codec for whiteboard snapshots.
//!
//! DESIGN
//! ======
//! - Key derivation: Argon2id with a fixed work factor, 256-bit output, and a
//!   fresh random 16-byte salt per `encrypt` call.
//! - Cipher: AES-256-GCM with a fresh random 96-bit nonce per call. Nonces
//!   come from the OS-seeded RNG, never from a counter, because calls are
//!   stateless.
//! - Blob layout: `salt(16) ∥ iv(12) ∥ ciphertext+tag`. The text form stored
//!   on the server is standard base64.
//!
//! ERROR HANDLING
//! ==============
//! A wrong passphrase, a truncated blob, bad base64 and a failed tag check all
//! collapse into `CryptoError::Decryption`. Callers cannot tell them apart,
//! and must not retry with the same key.

use std::sync::Arc;

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use argon2::{Algorithm, Argon2, Params, Version};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use rand::Rng;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Salt length in bytes.
pub const SALT_LEN: usize = 16;
/// AES-GCM nonce length in bytes.
pub const NONCE_LEN: usize = 12;
/// AES-GCM authentication tag length in bytes.
pub const TAG_LEN: usize = 16;
/// Derived key and session key length in bytes.
pub const KEY_LEN: usize = 32;
/// Smallest blob that can possibly decrypt (empty plaintext).
pub const MIN_BLOB_LEN: usize = SALT_LEN + NONCE_LEN + TAG_LEN;

const DEFAULT_ARGON2_MEMORY_KIB: u32 = 65_536;
const DEFAULT_ARGON2_ITERATIONS: u32 = 3;
const DEFAULT_ARGON2_PARALLELISM: u32 = 4;

// =============================================================================
// ERRORS
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    /// Wrong key or corrupted data. Deliberately uninformative.
    #[error("cannot decrypt snapshot: wrong key or corrupted data")]
    Decryption,
    #[error("encryption failed")]
    Encryption,
    #[error("key derivation failed: {0}")]
    KeyDerivation(String),
    #[error("session key must be {KEY_LEN} bytes of hex")]
    InvalidSessionKey,
    #[error("crypto worker failed: {0}")]
    Worker(String),
}

impl crate::frame::ErrorCode for CryptoError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::Decryption => "E_DECRYPTION",
            Self::Encryption => "E_ENCRYPTION",
            Self::KeyDerivation(_) => "E_KEY_DERIVATION",
            Self::InvalidSessionKey => "E_INVALID_SESSION_KEY",
            Self::Worker(_) => "E_CRYPTO_WORKER",
        }
    }
}

// =============================================================================
// KEY MATERIAL
// =============================================================================

/// 256-bit session secret shared through the share link. Zeroized on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop, PartialEq, Eq)]
pub struct SessionKey {
    bytes: [u8; KEY_LEN],
}

impl SessionKey {
    /// Fresh random key material for a new whiteboard.
    #[must_use]
    pub fn generate() -> Self {
        Self { bytes: rand::rng().random() }
    }

    /// Parse 64 hex characters (either case).
    ///
    /// # Errors
    ///
    /// Returns `InvalidSessionKey` for anything that is not exactly 32 bytes of hex.
    pub fn from_hex(text: &str) -> Result<Self, CryptoError> {
        let mut bytes = [0u8; KEY_LEN];
        hex::decode_to_slice(text.trim(), &mut bytes).map_err(|_| CryptoError::InvalidSessionKey)?;
        Ok(Self { bytes })
    }

    /// Lowercase hex form. This is the passphrase fed to the KDF.
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.bytes)
    }
}

impl std::fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionKey").field("bytes", &"[REDACTED]").finish()
    }
}

/// Output of the KDF. Never leaves this module except to build a cipher.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct DerivedKey {
    bytes: [u8; KEY_LEN],
}

impl DerivedKey {
    fn cipher(&self) -> Aes256Gcm {
        Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.bytes))
    }
}

impl std::fmt::Debug for DerivedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("DerivedKey([REDACTED])")
    }
}

// =============================================================================
// CODEC
// =============================================================================

/// Argon2id work factor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KdfParams {
    pub memory_kib: u32,
    pub iterations: u32,
    pub parallelism: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            memory_kib: DEFAULT_ARGON2_MEMORY_KIB,
            iterations: DEFAULT_ARGON2_ITERATIONS,
            parallelism: DEFAULT_ARGON2_PARALLELISM,
        }
    }
}

/// Stateless snapshot codec. Cheap to copy.
#[derive(Debug, Clone, Copy, Default)]
pub struct Codec {
    params: KdfParams,
}

impl Codec {
    #[must_use]
    pub fn new(params: KdfParams) -> Self {
        Self { params }
    }

    /// Derive a 256-bit key from `passphrase` and `salt`.
    ///
    /// # Errors
    ///
    /// Returns `KeyDerivation` if the configured parameters are rejected.
    pub fn derive_key(&self, passphrase: &str, salt: &[u8]) -> Result<DerivedKey, CryptoError> {
        let params = Params::new(
            self.params.memory_kib,
            self.params.iterations,
            self.params.parallelism,
            Some(KEY_LEN),
        )
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
        let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

        let mut bytes = [0u8; KEY_LEN];
        argon2
            .hash_password_into(passphrase.as_bytes(), salt, &mut bytes)
            .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
        Ok(DerivedKey { bytes })
    }

    /// Encrypt under a fresh salt and nonce.
    ///
    /// # Errors
    ///
    /// Returns `KeyDerivation` or `Encryption` on primitive failure.
    pub fn encrypt(&self, plaintext: &[u8], passphrase: &str) -> Result<Vec<u8>, CryptoError> {
        let mut rng = rand::rng();
        let salt: [u8; SALT_LEN] = rng.random();
        let iv: [u8; NONCE_LEN] = rng.random();

        let key = self.derive_key(passphrase, &salt)?;
        let ciphertext = key
            .cipher()
            .encrypt(Nonce::from_slice(&iv), plaintext)
            .map_err(|_| CryptoError::Encryption)?;

        let mut blob = Vec::with_capacity(SALT_LEN + NONCE_LEN + ciphertext.len());
        blob.extend_from_slice(&salt);
        blob.extend_from_slice(&iv);
        blob.extend_from_slice(&ciphertext);
        Ok(blob)
    }

    /// Decrypt a `salt ∥ iv ∥ ciphertext+tag` blob.
    ///
    /// # Errors
    ///
    /// Returns `Decryption` for short blobs, wrong passphrases and tampering.
    pub fn decrypt(&self, blob: &[u8], passphrase: &str) -> Result<Vec<u8>, CryptoError> {
        if blob.len() < MIN_BLOB_LEN {
            return Err(CryptoError::Decryption);
        }
        let (salt, rest) = blob.split_at(SALT_LEN);
        let (iv, ciphertext) = rest.split_at(NONCE_LEN);

        let key = self.derive_key(passphrase, salt)?;
        key.cipher()
            .decrypt(Nonce::from_slice(iv), ciphertext)
            .map_err(|_| CryptoError::Decryption)
    }

    /// Encrypt UTF-8 text into the base64 form stored by the server.
    ///
    /// # Errors
    ///
    /// See [`Codec::encrypt`].
    pub fn encrypt_to_text(&self, plaintext: &str, passphrase: &str) -> Result<String, CryptoError> {
        Ok(STANDARD.encode(self.encrypt(plaintext.as_bytes(), passphrase)?))
    }

    /// Decrypt the base64 form back into UTF-8 text.
    ///
    /// # Errors
    ///
    /// Returns `Decryption` for bad base64, bad blobs and non-UTF-8 plaintext.
    pub fn decrypt_text(&self, text: &str, passphrase: &str) -> Result<String, CryptoError> {
        let blob = STANDARD.decode(text.trim()).map_err(|_| CryptoError::Decryption)?;
        let plaintext = self.decrypt(&blob, passphrase)?;
        String::from_utf8(plaintext).map_err(|_| CryptoError::Decryption)
    }
}

// =============================================================================
// ASYNC WRAPPERS
// =============================================================================

/// Run `encrypt_to_text` on the blocking pool so the event loop never stalls
/// on Argon2.
///
/// # Errors
///
/// See [`Codec::encrypt`]; a panicked worker maps to `Worker`.
pub async fn encrypt_off_thread(codec: Codec, plaintext: String, key: Arc<SessionKey>) -> Result<String, CryptoError> {
    tokio::task::spawn_blocking(move || codec.encrypt_to_text(&plaintext, &key.to_hex()))
        .await
        .map_err(|e| CryptoError::Worker(e.to_string()))?
}

/// Run `decrypt_text` on the blocking pool.
///
/// # Errors
///
/// See [`Codec::decrypt_text`]; a panicked worker maps to `Worker`.
pub async fn decrypt_off_thread(codec: Codec, text: String, key: Arc<SessionKey>) -> Result<String, CryptoError> {
    tokio::task::spawn_blocking(move || codec.decrypt_text(&text, &key.to_hex()))
        .await
        .map_err(|e| CryptoError::Worker(e.to_string()))?
}

#[cfg(test)]
#[path = "crypto_test.rs"]
mod tests;
