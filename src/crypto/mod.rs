//! Cryptographic primitives: Argon2id password hashing and key derivation,
//! ChaCha20-Poly1305 authenticated encryption, and key wrapping.
//!
//! ## Key hierarchy
//!
//! ```text
//! operator passphrase + master salt ──argon2──▶ master key   (memory only)
//!                                                  │
//!                 ┌────────────────────────────────┤
//!                 ▼                                ▼
//!         user key (random)                board key (random)
//!          wrapped under master             wrapped under master; for
//!          and under the user's             restricted boards also under
//!          password-derived key             each grantee's user key
//!                 │
//!                 ▼
//!         per-message ciphertext, AAD = uuid|created_at_us
//! ```
//!
//! The master key is derived once at startup from the operator passphrase
//! and the persistent master-salt row; it never touches disk. Message AAD
//! binds each ciphertext to its row so ciphertexts cannot be swapped
//! between messages without failing authentication.

use argon2::{Algorithm, Argon2, Params, Version};
use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use rand::RngCore;
use thiserror::Error;

use crate::config::CryptoConfig;

pub const KEY_LEN: usize = 32;
pub const SALT_LEN: usize = 16;
pub const NONCE_LEN: usize = 12;

#[derive(Debug, Error)]
pub enum CryptoError {
    /// A wrapped key failed to authenticate: the operator passphrase does
    /// not match the one the key was wrapped under.
    #[error("wrong passphrase: wrapped key failed to authenticate")]
    WrongPassphrase,
    /// Ciphertext failed authentication. Treated as tampering; the
    /// operation is failed, never retried with other parameters.
    #[error("ciphertext failed authentication")]
    AuthTagInvalid,
    #[error("ciphertext too short")]
    TruncatedCiphertext,
    #[error("key derivation failed: {0}")]
    Kdf(String),
    #[error("password hashing failed: {0}")]
    Password(String),
}

/// Configured Argon2id instance plus AEAD helpers. Cheap to share by
/// reference; holds no secrets.
#[derive(Debug)]
pub struct Crypto {
    argon2: Argon2<'static>,
}

impl Crypto {
    pub fn new(config: &CryptoConfig) -> Result<Self, CryptoError> {
        let params = Params::new(
            config.argon2_memory_kib,
            config.argon2_time_cost,
            config.argon2_parallelism,
            Some(KEY_LEN),
        )
        .map_err(|e| CryptoError::Kdf(e.to_string()))?;
        Ok(Self {
            argon2: Argon2::new(Algorithm::Argon2id, Version::V0x13, params),
        })
    }

    /// Hash a password into a PHC string for storage as a login verifier.
    pub fn hash_password(&self, password: &str) -> Result<String, CryptoError> {
        let salt = SaltString::generate(&mut rand::thread_rng());
        let hash = self
            .argon2
            .hash_password(password.as_bytes(), &salt)
            .map_err(|e| CryptoError::Password(e.to_string()))?;
        Ok(hash.to_string())
    }

    /// Verify a password against a stored PHC string.
    pub fn verify_password(&self, password: &str, stored: &str) -> bool {
        match PasswordHash::new(stored) {
            Ok(parsed) => self
                .argon2
                .verify_password(password.as_bytes(), &parsed)
                .is_ok(),
            Err(_) => false,
        }
    }

    /// Derive a 32-byte key from a secret and salt. Used for both the
    /// master key (operator passphrase + master salt) and per-user
    /// password keys (password + user salt).
    pub fn derive_key(
        &self,
        secret: &[u8],
        salt: &[u8; SALT_LEN],
    ) -> Result<[u8; KEY_LEN], CryptoError> {
        let mut out = [0u8; KEY_LEN];
        self.argon2
            .hash_password_into(secret, salt, &mut out)
            .map_err(|e| CryptoError::Kdf(e.to_string()))?;
        Ok(out)
    }
}

/// Fresh random 16-byte salt.
pub fn generate_salt() -> [u8; SALT_LEN] {
    let mut salt = [0u8; SALT_LEN];
    rand::rngs::OsRng.fill_bytes(&mut salt);
    salt
}

/// Fresh random 32-byte symmetric key.
pub fn generate_key() -> [u8; KEY_LEN] {
    let mut key = [0u8; KEY_LEN];
    rand::rngs::OsRng.fill_bytes(&mut key);
    key
}

/// AAD binding a message ciphertext to its row: `uuid|created_at_us`.
pub fn message_aad(uuid: &str, created_at_us: i64) -> Vec<u8> {
    format!("{}|{}", uuid, created_at_us).into_bytes()
}

/// Encrypt with ChaCha20-Poly1305. Output layout: 12-byte random nonce
/// followed by ciphertext+tag.
pub fn encrypt(key: &[u8; KEY_LEN], plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    let mut nonce_bytes = [0u8; NONCE_LEN];
    rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);
    let ciphertext = cipher
        .encrypt(
            nonce,
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|_| CryptoError::AuthTagInvalid)?;
    let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Decrypt a blob produced by [`encrypt`].
pub fn decrypt(key: &[u8; KEY_LEN], blob: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if blob.len() < NONCE_LEN + 16 {
        return Err(CryptoError::TruncatedCiphertext);
    }
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    let nonce = Nonce::from_slice(&blob[..NONCE_LEN]);
    cipher
        .decrypt(
            nonce,
            Payload {
                msg: &blob[NONCE_LEN..],
                aad,
            },
        )
        .map_err(|_| CryptoError::AuthTagInvalid)
}

/// The derived master key plus wrap/unwrap helpers. Created once at
/// startup; read-only afterwards.
#[derive(Debug)]
pub struct KeyRing {
    master: [u8; KEY_LEN],
}

impl KeyRing {
    pub fn derive(
        crypto: &Crypto,
        passphrase: &str,
        master_salt: &[u8; SALT_LEN],
    ) -> Result<Self, CryptoError> {
        Ok(Self {
            master: crypto.derive_key(passphrase.as_bytes(), master_salt)?,
        })
    }

    #[cfg(test)]
    pub fn from_key(master: [u8; KEY_LEN]) -> Self {
        Self { master }
    }

    /// Wrap a key under the master key.
    pub fn wrap(&self, key: &[u8; KEY_LEN]) -> Result<Vec<u8>, CryptoError> {
        wrap_key(&self.master, key)
    }

    /// Unwrap a master-wrapped key. Fails with `WrongPassphrase` when the
    /// operator passphrase changed since the key was wrapped.
    pub fn unwrap(&self, blob: &[u8]) -> Result<[u8; KEY_LEN], CryptoError> {
        unwrap_key(&self.master, blob)
    }
}

const KEY_WRAP_AAD: &[u8] = b"advbbs-key-wrap-v1";

/// Wrap (AEAD-encrypt) a key under a wrapping key for storage at rest.
pub fn wrap_key(wrapping_key: &[u8; KEY_LEN], key: &[u8; KEY_LEN]) -> Result<Vec<u8>, CryptoError> {
    encrypt(wrapping_key, key, KEY_WRAP_AAD)
}

/// Unwrap a stored key. Authentication failure means the wrapping key is
/// not the one the blob was created under (changed passphrase).
pub fn unwrap_key(
    wrapping_key: &[u8; KEY_LEN],
    blob: &[u8],
) -> Result<[u8; KEY_LEN], CryptoError> {
    let plain = decrypt(wrapping_key, blob, KEY_WRAP_AAD).map_err(|e| match e {
        CryptoError::AuthTagInvalid => CryptoError::WrongPassphrase,
        other => other,
    })?;
    if plain.len() != KEY_LEN {
        return Err(CryptoError::WrongPassphrase);
    }
    let mut key = [0u8; KEY_LEN];
    key.copy_from_slice(&plain);
    Ok(key)
}

/// Encrypt a message body or subject for storage, binding it to its row.
pub fn encrypt_message(
    key: &[u8; KEY_LEN],
    plaintext: &str,
    uuid: &str,
    created_at_us: i64,
) -> Result<Vec<u8>, CryptoError> {
    encrypt(key, plaintext.as_bytes(), &message_aad(uuid, created_at_us))
}

/// Decrypt a stored message body or subject.
pub fn decrypt_message(
    key: &[u8; KEY_LEN],
    blob: &[u8],
    uuid: &str,
    created_at_us: i64,
) -> Result<String, CryptoError> {
    let plain = decrypt(key, blob, &message_aad(uuid, created_at_us))?;
    String::from_utf8(plain).map_err(|_| CryptoError::AuthTagInvalid)
}
