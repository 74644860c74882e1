//! Authenticated encryption for credential secrets
//!
//! Credential payloads are stored only as sealed blobs produced by
//! ChaCha20-Poly1305. Each blob carries its own random 96-bit nonce, so the
//! same payload never encrypts to the same bytes twice.
//!
//! # Blob format
//!
//! A sealed blob is a compact JSON document:
//!
//! ```text
//! {"v":1,"alg":"chacha20poly1305","nonce":"<hex>","ct":"<hex>"}
//! ```
//!
//! # Security
//!
//! - The [`VaultKey`] is loaded once at startup and zeroed on drop
//! - `Debug` output of keys and opened payloads is redacted
//! - Any tampering with the nonce or ciphertext fails authentication; the
//!   failure is reported as [`EngineError::Decryption`] without echoing the blob

use chacha20poly1305::aead::{Aead, AeadCore, KeyInit, OsRng};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use sdk::errors::EngineError;
use serde::{Deserialize, Serialize};
use std::fmt;
use zeroize::Zeroizing;

/// Version tag written into every sealed blob
const BLOB_VERSION: u8 = 1;

/// Algorithm tag written into every sealed blob
const BLOB_ALG: &str = "chacha20poly1305";

/// Key length in bytes
pub const KEY_LEN: usize = 32;

/// Nonce length in bytes
const NONCE_LEN: usize = 12;

/// Process-wide symmetric key for the credential vault
///
/// Constructed once from configuration and passed by reference (usually
/// inside an `Arc<SecretBox>`) to whatever needs it. There is no rotation.
pub struct VaultKey {
    bytes: Zeroizing<[u8; KEY_LEN]>,
}

impl VaultKey {
    /// Parse a key from 64 hex characters
    ///
    /// # Errors
    ///
    /// Returns `EngineError::Config` if the input is not valid hex or has the
    /// wrong length. The input itself is never included in the error.
    pub fn from_hex(encoded: &str) -> Result<Self, EngineError> {
        let decoded = Zeroizing::new(
            hex::decode(encoded.trim())
                .map_err(|_| EngineError::Config("vault key is not valid hex".to_string()))?,
        );
        Self::from_slice(&decoded)
    }

    /// Build a key from raw bytes
    pub fn from_slice(raw: &[u8]) -> Result<Self, EngineError> {
        if raw.len() != KEY_LEN {
            return Err(EngineError::Config(format!(
                "vault key must be {} bytes, got {}",
                KEY_LEN,
                raw.len()
            )));
        }

        let mut bytes = Zeroizing::new([0u8; KEY_LEN]);
        bytes.copy_from_slice(raw);
        Ok(Self { bytes })
    }

    /// Generate a fresh random key
    pub fn generate() -> Self {
        let key = ChaCha20Poly1305::generate_key(&mut OsRng);
        let mut bytes = Zeroizing::new([0u8; KEY_LEN]);
        bytes.copy_from_slice(key.as_slice());
        Self { bytes }
    }

    /// Hex encoding of the key, for `flowbot keygen` output only
    pub fn to_hex(&self) -> Zeroizing<String> {
        Zeroizing::new(hex::encode(self.bytes.as_slice()))
    }
}

impl fmt::Debug for VaultKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VaultKey([REDACTED])")
    }
}

/// On-disk representation of a sealed secret
#[derive(Debug, Serialize, Deserialize)]
struct SealedBlob {
    v: u8,
    alg: String,
    nonce: String,
    ct: String,
}

/// Seals and opens credential payloads with the vault key
pub struct SecretBox {
    cipher: ChaCha20Poly1305,
}

impl SecretBox {
    pub fn new(key: &VaultKey) -> Self {
        let cipher = ChaCha20Poly1305::new(Key::from_slice(key.bytes.as_slice()));
        Self { cipher }
    }

    /// Encrypt raw bytes into a sealed blob
    pub fn seal_bytes(&self, plaintext: &[u8]) -> Result<String, EngineError> {
        let nonce = ChaCha20Poly1305::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext)
            .map_err(|_| EngineError::Encryption)?;

        let blob = SealedBlob {
            v: BLOB_VERSION,
            alg: BLOB_ALG.to_string(),
            nonce: hex::encode(nonce.as_slice()),
            ct: hex::encode(ciphertext),
        };

        serde_json::to_string(&blob).map_err(|_| EngineError::Encryption)
    }

    /// Decrypt a sealed blob back into raw bytes
    ///
    /// # Errors
    ///
    /// Returns `EngineError::Decryption` for malformed blobs, unknown versions,
    /// a wrong key or any tampering.
    pub fn open_bytes(&self, sealed: &str) -> Result<Zeroizing<Vec<u8>>, EngineError> {
        let blob: SealedBlob = serde_json::from_str(sealed).map_err(|_| {
            tracing::warn!("Sealed secret is not a valid blob");
            EngineError::Decryption
        })?;

        if blob.v != BLOB_VERSION || blob.alg != BLOB_ALG {
            tracing::warn!(version = blob.v, alg = %blob.alg, "Unsupported sealed secret format");
            return Err(EngineError::Decryption);
        }

        let nonce = hex::decode(&blob.nonce).map_err(|_| EngineError::Decryption)?;
        if nonce.len() != NONCE_LEN {
            return Err(EngineError::Decryption);
        }
        let ciphertext = hex::decode(&blob.ct).map_err(|_| EngineError::Decryption)?;

        self.cipher
            .decrypt(Nonce::from_slice(&nonce), ciphertext.as_slice())
            .map(Zeroizing::new)
            .map_err(|_| {
                tracing::error!("Secret authentication failed (wrong key or tampered blob)");
                EngineError::Decryption
            })
    }

    /// Encrypt a JSON payload
    pub fn seal(&self, payload: &serde_json::Value) -> Result<String, EngineError> {
        let plaintext =
            Zeroizing::new(serde_json::to_vec(payload).map_err(|_| EngineError::Encryption)?);
        self.seal_bytes(&plaintext)
    }

    /// Decrypt a JSON payload
    pub fn open(&self, sealed: &str) -> Result<serde_json::Value, EngineError> {
        let plaintext = self.open_bytes(sealed)?;
        serde_json::from_slice(&plaintext).map_err(|_| EngineError::Decryption)
    }
}

impl fmt::Debug for SecretBox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecretBox").finish_non_exhaustive()
    }
}
