// Cryptography module: signing and relay envelope encryption

pub mod encrypt;

pub use encrypt::{new_session_key, open_relay, seal_relay, RelayEnvelope, SealedKey};

use crate::identity::IdentityKeys;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("Invalid public key")]
    InvalidPublicKey,
    #[error("Invalid signature encoding")]
    InvalidSignature,
    #[error("Invalid key material")]
    InvalidKey,
    #[error("Encryption failed")]
    EncryptionFailed,
    #[error("Decryption failed: wrong key or tampered data")]
    DecryptionFailed,
    #[error("Length mismatch: recorded {expected}, decrypted {actual}")]
    LengthMismatch { expected: u64, actual: u64 },
    #[error("Malformed encrypted block: {0}")]
    Malformed(String),
}

/// Crypto service of the local node: its signing key plus the operations the
/// delivery core needs from it.
#[derive(Clone)]
pub struct KeyRing {
    keys: Arc<IdentityKeys>,
}

impl KeyRing {
    pub fn new(keys: IdentityKeys) -> Self {
        Self {
            keys: Arc::new(keys),
        }
    }

    pub fn keys(&self) -> &IdentityKeys {
        &self.keys
    }

    pub fn public_key(&self) -> [u8; 32] {
        self.keys.public_key_bytes()
    }

    pub fn sign(&self, data: &[u8]) -> Vec<u8> {
        self.keys.sign(data)
    }

    pub fn verify(&self, public_key: &[u8], data: &[u8], signature: &[u8]) -> bool {
        IdentityKeys::verify(data, signature, public_key).unwrap_or(false)
    }

    /// Encrypt for the owner of `public_key`; output is an encoded [`RelayEnvelope`].
    pub fn encrypt_for(&self, public_key: &[u8; 32], plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        seal_relay(public_key, plaintext)?.to_bytes()
    }

    /// Decrypt an encoded [`RelayEnvelope`] addressed to this node.
    pub fn decrypt(&self, block: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let envelope = RelayEnvelope::from_bytes(block)?;
        open_relay(&self.keys.signing_key, &envelope)
    }

    pub fn new_session_key(&self) -> zeroize::Zeroizing<[u8; 32]> {
        new_session_key()
    }
}

impl std::fmt::Debug for KeyRing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "KeyRing({})", &self.keys.public_key_hex()[..16])
    }
}
