// Relay envelope encryption: X25519 ECDH + XChaCha20-Poly1305
//
// A relay envelope carries a fresh session key sealed to the recipient's
// Ed25519 identity key (converted to X25519), and the payload encrypted
// under that session key:
//
// 1. Session key: 32 random bytes
// 2. Seal: ephemeral X25519 × recipient X25519 → Blake3 KDF → AEAD(session key)
// 3. Body: XChaCha20-Poly1305(session key, random nonce, plaintext), AAD = length
// 4. Output: RelayEnvelope { sealed_key, nonce, ciphertext, length }
//
// The recipient converts its signing key to X25519, opens the session key,
// then the body, and checks the recorded cleartext length.

use super::CryptoError;
use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    XChaCha20Poly1305, XNonce,
};
use ed25519_dalek::SigningKey;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use x25519_dalek::{EphemeralSecret, PublicKey as X25519PublicKey, StaticSecret};
use zeroize::{Zeroize, Zeroizing};

/// KDF context for sealing session keys. Changing it breaks every stored route.
const KDF_CONTEXT: &str = "courier relay session key 2026-10-01";

/// Upper bound on an encoded envelope.
const MAX_ENVELOPE_SIZE: u64 = 64 * 1024 * 1024;

/// A session key sealed to one recipient.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedKey {
    pub ephemeral_public_key: Vec<u8>,
    pub nonce: Vec<u8>,
    pub ciphertext: Vec<u8>,
}

/// Encrypted block exchanged between a proxy client and its router.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayEnvelope {
    pub sealed_key: SealedKey,
    pub nonce: Vec<u8>,
    pub ciphertext: Vec<u8>,
    /// Cleartext length, authenticated as AAD.
    pub length: u64,
}

impl RelayEnvelope {
    pub fn to_bytes(&self) -> Result<Vec<u8>, CryptoError> {
        bincode::serialize(self).map_err(|e| CryptoError::Malformed(e.to_string()))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        if bytes.len() as u64 > MAX_ENVELOPE_SIZE {
            return Err(CryptoError::Malformed(format!(
                "envelope too large: {} bytes",
                bytes.len()
            )));
        }
        bincode::deserialize(bytes).map_err(|e| CryptoError::Malformed(e.to_string()))
    }
}

/// Convert an Ed25519 signing key to the X25519 secret used for ECDH.
pub(crate) fn ed25519_to_x25519_secret(signing_key: &SigningKey) -> StaticSecret {
    let mut hash = <sha2::Sha512 as sha2::Digest>::digest(signing_key.to_bytes());
    let mut secret_bytes = [0u8; 32];
    secret_bytes.copy_from_slice(&hash[..32]);

    let secret = StaticSecret::from(secret_bytes);

    secret_bytes.zeroize();
    hash.as_mut_slice().zeroize();

    secret
}

/// Map an Ed25519 public key onto the Montgomery curve.
pub(crate) fn ed25519_public_to_x25519(
    public_key_bytes: &[u8; 32],
) -> Result<X25519PublicKey, CryptoError> {
    use curve25519_dalek::edwards::CompressedEdwardsY;

    let compressed = CompressedEdwardsY::from_slice(public_key_bytes)
        .map_err(|_| CryptoError::InvalidPublicKey)?;
    let edwards_point = compressed
        .decompress()
        .ok_or(CryptoError::InvalidPublicKey)?;
    Ok(X25519PublicKey::from(edwards_point.to_montgomery().to_bytes()))
}

fn random_nonce() -> [u8; 24] {
    let mut nonce = [0u8; 24];
    rand::rngs::OsRng.fill_bytes(&mut nonce);
    nonce
}

fn cipher_for(key: &[u8; 32]) -> Result<XChaCha20Poly1305, CryptoError> {
    XChaCha20Poly1305::new_from_slice(key).map_err(|_| CryptoError::EncryptionFailed)
}

/// Fresh random symmetric key.
pub fn new_session_key() -> Zeroizing<[u8; 32]> {
    let mut key = Zeroizing::new([0u8; 32]);
    rand::rngs::OsRng.fill_bytes(key.as_mut());
    key
}

/// Seal `session_key` so only the holder of `recipient_public_key` can open it.
pub fn seal_session_key(
    recipient_public_key: &[u8; 32],
    session_key: &[u8; 32],
) -> Result<SealedKey, CryptoError> {
    let recipient_x25519 = ed25519_public_to_x25519(recipient_public_key)?;
    let ephemeral_secret = EphemeralSecret::random_from_rng(rand::rngs::OsRng);
    let ephemeral_public = X25519PublicKey::from(&ephemeral_secret);
    let shared_secret = ephemeral_secret.diffie_hellman(&recipient_x25519);

    let mut wrapping_key = blake3::derive_key(KDF_CONTEXT, shared_secret.as_bytes());
    let nonce = random_nonce();
    let result = cipher_for(&wrapping_key).and_then(|cipher| {
        cipher
            .encrypt(
                XNonce::from_slice(&nonce),
                Payload {
                    msg: session_key,
                    aad: ephemeral_public.as_bytes(),
                },
            )
            .map_err(|_| CryptoError::EncryptionFailed)
    });
    wrapping_key.zeroize();

    Ok(SealedKey {
        ephemeral_public_key: ephemeral_public.to_bytes().to_vec(),
        nonce: nonce.to_vec(),
        ciphertext: result?,
    })
}

/// Open a session key sealed to `recipient_signing_key`.
pub fn open_session_key(
    recipient_signing_key: &SigningKey,
    sealed: &SealedKey,
) -> Result<Zeroizing<[u8; 32]>, CryptoError> {
    let ephemeral: [u8; 32] = sealed
        .ephemeral_public_key
        .as_slice()
        .try_into()
        .map_err(|_| CryptoError::Malformed("ephemeral key length".into()))?;
    if sealed.nonce.len() != 24 {
        return Err(CryptoError::Malformed("nonce length".into()));
    }

    let secret = ed25519_to_x25519_secret(recipient_signing_key);
    let shared_secret = secret.diffie_hellman(&X25519PublicKey::from(ephemeral));
    let mut wrapping_key = blake3::derive_key(KDF_CONTEXT, shared_secret.as_bytes());

    let opened = cipher_for(&wrapping_key).and_then(|cipher| {
        cipher
            .decrypt(
                XNonce::from_slice(&sealed.nonce),
                Payload {
                    msg: &sealed.ciphertext,
                    aad: &ephemeral,
                },
            )
            .map_err(|_| CryptoError::DecryptionFailed)
    });
    wrapping_key.zeroize();

    let opened = Zeroizing::new(opened?);
    let key: [u8; 32] = opened
        .as_slice()
        .try_into()
        .map_err(|_| CryptoError::Malformed("session key length".into()))?;
    Ok(Zeroizing::new(key))
}

/// Encrypt `plaintext` for `recipient_public_key` as a relay envelope.
pub fn seal_relay(
    recipient_public_key: &[u8; 32],
    plaintext: &[u8],
) -> Result<RelayEnvelope, CryptoError> {
    let session_key = new_session_key();
    let sealed_key = seal_session_key(recipient_public_key, &session_key)?;
    let length = plaintext.len() as u64;
    let nonce = random_nonce();
    let ciphertext = cipher_for(&session_key)?
        .encrypt(
            XNonce::from_slice(&nonce),
            Payload {
                msg: plaintext,
                aad: &length.to_be_bytes(),
            },
        )
        .map_err(|_| CryptoError::EncryptionFailed)?;

    Ok(RelayEnvelope {
        sealed_key,
        nonce: nonce.to_vec(),
        ciphertext,
        length,
    })
}

/// Decrypt a relay envelope addressed to `recipient_signing_key`.
pub fn open_relay(
    recipient_signing_key: &SigningKey,
    envelope: &RelayEnvelope,
) -> Result<Vec<u8>, CryptoError> {
    if envelope.nonce.len() != 24 {
        return Err(CryptoError::Malformed("nonce length".into()));
    }
    let session_key = open_session_key(recipient_signing_key, &envelope.sealed_key)?;
    let plaintext = cipher_for(&session_key)?
        .decrypt(
            XNonce::from_slice(&envelope.nonce),
            Payload {
                msg: &envelope.ciphertext,
                aad: &envelope.length.to_be_bytes(),
            },
        )
        .map_err(|_| CryptoError::DecryptionFailed)?;

    if plaintext.len() as u64 != envelope.length {
        return Err(CryptoError::LengthMismatch {
            expected: envelope.length,
            actual: plaintext.len() as u64,
        });
    }
    Ok(plaintext)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::IdentityKeys;

    #[test]
    fn test_relay_roundtrip() {
        let router = IdentityKeys::generate();
        let envelope = seal_relay(&router.public_key_bytes(), b"alice\nbob\n\n{}").unwrap();
        assert_eq!(envelope.length, 14);

        let bytes = envelope.to_bytes().unwrap();
        let decoded = RelayEnvelope::from_bytes(&bytes).unwrap();
        let plaintext = open_relay(&router.signing_key, &decoded).unwrap();
        assert_eq!(plaintext, b"alice\nbob\n\n{}");
    }

    #[test]
    fn test_wrong_recipient_cannot_open() {
        let router = IdentityKeys::generate();
        let eve = IdentityKeys::generate();
        let envelope = seal_relay(&router.public_key_bytes(), b"secret").unwrap();
        assert!(matches!(
            open_relay(&eve.signing_key, &envelope),
            Err(CryptoError::DecryptionFailed)
        ));
    }

    #[test]
    fn test_tampered_length_is_rejected() {
        let router = IdentityKeys::generate();
        let mut envelope = seal_relay(&router.public_key_bytes(), b"payload").unwrap();
        envelope.length += 1;
        assert!(open_relay(&router.signing_key, &envelope).is_err());
    }

    #[test]
    fn test_session_key_seal() {
        let alice = IdentityKeys::generate();
        let key = new_session_key();
        let sealed = seal_session_key(&alice.public_key_bytes(), &key).unwrap();
        let opened = open_session_key(&alice.signing_key, &sealed).unwrap();
        assert_eq!(*opened, *key);
    }
}
