// Node signing keys

use crate::crypto::CryptoError;
use ed25519_dalek::{Signature as Ed25519Signature, Signer, SigningKey, Verifier, VerifyingKey};
use zeroize::{Zeroize, Zeroizing};

/// Ed25519 master key of a node
#[derive(Clone)]
pub struct IdentityKeys {
    pub signing_key: SigningKey,
}

impl IdentityKeys {
    /// Generate new keys from the OS RNG
    pub fn generate() -> Self {
        use rand::RngCore;
        let mut secret_key_bytes = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut secret_key_bytes);
        let keys = Self::from_seed(&secret_key_bytes);
        secret_key_bytes.zeroize();
        keys
    }

    /// Deterministic keys, used by tests and key import
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(seed),
        }
    }

    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    pub fn public_key_hex(&self) -> String {
        hex::encode(self.public_key_bytes())
    }

    /// Short Blake3 fingerprint of the public key
    pub fn fingerprint(&self) -> String {
        let hash = blake3::hash(&self.public_key_bytes());
        hex::encode(&hash.as_bytes()[..8])
    }

    pub fn sign(&self, data: &[u8]) -> Vec<u8> {
        self.signing_key.sign(data).to_bytes().to_vec()
    }

    /// Verify `signature` over `data` with a raw public key.
    ///
    /// `Ok(false)` means well-formed inputs that do not verify; malformed
    /// key or signature bytes are an error.
    pub fn verify(data: &[u8], signature: &[u8], public_key: &[u8]) -> Result<bool, CryptoError> {
        let key_bytes: &[u8; 32] = public_key
            .try_into()
            .map_err(|_| CryptoError::InvalidPublicKey)?;
        let verifying_key =
            VerifyingKey::from_bytes(key_bytes).map_err(|_| CryptoError::InvalidPublicKey)?;
        let sig_bytes: &[u8; 64] = signature
            .try_into()
            .map_err(|_| CryptoError::InvalidSignature)?;
        let sig = Ed25519Signature::from_bytes(sig_bytes);

        Ok(verifying_key.verify(data, &sig).is_ok())
    }

    /// Serialize the secret key; wiped on drop
    pub fn to_bytes(&self) -> Zeroizing<Vec<u8>> {
        Zeroizing::new(self.signing_key.to_bytes().to_vec())
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        let seed: &[u8; 32] = bytes.try_into().map_err(|_| CryptoError::InvalidKey)?;
        Ok(Self::from_seed(seed))
    }
}

impl std::fmt::Debug for IdentityKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "IdentityKeys({})", self.fingerprint())
    }
}
