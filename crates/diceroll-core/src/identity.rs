//! Per-session signing identity
//!
//! Every session generates a fresh Ed25519 keypair. Peers learn each other's
//! verifying key during the first key agreement round and use it to check
//! the signature on every channel message.

use crate::types::hex_bytes;
use crate::{words, Error, Result};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Length of an encoded signature
pub const SIGNATURE_LEN: usize = 64;

/// Local signing keypair
pub struct Identity {
    signing_key: SigningKey,
}

impl Identity {
    /// Generate a fresh keypair
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut OsRng),
        }
    }

    /// Public half, as sent to peers
    pub fn public_key(&self) -> IdentityKey {
        IdentityKey(self.signing_key.verifying_key().to_bytes())
    }

    /// Sign `message`
    pub fn sign(&self, message: &[u8]) -> [u8; SIGNATURE_LEN] {
        self.signing_key.sign(message).to_bytes()
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("public", &self.public_key())
            .finish_non_exhaustive()
    }
}

/// A peer's public identity key
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdentityKey(#[serde(with = "hex_bytes")] [u8; 32]);

impl IdentityKey {
    /// Import a key, rejecting encodings that are not valid curve points
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| Error::Crypto(format!("identity key must be 32 bytes, got {}", bytes.len())))?;
        VerifyingKey::from_bytes(&arr).map_err(|e| Error::Crypto(e.to_string()))?;
        Ok(Self(arr))
    }

    /// Raw key bytes
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Collision resistant hash of the key
    pub fn hash(&self) -> [u8; 32] {
        Sha256::digest(self.0).into()
    }

    /// Short word rendering of the key hash, stable for the session
    pub fn human_id(&self, count: usize) -> String {
        words::to_words(&self.hash(), count)
    }

    /// Check `signature` over `message`
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> bool {
        let Ok(key) = VerifyingKey::from_bytes(&self.0) else {
            return false;
        };
        let Ok(sig_bytes) = <[u8; SIGNATURE_LEN]>::try_from(signature) else {
            return false;
        };
        key.verify(message, &Signature::from_bytes(&sig_bytes)).is_ok()
    }
}

impl fmt::Debug for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IdentityKey({})", hex::encode(&self.0[..8]))
    }
}
