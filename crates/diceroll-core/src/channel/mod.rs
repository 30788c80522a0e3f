//! Authenticated group channel
//!
//! Every message is signed with the sender's identity key, then encrypted
//! under the group key with XChaCha20-Poly1305 and a fresh random nonce.
//! Decryption runs first; the signature is only checked on plaintext that
//! authenticated under the group key.

mod envelope;
mod queue;

pub use envelope::Envelope;
pub use queue::SerialQueue;

use crate::gka::SharedSecret;
use crate::identity::{Identity, IdentityKey, SIGNATURE_LEN};
use crate::types::hex_bytes;
use crate::{Error, PeerId, Result};
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    Key, XChaCha20Poly1305, XNonce,
};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Nonce size in bytes (192 bits for XChaCha20)
pub const NONCE_LEN: usize = 24;

/// Symmetric channel key imported from the group secret
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct ChannelKey([u8; 32]);

impl ChannelKey {
    /// Import the group secret as-is
    pub fn import(secret: &SharedSecret) -> Self {
        Self(*secret.as_bytes())
    }

    /// Build a key from raw bytes
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    fn cipher(&self) -> XChaCha20Poly1305 {
        XChaCha20Poly1305::new(Key::from_slice(&self.0))
    }
}

impl fmt::Debug for ChannelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChannelKey([REDACTED])")
    }
}

/// Wire form of a channel message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedMessage {
    /// Random per-message nonce
    #[serde(with = "hex_bytes")]
    pub nonce: [u8; NONCE_LEN],
    /// Ciphertext with the Poly1305 tag appended
    #[serde(with = "hex_bytes")]
    pub ciphertext: Vec<u8>,
    /// Sender's signature over the plaintext
    #[serde(with = "hex_bytes")]
    pub signature: [u8; SIGNATURE_LEN],
}

/// A decrypted message
#[derive(Debug, Clone)]
pub struct Opened {
    /// Plaintext payload
    pub payload: Vec<u8>,
    /// Whether the sender's signature verified
    pub signature_valid: bool,
}

/// Encrypt `plaintext` under `key` and `nonce`
pub fn encrypt(key: &ChannelKey, nonce: &[u8; NONCE_LEN], plaintext: &[u8]) -> Result<Vec<u8>> {
    key.cipher()
        .encrypt(XNonce::from_slice(nonce), plaintext)
        .map_err(|_| Error::Crypto("encryption failed".into()))
}

/// Decrypt and authenticate `ciphertext`
pub fn decrypt(key: &ChannelKey, nonce: &[u8; NONCE_LEN], ciphertext: &[u8]) -> Result<Vec<u8>> {
    key.cipher()
        .decrypt(XNonce::from_slice(nonce), ciphertext)
        .map_err(|_| Error::Crypto("decryption failed".into()))
}

/// Sign then encrypt with a fresh random nonce
pub fn seal(key: &ChannelKey, identity: &Identity, plaintext: &[u8]) -> Result<SealedMessage> {
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);
    seal_with_nonce(key, identity, nonce, plaintext)
}

/// Sign then encrypt with a caller supplied nonce
pub fn seal_with_nonce(
    key: &ChannelKey,
    identity: &Identity,
    nonce: [u8; NONCE_LEN],
    plaintext: &[u8],
) -> Result<SealedMessage> {
    let signature = identity.sign(plaintext);
    let ciphertext = encrypt(key, &nonce, plaintext)?;
    Ok(SealedMessage {
        nonce,
        ciphertext,
        signature,
    })
}

/// Decrypt, then check the signature against `sender`
///
/// A bad signature does not fail the call; the caller decides what to do
/// with `signature_valid == false`.
pub fn open(
    key: &ChannelKey,
    from: &PeerId,
    sender: &IdentityKey,
    sealed: &SealedMessage,
) -> Result<Opened> {
    let payload = decrypt(key, &sealed.nonce, &sealed.ciphertext)
        .map_err(|_| Error::DecryptionFailure(from.clone()))?;
    let signature_valid = sender.verify(&payload, &sealed.signature);
    Ok(Opened {
        payload,
        signature_valid,
    })
}

/// [`seal`] on the blocking pool
pub async fn seal_async(
    key: Arc<ChannelKey>,
    identity: Arc<Identity>,
    plaintext: Vec<u8>,
) -> Result<SealedMessage> {
    tokio::task::spawn_blocking(move || seal(&key, &identity, &plaintext))
        .await
        .map_err(|e| Error::Crypto(format!("seal task failed: {}", e)))?
}

/// [`open`] on the blocking pool
pub async fn open_async(
    key: Arc<ChannelKey>,
    from: PeerId,
    sender: IdentityKey,
    sealed: SealedMessage,
) -> Result<Opened> {
    tokio::task::spawn_blocking(move || open(&key, &from, &sender, &sealed))
        .await
        .map_err(|e| Error::Crypto(format!("open task failed: {}", e)))?
}

/// [`ChannelKey::import`] on the blocking pool
pub async fn import_async(secret: SharedSecret) -> Result<ChannelKey> {
    tokio::task::spawn_blocking(move || ChannelKey::import(&secret))
        .await
        .map_err(|e| Error::Crypto(format!("key import failed: {}", e)))
}
