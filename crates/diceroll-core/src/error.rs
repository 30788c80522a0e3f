//! Error types for room, key agreement and roll operations

use crate::types::PeerId;
use thiserror::Error;

/// Result type alias for diceroll operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while running a room session
///
/// None of these are fatal to the session task. Protocol and crypto errors
/// are reported to the application and processing continues.
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// Invalid room configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Message inconsistent with the current protocol state
    #[error("Protocol violation from {peer}: {reason}")]
    ProtocolViolation { peer: PeerId, reason: String },

    /// Message from or about a peer outside the local membership view
    #[error("Unknown peer: {0}")]
    UnknownPeer(PeerId),

    /// Second commitment from the same peer for one roll
    #[error("Duplicate commit from {peer} for roll {tag}")]
    DuplicateCommit { peer: PeerId, tag: String },

    /// Second reveal from the same peer for one roll
    #[error("Duplicate reveal from {peer} for roll {tag}")]
    DuplicateReveal { peer: PeerId, tag: String },

    /// Revealed value does not hash to the earlier commitment
    #[error("Commitment mismatch from {peer} for roll {tag}")]
    CommitmentMismatch { peer: PeerId, tag: String },

    /// Tag or value that would confine a roll to a small subgroup
    #[error("Weak contribution from {peer} for roll {tag}")]
    WeakContribution { peer: PeerId, tag: String },

    /// Authenticated decryption failed
    #[error("Decryption failed for message from {0}")]
    DecryptionFailure(PeerId),

    /// Sender signature did not verify
    #[error("Invalid signature on message from {0}")]
    SignatureFailure(PeerId),

    /// Confirmation phrases disagree after keying
    #[error("Group verification mismatch with {peer}: got {phrase:?}")]
    VerificationMismatch { peer: PeerId, phrase: String },

    /// Fixed-width or hex encoding error
    #[error("Encoding error: {0}")]
    Encoding(String),

    /// Cryptographic operation failed
    #[error("Cryptographic error: {0}")]
    Crypto(String),

    /// Transport/relay error
    #[error("Relay error: {0}")]
    Relay(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Deserialization error
    #[error("Deserialization error: {0}")]
    Deserialization(String),
}

impl Error {
    /// Shorthand for a protocol violation attributed to `peer`
    pub fn violation(peer: &PeerId, reason: impl Into<String>) -> Self {
        Error::ProtocolViolation {
            peer: peer.clone(),
            reason: reason.into(),
        }
    }

    /// Whether this error marks a peer as cheating rather than a local fault
    pub fn is_cheat(&self) -> bool {
        matches!(
            self,
            Error::DuplicateCommit { .. }
                | Error::DuplicateReveal { .. }
                | Error::CommitmentMismatch { .. }
                | Error::WeakContribution { .. }
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
