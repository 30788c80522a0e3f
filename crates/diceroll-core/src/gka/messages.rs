//! Key agreement message types

use crate::identity::IdentityKey;
use crate::types::hex_int;
use num_bigint::BigUint;
use serde::{Deserialize, Serialize};

/// Round 1 message: public share and identity key, broadcast to the room
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PubKeyMessage {
    /// `g^x mod p`
    #[serde(with = "hex_int")]
    pub share: BigUint,
    /// Sender's signing key for channel messages
    pub identity: IdentityKey,
}

/// Round 2 message: partial aggregate, sent to the ring successor only
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartialKeyMessage {
    /// Partially exponentiated value
    #[serde(with = "hex_int")]
    pub partial: BigUint,
}
