//! Roll protocol messages

use crate::arith;
use crate::types::{hex_int, Die};
use num_bigint::BigUint;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Random identifier of one roll instance
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RollTag(#[serde(with = "hex_int")] BigUint);

impl RollTag {
    /// Width of a freshly generated tag in bytes
    pub const BYTES: usize = 16;

    /// Draw a fresh random tag
    pub fn random() -> Self {
        Self(arith::random_int(Self::BYTES))
    }

    /// Tag as an integer
    pub fn as_int(&self) -> &BigUint {
        &self.0
    }

    /// Leading hex digits for log lines
    pub fn short(&self) -> String {
        let mut s = arith::to_hex(&self.0);
        s.truncate(16);
        s
    }
}

impl From<BigUint> for RollTag {
    fn from(value: BigUint) -> Self {
        Self(value)
    }
}

impl fmt::Display for RollTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&arith::to_hex(&self.0))
    }
}

/// Commitment to a secret value for one roll
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitMessage {
    pub tag: RollTag,
    /// Index of the die being rolled
    pub which: usize,
    /// SHA-256 of the fixed-width secret value
    #[serde(with = "hex_int")]
    pub hash: BigUint,
}

/// Opening of an earlier commitment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevealMessage {
    pub tag: RollTag,
    pub which: usize,
    #[serde(with = "hex_int")]
    pub value: BigUint,
}

/// Outcome of a finalized roll
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollResult {
    pub tag: RollTag,
    /// Index of the die in the set the roll was started with
    pub which: usize,
    pub die: Die,
    /// Zero based face
    pub face: u64,
}
