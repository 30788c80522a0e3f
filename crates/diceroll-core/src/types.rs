//! Core types shared across the room session

use crate::arith::{self, GroupInt};
use crate::{Error, Result};
use num_bigint::BigUint;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Identifier the relay assigns to a connected peer
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    /// Create a peer id from any string
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the raw id
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for PeerId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Lifecycle of a room session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SessionState {
    /// No relay connection
    Disconnected,
    /// Connected to the relay, no membership yet
    Connected,
    /// Group key agreement in progress
    Rekeying,
    /// Shared key installed, waiting for group verification
    Keyed,
    /// Every peer confirmed the same phrase
    Secured,
    /// A peer reported a different phrase
    VerifyFailed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Disconnected => "disconnected",
            SessionState::Connected => "connected",
            SessionState::Rekeying => "rekeying",
            SessionState::Keyed => "keyed",
            SessionState::Secured => "secured",
            SessionState::VerifyFailed => "verify-failed",
        };
        f.write_str(s)
    }
}

/// A single die definition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Die {
    /// Number of faces
    pub sides: u32,
    /// Display name
    pub name: String,
    /// Presentation data (sprite sheet, glyphs...), opaque to the protocol
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
}

impl Die {
    /// Create a plain die with `sides` faces
    pub fn new(sides: u32) -> Self {
        Self {
            sides,
            name: format!("d{}", sides),
            image: None,
        }
    }
}

impl FromStr for Die {
    type Err = Error;

    /// Parse `d6`, `D20` or a bare face count
    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let digits = s
            .strip_prefix('d')
            .or_else(|| s.strip_prefix('D'))
            .unwrap_or(s);
        let sides: u32 = digits
            .parse()
            .map_err(|_| Error::InvalidConfig(format!("bad die {:?}", s)))?;
        if sides < 2 {
            return Err(Error::InvalidConfig(format!(
                "die needs at least 2 sides, got {}",
                sides
            )));
        }
        Ok(Die::new(sides))
    }
}

/// Ordered list of dice proposed for a roll sequence
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DiceSet(pub Vec<Die>);

impl DiceSet {
    /// Look up a die by index
    pub fn get(&self, which: usize) -> Option<&Die> {
        self.0.get(which)
    }

    /// Number of dice
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the set has no dice
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// At least one die, each with at least two faces
    pub fn validate(&self) -> Result<()> {
        if self.is_empty() {
            return Err(Error::InvalidConfig("dice set is empty".into()));
        }
        if let Some(die) = self.0.iter().find(|d| d.sides < 2) {
            return Err(Error::InvalidConfig(format!(
                "die {} needs at least 2 sides",
                die.name
            )));
        }
        Ok(())
    }
}

impl Default for DiceSet {
    fn default() -> Self {
        DiceSet(vec![Die::new(6), Die::new(6)])
    }
}

impl FromStr for DiceSet {
    type Err = Error;

    /// Parse a comma separated list such as `d6,d6,d20`
    fn from_str(s: &str) -> Result<Self> {
        let dice = s
            .split(',')
            .filter(|part| !part.trim().is_empty())
            .map(Die::from_str)
            .collect::<Result<Vec<_>>>()?;
        if dice.is_empty() {
            return Err(Error::InvalidConfig("empty dice set".into()));
        }
        Ok(DiceSet(dice))
    }
}

/// Configuration for a room session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomConfig {
    /// Room name on the relay
    pub room: String,

    /// Group modulus, hex
    pub modulus: String,

    /// Generator, hex
    pub generator: String,

    /// Private exponent width in bytes
    pub exponent_bytes: usize,

    /// Words in the group confirmation phrase
    pub phrase_words: usize,

    /// Words in a peer's human readable id
    pub id_words: usize,

    /// Nickname announced once the channel is keyed
    pub nick: Option<String>,

    /// Dice used until a peer proposes another set
    pub dice: DiceSet,

    /// Drop channel messages whose signature fails instead of delivering
    /// them with a warning
    #[serde(default)]
    pub strict_signatures: bool,
}

impl Default for RoomConfig {
    fn default() -> Self {
        Self {
            room: "lobby".into(),
            modulus: arith::to_hex(&arith::default_modulus()),
            generator: "2".into(),
            exponent_bytes: 32,
            phrase_words: 5,
            id_words: 2,
            nick: None,
            dice: DiceSet::default(),
            strict_signatures: false,
        }
    }
}

impl RoomConfig {
    /// Default configuration for the named room
    pub fn new(room: impl Into<String>) -> Self {
        Self {
            room: room.into(),
            ..Self::default()
        }
    }

    /// Validate and normalise the group parameters
    pub fn group_params(&self) -> Result<GroupParams> {
        GroupParams::new(
            self.modulus.as_str(),
            self.generator.as_str(),
            self.exponent_bytes,
            self.phrase_words,
        )
    }

    /// Check every field
    pub fn validate(&self) -> Result<()> {
        self.group_params()?;
        if !(1..=32).contains(&self.id_words) {
            return Err(Error::InvalidConfig(format!(
                "id_words must be in 1..=32, got {}",
                self.id_words
            )));
        }
        self.dice.validate()
    }
}

/// Validated Diffie-Hellman group parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupParams {
    /// Prime-like modulus, at most 256 bits
    pub modulus: BigUint,
    /// Small fixed base
    pub generator: BigUint,
    /// Private exponent width in bytes
    pub exponent_bytes: usize,
    /// Words in the confirmation phrase
    pub phrase_words: usize,
}

impl GroupParams {
    /// Normalise and validate the parameters
    pub fn new(
        modulus: impl GroupInt,
        generator: impl GroupInt,
        exponent_bytes: usize,
        phrase_words: usize,
    ) -> Result<Self> {
        let modulus = modulus.to_group_int()?;
        let generator = generator.to_group_int()?;

        if modulus <= BigUint::from(2u32) {
            return Err(Error::InvalidConfig("modulus must be greater than 2".into()));
        }
        if modulus.bits() > (arith::WIDTH * 8) as u64 {
            return Err(Error::InvalidConfig(format!(
                "modulus wider than {} bits",
                arith::WIDTH * 8
            )));
        }
        if generator < BigUint::from(2u32) || generator >= modulus {
            return Err(Error::InvalidConfig("generator must be in [2, modulus)".into()));
        }
        if exponent_bytes < 16 {
            return Err(Error::InvalidConfig(format!(
                "exponent must be at least 16 bytes, got {}",
                exponent_bytes
            )));
        }
        if !(1..=32).contains(&phrase_words) {
            return Err(Error::InvalidConfig(format!(
                "phrase_words must be in 1..=32, got {}",
                phrase_words
            )));
        }

        Ok(Self {
            modulus,
            generator,
            exponent_bytes,
            phrase_words,
        })
    }
}

impl Default for GroupParams {
    fn default() -> Self {
        Self {
            modulus: arith::default_modulus(),
            generator: BigUint::from(2u32),
            exponent_bytes: 32,
            phrase_words: 5,
        }
    }
}

/// Serde adapter: byte strings as lowercase hex
pub mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<T, S>(bytes: &T, serializer: S) -> Result<S::Ok, S::Error>
    where
        T: AsRef<[u8]>,
        S: Serializer,
    {
        serializer.serialize_str(&hex::encode(bytes.as_ref()))
    }

    pub fn deserialize<'de, T, D>(deserializer: D) -> Result<T, D::Error>
    where
        T: TryFrom<Vec<u8>>,
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        let bytes = hex::decode(&s).map_err(serde::de::Error::custom)?;
        T::try_from(bytes).map_err(|_| serde::de::Error::custom("invalid byte length"))
    }
}

/// Serde adapter: big integers as unpadded hex
pub mod hex_int {
    use num_bigint::BigUint;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &BigUint, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&crate::arith::to_hex(value))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<BigUint, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        crate::arith::parse_hex(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = RoomConfig::new("test-room");
        config.validate().unwrap();
        let params = config.group_params().unwrap();
        assert_eq!(params, GroupParams::default());
    }

    #[test]
    fn test_group_params_validation() {
        assert!(GroupParams::new(2u64, 2u64, 32, 5).is_err());
        assert!(GroupParams::new("17", 1u64, 32, 5).is_err());
        assert!(GroupParams::new("17", "17", 32, 5).is_err());
        assert!(GroupParams::new("17", 2u64, 8, 5).is_err());
        assert!(GroupParams::new("17", 2u64, 32, 0).is_err());
        assert!(GroupParams::new("17", 2u64, 32, 5).is_ok());
    }

    #[test]
    fn test_dice_set_parse() {
        let set: DiceSet = "d6, D20,4".parse().unwrap();
        assert_eq!(set.len(), 3);
        assert_eq!(set.get(1).unwrap().sides, 20);
        assert_eq!(set.get(2).unwrap().name, "d4");
        assert!("".parse::<DiceSet>().is_err());
        assert!("d1".parse::<DiceSet>().is_err());
        assert!("dx".parse::<DiceSet>().is_err());

        assert!(set.validate().is_ok());
        assert!(DiceSet(Vec::new()).validate().is_err());
        assert!(DiceSet(vec![Die::new(1)]).validate().is_err());
    }

    #[test]
    fn test_peer_id_ordering() {
        let mut ids = vec![PeerId::from("f"), PeerId::from("b"), PeerId::from("d")];
        ids.sort();
        assert_eq!(ids, vec![PeerId::from("b"), PeerId::from("d"), PeerId::from("f")]);
        assert_eq!(serde_json::to_string(&ids[0]).unwrap(), "\"b\"");
    }

    #[test]
    fn test_state_serde() {
        let json = serde_json::to_string(&SessionState::VerifyFailed).unwrap();
        assert_eq!(json, "\"verify-failed\"");
        assert_eq!(SessionState::VerifyFailed.to_string(), "verify-failed");
    }
}
