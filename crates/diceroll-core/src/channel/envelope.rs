//! Application topics carried inside sealed messages

use crate::roll::{CommitMessage, RevealMessage};
use crate::types::DiceSet;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};

/// Decrypted payload, `{"topic": ..., "args": ...}` on the wire
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "topic", content = "args", rename_all = "kebab-case")]
pub enum Envelope {
    /// Sender's nickname
    Nick(String),
    /// Chat line
    Chat(String),
    /// Dice proposed for the following rolls
    Roll(DiceSet),
    /// Roll commitment
    Commit(CommitMessage),
    /// Roll reveal
    Reveal(RevealMessage),
    /// Confirmation phrase for the current group key
    GroupVerify(String),
}

impl Envelope {
    /// Every recognised topic
    pub const TOPICS: [&'static str; 6] = ["nick", "chat", "roll", "commit", "reveal", "group-verify"];

    /// Wire topic name
    pub fn topic(&self) -> &'static str {
        match self {
            Envelope::Nick(_) => "nick",
            Envelope::Chat(_) => "chat",
            Envelope::Roll(_) => "roll",
            Envelope::Commit(_) => "commit",
            Envelope::Reveal(_) => "reveal",
            Envelope::GroupVerify(_) => "group-verify",
        }
    }

    /// Serialize for sealing
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Parse a decrypted payload
    ///
    /// Payloads without a recognised topic are chaff and yield `Ok(None)`.
    /// A recognised topic with malformed arguments is an error.
    pub fn decode(bytes: &[u8]) -> Result<Option<Self>> {
        let value: serde_json::Value =
            serde_json::from_slice(bytes).map_err(|e| Error::Deserialization(e.to_string()))?;

        let topic = match value.get("topic").and_then(|t| t.as_str()) {
            Some(topic) if Self::TOPICS.iter().any(|t| *t == topic) => topic.to_string(),
            _ => return Ok(None),
        };
        serde_json::from_value(value)
            .map(Some)
            .map_err(|e| Error::Deserialization(format!("{} args: {}", topic, e)))
    }
}
