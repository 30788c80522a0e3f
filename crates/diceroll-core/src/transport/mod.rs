//! Relay transport seam
//!
//! The relay is untrusted. It sees every frame below in the clear; only the
//! `Message` frame carries application data, and that is sealed.

use crate::channel::SealedMessage;
use crate::gka::{PartialKeyMessage, PubKeyMessage};
use crate::{PeerId, Result};
use serde::{Deserialize, Serialize};

pub use ::async_trait::async_trait;

/// Payloads routed by the relay
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "topic", content = "payload", rename_all = "lowercase")]
pub enum Frame {
    /// Round one: public share and identity key, broadcast
    PubKey(PubKeyMessage),
    /// Round two: partial aggregate, sent to the ring successor only
    PubKey2(PartialKeyMessage),
    /// Sealed channel message, broadcast
    Message(SealedMessage),
}

impl Frame {
    /// Wire topic name
    pub fn topic(&self) -> &'static str {
        match self {
            Frame::PubKey(_) => "pubkey",
            Frame::PubKey2(_) => "pubkey2",
            Frame::Message(_) => "message",
        }
    }
}

/// Events delivered by the relay to one peer
#[derive(Debug, Clone)]
pub enum RelayEvent {
    /// Connection established; carries the id the relay assigned to us
    Connected(PeerId),
    /// Full membership snapshot on joining a room, excluding ourselves
    Members { room: String, peers: Vec<PeerId> },
    /// Another peer joined our room
    PeerJoined(PeerId),
    /// A peer left our room
    PeerLeft(PeerId),
    /// A frame from another peer
    Frame { from: PeerId, frame: Frame },
}

/// Room-scoped relay connection
#[async_trait]
pub trait Transport: Send + Sync {
    /// Id the relay assigned to this connection
    fn local_id(&self) -> PeerId;

    /// Join (or switch to) a room
    async fn join(&self, room: &str) -> Result<()>;

    /// Send a frame to every other member of the current room
    async fn broadcast(&self, frame: Frame) -> Result<()>;

    /// Send a frame to a single peer
    async fn send_to(&self, dest: &PeerId, frame: Frame) -> Result<()>;
}

/// In-process relay for tests and simulations
pub mod memory;

pub use memory::{MemoryRelay, MemoryTransport};
