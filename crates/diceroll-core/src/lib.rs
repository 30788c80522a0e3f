//! # Diceroll Core
//!
//! Secure group sessions and provably fair dice over an untrusted relay.
//!
//! This crate provides:
//! - Ring Diffie-Hellman group key agreement with a human verifiable
//!   confirmation phrase
//! - An encrypted, signed group channel with strictly ordered send and
//!   receive paths
//! - Commit-reveal dice rolls that no participant can bias or predict
//!
//! ## Protocol Overview
//!
//! Whenever membership changes, every participant draws a fresh exponent and
//! the group runs the ring exchange until everyone holds
//! `g^(x_1 * ... * x_n) mod p`. That value keys an XChaCha20-Poly1305
//! channel; messages are additionally signed with a per-session Ed25519
//! identity. Participants compare a short phrase derived from the key and
//! every identity to detect a relay that split the group.
//!
//! Rolls run inside the channel: everyone commits to `SHA-256(value)`, and
//! only once all commitments are in does anyone reveal.
//!
//! ## Example
//!
//! ```rust,ignore
//! use diceroll_core::{transport::MemoryRelay, Room, RoomConfig, RoomEvent};
//!
//! let relay = MemoryRelay::new();
//! let (transport, inbound) = relay.connect();
//! let (handle, mut events) = Room::spawn(RoomConfig::new("table"), transport, inbound)?;
//!
//! handle.roll_all()?;
//! while let Some(event) = events.recv().await {
//!     if let RoomEvent::RollResult(result) = event {
//!         println!("{} rolled {}", result.die.name, result.face + 1);
//!     }
//! }
//! ```

pub mod arith;
pub mod channel;
pub mod error;
pub mod gka;
pub mod identity;
pub mod roll;
pub mod room;
pub mod transport;
pub mod types;
pub mod words;

pub use error::{Error, Result};
pub use room::{Room, RoomEvent, RoomHandle};
pub use types::{DiceSet, Die, PeerId, RoomConfig, SessionState};

/// Protocol version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
