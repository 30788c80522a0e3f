//! In-memory relay implementation for testing

use super::{async_trait, Frame, RelayEvent, Transport};
use crate::{Error, PeerId, Result};
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

/// One connected peer
struct Member {
    room: Option<String>,
    tx: mpsc::UnboundedSender<RelayEvent>,
}

/// In-memory message relay for local testing
///
/// One room per peer. Joining a room leaves the previous one. Messages are
/// delivered in send order per recipient.
#[derive(Clone, Default)]
pub struct MemoryRelay {
    /// Connected peers
    members: Arc<DashMap<PeerId, Member>>,
    /// Room name -> peers in join order
    rooms: Arc<DashMap<String, Vec<PeerId>>>,
}

impl MemoryRelay {
    /// Create a new in-memory relay
    pub fn new() -> Self {
        Self::default()
    }

    /// Connect with a random peer id
    pub fn connect(&self) -> (MemoryTransport, mpsc::UnboundedReceiver<RelayEvent>) {
        let id = format!("{:016x}", rand::random::<u64>());
        self.connect_as(id)
    }

    /// Connect with a chosen peer id
    pub fn connect_as(
        &self,
        id: impl Into<PeerId>,
    ) -> (MemoryTransport, mpsc::UnboundedReceiver<RelayEvent>) {
        let id = id.into();
        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(RelayEvent::Connected(id.clone()));
        self.members.insert(id.clone(), Member { room: None, tx });
        debug!(peer = %id, "relay connect");

        let transport = MemoryTransport {
            relay: self.clone(),
            id,
        };
        (transport, rx)
    }

    /// Drop a peer and tell its room
    pub fn disconnect(&self, id: &PeerId) {
        if let Some((_, member)) = self.members.remove(id) {
            if let Some(room) = member.room {
                self.leave(id, &room);
            }
            debug!(peer = %id, "relay disconnect");
        }
    }

    /// Deliver an arbitrary event to `to`, as a misbehaving relay could
    pub fn inject(&self, to: &PeerId, event: RelayEvent) -> Result<()> {
        self.deliver(to, event)
    }

    /// Members of `room` in join order
    pub fn room_members(&self, room: &str) -> Vec<PeerId> {
        self.rooms
            .get(room)
            .map(|r| r.value().clone())
            .unwrap_or_default()
    }

    fn room_of(&self, id: &PeerId) -> Result<String> {
        self.members
            .get(id)
            .ok_or_else(|| Error::Relay(format!("{} is not connected", id)))?
            .room
            .clone()
            .ok_or_else(|| Error::Relay(format!("{} is not in a room", id)))
    }

    fn deliver(&self, to: &PeerId, event: RelayEvent) -> Result<()> {
        let tx = match self.members.get(to) {
            Some(member) => member.tx.clone(),
            None => {
                debug!(peer = %to, "dropping event for unknown peer");
                return Ok(());
            }
        };
        tx.send(event)
            .map_err(|_| Error::Relay(format!("{} receiver closed", to)))
    }

    fn leave(&self, id: &PeerId, room: &str) {
        let remaining = match self.rooms.get_mut(room) {
            Some(mut peers) => {
                peers.retain(|p| p != id);
                peers.clone()
            }
            None => return,
        };
        for peer in &remaining {
            let _ = self.deliver(peer, RelayEvent::PeerLeft(id.clone()));
        }
    }

    fn join(&self, id: &PeerId, room: &str) -> Result<()> {
        let previous = {
            let mut member = self
                .members
                .get_mut(id)
                .ok_or_else(|| Error::Relay(format!("{} is not connected", id)))?;
            member.room.replace(room.to_string())
        };
        if let Some(previous) = previous {
            self.leave(id, &previous);
        }

        // the room stays locked until everyone is told, so no broadcast can
        // reach the joiner ahead of its member list
        let mut peers = self.rooms.entry(room.to_string()).or_default();
        let existing = peers.clone();
        peers.push(id.clone());

        self.deliver(
            id,
            RelayEvent::Members {
                room: room.to_string(),
                peers: existing.clone(),
            },
        )?;
        for peer in &existing {
            if let Err(e) = self.deliver(peer, RelayEvent::PeerJoined(id.clone())) {
                debug!(peer = %peer, error = %e, "join notification dropped");
            }
        }
        drop(peers);

        debug!(peer = %id, room, "relay join");
        Ok(())
    }
}

/// One peer's handle on a [`MemoryRelay`]
#[derive(Clone)]
pub struct MemoryTransport {
    relay: MemoryRelay,
    id: PeerId,
}

#[async_trait]
impl Transport for MemoryTransport {
    fn local_id(&self) -> PeerId {
        self.id.clone()
    }

    async fn join(&self, room: &str) -> Result<()> {
        self.relay.join(&self.id, room)
    }

    async fn broadcast(&self, frame: Frame) -> Result<()> {
        let room = self.relay.room_of(&self.id)?;
        for peer in self.relay.room_members(&room) {
            if peer == self.id {
                continue;
            }
            let event = RelayEvent::Frame {
                from: self.id.clone(),
                frame: frame.clone(),
            };
            if let Err(e) = self.relay.deliver(&peer, event) {
                debug!(peer = %peer, error = %e, "broadcast delivery dropped");
            }
        }
        Ok(())
    }

    async fn send_to(&self, dest: &PeerId, frame: Frame) -> Result<()> {
        let room = self.relay.room_of(&self.id)?;
        if !self.relay.room_members(&room).contains(dest) {
            debug!(from = %self.id, to = %dest, "send_to peer outside room dropped");
            return Ok(());
        }
        self.relay.deliver(
            dest,
            RelayEvent::Frame {
                from: self.id.clone(),
                frame,
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gka::PartialKeyMessage;
    use num_bigint::BigUint;

    fn partial(v: u32) -> Frame {
        Frame::PubKey2(PartialKeyMessage {
            partial: BigUint::from(v),
        })
    }

    #[tokio::test]
    async fn test_join_and_members() {
        let relay = MemoryRelay::new();
        let (a, mut a_rx) = relay.connect_as("a");
        let (b, mut b_rx) = relay.connect_as("b");

        assert!(matches!(a_rx.recv().await, Some(RelayEvent::Connected(id)) if id.as_str() == "a"));
        assert!(matches!(b_rx.recv().await, Some(RelayEvent::Connected(_))));

        a.join("room").await.unwrap();
        match a_rx.recv().await.unwrap() {
            RelayEvent::Members { room, peers } => {
                assert_eq!(room, "room");
                assert!(peers.is_empty());
            }
            other => panic!("unexpected {:?}", other),
        }

        b.join("room").await.unwrap();
        assert!(matches!(a_rx.recv().await, Some(RelayEvent::PeerJoined(id)) if id.as_str() == "b"));
        match b_rx.recv().await.unwrap() {
            RelayEvent::Members { peers, .. } => assert_eq!(peers, vec![PeerId::from("a")]),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_broadcast_and_direct() {
        let relay = MemoryRelay::new();
        let (a, mut a_rx) = relay.connect_as("a");
        let (b, mut b_rx) = relay.connect_as("b");
        let (c, mut c_rx) = relay.connect_as("c");
        for t in [&a, &b, &c] {
            t.join("room").await.unwrap();
        }
        // drain membership noise
        while a_rx.try_recv().is_ok() {}
        while b_rx.try_recv().is_ok() {}
        while c_rx.try_recv().is_ok() {}

        a.broadcast(partial(1)).await.unwrap();
        a.send_to(&PeerId::from("c"), partial(2)).await.unwrap();

        assert!(a_rx.try_recv().is_err());
        match b_rx.try_recv().unwrap() {
            RelayEvent::Frame { from, frame } => {
                assert_eq!(from.as_str(), "a");
                assert_eq!(frame, partial(1));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(b_rx.try_recv().is_err());

        let first = c_rx.try_recv().unwrap();
        let second = c_rx.try_recv().unwrap();
        assert!(matches!(first, RelayEvent::Frame { frame, .. } if frame == partial(1)));
        assert!(matches!(second, RelayEvent::Frame { frame, .. } if frame == partial(2)));
    }

    #[tokio::test]
    async fn test_disconnect_and_room_switch() {
        let relay = MemoryRelay::new();
        let (a, mut a_rx) = relay.connect_as("a");
        let (b, _b_rx) = relay.connect_as("b");
        a.join("one").await.unwrap();
        b.join("one").await.unwrap();
        while a_rx.try_recv().is_ok() {}

        b.join("two").await.unwrap();
        assert!(matches!(a_rx.try_recv(), Ok(RelayEvent::PeerLeft(id)) if id.as_str() == "b"));
        assert_eq!(relay.room_members("one"), vec![PeerId::from("a")]);

        b.join("one").await.unwrap();
        assert!(matches!(a_rx.try_recv(), Ok(RelayEvent::PeerJoined(_))));
        relay.disconnect(&PeerId::from("b"));
        assert!(matches!(a_rx.try_recv(), Ok(RelayEvent::PeerLeft(_))));
        assert!(relay.room_members("two").is_empty());
    }

    #[tokio::test]
    async fn test_joiner_sees_members_before_frames() {
        let relay = MemoryRelay::new();
        let (a, mut a_rx) = relay.connect_as("a");
        let (b, mut b_rx) = relay.connect_as("b");
        a.join("room").await.unwrap();
        while a_rx.try_recv().is_ok() {}

        b.join("room").await.unwrap();
        assert!(matches!(a_rx.try_recv(), Ok(RelayEvent::PeerJoined(_))));
        a.broadcast(partial(7)).await.unwrap();

        assert!(matches!(b_rx.try_recv(), Ok(RelayEvent::Connected(_))));
        assert!(matches!(b_rx.try_recv(), Ok(RelayEvent::Members { .. })));
        assert!(matches!(b_rx.try_recv(), Ok(RelayEvent::Frame { frame, .. }) if frame == partial(7)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_joins_and_broadcasts() {
        let relay = MemoryRelay::new();
        let names: Vec<String> = (0..8).map(|i| format!("p{}", i)).collect();
        let mut tasks = Vec::new();
        for name in &names {
            let (t, mut rx) = relay.connect_as(name.as_str());
            tasks.push(tokio::spawn(async move {
                t.join("busy").await.unwrap();
                t.broadcast(partial(1)).await.unwrap();
                // every frame must come from a peer this member already knows of
                let mut known: Vec<PeerId> = Vec::new();
                let mut seen_members = false;
                while let Ok(Some(event)) =
                    tokio::time::timeout(std::time::Duration::from_millis(200), rx.recv()).await
                {
                    match event {
                        RelayEvent::Members { peers, .. } => {
                            seen_members = true;
                            known.extend(peers);
                        }
                        RelayEvent::PeerJoined(id) => known.push(id),
                        RelayEvent::Frame { from, .. } => {
                            assert!(seen_members);
                            assert!(known.contains(&from), "frame from unannounced {}", from);
                        }
                        _ => {}
                    }
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(relay.room_members("busy").len(), names.len());
    }

    #[tokio::test]
    async fn test_broadcast_requires_room() {
        let relay = MemoryRelay::new();
        let (a, _rx) = relay.connect_as("a");
        assert!(a.broadcast(partial(1)).await.is_err());
    }
}
