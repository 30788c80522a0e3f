//! Room session driver
//!
//! A [`Room`] owns one participant's key agreement, roll engine and channel
//! key, and runs as a single tokio task. That task is the receive queue:
//! every relay event is processed to completion, crypto included, before the
//! next one is looked at. Outgoing frames go through a separate
//! [`SerialQueue`], so a slow seal never reorders sends and never blocks
//! receives.

use crate::channel::{self, ChannelKey, Envelope, SealedMessage, SerialQueue};
use crate::gka::{GkaOutput, KeyAgreement, Peer, SharedSecret};
use crate::identity::Identity;
use crate::roll::{RollEngine, RollOutput, RollResult};
use crate::transport::{Frame, RelayEvent, Transport};
use crate::types::{DiceSet, RoomConfig, SessionState};
use crate::{Error, PeerId, Result};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

/// Notifications for the application
#[derive(Debug, Clone)]
pub enum RoomEvent {
    /// Session state changed
    StateChanged(SessionState),
    /// A new key is installed for this membership
    Members {
        peers: Vec<Peer>,
        /// Peers gone since the previous key
        removed: Vec<Peer>,
        /// Confirmation phrase to compare out of band
        phrase: String,
    },
    Nick { peer: PeerId, nick: String },
    Chat { peer: PeerId, text: String },
    /// A peer proposed the dice for the following rolls
    DiceProposed { peer: PeerId, dice: DiceSet },
    RollResult(RollResult),
    /// A peer confirmed our phrase
    GroupVerified { peer: PeerId },
    /// A peer reported a different phrase; the group may be compromised
    VerifyFailed { peer: PeerId, phrase: String },
    DecryptionFailure { peer: PeerId },
    SignatureFailure {
        peer: PeerId,
        payload: Vec<u8>,
        signature: Vec<u8>,
    },
    /// Any other rejected message or failed operation
    Fault(Error),
}

enum Command {
    Chat(String),
    SetNick(String),
    ProposeDice(DiceSet),
    Roll(usize),
    RollAll,
    Shutdown,
}

/// Handle for driving a running [`Room`]
///
/// Dropping every handle shuts the room down.
#[derive(Clone)]
pub struct RoomHandle {
    local_id: PeerId,
    commands: mpsc::UnboundedSender<Command>,
}

impl RoomHandle {
    /// Relay id of this participant
    pub fn local_id(&self) -> &PeerId {
        &self.local_id
    }

    /// Send a chat line to the group
    pub fn chat(&self, text: impl Into<String>) -> Result<()> {
        self.send(Command::Chat(text.into()))
    }

    /// Set and announce our nickname
    pub fn set_nick(&self, nick: impl Into<String>) -> Result<()> {
        self.send(Command::SetNick(nick.into()))
    }

    /// Propose a dice set for subsequent rolls
    pub fn propose_dice(&self, dice: DiceSet) -> Result<()> {
        self.send(Command::ProposeDice(dice))
    }

    /// Start a roll of one die of the current set
    pub fn roll(&self, which: usize) -> Result<()> {
        self.send(Command::Roll(which))
    }

    /// Re-propose the current set and roll every die in it
    pub fn roll_all(&self) -> Result<()> {
        self.send(Command::RollAll)
    }

    /// Stop the room task
    pub fn shutdown(&self) -> Result<()> {
        self.send(Command::Shutdown)
    }

    fn send(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| Error::Relay("room task has stopped".into()))
    }
}

/// One participant's session in a relay room
pub struct Room<T: Transport + 'static> {
    config: RoomConfig,
    transport: Arc<T>,
    identity: Arc<Identity>,
    gka: KeyAgreement,
    rolls: RollEngine,
    key: Option<Arc<ChannelKey>>,
    /// Sealed messages that arrived before the current key
    deferred: Vec<(PeerId, SealedMessage)>,
    send_queue: SerialQueue,
    events: mpsc::UnboundedSender<RoomEvent>,
    state: SessionState,
    nick: Option<String>,
}

impl<T: Transport + 'static> Room<T> {
    /// Start a room task on the current tokio runtime
    ///
    /// `inbound` carries the relay events for `transport`. The room joins
    /// `config.room` as soon as the relay reports the connection.
    pub fn spawn(
        config: RoomConfig,
        transport: T,
        inbound: mpsc::UnboundedReceiver<RelayEvent>,
    ) -> Result<(RoomHandle, mpsc::UnboundedReceiver<RoomEvent>)> {
        config.validate()?;
        let params = config.group_params()?;
        let local_id = transport.local_id();
        let identity = Arc::new(Identity::generate());

        let gka = KeyAgreement::new(
            params.clone(),
            local_id.clone(),
            identity.public_key(),
            config.id_words,
        )?;
        let rolls = RollEngine::new(local_id.clone(), params.modulus, config.dice.clone());

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (command_tx, command_rx) = mpsc::unbounded_channel();

        let room = Room {
            nick: config.nick.clone(),
            config,
            transport: Arc::new(transport),
            identity,
            gka,
            rolls,
            key: None,
            deferred: Vec::new(),
            send_queue: SerialQueue::spawn("send"),
            events: event_tx,
            state: SessionState::Disconnected,
        };
        tokio::spawn(room.run(inbound, command_rx));

        let handle = RoomHandle {
            local_id,
            commands: command_tx,
        };
        Ok((handle, event_rx))
    }

    #[instrument(skip_all, fields(peer = %self.gka.local_id(), room = %self.config.room))]
    async fn run(
        mut self,
        mut inbound: mpsc::UnboundedReceiver<RelayEvent>,
        mut commands: mpsc::UnboundedReceiver<Command>,
    ) {
        info!("room task started");
        loop {
            tokio::select! {
                event = inbound.recv() => match event {
                    Some(event) => {
                        if let Err(e) = self.on_relay_event(event).await {
                            self.report(e);
                        }
                    }
                    None => {
                        info!("relay connection closed");
                        break;
                    }
                },
                command = commands.recv() => match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => {
                        if let Err(e) = self.on_command(command).await {
                            self.report(e);
                        }
                    }
                },
            }
        }
        if let Err(e) = self.send_queue.flush().await {
            debug!(error = %e, "send queue already gone");
        }
        self.key = None;
        info!("room task stopped");
    }

    async fn on_relay_event(&mut self, event: RelayEvent) -> Result<()> {
        match event {
            RelayEvent::Connected(id) => {
                if id != *self.gka.local_id() {
                    warn!(assigned = %id, "relay assigned a different id");
                }
                self.gka.connected();
                self.publish_state();
                self.transport.join(&self.config.room).await
            }
            RelayEvent::Members { room, peers } => {
                debug!(%room, peers = peers.len(), "members snapshot");
                let outs = self.gka.set_members(peers)?;
                self.membership_changed(outs).await
            }
            RelayEvent::PeerJoined(id) => {
                let outs = self.gka.peer_joined(id)?;
                self.membership_changed(outs).await
            }
            RelayEvent::PeerLeft(id) => {
                let outs = self.gka.peer_left(&id)?;
                self.membership_changed(outs).await
            }
            RelayEvent::Frame { from, frame } => match frame {
                Frame::PubKey(msg) => {
                    let outs = self.gka.on_pubkey(&from, msg)?;
                    self.dispatch_gka(outs).await
                }
                Frame::PubKey2(msg) => {
                    let outs = self.gka.on_partial(&from, msg)?;
                    self.dispatch_gka(outs).await
                }
                Frame::Message(sealed) => self.receive_sealed(from, sealed).await,
            },
        }
    }

    /// The key agreement restarted: everything bound to the old key goes
    async fn membership_changed(&mut self, outs: Vec<GkaOutput>) -> Result<()> {
        self.key = None;
        self.deferred.clear();
        self.rolls.reset();
        self.publish_state();
        self.dispatch_gka(outs).await
    }

    async fn dispatch_gka(&mut self, outs: Vec<GkaOutput>) -> Result<()> {
        for out in outs {
            match out {
                GkaOutput::Broadcast(msg) => self.send_frame(None, Frame::PubKey(msg))?,
                GkaOutput::Forward { to, message } => {
                    self.send_frame(Some(to), Frame::PubKey2(message))?
                }
                GkaOutput::Keyed { secret, phrase } => self.install_key(secret, phrase).await?,
            }
        }
        Ok(())
    }

    async fn install_key(&mut self, secret: SharedSecret, phrase: String) -> Result<()> {
        let key = channel::import_async(secret).await?;
        self.key = Some(Arc::new(key));
        self.publish_state();

        let removed = self.gka.take_removed();
        let names: Vec<&str> = self.gka.peers().map(|p| p.display_name()).collect();
        info!(members = ?names, removed = removed.len(), "channel keyed");
        self.emit(RoomEvent::Members {
            peers: self.gka.peers().cloned().collect(),
            removed,
            phrase: phrase.clone(),
        });

        self.send_envelope(Envelope::GroupVerify(phrase))?;
        if let Some(nick) = self.nick.clone() {
            self.send_envelope(Envelope::Nick(nick))?;
        }
        if self.gka.channel_ready() {
            self.publish_state();
        }

        let deferred = std::mem::take(&mut self.deferred);
        if !deferred.is_empty() {
            debug!(count = deferred.len(), "replaying deferred messages");
        }
        for (from, sealed) in deferred {
            if let Err(e) = self.receive_sealed(from, sealed).await {
                self.report(e);
            }
        }
        Ok(())
    }

    async fn receive_sealed(&mut self, from: PeerId, sealed: SealedMessage) -> Result<()> {
        if !self.gka.is_member(&from) {
            return Err(Error::UnknownPeer(from));
        }
        let Some(key) = self.key.clone() else {
            debug!(peer = %from, "no key yet, deferring message");
            self.deferred.push((from, sealed));
            return Ok(());
        };
        let sender = self
            .gka
            .peer_identity(&from)
            .ok_or_else(|| Error::violation(&from, "no identity key for this round"))?;

        let signature = sealed.signature.to_vec();
        let opened = channel::open_async(key, from.clone(), sender, sealed).await?;
        let received = self.gka.record_received(&from);
        debug!(peer = %from, received, "message decrypted");

        if !opened.signature_valid {
            let error = Error::SignatureFailure(from.clone());
            warn!(error = %error, strict = self.config.strict_signatures, "signature check failed");
            self.emit(RoomEvent::SignatureFailure {
                peer: from.clone(),
                payload: opened.payload.clone(),
                signature,
            });
            if self.config.strict_signatures {
                return Ok(());
            }
        }

        match Envelope::decode(&opened.payload)? {
            Some(envelope) => self.on_envelope(from, envelope).await,
            None => {
                debug!(peer = %from, "chaff");
                Ok(())
            }
        }
    }

    async fn on_envelope(&mut self, from: PeerId, envelope: Envelope) -> Result<()> {
        debug!(peer = %from, topic = envelope.topic(), "envelope");
        match envelope {
            Envelope::Nick(nick) => {
                self.gka.set_nick(&from, nick.clone())?;
                self.emit(RoomEvent::Nick { peer: from, nick });
            }
            Envelope::Chat(text) => self.emit(RoomEvent::Chat { peer: from, text }),
            Envelope::Roll(dice) => {
                dice.validate()
                    .map_err(|e| Error::violation(&from, e.to_string()))?;
                info!(peer = %from, dice = dice.len(), "new dice proposed");
                self.rolls.set_dice(dice.clone());
                self.emit(RoomEvent::DiceProposed { peer: from, dice });
            }
            Envelope::Commit(msg) => {
                let peers = self.gka.peer_ids();
                let outs = self.rolls.on_commit(&from, msg, &peers)?;
                self.dispatch_rolls(outs)?;
            }
            Envelope::Reveal(msg) => {
                let peers = self.gka.peer_ids();
                let outs = self.rolls.on_reveal(&from, msg, &peers)?;
                self.dispatch_rolls(outs)?;
            }
            Envelope::GroupVerify(phrase) => {
                let secured = self.gka.on_group_verify(&from, &phrase)?;
                if self.gka.peer(&from).map_or(false, |p| p.verified) {
                    self.emit(RoomEvent::GroupVerified { peer: from });
                }
                if secured {
                    self.publish_state();
                }
            }
        }
        Ok(())
    }

    async fn on_command(&mut self, command: Command) -> Result<()> {
        match command {
            Command::Chat(text) => self.send_envelope(Envelope::Chat(text)),
            Command::SetNick(nick) => {
                self.nick = Some(nick.clone());
                self.send_envelope(Envelope::Nick(nick))
            }
            Command::ProposeDice(dice) => {
                dice.validate()?;
                self.rolls.set_dice(dice.clone());
                self.send_envelope(Envelope::Roll(dice))
            }
            Command::Roll(which) => self.start_roll(which),
            Command::RollAll => {
                let dice = self.rolls.dice().as_ref().clone();
                let count = dice.len();
                self.send_envelope(Envelope::Roll(dice))?;
                for which in 0..count {
                    self.start_roll(which)?;
                }
                Ok(())
            }
            // handled by the run loop
            Command::Shutdown => Ok(()),
        }
    }

    fn start_roll(&mut self, which: usize) -> Result<()> {
        if self.key.is_none() {
            return Err(Error::violation(
                self.gka.local_id(),
                "roll requested before the channel is keyed",
            ));
        }
        let peers = self.gka.peer_ids();
        let outs = self.rolls.start(which, &peers)?;
        self.dispatch_rolls(outs)
    }

    fn dispatch_rolls(&mut self, outs: Vec<RollOutput>) -> Result<()> {
        for out in outs {
            match out {
                RollOutput::Commit(msg) => self.send_envelope(Envelope::Commit(msg))?,
                RollOutput::Reveal(msg) => self.send_envelope(Envelope::Reveal(msg))?,
                RollOutput::Finalized(result) => self.emit(RoomEvent::RollResult(result)),
            }
        }
        Ok(())
    }

    /// Queue a sealed broadcast under the key current right now
    fn send_envelope(&self, envelope: Envelope) -> Result<()> {
        let Some(key) = self.key.clone() else {
            warn!(topic = envelope.topic(), "no channel key, dropping message");
            return Ok(());
        };
        let payload = envelope.encode()?;
        let identity = self.identity.clone();
        let transport = self.transport.clone();
        let events = self.events.clone();

        self.send_queue.push(async move {
            let sent = match channel::seal_async(key, identity, payload).await {
                Ok(sealed) => transport.broadcast(Frame::Message(sealed)).await,
                Err(e) => Err(e),
            };
            if let Err(e) = sent {
                warn!(error = %e, "sealed send failed");
                let _ = events.send(RoomEvent::Fault(e));
            }
        })
    }

    /// Queue a plaintext key agreement frame
    fn send_frame(&self, to: Option<PeerId>, frame: Frame) -> Result<()> {
        let transport = self.transport.clone();
        let events = self.events.clone();

        self.send_queue.push(async move {
            let topic = frame.topic();
            let sent = match &to {
                Some(dest) => transport.send_to(dest, frame).await,
                None => transport.broadcast(frame).await,
            };
            if let Err(e) = sent {
                warn!(topic, error = %e, "send failed");
                let _ = events.send(RoomEvent::Fault(e));
            }
        })
    }

    fn publish_state(&mut self) {
        let state = self.gka.state();
        if state != self.state {
            info!(from = %self.state, to = %state, "room state");
            self.state = state;
            self.emit(RoomEvent::StateChanged(state));
        }
    }

    fn report(&mut self, error: Error) {
        match error {
            Error::DecryptionFailure(peer) => {
                warn!(peer = %peer, "decryption failed");
                self.emit(RoomEvent::DecryptionFailure { peer });
            }
            Error::VerificationMismatch { peer, phrase } => {
                self.emit(RoomEvent::VerifyFailed { peer, phrase });
                self.publish_state();
            }
            error => {
                warn!(error = %error, cheat = error.is_cheat(), "rejected");
                self.emit(RoomEvent::Fault(error));
            }
        }
    }

    fn emit(&self, event: RoomEvent) {
        if self.events.send(event).is_err() {
            debug!("event receiver dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{async_trait, MemoryRelay, MemoryTransport};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    struct Party {
        id: PeerId,
        handle: RoomHandle,
        events: mpsc::UnboundedReceiver<RoomEvent>,
        seen: Vec<RoomEvent>,
    }

    impl Party {
        async fn until<F: FnMut(&RoomEvent) -> bool>(&mut self, mut pred: F) -> RoomEvent {
            let wait = async {
                loop {
                    let event = self.events.recv().await.expect("room stopped");
                    self.seen.push(event.clone());
                    if pred(&event) {
                        return event;
                    }
                }
            };
            tokio::time::timeout(Duration::from_secs(10), wait)
                .await
                .expect("timed out waiting for room event")
        }

        async fn secured(&mut self) {
            self.until(|e| matches!(e, RoomEvent::StateChanged(SessionState::Secured)))
                .await;
        }

        fn phrase(&self) -> Option<String> {
            self.seen.iter().rev().find_map(|e| match e {
                RoomEvent::Members { phrase, .. } => Some(phrase.clone()),
                _ => None,
            })
        }

        fn results(&self) -> Vec<RollResult> {
            let mut results: Vec<RollResult> = self
                .seen
                .iter()
                .filter_map(|e| match e {
                    RoomEvent::RollResult(r) => Some(r.clone()),
                    _ => None,
                })
                .collect();
            results.sort_by(|a, b| a.tag.cmp(&b.tag));
            results
        }
    }

    fn join<T: Transport + 'static>(
        transport: T,
        inbound: mpsc::UnboundedReceiver<RelayEvent>,
        config: RoomConfig,
    ) -> Party {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
        let id = transport.local_id();
        let (handle, events) = Room::spawn(config, transport, inbound).unwrap();
        Party {
            id,
            handle,
            events,
            seen: Vec::new(),
        }
    }

    fn join_memory(relay: &MemoryRelay, id: &str, config: RoomConfig) -> Party {
        let (transport, inbound) = relay.connect_as(id);
        join(transport, inbound, config)
    }

    /// Sends every sealed message twice, as a faulty relay might
    struct Duplicating(MemoryTransport);

    #[async_trait]
    impl Transport for Duplicating {
        fn local_id(&self) -> PeerId {
            self.0.local_id()
        }

        async fn join(&self, room: &str) -> Result<()> {
            self.0.join(room).await
        }

        async fn broadcast(&self, frame: Frame) -> Result<()> {
            if matches!(frame, Frame::Message(_)) {
                self.0.broadcast(frame.clone()).await?;
            }
            self.0.broadcast(frame).await
        }

        async fn send_to(&self, dest: &PeerId, frame: Frame) -> Result<()> {
            self.0.send_to(dest, frame).await
        }
    }

    /// Corrupts the signature of sealed messages while armed
    struct Forging {
        inner: MemoryTransport,
        armed: Arc<AtomicBool>,
    }

    #[async_trait]
    impl Transport for Forging {
        fn local_id(&self) -> PeerId {
            self.inner.local_id()
        }

        async fn join(&self, room: &str) -> Result<()> {
            self.inner.join(room).await
        }

        async fn broadcast(&self, frame: Frame) -> Result<()> {
            match frame {
                Frame::Message(mut sealed) if self.armed.load(Ordering::SeqCst) => {
                    sealed.signature[0] ^= 0x01;
                    self.inner.broadcast(Frame::Message(sealed)).await
                }
                frame => self.inner.broadcast(frame).await,
            }
        }

        async fn send_to(&self, dest: &PeerId, frame: Frame) -> Result<()> {
            self.inner.send_to(dest, frame).await
        }
    }

    /// Relay events with `from`'s pubkey held back until `messages` sealed
    /// messages from it went through
    fn hold_pubkey(
        mut inbound: mpsc::UnboundedReceiver<RelayEvent>,
        from: PeerId,
        messages: usize,
    ) -> mpsc::UnboundedReceiver<RelayEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            let mut held = Vec::new();
            let mut seen = 0;
            while let Some(event) = inbound.recv().await {
                let is_pubkey = matches!(
                    &event,
                    RelayEvent::Frame { from: f, frame: Frame::PubKey(_) } if *f == from
                );
                if is_pubkey && seen < messages {
                    held.push(event);
                    continue;
                }
                if matches!(&event, RelayEvent::Frame { from: f, frame: Frame::Message(_) } if *f == from) {
                    seen += 1;
                }
                if tx.send(event).is_err() {
                    break;
                }
                if seen >= messages {
                    for event in held.drain(..) {
                        let _ = tx.send(event);
                    }
                }
            }
        });
        rx
    }

    async fn forged_pair(room: &str, strict: bool) -> (Party, Party, Arc<AtomicBool>) {
        let relay = MemoryRelay::new();
        let mut config = RoomConfig::new(room);
        config.strict_signatures = strict;
        let mut a = join_memory(&relay, "a", config);
        a.secured().await;

        let armed = Arc::new(AtomicBool::new(false));
        let (inner, inbound) = relay.connect_as("b");
        let forging = Forging {
            inner,
            armed: armed.clone(),
        };
        let mut b = join(forging, inbound, RoomConfig::new(room));
        a.secured().await;
        b.secured().await;
        (a, b, armed)
    }

    #[tokio::test]
    async fn test_bad_signature_is_reported_and_delivered() {
        let (mut a, b, armed) = forged_pair("sig", false).await;

        armed.store(true, Ordering::SeqCst);
        b.handle.chat("forged?").unwrap();

        match a.until(|e| matches!(e, RoomEvent::SignatureFailure { .. })).await {
            RoomEvent::SignatureFailure { peer, payload, .. } => {
                assert_eq!(peer, b.id);
                assert_eq!(
                    Envelope::decode(&payload).unwrap(),
                    Some(Envelope::Chat("forged?".into()))
                );
            }
            other => panic!("unexpected {:?}", other),
        }
        match a.until(|e| matches!(e, RoomEvent::Chat { .. })).await {
            RoomEvent::Chat { peer, text } => {
                assert_eq!(peer, b.id);
                assert_eq!(text, "forged?");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_strict_signatures_drop_payload() {
        let (mut a, b, armed) = forged_pair("strict", true).await;

        armed.store(true, Ordering::SeqCst);
        b.handle.chat("forged").unwrap();
        a.until(|e| matches!(e, RoomEvent::SignatureFailure { peer, .. } if *peer == b.id))
            .await;

        armed.store(false, Ordering::SeqCst);
        b.handle.chat("genuine").unwrap();
        match a.until(|e| matches!(e, RoomEvent::Chat { .. })).await {
            RoomEvent::Chat { text, .. } => assert_eq!(text, "genuine"),
            other => panic!("unexpected {:?}", other),
        }
        let forged = a
            .seen
            .iter()
            .filter(|e| matches!(e, RoomEvent::SignatureFailure { .. }))
            .count();
        assert_eq!(forged, 1);
    }

    #[tokio::test]
    async fn test_early_messages_replay_in_order() {
        let relay = MemoryRelay::new();
        let (transport, inbound) = relay.connect_as("a");
        // b's group-verify plus three chats reach a before b's pubkey does
        let inbound = hold_pubkey(inbound, PeerId::from("b"), 4);
        let mut a = join(transport, inbound, RoomConfig::new("late"));
        a.secured().await;

        let mut b = join_memory(&relay, "b", RoomConfig::new("late"));
        b.until(|e| matches!(e, RoomEvent::StateChanged(SessionState::Keyed)))
            .await;
        for text in ["one", "two", "three"] {
            b.handle.chat(text).unwrap();
        }

        let mut chats = Vec::new();
        a.until(|e| {
            if let RoomEvent::Chat { text, .. } = e {
                chats.push(text.clone());
            }
            chats.len() == 3
        })
        .await;
        assert_eq!(chats, vec!["one", "two", "three"]);

        // the chats were queued behind the key, not delivered without it
        let keyed_at = a
            .seen
            .iter()
            .rposition(|e| matches!(e, RoomEvent::Members { .. }))
            .unwrap();
        let first_chat = a
            .seen
            .iter()
            .position(|e| matches!(e, RoomEvent::Chat { .. }))
            .unwrap();
        assert!(keyed_at < first_chat);
        assert!(a.seen[keyed_at..first_chat]
            .iter()
            .any(|e| matches!(e, RoomEvent::StateChanged(SessionState::Secured))));
    }

    #[tokio::test]
    async fn test_phrase_mismatch_fails_verification() {
        let relay = MemoryRelay::new();
        let mut a = join_memory(&relay, "a", RoomConfig::new("split"));
        a.secured().await;

        let mut config = RoomConfig::new("split");
        config.phrase_words = 4;
        let b = join_memory(&relay, "b", config);

        match a.until(|e| matches!(e, RoomEvent::VerifyFailed { .. })).await {
            RoomEvent::VerifyFailed { peer, phrase } => {
                assert_eq!(peer, b.id);
                assert_eq!(phrase.split(' ').count(), 4);
            }
            other => panic!("unexpected {:?}", other),
        }
        a.until(|e| matches!(e, RoomEvent::StateChanged(SessionState::VerifyFailed)))
            .await;

        // the channel keeps working so the warning can be discussed in it
        b.handle.chat("are we split?").unwrap();
        a.until(|e| matches!(e, RoomEvent::Chat { text, .. } if text == "are we split?"))
            .await;
    }

    #[tokio::test]
    async fn test_shutdown_flushes_sends() {
        let relay = MemoryRelay::new();
        let mut a = join_memory(&relay, "a", RoomConfig::new("bye"));
        a.secured().await;
        let mut b = join_memory(&relay, "b", RoomConfig::new("bye"));
        a.secured().await;
        b.secured().await;

        a.handle.chat("last words").unwrap();
        a.handle.shutdown().unwrap();
        b.until(|e| matches!(e, RoomEvent::Chat { text, .. } if text == "last words"))
            .await;
        let stopped = tokio::time::timeout(Duration::from_secs(10), async {
            while a.events.recv().await.is_some() {}
        })
        .await;
        assert!(stopped.is_ok());
        assert!(a.handle.chat("too late").is_err());
    }

    #[tokio::test]
    async fn test_single_peer_secures() {
        let relay = MemoryRelay::new();
        let mut solo = join_memory(&relay, "solo", RoomConfig::new("t"));
        solo.secured().await;

        let phrase = solo.phrase().expect("members event");
        assert_eq!(phrase.split(' ').count(), 5);

        solo.handle.roll(0).unwrap();
        match solo.until(|e| matches!(e, RoomEvent::RollResult(_))).await {
            RoomEvent::RollResult(r) => assert!(r.face < 6),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_three_peers_agree() {
        let relay = MemoryRelay::new();
        let mut config = RoomConfig::new("table");
        config.nick = Some("alice".into());
        let mut a = join_memory(&relay, "a", config);
        a.secured().await;

        let mut b = join_memory(&relay, "b", RoomConfig::new("table"));
        a.secured().await;
        b.secured().await;

        let mut c = join_memory(&relay, "c", RoomConfig::new("table"));
        for p in [&mut a, &mut b, &mut c] {
            p.secured().await;
        }

        let phrase = a.phrase().unwrap();
        assert_eq!(b.phrase().unwrap(), phrase);
        assert_eq!(c.phrase().unwrap(), phrase);

        c.until(|e| matches!(e, RoomEvent::Nick { peer, nick } if peer.as_str() == "a" && nick == "alice"))
            .await;

        a.handle.chat("hello table").unwrap();
        b.until(|e| matches!(e, RoomEvent::Chat { peer, text } if peer.as_str() == "a" && text == "hello table"))
            .await;

        a.handle.roll_all().unwrap();
        for p in [&mut a, &mut b, &mut c] {
            let mut n = 0;
            p.until(|e| {
                if matches!(e, RoomEvent::RollResult(_)) {
                    n += 1;
                }
                n == 2
            })
            .await;
        }

        let results = a.results();
        assert_eq!(results.len(), 2);
        assert_eq!(b.results(), results);
        assert_eq!(c.results(), results);
        assert_eq!(results.iter().map(|r| r.which).sum::<usize>(), 1);
        assert!(c.seen.iter().any(|e| matches!(e, RoomEvent::DiceProposed { peer, .. } if peer.as_str() == "a")));
    }

    #[tokio::test]
    async fn test_duplicated_messages_are_reported() {
        let relay = MemoryRelay::new();
        let mut a = join_memory(&relay, "a", RoomConfig::new("dup"));
        a.secured().await;

        let (transport, inbound) = relay.connect_as("b");
        let mut b = join(Duplicating(transport), inbound, RoomConfig::new("dup"));
        a.secured().await;
        b.secured().await;

        b.handle.roll(1).unwrap();
        a.until(|e| matches!(e, RoomEvent::Fault(Error::DuplicateReveal { .. })))
            .await;
        b.until(|e| matches!(e, RoomEvent::RollResult(_))).await;

        assert!(a
            .seen
            .iter()
            .any(|e| matches!(e, RoomEvent::Fault(Error::DuplicateCommit { peer, .. }) if peer.as_str() == "b")));
        assert_eq!(a.results(), b.results());
        assert_eq!(a.results()[0].which, 1);
    }

    #[tokio::test]
    async fn test_rejects_unknown_peer_and_bad_ciphertext() {
        let relay = MemoryRelay::new();
        let mut a = join_memory(&relay, "a", RoomConfig::new("x"));
        a.secured().await;
        let mut b = join_memory(&relay, "b", RoomConfig::new("x"));
        a.secured().await;
        b.secured().await;

        let garbage = SealedMessage {
            nonce: [0u8; channel::NONCE_LEN],
            ciphertext: vec![1, 2, 3, 4],
            signature: [0u8; 64],
        };

        relay
            .inject(
                &a.id,
                RelayEvent::Frame {
                    from: PeerId::from("ghost"),
                    frame: Frame::Message(garbage.clone()),
                },
            )
            .unwrap();
        a.until(|e| matches!(e, RoomEvent::Fault(Error::UnknownPeer(p)) if p.as_str() == "ghost"))
            .await;

        relay
            .inject(
                &a.id,
                RelayEvent::Frame {
                    from: b.id.clone(),
                    frame: Frame::Message(garbage),
                },
            )
            .unwrap();
        a.until(|e| matches!(e, RoomEvent::DecryptionFailure { peer } if peer.as_str() == "b"))
            .await;
    }

    #[tokio::test]
    async fn test_peer_leaving_rekeys() {
        let relay = MemoryRelay::new();
        let mut a = join_memory(&relay, "a", RoomConfig::new("churn"));
        a.secured().await;
        let mut b = join_memory(&relay, "b", RoomConfig::new("churn"));
        a.secured().await;
        b.secured().await;
        let before = a.phrase().unwrap();

        relay.disconnect(&b.id);
        a.secured().await;

        match a.seen.iter().rev().find(|e| matches!(e, RoomEvent::Members { .. })) {
            Some(RoomEvent::Members { peers, removed, phrase }) => {
                assert!(peers.is_empty());
                assert_eq!(removed.len(), 1);
                assert_eq!(removed[0].id.as_str(), "b");
                assert_ne!(*phrase, before);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_roll_before_key_is_rejected() {
        let relay = MemoryRelay::new();
        let (transport, _connected) = relay.connect_as("early");
        // an inbound stream that stays silent: never connected, never keyed
        let (_inbound_tx, inbound) = mpsc::unbounded_channel();
        let mut early = join(transport, inbound, RoomConfig::new("r"));

        early.handle.roll(0).unwrap();
        match early.until(|_| true).await {
            RoomEvent::Fault(Error::ProtocolViolation { peer, .. }) => assert_eq!(peer, early.id),
            other => panic!("unexpected {:?}", other),
        }
    }
}
