//! Ring Diffie-Hellman group key agreement
//!
//! Every membership change restarts the agreement from round one:
//!
//! 1. each participant draws a fresh exponent `x` and broadcasts `g^x`
//!    together with its identity key;
//! 2. participants are arranged in a ring ordered by relay id; a value
//!    received from the ring predecessor is raised to `x` and forwarded to
//!    the successor, until every participant has seen one input per peer;
//! 3. the last input holds every other exponent, so raising it to `x` yields
//!    `g^(product of all exponents)`, identical for everyone.
//!
//! The engine is sans-IO: it consumes relay events and returns
//! [`GkaOutput`]s for the caller to send.

mod messages;
mod ring;

pub use messages::*;
pub use ring::ring_neighbors;

use crate::arith::{self, modpow};
use crate::identity::IdentityKey;
use crate::types::{GroupParams, SessionState};
use crate::{words, Error, PeerId, Result};
use num_bigint::BigUint;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use subtle::ConstantTimeEq;
use tracing::{debug, info, warn};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// A remote participant as seen by the local session
#[derive(Debug, Clone)]
pub struct Peer {
    /// Relay assigned id
    pub id: PeerId,
    /// Announced nickname
    pub nick: Option<String>,
    /// Round one public share
    pub share: Option<BigUint>,
    /// Signing key received with the share
    pub identity: Option<IdentityKey>,
    /// Word rendering of the identity key hash
    pub human_id: Option<String>,
    /// Sent a matching confirmation phrase for the current key
    pub verified: bool,
    /// Channel messages successfully decrypted from this peer
    pub received: u64,
}

impl Peer {
    fn new(id: PeerId) -> Self {
        Self {
            id,
            nick: None,
            share: None,
            identity: None,
            human_id: None,
            verified: false,
            received: 0,
        }
    }

    fn reset_round(&mut self) {
        self.share = None;
        self.identity = None;
        self.human_id = None;
        self.verified = false;
    }

    /// Nickname if announced, otherwise the relay id
    pub fn display_name(&self) -> &str {
        self.nick.as_deref().unwrap_or(self.id.as_str())
    }
}

/// Shared group secret in fixed-width encoding
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SharedSecret([u8; arith::WIDTH]);

impl SharedSecret {
    fn from_int(value: &BigUint) -> Result<Self> {
        let bytes = arith::int_to_bytes(value, arith::WIDTH)?;
        let mut arr = [0u8; arith::WIDTH];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }

    /// Raw key material
    pub fn as_bytes(&self) -> &[u8; arith::WIDTH] {
        &self.0
    }

    /// Secret as an integer
    pub fn to_int(&self) -> BigUint {
        arith::bytes_to_int(&self.0)
    }
}

impl fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SharedSecret([REDACTED])")
    }
}

/// Work the caller must carry out on behalf of the engine
#[derive(Debug)]
pub enum GkaOutput {
    /// Broadcast the round one message to the room
    Broadcast(PubKeyMessage),
    /// Send a partial aggregate to the ring successor
    Forward {
        to: PeerId,
        message: PartialKeyMessage,
    },
    /// Agreement finished; install the key and announce the phrase
    Keyed {
        secret: SharedSecret,
        phrase: String,
    },
}

/// Key agreement state for one room membership
pub struct KeyAgreement {
    params: GroupParams,
    local_id: PeerId,
    identity: IdentityKey,
    id_words: usize,
    state: SessionState,
    exponent: BigUint,
    share: BigUint,
    next: Option<PeerId>,
    prev: Option<PeerId>,
    partials_received: usize,
    aggregate: Option<BigUint>,
    secret: Option<SharedSecret>,
    phrase: Option<String>,
    peers: BTreeMap<PeerId, Peer>,
    removed: BTreeMap<PeerId, Peer>,
}

impl KeyAgreement {
    /// Create a disconnected session
    pub fn new(
        params: GroupParams,
        local_id: PeerId,
        identity: IdentityKey,
        id_words: usize,
    ) -> Result<Self> {
        let exponent = arith::random_int(params.exponent_bytes);
        let share = modpow(&params.generator, &exponent, &params.modulus)?;
        Ok(Self {
            params,
            local_id,
            identity,
            id_words,
            state: SessionState::Disconnected,
            exponent,
            share,
            next: None,
            prev: None,
            partials_received: 0,
            aggregate: None,
            secret: None,
            phrase: None,
            peers: BTreeMap::new(),
            removed: BTreeMap::new(),
        })
    }

    /// Current lifecycle state
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Our relay id
    pub fn local_id(&self) -> &PeerId {
        &self.local_id
    }

    /// Confirmation phrase for the current key
    pub fn phrase(&self) -> Option<&str> {
        self.phrase.as_deref()
    }

    /// Current shared secret
    pub fn secret(&self) -> Option<&SharedSecret> {
        self.secret.as_ref()
    }

    /// Our public share for this round
    pub fn share(&self) -> &BigUint {
        &self.share
    }

    /// Ring successor and predecessor for this round
    pub fn neighbors(&self) -> Option<(&PeerId, &PeerId)> {
        Some((self.next.as_ref()?, self.prev.as_ref()?))
    }

    /// Remote peers in relay id order
    pub fn peers(&self) -> impl Iterator<Item = &Peer> {
        self.peers.values()
    }

    /// Relay ids of the remote peers
    pub fn peer_ids(&self) -> Vec<PeerId> {
        self.peers.keys().cloned().collect()
    }

    /// Look up one peer
    pub fn peer(&self, id: &PeerId) -> Option<&Peer> {
        self.peers.get(id)
    }

    /// Number of remote peers
    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Whether `id` is in the local membership view
    pub fn is_member(&self, id: &PeerId) -> bool {
        self.peers.contains_key(id)
    }

    /// Identity key received from `id` this round
    pub fn peer_identity(&self, id: &PeerId) -> Option<IdentityKey> {
        self.peers.get(id).and_then(|p| p.identity)
    }

    /// Peers removed since the last call
    pub fn take_removed(&mut self) -> Vec<Peer> {
        std::mem::take(&mut self.removed).into_values().collect()
    }

    /// Relay connection (re)established
    pub fn connected(&mut self) {
        self.secret = None;
        self.phrase = None;
        self.aggregate = None;
        self.set_state(SessionState::Connected);
    }

    /// Replace the membership view with a relay snapshot and rekey
    pub fn set_members(&mut self, members: Vec<PeerId>) -> Result<Vec<GkaOutput>> {
        if self.state != SessionState::Connected {
            debug!(state = %self.state, "unexpected members message");
        }

        let incoming: Vec<PeerId> = members
            .into_iter()
            .filter(|id| *id != self.local_id)
            .collect();

        let stale: Vec<PeerId> = self
            .peers
            .keys()
            .filter(|id| !incoming.contains(id))
            .cloned()
            .collect();
        for id in stale {
            if let Some(peer) = self.peers.remove(&id) {
                debug!(peer = %id, "removed by members snapshot");
                self.removed.insert(id, peer);
            }
        }
        for id in incoming {
            self.removed.remove(&id);
            self.peers.entry(id.clone()).or_insert_with(|| Peer::new(id));
        }

        self.rekey()
    }

    /// A peer joined the room
    pub fn peer_joined(&mut self, id: PeerId) -> Result<Vec<GkaOutput>> {
        if self.state != SessionState::Secured {
            debug!(state = %self.state, peer = %id, "unexpected peer join");
        }
        if id == self.local_id || self.peers.contains_key(&id) {
            return Err(Error::violation(&id, "duplicate peer joined"));
        }

        info!(peer = %id, "peer joined");
        self.removed.remove(&id);
        self.peers.insert(id.clone(), Peer::new(id));
        self.rekey()
    }

    /// A peer left the room
    pub fn peer_left(&mut self, id: &PeerId) -> Result<Vec<GkaOutput>> {
        let peer = self
            .peers
            .remove(id)
            .ok_or_else(|| Error::UnknownPeer(id.clone()))?;

        info!(peer = %id, "peer left");
        self.removed.insert(id.clone(), peer);
        self.rekey()
    }

    /// Start a new agreement with a fresh exponent
    pub fn rekey(&mut self) -> Result<Vec<GkaOutput>> {
        let exponent = arith::random_int(self.params.exponent_bytes);
        self.rekey_with(exponent)
    }

    /// Start a new agreement with the given exponent
    pub(crate) fn rekey_with(&mut self, exponent: BigUint) -> Result<Vec<GkaOutput>> {
        self.set_state(SessionState::Rekeying);

        // the previous key must not survive into the new round
        self.secret = None;
        self.phrase = None;
        self.aggregate = None;
        self.partials_received = 0;
        for peer in self.peers.values_mut() {
            peer.reset_round();
        }

        self.share = modpow(&self.params.generator, &exponent, &self.params.modulus)?;
        self.exponent = exponent;

        info!(peers = self.peers.len(), "rekey initiated");

        match ring_neighbors(&self.local_id, self.peers.keys()) {
            None => {
                self.next = None;
                self.prev = None;
                self.aggregate = Some(self.params.generator.clone());
                Ok(self.try_complete()?.into_iter().collect())
            }
            Some((next, prev)) => {
                debug!(next = %next, prev = %prev, "ring neighbors");
                self.next = Some(next);
                self.prev = Some(prev);
                Ok(vec![GkaOutput::Broadcast(PubKeyMessage {
                    share: self.share.clone(),
                    identity: self.identity,
                })])
            }
        }
    }

    /// Round one message from a peer
    pub fn on_pubkey(&mut self, from: &PeerId, msg: PubKeyMessage) -> Result<Vec<GkaOutput>> {
        if self.state != SessionState::Rekeying {
            debug!(peer = %from, state = %self.state, "unexpected pubkey message");
        }

        let identity = IdentityKey::from_bytes(msg.identity.as_bytes())
            .map_err(|e| Error::violation(from, format!("bad identity key: {}", e)))?;

        let id_words = self.id_words;
        let peer = self
            .peers
            .get_mut(from)
            .ok_or_else(|| Error::UnknownPeer(from.clone()))?;
        if peer.share.is_some() {
            return Err(Error::violation(from, "already received pubkey"));
        }

        peer.share = Some(msg.share.clone());
        peer.identity = Some(identity);
        peer.human_id = Some(identity.human_id(id_words));
        debug!(peer = %from, human_id = ?peer.human_id, "pubkey received");

        let mut out = Vec::new();

        // the predecessor's raw share is the first input to the ring
        if self.prev.as_ref() == Some(from) {
            out.extend(self.on_partial(
                from,
                PartialKeyMessage {
                    partial: msg.share,
                },
            )?);
        }

        out.extend(self.try_complete()?);
        Ok(out)
    }

    /// Round two partial aggregate from the ring predecessor
    pub fn on_partial(
        &mut self,
        from: &PeerId,
        msg: PartialKeyMessage,
    ) -> Result<Vec<GkaOutput>> {
        if self.state != SessionState::Rekeying {
            debug!(peer = %from, state = %self.state, "unexpected pubkey2 message");
        }
        if !self.peers.contains_key(from) {
            return Err(Error::UnknownPeer(from.clone()));
        }
        if self.prev.as_ref() != Some(from) {
            return Err(Error::violation(from, "pubkey2 from wrong peer"));
        }
        if self.aggregate.is_some() {
            return Err(Error::violation(from, "pubkey2 after aggregate complete"));
        }

        self.partials_received += 1;
        debug!(peer = %from, received = self.partials_received, "partial received");

        if self.partials_received >= self.peers.len() {
            self.aggregate = Some(msg.partial);
            return Ok(self.try_complete()?.into_iter().collect());
        }

        // never forward the final aggregate: raising it would reveal the key
        let next = self
            .next
            .clone()
            .ok_or_else(|| Error::violation(from, "no ring successor"))?;
        let partial = modpow(&msg.partial, &self.exponent, &self.params.modulus)?;
        Ok(vec![GkaOutput::Forward {
            to: next,
            message: PartialKeyMessage { partial },
        }])
    }

    /// Finish the agreement once the aggregate and every identity are known
    fn try_complete(&mut self) -> Result<Option<GkaOutput>> {
        if self.state != SessionState::Rekeying {
            return Ok(None);
        }
        let Some(aggregate) = self.aggregate.as_ref() else {
            return Ok(None);
        };
        if self.peers.values().any(|p| p.identity.is_none()) {
            return Ok(None);
        }

        let value = modpow(aggregate, &self.exponent, &self.params.modulus)?;
        let secret = SharedSecret::from_int(&value)?;
        let phrase = self.confirmation_phrase(&secret);

        self.secret = Some(secret.clone());
        self.phrase = Some(phrase.clone());
        self.set_state(SessionState::Keyed);
        info!(phrase = %phrase, peers = self.peers.len(), "group key established");

        Ok(Some(GkaOutput::Keyed { secret, phrase }))
    }

    /// Hash of the secret and every participant's identity, as words
    fn confirmation_phrase(&self, secret: &SharedSecret) -> String {
        let mut participants: BTreeMap<&PeerId, [u8; 32]> = self
            .peers
            .values()
            .filter_map(|p| p.identity.map(|k| (&p.id, k.hash())))
            .collect();
        participants.insert(&self.local_id, self.identity.hash());

        let mut hasher = Sha256::new();
        hasher.update(secret.as_bytes());
        for hash in participants.values() {
            hasher.update(hash);
        }
        words::to_words(&hasher.finalize(), self.params.phrase_words)
    }

    /// The channel key is installed; a lone participant is secured at once
    pub fn channel_ready(&mut self) -> bool {
        if self.state == SessionState::Keyed && self.peers.is_empty() {
            self.set_state(SessionState::Secured);
            return true;
        }
        false
    }

    /// A peer's confirmation phrase. Returns true when this completes the group.
    pub fn on_group_verify(&mut self, from: &PeerId, phrase: &str) -> Result<bool> {
        let local = self
            .phrase
            .clone()
            .ok_or_else(|| Error::violation(from, "group-verify before keyed"))?;
        let state = self.state;
        let peer = self
            .peers
            .get_mut(from)
            .ok_or_else(|| Error::UnknownPeer(from.clone()))?;

        if state == SessionState::VerifyFailed {
            debug!(peer = %from, "group-verify ignored after failure");
            return Ok(false);
        }

        if !bool::from(local.as_bytes().ct_eq(phrase.as_bytes())) {
            warn!(peer = %from, theirs = %phrase, ours = %local, "group might be compromised");
            self.set_state(SessionState::VerifyFailed);
            return Err(Error::VerificationMismatch {
                peer: from.clone(),
                phrase: phrase.to_string(),
            });
        }

        peer.verified = true;
        debug!(peer = %from, "verified group phrase");

        if state == SessionState::Keyed && self.peers.values().all(|p| p.verified) {
            self.set_state(SessionState::Secured);
            return Ok(true);
        }
        Ok(false)
    }

    /// Record a nickname, returning the previous one
    pub fn set_nick(&mut self, from: &PeerId, nick: String) -> Result<Option<String>> {
        let peer = self
            .peers
            .get_mut(from)
            .ok_or_else(|| Error::UnknownPeer(from.clone()))?;
        Ok(peer.nick.replace(nick))
    }

    /// Count a successfully decrypted message from `from`
    pub fn record_received(&mut self, from: &PeerId) -> u64 {
        match self.peers.get_mut(from) {
            Some(peer) => {
                peer.received += 1;
                peer.received
            }
            None => 0,
        }
    }

    fn set_state(&mut self, state: SessionState) {
        if self.state != state {
            debug!(from = %self.state, to = %state, "state change");
        }
        self.state = state;
    }
}

impl fmt::Debug for KeyAgreement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyAgreement")
            .field("local_id", &self.local_id)
            .field("state", &self.state)
            .field("peers", &self.peers.len())
            .finish_non_exhaustive()
    }
}
