//! Commit-reveal dice rolls
//!
//! Every participant commits to `hash(value)` for a fresh random value before
//! anyone reveals. Once all commitments for a tag are in, values are revealed
//! and checked against their commitments; the face is derived from the tag
//! and every revealed value, so no participant can steer it alone.
//!
//! Combining function: starting from the tag, the accumulator is raised to
//! each revealed value in turn modulo the group modulus. Exponents commute,
//! so the order of reveals does not matter. The accumulator is hashed and
//! reduced modulo the die's face count.
//!
//! A tag or value that confines the accumulator to the small-order part of
//! the group would fix the face regardless of honest contributions. Tags
//! with `tag^c == 1` and values with `tag^(c*v) == 1`, where `c` is the
//! smooth part of `p - 1`, are rejected as cheats.

mod messages;

pub use messages::*;

use crate::arith::{self, modpow};
use crate::types::{DiceSet, Die};
use crate::{Error, PeerId, Result};
use num_bigint::BigUint;
use num_traits::{CheckedSub, One, ToPrimitive, Zero};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Width of a secret roll value in bytes
pub const VALUE_BYTES: usize = arith::WIDTH;

/// Finalized tags remembered for duplicate detection
pub const FINISHED_TAGS: usize = 4096;

/// Attempts at drawing a usable random tag or value
const DRAW_ATTEMPTS: usize = 8;

/// One participant's contribution to a roll
#[derive(Debug, Clone)]
struct Contribution {
    hash: BigUint,
    value: Option<BigUint>,
}

/// Bookkeeping for one tag
#[derive(Debug)]
struct Roll {
    which: usize,
    dice: Arc<DiceSet>,
    entries: BTreeMap<PeerId, Contribution>,
    revealed: bool,
}

/// Messages and results produced by the engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RollOutput {
    /// Broadcast our commitment
    Commit(CommitMessage),
    /// Broadcast our secret value
    Reveal(RevealMessage),
    /// Every value is in; the face is known
    Finalized(RollResult),
}

/// Derive the face of a roll from its tag and every revealed value
///
/// Pure and order independent.
pub fn finalize<'a>(
    tag: &BigUint,
    values: impl IntoIterator<Item = &'a BigUint>,
    sides: u32,
    modulus: &BigUint,
) -> Result<u64> {
    if sides == 0 {
        return Err(Error::InvalidConfig("die has no sides".into()));
    }
    let mut acc = tag.clone();
    for value in values {
        acc = modpow(&acc, value, modulus)?;
    }
    let mixed = arith::hash_to_int(&acc)?;
    (mixed % sides)
        .to_u64()
        .ok_or_else(|| Error::Encoding("face out of range".into()))
}

/// Commitment for a secret value
pub fn commitment(value: &BigUint) -> Result<BigUint> {
    arith::hash_to_int(value)
}

/// Roll state for one room membership
///
/// `peers` arguments are the current remote members, as held by the key
/// agreement. Any membership change must be followed by [`RollEngine::reset`].
/// Finalized rolls are dropped; only their tags are kept, up to
/// [`FINISHED_TAGS`] of them, so late duplicates are still recognised.
#[derive(Debug)]
pub struct RollEngine {
    local_id: PeerId,
    modulus: BigUint,
    cofactor: BigUint,
    dice: Arc<DiceSet>,
    rolls: BTreeMap<RollTag, Roll>,
    finished: BTreeSet<RollTag>,
    finished_order: VecDeque<RollTag>,
}

impl RollEngine {
    pub fn new(local_id: PeerId, modulus: BigUint, dice: DiceSet) -> Self {
        let order = modulus.checked_sub(&BigUint::one()).unwrap_or_default();
        let cofactor = arith::smooth_part(&order, arith::SMOOTH_BOUND);
        Self {
            local_id,
            modulus,
            cofactor,
            dice: Arc::new(dice),
            rolls: BTreeMap::new(),
            finished: BTreeSet::new(),
            finished_order: VecDeque::new(),
        }
    }

    /// Dice used by rolls started from now on
    pub fn dice(&self) -> &Arc<DiceSet> {
        &self.dice
    }

    /// Replace the dice for future rolls; rolls in flight keep their set
    pub fn set_dice(&mut self, dice: DiceSet) {
        self.dice = Arc::new(dice);
    }

    /// Number of rolls not yet finalized
    pub fn pending(&self) -> usize {
        self.rolls.len()
    }

    /// Abandon every roll; returns how many were still in flight
    pub fn reset(&mut self) -> usize {
        let pending = self.pending();
        if pending > 0 {
            info!(pending, "membership changed, abandoning rolls");
        }
        self.rolls.clear();
        self.finished.clear();
        self.finished_order.clear();
        pending
    }

    /// Start a new roll of die `which` under a fresh tag
    pub fn start(&mut self, which: usize, peers: &[PeerId]) -> Result<Vec<RollOutput>> {
        if self.dice.get(which).is_none() {
            return Err(Error::InvalidConfig(format!("no die at index {}", which)));
        }
        let mut tag = RollTag::random();
        for _ in 1..DRAW_ATTEMPTS {
            if self.check_tag(&self.local_id, &tag).is_ok() && !self.rolls.contains_key(&tag) {
                break;
            }
            tag = RollTag::random();
        }
        let value = self.fresh_value(&tag)?;
        self.commit_with(tag, which, value, peers)
    }

    /// Reject tags of small order
    fn check_tag(&self, from: &PeerId, tag: &RollTag) -> Result<()> {
        let reduced = tag.as_int() % &self.modulus;
        if reduced.is_zero() || modpow(&reduced, &self.cofactor, &self.modulus)?.is_one() {
            warn!(peer = %from, tag = %tag.short(), "weak tag");
            return Err(Error::WeakContribution {
                peer: from.clone(),
                tag: tag.to_string(),
            });
        }
        Ok(())
    }

    /// Reject values that send the tag into the small-order subgroup
    fn check_value(&self, from: &PeerId, tag: &RollTag, value: &BigUint) -> Result<()> {
        let exponent = &self.cofactor * value;
        if modpow(tag.as_int(), &exponent, &self.modulus)?.is_one() {
            warn!(peer = %from, tag = %tag.short(), "weak value");
            return Err(Error::WeakContribution {
                peer: from.clone(),
                tag: tag.to_string(),
            });
        }
        Ok(())
    }

    /// Random secret value usable with `tag`
    fn fresh_value(&self, tag: &RollTag) -> Result<BigUint> {
        let mut value = arith::random_int(VALUE_BYTES);
        for _ in 1..DRAW_ATTEMPTS {
            if self.check_value(&self.local_id, tag, &value).is_ok() {
                break;
            }
            value = arith::random_int(VALUE_BYTES);
        }
        Ok(value)
    }

    fn mark_finished(&mut self, tag: RollTag) {
        if self.finished.insert(tag.clone()) {
            self.finished_order.push_back(tag);
        }
        while self.finished_order.len() > FINISHED_TAGS {
            if let Some(old) = self.finished_order.pop_front() {
                self.finished.remove(&old);
            }
        }
    }

    /// Record our own commitment for `tag` and emit it
    pub(crate) fn commit_with(
        &mut self,
        tag: RollTag,
        which: usize,
        value: BigUint,
        peers: &[PeerId],
    ) -> Result<Vec<RollOutput>> {
        if self.finished.contains(&tag) {
            return Err(Error::violation(&self.local_id, "roll already finalized"));
        }
        self.check_tag(&self.local_id, &tag)?;
        self.check_value(&self.local_id, &tag, &value)?;
        let hash = commitment(&value)?;
        let dice = self.dice.clone();
        let roll = self.rolls.entry(tag.clone()).or_insert_with(|| {
            debug!(tag = %tag.short(), which, "new roll");
            Roll {
                which,
                dice,
                entries: BTreeMap::new(),
                revealed: false,
            }
        });
        if roll.entries.contains_key(&self.local_id) {
            return Err(Error::violation(&self.local_id, "already committed to roll"));
        }
        roll.entries.insert(
            self.local_id.clone(),
            Contribution {
                hash: hash.clone(),
                value: Some(value),
            },
        );

        let mut out = vec![RollOutput::Commit(CommitMessage {
            tag: tag.clone(),
            which,
            hash,
        })];
        out.extend(self.advance(&tag, peers)?);
        Ok(out)
    }

    /// A peer's commitment
    pub fn on_commit(
        &mut self,
        from: &PeerId,
        msg: CommitMessage,
        peers: &[PeerId],
    ) -> Result<Vec<RollOutput>> {
        if !peers.contains(from) {
            return Err(Error::UnknownPeer(from.clone()));
        }
        if self.finished.contains(&msg.tag) {
            warn!(peer = %from, tag = %msg.tag.short(), "commit for finalized roll");
            return Err(Error::DuplicateCommit {
                peer: from.clone(),
                tag: msg.tag.to_string(),
            });
        }

        let dice = self
            .rolls
            .get(&msg.tag)
            .map(|r| r.dice.clone())
            .unwrap_or_else(|| self.dice.clone());
        if dice.get(msg.which).is_none() {
            return Err(Error::violation(from, format!("no such die {}", msg.which)));
        }

        let mut out = Vec::new();
        if !self.rolls.contains_key(&msg.tag) {
            // first sight of this tag: join in with our own commitment
            self.check_tag(from, &msg.tag)?;
            let value = self.fresh_value(&msg.tag)?;
            out.extend(self.commit_with(msg.tag.clone(), msg.which, value, peers)?);
        }

        let roll = self
            .rolls
            .get_mut(&msg.tag)
            .ok_or_else(|| Error::violation(from, "roll vanished"))?;
        if roll.entries.contains_key(from) {
            warn!(peer = %from, tag = %msg.tag.short(), "duplicate commit");
            return Err(Error::DuplicateCommit {
                peer: from.clone(),
                tag: msg.tag.to_string(),
            });
        }
        if msg.which != roll.which {
            return Err(Error::violation(
                from,
                format!("wrong die: expected {} got {}", roll.which, msg.which),
            ));
        }

        debug!(peer = %from, tag = %msg.tag.short(), "commit");
        roll.entries.insert(
            from.clone(),
            Contribution {
                hash: msg.hash,
                value: None,
            },
        );

        out.extend(self.advance(&msg.tag, peers)?);
        Ok(out)
    }

    /// A peer's reveal
    pub fn on_reveal(
        &mut self,
        from: &PeerId,
        msg: RevealMessage,
        peers: &[PeerId],
    ) -> Result<Vec<RollOutput>> {
        if !peers.contains(from) {
            return Err(Error::UnknownPeer(from.clone()));
        }
        if self.finished.contains(&msg.tag) {
            warn!(peer = %from, tag = %msg.tag.short(), "reveal for finalized roll");
            return Err(Error::DuplicateReveal {
                peer: from.clone(),
                tag: msg.tag.to_string(),
            });
        }
        let entry = self
            .rolls
            .get(&msg.tag)
            .ok_or_else(|| Error::violation(from, format!("reveal for unknown roll {}", msg.tag.short())))?
            .entries
            .get(from)
            .ok_or_else(|| Error::violation(from, "reveal without commit"))?;
        if entry.value.is_some() {
            warn!(peer = %from, tag = %msg.tag.short(), "duplicate reveal");
            return Err(Error::DuplicateReveal {
                peer: from.clone(),
                tag: msg.tag.to_string(),
            });
        }

        // a value too wide to encode cannot match any commitment
        let matches = commitment(&msg.value)
            .map(|h| h == entry.hash)
            .unwrap_or(false);
        if !matches {
            warn!(peer = %from, tag = %msg.tag.short(), "hash cheat");
            return Err(Error::CommitmentMismatch {
                peer: from.clone(),
                tag: msg.tag.to_string(),
            });
        }
        self.check_value(from, &msg.tag, &msg.value)?;

        debug!(peer = %from, tag = %msg.tag.short(), "reveal");
        if let Some(entry) = self
            .rolls
            .get_mut(&msg.tag)
            .and_then(|r| r.entries.get_mut(from))
        {
            entry.value = Some(msg.value);
        }
        self.advance(&msg.tag, peers)
    }

    /// Reveal once everyone committed, finalize once everyone revealed
    fn advance(&mut self, tag: &RollTag, peers: &[PeerId]) -> Result<Vec<RollOutput>> {
        let Some(roll) = self.rolls.get_mut(tag) else {
            return Ok(Vec::new());
        };
        if !peers.iter().all(|p| roll.entries.contains_key(p)) {
            return Ok(Vec::new());
        }

        let mut out = Vec::new();
        if !roll.revealed {
            let value = roll
                .entries
                .get(&self.local_id)
                .and_then(|c| c.value.clone())
                .ok_or_else(|| Error::violation(&self.local_id, "no local value to reveal"))?;
            roll.revealed = true;
            out.push(RollOutput::Reveal(RevealMessage {
                tag: tag.clone(),
                which: roll.which,
                value,
            }));
        }

        let revealed = peers
            .iter()
            .chain(std::iter::once(&self.local_id))
            .all(|p| roll.entries.get(p).map_or(false, |c| c.value.is_some()));
        if !revealed {
            return Ok(out);
        }

        let die: Die = roll
            .dice
            .get(roll.which)
            .cloned()
            .ok_or_else(|| Error::InvalidConfig(format!("no die at index {}", roll.which)))?;
        let which = roll.which;
        let values = peers
            .iter()
            .chain(std::iter::once(&self.local_id))
            .filter_map(|p| roll.entries.get(p).and_then(|c| c.value.as_ref()));
        let face = finalize(tag.as_int(), values, die.sides, &self.modulus)?;
        self.rolls.remove(tag);
        self.mark_finished(tag.clone());

        info!(tag = %tag.short(), die = %die.name, face, "roll finalized");
        out.push(RollOutput::Finalized(RollResult {
            tag: tag.clone(),
            which,
            die,
            face,
        }));
        Ok(out)
    }
}
