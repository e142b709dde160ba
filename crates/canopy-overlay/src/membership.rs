//! Membership store - a node's view of its own position in the tree.
//!
//! Holds the child slot table, the candidate set and one deferred-request
//! queue per slot, and enforces the fan-out invariant:
//!
//! ```text
//! children_count + candidate_count <= max_degree
//! ```
//!
//! Every mutating operation either succeeds completely or returns an error
//! without touching the store.

use std::collections::{HashMap, VecDeque};

use tracing::{debug, warn};

use crate::channel::Channel;
use crate::error::{Error, Result};
use crate::types::{JoinRequest, NodeId};

/// Slot table, candidate set and deferred requests of one node.
#[derive(Debug)]
pub struct Membership {
    max_degree: usize,
    children: Vec<Option<Channel>>,
    children_count: usize,
    candidates: HashMap<NodeId, Channel>,
    deferred: Vec<VecDeque<JoinRequest>>,
}

impl Membership {
    /// Create an empty store with `max_degree` slots.
    pub fn new(max_degree: usize) -> Self {
        Self {
            max_degree,
            children: vec![None; max_degree],
            children_count: 0,
            candidates: HashMap::new(),
            deferred: (0..max_degree).map(|_| VecDeque::new()).collect(),
        }
    }

    /// Configured fan-out bound.
    pub fn max_degree(&self) -> usize {
        self.max_degree
    }

    /// Number of occupied child slots.
    pub fn children_count(&self) -> usize {
        self.children_count
    }

    /// Number of in-progress candidate attempts.
    pub fn candidate_count(&self) -> usize {
        self.candidates.len()
    }

    /// Whether one more candidate fits under the fan-out bound.
    pub fn has_capacity(&self) -> bool {
        self.children_count + self.candidates.len() < self.max_degree
    }

    /// Occupant of `slot`, if any.
    pub fn child(&self, slot: usize) -> Option<&Channel> {
        self.children.get(slot).and_then(Option::as_ref)
    }

    /// Occupied slots in index order.
    pub fn children(&self) -> impl Iterator<Item = (usize, &Channel)> {
        self.children
            .iter()
            .enumerate()
            .filter_map(|(slot, child)| child.as_ref().map(|c| (slot, c)))
    }

    /// Slot occupied by the child whose remote identifier is `id`.
    pub fn child_slot_of(&self, id: &NodeId) -> Option<usize> {
        self.children()
            .find(|(_, c)| c.peer().as_ref() == Some(id))
            .map(|(slot, _)| slot)
    }

    /// Candidate registered for `id`.
    pub fn candidate(&self, id: &NodeId) -> Option<&Channel> {
        self.candidates.get(id)
    }

    /// All candidates.
    pub fn candidates(&self) -> impl Iterator<Item = &Channel> {
        self.candidates.values()
    }

    /// Promote `channel` into the first free slot.
    ///
    /// If `channel` is the registered candidate for its identifier, it leaves
    /// the candidate set in the same step. Fails if every slot is occupied,
    /// which callers rule out by admitting candidates only while
    /// [`has_capacity`](Self::has_capacity).
    pub fn add_child(&mut self, channel: Channel) -> Result<usize> {
        let slot = self
            .children
            .iter()
            .position(Option::is_none)
            .ok_or_else(|| {
                Error::Invariant(format!(
                    "no free slot for channel {} ({} children, max degree {})",
                    channel.id(),
                    self.children_count,
                    self.max_degree
                ))
            })?;

        let promoted = channel
            .peer()
            .filter(|peer| self.candidates.get(peer) == Some(&channel));
        if promoted.is_none() && !self.has_capacity() {
            return Err(Error::Invariant(format!(
                "channel {} is not a candidate and the node is full",
                channel.id()
            )));
        }

        if let Some(peer) = promoted {
            self.candidates.remove(&peer);
        }
        debug!(slot, channel = %channel.id(), peer = ?channel.peer(), "child added");
        self.children[slot] = Some(channel);
        self.children_count += 1;
        Ok(slot)
    }

    /// Clear the slot holding `channel`, returning its index.
    pub fn remove_child(&mut self, channel: &Channel) -> Option<usize> {
        let slot = self
            .children
            .iter()
            .position(|c| c.as_ref() == Some(channel))?;
        self.children[slot] = None;
        self.children_count -= 1;
        debug!(slot, channel = %channel.id(), "child removed");
        Some(slot)
    }

    /// Register an in-progress attempt keyed by its remote identifier.
    ///
    /// Re-adding the same channel is a no-op. Registering a different channel
    /// under an identifier already present means two attempts for one origin
    /// were started, which is a routing bug.
    pub fn add_candidate(&mut self, channel: Channel) -> Result<()> {
        let id = channel.peer().ok_or_else(|| {
            Error::Invariant(format!("parent channel {} offered as candidate", channel.id()))
        })?;

        if let Some(existing) = self.candidates.get(&id) {
            if *existing == channel {
                warn!(origin = %id, "re-adding the same candidate");
                return Ok(());
            }
            return Err(Error::Invariant(format!(
                "candidate {} already registered on channel {}, refusing channel {}",
                id,
                existing.id(),
                channel.id()
            )));
        }

        if !self.has_capacity() {
            return Err(Error::Invariant(format!(
                "candidate {} exceeds max degree {}",
                id, self.max_degree
            )));
        }

        debug!(origin = %id, channel = %channel.id(), "candidate added");
        self.candidates.insert(id, channel);
        Ok(())
    }

    /// Drop the candidate for `id`. Absence is not an error.
    pub fn remove_candidate(&mut self, id: &NodeId) -> Option<Channel> {
        let removed = self.candidates.remove(id);
        match &removed {
            Some(channel) => debug!(origin = %id, channel = %channel.id(), "candidate removed"),
            None => debug!(origin = %id, "candidate not found, it may have been removed already"),
        }
        removed
    }

    /// Queue `req` until a child fills `slot`.
    pub fn defer(&mut self, slot: usize, req: JoinRequest) -> Result<()> {
        let queue = self.deferred.get_mut(slot).ok_or_else(|| {
            Error::Invariant(format!("slot {slot} out of range (max degree {})", self.max_degree))
        })?;
        queue.push_back(req);
        Ok(())
    }

    /// Take every request deferred on `slot`, oldest first.
    pub fn take_deferred(&mut self, slot: usize) -> VecDeque<JoinRequest> {
        self.deferred
            .get_mut(slot)
            .map(std::mem::take)
            .unwrap_or_default()
    }

    /// Requests waiting on `slot`.
    #[cfg(test)]
    pub(crate) fn deferred(&self, slot: usize) -> impl Iterator<Item = &JoinRequest> {
        self.deferred.get(slot).into_iter().flatten()
    }

    /// Total deferred requests across all slots.
    pub fn deferred_len(&self) -> usize {
        self.deferred.iter().map(VecDeque::len).sum()
    }

    /// Empty every collection, returning the channels that were held.
    ///
    /// Deferred requests are dropped.
    pub fn clear(&mut self) -> Vec<Channel> {
        let mut held: Vec<Channel> = self.children.iter_mut().filter_map(Option::take).collect();
        held.extend(self.candidates.drain().map(|(_, c)| c));
        self.children_count = 0;
        self.deferred.iter_mut().for_each(VecDeque::clear);
        held
    }

    /// Check the store's invariants. Used by tests and debug assertions.
    pub fn check_invariants(&self) -> Result<()> {
        let occupied = self.children.iter().filter(|c| c.is_some()).count();
        if occupied != self.children_count {
            return Err(Error::Invariant(format!(
                "children_count {} but {} slots occupied",
                self.children_count, occupied
            )));
        }
        if self.children_count + self.candidates.len() > self.max_degree {
            return Err(Error::Invariant(format!(
                "{} children + {} candidates exceed max degree {}",
                self.children_count,
                self.candidates.len(),
                self.max_degree
            )));
        }
        for (slot, child) in self.children() {
            if self.children().any(|(other, c)| other != slot && c == child) {
                return Err(Error::Invariant(format!(
                    "channel {} occupies several slots",
                    child.id()
                )));
            }
            if let Some(peer) = child.peer() {
                if self.candidates.contains_key(&peer) {
                    return Err(Error::Invariant(format!(
                        "{peer} is both a child and a candidate"
                    )));
                }
            }
        }
        Ok(())
    }
}
