//! Vote tallying for one proposer phase.

use std::collections::BTreeSet;

use crate::NodeId;

/// Tallies the replies a proposer collects during one prepare or accept round.
///
/// Only the first answer from each node counts: a node which already promised cannot later be counted as rejecting
/// in the same round, and vice versa.
#[derive(Clone, Debug, Default)]
pub struct MsgCounter {
    node_count: usize,
    received: BTreeSet<NodeId>,
    promised_or_accepted: BTreeSet<NodeId>,
    rejected: BTreeSet<NodeId>,
}

impl MsgCounter {
    pub fn new(node_count: usize) -> Self {
        Self {
            node_count,
            ..Self::default()
        }
    }

    /// Forgets every reply of the previous round.
    pub fn start_new_round(&mut self) {
        self.received.clear();
        self.promised_or_accepted.clear();
        self.rejected.clear();
    }

    pub fn add_receive(&mut self, node_id: NodeId) {
        self.received.insert(node_id);
    }

    pub fn add_promise_or_accept(&mut self, node_id: NodeId) {
        if !self.rejected.contains(&node_id) {
            self.promised_or_accepted.insert(node_id);
        }
    }

    pub fn add_reject(&mut self, node_id: NodeId) {
        if !self.promised_or_accepted.contains(&node_id) {
            self.rejected.insert(node_id);
        }
    }

    /// Returns whether a strict majority promised or accepted.
    pub fn is_passed(&self) -> bool {
        self.promised_or_accepted.len() > self.node_count / 2
    }

    /// Returns whether a strict majority rejected.
    pub fn is_rejected(&self) -> bool {
        self.rejected.len() > self.node_count / 2
    }

    /// Returns whether every node of the group has replied.
    pub fn is_all_received(&self) -> bool {
        self.received.len() == self.node_count
    }

    pub fn node_count(&self) -> usize {
        self.node_count
    }
}
