//! Ballot numbers used to order competing proposals.

use core::cmp::Ordering;
use core::fmt;

use crate::NodeId;

/// A totally ordered identifier for a proposal round.
///
/// Ballots compare by [`proposal_id`](Self::proposal_id) first and break ties by [`node_id`](Self::node_id), so two
/// proposers using the same counter still produce distinct, ordered ballots. A ballot with a zero `proposal_id` is
/// null and stands for "no ballot".
#[derive(Clone, Copy, Debug, Default, Hash)]
pub struct BallotNumber {
    /// The proposer-local, monotonically increasing proposal counter.
    pub proposal_id: u64,

    /// The ID of the node which issued the proposal.
    pub node_id: NodeId,
}

impl BallotNumber {
    /// The null ballot.
    pub const NULL: Self = Self {
        proposal_id: 0,
        node_id: 0,
    };

    pub const fn new(proposal_id: u64, node_id: NodeId) -> Self {
        Self {
            proposal_id,
            node_id,
        }
    }

    /// Returns whether this ballot is null, i.e. carries no proposal.
    pub fn is_null(&self) -> bool {
        self.proposal_id == 0
    }

    /// Replaces this ballot with the null ballot.
    pub fn reset(&mut self) {
        *self = Self::NULL;
    }
}

impl fmt::Display for BallotNumber {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Self {
            proposal_id,
            node_id,
        } = self;
        fmt.debug_tuple("Ballot")
            .field(proposal_id)
            .field(node_id)
            .finish()
    }
}

impl PartialEq for BallotNumber {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for BallotNumber {}

impl PartialOrd for BallotNumber {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for BallotNumber {
    fn cmp(&self, other: &Self) -> Ordering {
        self.proposal_id
            .cmp(&other.proposal_id)
            .then_with(|| self.node_id.cmp(&other.node_id))
    }
}
