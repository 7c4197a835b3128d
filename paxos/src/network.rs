//! The interface to the network carrying [`PaxosMsg`]s between the nodes of a group.

use crate::message::PaxosMsg;
use crate::NodeId;

/// Hands messages to the network.
///
/// Both methods must return without waiting for delivery. Delivery is best effort: messages may be lost, duplicated
/// or reordered, and a failure to enqueue is simply treated as a loss.
pub trait Transport {
    /// Sends `message` to the node `to`.
    fn send(&mut self, to: NodeId, message: PaxosMsg);

    /// Sends `message` to every other node of the group.
    fn broadcast(&mut self, message: PaxosMsg);
}
