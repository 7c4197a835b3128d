//! State and helpers shared by the proposer, acceptor and learner roles of one node.

use std::cell::Cell;
use std::collections::VecDeque;
use std::fmt;
use std::rc::Rc;

use crate::message::{MessageDestination, MsgType, PaxosMsg, RunSelf, SendableMessage};
use crate::observer::{Event, Observer};
use crate::{InstanceId, NodeId};

/// A handle to the instance a node is currently working on.
///
/// Clones share the same underlying counter, so every role of a node observes an instance change at once.
#[derive(Clone, Default)]
pub struct InstanceTracker {
    inner: Rc<TrackerState>,
}

#[derive(Default)]
struct TrackerState {
    instance_id: Cell<InstanceId>,
    last_checksum: Cell<u32>,
}

/// The common part of every role: the local node's identity, its [`InstanceTracker`] and its [`Observer`].
#[derive(Clone)]
pub struct Base {
    node_id: NodeId,
    tracker: InstanceTracker,
    observer: Rc<dyn Observer>,
}

/// Implemented by each role of a node.
pub trait Participant {
    fn base(&self) -> &Base;

    fn instance_id(&self) -> InstanceId {
        self.base().instance_id()
    }

    fn node_id(&self) -> NodeId {
        self.base().node_id()
    }

    /// Returns an empty message of the given type stamped with the current instance and the local node.
    fn pack(&self, msg_type: MsgType) -> PaxosMsg {
        self.base().pack(msg_type)
    }
}

//
// InstanceTracker impls
//

impl InstanceTracker {
    pub fn new(instance_id: InstanceId, last_checksum: u32) -> Self {
        let tracker = Self::default();
        tracker.set(instance_id, last_checksum);
        tracker
    }

    pub fn instance_id(&self) -> InstanceId {
        self.inner.instance_id.get()
    }

    /// Returns the checksum of the instance preceding the current one, or zero if unknown.
    pub fn last_checksum(&self) -> u32 {
        self.inner.last_checksum.get()
    }

    pub fn set(&self, instance_id: InstanceId, last_checksum: u32) {
        self.inner.instance_id.set(instance_id);
        self.inner.last_checksum.set(last_checksum);
    }

    /// Moves on to the next instance, chaining from the checksum of the one just finished.
    pub fn advance(&self, last_checksum: u32) {
        self.set(self.instance_id() + 1, last_checksum);
    }
}

impl fmt::Debug for InstanceTracker {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("InstanceTracker")
            .field("instance_id", &self.instance_id())
            .field("last_checksum", &self.last_checksum())
            .finish()
    }
}

//
// Base impls
//

impl Base {
    pub fn new(node_id: NodeId, tracker: InstanceTracker, observer: Rc<dyn Observer>) -> Self {
        Self {
            node_id,
            tracker,
            observer,
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn instance_id(&self) -> InstanceId {
        self.tracker.instance_id()
    }

    pub fn last_checksum(&self) -> u32 {
        self.tracker.last_checksum()
    }

    pub fn tracker(&self) -> &InstanceTracker {
        &self.tracker
    }

    pub fn pack(&self, msg_type: MsgType) -> PaxosMsg {
        PaxosMsg::new(msg_type, self.instance_id(), self.node_id)
    }

    pub fn broadcast(&self, outbox: &mut VecDeque<SendableMessage>, message: PaxosMsg, run_self: RunSelf) {
        outbox.push_back(SendableMessage {
            message,
            dest: MessageDestination::Broadcast(run_self),
        });
    }

    pub fn observe(&self, event: Event) {
        self.observer.record(event);
    }
}

impl Participant for Base {
    fn base(&self) -> &Base {
        self
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::observer::NoopObserver;

    #[test]
    fn tracker_clones_share_state() {
        let tracker = InstanceTracker::new(3, 77);
        let base = Base::new(2, tracker.clone(), Rc::new(NoopObserver));

        tracker.advance(1234);
        assert_eq!(base.instance_id(), 4);
        assert_eq!(base.last_checksum(), 1234);

        let message = base.pack(MsgType::Prepare);
        assert_eq!(message.instance_id, 4);
        assert_eq!(message.node_id, 2);
        assert_eq!(message.msg_type(), MsgType::Prepare);
    }
}
