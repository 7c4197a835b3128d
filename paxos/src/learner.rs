//! The learner role, and the interface through which chosen values leave the core.

use std::collections::VecDeque;

use bytes::Bytes;

use crate::acceptor::AcceptorState;
use crate::base::{Base, Participant};
use crate::message::{MsgType, PaxosMsg, RunSelf, SendableMessage};
use crate::InstanceId;

/// A value chosen by a majority of acceptors, as seen by the proposer which drove it.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Chosen {
    pub instance_id: InstanceId,
    pub proposal_id: u64,
    pub value: Bytes,
}

/// Receives chosen and learned values from an [`Instance`](crate::instance::Instance).
pub trait Learner {
    /// Called on the proposing node once a majority accepted its proposal.
    fn on_instance_chosen(&mut self, chosen: &Chosen);

    /// Called on every node which learned the value of its current instance, just before it moves on to the next
    /// instance. This is where the value should be executed.
    fn on_value_learned(&mut self, _instance_id: InstanceId, _value: &Bytes) {}
}

/// Announces chosen ballots and recognizes announcements matching what the local acceptor accepted.
pub struct LearnerRole {
    base: Base,
}

impl LearnerRole {
    pub fn new(base: Base) -> Self {
        Self { base }
    }

    /// Tells every node, including this one, that `chosen` reached a majority.
    pub fn proposer_send_success(&self, outbox: &mut VecDeque<SendableMessage>, chosen: &Chosen) {
        let mut msg = self.pack(MsgType::ProposerSendSuccess);
        msg.instance_id = chosen.instance_id;
        msg.proposal_id = chosen.proposal_id;
        self.base.broadcast(outbox, msg, RunSelf::First);
    }

    /// Returns the learned value if `msg` announces the ballot the local acceptor accepted in the current instance.
    pub fn on_proposer_send_success(&self, msg: &PaxosMsg, accepted: &AcceptorState) -> Option<Bytes> {
        if msg.instance_id != self.instance_id() {
            log::debug!(
                "ignoring success for instance {} at instance {}",
                msg.instance_id,
                self.instance_id()
            );
            return None;
        }

        if accepted.accepted.is_null() || accepted.accepted != msg.ballot() {
            verbose!(
                "success for {} does not match accepted {}",
                msg.ballot(),
                accepted.accepted
            );
            return None;
        }

        Some(accepted.accepted_value.clone())
    }
}

impl Participant for LearnerRole {
    fn base(&self) -> &Base {
        &self.base
    }
}
