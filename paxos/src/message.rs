//! Paxos message types for sending between nodes.
//!
//! This module provides the single envelope type exchanged by proposers, acceptors and learners, [`PaxosMsg`], along
//! with [`SendableMessage`] which pairs a message with its destination. Protobuf-based serialization of
//! [`PaxosMsg`] is provided through the `prost` crate. The transport is free to frame it however it likes.

use core::fmt;

use bytes::Bytes;

use crate::ballot::BallotNumber;
use crate::{InstanceId, NodeId};

/// A [`PaxosMsg`] to be sent to a destination.
#[derive(Clone, Debug, PartialEq)]
pub struct SendableMessage {
    /// The message to be sent.
    pub message: PaxosMsg,

    /// The destination for the message.
    pub dest: MessageDestination,
}

/// The destination for a [`SendableMessage`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MessageDestination {
    /// The associated message should be sent to every node of the group. [`RunSelf`] controls when the
    /// local node processes it too.
    Broadcast(RunSelf),
    /// The associated message should be sent to one particular node, possibly the local one.
    To(NodeId),
}

/// When a broadcast message is processed by the node broadcasting it.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RunSelf {
    /// Process locally before handing the message to the transport.
    First,
    /// Hand the message to the transport, then process it locally.
    Final,
}

/// The kind of a [`PaxosMsg`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum MsgType {
    /// Never sent. This is what an undecodable type tag maps to.
    Unknown = 0,
    /// Phase 1a: a proposer asks acceptors to promise a ballot.
    Prepare = 1,
    /// Phase 1b: an acceptor's promise or rejection.
    PrepareReply = 2,
    /// Phase 2a: a proposer asks acceptors to accept a value at a ballot.
    Accept = 3,
    /// Phase 2b: an acceptor's acceptance or rejection.
    AcceptReply = 4,
    /// A proposer announcing that a majority accepted its ballot.
    ProposerSendSuccess = 5,
}

/// A message sent between Paxos nodes of one group.
///
/// Which fields are meaningful depends on [`msg_type`](Self::msg_type):
///
/// | type                  | fields                                                             |
/// |-----------------------|--------------------------------------------------------------------|
/// | `Prepare`             | `instance_id`, `node_id`, `proposal_id`                            |
/// | `PrepareReply`        | as above, plus `pre_accept_*` and `value`, or `reject_by_promise_id` |
/// | `Accept`              | `instance_id`, `node_id`, `proposal_id`, `value`, `last_checksum`  |
/// | `AcceptReply`         | `instance_id`, `node_id`, `proposal_id`, `reject_by_promise_id`    |
/// | `ProposerSendSuccess` | `instance_id`, `node_id`, `proposal_id`                            |
///
/// A `reject_by_promise_id` of zero means the reply is not a rejection.
#[derive(Clone, PartialEq, prost::Message)]
pub struct PaxosMsg {
    #[prost(enumeration = "MsgType", tag = "1")]
    pub msg_type: i32,

    /// The instance the sender was working on.
    #[prost(uint64, tag = "2")]
    pub instance_id: u64,

    /// The ID of the sending node.
    #[prost(uint64, tag = "3")]
    pub node_id: u64,

    /// The proposal ID of the request, echoed back unchanged in replies.
    #[prost(uint64, tag = "4")]
    pub proposal_id: u64,

    /// The proposal ID of the ballot the replying acceptor previously accepted, if any.
    #[prost(uint64, tag = "5")]
    pub pre_accept_id: u64,

    /// The node ID of the ballot the replying acceptor previously accepted, if any.
    #[prost(uint64, tag = "6")]
    pub pre_accept_node_id: u64,

    /// The proposal ID promised by a rejecting acceptor, or zero.
    #[prost(uint64, tag = "7")]
    pub reject_by_promise_id: u64,

    #[prost(bytes = "bytes", tag = "8")]
    pub value: Bytes,

    /// The sender's checksum of the previous instance.
    #[prost(uint32, tag = "9")]
    pub last_checksum: u32,
}

//
// PaxosMsg impls
//

impl PaxosMsg {
    /// Constructs an otherwise empty message of the given type.
    pub fn new(msg_type: MsgType, instance_id: InstanceId, node_id: NodeId) -> Self {
        let mut message = Self {
            instance_id,
            node_id,
            ..Default::default()
        };
        message.set_msg_type(msg_type);
        message
    }

    /// Returns the ballot this message proposes: its proposal ID issued by its sender.
    pub fn ballot(&self) -> BallotNumber {
        BallotNumber::new(self.proposal_id, self.node_id)
    }

    /// Returns the previously accepted ballot reported in a prepare reply.
    pub fn pre_accept_ballot(&self) -> BallotNumber {
        BallotNumber::new(self.pre_accept_id, self.pre_accept_node_id)
    }

    /// Returns whether this reply is a rejection.
    pub fn is_reject(&self) -> bool {
        self.reject_by_promise_id != 0
    }
}

impl fmt::Display for PaxosMsg {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = fmt.debug_struct(&format!("{:?}", self.msg_type()));
        debug
            .field("instance_id", &self.instance_id)
            .field("node_id", &self.node_id)
            .field("proposal_id", &self.proposal_id);
        match self.msg_type() {
            MsgType::PrepareReply if !self.is_reject() => {
                debug.field("pre_accept", &format_args!("{}", self.pre_accept_ballot()));
            }
            MsgType::Accept => {
                debug.field("last_checksum", &self.last_checksum);
            }
            _ => (),
        }
        if self.is_reject() {
            debug.field("reject_by_promise_id", &self.reject_by_promise_id);
        }
        if !self.value.is_empty() {
            debug.field("value_len", &self.value.len());
        }
        debug.finish()
    }
}
