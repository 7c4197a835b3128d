//! Higher-level API for one node of one Paxos group.

use std::collections::{BTreeSet, VecDeque};
use std::rc::Rc;

use bytes::Bytes;
use rand_core::RngCore;

use crate::acceptor::{Acceptor, AcceptorState};
use crate::base::{Base, InstanceTracker};
use crate::learner::{Chosen, Learner, LearnerRole};
use crate::message::{MessageDestination, MsgType, PaxosMsg, RunSelf, SendableMessage};
use crate::network::Transport;
use crate::observer::{Event, NoopObserver, Observer};
use crate::proposer::{Proposer, ProposerContext};
use crate::storage::Storage;
use crate::timer::{Timeout, TimeoutKind, Timer};
use crate::{InstanceId, NodeId};

/// One node of a Paxos group, agreeing with its peers on one value per instance, instance after instance.
///
/// An [`Instance`] bundles the proposer, acceptor and learner roles of the node and routes messages between them and
/// the [`Transport`]. It performs no I/O of its own and never reads a clock: every entry point takes the current time
/// in milliseconds, and the caller is expected to call [`process_timeouts`] no later than [`next_timeout`] says.
///
/// # Proposing values
///
/// A value passed to [`new_value`] is not guaranteed to be chosen. The proposer may adopt a value some other node
/// already got accepted, in which case that value is chosen for the current instance instead. Callers should watch
/// [`Learner::on_value_learned`] and propose again in a later instance if their value did not make it. Only one
/// value should be proposed at a time, i.e. while [`is_proposing`] returns `false`.
///
/// # Message delivery
///
/// Messages may be lost, duplicated or reordered by the [`Transport`]. Lost messages are recovered from by timeouts.
///
/// [`is_proposing`]: Self::is_proposing
/// [`new_value`]: Self::new_value
/// [`next_timeout`]: Self::next_timeout
/// [`process_timeouts`]: Self::process_timeouts
pub struct Instance<S, T, L, R> {
    node_id: NodeId,
    nodes: BTreeSet<NodeId>,
    tracker: InstanceTracker,
    observer: Rc<dyn Observer>,
    acceptor: Acceptor<S>,
    proposer: Proposer,
    learner_role: LearnerRole,
    learner: L,
    transport: T,
    random: R,
    timer: Timer<Timeout>,
    outbox: VecDeque<SendableMessage>,
}

/// Configurable parameters of a Paxos node.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Config {
    /// The lowest proposal ID this node will use.
    pub start_proposal_id: u64,

    /// The initial timeout of a prepare round which gets no conclusive answer.
    pub prepare_timeout_ms: u64,

    /// The ceiling for the doubling prepare timeout.
    pub max_prepare_timeout_ms: u64,

    /// The initial timeout of an accept round which gets no conclusive answer.
    pub accept_timeout_ms: u64,

    /// The ceiling for the doubling accept timeout.
    pub max_accept_timeout_ms: u64,

    /// The lower bound of the random delay before retrying a rejected round.
    pub retry_delay_min_ms: u64,

    /// The exclusive upper bound of the random delay before retrying a rejected round.
    pub retry_delay_max_ms: u64,

    /// Whether acceptor writes are ever synced to durable media.
    pub log_sync: bool,

    /// The number of unsynced acceptor writes between two synced ones.
    pub sync_interval: u32,

    /// Whether the local acceptor handles an accept request before it is sent to the other nodes.
    pub run_self_first_on_accept: bool,
}

//
// Config impls
//

impl Config {
    pub const DEFAULT: Self = Self {
        start_proposal_id: 1,
        prepare_timeout_ms: 1000,
        max_prepare_timeout_ms: 8000,
        accept_timeout_ms: 1000,
        max_accept_timeout_ms: 8000,
        retry_delay_min_ms: 10,
        retry_delay_max_ms: 40,
        log_sync: true,
        sync_interval: 0,
        run_self_first_on_accept: false,
    };
}

impl Default for Config {
    fn default() -> Self {
        Self::DEFAULT
    }
}

//
// Instance impls
//

impl<S, T, L, R> Instance<S, T, L, R>
where
    S: Storage,
    T: Transport,
    L: Learner,
    R: RngCore,
{
    /// Constructs a node of the group `nodes`, resuming from whatever `storage` holds.
    ///
    /// # Errors
    ///
    /// If the persisted acceptor state could not be read, the storage error is returned.
    pub fn new(
        node_id: NodeId,
        nodes: BTreeSet<NodeId>,
        storage: S,
        transport: T,
        learner: L,
        random: R,
        config: Config,
    ) -> Result<Self, S::Error> {
        Self::with_observer(
            node_id,
            nodes,
            storage,
            transport,
            learner,
            random,
            config,
            Rc::new(NoopObserver),
        )
    }

    /// Like [`new`](Self::new), reporting protocol events to `observer`.
    #[allow(clippy::too_many_arguments)]
    pub fn with_observer(
        node_id: NodeId,
        nodes: BTreeSet<NodeId>,
        storage: S,
        transport: T,
        learner: L,
        random: R,
        config: Config,
        observer: Rc<dyn Observer>,
    ) -> Result<Self, S::Error> {
        if !nodes.contains(&node_id) {
            log::warn!("node {} is not a member of {:?}", node_id, nodes);
        }

        let tracker = InstanceTracker::default();
        let base = Base::new(node_id, tracker.clone(), Rc::clone(&observer));

        let mut acceptor = Acceptor::new(base.clone(), storage, config.log_sync, config.sync_interval);
        acceptor.init()?;

        let mut proposer = Proposer::new(base.clone(), nodes.len(), &config);
        let start_proposal_id = config
            .start_proposal_id
            .max(acceptor.state().promised.proposal_id + 1);
        proposer.set_start_proposal_id(start_proposal_id);

        log::info!(
            "node {} starting at instance {} with proposal {}",
            node_id,
            tracker.instance_id(),
            start_proposal_id
        );

        Ok(Self {
            node_id,
            nodes,
            tracker,
            observer,
            acceptor,
            proposer,
            learner_role: LearnerRole::new(base),
            learner,
            transport,
            random,
            timer: Timer::new(),
            outbox: VecDeque::new(),
        })
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn nodes(&self) -> &BTreeSet<NodeId> {
        &self.nodes
    }

    /// Returns the ID of the instance this node is working on.
    pub fn instance_id(&self) -> InstanceId {
        self.tracker.instance_id()
    }

    /// Returns the checksum of the last learned instance, or zero if unknown.
    pub fn last_checksum(&self) -> u32 {
        self.tracker.last_checksum()
    }

    /// Returns whether the local proposer is in the middle of a prepare or accept round.
    pub fn is_proposing(&self) -> bool {
        self.proposer.is_working()
    }

    pub fn proposer(&self) -> &Proposer {
        &self.proposer
    }

    pub fn acceptor_state(&self) -> &AcceptorState {
        self.acceptor.state()
    }

    pub fn storage(&self) -> &S {
        self.acceptor.storage()
    }

    pub fn storage_mut(&mut self) -> &mut S {
        self.acceptor.storage_mut()
    }

    pub fn learner(&self) -> &L {
        &self.learner
    }

    pub fn learner_mut(&mut self) -> &mut L {
        &mut self.learner
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Starts proposing `value` for the current instance.
    pub fn new_value(&mut self, value: Bytes, now: u64) {
        let mut ctx = ProposerContext {
            now,
            timer: &mut self.timer,
            random: &mut self.random,
            outbox: &mut self.outbox,
        };
        self.proposer.new_value(&mut ctx, value);
        self.flush(now);
    }

    /// Processes a message received from the node `msg.node_id`.
    pub fn receive(&mut self, msg: PaxosMsg, now: u64) {
        self.route(msg, now);
        self.flush(now);
    }

    /// Fires every timer due at `now`.
    pub fn process_timeouts(&mut self, now: u64) {
        while let Some((_, timeout)) = self.timer.pop_timeout(now) {
            let mut ctx = ProposerContext {
                now,
                timer: &mut self.timer,
                random: &mut self.random,
                outbox: &mut self.outbox,
            };
            match timeout.kind {
                TimeoutKind::Prepare => self.proposer.on_prepare_timeout(&mut ctx, timeout.instance_id),
                TimeoutKind::Accept => self.proposer.on_accept_timeout(&mut ctx, timeout.instance_id),
            }
            self.flush(now);
        }
    }

    /// Returns the number of milliseconds until [`process_timeouts`](Self::process_timeouts) must be called next, or
    /// `None` if no timer is pending.
    pub fn next_timeout(&mut self, now: u64) -> Option<u64> {
        self.timer.next_timeout(now)
    }

    /// Delivers queued messages, handling those addressed to this node in-process.
    fn flush(&mut self, now: u64) {
        while let Some(SendableMessage { message, dest }) = self.outbox.pop_front() {
            match dest {
                MessageDestination::To(to) if to == self.node_id => self.route(message, now),
                MessageDestination::To(to) => self.transport.send(to, message),
                MessageDestination::Broadcast(RunSelf::First) => {
                    self.route(message.clone(), now);
                    self.transport.broadcast(message);
                }
                MessageDestination::Broadcast(RunSelf::Final) => {
                    self.transport.broadcast(message.clone());
                    self.route(message, now);
                }
            }
        }
    }

    fn route(&mut self, msg: PaxosMsg, now: u64) {
        if !self.nodes.contains(&msg.node_id) {
            log::warn!("dropping {} from unknown node {}", msg, msg.node_id);
            return;
        }

        match msg.msg_type() {
            MsgType::Prepare | MsgType::Accept => self.receive_for_acceptor(msg),
            MsgType::PrepareReply | MsgType::AcceptReply => self.receive_for_proposer(msg, now),
            MsgType::ProposerSendSuccess => self.receive_for_learner(msg),
            MsgType::Unknown => log::warn!("dropping message of unknown type from {}", msg.node_id),
        }
    }

    fn receive_for_acceptor(&mut self, msg: PaxosMsg) {
        let instance_id = self.tracker.instance_id();
        if msg.instance_id != instance_id {
            log::debug!("dropping {} at instance {}", msg, instance_id);
            return;
        }

        let result = if msg.msg_type() == MsgType::Prepare {
            self.acceptor.on_prepare(&msg)
        } else {
            let last_checksum = self.tracker.last_checksum();
            if msg.last_checksum != 0 && last_checksum != 0 && msg.last_checksum != last_checksum {
                log::warn!(
                    "dropping {}: checksum {:#010x} differs from ours {:#010x}",
                    msg,
                    msg.last_checksum,
                    last_checksum
                );
                self.observer.record(Event::ChecksumMismatch);
                return;
            }
            self.acceptor.on_accept(&msg)
        };

        match result {
            Ok(reply) => self.outbox.push_back(reply),
            Err(error) => log::debug!("not answering {}: {}", msg, error),
        }
    }

    fn receive_for_proposer(&mut self, msg: PaxosMsg, now: u64) {
        let instance_id = self.tracker.instance_id();
        if msg.instance_id == instance_id {
            let mut ctx = ProposerContext {
                now,
                timer: &mut self.timer,
                random: &mut self.random,
                outbox: &mut self.outbox,
            };
            if msg.msg_type() == MsgType::PrepareReply {
                self.proposer.on_prepare_reply(&mut ctx, &msg);
            } else if let Some(chosen) = self.proposer.on_accept_reply(&mut ctx, &msg) {
                self.on_chosen(chosen);
            }
        } else if msg.instance_id.checked_add(1) == Some(instance_id) {
            if msg.msg_type() == MsgType::PrepareReply {
                self.proposer.on_expired_prepare_reply(&msg);
            } else {
                self.proposer.on_expired_accept_reply(&msg);
            }
        } else {
            log::debug!("dropping {} at instance {}", msg, instance_id);
        }
    }

    fn receive_for_learner(&mut self, msg: PaxosMsg) {
        let value = match self
            .learner_role
            .on_proposer_send_success(&msg, self.acceptor.state())
        {
            Some(value) => value,
            None => return,
        };

        let instance_id = self.tracker.instance_id();
        log::info!(
            "learned instance {} from {} ({} bytes)",
            instance_id,
            msg.ballot(),
            value.len()
        );
        self.observer.record(Event::Learned { instance_id });
        self.learner.on_value_learned(instance_id, &value);
        self.new_instance();
    }

    fn on_chosen(&mut self, chosen: Chosen) {
        log::info!(
            "instance {} chosen with proposal {}",
            chosen.instance_id,
            chosen.proposal_id
        );
        self.learner.on_instance_chosen(&chosen);
        self.learner_role
            .proposer_send_success(&mut self.outbox, &chosen);
    }

    fn new_instance(&mut self) {
        let checksum = self.acceptor.state().checksum;
        self.tracker.advance(checksum);
        self.acceptor.init_for_new_instance();
        self.proposer.init_for_new_instance(&mut self.timer);
        log::debug!(
            "now at instance {} chained from {:#010x}",
            self.tracker.instance_id(),
            checksum
        );
    }
}
