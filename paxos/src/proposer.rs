//! The proposer role.
//!
//! A [`Proposer`] drives one value at a time through the two phases of the algorithm. Phase 1 ([`prepare`]) asks
//! every acceptor to promise a ballot and collects any value they accepted before. Phase 2 ([`accept`]) asks them to
//! accept the highest such value, or the proposer's own value if none was reported. Each phase has its own timer:
//! silence retries with exponentially growing timeouts, while an outright rejection or an inconclusive full set of
//! replies retries after a short random delay.
//!
//! [`accept`]: Proposer::accept
//! [`prepare`]: Proposer::prepare

use std::collections::VecDeque;

use bytes::Bytes;
use rand_core::RngCore;

use crate::ballot::BallotNumber;
use crate::base::{Base, Participant};
use crate::counter::MsgCounter;
use crate::instance::Config;
use crate::learner::Chosen;
use crate::message::{MsgType, PaxosMsg, RunSelf, SendableMessage};
use crate::observer::Event;
use crate::timer::{Timeout, TimeoutKind, Timer, TimerId};
use crate::InstanceId;

/// The proposer's scratch state for the current instance.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ProposerState {
    /// The proposal ID of the current or next ballot.
    pub proposal_id: u64,

    /// The highest proposal ID other nodes are known to have promised.
    pub highest_other_proposal_id: u64,

    /// The value to be proposed, either a client's or one adopted from a prepare reply.
    pub value: Option<Bytes>,

    /// The highest previously accepted ballot reported during the current prepare round.
    pub highest_other_pre_accept_ballot: BallotNumber,
}

/// The mutable surroundings a [`Proposer`] needs while handling an event.
pub struct ProposerContext<'a, R> {
    /// The current time in milliseconds.
    pub now: u64,
    pub timer: &'a mut Timer<Timeout>,
    pub random: &'a mut R,
    pub outbox: &'a mut VecDeque<SendableMessage>,
}

pub struct Proposer {
    base: Base,
    config: Config,
    state: ProposerState,
    counter: MsgCounter,

    is_preparing: bool,
    is_accepting: bool,
    prepare_timer: Option<TimerId>,
    accept_timer: Option<TimerId>,
    last_prepare_timeout_ms: u64,
    last_accept_timeout_ms: u64,
    phase_started_at: u64,

    can_skip_prepare: bool,
    was_rejected_by_someone: bool,
    ballot_carried_value: bool,
}

//
// ProposerState impls
//

impl ProposerState {
    pub fn new(start_proposal_id: u64) -> Self {
        Self {
            proposal_id: start_proposal_id,
            ..Self::default()
        }
    }

    /// Forgets everything but the proposal ID.
    pub fn init(&mut self) {
        self.highest_other_proposal_id = 0;
        self.value = None;
    }

    /// Moves to a proposal ID above every one seen so far.
    pub fn new_prepare(&mut self) {
        self.proposal_id = self.proposal_id.max(self.highest_other_proposal_id) + 1;
    }

    /// Adopts `value` if `ballot` is the highest previously accepted ballot reported so far.
    pub fn add_pre_accept_value(&mut self, ballot: BallotNumber, value: &Bytes) {
        if ballot.is_null() {
            return;
        }
        if ballot > self.highest_other_pre_accept_ballot {
            verbose!("adopting value of {} over {}", ballot, self.highest_other_pre_accept_ballot);
            self.highest_other_pre_accept_ballot = ballot;
            self.value = Some(value.clone());
        }
    }

    pub fn set_other_proposal_id(&mut self, other_proposal_id: u64) {
        if other_proposal_id > self.highest_other_proposal_id {
            self.highest_other_proposal_id = other_proposal_id;
        }
    }

    pub fn reset_highest_other_pre_accept_ballot(&mut self) {
        self.highest_other_pre_accept_ballot.reset();
    }
}

//
// Proposer impls
//

impl Proposer {
    pub fn new(base: Base, node_count: usize, config: &Config) -> Self {
        Self {
            base,
            state: ProposerState::new(config.start_proposal_id),
            counter: MsgCounter::new(node_count),
            is_preparing: false,
            is_accepting: false,
            prepare_timer: None,
            accept_timer: None,
            last_prepare_timeout_ms: config.prepare_timeout_ms,
            last_accept_timeout_ms: config.accept_timeout_ms,
            phase_started_at: 0,
            can_skip_prepare: false,
            was_rejected_by_someone: false,
            ballot_carried_value: false,
            config: config.clone(),
        }
    }

    pub fn set_start_proposal_id(&mut self, proposal_id: u64) {
        self.state.proposal_id = proposal_id;
    }

    pub fn state(&self) -> &ProposerState {
        &self.state
    }

    /// Returns whether a prepare or accept phase is in progress.
    pub fn is_working(&self) -> bool {
        self.is_preparing || self.is_accepting
    }

    pub fn is_preparing(&self) -> bool {
        self.is_preparing
    }

    pub fn is_accepting(&self) -> bool {
        self.is_accepting
    }

    pub fn can_skip_prepare(&self) -> bool {
        self.can_skip_prepare
    }

    pub fn was_rejected_by_someone(&self) -> bool {
        self.was_rejected_by_someone
    }

    /// Resets the proposer for the next instance. Skip-prepare eligibility and the rejection flag are kept.
    pub fn init_for_new_instance(&mut self, timer: &mut Timer<Timeout>) {
        self.counter.start_new_round();
        self.state.init();
        self.ballot_carried_value = false;
        self.exit_prepare(timer);
        self.exit_accept(timer);
    }

    pub fn cancel_skip_prepare(&mut self) {
        self.can_skip_prepare = false;
    }

    /// Starts proposing `value` in the current instance.
    ///
    /// A value already adopted or staged for this instance takes precedence over `value`.
    pub fn new_value<R: RngCore>(&mut self, ctx: &mut ProposerContext<'_, R>, value: Bytes) {
        self.base.observe(Event::NewProposal);
        if self.state.value.is_none() {
            self.state.value = Some(value);
        }

        self.last_prepare_timeout_ms = self.config.prepare_timeout_ms;
        self.last_accept_timeout_ms = self.config.accept_timeout_ms;

        if self.can_skip_prepare && !self.was_rejected_by_someone {
            log::debug!("skipping prepare with proposal {}", self.state.proposal_id);
            self.base.observe(Event::SkipPrepare);
            self.accept(ctx);
        } else {
            self.prepare(ctx, self.was_rejected_by_someone);
        }
    }

    /// Starts a prepare round, moving to a higher proposal ID if `need_new_ballot`.
    ///
    /// The proposal ID is also raised if an accept request was already sent with the current one, so that a ballot
    /// never carries two different values.
    pub fn prepare<R: RngCore>(&mut self, ctx: &mut ProposerContext<'_, R>, need_new_ballot: bool) {
        self.base.observe(Event::Prepare);
        self.phase_started_at = ctx.now;

        self.exit_accept(ctx.timer);
        self.is_preparing = true;
        self.can_skip_prepare = false;
        self.was_rejected_by_someone = false;

        self.state.reset_highest_other_pre_accept_ballot();
        if need_new_ballot || self.ballot_carried_value {
            self.state.new_prepare();
            self.ballot_carried_value = false;
        }
        log::info!(
            "prepare instance {} proposal {}",
            self.instance_id(),
            self.state.proposal_id
        );

        let mut msg = self.pack(MsgType::Prepare);
        msg.proposal_id = self.state.proposal_id;

        self.counter.start_new_round();
        self.add_timer(ctx, TimeoutKind::Prepare, None);
        self.base.broadcast(ctx.outbox, msg, RunSelf::First);
    }

    pub fn on_prepare_reply<R: RngCore>(&mut self, ctx: &mut ProposerContext<'_, R>, msg: &PaxosMsg) {
        verbose!("prepare reply {}", msg);
        if !self.is_preparing || msg.proposal_id != self.state.proposal_id {
            self.on_stale_reply(msg);
            return;
        }

        self.counter.add_receive(msg.node_id);
        if !msg.is_reject() {
            self.counter.add_promise_or_accept(msg.node_id);
            self.state.add_pre_accept_value(msg.pre_accept_ballot(), &msg.value);
        } else {
            self.counter.add_reject(msg.node_id);
            self.was_rejected_by_someone = true;
            self.state.set_other_proposal_id(msg.reject_by_promise_id);
        }

        if self.counter.is_passed() {
            let use_ms = ctx.now.saturating_sub(self.phase_started_at);
            log::info!("prepare passed after {}ms", use_ms);
            self.base.observe(Event::PreparePass { use_ms });
            self.can_skip_prepare = true;
            self.accept(ctx);
        } else if self.counter.is_rejected() || self.counter.is_all_received() {
            log::info!("prepare not passed, retrying shortly");
            self.base.observe(Event::PrepareNotPass);
            let delay_ms = self.retry_delay_ms(ctx.random);
            self.add_timer(ctx, TimeoutKind::Prepare, Some(delay_ms));
        }
    }

    /// Handles a prepare reply addressed to the previous instance.
    pub fn on_expired_prepare_reply(&mut self, msg: &PaxosMsg) {
        self.apply_reject_hint(msg);
    }

    /// Starts an accept round for the staged value.
    pub fn accept<R: RngCore>(&mut self, ctx: &mut ProposerContext<'_, R>) {
        self.base.observe(Event::Accept);
        self.phase_started_at = ctx.now;

        self.exit_prepare(ctx.timer);
        self.is_accepting = true;
        self.ballot_carried_value = true;

        let mut msg = self.pack(MsgType::Accept);
        msg.proposal_id = self.state.proposal_id;
        msg.value = self.state.value.clone().unwrap_or_default();
        msg.last_checksum = self.base.last_checksum();
        log::info!(
            "accept instance {} proposal {} with {} bytes",
            self.instance_id(),
            msg.proposal_id,
            msg.value.len()
        );

        self.counter.start_new_round();
        self.add_timer(ctx, TimeoutKind::Accept, None);

        let run_self = if self.config.run_self_first_on_accept {
            RunSelf::First
        } else {
            RunSelf::Final
        };
        self.base.broadcast(ctx.outbox, msg, run_self);
    }

    /// Handles an accept reply, returning the chosen value once a majority accepted it.
    pub fn on_accept_reply<R: RngCore>(
        &mut self,
        ctx: &mut ProposerContext<'_, R>,
        msg: &PaxosMsg,
    ) -> Option<Chosen> {
        verbose!("accept reply {}", msg);
        if !self.is_accepting || msg.proposal_id != self.state.proposal_id {
            self.on_stale_reply(msg);
            return None;
        }

        self.counter.add_receive(msg.node_id);
        if !msg.is_reject() {
            self.counter.add_promise_or_accept(msg.node_id);
        } else {
            self.counter.add_reject(msg.node_id);
            self.was_rejected_by_someone = true;
            self.state.set_other_proposal_id(msg.reject_by_promise_id);
        }

        if self.counter.is_passed() {
            let use_ms = ctx.now.saturating_sub(self.phase_started_at);
            log::info!("accept passed after {}ms", use_ms);
            self.base.observe(Event::AcceptPass { use_ms });
            self.exit_accept(ctx.timer);
            Some(Chosen {
                instance_id: self.instance_id(),
                proposal_id: self.state.proposal_id,
                value: self.state.value.clone().unwrap_or_default(),
            })
        } else {
            if self.counter.is_rejected() || self.counter.is_all_received() {
                log::info!("accept not passed, preparing again shortly");
                self.base.observe(Event::AcceptNotPass);
                let delay_ms = self.retry_delay_ms(ctx.random);
                self.add_timer(ctx, TimeoutKind::Accept, Some(delay_ms));
            }
            None
        }
    }

    /// Handles an accept reply addressed to the previous instance.
    pub fn on_expired_accept_reply(&mut self, msg: &PaxosMsg) {
        self.apply_reject_hint(msg);
    }

    /// Handles a fired prepare timer armed during `timeout_instance_id`.
    pub fn on_prepare_timeout<R: RngCore>(
        &mut self,
        ctx: &mut ProposerContext<'_, R>,
        timeout_instance_id: InstanceId,
    ) {
        if timeout_instance_id != self.instance_id() {
            log::debug!(
                "ignoring prepare timeout of instance {} at instance {}",
                timeout_instance_id,
                self.instance_id()
            );
            return;
        }
        self.base.observe(Event::PrepareTimeout);
        self.prepare(ctx, self.was_rejected_by_someone);
    }

    /// Handles a fired accept timer armed during `timeout_instance_id`.
    pub fn on_accept_timeout<R: RngCore>(
        &mut self,
        ctx: &mut ProposerContext<'_, R>,
        timeout_instance_id: InstanceId,
    ) {
        if timeout_instance_id != self.instance_id() {
            log::debug!(
                "ignoring accept timeout of instance {} at instance {}",
                timeout_instance_id,
                self.instance_id()
            );
            return;
        }
        self.base.observe(Event::AcceptTimeout);
        self.prepare(ctx, self.was_rejected_by_someone);
    }

    pub fn exit_prepare(&mut self, timer: &mut Timer<Timeout>) {
        if self.is_preparing {
            self.is_preparing = false;
            if let Some(timer_id) = self.prepare_timer.take() {
                timer.remove_timer(timer_id);
            }
        }
    }

    pub fn exit_accept(&mut self, timer: &mut Timer<Timeout>) {
        if self.is_accepting {
            self.is_accepting = false;
            if let Some(timer_id) = self.accept_timer.take() {
                timer.remove_timer(timer_id);
            }
        }
    }

    fn on_stale_reply(&mut self, msg: &PaxosMsg) {
        verbose!(
            "stale reply for proposal {} while at {}",
            msg.proposal_id,
            self.state.proposal_id
        );
        self.base.observe(Event::StaleReply);
        self.apply_reject_hint(msg);
    }

    fn apply_reject_hint(&mut self, msg: &PaxosMsg) {
        if msg.is_reject() {
            verbose!("reject hint {} from {}", msg.reject_by_promise_id, msg.node_id);
            self.was_rejected_by_someone = true;
            self.state.set_other_proposal_id(msg.reject_by_promise_id);
        }
    }

    /// Arms the timer of a phase, replacing any pending one. Without `fixed_ms` the phase's backoff timeout is used
    /// and then doubled up to its ceiling.
    fn add_timer<R>(&mut self, ctx: &mut ProposerContext<'_, R>, kind: TimeoutKind, fixed_ms: Option<u64>) {
        let (slot, last_timeout_ms, max_timeout_ms) = match kind {
            TimeoutKind::Prepare => (
                &mut self.prepare_timer,
                &mut self.last_prepare_timeout_ms,
                self.config.max_prepare_timeout_ms,
            ),
            TimeoutKind::Accept => (
                &mut self.accept_timer,
                &mut self.last_accept_timeout_ms,
                self.config.max_accept_timeout_ms,
            ),
        };

        if let Some(timer_id) = slot.take() {
            ctx.timer.remove_timer(timer_id);
        }

        let timeout_ms = match fixed_ms {
            Some(fixed_ms) => fixed_ms,
            None => {
                let timeout_ms = *last_timeout_ms;
                *last_timeout_ms = timeout_ms.saturating_mul(2).min(max_timeout_ms);
                timeout_ms
            }
        };

        let timeout = Timeout {
            kind,
            instance_id: self.base.instance_id(),
        };
        verbose!("{:?} timeout in {}ms", kind, timeout_ms);
        *slot = Some(ctx.timer.add_timer(ctx.now + timeout_ms, timeout));
    }

    fn retry_delay_ms<R: RngCore>(&self, random: &mut R) -> u64 {
        let min = self.config.retry_delay_min_ms;
        let max = self.config.retry_delay_max_ms;
        if max <= min {
            min
        } else {
            min + u64::from(random.next_u32()) % (max - min)
        }
    }
}

impl Participant for Proposer {
    fn base(&self) -> &Base {
        &self.base
    }
}
