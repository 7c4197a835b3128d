//! The acceptor role.

use bytes::Bytes;

use crate::base::{Base, Participant};
use crate::ballot::BallotNumber;
use crate::message::{MessageDestination, MsgType, PaxosMsg, SendableMessage};
use crate::observer::Event;
use crate::storage::{AcceptorStateData, Storage, WriteOptions};

/// The state an acceptor keeps for its current instance.
///
/// Whenever [`accepted`](Self::accepted) is non-null, [`promised`](Self::promised) is at least as high.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct AcceptorState {
    /// The highest ballot this acceptor has promised not to undercut.
    pub promised: BallotNumber,

    /// The ballot of the last accepted value, or null.
    pub accepted: BallotNumber,

    pub accepted_value: Bytes,

    /// CRC32C of the accepted value chained from the previous instance's checksum.
    pub checksum: u32,
}

/// Answers prepare and accept requests for the current instance, persisting every state change before replying.
pub struct Acceptor<S> {
    base: Base,
    state: AcceptorState,
    storage: S,
    log_sync: bool,
    sync_interval: u32,
    sync_times: u32,
}

//
// AcceptorState impls
//

impl AcceptorState {
    /// Clears everything but the promise, which carries over to later instances.
    pub fn init_for_new_instance(&mut self) {
        self.accepted.reset();
        self.accepted_value = Bytes::new();
        self.checksum = 0;
    }

    fn from_data(data: &AcceptorStateData) -> Self {
        Self {
            promised: data.promise_ballot(),
            accepted: data.accepted_ballot(),
            accepted_value: data.accepted_value.clone(),
            checksum: data.checksum,
        }
    }

    fn to_data(&self, instance_id: u64) -> AcceptorStateData {
        AcceptorStateData {
            instance_id,
            promise_id: self.promised.proposal_id,
            promise_node_id: self.promised.node_id,
            accepted_id: self.accepted.proposal_id,
            accepted_node_id: self.accepted.node_id,
            accepted_value: self.accepted_value.clone(),
            checksum: self.checksum,
        }
    }
}

//
// Acceptor impls
//

impl<S: Storage> Acceptor<S> {
    pub fn new(base: Base, storage: S, log_sync: bool, sync_interval: u32) -> Self {
        Self {
            base,
            state: AcceptorState::default(),
            storage,
            log_sync,
            sync_interval,
            sync_times: 0,
        }
    }

    /// Restores the state of the highest persisted instance and moves the instance tracker to it.
    ///
    /// The chained checksum is taken from the record of the instance before it, or zero if there is none.
    pub fn init(&mut self) -> Result<(), S::Error> {
        let max_instance_id = match self.storage.max_instance_id()? {
            Some(max_instance_id) => max_instance_id,
            None => {
                log::info!("empty storage, starting at instance 0");
                return Ok(());
            }
        };

        if let Some(data) = self.storage.load(max_instance_id)? {
            self.state = AcceptorState::from_data(&data);
        }

        let last_checksum = match max_instance_id.checked_sub(1) {
            Some(prev_instance_id) => self
                .storage
                .load(prev_instance_id)?
                .map(|data| data.checksum)
                .unwrap_or(0),
            None => 0,
        };
        self.base.tracker().set(max_instance_id, last_checksum);

        log::info!(
            "recovered instance {} promised {} accepted {} last checksum {:#010x}",
            max_instance_id,
            self.state.promised,
            self.state.accepted,
            last_checksum
        );
        Ok(())
    }

    pub fn init_for_new_instance(&mut self) {
        self.state.init_for_new_instance();
    }

    pub fn state(&self) -> &AcceptorState {
        &self.state
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    pub fn storage_mut(&mut self) -> &mut S {
        &mut self.storage
    }

    /// Handles a prepare request, returning the reply for its sender.
    ///
    /// # Errors
    ///
    /// If the new promise could not be persisted, the state is left untouched and the error is returned. No reply
    /// must be sent in that case.
    pub fn on_prepare(&mut self, msg: &PaxosMsg) -> Result<SendableMessage, S::Error> {
        let ballot = msg.ballot();
        let mut reply = self.pack(MsgType::PrepareReply);
        reply.proposal_id = msg.proposal_id;

        if ballot >= self.state.promised {
            verbose!("promise {} over {}", ballot, self.state.promised);
            reply.pre_accept_id = self.state.accepted.proposal_id;
            reply.pre_accept_node_id = self.state.accepted.node_id;
            if !self.state.accepted.is_null() {
                reply.value = self.state.accepted_value.clone();
            }

            let mut next = self.state.clone();
            next.promised = ballot;
            self.persist(next)?;
            self.base.observe(Event::AcceptorPromise);
        } else {
            verbose!("reject prepare {} under promise {}", ballot, self.state.promised);
            reply.reject_by_promise_id = self.state.promised.proposal_id;
            self.base.observe(Event::AcceptorReject);
        }

        Ok(self.reply_to(msg, reply))
    }

    /// Handles an accept request, returning the reply for its sender.
    ///
    /// # Errors
    ///
    /// If the accepted value could not be persisted, the state is left untouched and the error is returned. No reply
    /// must be sent in that case.
    pub fn on_accept(&mut self, msg: &PaxosMsg) -> Result<SendableMessage, S::Error> {
        let ballot = msg.ballot();
        let mut reply = self.pack(MsgType::AcceptReply);
        reply.proposal_id = msg.proposal_id;

        if ballot >= self.state.promised {
            verbose!("accept {} with {} bytes", ballot, msg.value.len());
            let mut next = self.state.clone();
            next.promised = ballot;
            next.accepted = ballot;
            next.accepted_value = msg.value.clone();
            self.persist(next)?;
            self.base.observe(Event::AcceptorAccept);
        } else {
            verbose!("reject accept {} under promise {}", ballot, self.state.promised);
            reply.reject_by_promise_id = self.state.promised.proposal_id;
            self.base.observe(Event::AcceptorReject);
        }

        Ok(self.reply_to(msg, reply))
    }

    fn reply_to(&self, msg: &PaxosMsg, reply: PaxosMsg) -> SendableMessage {
        SendableMessage {
            message: reply,
            dest: MessageDestination::To(msg.node_id),
        }
    }

    /// Computes the chained checksum of `next`, writes it, and only then makes it the current state.
    fn persist(&mut self, mut next: AcceptorState) -> Result<(), S::Error> {
        let instance_id = self.instance_id();
        let last_checksum = self.base.last_checksum();

        if instance_id > 0 && last_checksum == 0 {
            next.checksum = 0;
        } else if !next.accepted_value.is_empty() {
            next.checksum = crc32c::crc32c_append(last_checksum, &next.accepted_value);
        }

        let options = WriteOptions {
            sync: self.next_write_syncs(),
        };
        let data = next.to_data(instance_id);
        if let Err(error) = self.storage.persist(instance_id, last_checksum, &data, options) {
            log::error!("persisting instance {} failed: {}", instance_id, error);
            self.base.observe(Event::PersistFailed);
            return Err(error);
        }

        self.state = next;
        Ok(())
    }

    fn next_write_syncs(&mut self) -> bool {
        if !self.log_sync {
            return false;
        }
        self.sync_times += 1;
        if self.sync_times > self.sync_interval {
            self.sync_times = 0;
            true
        } else {
            false
        }
    }
}

impl<S> Participant for Acceptor<S> {
    fn base(&self) -> &Base {
        &self.base
    }
}
