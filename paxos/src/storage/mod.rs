//! Types related to durable acceptor state.
//!
//! An acceptor must not answer a prepare or accept request before the state change the answer depends on has been
//! written to its [`Storage`]. One [`AcceptorStateData`] record is kept per instance; after a restart the record of
//! the highest instance is loaded back and the node resumes from it.

use core::fmt;

use bytes::Bytes;

use crate::ballot::BallotNumber;
use crate::InstanceId;

pub mod memory;

/// An interface for durable storage of per-instance acceptor state.
///
/// # Checksum chain
///
/// Each record carries a checksum chained from the checksum of the preceding instance. [`persist`] receives that
/// preceding checksum as `prior_checksum` so that implementations may verify the chain. A `prior_checksum` of zero
/// means the chain is unknown and must not be checked.
///
/// [`persist`]: Self::persist
pub trait Storage {
    /// The type of error returned by fallible operations.
    type Error: fmt::Display;

    /// Writes the acceptor state of `instance_id`, replacing any previous record of that instance.
    ///
    /// # Errors
    ///
    /// If the record could not be written durably, an error is returned and the caller must act as if nothing was
    /// written.
    fn persist(
        &mut self,
        instance_id: InstanceId,
        prior_checksum: u32,
        state: &AcceptorStateData,
        options: WriteOptions,
    ) -> Result<(), Self::Error>;

    /// Returns the record of `instance_id`, or `None` if none was ever persisted.
    ///
    /// # Errors
    ///
    /// If the record exists but could not be read, an error is returned.
    fn load(&mut self, instance_id: InstanceId) -> Result<Option<AcceptorStateData>, Self::Error>;

    /// Returns the highest instance ID with a persisted record, or `None` if the storage is empty.
    fn max_instance_id(&mut self) -> Result<Option<InstanceId>, Self::Error>;
}

/// Options for a single [`Storage::persist`] call.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct WriteOptions {
    /// Whether the write must be flushed to durable media before returning.
    pub sync: bool,
}

/// The persisted form of an acceptor's state for one instance.
#[derive(Clone, PartialEq, prost::Message)]
pub struct AcceptorStateData {
    #[prost(uint64, tag = "1")]
    pub instance_id: u64,

    #[prost(uint64, tag = "2")]
    pub promise_id: u64,

    #[prost(uint64, tag = "3")]
    pub promise_node_id: u64,

    #[prost(uint64, tag = "4")]
    pub accepted_id: u64,

    #[prost(uint64, tag = "5")]
    pub accepted_node_id: u64,

    #[prost(bytes = "bytes", tag = "6")]
    pub accepted_value: Bytes,

    #[prost(uint32, tag = "7")]
    pub checksum: u32,
}

impl AcceptorStateData {
    pub fn promise_ballot(&self) -> BallotNumber {
        BallotNumber::new(self.promise_id, self.promise_node_id)
    }

    pub fn accepted_ballot(&self) -> BallotNumber {
        BallotNumber::new(self.accepted_id, self.accepted_node_id)
    }
}
