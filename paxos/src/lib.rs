//! This is the Paxos consensus algorithm implemented for Rust, in the multi-instance form which lets a fixed group
//! of nodes agree on an ordered log of values, one instance at a time.
//!
//! > The Paxos algorithm, when presented in plain English, is very simple.
//!
//! The crate is a sans-IO protocol core. An [`Instance`] is driven by three calls (proposing a value, receiving a
//! message, and firing due timers), each taking the current time in milliseconds. It talks to the outside world
//! only through the [`Storage`](storage::Storage), [`Transport`](network::Transport) and
//! [`Learner`](learner::Learner) traits. All protocol state of one group lives on a single thread; groups share
//! nothing and may run on as many threads as needed.

#[macro_use]
mod macros;

pub mod acceptor;
pub mod ballot;
pub mod base;
pub mod counter;
pub mod instance;
pub mod learner;
pub mod message;
pub mod network;
pub mod observer;
pub mod proposer;
pub mod storage;
pub mod timer;

pub use instance::{Config, Instance};

/// The ID of a node within a group.
pub type NodeId = u64;

/// The sequence number of an instance, i.e. of one slot of the replicated log.
pub type InstanceId = u64;
