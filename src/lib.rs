//! A threaded runtime for the [`paxos`] core.
//!
//! Every node of every group runs on its own thread and owns its [`paxos::Instance`]. Nodes talk over in-process
//! crossbeam channels, so a [`Cluster`] is a whole replicated log system living in one process. Groups share nothing.

pub use cluster::{Cluster, ClusterError, Learned};
pub use network::{ChannelTransport, Command};

pub mod cluster;
pub mod network;
