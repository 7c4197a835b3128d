//! Hooks for recording protocol events, e.g. into metrics.

use crate::InstanceId;

/// A notable protocol event, reported to an [`Observer`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Event {
    /// A client value was handed to the proposer.
    NewProposal,
    /// A new proposal went straight to the accept phase.
    SkipPrepare,
    Prepare,
    /// A majority promised, after `use_ms` milliseconds.
    PreparePass { use_ms: u64 },
    PrepareNotPass,
    PrepareTimeout,
    Accept,
    /// A majority accepted, after `use_ms` milliseconds.
    AcceptPass { use_ms: u64 },
    AcceptNotPass,
    AcceptTimeout,
    /// A reply arrived for a round which is no longer in flight.
    StaleReply,
    AcceptorPromise,
    AcceptorAccept,
    AcceptorReject,
    /// Acceptor state could not be persisted and the request went unanswered.
    PersistFailed,
    /// An accept request disagreed with the local checksum chain.
    ChecksumMismatch,
    Learned { instance_id: InstanceId },
}

/// Receives [`Event`]s as a node runs. Every method defaults to doing nothing.
pub trait Observer {
    fn record(&self, _event: Event) {}
}

/// An [`Observer`] which ignores every event.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopObserver;

impl Observer for NoopObserver {}
