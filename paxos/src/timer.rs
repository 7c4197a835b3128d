//! A deadline queue driven by a caller-supplied clock.

use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashSet};

use crate::InstanceId;

/// Identifies a timer registered with a [`Timer`]. Never zero.
pub type TimerId = u64;

/// The phase a proposer timeout belongs to.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TimeoutKind {
    Prepare,
    Accept,
}

/// A proposer timeout, carrying the instance ID current when it was armed.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Timeout {
    pub kind: TimeoutKind,
    pub instance_id: InstanceId,
}

/// A min-queue of timers ordered by deadline, then by registration order.
///
/// Time is an opaque millisecond counter supplied by the caller; the queue never reads a clock itself.
pub struct Timer<T> {
    next_id: TimerId,
    queue: BinaryHeap<Reverse<Entry<T>>>,
    removed: HashSet<TimerId>,
}

struct Entry<T> {
    deadline: u64,
    id: TimerId,
    payload: T,
}

impl<T> Timer<T> {
    pub fn new() -> Self {
        Self {
            next_id: 1,
            queue: BinaryHeap::new(),
            removed: HashSet::new(),
        }
    }

    /// Registers `payload` to fire at `deadline` and returns the new timer's ID.
    pub fn add_timer(&mut self, deadline: u64, payload: T) -> TimerId {
        let id = self.next_id;
        self.next_id += 1;
        self.queue.push(Reverse(Entry {
            deadline,
            id,
            payload,
        }));
        id
    }

    /// Cancels a timer. Unknown or already fired IDs are ignored.
    pub fn remove_timer(&mut self, id: TimerId) {
        if self.queue.iter().any(|Reverse(entry)| entry.id == id) {
            self.removed.insert(id);
        }
    }

    /// Pops the earliest timer whose deadline is at or before `now`.
    pub fn pop_timeout(&mut self, now: u64) -> Option<(TimerId, T)> {
        self.skip_removed();
        let due = matches!(self.queue.peek(), Some(Reverse(entry)) if entry.deadline <= now);
        if !due {
            return None;
        }
        let Reverse(entry) = self.queue.pop()?;
        Some((entry.id, entry.payload))
    }

    /// Returns the number of milliseconds until the next live timer fires, zero if one is already due.
    pub fn next_timeout(&mut self, now: u64) -> Option<u64> {
        self.skip_removed();
        self.queue
            .peek()
            .map(|Reverse(entry)| entry.deadline.saturating_sub(now))
    }

    pub fn is_empty(&mut self) -> bool {
        self.skip_removed();
        self.queue.is_empty()
    }

    fn skip_removed(&mut self) {
        while let Some(Reverse(entry)) = self.queue.peek() {
            if !self.removed.remove(&entry.id) {
                break;
            }
            self.queue.pop();
        }
    }
}

impl<T> Default for Timer<T> {
    fn default() -> Self {
        Self::new()
    }
}

//
// Entry impls
//

impl<T> PartialEq for Entry<T> {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl<T> Eq for Entry<T> {}

impl<T> PartialOrd for Entry<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Entry<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.deadline, self.id).cmp(&(other.deadline, other.id))
    }
}
