//! Deadline queue.
//!
//! Thread and attachment deletions are scheduled once, at creation, and
//! fire from [`ExpiryScheduler::tick`]. The scheduler never sleeps: the
//! driver polls it with the current time. Due entries are removed under
//! the queue lock and fired after it is released, so a firing callback may
//! schedule further deadlines without deadlocking.

use std::{cmp::Reverse, collections::BinaryHeap};

use parking_lot::Mutex;

use crate::identity::{AttachmentId, ThreadId};

/// What a deadline deletes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExpiryTarget {
    /// Close the thread
    Thread(ThreadId),
    /// Purge the attachment
    Attachment(AttachmentId),
}

/// Handle of a scheduled deadline. Assigned in insertion order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeadlineId(pub u64);

/// A deadline that has come due.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fired<I> {
    /// Handle returned by `schedule`
    pub id: DeadlineId,
    /// Scheduled time (not the time it was observed)
    pub at: I,
    /// What to delete
    pub target: ExpiryTarget,
}

#[derive(Debug)]
struct Entry<I> {
    at: I,
    seq: u64,
    target: ExpiryTarget,
}

// Ordered by (deadline, insertion sequence). Sequence numbers are unique,
// so the target never takes part in comparisons.
impl<I: Ord> PartialEq for Entry<I> {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at && self.seq == other.seq
    }
}

impl<I: Ord> Eq for Entry<I> {}

impl<I: Ord> PartialOrd for Entry<I> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl<I: Ord> Ord for Entry<I> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.at.cmp(&other.at).then(self.seq.cmp(&other.seq))
    }
}

#[derive(Debug)]
struct Queue<I> {
    heap: BinaryHeap<Reverse<Entry<I>>>,
    next_seq: u64,
}

/// Min-ordered deadline queue.
///
/// Generic over `I` (Instant type) to support virtual time in tests.
#[derive(Debug)]
pub struct ExpiryScheduler<I> {
    queue: Mutex<Queue<I>>,
}

impl<I: Copy + Ord> Default for ExpiryScheduler<I> {
    fn default() -> Self {
        Self::new()
    }
}

impl<I: Copy + Ord> ExpiryScheduler<I> {
    /// Create an empty scheduler.
    pub fn new() -> Self {
        Self { queue: Mutex::new(Queue { heap: BinaryHeap::new(), next_seq: 0 }) }
    }

    /// Schedule `target` to fire once `now >= at`.
    pub fn schedule(&self, at: I, target: ExpiryTarget) -> DeadlineId {
        let mut queue = self.queue.lock();
        let seq = queue.next_seq;
        queue.next_seq += 1;
        queue.heap.push(Reverse(Entry { at, seq, target }));
        DeadlineId(seq)
    }

    /// Remove and return every entry due at `now`, in firing order.
    pub fn drain_due(&self, now: I) -> Vec<Fired<I>> {
        let mut queue = self.queue.lock();
        let mut due = Vec::new();
        while queue.heap.peek().is_some_and(|Reverse(entry)| entry.at <= now) {
            if let Some(Reverse(entry)) = queue.heap.pop() {
                due.push(Fired { id: DeadlineId(entry.seq), at: entry.at, target: entry.target });
            }
        }
        due
    }

    /// Fire every entry due at `now`, earliest first; ties fire in the
    /// order they were scheduled.
    ///
    /// Returns the number fired.
    pub fn tick(&self, now: I, mut fire: impl FnMut(Fired<I>)) -> usize {
        let due = self.drain_due(now);
        let count = due.len();
        for fired in due {
            fire(fired);
        }
        count
    }

    /// Earliest pending deadline.
    pub fn next_deadline(&self) -> Option<I> {
        self.queue.lock().heap.peek().map(|Reverse(entry)| entry.at)
    }

    /// Number of pending deadlines.
    pub fn pending(&self) -> usize {
        self.queue.lock().heap.len()
    }
}
