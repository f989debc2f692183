//! Timeout events and the timer queue
//!
//! The event loop owns a single queue of `(deadline, SA, event)` entries.
//! Cancellation is lazy: every SA carries a generation counter, entries
//! record the generation they were scheduled under, and stale entries are
//! dropped when they fire.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::time::Duration;

use tokio::time::Instant;

use crate::sa::SerialNo;

/// The timeout a transition schedules on success
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TimeoutEvent {
    /// Start the retransmission timer for the just-sent request
    Retransmit,
    /// Schedule rekey/replacement of the SA
    SaReplace,
    /// Hard cleanup after the maximum responder wait
    SoDiscard,
    /// Keep whatever timer is currently running
    Retain,
    /// Schedule nothing
    Null,
}

/// A timer that actually fires on the event loop
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TimerEvent {
    /// Re-send the recorded request, backing off; tear down on expiry
    Retransmit,
    /// Replace/rekey the SA
    SaReplace,
    /// Discard a responder SA the peer never completed
    SoDiscard,
    /// Liveness (DPD) probe
    Liveness,
    /// A window slot opened; the queued child may send now
    SendNextIke,
}

#[derive(Debug, PartialEq, Eq)]
struct Entry {
    deadline: Instant,
    seq: u64,
    serial: SerialNo,
    generation: u64,
    event: TimerEvent,
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.deadline, self.seq).cmp(&(other.deadline, other.seq))
    }
}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// The queue of pending timers
#[derive(Debug, Default)]
pub struct TimerQueue {
    heap: BinaryHeap<Reverse<Entry>>,
    seq: u64,
}

impl TimerQueue {
    /// Schedule an event for an SA after `delay`
    ///
    /// `generation` must be the SA's current timer generation; bumping
    /// the generation cancels everything scheduled before.
    pub fn schedule(
        &mut self,
        serial: SerialNo,
        generation: u64,
        event: TimerEvent,
        delay: Duration,
    ) {
        self.seq += 1;
        self.heap.push(Reverse(Entry {
            deadline: Instant::now() + delay,
            seq: self.seq,
            serial,
            generation,
            event,
        }));
    }

    /// Deadline of the earliest pending entry
    pub fn next_deadline(&self) -> Option<Instant> {
        self.heap.peek().map(|Reverse(entry)| entry.deadline)
    }

    /// Pop the earliest entry if its deadline has passed
    ///
    /// The caller still has to validate the generation against the SA.
    pub fn pop_due(&mut self, now: Instant) -> Option<(SerialNo, u64, TimerEvent)> {
        if self
            .heap
            .peek()
            .is_some_and(|Reverse(entry)| entry.deadline <= now)
        {
            self.heap
                .pop()
                .map(|Reverse(entry)| (entry.serial, entry.generation, entry.event))
        } else {
            None
        }
    }

    /// Number of pending entries, stale ones included
    pub fn len(&self) -> usize {
        self.heap.len()
    }

    /// Whether no entries are pending
    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

/// Double an interval, clamped to the connection's cap
pub fn back_off(interval: Duration, cap: Duration) -> Duration {
    (interval * 2).min(cap)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fires_in_deadline_order() {
        let mut queue = TimerQueue::default();
        queue.schedule(SerialNo(1), 0, TimerEvent::SaReplace, Duration::from_secs(60));
        queue.schedule(SerialNo(2), 0, TimerEvent::Retransmit, Duration::from_millis(0));

        let now = Instant::now() + Duration::from_millis(1);
        let (serial, _, event) = queue.pop_due(now).unwrap_or_else(|| unreachable!());
        assert_eq!(serial, SerialNo(2));
        assert_eq!(event, TimerEvent::Retransmit);
        assert!(queue.pop_due(now).is_none());
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn back_off_caps() {
        let cap = Duration::from_secs(8);
        let mut interval = Duration::from_millis(500);
        for _ in 0..10 {
            interval = back_off(interval, cap);
        }
        assert_eq!(interval, cap);
    }
}
