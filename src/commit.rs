//! Commit-point scheduler: periodically acknowledges the durable
//! offset to clients that are not relayed, and bounds how long shutdown
//! waits for connections to drain.
//!
//! A binary heap keyed by due time stands in for a hierarchical timer
//! wheel: this server's timer cardinality is one entry per non-relayed
//! connection plus one shutdown deadline, nowhere near what would justify
//! wheel buckets.

use slotmap::DefaultKey;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashSet};
use std::time::{Duration, Instant};

/// What fired: either a connection's periodic commit-point ack, or the
/// global shutdown deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TimerKind {
    CommitAck(DefaultKey),
    ShutdownDeadline,
}

/// A single-threaded timer queue driven by the event loop's poll timeout.
/// Armed only when no relay is attached is enforced by callers — they
/// simply never call `arm_commit` for relayed connections.
pub struct CommitScheduler {
    heap: BinaryHeap<Reverse<(Instant, TimerKind)>>,
    ack_frequency: Duration,
    cancelled: HashSet<DefaultKey>,
}

impl CommitScheduler {
    pub fn new(ack_frequency: Duration) -> Self {
        Self {
            heap: BinaryHeap::new(),
            ack_frequency,
            cancelled: HashSet::new(),
        }
    }

    /// Arm (or re-arm) the periodic commit-point timer for `key`.
    pub fn arm_commit(&mut self, key: DefaultKey) {
        self.cancelled.remove(&key);
        self.heap
            .push(Reverse((Instant::now() + self.ack_frequency, TimerKind::CommitAck(key))));
    }

    /// Arm the one-shot shutdown deadline, `timeout` from now.
    pub fn arm_shutdown_deadline(&mut self, timeout: Duration) {
        self.heap
            .push(Reverse((Instant::now() + timeout, TimerKind::ShutdownDeadline)));
    }

    /// How long until the next timer fires, for the `mio::Poll::poll`
    /// timeout argument. `None` means no timers are armed.
    pub fn next_timeout(&self) -> Option<Duration> {
        self.heap
            .peek()
            .map(|Reverse((due, _))| due.saturating_duration_since(Instant::now()))
    }

    /// Drain every timer that is due as of now, re-arming periodic ones
    /// and silently dropping any that were cancelled since being armed.
    pub fn drain_due(&mut self) -> Vec<TimerKind> {
        let now = Instant::now();
        let mut fired = Vec::new();
        while let Some(&Reverse((due, kind))) = self.heap.peek() {
            if due > now {
                break;
            }
            self.heap.pop();
            if let TimerKind::CommitAck(key) = kind {
                if self.cancelled.remove(&key) {
                    continue;
                }
                self.arm_commit(key);
            }
            fired.push(kind);
        }
        fired
    }

    /// Drop any pending commit timer for a connection being torn down, so
    /// a stale entry doesn't fire against a freed slot.
    pub fn cancel_commit(&mut self, key: DefaultKey) {
        self.cancelled.insert(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use slotmap::SlotMap;

    #[test]
    fn shutdown_deadline_fires_after_timeout() {
        let mut sched = CommitScheduler::new(Duration::from_secs(60));
        sched.arm_shutdown_deadline(Duration::from_millis(0));
        std::thread::sleep(Duration::from_millis(5));
        let fired = sched.drain_due();
        assert_eq!(fired, vec![TimerKind::ShutdownDeadline]);
    }

    #[test]
    fn commit_ack_rearms_itself() {
        let mut map: SlotMap<DefaultKey, ()> = SlotMap::new();
        let key = map.insert(());
        let mut sched = CommitScheduler::new(Duration::from_millis(0));
        sched.arm_commit(key);
        std::thread::sleep(Duration::from_millis(5));
        let fired = sched.drain_due();
        assert_eq!(fired, vec![TimerKind::CommitAck(key)]);
        // Re-armed for the next cycle.
        assert!(sched.next_timeout().is_some());
    }
}
