//! Wait Queue
//!
//! Deadline-ordered queue of blocked threads. Entries are kept sorted by
//! ascending deadline; equal deadlines keep arrival order and untimed
//! entries (`Deadline::Never`) always sit behind every timed one.

use alloc::collections::VecDeque;
use core::time::Duration;

use crate::error::{Result, SchedError};
use crate::types::{Deadline, ThreadId};

#[derive(Debug, Default)]
pub struct WaitQueue {
    entries: VecDeque<(Deadline, ThreadId)>,
}

impl WaitQueue {
    pub fn new(capacity: usize) -> Result<Self> {
        let mut entries = VecDeque::new();
        entries
            .try_reserve(capacity)
            .map_err(|_| SchedError::NoMemory("wait queue storage"))?;
        Ok(Self { entries })
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Insert before the first entry with a strictly later deadline
    pub fn insert(&mut self, thread: ThreadId, deadline: Deadline) -> Result<()> {
        self.entries
            .try_reserve(1)
            .map_err(|_| SchedError::NoMemory("wait queue entry"))?;
        let pos = self.entries.partition_point(|(at, _)| *at <= deadline);
        self.entries.insert(pos, (deadline, thread));
        Ok(())
    }

    pub fn remove(&mut self, thread: ThreadId) -> bool {
        match self.entries.iter().position(|(_, t)| *t == thread) {
            Some(pos) => {
                self.entries.remove(pos);
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, thread: ThreadId) -> bool {
        self.entries.iter().any(|(_, t)| *t == thread)
    }

    /// Pop the head if its deadline has elapsed
    pub fn pop_expired(&mut self, now: Duration) -> Option<ThreadId> {
        match self.entries.front() {
            Some((deadline, _)) if deadline.has_elapsed(now) => {
                self.entries.pop_front().map(|(_, thread)| thread)
            }
            _ => None,
        }
    }

    /// Deadline of the head, `Never` when nothing is timed
    pub fn next_deadline(&self) -> Deadline {
        self.entries
            .front()
            .map_or(Deadline::Never, |(deadline, _)| *deadline)
    }

    pub fn iter(&self) -> impl Iterator<Item = (Deadline, ThreadId)> + '_ {
        self.entries.iter().copied()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Handle;

    fn tid(n: u32) -> ThreadId {
        ThreadId::from_parts(n, 0)
    }

    fn at(ms: u64) -> Deadline {
        Deadline::At(Duration::from_millis(ms))
    }

    #[test]
    fn test_sorted_with_fifo_ties() {
        let mut wq = WaitQueue::new(4).unwrap();
        wq.insert(tid(1), Deadline::Never).unwrap();
        wq.insert(tid(2), at(30)).unwrap();
        wq.insert(tid(3), at(10)).unwrap();
        wq.insert(tid(4), at(30)).unwrap();
        wq.insert(tid(5), Deadline::Never).unwrap();

        let order: alloc::vec::Vec<_> = wq.iter().map(|(_, t)| t).collect();
        assert_eq!(order, [tid(3), tid(2), tid(4), tid(1), tid(5)]);
        assert_eq!(wq.next_deadline(), at(10));
    }

    #[test]
    fn test_pop_expired() {
        let mut wq = WaitQueue::new(0).unwrap();
        wq.insert(tid(1), at(10)).unwrap();
        wq.insert(tid(2), at(20)).unwrap();
        wq.insert(tid(3), Deadline::Never).unwrap();

        let now = Duration::from_millis(15);
        assert_eq!(wq.pop_expired(now), Some(tid(1)));
        assert_eq!(wq.pop_expired(now), None);
        assert_eq!(wq.pop_expired(Duration::MAX), Some(tid(2)));
        // Untimed entries never expire
        assert_eq!(wq.pop_expired(Duration::MAX), None);
        assert_eq!(wq.len(), 1);
    }

    #[test]
    fn test_remove() {
        let mut wq = WaitQueue::new(0).unwrap();
        wq.insert(tid(1), at(10)).unwrap();
        assert!(wq.remove(tid(1)));
        assert!(!wq.remove(tid(1)));
        assert_eq!(wq.next_deadline(), Deadline::Never);
    }
}
