//! Run Queue Management
//!
//! Each KSE group owns one run queue: a FIFO per priority level plus a
//! bitmap of non-empty levels, so the highest runnable priority is found
//! with a leading-zero count.
//!
//! Higher priority values run first. Within a level, threads that used up
//! their slice go to the tail and threads that were preempted inside their
//! slice go back to the head.
//!
//! The queue is only touched under its group's scheduling lock, so it is
//! plain data with no interior locking.

use alloc::collections::VecDeque;
use alloc::vec::Vec;

use crate::config::MAX_PRIORITY_LEVELS;
use crate::error::{Result, SchedError};
use crate::types::{Priority, ThreadId};

// ============================================================================
// Constants
// ============================================================================

/// Number of priority levels per bitmap word
pub const BITMAP_BITS: usize = 64;

const BITMAP_WORDS: usize = MAX_PRIORITY_LEVELS / BITMAP_BITS;

/// Where a thread enters its priority level
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunqEnd {
    /// Keeps its turn (still inside its quantum)
    Head,
    /// Waits behind everyone at its level
    Tail,
}

// ============================================================================
// Run Queue
// ============================================================================

/// Multi-priority run queue with bitmap lookup
#[derive(Debug)]
pub struct RunQueue {
    /// One FIFO per priority level
    levels: Vec<VecDeque<ThreadId>>,

    /// Bitmap of non-empty levels
    bitmap: [u64; BITMAP_WORDS],

    /// Total count of queued threads
    count: usize,
}

impl RunQueue {
    /// Create a run queue with `levels` priority levels, reserving room for
    /// `capacity` threads per level up front
    pub fn new(levels: usize, capacity: usize) -> Result<Self> {
        let levels = levels.clamp(1, MAX_PRIORITY_LEVELS);
        let mut queues = Vec::new();
        queues
            .try_reserve_exact(levels)
            .map_err(|_| SchedError::NoMemory("run queue levels"))?;
        for _ in 0..levels {
            let mut level = VecDeque::new();
            level
                .try_reserve(capacity)
                .map_err(|_| SchedError::NoMemory("run queue storage"))?;
            queues.push(level);
        }

        Ok(Self {
            levels: queues,
            bitmap: [0; BITMAP_WORDS],
            count: 0,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn len(&self) -> usize {
        self.count
    }

    /// Number of priority levels
    pub fn levels(&self) -> usize {
        self.levels.len()
    }

    /// Insert a thread at its priority level
    pub fn insert(&mut self, thread: ThreadId, priority: Priority, end: RunqEnd) -> Result<()> {
        let pri = self.level_of(priority);
        let queue = &mut self.levels[pri];
        queue
            .try_reserve(1)
            .map_err(|_| SchedError::NoMemory("run queue entry"))?;
        match end {
            RunqEnd::Head => queue.push_front(thread),
            RunqEnd::Tail => queue.push_back(thread),
        }
        self.set_bitmap_bit(pri);
        self.count += 1;
        Ok(())
    }

    /// Remove the first thread of the highest non-empty level
    pub fn pop(&mut self) -> Option<ThreadId> {
        let pri = self.find_highest_priority()?;
        let thread = self.levels[pri].pop_front();
        if thread.is_some() {
            self.count -= 1;
            if self.levels[pri].is_empty() {
                self.clear_bitmap_bit(pri);
            }
        }
        thread
    }

    /// Peek at the thread [`RunQueue::pop`] would return
    pub fn peek(&self) -> Option<ThreadId> {
        let pri = self.find_highest_priority()?;
        self.levels[pri].front().copied()
    }

    /// Remove a specific thread queued at `priority`
    pub fn remove(&mut self, thread: ThreadId, priority: Priority) -> bool {
        let pri = self.level_of(priority);
        let queue = &mut self.levels[pri];
        let Some(pos) = queue.iter().position(|&t| t == thread) else {
            return false;
        };
        queue.remove(pos);
        self.count -= 1;
        if queue.is_empty() {
            self.clear_bitmap_bit(pri);
        }
        true
    }

    pub fn contains(&self, thread: ThreadId) -> bool {
        self.levels.iter().any(|level| level.contains(&thread))
    }

    /// Threads queued at `priority`, in dequeue order
    pub fn level(&self, priority: Priority) -> impl Iterator<Item = ThreadId> + '_ {
        self.levels[self.level_of(priority)].iter().copied()
    }

    /// Every queued thread in dequeue order
    pub fn iter(&self) -> impl Iterator<Item = ThreadId> + '_ {
        self.levels.iter().rev().flat_map(|level| level.iter().copied())
    }

    /// Highest priority with queued threads
    pub fn highest_priority(&self) -> Option<Priority> {
        self.find_highest_priority().map(|p| Priority::new(p as u8))
    }

    pub fn clear(&mut self) {
        for level in &mut self.levels {
            level.clear();
        }
        self.bitmap = [0; BITMAP_WORDS];
        self.count = 0;
    }

    fn level_of(&self, priority: Priority) -> usize {
        priority.clamp_to(self.levels.len()).value() as usize
    }

    fn find_highest_priority(&self) -> Option<usize> {
        for (word, bits) in self.bitmap.iter().enumerate().rev() {
            if *bits != 0 {
                let bit = BITMAP_BITS - 1 - bits.leading_zeros() as usize;
                return Some(word * BITMAP_BITS + bit);
            }
        }
        None
    }

    fn set_bitmap_bit(&mut self, pri: usize) {
        self.bitmap[pri / BITMAP_BITS] |= 1u64 << (pri % BITMAP_BITS);
    }

    fn clear_bitmap_bit(&mut self, pri: usize) {
        self.bitmap[pri / BITMAP_BITS] &= !(1u64 << (pri % BITMAP_BITS));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Handle;

    fn tid(n: u32) -> ThreadId {
        ThreadId::from_parts(n, 0)
    }

    #[test]
    fn test_fifo_within_priority() {
        let mut rq = RunQueue::new(64, 4).unwrap();
        rq.insert(tid(1), Priority::DEFAULT, RunqEnd::Tail).unwrap();
        rq.insert(tid(2), Priority::DEFAULT, RunqEnd::Tail).unwrap();

        assert_eq!(rq.pop(), Some(tid(1)));
        assert_eq!(rq.pop(), Some(tid(2)));
        assert_eq!(rq.pop(), None);
        assert!(rq.is_empty());
    }

    #[test]
    fn test_higher_priority_first() {
        let mut rq = RunQueue::new(256, 0).unwrap();
        rq.insert(tid(1), Priority::new(3), RunqEnd::Tail).unwrap();
        rq.insert(tid(2), Priority::new(200), RunqEnd::Tail).unwrap();
        rq.insert(tid(3), Priority::new(70), RunqEnd::Tail).unwrap();

        assert_eq!(rq.highest_priority(), Some(Priority::new(200)));
        assert_eq!(rq.pop(), Some(tid(2)));
        assert_eq!(rq.pop(), Some(tid(3)));
        assert_eq!(rq.pop(), Some(tid(1)));
    }

    #[test]
    fn test_head_insert_keeps_turn() {
        let mut rq = RunQueue::new(64, 4).unwrap();
        rq.insert(tid(1), Priority::DEFAULT, RunqEnd::Tail).unwrap();
        rq.insert(tid(2), Priority::DEFAULT, RunqEnd::Head).unwrap();
        assert_eq!(rq.peek(), Some(tid(2)));
    }

    #[test]
    fn test_remove_clears_level() {
        let mut rq = RunQueue::new(64, 4).unwrap();
        rq.insert(tid(1), Priority::new(40), RunqEnd::Tail).unwrap();
        rq.insert(tid(2), Priority::new(10), RunqEnd::Tail).unwrap();

        assert!(rq.remove(tid(1), Priority::new(40)));
        assert!(!rq.remove(tid(1), Priority::new(40)));
        assert_eq!(rq.highest_priority(), Some(Priority::new(10)));
        assert_eq!(rq.len(), 1);
    }

    #[test]
    fn test_priority_clamped_to_levels() {
        let mut rq = RunQueue::new(8, 0).unwrap();
        rq.insert(tid(1), Priority::MAX, RunqEnd::Tail).unwrap();
        assert_eq!(rq.highest_priority(), Some(Priority::new(7)));
        assert!(rq.remove(tid(1), Priority::MAX));
    }
}
