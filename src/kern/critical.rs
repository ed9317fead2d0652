//! Critical-section nesting
//!
//! A critical counter tracks how deeply its owner (a KSE or a thread) is
//! nested in regions that must not be interrupted by a switch. A yield
//! requested while the counter is non-zero is remembered and reported by the
//! `leave` that brings the depth back to zero, so the caller can perform it
//! then.

use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

#[derive(Debug, Default)]
pub struct CriticalCounter {
    depth: AtomicU32,
    yield_pending: AtomicBool,
}

impl CriticalCounter {
    pub const fn new() -> Self {
        Self {
            depth: AtomicU32::new(0),
            yield_pending: AtomicBool::new(false),
        }
    }

    /// Current nesting depth
    pub fn depth(&self) -> u32 {
        self.depth.load(Ordering::Acquire)
    }

    pub fn in_critical(&self) -> bool {
        self.depth() != 0
    }

    /// Enter a region; returns the depth before entering
    pub fn enter(&self) -> u32 {
        self.depth.fetch_add(1, Ordering::AcqRel)
    }

    /// Leave a region
    ///
    /// Returns true when this was the outermost region and a yield was
    /// requested while inside it.
    pub fn leave(&self) -> bool {
        let prev = self.depth.fetch_sub(1, Ordering::AcqRel);
        if prev == 0 {
            crate::sched_fatal!("critical section left more times than entered");
        }
        prev == 1 && self.yield_pending.swap(false, Ordering::AcqRel)
    }

    /// Ask for a yield
    ///
    /// Returns true if the yield was deferred because the owner is inside a
    /// critical region; false means the caller may yield right away.
    pub fn request_yield(&self) -> bool {
        if self.in_critical() {
            self.yield_pending.store(true, Ordering::Release);
            true
        } else {
            false
        }
    }

    pub fn yield_pending(&self) -> bool {
        self.yield_pending.load(Ordering::Acquire)
    }

    pub fn reset(&self) {
        self.depth.store(0, Ordering::Release);
        self.yield_pending.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nesting() {
        let crit = CriticalCounter::new();
        assert_eq!(crit.enter(), 0);
        assert_eq!(crit.enter(), 1);
        assert!(!crit.leave());
        assert!(crit.in_critical());
        assert!(!crit.leave());
        assert!(!crit.in_critical());
    }

    #[test]
    fn test_deferred_yield() {
        let crit = CriticalCounter::new();
        assert!(!crit.request_yield());

        crit.enter();
        crit.enter();
        assert!(crit.request_yield());
        // Inner leave keeps the request pending
        assert!(!crit.leave());
        assert!(crit.yield_pending());
        assert!(crit.leave());
        assert!(!crit.yield_pending());
    }

    #[test]
    #[should_panic]
    fn test_unbalanced_leave_is_fatal() {
        let crit = CriticalCounter::new();
        crit.leave();
    }
}
