//! Common types used across KSE_R
//!
//! This module defines shared types to avoid circular dependencies.
//!
//! KSEs, KSE groups and threads are addressed through generation-checked
//! slab handles. A handle keeps its index when the object behind it is
//! recycled, but the generation moves on, so a stale handle never resolves
//! to the object that replaced it.

use core::fmt;
use core::time::Duration;

// ============================================================================
// Handles
// ============================================================================

/// A generation-checked index into a slab
pub trait Handle: Copy + Eq + Ord + fmt::Debug {
    /// Build a handle from its slot index and generation
    fn from_parts(index: u32, generation: u32) -> Self;

    /// Slot index
    fn index(self) -> usize;

    /// Slot generation at the time the handle was issued
    fn generation(self) -> u32;

    /// Pack into a single word (for atomics and mailboxes)
    fn to_bits(self) -> u64 {
        ((self.generation() as u64) << 32) | self.index() as u64
    }

    /// Unpack a word produced by [`Handle::to_bits`]
    fn from_bits(bits: u64) -> Self {
        Self::from_parts(bits as u32, (bits >> 32) as u32)
    }
}

macro_rules! define_handle {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name {
            index: u32,
            generation: u32,
        }

        impl Handle for $name {
            fn from_parts(index: u32, generation: u32) -> Self {
                Self { index, generation }
            }

            fn index(self) -> usize {
                self.index as usize
            }

            fn generation(self) -> u32 {
                self.generation
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "#{}.{}"), self.index, self.generation)
            }
        }
    };
}

define_handle!(
    /// Kernel-scheduled entity identifier
    KseId,
    "kse"
);

define_handle!(
    /// KSE group identifier
    KsegId,
    "kseg"
);

define_handle!(
    /// Thread identifier
    ThreadId,
    "thread"
);

// ============================================================================
// Priority
// ============================================================================

/// Thread scheduling priority (higher value runs first)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Priority(u8);

impl Priority {
    /// Lowest priority
    pub const MIN: Self = Self(0);
    /// Default priority for new threads
    pub const DEFAULT: Self = Self(15);
    /// Highest representable priority
    pub const MAX: Self = Self(u8::MAX);

    pub const fn new(value: u8) -> Self {
        Self(value)
    }

    pub const fn value(self) -> u8 {
        self.0
    }

    /// Clamp to a run queue with `levels` priority levels
    pub fn clamp_to(self, levels: usize) -> Self {
        let top = levels.saturating_sub(1).min(u8::MAX as usize) as u8;
        Self(self.0.min(top))
    }
}

impl Default for Priority {
    fn default() -> Self {
        Self::DEFAULT
    }
}

// ============================================================================
// Deadlines
// ============================================================================

/// Wakeup deadline measured against the kernel's time of day
///
/// `At` always orders before `Never`, which is what keeps untimed waiters at
/// the tail of a wait queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum Deadline {
    /// Wake at this absolute time of day
    At(Duration),
    /// No timeout
    #[default]
    Never,
}

impl Deadline {
    /// Deadline `timeout` after `now`; `None` means no timeout
    pub fn after(now: Duration, timeout: Option<Duration>) -> Self {
        match timeout {
            Some(timeout) => Deadline::At(now.saturating_add(timeout)),
            None => Deadline::Never,
        }
    }

    pub fn is_never(self) -> bool {
        matches!(self, Deadline::Never)
    }

    pub fn has_elapsed(self, now: Duration) -> bool {
        matches!(self, Deadline::At(at) if at <= now)
    }

    /// Time left until the deadline, `None` for no timeout
    pub fn remaining(self, now: Duration) -> Option<Duration> {
        match self {
            Deadline::At(at) => Some(at.saturating_sub(now)),
            Deadline::Never => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handle_bits() {
        let id = ThreadId::from_parts(7, 3);
        assert_eq!(ThreadId::from_bits(id.to_bits()), id);
        assert_eq!(id.index(), 7);
        assert_eq!(id.generation(), 3);
    }

    #[test]
    fn test_deadline_ordering() {
        let early = Deadline::At(Duration::from_millis(5));
        let late = Deadline::At(Duration::from_millis(9));
        assert!(early < late);
        assert!(late < Deadline::Never);
        assert!(early.has_elapsed(Duration::from_millis(5)));
        assert!(!late.has_elapsed(Duration::from_millis(5)));
        assert!(!Deadline::Never.has_elapsed(Duration::MAX));
    }

    #[test]
    fn test_priority_clamp() {
        assert_eq!(Priority::new(200).clamp_to(64), Priority::new(63));
        assert_eq!(Priority::DEFAULT.clamp_to(64), Priority::DEFAULT);
    }
}
