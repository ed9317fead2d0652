//! KSE_R - M:N user-level thread scheduling over kernel-scheduled entities
//!
//! User threads are multiplexed onto a small set of kernel-scheduled
//! entities (KSEs). KSEs are grouped into KSE groups; each group owns its
//! threads, a priority run queue and a deadline-ordered wait queue, all
//! behind one scheduling lock.
//!
//! The host supplies the kernel primitives, context switching and signal
//! delivery through [`host::Host`]. Everything else (allocation, caching,
//! garbage collection, the per-KSE scheduling pass, locking) lives here.
//!
//! Broken invariants are not errors: they abort through [`kern::fatal`].

#![cfg_attr(not(any(test, feature = "std")), no_std)]
#![allow(clippy::new_without_default)]

extern crate alloc;

/// Abort on a broken scheduler invariant
#[macro_export]
macro_rules! sched_fatal {
    ($($arg:tt)*) => {
        $crate::kern::fatal(format_args!($($arg)*))
    };
}

pub mod config;
pub mod error;
pub mod host;
pub mod kern;
pub mod scheduler;
pub mod types;

#[cfg(test)]
mod testing;

pub use config::SchedConfig;
pub use error::{KernelError, Result, SchedError};
pub use host::{ContextSwitch, Host, Kernel, SignalHook};
pub use kern::counters::CounterSnapshot;
pub use kern::kse::{KseFlags, KseMailbox, MailboxFlags};
pub use kern::lock::{Lock, LockOwner};
pub use kern::sched_prim::Dispatch;
pub use kern::thread::{Policy, Scope, Slice, ThreadAttr, ThreadFlags, ThreadInfo, ThreadState};
pub use scheduler::{CacheInfo, Scheduler};
pub use types::{Deadline, Handle, KseId, KsegId, Priority, ThreadId};
