//! Kern subsystem - Scheduler core primitives
//!
//! Entities (KSEs, groups, threads), their caches, the queues and locks that
//! order them, and the scheduling pass that ties them together.

use core::fmt;

pub mod counters;
pub mod critical;
pub mod kse;
pub mod kse_alloc;
pub mod kse_lock;
pub mod kseg;
pub mod lock;
pub mod runq;
pub mod sched_prim;
pub mod stack;
pub mod thr_lock;
pub mod thread;
pub mod thread_alloc;
pub mod waitq;
pub mod zalloc;

pub use counters::{CounterSnapshot, SchedCounters};
pub use kse::{Kse, KseFlags, KseMailbox};
pub use kseg::{Kseg, KsegFlags, KsegState};
pub use lock::{Lock, LockHandler, LockOwner, LockUser};
pub use runq::{RunQueue, RunqEnd};
pub use sched_prim::Dispatch;
pub use thread::{Thread, ThreadAttr, ThreadInfo, ThreadState};
pub use waitq::WaitQueue;
pub use zalloc::{Zone, ZoneInfo, ZoneStats};

/// Report a broken invariant and abort
///
/// Reached through [`crate::sched_fatal!`]. The scheduler's state is not
/// trustworthy past this point, so there is no recovery.
#[cold]
pub fn fatal(args: fmt::Arguments<'_>) -> ! {
    log::error!("fatal scheduler error: {}", args);
    panic!("fatal scheduler error: {}", args)
}
