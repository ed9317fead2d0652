//! Host primitives consumed by the scheduler
//!
//! The scheduler never talks to the operating system directly; everything
//! it needs from below comes through the traits in this module. A [`Host`]
//! is anything that provides all three.

use alloc::sync::Arc;
use core::time::Duration;

use crate::error::KernelError;
use crate::kern::kse::KseMailbox;
use crate::types::{KseId, ThreadId};

/// Kernel-side KSE primitives
pub trait Kernel: Send + Sync {
    /// Start a new kernel-scheduled context that upcalls through `mailbox`
    ///
    /// `new_group` asks the kernel for a fresh scheduling group as well.
    fn kse_create(&self, mailbox: &Arc<KseMailbox>, new_group: bool) -> Result<(), KernelError>;

    /// Give up the calling KSE for at most `timeout`
    fn kse_release(&self, timeout: Duration);

    /// Wake a KSE parked in [`Kernel::kse_release`]
    fn kse_wakeup(&self, mailbox: &KseMailbox);

    /// Interrupt a thread blocked inside the kernel
    fn kse_thr_interrupt(&self, thread: ThreadId);

    /// Terminate the calling KSE's kernel presence
    fn kse_exit(&self);

    /// Kernel-maintained time of day
    fn time_of_day(&self) -> Duration;
}

/// Machine context transfer between a KSE and its threads
pub trait ContextSwitch: Send + Sync {
    /// Transfer `kse` to `thread`; returns once control re-enters the
    /// scheduler on that KSE
    fn switch_to(&self, kse: KseId, thread: ThreadId);

    /// Hand control from the running `thread` back to `kse`'s scheduler;
    /// returns once the thread is resumed
    fn switch_out(&self, kse: KseId, thread: ThreadId);
}

/// Signal delivery hook
pub trait SignalHook: Send + Sync {
    /// Dispatch pending signal `signo` on `kse`
    fn dispatch(&self, kse: KseId, signo: u32);
}

/// Everything the scheduler consumes from below
pub trait Host: Kernel + ContextSwitch + SignalHook {}

impl<T: Kernel + ContextSwitch + SignalHook> Host for T {}
