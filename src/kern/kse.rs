//! Kernel-Scheduled Entities
//!
//! A KSE is an execution context the kernel runs independently. It enters
//! the scheduler on every upcall, picks a thread of its group and runs it.
//!
//! The kernel and the scheduler talk through the KSE's [`KseMailbox`]: the
//! scheduler records which thread is current, and the kernel reports
//! threads whose blocking calls completed and signals that are pending.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use bitflags::bitflags;

use crate::error::{Result, SchedError};
use crate::kern::critical::CriticalCounter;
use crate::kern::lock::{LockLevels, LockUser, MAX_KSE_LOCKLEVEL};
use crate::kern::stack::Stack;
use crate::types::{Handle, KseId, KsegId, ThreadId};

/// Signals are numbered `0..MAX_SIGNALS` in the pending bitmap
pub const MAX_SIGNALS: u32 = 64;

bitflags! {
    /// KSE lifecycle flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct KseFlags: u32 {
        /// Has entered the scheduler at least once
        const STARTED = 1 << 0;
        /// Mailbox and stack are set up
        const INITIALIZED = 1 << 1;
        /// Has left, or is leaving, the kernel
        const EXITED = 1 << 2;
        /// Parked in the kernel waiting for work
        const WAITING = 1 << 3;
    }
}

bitflags! {
    /// Mailbox flags read by the kernel
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct MailboxFlags: u32 {
        /// Do not upcall into this KSE
        const NO_UPCALL = 1 << 0;
    }
}

// ============================================================================
// Mailbox
// ============================================================================

/// Shared area between a KSE and the kernel
#[derive(Debug, Default)]
pub struct KseMailbox {
    kse: AtomicU64,
    curthread: spin::Mutex<Option<ThreadId>>,
    completed: spin::Mutex<Vec<ThreadId>>,
    flags: AtomicU32,
    sigpending: AtomicU64,
    critical: CriticalCounter,
}

impl KseMailbox {
    pub fn new(kse: KseId) -> Self {
        Self {
            kse: AtomicU64::new(kse.to_bits()),
            ..Self::default()
        }
    }

    /// KSE this mailbox belongs to
    pub fn kse(&self) -> KseId {
        KseId::from_bits(self.kse.load(Ordering::Acquire))
    }

    pub fn curthread(&self) -> Option<ThreadId> {
        *self.curthread.lock()
    }

    pub fn set_curthread(&self, thread: Option<ThreadId>) {
        *self.curthread.lock() = thread;
    }

    pub fn take_curthread(&self) -> Option<ThreadId> {
        self.curthread.lock().take()
    }

    /// Report a thread whose blocking kernel call has completed
    pub fn deliver_completed(&self, thread: ThreadId) -> Result<()> {
        let mut completed = self.completed.lock();
        completed
            .try_reserve(1)
            .map_err(|_| SchedError::NoMemory("completion list"))?;
        completed.push(thread);
        Ok(())
    }

    /// Take every completion reported so far, in delivery order
    pub fn take_completed(&self) -> Vec<ThreadId> {
        core::mem::take(&mut *self.completed.lock())
    }

    pub fn flags(&self) -> MailboxFlags {
        MailboxFlags::from_bits_truncate(self.flags.load(Ordering::Acquire))
    }

    pub fn set_flags(&self, flags: MailboxFlags) {
        self.flags.store(flags.bits(), Ordering::Release);
    }

    pub fn insert_flags(&self, flags: MailboxFlags) -> MailboxFlags {
        MailboxFlags::from_bits_truncate(self.flags.fetch_or(flags.bits(), Ordering::AcqRel))
    }

    pub fn remove_flags(&self, flags: MailboxFlags) {
        self.flags.fetch_and(!flags.bits(), Ordering::AcqRel);
    }

    /// Mark `signo` pending; returns false if it already was
    pub fn post_signal(&self, signo: u32) -> Result<bool> {
        if signo >= MAX_SIGNALS {
            return Err(SchedError::InvalidSignal(signo));
        }
        let bit = 1u64 << signo;
        Ok(self.sigpending.fetch_or(bit, Ordering::AcqRel) & bit == 0)
    }

    /// Clear and return the lowest pending signal
    pub fn next_signal(&self) -> Option<u32> {
        let mut pending = self.sigpending.load(Ordering::Acquire);
        while pending != 0 {
            let signo = pending.trailing_zeros();
            let bit = 1u64 << signo;
            match self.sigpending.compare_exchange_weak(
                pending,
                pending & !bit,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Some(signo),
                Err(now) => pending = now,
            }
        }
        None
    }

    pub fn pending_signals(&self) -> u64 {
        self.sigpending.load(Ordering::Acquire)
    }

    /// KSE-level critical-section counter
    pub fn critical(&self) -> &CriticalCounter {
        &self.critical
    }
}

// ============================================================================
// KSE
// ============================================================================

#[derive(Debug)]
pub struct Kse {
    id: KseId,
    flags: AtomicU32,
    kseg: spin::Mutex<Option<KsegId>>,
    mailbox: Arc<KseMailbox>,
    stack: Stack,
    lock_users: LockLevels<MAX_KSE_LOCKLEVEL>,
    sched_held: AtomicBool,
}

impl Kse {
    /// Build a fresh KSE with its own upcall stack
    pub fn new(id: KseId, stack_size: usize) -> Result<Self> {
        Ok(Self::with_stack(id, Stack::new(stack_size)?))
    }

    /// Reinitialize a cached KSE under a new identity, keeping its stack
    pub fn recycle(self, id: KseId) -> Self {
        Self::with_stack(id, self.stack)
    }

    pub(crate) fn with_stack(id: KseId, stack: Stack) -> Self {
        let mailbox = Arc::new(KseMailbox::new(id));
        let lock_users = LockLevels::new(|| LockUser::for_kse(id, mailbox.clone()));
        Self {
            id,
            flags: AtomicU32::new(KseFlags::INITIALIZED.bits()),
            kseg: spin::Mutex::new(None),
            mailbox,
            stack,
            lock_users,
            sched_held: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> KseId {
        self.id
    }

    pub fn flags(&self) -> KseFlags {
        KseFlags::from_bits_truncate(self.flags.load(Ordering::Acquire))
    }

    pub fn has_flags(&self, flags: KseFlags) -> bool {
        self.flags().contains(flags)
    }

    pub fn insert_flags(&self, flags: KseFlags) {
        self.flags.fetch_or(flags.bits(), Ordering::AcqRel);
    }

    pub fn remove_flags(&self, flags: KseFlags) {
        self.flags.fetch_and(!flags.bits(), Ordering::AcqRel);
    }

    /// Group this KSE schedules for
    pub fn kseg(&self) -> Option<KsegId> {
        *self.kseg.lock()
    }

    pub(crate) fn set_kseg(&self, kseg: Option<KsegId>) {
        *self.kseg.lock() = kseg;
    }

    pub fn mailbox(&self) -> &Arc<KseMailbox> {
        &self.mailbox
    }

    pub fn stack(&self) -> &Stack {
        &self.stack
    }

    pub fn lock_users(&self) -> &LockLevels<MAX_KSE_LOCKLEVEL> {
        &self.lock_users
    }

    /// Note that this KSE now holds a group scheduling lock
    pub(crate) fn enter_sched(&self) {
        if self.sched_held.swap(true, Ordering::AcqRel) {
            crate::sched_fatal!("{} nested two group scheduling locks", self.id);
        }
    }

    pub(crate) fn leave_sched(&self) {
        self.sched_held.store(false, Ordering::Release);
    }
}
