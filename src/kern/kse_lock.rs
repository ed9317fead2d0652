//! Entity-level locks
//!
//! These protect state shared between KSEs: group scheduling queues and the
//! process-wide thread list. The holder is always a KSE. A KSE that finds
//! the lock busy disables upcalls on itself and releases itself to the
//! kernel until the releaser hands the lock over and wakes it.

use alloc::sync::Arc;
use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::time::Duration;

use crate::host::Kernel;
use crate::kern::kse::{Kse, MailboxFlags};
use crate::kern::lock::{Lock, LockHandler, LockOwner, LockUser};

// ============================================================================
// Wait/Wakeup
// ============================================================================

/// Entity-level wait/wakeup on behalf of one KSE
#[derive(Clone, Copy)]
pub struct KseWait<'a> {
    kse: &'a Kse,
    kernel: &'a dyn Kernel,
    period: Duration,
}

impl<'a> KseWait<'a> {
    /// `period` bounds each kernel release while waiting
    pub fn new(kse: &'a Kse, kernel: &'a dyn Kernel, period: Duration) -> Self {
        Self {
            kse,
            kernel,
            period,
        }
    }

    pub fn kse(&self) -> &'a Kse {
        self.kse
    }
}

impl LockHandler for KseWait<'_> {
    fn wait(&self, _lock: &Lock, user: &Arc<LockUser>) {
        let mailbox = self.kse.mailbox();
        let saved = mailbox.insert_flags(MailboxFlags::NO_UPCALL);
        while user.is_waiting() {
            self.kernel.kse_release(self.period);
        }
        mailbox.set_flags(saved);
    }

    fn wakeup(&self, lock: &Lock, waiter: &Arc<LockUser>) {
        match waiter.owner() {
            LockOwner::Kse(kse) if kse == self.kse.id() => {
                crate::sched_fatal!("{}: {} woke itself", lock.name(), kse)
            }
            LockOwner::Kse(_) => match waiter.mailbox() {
                Some(mailbox) => self.kernel.kse_wakeup(mailbox),
                None => crate::sched_fatal!("{}: KSE waiter without a mailbox", lock.name()),
            },
            LockOwner::Thread(thread) => {
                crate::sched_fatal!("{}: thread {} on an entity lock", lock.name(), thread)
            }
        }
    }
}

// ============================================================================
// Data-carrying lock
// ============================================================================

/// Entity-level lock guarding a `T`
pub struct KseLock<T> {
    lock: Lock,
    data: UnsafeCell<T>,
}

// SAFETY: `data` is only reached through a guard, which holds `lock`.
unsafe impl<T: Send> Send for KseLock<T> {}
unsafe impl<T: Send> Sync for KseLock<T> {}

impl<T> KseLock<T> {
    pub const fn new(name: &'static str, data: T) -> Self {
        Self {
            lock: Lock::new(name),
            data: UnsafeCell::new(data),
        }
    }

    pub fn raw(&self) -> &Lock {
        &self.lock
    }

    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }

    /// Acquire on behalf of `wait`'s KSE
    pub fn lock<'a>(&'a self, wait: KseWait<'a>) -> KseLockGuard<'a, T> {
        let user = self.acquire_raw(&wait);
        KseLockGuard {
            lock: self,
            user,
            wait,
        }
    }

    pub(crate) fn acquire_raw(&self, wait: &KseWait<'_>) -> Arc<LockUser> {
        let user = wait.kse.lock_users().enter();
        self.lock.acquire(&user, wait);
        user
    }

    pub(crate) fn release_raw(&self, user: &Arc<LockUser>, wait: &KseWait<'_>) {
        self.lock.release(user, wait);
        let innermost = wait.kse.lock_users().leave();
        if !Arc::ptr_eq(&innermost, user) {
            crate::sched_fatal!("{}: entity locks released out of order", self.lock.name());
        }
    }

    /// Data pointer; only dereferenced while `lock` is held
    pub(crate) fn data_ptr(&self) -> *mut T {
        self.data.get()
    }
}

impl<T: core::fmt::Debug> core::fmt::Debug for KseLock<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("KseLock")
            .field("lock", &self.lock)
            .finish_non_exhaustive()
    }
}

/// Holds a [`KseLock`] until dropped
pub struct KseLockGuard<'a, T> {
    lock: &'a KseLock<T>,
    user: Arc<LockUser>,
    wait: KseWait<'a>,
}

impl<T> KseLockGuard<'_, T> {
    pub fn kse(&self) -> &Kse {
        self.wait.kse
    }
}

impl<T> Deref for KseLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the guard holds the lock.
        unsafe { &*self.lock.data_ptr() }
    }
}

impl<T> DerefMut for KseLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: the guard holds the lock exclusively.
        unsafe { &mut *self.lock.data_ptr() }
    }
}

impl<T> Drop for KseLockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.release_raw(&self.user, &self.wait);
    }
}
