//! Locking Primitives
//!
//! A [`Lock`] is a busy flag with a FIFO of waiting lock users. What a
//! waiter does while it waits, and how it is woken, is not decided here: the
//! caller passes a [`LockHandler`] that supplies both halves. Two handlers
//! exist:
//!
//! - the entity-level handler ([`crate::kern::kse_lock`]) parks the calling
//!   KSE in the kernel until the lock is handed to it
//! - the thread-level handler ([`crate::kern::thr_lock`]) spins briefly,
//!   then switches the calling thread out in `LockWait`
//!
//! Release hands the lock straight to the oldest waiter. The flag never
//! drops in between, so a waiter that was granted the lock cannot lose it to
//! a newcomer.
//!
//! Every lock holder is represented by a [`LockUser`]. KSEs and threads each
//! keep a small fixed stack of users, one per nesting level
//! ([`LockLevels`]).

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::kern::kse::KseMailbox;
use crate::types::{KseId, ThreadId};

/// Deepest entity-level lock nesting per KSE
pub const MAX_KSE_LOCKLEVEL: usize = 5;

/// Deepest thread-level lock nesting per thread
pub const MAX_THR_LOCKLEVEL: usize = 5;

// ============================================================================
// Lock Users
// ============================================================================

/// Who holds or waits for a lock
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockOwner {
    Kse(KseId),
    Thread(ThreadId),
}

/// One acquisition slot of a KSE or thread
#[derive(Debug)]
pub struct LockUser {
    owner: LockOwner,
    waiting: AtomicBool,
    /// Where a parked KSE waiter is woken
    mailbox: Option<Arc<KseMailbox>>,
}

impl LockUser {
    pub fn for_kse(kse: KseId, mailbox: Arc<KseMailbox>) -> Self {
        Self {
            owner: LockOwner::Kse(kse),
            waiting: AtomicBool::new(false),
            mailbox: Some(mailbox),
        }
    }

    pub fn for_thread(thread: ThreadId) -> Self {
        Self {
            owner: LockOwner::Thread(thread),
            waiting: AtomicBool::new(false),
            mailbox: None,
        }
    }

    pub fn owner(&self) -> LockOwner {
        self.owner
    }

    /// True while queued behind another holder
    pub fn is_waiting(&self) -> bool {
        self.waiting.load(Ordering::Acquire)
    }

    pub fn mailbox(&self) -> Option<&Arc<KseMailbox>> {
        self.mailbox.as_ref()
    }
}

/// Fixed stack of lock users, one per nesting level
#[derive(Debug)]
pub struct LockLevels<const N: usize> {
    users: heapless::Vec<Arc<LockUser>, N>,
    level: AtomicUsize,
}

impl<const N: usize> LockLevels<N> {
    pub fn new(mut make: impl FnMut() -> LockUser) -> Self {
        let mut users = heapless::Vec::new();
        while !users.is_full() {
            if users.push(Arc::new(make())).is_err() {
                break;
            }
        }
        Self {
            users,
            level: AtomicUsize::new(0),
        }
    }

    /// Number of locks currently held or being acquired
    pub fn level(&self) -> usize {
        self.level.load(Ordering::Acquire)
    }

    /// Claim the user for the next nesting level
    pub fn enter(&self) -> Arc<LockUser> {
        let level = self.level.fetch_add(1, Ordering::AcqRel);
        match self.users.get(level) {
            Some(user) => user.clone(),
            None => crate::sched_fatal!("lock nesting exceeds {} levels", N),
        }
    }

    /// Give back the innermost user
    pub fn leave(&self) -> Arc<LockUser> {
        let level = self.level.load(Ordering::Acquire);
        if level == 0 {
            crate::sched_fatal!("lock level underflow");
        }
        self.level.store(level - 1, Ordering::Release);
        self.users[level - 1].clone()
    }

    pub fn reset(&self) {
        self.level.store(0, Ordering::Release);
        for user in &self.users {
            user.waiting.store(false, Ordering::Release);
        }
    }
}

// ============================================================================
// Wait/Wakeup Callbacks
// ============================================================================

/// The pluggable half of a lock
pub trait LockHandler {
    /// Wait until `user` is no longer waiting on `lock`
    fn wait(&self, lock: &Lock, user: &Arc<LockUser>);

    /// `waiter` has just been handed `lock`; make it run again
    fn wakeup(&self, lock: &Lock, waiter: &Arc<LockUser>);
}

// ============================================================================
// Lock
// ============================================================================

#[derive(Debug, Default)]
struct LockState {
    owner: Option<LockOwner>,
    waiters: VecDeque<Arc<LockUser>>,
}

/// Busy-flag lock with pluggable wait/wakeup
#[derive(Debug)]
pub struct Lock {
    name: &'static str,
    busy: AtomicBool,
    interlock: spin::Mutex<LockState>,
}

impl Lock {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            busy: AtomicBool::new(false),
            interlock: spin::Mutex::new(LockState {
                owner: None,
                waiters: VecDeque::new(),
            }),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    pub fn owner(&self) -> Option<LockOwner> {
        self.interlock.lock().owner
    }

    pub fn waiters(&self) -> usize {
        self.interlock.lock().waiters.len()
    }

    /// Take the lock if it is free
    pub fn try_acquire(&self, user: &Arc<LockUser>) -> bool {
        let mut state = self.interlock.lock();
        self.check_recursion(&state, user);
        if self.busy.load(Ordering::Acquire) {
            return false;
        }
        self.busy.store(true, Ordering::Release);
        state.owner = Some(user.owner);
        true
    }

    /// Take the lock, waiting through `handler` while it is busy
    pub fn acquire(&self, user: &Arc<LockUser>, handler: &dyn LockHandler) {
        {
            let mut state = self.interlock.lock();
            self.check_recursion(&state, user);
            if !self.busy.load(Ordering::Acquire) {
                self.busy.store(true, Ordering::Release);
                state.owner = Some(user.owner);
                return;
            }
            user.waiting.store(true, Ordering::Release);
            state.waiters.push_back(user.clone());
        }

        log::trace!("{}: {:?} waits", self.name, user.owner);
        while user.is_waiting() {
            handler.wait(self, user);
        }
    }

    /// Release the lock held through `user`, handing it to the next waiter
    pub fn release(&self, user: &Arc<LockUser>, handler: &dyn LockHandler) {
        let next = {
            let mut state = self.interlock.lock();
            if state.owner != Some(user.owner) {
                crate::sched_fatal!(
                    "{}: released by {:?}, held by {:?}",
                    self.name,
                    user.owner,
                    state.owner
                );
            }
            match state.waiters.pop_front() {
                Some(next) => {
                    state.owner = Some(next.owner);
                    next.waiting.store(false, Ordering::Release);
                    Some(next)
                }
                None => {
                    state.owner = None;
                    self.busy.store(false, Ordering::Release);
                    None
                }
            }
        };

        if let Some(next) = next {
            self.wakeup(user.owner, &next, handler);
        }
    }

    /// Wake a waiter that has been handed the lock by `releaser`
    pub fn wakeup(&self, releaser: LockOwner, waiter: &Arc<LockUser>, handler: &dyn LockHandler) {
        if waiter.owner == releaser {
            crate::sched_fatal!("{}: {:?} tried to wake itself", self.name, releaser);
        }
        handler.wakeup(self, waiter);
    }

    /// Forget every holder and waiter (fork reset)
    pub fn reinit(&self) {
        let mut state = self.interlock.lock();
        state.owner = None;
        state.waiters.clear();
        self.busy.store(false, Ordering::Release);
    }

    fn check_recursion(&self, state: &LockState, user: &LockUser) {
        if state.owner == Some(user.owner) {
            crate::sched_fatal!("{}: recursive acquire by {:?}", self.name, user.owner);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Handle;
    use core::cell::RefCell;

    /// Records wakeups; never expected to wait
    #[derive(Default)]
    struct Recorder {
        woken: RefCell<alloc::vec::Vec<LockOwner>>,
    }

    impl LockHandler for Recorder {
        fn wait(&self, _lock: &Lock, _user: &Arc<LockUser>) {
            panic!("unexpected wait");
        }

        fn wakeup(&self, _lock: &Lock, waiter: &Arc<LockUser>) {
            self.woken.borrow_mut().push(waiter.owner());
        }
    }

    fn user(n: u32) -> Arc<LockUser> {
        Arc::new(LockUser::for_thread(ThreadId::from_parts(n, 0)))
    }

    #[test]
    fn test_uncontended() {
        let lock = Lock::new("test");
        let handler = Recorder::default();
        let a = user(1);

        lock.acquire(&a, &handler);
        assert!(lock.is_busy());
        assert_eq!(lock.owner(), Some(a.owner()));

        lock.release(&a, &handler);
        assert!(!lock.is_busy());
        assert!(handler.woken.borrow().is_empty());
    }

    #[test]
    fn test_handoff_in_fifo_order() {
        let lock = Lock::new("test");
        let handler = Recorder::default();
        let (a, b, c) = (user(1), user(2), user(3));

        assert!(lock.try_acquire(&a));
        assert!(!lock.try_acquire(&b));

        // Queue b then c without blocking the test
        {
            let mut state = lock.interlock.lock();
            for waiter in [&b, &c] {
                waiter.waiting.store(true, Ordering::Release);
                state.waiters.push_back(waiter.clone());
            }
        }

        lock.release(&a, &handler);
        assert!(lock.is_busy());
        assert!(!b.is_waiting());
        assert!(c.is_waiting());
        assert_eq!(lock.owner(), Some(b.owner()));

        lock.release(&b, &handler);
        lock.release(&c, &handler);
        assert!(!lock.is_busy());
        assert_eq!(*handler.woken.borrow(), [b.owner(), c.owner()]);
    }

    #[test]
    #[should_panic]
    fn test_recursive_acquire_is_fatal() {
        let lock = Lock::new("test");
        let a = user(1);
        assert!(lock.try_acquire(&a));
        lock.try_acquire(&a);
    }

    #[test]
    #[should_panic]
    fn test_release_by_non_owner_is_fatal() {
        let lock = Lock::new("test");
        let handler = Recorder::default();
        assert!(lock.try_acquire(&user(1)));
        lock.release(&user(2), &handler);
    }

    #[test]
    #[should_panic]
    fn test_self_wakeup_is_fatal() {
        let lock = Lock::new("test");
        let handler = Recorder::default();
        let a = user(1);
        assert!(lock.try_acquire(&a));
        lock.wakeup(a.owner(), &a, &handler);
    }

    #[test]
    fn test_lock_levels() {
        let levels: LockLevels<2> = LockLevels::new(|| LockUser::for_thread(ThreadId::from_parts(1, 0)));
        let first = levels.enter();
        let second = levels.enter();
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(levels.level(), 2);
        assert!(Arc::ptr_eq(&levels.leave(), &second));
        assert!(Arc::ptr_eq(&levels.leave(), &first));
    }

    #[test]
    #[should_panic]
    fn test_lock_level_overflow_is_fatal() {
        let levels: LockLevels<1> = LockLevels::new(|| LockUser::for_thread(ThreadId::from_parts(1, 0)));
        levels.enter();
        levels.enter();
    }
}
