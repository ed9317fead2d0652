//! Thread-level locks
//!
//! Locks taken by user threads (mutex internals, condition variable queues)
//! are held by threads, not KSEs. A thread that finds one busy spins for a
//! while, then switches out in `LockWait`; the releaser makes it runnable
//! once the lock has been handed over. Holding a thread-level lock keeps the
//! thread in a critical region, so a yield requested meanwhile is deferred
//! to the release.

use alloc::sync::Arc;

use crate::error::Result;
use crate::host::Host;
use crate::kern::lock::{Lock, LockHandler, LockOwner, LockUser};
use crate::kern::thread::ThreadState;
use crate::scheduler::Scheduler;
use crate::types::{KseId, ThreadId};

/// Thread-level wait/wakeup on behalf of one running thread
pub struct ThrWait<'a, H: Host> {
    sched: &'a Scheduler<H>,
    kse: KseId,
    thread: ThreadId,
}

impl<'a, H: Host> ThrWait<'a, H> {
    pub fn new(sched: &'a Scheduler<H>, kse: KseId, thread: ThreadId) -> Self {
        Self { sched, kse, thread }
    }
}

impl<H: Host> LockHandler for ThrWait<'_, H> {
    fn wait(&self, lock: &Lock, user: &Arc<LockUser>) {
        for _ in 0..self.sched.config.lock_spin_count {
            if !user.is_waiting() {
                return;
            }
            core::hint::spin_loop();
        }
        if let Err(err) = self.sched.lock_wait(self.kse, self.thread, user) {
            crate::sched_fatal!("{}: {} cannot wait: {}", lock.name(), self.thread, err);
        }
    }

    fn wakeup(&self, lock: &Lock, waiter: &Arc<LockUser>) {
        match waiter.owner() {
            LockOwner::Thread(thread) if thread == self.thread => {
                crate::sched_fatal!("{}: {} woke itself", lock.name(), thread)
            }
            LockOwner::Thread(thread) => {
                if let Err(err) = self.sched.setrunnable(self.kse, thread) {
                    log::warn!("{}: cannot wake {}: {}", lock.name(), thread, err);
                }
            }
            LockOwner::Kse(kse) => {
                crate::sched_fatal!("{}: {} on a thread-level lock", lock.name(), kse)
            }
        }
    }
}

impl<H: Host> Scheduler<H> {
    /// Acquire `lock` for the running `thread`
    pub fn thr_lock_acquire(&self, caller: KseId, thread: ThreadId, lock: &Lock) -> Result<()> {
        let kse = self.kse(caller)?;
        let shared = self.thread_shared(&kse, thread)?;
        drop(kse);

        shared.critical().enter();
        let user = shared.lock_users().enter();
        lock.acquire(&user, &ThrWait::new(self, caller, thread));
        Ok(())
    }

    /// Release `lock`, carrying out a yield deferred while it was held
    pub fn thr_lock_release(&self, caller: KseId, thread: ThreadId, lock: &Lock) -> Result<()> {
        let kse = self.kse(caller)?;
        let shared = self.thread_shared(&kse, thread)?;
        drop(kse);

        let user = shared.lock_users().leave();
        lock.release(&user, &ThrWait::new(self, caller, thread));
        if shared.critical().leave() {
            self.yield_now(caller, thread)?;
        }
        Ok(())
    }

    /// Switch a waiter out until the lock is handed to it
    pub(crate) fn lock_wait(&self, caller: KseId, thread: ThreadId, user: &Arc<LockUser>) -> Result<()> {
        let kse = self.kse(caller)?;
        {
            let mut guard = self.lock_thread(&kse, thread)?;
            if !user.is_waiting() {
                return Ok(());
            }
            if let Some(t) = guard.thread_mut(thread) {
                Self::check_running(t, caller)?;
                t.state = ThreadState::LockWait;
                t.lockwait = Some(user.clone());
                t.need_switchout = true;
            }
        }
        self.counters.voluntary_switchouts.inc();
        self.host.switch_out(caller, thread);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SchedConfig;
    use crate::kern::sched_prim::Dispatch;
    use crate::kern::thread::ThreadAttr;
    use crate::testing::NullHost;
    use crate::types::Handle;

    fn sched() -> Scheduler<NullHost> {
        let config = SchedConfig::new()
            .with_kse_stack_size(4096)
            .with_thread_stack_size(4096)
            .with_lock_spin_count(10);
        Scheduler::new(NullHost::default(), config).unwrap()
    }

    #[test]
    fn test_uncontended_acquire_is_critical() {
        let sched = sched();
        let me = sched.initial_kse();
        let t = sched.create_thread(me, ThreadAttr::new()).unwrap();
        assert_eq!(sched.sched_pass(me).unwrap(), Dispatch::Resume(t));

        let lock = Lock::new("mutex");
        sched.thr_lock_acquire(me, t, &lock).unwrap();
        assert_eq!(lock.owner(), Some(LockOwner::Thread(t)));
        assert_eq!(sched.thread_info(me, t).unwrap().critical_depth, 1);

        // Yield is held back until the lock is dropped
        assert!(!sched.yield_now(me, t).unwrap());
        sched.thr_lock_release(me, t, &lock).unwrap();
        assert!(!lock.is_busy());
        assert_eq!(sched.thread_info(me, t).unwrap().critical_depth, 0);
        assert_eq!(sched.snapshot().voluntary_switchouts, 1);
    }

    #[test]
    fn test_contended_waiter_switches_out_and_is_handed_the_lock() {
        let sched = sched();
        let k1 = sched.initial_kse();
        let a = sched.create_thread(k1, ThreadAttr::new()).unwrap();
        let b = sched.create_thread(k1, ThreadAttr::new()).unwrap();
        assert_eq!(sched.sched_pass(k1).unwrap(), Dispatch::Resume(a));
        let k2 = sched.spawn_kse(sched.initial_kseg()).unwrap();
        assert_eq!(sched.sched_pass(k2).unwrap(), Dispatch::Resume(b));

        let lock = Lock::new("mutex");
        sched.thr_lock_acquire(k1, a, &lock).unwrap();
        std::thread::scope(|s| {
            let waiter = s.spawn(|| sched.thr_lock_acquire(k2, b, &lock));
            while lock.waiters() == 0 {
                core::hint::spin_loop();
            }
            sched.thr_lock_release(k1, a, &lock).unwrap();
            waiter.join().unwrap().unwrap();
        });

        assert_eq!(lock.owner(), Some(LockOwner::Thread(b)));
        let info = sched.thread_info(k1, b).unwrap();
        assert_eq!(info.state, ThreadState::Running);
        sched.thr_lock_release(k2, b, &lock).unwrap();
    }

    #[test]
    #[should_panic]
    fn test_entity_waiter_on_thread_lock_is_fatal() {
        let sched = sched();
        let me = sched.initial_kse();
        let handler = ThrWait::new(&sched, me, ThreadId::from_parts(0, 0));
        let kse = sched.kse(me).unwrap();
        let waiter = kse.lock_users().enter();
        handler.wakeup(&Lock::new("mutex"), &waiter);
    }
}
