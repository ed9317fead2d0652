//! KSE Groups
//!
//! A KSE group is a scheduling domain: one or more KSEs sharing a thread
//! list, a priority run queue and a deadline-ordered wait queue. All of it
//! sits behind the group's scheduling lock and is reached only through a
//! [`SchedGuard`].
//!
//! ## Lock ordering
//!
//! A KSE holds at most one group scheduling lock at a time. Moving from one
//! group to another goes through [`SchedGuard::relock`], which releases
//! before it acquires. The process-wide thread list may be locked while a
//! group lock is held, never the other way around.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::ops::{Deref, DerefMut};
use core::time::Duration;

use bitflags::bitflags;

use crate::config::SchedConfig;
use crate::error::Result;
use crate::kern::kse::KseMailbox;
use crate::kern::kse_lock::{KseLock, KseWait};
use crate::kern::lock::LockUser;
use crate::kern::runq::{RunQueue, RunqEnd};
use crate::kern::thread::{Policy, Slice, Thread, ThreadFlags, ThreadState};
use crate::kern::waitq::WaitQueue;
use crate::types::{Deadline, KseId, KsegId, ThreadId};

bitflags! {
    /// KSE group flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct KsegFlags: u32 {
        /// Dedicated to one scope-system thread
        const SINGLE_THREAD = 1 << 0;
    }
}

// ============================================================================
// Group State
// ============================================================================

/// Everything guarded by a group's scheduling lock
#[derive(Debug)]
pub struct KsegState {
    pub flags: KsegFlags,
    /// Member KSEs
    pub kses: Vec<KseId>,
    /// Member threads, including the ones currently running
    pub threads: BTreeMap<ThreadId, Thread>,
    pub runq: RunQueue,
    pub waitq: WaitQueue,
    /// KSEs parked in the kernel with nothing to run, with their mailboxes
    pub idle_kses: Vec<(KseId, Arc<KseMailbox>)>,
    /// Threads not yet retired
    pub threadcount: usize,
}

/// What step 4 of a scheduling pass did with the previous thread
#[derive(Debug)]
pub enum Switchout {
    /// Dead; removed from the group and handed back for collection
    Retired(Thread),
    /// Blocked in the kernel; waits for a completion notice
    Blocked,
    /// Parked on the wait queue
    Waiting,
    /// Back on the run queue
    Requeued(RunqEnd),
    /// Already queued by someone else
    Unchanged,
}

impl KsegState {
    pub fn new(config: &SchedConfig) -> Result<Self> {
        Ok(Self {
            flags: KsegFlags::empty(),
            kses: Vec::new(),
            threads: BTreeMap::new(),
            runq: RunQueue::new(config.priority_levels, config.runq_capacity)?,
            waitq: WaitQueue::new(config.runq_capacity)?,
            idle_kses: Vec::new(),
            threadcount: 0,
        })
    }

    /// Empty the group for reuse, keeping queue storage
    pub fn reset(&mut self) {
        self.flags = KsegFlags::empty();
        self.kses.clear();
        self.threads.clear();
        self.runq.clear();
        self.waitq.clear();
        self.idle_kses.clear();
        self.threadcount = 0;
    }

    pub fn is_empty(&self) -> bool {
        self.kses.is_empty() && self.threads.is_empty()
    }

    pub fn thread(&self, thread: ThreadId) -> Option<&Thread> {
        self.threads.get(&thread)
    }

    pub fn thread_mut(&mut self, thread: ThreadId) -> Option<&mut Thread> {
        self.threads.get_mut(&thread)
    }

    // === Queue primitives ===
    //
    // These are the only places queue membership and the IN_RUNQ/IN_WAITQ
    // flags change, and they always change together.

    pub fn runq_insert(&mut self, thread: ThreadId, end: RunqEnd) -> Result<bool> {
        let Some(t) = self.threads.get_mut(&thread) else {
            return Ok(false);
        };
        if t.is_queued() {
            return Ok(false);
        }
        self.runq.insert(thread, t.priority, end)?;
        t.flags.insert(ThreadFlags::IN_RUNQ);
        Ok(true)
    }

    pub fn runq_remove(&mut self, thread: ThreadId) -> bool {
        let Some(t) = self.threads.get_mut(&thread) else {
            return false;
        };
        if !t.flags.contains(ThreadFlags::IN_RUNQ) {
            return false;
        }
        if !self.runq.remove(thread, t.priority) {
            crate::sched_fatal!("{} flagged IN_RUNQ but not on the run queue", thread);
        }
        t.flags.remove(ThreadFlags::IN_RUNQ);
        true
    }

    /// Pop the next thread to run
    pub fn runq_pop(&mut self) -> Option<ThreadId> {
        let thread = self.runq.pop()?;
        match self.threads.get_mut(&thread) {
            Some(t) => t.flags.remove(ThreadFlags::IN_RUNQ),
            None => crate::sched_fatal!("run queue names unknown {}", thread),
        }
        Some(thread)
    }

    pub fn waitq_insert(&mut self, thread: ThreadId) -> Result<bool> {
        let Some(t) = self.threads.get_mut(&thread) else {
            return Ok(false);
        };
        if t.is_queued() {
            return Ok(false);
        }
        self.waitq.insert(thread, t.wakeup)?;
        t.flags.insert(ThreadFlags::IN_WAITQ);
        Ok(true)
    }

    pub fn waitq_remove(&mut self, thread: ThreadId) -> bool {
        let Some(t) = self.threads.get_mut(&thread) else {
            return false;
        };
        if !t.flags.contains(ThreadFlags::IN_WAITQ) {
            return false;
        }
        if !self.waitq.remove(thread) {
            crate::sched_fatal!("{} flagged IN_WAITQ but not on the wait queue", thread);
        }
        t.flags.remove(ThreadFlags::IN_WAITQ);
        true
    }

    // === Transitions ===

    /// Make a thread `Running` and queue it if it is not on a KSE
    ///
    /// Returns true if the thread was put on the run queue.
    pub fn make_runnable(&mut self, thread: ThreadId) -> Result<bool> {
        self.waitq_remove(thread);
        let Some(t) = self.threads.get_mut(&thread) else {
            return Ok(false);
        };
        if t.state.is_terminal() {
            return Ok(false);
        }
        t.state = ThreadState::Running;
        t.lockwait = None;
        t.wakeup = Deadline::Never;
        if t.active || t.blocked {
            return Ok(false);
        }
        self.runq_insert(thread, RunqEnd::Tail)
    }

    /// Apply the kernel's completion notices
    ///
    /// Each named thread is no longer blocked in the kernel. Everything but
    /// `current` goes to the tail of the run queue.
    pub fn check_completed(&mut self, completed: &[ThreadId], current: Option<ThreadId>) -> Result<()> {
        for &thread in completed {
            let Some(t) = self.threads.get_mut(&thread) else {
                log::warn!("completion for unknown {}", thread);
                continue;
            };
            t.blocked = false;
            if Some(thread) != current && t.state == ThreadState::Running && !t.active {
                self.runq_insert(thread, RunqEnd::Tail)?;
            }
        }
        Ok(())
    }

    /// Move every wait-queue entry whose deadline has passed to the run
    /// queue; returns how many timed out
    pub fn check_waitq(&mut self, now: Duration) -> Result<usize> {
        let mut expired = 0;
        while let Some(thread) = self.waitq.pop_expired(now) {
            let Some(t) = self.threads.get_mut(&thread) else {
                crate::sched_fatal!("wait queue names unknown {}", thread);
            };
            t.flags.remove(ThreadFlags::IN_WAITQ);
            t.flags.insert(ThreadFlags::TIMEDOUT);
            t.state = ThreadState::Running;
            t.wakeup = Deadline::Never;
            if !t.active && !t.blocked {
                self.runq_insert(thread, RunqEnd::Tail)?;
            }
            expired += 1;
        }
        Ok(expired)
    }

    /// Step 4 of a scheduling pass: file away the thread that just left
    /// its KSE
    pub fn switchout_thread(&mut self, thread: ThreadId, quantum: Duration) -> Result<Switchout> {
        let Some(t) = self.threads.get_mut(&thread) else {
            crate::sched_fatal!("switching out unknown {}", thread);
        };
        t.active = false;
        t.need_switchout = false;

        if t.state.is_terminal() {
            let Some(retired) = self.threads.remove(&thread) else {
                crate::sched_fatal!("{} vanished during switch-out", thread);
            };
            if retired.is_queued() {
                crate::sched_fatal!("dead {} is still queued", thread);
            }
            self.threadcount -= 1;
            return Ok(Switchout::Retired(retired));
        }

        let used = t.shared.take_cpu_time();
        if let Slice::Used(total) = t.slice {
            t.slice = Slice::Used(total.saturating_add(used));
        }
        if t.blocked {
            return Ok(Switchout::Blocked);
        }
        if t.is_queued() {
            return Ok(Switchout::Unchanged);
        }

        match t.state {
            ThreadState::Running => {}
            ThreadState::CondWait | ThreadState::SleepWait => {
                self.waitq_insert(thread)?;
                return Ok(Switchout::Waiting);
            }
            ThreadState::LockWait => {
                if t.lockwait.as_ref().is_some_and(|user| user.is_waiting()) {
                    t.wakeup = Deadline::Never;
                    self.waitq_insert(thread)?;
                    return Ok(Switchout::Waiting);
                }
                t.state = ThreadState::Running;
                t.lockwait = None;
            }
            ThreadState::Join
            | ThreadState::MutexWait
            | ThreadState::SigSuspend
            | ThreadState::SigWait
            | ThreadState::Suspended
            | ThreadState::Deadlock => {
                t.wakeup = Deadline::Never;
                self.waitq_insert(thread)?;
                return Ok(Switchout::Waiting);
            }
            ThreadState::Dead => crate::sched_fatal!("dead {} survived retirement", thread),
        }

        // FIFO threads are not time-sliced
        let end = match t.slice {
            Slice::Used(total) if total <= quantum || t.attr.policy == Policy::Fifo => RunqEnd::Head,
            _ => {
                t.slice = Slice::Used(Duration::ZERO);
                RunqEnd::Tail
            }
        };
        self.runq_insert(thread, end)?;
        Ok(Switchout::Requeued(end))
    }

    /// Pick an idle KSE to wake for new work
    pub fn idle_kse(&self) -> Option<Arc<KseMailbox>> {
        self.idle_kses.first().map(|(_, mailbox)| mailbox.clone())
    }

    /// Queue membership agrees with the flags of every thread
    pub fn queues_consistent(&self) -> bool {
        let runq_ok = self.runq.iter().all(|id| {
            self.threads
                .get(&id)
                .is_some_and(|t| t.flags.contains(ThreadFlags::IN_RUNQ))
        });
        let waitq_ok = self.waitq.iter().all(|(_, id)| {
            self.threads
                .get(&id)
                .is_some_and(|t| t.flags.contains(ThreadFlags::IN_WAITQ))
        });
        let flags_ok = self.threads.values().all(|t| {
            !t.flags.contains(ThreadFlags::QUEUED)
                && t.flags.contains(ThreadFlags::IN_RUNQ) == self.runq.contains(t.id)
                && t.flags.contains(ThreadFlags::IN_WAITQ) == self.waitq.contains(t.id)
        });
        runq_ok && waitq_ok && flags_ok && self.runq.len() + self.waitq.len() <= self.threads.len()
    }
}

// ============================================================================
// KSE Group
// ============================================================================

#[derive(Debug)]
pub struct Kseg {
    id: KsegId,
    sched: KseLock<KsegState>,
}

impl Kseg {
    pub fn new(id: KsegId, config: &SchedConfig) -> Result<Self> {
        Ok(Self::with_state(id, KsegState::new(config)?))
    }

    pub(crate) fn with_state(id: KsegId, state: KsegState) -> Self {
        Self {
            id,
            sched: KseLock::new("kseg", state),
        }
    }

    /// Reinitialize a cached group under a new identity, keeping its queue
    /// storage
    pub fn recycle(self, id: KsegId) -> Self {
        let mut state = self.sched.into_inner();
        state.reset();
        Self::with_state(id, state)
    }

    pub fn id(&self) -> KsegId {
        self.id
    }

    /// Acquire the scheduling lock for `wait`'s KSE
    pub fn lock<'a>(self: &Arc<Self>, wait: KseWait<'a>) -> SchedGuard<'a> {
        wait.kse().enter_sched();
        let user = self.sched.acquire_raw(&wait);
        SchedGuard {
            kseg: self.clone(),
            user,
            wait,
        }
    }

    /// Drop any holder left behind by contexts that no longer exist
    pub(crate) fn break_lock(&self) {
        self.sched.raw().reinit();
    }
}

/// Holds one group's scheduling lock
pub struct SchedGuard<'a> {
    kseg: Arc<Kseg>,
    user: Arc<LockUser>,
    wait: KseWait<'a>,
}

impl<'a> SchedGuard<'a> {
    pub fn kseg(&self) -> &Arc<Kseg> {
        &self.kseg
    }

    pub fn id(&self) -> KsegId {
        self.kseg.id
    }

    /// Move to another group's lock: this one is released first
    pub fn relock(self, other: &Arc<Kseg>) -> SchedGuard<'a> {
        let wait = self.wait;
        drop(self);
        other.lock(wait)
    }
}

impl Deref for SchedGuard<'_> {
    type Target = KsegState;

    fn deref(&self) -> &KsegState {
        // SAFETY: the guard holds the group's scheduling lock.
        unsafe { &*self.kseg.sched.data_ptr() }
    }
}

impl DerefMut for SchedGuard<'_> {
    fn deref_mut(&mut self) -> &mut KsegState {
        // SAFETY: the guard holds the group's scheduling lock exclusively.
        unsafe { &mut *self.kseg.sched.data_ptr() }
    }
}

impl Drop for SchedGuard<'_> {
    fn drop(&mut self) {
        self.kseg.sched.release_raw(&self.user, &self.wait);
        self.wait.kse().leave_sched();
    }
}
