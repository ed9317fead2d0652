//! Scheduling primitives
//!
//! Every time a KSE enters the scheduler (an upcall, or a thread giving up
//! the CPU) it runs one scheduling pass over its group:
//!
//! 1. The thread it was running is marked blocked unless it switched out
//!    voluntarily.
//! 2. Completion notices from the kernel make blocked threads runnable.
//! 3. Wait-queue entries whose deadline passed are timed out.
//! 4. The previous thread is filed away: retired if dead, requeued if
//!    runnable, parked if waiting.
//! 5. Joiners in other groups are woken and pending signals dispatched,
//!    both without the group lock.
//! 6. While there is nothing to run but the group still has threads, the
//!    KSE idles in the kernel.
//! 7. With no threads left, the KSE exits, or, for the initial KSE, the
//!    process is told to exit once no thread is left anywhere.
//! 8. Otherwise the next thread is taken off the run queue.
//!
//! A pass ends in a [`Dispatch`] telling the caller what to do next instead
//! of switching context itself.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::Ordering;
use core::time::Duration;

use crate::error::{Result, SchedError};
use crate::host::Host;
use crate::kern::kse::{Kse, KseFlags};
use crate::kern::kseg::{Kseg, KsegFlags, SchedGuard, Switchout};
use crate::kern::thread::{Scope, Slice, Thread, ThreadFlags, ThreadState};
use crate::scheduler::{Location, Scheduler};
use crate::types::{Deadline, KseId, ThreadId};

/// Outcome of a scheduling pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// Switch the KSE to this thread
    Resume(ThreadId),
    /// The KSE is finished
    Exit,
    /// No thread is left in the process
    ProcessExit,
}

impl<H: Host> Scheduler<H> {
    /// Drive a KSE until it exits
    ///
    /// Each resumed thread runs through [`crate::host::ContextSwitch::switch_to`]
    /// until it re-enters the scheduler.
    pub fn run_kse(&self, kse: KseId) -> Result<Dispatch> {
        loop {
            match self.sched_pass(kse)? {
                Dispatch::Resume(thread) => self.host.switch_to(kse, thread),
                done => return Ok(done),
            }
        }
    }

    /// Run one scheduling pass on `kse_id`
    pub fn sched_pass(&self, kse_id: KseId) -> Result<Dispatch> {
        let kse = self.kse(kse_id)?;
        if self.is_shut_down() || kse.has_flags(KseFlags::EXITED) {
            return Ok(Dispatch::Exit);
        }
        let kseg = self.kseg(kse.kseg().ok_or(SchedError::InvalidKse(kse_id))?)?;
        kse.insert_flags(KseFlags::STARTED);

        let mut guard = self.sched_lock(&kse, &kseg);

        let prev = kse.mailbox().take_curthread();
        if let Some(tid) = prev {
            let Some(t) = guard.thread_mut(tid) else {
                crate::sched_fatal!("{} was running {} outside its group", kse_id, tid);
            };
            if !t.need_switchout {
                t.blocked = true;
                self.counters.involuntary_switchouts.inc();
            }
        }

        self.poll_events(&kse, &mut guard, prev)?;

        let mut joiners = Vec::new();
        if let Some(tid) = prev {
            if let Switchout::Retired(thread) = guard.switchout_thread(tid, self.config.quantum)? {
                joiners.extend(self.retire(&kse, &mut guard, thread)?);
            }
        }

        for joiner in joiners {
            guard = self.wake_joiner(&kse, &kseg, guard, joiner)?;
        }
        if kse.mailbox().pending_signals() != 0 {
            drop(guard);
            self.dispatch_signals(&kse);
            guard = self.sched_lock(&kse, &kseg);
        }

        loop {
            while guard.runq.is_empty() && guard.threadcount > 0 {
                if self.is_shut_down() || kse.has_flags(KseFlags::EXITED) {
                    return Ok(Dispatch::Exit);
                }
                let timeout = self.idle_timeout(guard.waitq.next_deadline());
                guard = self.idle_release(&kse, &kseg, guard, timeout)?;
            }
            if !guard.runq.is_empty() {
                break;
            }

            if !guard.threads.is_empty() {
                crate::sched_fatal!(
                    "{} holds {} threads with a zero count",
                    guard.id(),
                    guard.threads.len()
                );
            }
            if kse_id != self.initial_kse() {
                return self.kse_fini(&kse, guard);
            }
            if self.active_threads() == 0 {
                drop(guard);
                log::debug!("no threads left; process exits");
                return Ok(Dispatch::ProcessExit);
            }
            if self.is_shut_down() {
                return Ok(Dispatch::Exit);
            }
            guard = self.idle_release(&kse, &kseg, guard, self.config.idle_ceiling)?;
        }

        let Some(next) = guard.runq_pop() else {
            crate::sched_fatal!("{} run queue emptied under its lock", guard.id());
        };
        let Some(t) = guard.thread_mut(next) else {
            crate::sched_fatal!("run queue handed out unknown {}", next);
        };
        if t.state.is_terminal() {
            crate::sched_fatal!("{} picked dead {}", kse_id, next);
        }
        t.active = true;
        t.kse = Some(kse_id);
        t.need_switchout = false;
        t.shared.take_cpu_time();
        kse.mailbox().set_curthread(Some(next));
        drop(guard);

        self.counters.context_switches.inc();
        log::trace!("{} resumes {}", kse_id, next);
        Ok(Dispatch::Resume(next))
    }

    /// Steps 2 and 3: completion notices, then expired deadlines
    fn poll_events(&self, kse: &Kse, guard: &mut SchedGuard<'_>, current: Option<ThreadId>) -> Result<()> {
        let completed = kse.mailbox().take_completed();
        guard.check_completed(&completed, current)?;
        let expired = guard.check_waitq(self.host.time_of_day())?;
        if expired > 0 {
            self.counters.timeouts.add(expired as u64);
        }
        Ok(())
    }

    /// Park the KSE in the kernel for at most `timeout`
    fn idle_release<'a>(
        &'a self,
        kse: &'a Kse,
        kseg: &Arc<Kseg>,
        mut guard: SchedGuard<'a>,
        timeout: Duration,
    ) -> Result<SchedGuard<'a>> {
        let id = kse.id();
        kse.insert_flags(KseFlags::WAITING);
        guard.idle_kses.push((id, kse.mailbox().clone()));
        drop(guard);

        self.counters.idle_releases.inc();
        log::trace!("{} idles for {:?}", id, timeout);
        self.host.kse_release(timeout);

        let mut guard = self.sched_lock(kse, kseg);
        guard.idle_kses.retain(|(k, _)| *k != id);
        kse.remove_flags(KseFlags::WAITING);
        self.poll_events(kse, &mut guard, None)?;
        Ok(guard)
    }

    /// Move a dead thread to the GC list; returns a joiner that lives in
    /// another group
    fn retire(&self, kse: &Kse, guard: &mut SchedGuard<'_>, mut thread: Thread) -> Result<Option<ThreadId>> {
        let tid = thread.id;
        thread.flags.insert(ThreadFlags::IN_GCLIST);
        if thread.attr.scope == Scope::Process {
            thread.flags.insert(ThreadFlags::GC_SAFE);
        }
        let joiner = thread.joiner.take();
        if joiner.is_some() {
            thread.flags.insert(ThreadFlags::DETACHED);
        }
        {
            let mut list = self.thread_list(kse);
            if let Some(entry) = list.entry_mut(tid) {
                entry.retired = true;
            }
            list.gc
                .try_reserve(1)
                .map_err(|_| SchedError::NoMemory("gc list"))?;
            list.gc.push(thread);
        }

        let left = self.active_threads.fetch_sub(1, Ordering::AcqRel) - 1;
        self.counters.thread_retired();
        log::debug!("{} retired, {} threads left", tid, left);
        if left == 0 {
            self.wake_initial(kse.id());
        }

        match joiner {
            Some(j) if guard.threads.contains_key(&j) => {
                guard.make_runnable(j)?;
                Ok(None)
            }
            other => Ok(other),
        }
    }

    fn wake_joiner<'a>(
        &'a self,
        kse: &'a Kse,
        home: &Arc<Kseg>,
        guard: SchedGuard<'a>,
        joiner: ThreadId,
    ) -> Result<SchedGuard<'a>> {
        let other = match self.locate(kse, joiner) {
            Ok(Location::Live(other)) => other,
            _ => {
                log::warn!("joiner {} is gone", joiner);
                return Ok(guard);
            }
        };
        let mut guard = guard.relock(&other);
        guard.make_runnable(joiner)?;
        let wake = guard.idle_kse();
        let guard = guard.relock(home);
        self.wake_idle(wake);
        Ok(guard)
    }

    fn wake_initial(&self, current: KseId) {
        let initial = self.initial_kse();
        if initial == current {
            return;
        }
        if let Ok(kse) = self.kse(initial) {
            if kse.has_flags(KseFlags::WAITING) {
                self.host.kse_wakeup(kse.mailbox());
            }
        }
    }

    fn dispatch_signals(&self, kse: &Kse) {
        while let Some(signo) = kse.mailbox().next_signal() {
            log::trace!("{} dispatches signal {}", kse.id(), signo);
            self.counters.signals_dispatched.inc();
            self.host.dispatch(kse.id(), signo);
        }
    }

    /// Retire a KSE whose group has no threads left
    ///
    /// A dedicated KSE stays attached to its group; both are freed by the
    /// collector together with the thread they ran.
    fn kse_fini(&self, kse: &Kse, mut guard: SchedGuard<'_>) -> Result<Dispatch> {
        let kse_id = kse.id();
        kse.insert_flags(KseFlags::EXITED);

        if guard.flags.contains(KsegFlags::SINGLE_THREAD) {
            let kseg_id = guard.id();
            {
                let mut list = self.thread_list(kse);
                for t in list.gc.iter_mut().filter(|t| t.kseg == Some(kseg_id)) {
                    t.flags.insert(ThreadFlags::GC_SAFE);
                }
            }
            drop(guard);
            log::debug!("{} finished {}", kse_id, kseg_id);
        } else {
            guard.kses.retain(|&k| k != kse_id);
            guard.idle_kses.retain(|(k, _)| *k != kse_id);
            let empty = guard.is_empty();
            let kseg_id = guard.id();
            drop(guard);

            kse.set_kseg(None);
            self.release_kse(kse_id);
            if empty {
                self.release_kseg(kseg_id);
            }
            log::debug!("{} left {}", kse_id, kseg_id);
        }

        self.host.kse_exit();
        Ok(Dispatch::Exit)
    }

    // ========================================================================
    // Thread-side primitives
    // ========================================================================

    /// Make a waiting thread runnable
    pub fn setrunnable(&self, caller: KseId, thread: ThreadId) -> Result<()> {
        let kse = self.kse(caller)?;
        let wake = {
            let mut guard = self.lock_thread(&kse, thread)?;
            if guard.make_runnable(thread)? {
                guard.idle_kse()
            } else {
                None
            }
        };
        self.wake_idle(wake);
        Ok(())
    }

    /// Set the wakeup deadline of a thread
    ///
    /// A waiting thread is re-sorted into the wait queue under its new
    /// deadline. On a running thread the deadline applies to its next
    /// timed wait.
    pub fn set_timeout(&self, caller: KseId, thread: ThreadId, timeout: Option<Duration>) -> Result<()> {
        let kse = self.kse(caller)?;
        let wake = {
            let mut guard = self.lock_thread(&kse, thread)?;
            let now = self.host.time_of_day();
            let requeue = guard.waitq_remove(thread);
            let t = guard
                .thread_mut(thread)
                .ok_or(SchedError::InvalidThread(thread))?;
            t.flags.remove(ThreadFlags::TIMEDOUT);
            t.wakeup = Deadline::after(now, timeout);
            if requeue {
                guard.waitq_insert(thread)?;
                // An idle KSE may be sleeping toward the old deadline
                guard.idle_kse()
            } else {
                None
            }
        };
        self.wake_idle(wake);
        Ok(())
    }

    /// Record CPU time the host measured for a running thread
    pub fn charge(&self, caller: KseId, thread: ThreadId, time: Duration) -> Result<()> {
        let kse = self.kse(caller)?;
        self.thread_shared(&kse, thread)?.charge(time);
        Ok(())
    }

    /// Put the running `thread` into a wait state and switch out
    ///
    /// `timeout` applies to timed states only; every other wait ends when
    /// the thread is made runnable. A timed wait with no `timeout` keeps a
    /// deadline set earlier through [`Scheduler::set_timeout`].
    pub fn block(
        &self,
        caller: KseId,
        thread: ThreadId,
        state: ThreadState,
        timeout: Option<Duration>,
    ) -> Result<()> {
        if matches!(state, ThreadState::Running | ThreadState::Dead) {
            return Err(SchedError::NotPermitted("not a wait state"));
        }
        let now = self.host.time_of_day();
        self.leave_cpu(caller, thread, |t| {
            t.state = state;
            t.flags.remove(ThreadFlags::TIMEDOUT);
            t.wakeup = match timeout {
                _ if !state.is_timed() => Deadline::Never,
                Some(_) => Deadline::after(now, timeout),
                None => t.wakeup,
            };
        })
    }

    /// Switch the running `thread` out, leaving its state as it is
    pub fn switch_out(&self, caller: KseId, thread: ThreadId) -> Result<()> {
        self.leave_cpu(caller, thread, |_| {})
    }

    /// Give up the CPU to other runnable threads
    ///
    /// Inside a KSE or thread critical region the yield is deferred until
    /// the region is left; returns whether the thread switched out now.
    pub fn yield_now(&self, caller: KseId, thread: ThreadId) -> Result<bool> {
        let kse = self.kse(caller)?;
        let shared = self.thread_shared(&kse, thread)?;
        if kse.mailbox().critical().request_yield() || shared.critical().request_yield() {
            log::trace!("{} defers its yield", thread);
            return Ok(false);
        }
        self.leave_cpu(caller, thread, |t| t.slice = Slice::Yielded)?;
        Ok(true)
    }

    /// Terminate the running `thread`
    pub fn thread_exit(&self, caller: KseId, thread: ThreadId) -> Result<()> {
        self.leave_cpu(caller, thread, |t| {
            t.state = ThreadState::Dead;
            t.wakeup = Deadline::Never;
        })
    }

    fn leave_cpu(&self, caller: KseId, thread: ThreadId, update: impl FnOnce(&mut Thread)) -> Result<()> {
        let kse = self.kse(caller)?;
        {
            let mut guard = self.lock_thread(&kse, thread)?;
            let t = guard
                .thread_mut(thread)
                .ok_or(SchedError::InvalidThread(thread))?;
            Self::check_running(t, caller)?;
            update(t);
            t.need_switchout = true;
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
    use crate::kern::thread::ThreadAttr;
    use crate::testing::NullHost;

    fn sched() -> Scheduler<NullHost> {
        let config = SchedConfig::new()
            .with_kse_stack_size(4096)
            .with_thread_stack_size(4096);
        Scheduler::new(NullHost::default(), config).unwrap()
    }

    #[test]
    fn test_single_thread_lifecycle() {
        let sched = sched();
        let me = sched.initial_kse();
        let t = sched.create_thread(me, ThreadAttr::new()).unwrap();

        assert_eq!(sched.sched_pass(me).unwrap(), Dispatch::Resume(t));
        let info = sched.thread_info(me, t).unwrap();
        assert!(info.active);
        assert_eq!(info.kse, Some(me));

        sched.thread_exit(me, t).unwrap();
        assert_eq!(sched.sched_pass(me).unwrap(), Dispatch::ProcessExit);
        assert_eq!(sched.active_threads(), 0);
        assert_eq!(sched.gc_pending(me).unwrap(), 1);
    }

    #[test]
    fn test_switch_out_requires_running_thread() {
        let sched = sched();
        let me = sched.initial_kse();
        let t = sched.create_thread(me, ThreadAttr::new()).unwrap();
        assert_eq!(
            sched.switch_out(me, t),
            Err(SchedError::NotPermitted("thread is not running on this KSE"))
        );
        assert_eq!(
            sched.block(me, t, ThreadState::Running, None),
            Err(SchedError::NotPermitted("not a wait state"))
        );
    }

    #[test]
    fn test_exited_kse_dispatches_exit() {
        let sched = sched();
        let me = sched.initial_kse();
        sched.create_thread(me, ThreadAttr::new()).unwrap();
        sched.shutdown().unwrap();
        assert_eq!(sched.sched_pass(me).unwrap(), Dispatch::Exit);
    }

    #[test]
    fn test_join_target_retired_while_its_group_is_busy() {
        let sched = sched();
        let k1 = sched.initial_kse();
        let g2 = sched.alloc_kseg().unwrap();
        let k2 = sched.spawn_kse(g2).unwrap();
        let j = sched.create_thread(k1, ThreadAttr::new()).unwrap();
        let t = sched.create_thread(k2, ThreadAttr::new()).unwrap();
        assert_eq!(sched.sched_pass(k1).unwrap(), Dispatch::Resume(j));
        assert_eq!(sched.sched_pass(k2).unwrap(), Dispatch::Resume(t));
        sched.thread_exit(k2, t).unwrap();

        let kse2 = sched.kse(k2).unwrap();
        let kseg2 = sched.kseg(g2).unwrap();
        let mut guard = sched.sched_lock(&kse2, &kseg2);
        let before = sched.host().releases.load(Ordering::SeqCst);

        std::thread::scope(|s| {
            let joining = s.spawn(|| sched.join(k1, j, t));
            // The joiner has found t live and now waits for g2
            while sched.host().releases.load(Ordering::SeqCst) == before {
                std::thread::yield_now();
            }
            let Switchout::Retired(dead) = guard.switchout_thread(t, sched.config.quantum).unwrap() else {
                panic!("{} was not retired", t);
            };
            assert!(sched.retire(&kse2, &mut guard, dead).unwrap().is_none());
            drop(guard);
            assert_eq!(joining.join().unwrap(), Ok(false));
        });

        let info = sched.thread_info(k1, j).unwrap();
        assert_eq!(info.state, ThreadState::Running);
        assert!(sched.thread_info(k1, t).unwrap().flags.contains(ThreadFlags::DETACHED));
    }
}
