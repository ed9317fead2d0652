//! Process-wide scheduler context
//!
//! One [`Scheduler`] value holds everything the M:N scheduler shares across
//! KSEs: the KSE and KSE group zones, the thread cache, the process-wide
//! thread list and the statistics. Every operation takes it by reference;
//! nothing lives in globals.
//!
//! Operations that run on behalf of a KSE name that KSE (`caller`). The
//! entity-level locks they take are held by that KSE, so a lock waiter
//! always knows whom to wake.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use core::time::Duration;

use crate::config::SchedConfig;
use crate::error::{Result, SchedError};
use crate::host::Host;
use crate::kern::counters::{CounterSnapshot, SchedCounters};
use crate::kern::kse::{Kse, KseFlags, KseMailbox, MailboxFlags};
use crate::kern::kse_lock::{KseLock, KseLockGuard, KseWait};
use crate::kern::kseg::{Kseg, KsegFlags, KsegState, SchedGuard};
use crate::kern::runq::RunqEnd;
use crate::kern::stack::Stack;
use crate::kern::thread::{
    Scope, Thread, ThreadAttr, ThreadFlags, ThreadInfo, ThreadList, ThreadShared, ThreadState,
};
use crate::kern::zalloc::{FreeList, Zone, ZoneInfo};
use crate::types::{Deadline, Handle, KseId, KsegId, Priority, ThreadId};

/// Where a thread currently lives
pub(crate) enum Location {
    /// Owned by a group
    Live(Arc<Kseg>),
    /// Dead and parked on the GC list
    Retired,
    /// Allocated but not yet handed to the scheduler
    Unscheduled,
}

/// A resolved [`Location`], with the owning group locked when live
pub(crate) enum Placed<'a> {
    Live(SchedGuard<'a>),
    Retired,
    Unscheduled,
}

/// Occupancy of the object caches
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheInfo {
    pub kses: ZoneInfo,
    pub ksegs: ZoneInfo,
    pub cached_threads: usize,
    pub thread_high_water: usize,
}

/// The M:N scheduler
pub struct Scheduler<H: Host> {
    pub(crate) host: H,
    pub(crate) config: SchedConfig,
    /// KSE zone (allocator lock)
    pub(crate) kses: spin::Mutex<Zone<KseId, Arc<Kse>>>,
    /// KSE group zone (allocator lock)
    pub(crate) ksegs: spin::Mutex<Zone<KsegId, Arc<Kseg>>>,
    /// Recycled thread descriptors
    pub(crate) thread_cache: spin::Mutex<FreeList<Thread>>,
    /// Thread directory and GC list
    pub(crate) threads: KseLock<ThreadList>,
    /// The process's first KSE and its group
    pub(crate) initial: spin::Mutex<(KseId, KsegId)>,
    /// Threads scheduled and not yet retired, process-wide
    pub(crate) active_threads: AtomicUsize,
    pub(crate) counters: SchedCounters,
    pub(crate) shut_down: AtomicBool,
}

impl<H: Host> Scheduler<H> {
    /// Build a scheduler with its initial KSE and group
    pub fn new(host: H, config: SchedConfig) -> Result<Self> {
        config.validate()?;

        let sched = Self {
            host,
            kses: spin::Mutex::new(Zone::new("kse", config.max_cached_kses)),
            ksegs: spin::Mutex::new(Zone::new("kseg", config.max_cached_ksegs)),
            thread_cache: spin::Mutex::new(FreeList::new("thread", config.max_cached_threads)),
            threads: KseLock::new("thread list", ThreadList::new()),
            initial: spin::Mutex::new((KseId::from_parts(0, 0), KsegId::from_parts(0, 0))),
            active_threads: AtomicUsize::new(0),
            counters: SchedCounters::new(),
            shut_down: AtomicBool::new(false),
            config,
        };

        let kseg = sched.new_kseg()?;
        let kse = sched.new_kse()?;
        sched.attach(&kse, &kseg);
        *sched.initial.lock() = (kse.id(), kseg.id());

        log::debug!("scheduler up: initial {} in {}", kse.id(), kseg.id());
        Ok(sched)
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    pub fn config(&self) -> &SchedConfig {
        &self.config
    }

    pub fn initial_kse(&self) -> KseId {
        self.initial.lock().0
    }

    pub fn initial_kseg(&self) -> KsegId {
        self.initial.lock().1
    }

    /// Threads scheduled and not yet retired
    pub fn active_threads(&self) -> usize {
        self.active_threads.load(Ordering::Acquire)
    }

    pub fn counters(&self) -> &SchedCounters {
        &self.counters
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        self.counters.snapshot()
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    pub fn cache_info(&self) -> CacheInfo {
        let kses = ZoneInfo::from(&*self.kses.lock());
        let ksegs = ZoneInfo::from(&*self.ksegs.lock());
        let cache = self.thread_cache.lock();
        CacheInfo {
            kses,
            ksegs,
            cached_threads: cache.len(),
            thread_high_water: cache.high_water(),
        }
    }

    // ========================================================================
    // Lookup and locking helpers
    // ========================================================================

    pub(crate) fn ensure_running(&self) -> Result<()> {
        if self.is_shut_down() {
            return Err(SchedError::NotPermitted("scheduler is shut down"));
        }
        Ok(())
    }

    pub fn kse(&self, id: KseId) -> Result<Arc<Kse>> {
        self.kses
            .lock()
            .get(id)
            .cloned()
            .ok_or(SchedError::InvalidKse(id))
    }

    pub fn kseg(&self, id: KsegId) -> Result<Arc<Kseg>> {
        self.ksegs
            .lock()
            .get(id)
            .cloned()
            .ok_or(SchedError::InvalidKseg(id))
    }

    pub(crate) fn wait_for<'a>(&'a self, kse: &'a Kse) -> KseWait<'a> {
        KseWait::new(kse, &self.host, self.config.entity_lock_release)
    }

    pub(crate) fn sched_lock<'a>(&'a self, kse: &'a Kse, kseg: &Arc<Kseg>) -> SchedGuard<'a> {
        kseg.lock(self.wait_for(kse))
    }

    pub(crate) fn thread_list<'a>(&'a self, kse: &'a Kse) -> KseLockGuard<'a, ThreadList> {
        self.threads.lock(self.wait_for(kse))
    }

    pub(crate) fn locate(&self, kse: &Kse, thread: ThreadId) -> Result<Location> {
        let (kseg, retired) = {
            let list = self.thread_list(kse);
            let entry = list.entry(thread).ok_or(SchedError::InvalidThread(thread))?;
            (entry.kseg, entry.retired)
        };
        Ok(match (kseg, retired) {
            (_, true) => Location::Retired,
            (Some(id), false) => Location::Live(self.kseg(id)?),
            (None, false) => Location::Unscheduled,
        })
    }

    /// Resolve `thread` and lock its group if it is live
    ///
    /// The thread list lock is dropped before the group lock is taken, so
    /// the thread can retire in between. It is then looked up again.
    pub(crate) fn place<'a>(&'a self, kse: &'a Kse, thread: ThreadId) -> Result<Placed<'a>> {
        loop {
            match self.locate(kse, thread)? {
                Location::Live(kseg) => {
                    let guard = self.sched_lock(kse, &kseg);
                    if guard.threads.contains_key(&thread) {
                        return Ok(Placed::Live(guard));
                    }
                    log::trace!("{} left {} before it was locked", thread, guard.id());
                }
                Location::Retired => return Ok(Placed::Retired),
                Location::Unscheduled => return Ok(Placed::Unscheduled),
            }
        }
    }

    /// Lock the group owning a live thread
    pub(crate) fn lock_thread<'a>(&'a self, kse: &'a Kse, thread: ThreadId) -> Result<SchedGuard<'a>> {
        match self.place(kse, thread)? {
            Placed::Live(guard) => Ok(guard),
            Placed::Retired | Placed::Unscheduled => Err(SchedError::InvalidThread(thread)),
        }
    }

    pub(crate) fn thread_shared(&self, kse: &Kse, thread: ThreadId) -> Result<Arc<ThreadShared>> {
        self.thread_list(kse)
            .entry(thread)
            .map(|entry| entry.shared.clone())
            .ok_or(SchedError::InvalidThread(thread))
    }

    /// Wake one idle KSE of a group after its lock was dropped
    pub(crate) fn wake_idle(&self, mailbox: Option<Arc<KseMailbox>>) {
        if let Some(mailbox) = mailbox {
            self.counters.idle_wakeups.inc();
            self.host.kse_wakeup(&mailbox);
        }
    }

    // ========================================================================
    // Thread creation
    // ========================================================================

    /// Allocate, set up and schedule a new thread
    pub fn create_thread(&self, caller: KseId, attr: ThreadAttr) -> Result<ThreadId> {
        self.ensure_running()?;
        let mut thread = self.alloc_thread(caller)?;

        let size = attr.stack_size.unwrap_or(self.config.thread_stack_size);
        let stack = match thread.stack.take() {
            Some(stack) if stack.size() == size => stack,
            _ => match Stack::new(size) {
                Ok(stack) => stack,
                Err(err) => {
                    self.free_thread(caller, thread)?;
                    return Err(err);
                }
            },
        };
        thread.stack = Some(stack);
        thread.attr = attr;
        thread.priority = attr.priority.clamp_to(self.config.priority_levels);
        if attr.detached {
            thread.flags.insert(ThreadFlags::DETACHED);
        }

        self.schedule_add(caller, thread)
    }

    /// Hand a thread descriptor to the scheduler
    ///
    /// Scope-system threads get a dedicated group and KSE; if the kernel
    /// refuses the new KSE, everything allocated here is released and the
    /// thread is freed.
    pub fn schedule_add(&self, caller: KseId, mut thread: Thread) -> Result<ThreadId> {
        let kse = self.kse(caller)?;
        let target = match self.ensure_running().and_then(|()| self.target_group(&kse, &thread)) {
            Ok(target) => target,
            Err(err) => {
                self.free_thread(caller, thread)?;
                return Err(err);
            }
        };
        let (kseg, dedicated) = target;
        let tid = thread.id;

        if let Some(entry) = self.thread_list(&kse).entry_mut(tid) {
            entry.kseg = Some(kseg.id());
        }
        thread.kseg = Some(kseg.id());
        thread.state = ThreadState::Running;
        if let Some(dedicated) = &dedicated {
            thread.kse = Some(dedicated.id());
        }

        let wake = {
            let mut guard = self.sched_lock(&kse, &kseg);
            if dedicated.is_some() {
                guard.flags.insert(KsegFlags::SINGLE_THREAD);
            }
            guard.threads.insert(tid, thread);
            guard.threadcount += 1;
            match guard.make_runnable(tid) {
                Ok(_) => guard.idle_kse(),
                Err(err) => {
                    let thread = guard.threads.remove(&tid);
                    guard.threadcount -= 1;
                    drop(guard);
                    if let Some(dedicated) = dedicated {
                        self.release_pair(&dedicated, &kseg);
                    }
                    if let Some(thread) = thread {
                        self.free_thread(caller, thread)?;
                    }
                    return Err(err);
                }
            }
        };
        self.active_threads.fetch_add(1, Ordering::AcqRel);
        self.counters.thread_started();

        if let Some(dedicated) = dedicated {
            if let Err(err) = self.host.kse_create(dedicated.mailbox(), true) {
                log::warn!("kse_create for {} failed: {}", tid, err);
                let thread = {
                    let mut guard = self.sched_lock(&kse, &kseg);
                    guard.runq_remove(tid);
                    guard.threadcount -= 1;
                    guard.threads.remove(&tid)
                };
                self.active_threads.fetch_sub(1, Ordering::AcqRel);
                self.counters.thread_retired();
                self.release_pair(&dedicated, &kseg);
                if let Some(thread) = thread {
                    self.free_thread(caller, thread)?;
                }
                return Err(SchedError::KernelResource(err));
            }
            dedicated.insert_flags(KseFlags::STARTED);
        }

        log::debug!("{} scheduled in {}", tid, kseg.id());
        self.wake_idle(wake);
        Ok(tid)
    }

    fn target_group(&self, kse: &Kse, thread: &Thread) -> Result<(Arc<Kseg>, Option<Arc<Kse>>)> {
        match thread.attr.scope {
            Scope::Process => {
                let id = kse.kseg().ok_or(SchedError::InvalidKse(kse.id()))?;
                Ok((self.kseg(id)?, None))
            }
            Scope::System => {
                let kseg = self.new_kseg()?;
                let dedicated = match self.new_kse() {
                    Ok(dedicated) => dedicated,
                    Err(err) => {
                        self.release_kseg(kseg.id());
                        return Err(err);
                    }
                };
                self.attach(&dedicated, &kseg);
                Ok((kseg, Some(dedicated)))
            }
        }
    }

    // ========================================================================
    // Thread bookkeeping
    // ========================================================================

    /// Snapshot of a live or retired thread
    pub fn thread_info(&self, caller: KseId, thread: ThreadId) -> Result<ThreadInfo> {
        let kse = self.kse(caller)?;
        let placed = self.place(&kse, thread)?;
        match placed {
            Placed::Live(guard) => guard
                .thread(thread)
                .map(Thread::info)
                .ok_or(SchedError::InvalidThread(thread)),
            Placed::Retired => self
                .thread_list(&kse)
                .gc
                .iter()
                .find(|t| t.id == thread)
                .map(Thread::info)
                .ok_or(SchedError::InvalidThread(thread)),
            Placed::Unscheduled => Err(SchedError::InvalidThread(thread)),
        }
    }

    /// Run `f` over a group's state under its scheduling lock
    pub fn with_kseg<R>(&self, caller: KseId, kseg: KsegId, f: impl FnOnce(&KsegState) -> R) -> Result<R> {
        let kse = self.kse(caller)?;
        let kseg = self.kseg(kseg)?;
        let guard = self.sched_lock(&kse, &kseg);
        Ok(f(&guard))
    }

    /// Nobody will join `thread`; it is reclaimed once it dies
    pub fn detach(&self, caller: KseId, thread: ThreadId) -> Result<()> {
        let kse = self.kse(caller)?;
        match self.place(&kse, thread)? {
            Placed::Live(mut guard) => {
                let (joiner, wake) = {
                    let t = guard
                        .thread_mut(thread)
                        .ok_or(SchedError::InvalidThread(thread))?;
                    t.flags.insert(ThreadFlags::DETACHED);
                    let joiner = t.joiner.take();
                    match joiner {
                        Some(j) if guard.threads.contains_key(&j) => {
                            guard.make_runnable(j)?;
                            (None, guard.idle_kse())
                        }
                        other => (other, None),
                    }
                };
                drop(guard);
                self.wake_idle(wake);
                if let Some(joiner) = joiner {
                    self.setrunnable(caller, joiner)?;
                }
            }
            Placed::Retired => {
                if let Some(t) = self.thread_list(&kse).gc_thread_mut(thread) {
                    t.flags.insert(ThreadFlags::DETACHED);
                }
            }
            Placed::Unscheduled => return Err(SchedError::InvalidThread(thread)),
        }
        log::debug!("{} detached", thread);
        Ok(())
    }

    /// Wait for `target` to exit
    ///
    /// `joiner` must be running on `caller`. Returns `Ok(false)` if `target`
    /// had already exited, `Ok(true)` if `joiner` was switched out to wait.
    /// Either way `target` is reclaimed by the collector once it is gone.
    pub fn join(&self, caller: KseId, joiner: ThreadId, target: ThreadId) -> Result<bool> {
        if joiner == target {
            return Err(SchedError::NotPermitted("thread cannot join itself"));
        }
        let kse = self.kse(caller)?;

        // Enter Join first so a wakeup racing with the link is never lost.
        {
            let mut guard = self.lock_thread(&kse, joiner)?;
            let t = guard
                .thread_mut(joiner)
                .ok_or(SchedError::InvalidThread(joiner))?;
            Self::check_running(t, caller)?;
            t.state = ThreadState::Join;
            t.wakeup = Deadline::Never;
        }

        let linked = self.link_joiner(&kse, joiner, target);
        if !matches!(linked, Ok(true)) {
            let mut guard = self.lock_thread(&kse, joiner)?;
            if let Some(t) = guard.thread_mut(joiner) {
                if t.state == ThreadState::Join {
                    t.state = ThreadState::Running;
                }
            }
            return linked;
        }

        self.switch_out(caller, joiner)?;
        Ok(true)
    }

    /// Record `joiner` on `target`; false if `target` is already retired
    fn link_joiner(&self, kse: &Kse, joiner: ThreadId, target: ThreadId) -> Result<bool> {
        match self.place(kse, target)? {
            Placed::Live(mut guard) => {
                let t = guard
                    .thread_mut(target)
                    .ok_or(SchedError::InvalidThread(target))?;
                if t.flags.contains(ThreadFlags::DETACHED) {
                    return Err(SchedError::NotPermitted("thread is detached"));
                }
                if t.joiner.is_some_and(|j| j != joiner) {
                    return Err(SchedError::NotPermitted("thread already has a joiner"));
                }
                t.joiner = Some(joiner);
                Ok(true)
            }
            Placed::Retired => {
                let mut list = self.thread_list(kse);
                let t = list
                    .gc_thread_mut(target)
                    .ok_or(SchedError::InvalidThread(target))?;
                if t.flags.contains(ThreadFlags::DETACHED) {
                    return Err(SchedError::NotPermitted("thread is detached"));
                }
                t.flags.insert(ThreadFlags::DETACHED);
                Ok(false)
            }
            Placed::Unscheduled => Err(SchedError::InvalidThread(target)),
        }
    }

    /// Take a reference keeping a dead thread from being reclaimed
    pub fn ref_add(&self, caller: KseId, thread: ThreadId) -> Result<u32> {
        let kse = self.kse(caller)?;
        let mut list = self.thread_list(&kse);
        let entry = list
            .entry_mut(thread)
            .ok_or(SchedError::InvalidThread(thread))?;
        entry.refcount += 1;
        Ok(entry.refcount)
    }

    pub fn ref_del(&self, caller: KseId, thread: ThreadId) -> Result<u32> {
        let kse = self.kse(caller)?;
        let mut list = self.thread_list(&kse);
        let entry = list
            .entry_mut(thread)
            .ok_or(SchedError::InvalidThread(thread))?;
        if entry.refcount == 0 {
            return Err(SchedError::NotPermitted("thread reference count underflow"));
        }
        entry.refcount -= 1;
        Ok(entry.refcount)
    }

    /// Interrupt whatever `thread` is waiting for
    ///
    /// A thread blocked in the kernel is interrupted there; one in an
    /// interruptible user-level wait is made runnable. The thread observes
    /// the interrupt through [`ThreadShared::take_interrupted`].
    pub fn interrupt(&self, caller: KseId, thread: ThreadId) -> Result<()> {
        let kse = self.kse(caller)?;
        let (in_kernel, wake) = {
            let mut guard = self.lock_thread(&kse, thread)?;
            let t = guard
                .thread_mut(thread)
                .ok_or(SchedError::InvalidThread(thread))?;
            t.shared.set_interrupted();
            if t.blocked {
                (true, None)
            } else if t.state.is_interruptible() {
                guard.make_runnable(thread)?;
                (false, guard.idle_kse())
            } else {
                (false, None)
            }
        };
        if in_kernel {
            self.host.kse_thr_interrupt(thread);
        }
        self.wake_idle(wake);
        Ok(())
    }

    /// Change a thread's priority, requeueing it if it is runnable
    pub fn set_priority(&self, caller: KseId, thread: ThreadId, priority: Priority) -> Result<()> {
        let kse = self.kse(caller)?;
        let mut guard = self.lock_thread(&kse, thread)?;
        let priority = priority.clamp_to(self.config.priority_levels);
        let requeue = guard.runq_remove(thread);
        if let Some(t) = guard.thread_mut(thread) {
            t.priority = priority;
            t.attr.priority = priority;
        }
        if requeue {
            guard.runq_insert(thread, RunqEnd::Tail)?;
        }
        Ok(())
    }

    /// Mark signal `signo` pending on a KSE
    pub fn post_signal(&self, kse: KseId, signo: u32) -> Result<bool> {
        self.kse(kse)?.mailbox().post_signal(signo)
    }

    // ========================================================================
    // Critical sections
    // ========================================================================

    /// Enter a KSE-level critical region: upcalls stay disabled until the
    /// outermost region is left
    pub fn kse_critical_enter(&self, kse: KseId) -> Result<()> {
        let kse = self.kse(kse)?;
        kse.mailbox().critical().enter();
        kse.mailbox().insert_flags(MailboxFlags::NO_UPCALL);
        Ok(())
    }

    /// Leave a KSE-level critical region; a yield requested inside it is
    /// carried out now by the current thread
    pub fn kse_critical_leave(&self, kse: KseId) -> Result<()> {
        let kse = self.kse(kse)?;
        let mailbox = kse.mailbox();
        let deferred = mailbox.critical().leave();
        if mailbox.critical().in_critical() {
            return Ok(());
        }
        mailbox.remove_flags(MailboxFlags::NO_UPCALL);
        match mailbox.curthread() {
            Some(thread) if deferred => self.yield_now(kse.id(), thread).map(|_| ()),
            _ => Ok(()),
        }
    }

    /// Enter a thread-level critical region: yields are deferred
    pub fn thr_critical_enter(&self, caller: KseId, thread: ThreadId) -> Result<()> {
        let kse = self.kse(caller)?;
        self.thread_shared(&kse, thread)?.critical().enter();
        Ok(())
    }

    /// Leave a thread-level critical region, performing a deferred yield
    pub fn thr_critical_leave(&self, caller: KseId, thread: ThreadId) -> Result<()> {
        let kse = self.kse(caller)?;
        if self.thread_shared(&kse, thread)?.critical().leave() {
            self.yield_now(caller, thread)?;
        }
        Ok(())
    }

    pub(crate) fn check_running(thread: &Thread, kse: KseId) -> Result<()> {
        if thread.active && thread.kse == Some(kse) {
            Ok(())
        } else {
            Err(SchedError::NotPermitted("thread is not running on this KSE"))
        }
    }

    // ========================================================================
    // Teardown
    // ========================================================================

    /// Stop the scheduler: every KSE is marked exited and all caches are
    /// emptied. Scheduling passes return [`crate::Dispatch::Exit`] from now
    /// on.
    pub fn shutdown(&self) -> Result<()> {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return Err(SchedError::NotPermitted("scheduler is already shut down"));
        }

        let kses: Vec<Arc<Kse>> = self
            .kses
            .lock()
            .active()
            .iter()
            .map(|(_, kse)| kse.clone())
            .collect();
        for kse in &kses {
            kse.insert_flags(KseFlags::EXITED);
            if kse.has_flags(KseFlags::WAITING) {
                self.host.kse_wakeup(kse.mailbox());
            }
        }

        let cached_kses = self.kses.lock().purge();
        let cached_ksegs = self.ksegs.lock().purge();
        let cached_threads = self.thread_cache.lock().drain();
        log::debug!(
            "scheduler shut down: {} KSEs, {} cached KSEs, {} cached groups, {} cached threads",
            kses.len(),
            cached_kses.len(),
            cached_ksegs.len(),
            cached_threads.len()
        );
        Ok(())
    }

    /// Rebuild the scheduler around `survivor` after a fork
    ///
    /// Only the calling thread exists in the child. Every other thread,
    /// KSE and group is dropped, every lock is forcibly released, and a new
    /// initial KSE and group are built owning the survivor, which is
    /// current on the new KSE.
    pub fn reset_after_fork(&self, survivor: ThreadId) -> Result<KseId> {
        self.ensure_running()?;
        let kseg = self.new_kseg()?;
        let kse = match self.new_kse() {
            Ok(kse) => kse,
            Err(err) => {
                self.release_kseg(kseg.id());
                return Err(err);
            }
        };

        self.threads.raw().reinit();
        let found = {
            let mut list = self.thread_list(&kse);
            match list.entry(survivor).and_then(|entry| entry.kseg) {
                Some(old) => {
                    let purged = list.directory.retain(|id, _| id == survivor);
                    let gc = core::mem::take(&mut list.gc);
                    if let Some(entry) = list.entry_mut(survivor) {
                        entry.kseg = Some(kseg.id());
                    }
                    Some((old, purged, gc))
                }
                None => None,
            }
        };
        let Some((old_kseg, purged, gc)) = found else {
            self.release_pair(&kse, &kseg);
            return Err(SchedError::InvalidThread(survivor));
        };
        drop((purged, gc));

        let old = self.kseg(old_kseg)?;
        old.break_lock();
        let thread = {
            let mut guard = self.sched_lock(&kse, &old);
            guard.runq_remove(survivor);
            guard.waitq_remove(survivor);
            guard.threads.remove(&survivor)
        };
        drop(old);
        let mut thread = thread.ok_or(SchedError::InvalidThread(survivor))?;

        let (kse_id, kseg_id) = (kse.id(), kseg.id());
        let dead_kses = self.kses.lock().active_mut().retain(|id, _| id == kse_id);
        let dead_ksegs = self.ksegs.lock().active_mut().retain(|id, _| id == kseg_id);
        let purged = (
            self.kses.lock().purge(),
            self.ksegs.lock().purge(),
            self.thread_cache.lock().drain(),
        );
        log::debug!(
            "fork reset: dropped {} KSEs and {} groups",
            dead_kses.len(),
            dead_ksegs.len()
        );
        drop((dead_kses, dead_ksegs, purged));

        thread.state = ThreadState::Running;
        thread.flags.remove(ThreadFlags::QUEUED | ThreadFlags::IN_GCLIST);
        thread.active = true;
        thread.blocked = false;
        thread.need_switchout = false;
        thread.joiner = None;
        thread.lockwait = None;
        thread.attr.scope = Scope::Process;
        thread.kse = Some(kse_id);
        thread.kseg = Some(kseg_id);
        thread.shared.lock_users().reset();
        thread.shared.critical().reset();

        kse.set_kseg(Some(kseg_id));
        {
            let mut guard = self.sched_lock(&kse, &kseg);
            guard.kses.push(kse_id);
            guard.threads.insert(survivor, thread);
            guard.threadcount = 1;
        }
        kse.insert_flags(KseFlags::STARTED);
        kse.mailbox().set_curthread(Some(survivor));

        *self.initial.lock() = (kse_id, kseg_id);
        self.active_threads.store(1, Ordering::Release);
        self.counters.threads_current.reset();
        self.counters.threads_current.inc();

        log::debug!("fork reset: {} survives on {}", survivor, kse_id);
        Ok(kse_id)
    }

    /// Next wakeup deadline of a group, for hosts that want to arm a timer
    pub fn next_deadline(&self, caller: KseId, kseg: KsegId) -> Result<Deadline> {
        self.with_kseg(caller, kseg, |state| state.waitq.next_deadline())
    }

    /// How long an idle KSE of a group should release itself for
    pub(crate) fn idle_timeout(&self, deadline: Deadline) -> Duration {
        let now = self.host.time_of_day();
        deadline
            .remaining(now)
            .map_or(self.config.idle_ceiling, |left| left.min(self.config.idle_ceiling))
    }
}
