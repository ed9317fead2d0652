//! Thread Management
//!
//! Threads are the lightweight units the scheduler multiplexes onto KSEs.
//! A live thread is owned by exactly one KSE group, inside that group's
//! scheduling lock, so every state transition happens under the lock by
//! construction. Retired threads move to the process-wide thread list to
//! wait for the garbage collector.
//!
//! The parts of a thread that must be reachable without the group lock
//! (critical-section depth, lock users, CPU time reported by the kernel)
//! live in a shared [`ThreadShared`] block.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use core::time::Duration;

use bitflags::bitflags;

use crate::kern::critical::CriticalCounter;
use crate::kern::lock::{LockLevels, LockUser, MAX_THR_LOCKLEVEL};
use crate::kern::stack::Stack;
use crate::kern::zalloc::Slab;
use crate::types::{Deadline, KseId, KsegId, Priority, ThreadId};

// ============================================================================
// Thread State
// ============================================================================

/// Scheduling state of a thread
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ThreadState {
    /// Runnable or running
    #[default]
    Running,
    /// Waiting on a condition variable
    CondWait,
    /// Sleeping until a deadline
    SleepWait,
    /// Waiting for a thread-level lock
    LockWait,
    /// Waiting for another thread to exit
    Join,
    /// Waiting for a mutex
    MutexWait,
    /// Suspended until a signal arrives
    SigSuspend,
    /// Waiting for a specific signal
    SigWait,
    /// Suspended by request
    Suspended,
    /// Deadlocked on itself
    Deadlock,
    /// Exited; never runs again
    Dead,
}

impl ThreadState {
    pub fn is_terminal(self) -> bool {
        matches!(self, ThreadState::Dead)
    }

    /// States whose wakeup deadline is honored by the wait queue
    pub fn is_timed(self) -> bool {
        matches!(self, ThreadState::CondWait | ThreadState::SleepWait)
    }

    /// States an interrupt pulls a thread out of
    pub fn is_interruptible(self) -> bool {
        matches!(
            self,
            ThreadState::CondWait
                | ThreadState::SleepWait
                | ThreadState::SigSuspend
                | ThreadState::SigWait
        )
    }
}

bitflags! {
    /// Thread flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ThreadFlags: u32 {
        /// Linked into its group's run queue
        const IN_RUNQ = 1 << 0;
        /// Linked into its group's wait queue
        const IN_WAITQ = 1 << 1;
        /// Stack and kernel resources may be reclaimed
        const GC_SAFE = 1 << 2;
        /// Nobody will join it
        const DETACHED = 1 << 3;
        /// Last wait ended by its deadline
        const TIMEDOUT = 1 << 4;
        /// Parked on the GC list
        const IN_GCLIST = 1 << 5;
    }
}

impl ThreadFlags {
    pub const QUEUED: Self = Self::IN_RUNQ.union(Self::IN_WAITQ);
}

// ============================================================================
// Scheduling Attributes
// ============================================================================

/// Contention scope
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Scope {
    /// Shares a group with other threads
    #[default]
    Process,
    /// Gets a dedicated KSE and group
    System,
}

/// Scheduling policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Policy {
    #[default]
    Other,
    RoundRobin,
    /// Keeps its turn past the quantum until it yields or waits
    Fifo,
}

/// Creation attributes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ThreadAttr {
    pub scope: Scope,
    pub policy: Policy,
    pub priority: Priority,
    pub detached: bool,
    /// `None` uses the configured default
    pub stack_size: Option<usize>,
}

impl ThreadAttr {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_scope(mut self, scope: Scope) -> Self {
        self.scope = scope;
        self
    }

    pub fn with_policy(mut self, policy: Policy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn detached(mut self) -> Self {
        self.detached = true;
        self
    }

    pub fn with_stack_size(mut self, size: usize) -> Self {
        self.stack_size = Some(size);
        self
    }
}

/// Time-slice accounting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slice {
    /// Gave up the CPU voluntarily; restarts its slice
    Yielded,
    /// CPU time used since the slice started
    Used(Duration),
}

impl Default for Slice {
    fn default() -> Self {
        Slice::Used(Duration::ZERO)
    }
}

// ============================================================================
// Shared Thread Block
// ============================================================================

/// Thread state reachable without the group lock
#[derive(Debug)]
pub struct ThreadShared {
    id: ThreadId,
    critical: CriticalCounter,
    lock_users: LockLevels<MAX_THR_LOCKLEVEL>,
    cpu_ns: AtomicU64,
    interrupted: AtomicBool,
}

impl ThreadShared {
    pub fn new(id: ThreadId) -> Self {
        Self {
            id,
            critical: CriticalCounter::new(),
            lock_users: LockLevels::new(|| LockUser::for_thread(id)),
            cpu_ns: AtomicU64::new(0),
            interrupted: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> ThreadId {
        self.id
    }

    /// Thread-level critical-section counter
    pub fn critical(&self) -> &CriticalCounter {
        &self.critical
    }

    pub fn lock_users(&self) -> &LockLevels<MAX_THR_LOCKLEVEL> {
        &self.lock_users
    }

    /// Record CPU time reported by the kernel
    pub fn charge(&self, time: Duration) {
        let ns = u64::try_from(time.as_nanos()).unwrap_or(u64::MAX);
        self.cpu_ns.fetch_add(ns, Ordering::Relaxed);
    }

    /// CPU time reported since the last call
    pub fn take_cpu_time(&self) -> Duration {
        Duration::from_nanos(self.cpu_ns.swap(0, Ordering::Relaxed))
    }

    pub fn set_interrupted(&self) {
        self.interrupted.store(true, Ordering::Release);
    }

    /// Consume a pending interrupt
    pub fn take_interrupted(&self) -> bool {
        self.interrupted.swap(false, Ordering::AcqRel)
    }
}

// ============================================================================
// Thread
// ============================================================================

/// Thread descriptor
#[derive(Debug)]
pub struct Thread {
    pub id: ThreadId,
    pub shared: Arc<ThreadShared>,
    pub state: ThreadState,
    pub flags: ThreadFlags,
    pub priority: Priority,
    /// Deadline of the current wait
    pub wakeup: Deadline,
    pub slice: Slice,
    /// Running on a KSE right now
    pub active: bool,
    /// Blocked inside the kernel
    pub blocked: bool,
    /// Entered the scheduler voluntarily
    pub need_switchout: bool,
    pub joiner: Option<ThreadId>,
    pub attr: ThreadAttr,
    pub kse: Option<KseId>,
    pub kseg: Option<KsegId>,
    pub stack: Option<Stack>,
    /// Lock user this thread is waiting with in `LockWait`
    pub lockwait: Option<Arc<LockUser>>,
}

impl Thread {
    pub fn new(id: ThreadId) -> Self {
        Self {
            id,
            shared: Arc::new(ThreadShared::new(id)),
            state: ThreadState::Running,
            flags: ThreadFlags::empty(),
            priority: Priority::DEFAULT,
            wakeup: Deadline::Never,
            slice: Slice::default(),
            active: false,
            blocked: false,
            need_switchout: false,
            joiner: None,
            attr: ThreadAttr::default(),
            kse: None,
            kseg: None,
            stack: None,
            lockwait: None,
        }
    }

    /// Reinitialize a cached descriptor under a new identity, keeping its
    /// stack
    pub fn recycle(mut self, id: ThreadId) -> Self {
        let stack = self.stack.take();
        Self {
            stack,
            ..Self::new(id)
        }
    }

    pub fn is_queued(&self) -> bool {
        self.flags.intersects(ThreadFlags::QUEUED)
    }

    pub fn info(&self) -> ThreadInfo {
        ThreadInfo {
            id: self.id,
            state: self.state,
            flags: self.flags,
            priority: self.priority,
            wakeup: self.wakeup,
            slice: self.slice,
            active: self.active,
            blocked: self.blocked,
            scope: self.attr.scope,
            policy: self.attr.policy,
            kse: self.kse,
            kseg: self.kseg,
            joiner: self.joiner,
            critical_depth: self.shared.critical().depth(),
        }
    }
}

/// Point-in-time view of a thread
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadInfo {
    pub id: ThreadId,
    pub state: ThreadState,
    pub flags: ThreadFlags,
    pub priority: Priority,
    pub wakeup: Deadline,
    pub slice: Slice,
    pub active: bool,
    pub blocked: bool,
    pub scope: Scope,
    pub policy: Policy,
    pub kse: Option<KseId>,
    pub kseg: Option<KsegId>,
    pub joiner: Option<ThreadId>,
    pub critical_depth: u32,
}

// ============================================================================
// Process-wide Thread List
// ============================================================================

/// Directory entry of an allocated thread
#[derive(Debug)]
pub struct ThreadEntry {
    /// Group owning the thread; `None` until scheduled
    pub kseg: Option<KsegId>,
    pub shared: Arc<ThreadShared>,
    /// Outstanding references keeping a dead thread from being reclaimed
    pub refcount: u32,
    /// Dead and parked on the GC list
    pub retired: bool,
}

/// Every allocated thread, plus the threads awaiting collection
#[derive(Debug, Default)]
pub struct ThreadList {
    pub directory: Slab<ThreadId, ThreadEntry>,
    pub gc: Vec<Thread>,
}

impl ThreadList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entry(&self, thread: ThreadId) -> Option<&ThreadEntry> {
        self.directory.get(thread)
    }

    pub fn entry_mut(&mut self, thread: ThreadId) -> Option<&mut ThreadEntry> {
        self.directory.get_mut(thread)
    }

    pub fn gc_thread_mut(&mut self, thread: ThreadId) -> Option<&mut Thread> {
        self.gc.iter_mut().find(|t| t.id == thread)
    }
}
