//! Deterministic host for integration tests
//!
//! The clock is manual: it moves when a test advances it, or when a KSE
//! releases itself (by exactly the timeout it asked for). Completion notices
//! can be scripted to arrive on the next release, which is how a test makes
//! a kernel-blocked thread runnable again.
//!
//! A parking host also blocks released KSEs for a short real-time interval,
//! or until any KSE is woken, for tests that run KSEs on OS threads.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use kse_r::{
    ContextSwitch, KernelError, Kernel, KseId, KseMailbox, SchedConfig, Scheduler, SignalHook,
    ThreadId,
};

/// Releases after which a test is considered hung
const MAX_RELEASES: usize = 10_000;

/// Longest real-time park of a parking host
const PARK_LIMIT: Duration = Duration::from_millis(20);

#[derive(Default)]
pub struct MockHost {
    clock_ns: AtomicU64,
    fail_create: AtomicBool,
    release_count: AtomicUsize,
    pub creates: Mutex<Vec<(KseId, bool)>>,
    pub releases: Mutex<Vec<Duration>>,
    pub wakeups: Mutex<Vec<KseId>>,
    pub interrupts: Mutex<Vec<ThreadId>>,
    pub exits: AtomicUsize,
    pub signals: Mutex<Vec<(KseId, u32)>>,
    pub switches: Mutex<Vec<(KseId, ThreadId)>>,
    pub switch_outs: Mutex<Vec<(KseId, ThreadId)>>,
    on_release: Mutex<Vec<(Arc<KseMailbox>, ThreadId)>>,
    parking: bool,
    wake_gen: Mutex<u64>,
    wake_cv: Condvar,
}

impl MockHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn parking() -> Self {
        Self {
            parking: true,
            ..Self::default()
        }
    }

    pub fn now(&self) -> Duration {
        Duration::from_nanos(self.clock_ns.load(Ordering::SeqCst))
    }

    pub fn advance(&self, by: Duration) {
        self.clock_ns
            .fetch_add(by.as_nanos() as u64, Ordering::SeqCst);
    }

    pub fn fail_kse_create(&self, fail: bool) {
        self.fail_create.store(fail, Ordering::SeqCst);
    }

    /// Deliver a completion notice for `thread` on the next release
    pub fn complete_on_release(&self, mailbox: Arc<KseMailbox>, thread: ThreadId) {
        self.on_release.lock().unwrap().push((mailbox, thread));
    }

    pub fn release_count(&self) -> usize {
        self.release_count.load(Ordering::SeqCst)
    }

    pub fn exit_count(&self) -> usize {
        self.exits.load(Ordering::SeqCst)
    }
}

impl Kernel for MockHost {
    fn kse_create(&self, mailbox: &Arc<KseMailbox>, new_group: bool) -> Result<(), KernelError> {
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(KernelError::Again);
        }
        self.creates.lock().unwrap().push((mailbox.kse(), new_group));
        Ok(())
    }

    fn kse_release(&self, timeout: Duration) {
        let n = self.release_count.fetch_add(1, Ordering::SeqCst);
        assert!(n < MAX_RELEASES, "KSE released {} times; scheduler is stuck", n);
        self.releases.lock().unwrap().push(timeout);
        if self.parking {
            let gen = self.wake_gen.lock().unwrap();
            let seen = *gen;
            let _parked = self
                .wake_cv
                .wait_timeout_while(gen, timeout.min(PARK_LIMIT), |gen| *gen == seen)
                .unwrap();
        }
        self.advance(timeout);
        for (mailbox, thread) in self.on_release.lock().unwrap().drain(..) {
            mailbox.deliver_completed(thread).unwrap();
        }
    }

    fn kse_wakeup(&self, mailbox: &KseMailbox) {
        self.wakeups.lock().unwrap().push(mailbox.kse());
        *self.wake_gen.lock().unwrap() += 1;
        self.wake_cv.notify_all();
    }

    fn kse_thr_interrupt(&self, thread: ThreadId) {
        self.interrupts.lock().unwrap().push(thread);
    }

    fn kse_exit(&self) {
        self.exits.fetch_add(1, Ordering::SeqCst);
    }

    fn time_of_day(&self) -> Duration {
        self.now()
    }
}

impl ContextSwitch for MockHost {
    fn switch_to(&self, kse: KseId, thread: ThreadId) {
        self.switches.lock().unwrap().push((kse, thread));
    }

    fn switch_out(&self, kse: KseId, thread: ThreadId) {
        self.switch_outs.lock().unwrap().push((kse, thread));
    }
}

impl SignalHook for MockHost {
    fn dispatch(&self, kse: KseId, signo: u32) {
        self.signals.lock().unwrap().push((kse, signo));
    }
}

pub fn config() -> SchedConfig {
    SchedConfig::new()
        .with_kse_stack_size(4096)
        .with_thread_stack_size(4096)
}

pub fn scheduler() -> Scheduler<MockHost> {
    Scheduler::new(MockHost::new(), config()).unwrap()
}

pub fn scheduler_with(config: SchedConfig) -> Scheduler<MockHost> {
    Scheduler::new(MockHost::new(), config).unwrap()
}
