//! Host stand-in for unit tests
//!
//! Context switches are no-ops and the clock only moves when a KSE releases
//! itself, by exactly the timeout it asked for.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use core::time::Duration;

use crate::error::KernelError;
use crate::host::{ContextSwitch, Kernel, SignalHook};
use crate::kern::kse::KseMailbox;
use crate::types::{KseId, ThreadId};

#[derive(Debug, Default)]
pub struct NullHost {
    clock_ns: AtomicU64,
    fail_create: AtomicBool,
    pub releases: AtomicUsize,
    pub wakeups: AtomicUsize,
    pub exits: AtomicUsize,
    pub signals: spin::Mutex<Vec<(KseId, u32)>>,
}

impl NullHost {
    pub fn fail_kse_create(&self, fail: bool) {
        self.fail_create.store(fail, Ordering::SeqCst);
    }

    pub fn advance(&self, by: Duration) {
        let ns = u64::try_from(by.as_nanos()).unwrap_or(u64::MAX);
        self.clock_ns.fetch_add(ns, Ordering::SeqCst);
    }
}

impl Kernel for NullHost {
    fn kse_create(&self, _mailbox: &Arc<KseMailbox>, _new_group: bool) -> Result<(), KernelError> {
        if self.fail_create.load(Ordering::SeqCst) {
            Err(KernelError::Again)
        } else {
            Ok(())
        }
    }

    fn kse_release(&self, timeout: Duration) {
        self.releases.fetch_add(1, Ordering::SeqCst);
        self.advance(timeout);
    }

    fn kse_wakeup(&self, _mailbox: &KseMailbox) {
        self.wakeups.fetch_add(1, Ordering::SeqCst);
    }

    fn kse_thr_interrupt(&self, _thread: ThreadId) {}

    fn kse_exit(&self) {
        self.exits.fetch_add(1, Ordering::SeqCst);
    }

    fn time_of_day(&self) -> Duration {
        Duration::from_nanos(self.clock_ns.load(Ordering::SeqCst))
    }
}

impl ContextSwitch for NullHost {
    fn switch_to(&self, _kse: KseId, _thread: ThreadId) {}

    fn switch_out(&self, _kse: KseId, _thread: ThreadId) {}
}

impl SignalHook for NullHost {
    fn dispatch(&self, kse: KseId, signo: u32) {
        self.signals.lock().push((kse, signo));
    }
}
