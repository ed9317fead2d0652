//! Scheduler Performance Counters
//!
//! Every scheduler instance carries one [`SchedCounters`] block. Counters are
//! relaxed atomics: they are statistics, not synchronization.
//!
//! ## Counter Categories
//!
//! - **Dispatch**: resumes, voluntary and involuntary switch-outs, timeouts
//! - **Idle**: kernel releases of idle KSEs, idle KSEs woken for new work
//! - **Objects**: KSE, KSE group and thread allocations and frees
//! - **Threads**: live threads, high-water mark, GC reclaims
//! - **Signals**: pending signals dispatched

use core::sync::atomic::{AtomicU64, Ordering};

// ============================================================================
// Counter Type
// ============================================================================

/// Atomically updated named counter
#[derive(Debug)]
pub struct SchedCounter {
    value: AtomicU64,
    name: &'static str,
}

impl SchedCounter {
    pub const fn new(name: &'static str) -> Self {
        Self {
            value: AtomicU64::new(0),
            name,
        }
    }

    #[inline]
    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn add(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    #[inline]
    pub fn dec(&self) {
        self.value.fetch_sub(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn reset(&self) {
        self.value.store(0, Ordering::Relaxed);
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Update max if current value is higher
    pub fn update_max(&self, current: u64) {
        self.value.fetch_max(current, Ordering::Relaxed);
    }
}

// ============================================================================
// Counter Block
// ============================================================================

/// All counters of one scheduler
#[derive(Debug)]
pub struct SchedCounters {
    // Dispatch
    pub context_switches: SchedCounter,
    pub voluntary_switchouts: SchedCounter,
    pub involuntary_switchouts: SchedCounter,
    pub timeouts: SchedCounter,

    // Idle
    pub idle_releases: SchedCounter,
    pub idle_wakeups: SchedCounter,

    // Objects
    pub kse_allocs: SchedCounter,
    pub kse_frees: SchedCounter,
    pub kseg_allocs: SchedCounter,
    pub kseg_frees: SchedCounter,
    pub thread_allocs: SchedCounter,
    pub thread_frees: SchedCounter,

    // Threads
    pub threads_current: SchedCounter,
    pub threads_max: SchedCounter,
    pub threads_total: SchedCounter,
    pub gc_reclaimed: SchedCounter,

    // Signals
    pub signals_dispatched: SchedCounter,
}

impl SchedCounters {
    pub const fn new() -> Self {
        Self {
            context_switches: SchedCounter::new("context_switches"),
            voluntary_switchouts: SchedCounter::new("voluntary_switchouts"),
            involuntary_switchouts: SchedCounter::new("involuntary_switchouts"),
            timeouts: SchedCounter::new("timeouts"),
            idle_releases: SchedCounter::new("idle_releases"),
            idle_wakeups: SchedCounter::new("idle_wakeups"),
            kse_allocs: SchedCounter::new("kse_allocs"),
            kse_frees: SchedCounter::new("kse_frees"),
            kseg_allocs: SchedCounter::new("kseg_allocs"),
            kseg_frees: SchedCounter::new("kseg_frees"),
            thread_allocs: SchedCounter::new("thread_allocs"),
            thread_frees: SchedCounter::new("thread_frees"),
            threads_current: SchedCounter::new("threads_current"),
            threads_max: SchedCounter::new("threads_max"),
            threads_total: SchedCounter::new("threads_total"),
            gc_reclaimed: SchedCounter::new("gc_reclaimed"),
            signals_dispatched: SchedCounter::new("signals_dispatched"),
        }
    }

    /// Track a thread entering scheduling
    pub fn thread_started(&self) {
        self.threads_current.inc();
        self.threads_total.inc();
        self.threads_max.update_max(self.threads_current.get());
    }

    /// Track a thread retired by the scheduler
    pub fn thread_retired(&self) {
        self.threads_current.dec();
    }

    /// Take a snapshot of all counters
    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            context_switches: self.context_switches.get(),
            voluntary_switchouts: self.voluntary_switchouts.get(),
            involuntary_switchouts: self.involuntary_switchouts.get(),
            timeouts: self.timeouts.get(),
            idle_releases: self.idle_releases.get(),
            idle_wakeups: self.idle_wakeups.get(),
            kse_allocs: self.kse_allocs.get(),
            kse_frees: self.kse_frees.get(),
            kseg_allocs: self.kseg_allocs.get(),
            kseg_frees: self.kseg_frees.get(),
            thread_allocs: self.thread_allocs.get(),
            thread_frees: self.thread_frees.get(),
            threads_current: self.threads_current.get(),
            threads_max: self.threads_max.get(),
            threads_total: self.threads_total.get(),
            gc_reclaimed: self.gc_reclaimed.get(),
            signals_dispatched: self.signals_dispatched.get(),
        }
    }

    /// Reset all counters to zero
    pub fn reset_all(&self) {
        for counter in [
            &self.context_switches,
            &self.voluntary_switchouts,
            &self.involuntary_switchouts,
            &self.timeouts,
            &self.idle_releases,
            &self.idle_wakeups,
            &self.kse_allocs,
            &self.kse_frees,
            &self.kseg_allocs,
            &self.kseg_frees,
            &self.thread_allocs,
            &self.thread_frees,
            &self.threads_current,
            &self.threads_max,
            &self.threads_total,
            &self.gc_reclaimed,
            &self.signals_dispatched,
        ] {
            counter.reset();
        }
    }
}

impl Default for SchedCounters {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time copy of [`SchedCounters`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CounterSnapshot {
    pub context_switches: u64,
    pub voluntary_switchouts: u64,
    pub involuntary_switchouts: u64,
    pub timeouts: u64,
    pub idle_releases: u64,
    pub idle_wakeups: u64,
    pub kse_allocs: u64,
    pub kse_frees: u64,
    pub kseg_allocs: u64,
    pub kseg_frees: u64,
    pub thread_allocs: u64,
    pub thread_frees: u64,
    pub threads_current: u64,
    pub threads_max: u64,
    pub threads_total: u64,
    pub gc_reclaimed: u64,
    pub signals_dispatched: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_switch_counts_and_reset() {
        let counter = SchedCounter::new("switches");
        counter.add(3);
        counter.inc();
        counter.dec();
        assert_eq!((counter.name(), counter.get()), ("switches", 3));
        counter.reset();
        assert_eq!(counter.get(), 0);
    }

    #[test]
    fn test_high_water_only_rises() {
        let peak = SchedCounter::new("peak");
        for current in [4, 2, 7, 7, 1] {
            peak.update_max(current);
        }
        assert_eq!(peak.get(), 7);
    }

    #[test]
    fn test_thread_tracking() {
        let counters = SchedCounters::new();
        counters.thread_started();
        counters.thread_started();
        counters.thread_retired();

        let snap = counters.snapshot();
        assert_eq!(snap.threads_current, 1);
        assert_eq!(snap.threads_max, 2);
        assert_eq!(snap.threads_total, 2);

        counters.reset_all();
        assert_eq!(counters.snapshot(), CounterSnapshot::default());
    }
}
