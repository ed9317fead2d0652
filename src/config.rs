//! Scheduler configuration
//!
//! Every tunable of the scheduler lives in one [`SchedConfig`] value that is
//! validated once when the scheduler is created.

use core::time::Duration;

use crate::error::{Result, SchedError};

/// Default time-slice quantum
pub const DEFAULT_QUANTUM: Duration = Duration::from_millis(20);

/// Upper bound on how long an idle KSE releases itself to the kernel
pub const DEFAULT_IDLE_CEILING: Duration = Duration::from_secs(120);

/// Default number of run queue priority levels
pub const DEFAULT_PRIORITY_LEVELS: usize = 64;

/// Maximum number of run queue priority levels
pub const MAX_PRIORITY_LEVELS: usize = 256;

/// Scheduler tunables
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedConfig {
    /// CPU time a thread may use before it loses its place in line
    pub quantum: Duration,
    /// High-water mark of the free KSE cache
    pub max_cached_kses: usize,
    /// High-water mark of the free KSE group cache
    pub max_cached_ksegs: usize,
    /// High-water mark of the free thread cache
    pub max_cached_threads: usize,
    /// Upcall stack size of each KSE
    pub kse_stack_size: usize,
    /// Stack size of threads created without an explicit size
    pub thread_stack_size: usize,
    /// Longest single release of an idle KSE
    pub idle_ceiling: Duration,
    /// Spins before a thread-level lock waiter switches out
    pub lock_spin_count: u32,
    /// Release period of a KSE waiting on an entity-level lock
    pub entity_lock_release: Duration,
    /// Number of run queue priority levels
    pub priority_levels: usize,
    /// Initial queue storage reserved per KSE group
    pub runq_capacity: usize,
}

impl Default for SchedConfig {
    fn default() -> Self {
        Self {
            quantum: DEFAULT_QUANTUM,
            max_cached_kses: 50,
            max_cached_ksegs: 50,
            max_cached_threads: 100,
            kse_stack_size: 64 * 1024,
            thread_stack_size: 256 * 1024,
            idle_ceiling: DEFAULT_IDLE_CEILING,
            lock_spin_count: 1000,
            entity_lock_release: Duration::from_millis(1),
            priority_levels: DEFAULT_PRIORITY_LEVELS,
            runq_capacity: 16,
        }
    }
}

impl SchedConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_quantum(mut self, quantum: Duration) -> Self {
        self.quantum = quantum;
        self
    }

    /// Set all three free-list high-water marks
    pub fn with_cache_limits(mut self, kses: usize, ksegs: usize, threads: usize) -> Self {
        self.max_cached_kses = kses;
        self.max_cached_ksegs = ksegs;
        self.max_cached_threads = threads;
        self
    }

    pub fn with_kse_stack_size(mut self, size: usize) -> Self {
        self.kse_stack_size = size;
        self
    }

    pub fn with_thread_stack_size(mut self, size: usize) -> Self {
        self.thread_stack_size = size;
        self
    }

    pub fn with_idle_ceiling(mut self, ceiling: Duration) -> Self {
        self.idle_ceiling = ceiling;
        self
    }

    pub fn with_lock_spin_count(mut self, spins: u32) -> Self {
        self.lock_spin_count = spins;
        self
    }

    pub fn with_priority_levels(mut self, levels: usize) -> Self {
        self.priority_levels = levels;
        self
    }

    /// Check the configuration for values the scheduler cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.quantum.is_zero() {
            return Err(SchedError::InvalidConfig("quantum must be non-zero"));
        }
        if self.priority_levels == 0 || self.priority_levels > MAX_PRIORITY_LEVELS {
            return Err(SchedError::InvalidConfig(
                "priority levels must be within 1..=256",
            ));
        }
        if self.kse_stack_size == 0 || self.thread_stack_size == 0 {
            return Err(SchedError::InvalidConfig("stack sizes must be non-zero"));
        }
        if self.idle_ceiling.is_zero() {
            return Err(SchedError::InvalidConfig("idle ceiling must be non-zero"));
        }
        Ok(())
    }
}
