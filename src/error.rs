//! Unified error types for kse_r using thiserror

use thiserror::Error;

use crate::types::{KseId, KsegId, ThreadId};

/// Failure reported by a host kernel primitive
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelError {
    #[error("kernel is out of execution contexts")]
    Again,

    #[error("kernel primitive not supported")]
    NotSupported,

    #[error("kernel error {0}")]
    Other(i32),
}

/// Recoverable scheduler failures
///
/// Invariant violations are not represented here; they abort through
/// [`crate::kern::fatal`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SchedError {
    #[error("out of memory allocating {0}")]
    NoMemory(&'static str),

    #[error("failed to spawn a KSE: {0}")]
    KernelResource(#[from] KernelError),

    #[error("unknown or stale KSE {0}")]
    InvalidKse(KseId),

    #[error("unknown or stale KSE group {0}")]
    InvalidKseg(KsegId),

    #[error("unknown or stale thread {0}")]
    InvalidThread(ThreadId),

    #[error("signal {0} out of range")]
    InvalidSignal(u32),

    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),

    #[error("operation not permitted: {0}")]
    NotPermitted(&'static str),
}

/// Result alias used throughout the crate
pub type Result<T> = core::result::Result<T, SchedError>;
