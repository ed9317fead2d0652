//! Stack memory for KSE upcalls and threads

use alloc::boxed::Box;
use alloc::vec::Vec;

use crate::error::{Result, SchedError};

/// An owned, zero-filled stack region
pub struct Stack {
    mem: Box<[u8]>,
}

impl Stack {
    /// Allocate `size` bytes, reporting exhaustion instead of aborting
    pub fn new(size: usize) -> Result<Self> {
        let mut mem = Vec::new();
        mem.try_reserve_exact(size)
            .map_err(|_| SchedError::NoMemory("stack"))?;
        mem.resize(size, 0);
        Ok(Self {
            mem: mem.into_boxed_slice(),
        })
    }

    pub fn size(&self) -> usize {
        self.mem.len()
    }

    /// Lowest address of the region
    pub fn base(&self) -> *const u8 {
        self.mem.as_ptr()
    }

    /// One past the highest address (initial stack pointer on descending
    /// stacks)
    pub fn top(&self) -> *const u8 {
        self.mem.as_ptr_range().end
    }
}

impl core::fmt::Debug for Stack {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Stack")
            .field("base", &self.base())
            .field("size", &self.size())
            .finish()
    }
}
