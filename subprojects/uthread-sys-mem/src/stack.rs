//! Thread stack memory.
//!
//! A stack is one anonymous mapping: the lowest page is a `PROT_NONE` guard,
//! the rest is read/write. A stack overflow runs into the guard and faults
//! instead of silently corrupting the neighbouring mapping.
//!
//! ```text
//! base                base + guard                       base + len
//!  | guard (PROT_NONE) |  usable stack (RW)  ... grows <- |  top
//! ```

use std::ptr::NonNull;

use crate::{
    alignment::{page_size, round_up_to_page},
    mman::{self, MapError, Protection},
};

/// Owned stack memory with a guard page, unmapped on drop.
#[derive(Debug)]
pub struct StackMemory {
    /// Start of the mapping (the guard page).
    base: NonNull<u8>,

    /// Total mapping length, guard included.
    len: usize,
}

impl StackMemory {
    /// Allocates a stack with at least `size` usable bytes.
    ///
    /// The usable size is rounded up to the page size, and one guard page is
    /// added below it.
    pub fn alloc(size: usize) -> Result<Self, AllocError> {
        if size == 0 {
            return Err(AllocError::ZeroSize);
        }

        let guard = page_size();
        let usable = round_up_to_page(size).ok_or(AllocError::Map(MapError::SizeOverflow))?;
        let len = usable
            .checked_add(guard)
            .ok_or(AllocError::Map(MapError::SizeOverflow))?;

        let base = mman::map_anonymous(len, Protection::RW)?;
        let stack = Self { base, len };

        // SAFETY: The guard page is the first page of the mapping just created,
        // and nothing references it.
        unsafe { mman::protect(base, guard, Protection::NONE) }?;

        Ok(stack)
    }

    /// Returns the one-past-the-end address of the usable region.
    ///
    /// Stacks grow downwards, so this is the initial stack pointer.
    pub fn top(&self) -> *mut u8 {
        // SAFETY: `len` is the length of the mapping starting at `base`.
        unsafe { self.base.as_ptr().add(self.len) }
    }
}

impl Drop for StackMemory {
    fn drop(&mut self) {
        // SAFETY: The mapping is owned by this value and no context runs on it
        // anymore once its owner decided to drop it.
        let _ = unsafe { mman::unmap(self.base, self.len) };
    }
}

/// Errors that can occur when allocating stack memory.
#[derive(Debug, thiserror::Error)]
pub enum AllocError {
    /// A zero-sized stack was requested.
    #[error("Stack size must be non-zero")]
    ZeroSize,

    /// The mapping could not be created.
    #[error("Stack mapping failed: {0}")]
    Map(#[from] MapError),

    /// The guard page could not be protected.
    #[error("Stack guard setup failed: {0}")]
    Guard(#[from] mman::ProtectError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_rounds_up_and_exposes_writable_range() {
        let page = page_size();

        let stack = StackMemory::alloc(page + 1).expect("stack allocation should succeed");

        assert_eq!(stack.len, 3 * page, "two usable pages and the guard");
        assert_eq!(stack.top() as usize - stack.base.as_ptr() as usize, stack.len);
        unsafe {
            stack.base.as_ptr().add(page).write(1);
            stack.top().sub(1).write(2);
        }
    }

    #[test]
    fn zero_sized_stack_is_rejected() {
        assert!(matches!(StackMemory::alloc(0), Err(AllocError::ZeroSize)));
    }
}
