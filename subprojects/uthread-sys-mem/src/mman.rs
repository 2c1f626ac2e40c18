//! Thin wrappers over the host's memory-mapping system calls.
//!
//! All lengths passed here are rounded by the caller; the functions only
//! translate between Rust types and the C interface and capture `errno`.

use std::{io, ptr::NonNull};

use bitflags::bitflags;

bitflags! {
    /// Access permissions of a mapped range.
    ///
    /// Values match the host's `PROT_*` constants.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    #[repr(transparent)]
    pub struct Protection: i32 {
        /// No access; any load or store faults
        const NONE = libc::PROT_NONE;
        /// Read permission
        const READ = libc::PROT_READ;
        /// Write permission
        const WRITE = libc::PROT_WRITE;
        /// Read/write permissions
        const RW = Self::READ.bits() | Self::WRITE.bits();
    }
}

/// Maps `len` bytes of private, anonymous, zero-filled memory.
///
/// `len` must be non-zero and page-aligned.
pub fn map_anonymous(len: usize, prot: Protection) -> Result<NonNull<u8>, MapError> {
    if len == 0 {
        return Err(MapError::ZeroLength);
    }

    // SAFETY: An anonymous private mapping at a kernel-chosen address does not
    // alias any existing Rust object.
    let ptr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            len,
            prot.bits(),
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        return Err(MapError::Os(io::Error::last_os_error()));
    }

    NonNull::new(ptr.cast()).ok_or(MapError::Os(io::Error::from_raw_os_error(libc::ENOMEM)))
}

/// Unmaps `len` bytes starting at `ptr`.
///
/// # Safety
///
/// The range must have been returned by [`map_anonymous`] (or be a page-aligned
/// part of such a range) and nothing may access it afterwards.
pub unsafe fn unmap(ptr: NonNull<u8>, len: usize) -> Result<(), UnmapError> {
    // SAFETY: Upheld by the caller.
    let rc = unsafe { libc::munmap(ptr.as_ptr().cast(), len) };
    if rc != 0 {
        return Err(UnmapError(io::Error::last_os_error()));
    }
    Ok(())
}

/// Changes the access permissions of `len` bytes starting at `ptr`.
///
/// # Safety
///
/// The range must be page-aligned and lie inside a mapping owned by the
/// caller. Revoking access to memory that live references point at makes any
/// later use of those references fault.
pub unsafe fn protect(ptr: NonNull<u8>, len: usize, prot: Protection) -> Result<(), ProtectError> {
    // SAFETY: Upheld by the caller.
    let rc = unsafe { libc::mprotect(ptr.as_ptr().cast(), len, prot.bits()) };
    if rc != 0 {
        return Err(ProtectError(io::Error::last_os_error()));
    }
    Ok(())
}

/// Errors that can occur when mapping memory.
#[derive(Debug, thiserror::Error)]
pub enum MapError {
    /// A zero-length mapping was requested.
    #[error("Cannot map a zero-length region")]
    ZeroLength,

    /// The size computation for the mapping overflowed.
    #[error("Mapping size overflows the address space")]
    SizeOverflow,

    /// The `mmap` system call failed.
    ///
    /// Usually `ENOMEM`: the address space or the overcommit budget is exhausted.
    #[error("mmap failed: {0}")]
    Os(#[source] io::Error),
}

/// The `munmap` system call failed.
#[derive(Debug, thiserror::Error)]
#[error("munmap failed: {0}")]
pub struct UnmapError(#[source] pub io::Error);

/// The `mprotect` system call failed.
#[derive(Debug, thiserror::Error)]
#[error("mprotect failed: {0}")]
pub struct ProtectError(#[source] pub io::Error);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alignment::page_size;

    #[test]
    fn map_write_protect_unmap() {
        let len = 2 * page_size();
        let ptr = map_anonymous(len, Protection::RW).expect("mapping should succeed");

        unsafe { ptr.as_ptr().write_bytes(0xA5, len) };
        let protected = unsafe { protect(ptr, len, Protection::READ) };
        let last = unsafe { ptr.as_ptr().add(len - 1).read() };
        let unmapped = unsafe { unmap(ptr, len) };

        assert!(protected.is_ok());
        assert_eq!(last, 0xA5);
        assert!(unmapped.is_ok());
    }

    #[test]
    fn zero_length_map_is_rejected() {
        assert!(matches!(map_anonymous(0, Protection::RW), Err(MapError::ZeroLength)));
    }
}
