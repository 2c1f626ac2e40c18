//! Inaccessible pages that can be opened on demand.
//!
//! A [`ProtectedPage`] is a single anonymous page mapped `PROT_NONE`. Any
//! access faults until [`ProtectedPage::open`] grants read/write permission,
//! and [`ProtectedPage::close`] revokes it again.

use std::{ptr::NonNull, slice};

use crate::{
    alignment::page_size,
    mman::{self, MapError, ProtectError, Protection},
};

/// One `PROT_NONE` page, unmapped on drop.
#[derive(Debug)]
pub struct ProtectedPage {
    ptr: NonNull<u8>,
}

impl ProtectedPage {
    /// Maps a fresh, zero-filled, inaccessible page.
    pub fn new() -> Result<Self, MapError> {
        let ptr = mman::map_anonymous(page_size(), Protection::NONE)?;
        Ok(Self { ptr })
    }

    /// Base address of the page.
    pub fn addr(&self) -> usize {
        self.ptr.as_ptr() as usize
    }

    /// Checks whether `addr` lies inside this page.
    pub fn contains(&self, addr: usize) -> bool {
        let base = self.addr();
        addr >= base && addr < base + page_size()
    }

    /// Grants read/write access to the page.
    pub fn open(&self) -> Result<(), ProtectError> {
        // SAFETY: The page is owned by `self`, and granting access cannot
        // invalidate any reference.
        unsafe { mman::protect(self.ptr, page_size(), Protection::RW) }
    }

    /// Revokes all access to the page.
    ///
    /// Any slice obtained through [`ProtectedPage::as_slice`] or
    /// [`ProtectedPage::as_mut_slice`] must be dead by then.
    pub fn close(&self) -> Result<(), ProtectError> {
        // SAFETY: The page is owned by `self`; callers only hold slices into it
        // between `open` and `close`.
        unsafe { mman::protect(self.ptr, page_size(), Protection::NONE) }
    }

    /// Views the page contents.
    ///
    /// # Safety
    ///
    /// The page must be open for the whole lifetime of the returned slice, and
    /// no mutable slice of it may be alive.
    pub unsafe fn as_slice(&self) -> &[u8] {
        // SAFETY: Upheld by the caller; the mapping is exactly one page long.
        unsafe { slice::from_raw_parts(self.ptr.as_ptr(), page_size()) }
    }

    /// Mutably views the page contents.
    ///
    /// # Safety
    ///
    /// The page must be open for the whole lifetime of the returned slice, and
    /// no other slice of it may be alive.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn as_mut_slice(&self) -> &mut [u8] {
        // SAFETY: Upheld by the caller; the mapping is exactly one page long.
        unsafe { slice::from_raw_parts_mut(self.ptr.as_ptr(), page_size()) }
    }
}

impl Drop for ProtectedPage {
    fn drop(&mut self) {
        // SAFETY: The page is owned by `self` and no slice outlives it.
        let _ = unsafe { mman::unmap(self.ptr, page_size()) };
    }
}
