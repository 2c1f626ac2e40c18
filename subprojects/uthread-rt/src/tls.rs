//! # Thread-local storage
//!
//! Each logical thread may own one storage region: a run of whole pages that
//! stay inaccessible except while the runtime copies bytes in or out on the
//! owner's behalf. Any other access to a region page faults, and the fault
//! handler in [`fault`] terminates the offending thread.
//!
//! Cloning a region shares its pages. A shared page is copied the first time
//! either side writes to it, so every region keeps seeing the bytes it would
//! have seen without sharing.

use std::collections::HashMap;

use uthread_sys_mem::{MapError, ProtectError};

use crate::{Runtime, preempt::NoPreempt, tcb::ThreadId};

pub(crate) mod fault;
mod region;

use self::region::TlsRegion;

/// Storage regions, keyed by owner.
#[derive(Debug, Default)]
pub(crate) struct TlsTable {
    regions: HashMap<ThreadId, TlsRegion>,
}

impl TlsTable {
    /// Checks whether `addr` lies in a page of any region.
    pub(crate) fn owns_address(&self, addr: usize) -> bool {
        self.regions.values().any(|region| region.contains(addr))
    }
}

impl Runtime {
    /// Gives the calling thread a zero-filled storage region of `size` bytes.
    pub fn tls_create(&self, size: usize) -> Result<(), TlsError> {
        let _guard = NoPreempt::new(self);
        let me = self.current();

        if size == 0 {
            return Err(TlsError::InvalidSize);
        }

        let mut tls = self.tls.borrow_mut();
        if tls.regions.contains_key(&me) {
            return Err(TlsError::AlreadyExists(me));
        }

        let region = TlsRegion::new(size)?;
        log::debug!("thread {me} created a {size}-byte storage region ({} pages)", region.page_count());
        tls.regions.insert(me, region);
        Ok(())
    }

    /// Copies `buf` into the caller's region, starting at `offset`.
    ///
    /// Pages the caller shares with a clone are replaced by private copies
    /// before the write lands.
    pub fn tls_write(&self, offset: usize, buf: &[u8]) -> Result<(), TlsError> {
        let _guard = NoPreempt::new(self);
        let me = self.current();

        let mut tls = self.tls.borrow_mut();
        let region = tls.regions.get_mut(&me).ok_or(TlsError::OutOfRange)?;

        let copied = region.write(offset, buf)?;
        if copied > 0 {
            log::debug!("thread {me} took private copies of {copied} shared pages");
        }
        Ok(())
    }

    /// Fills `buf` from the caller's region, starting at `offset`.
    pub fn tls_read(&self, offset: usize, buf: &mut [u8]) -> Result<(), TlsError> {
        let _guard = NoPreempt::new(self);
        let me = self.current();

        let tls = self.tls.borrow();
        let region = tls.regions.get(&me).ok_or(TlsError::OutOfRange)?;
        region.read(offset, buf)
    }

    /// Destroys the caller's region.
    ///
    /// Pages still shared with a clone stay mapped for it.
    pub fn tls_destroy(&self) -> Result<(), TlsError> {
        let _guard = NoPreempt::new(self);
        let me = self.current();

        let region = self.tls.borrow_mut().regions.remove(&me).ok_or(TlsError::NotFound(me))?;
        log::debug!("thread {me} destroyed its storage region");
        drop(region);
        Ok(())
    }

    /// Gives the caller a region sharing every page of `source`'s region.
    ///
    /// No bytes are copied until one side writes.
    pub fn tls_clone(&self, source: ThreadId) -> Result<(), TlsError> {
        let _guard = NoPreempt::new(self);
        let me = self.current();

        let mut tls = self.tls.borrow_mut();
        if tls.regions.contains_key(&me) {
            return Err(TlsError::Conflict(me));
        }
        let region = tls
            .regions
            .get(&source)
            .map(TlsRegion::share)
            .ok_or(TlsError::NotFound(source))?;

        log::debug!("thread {me} cloned the storage region of thread {source}");
        tls.regions.insert(me, region);
        Ok(())
    }

    /// Base addresses of the pages backing `id`'s region, in order.
    ///
    /// Two regions report the same address for a page they still share.
    pub fn tls_page_addresses(&self, id: ThreadId) -> Option<Vec<usize>> {
        let _guard = NoPreempt::new(self);
        self.tls.borrow().regions.get(&id).map(TlsRegion::page_addresses)
    }

    /// Drops the region of a thread being reclaimed.
    pub(crate) fn release_tls(&self, id: ThreadId) {
        if self.tls.borrow_mut().regions.remove(&id).is_some() {
            log::debug!("released the storage region of thread {id}");
        }
    }
}

/// Thread-local storage errors
#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    /// The calling thread already owns a region.
    #[error("Thread {0} already has a storage region")]
    AlreadyExists(ThreadId),

    /// A region must hold at least one byte.
    #[error("Storage region size must be non-zero")]
    InvalidSize,

    /// The caller has no region, or the access does not fit inside it.
    #[error("Access outside the storage region")]
    OutOfRange,

    /// The thread has no region.
    #[error("Thread {0} has no storage region")]
    NotFound(ThreadId),

    /// The calling thread already owns a region and cannot clone another.
    #[error("Thread {0} already has a storage region to clone into")]
    Conflict(ThreadId),

    /// No memory left for region pages.
    #[error("Out of memory for storage pages: {0}")]
    OutOfMemory(#[from] MapError),

    /// Page protection could not be changed.
    #[error("Changing page protection failed: {0}")]
    Protect(#[from] ProtectError),
}

#[cfg(test)]
mod tests {
    use std::{cell::Cell, rc::Rc};

    use uthread_sys_mem::alignment::page_size;

    use super::*;
    use crate::{Config, ExitStatus, PreemptionMode, testing};

    fn cooperative(max_threads: usize) -> Box<Runtime> {
        Runtime::new(
            Config::default()
                .with_max_threads(max_threads)
                .with_preemption(PreemptionMode::Disabled),
        )
        .expect("runtime should start")
    }

    #[test]
    fn written_bytes_read_back_across_page_boundaries() {
        let rt = cooperative(4);
        let size = 2 * page_size() + 100;
        rt.tls_create(size).expect("create should succeed");

        let offset = page_size() - 3;
        rt.tls_write(offset, b"straddle").expect("write should fit");

        let mut buf = [0u8; 8];
        rt.tls_read(offset, &mut buf).expect("read should fit");
        assert_eq!(&buf, b"straddle");

        let mut untouched = [0xFFu8; 4];
        rt.tls_read(size - 4, &mut untouched).expect("read should fit");
        assert_eq!(untouched, [0; 4], "fresh regions are zero-filled");
    }

    #[test]
    fn accesses_past_the_declared_size_are_rejected() {
        let rt = cooperative(4);
        rt.tls_create(10).expect("create should succeed");

        let mut buf = [0u8; 4];
        assert!(rt.tls_read(6, &mut buf).is_ok());
        assert!(matches!(rt.tls_read(7, &mut buf), Err(TlsError::OutOfRange)));
        assert!(matches!(rt.tls_write(10, &[1]), Err(TlsError::OutOfRange)));
        assert!(matches!(rt.tls_write(usize::MAX, &[1, 2]), Err(TlsError::OutOfRange)));
        assert!(rt.tls_write(10, &[]).is_ok(), "an empty access at the end fits");
    }

    #[test]
    fn lifecycle_errors() {
        let rt = cooperative(4);
        let me = rt.current();
        let mut buf = [0u8; 1];

        assert!(matches!(rt.tls_create(0), Err(TlsError::InvalidSize)));
        assert!(matches!(rt.tls_read(0, &mut buf), Err(TlsError::OutOfRange)));
        assert!(matches!(rt.tls_destroy(), Err(TlsError::NotFound(t)) if t == me));
        assert!(matches!(rt.tls_clone(ThreadId::from_raw(1)), Err(TlsError::NotFound(_))));

        rt.tls_create(1).expect("create should succeed");
        assert!(matches!(rt.tls_create(1), Err(TlsError::AlreadyExists(t)) if t == me));
        assert!(matches!(rt.tls_clone(me), Err(TlsError::Conflict(t)) if t == me));

        rt.tls_destroy().expect("destroy should succeed");
        rt.tls_create(1).expect("create after destroy should succeed");
    }

    #[test]
    fn clone_copies_on_write_in_both_directions() {
        let rt = cooperative(4);
        let size = 3 * page_size();
        rt.tls_create(size).expect("create should succeed");
        rt.tls_write(0, b"parent").expect("write should fit");
        let parent = rt.current();

        let child = rt
            .spawn(move |rt| {
                rt.tls_clone(parent).expect("clone should succeed");

                let mut buf = [0u8; 6];
                rt.tls_read(0, &mut buf).expect("read should fit");
                assert_eq!(&buf, b"parent");

                // Let the parent overwrite its copy, then write ours.
                rt.yield_now();
                rt.tls_read(0, &mut buf).expect("read should fit");
                assert_eq!(&buf, b"parent", "the parent's write stays private");

                rt.tls_write(2 * page_size(), b"child").expect("write should fit");
                rt.yield_now();
                0
            })
            .expect("spawn should succeed");

        rt.yield_now();
        let shared = rt.tls_page_addresses(parent).expect("parent has a region");
        assert_eq!(rt.tls_page_addresses(child), Some(shared.clone()));

        rt.tls_write(0, b"PARENT").expect("write should fit");
        rt.yield_now();

        let mut buf = [0u8; 5];
        rt.tls_read(2 * page_size(), &mut buf).expect("read should fit");
        assert_eq!(buf, [0; 5], "the child's write stays private");

        let parent_pages = rt.tls_page_addresses(parent).expect("parent has a region");
        let child_pages = rt.tls_page_addresses(child).expect("child has a region");
        assert_ne!(parent_pages[0], shared[0]);
        assert_eq!(child_pages[0], shared[0]);
        assert_eq!(parent_pages[1], child_pages[1], "untouched pages stay shared");
        assert_eq!(parent_pages[2], shared[2]);
        assert_ne!(child_pages[2], shared[2]);

        assert_eq!(rt.join(child).ok(), Some(ExitStatus::Exited(0)));
    }

    #[test]
    fn destroying_one_side_keeps_shared_pages_for_the_other() {
        let rt = cooperative(4);
        rt.tls_create(page_size()).expect("create should succeed");
        rt.tls_write(0, b"kept").expect("write should fit");
        let parent = rt.current();

        let child = rt
            .spawn(move |rt| {
                rt.tls_clone(parent).expect("clone should succeed");
                rt.yield_now();

                let mut buf = [0u8; 4];
                rt.tls_read(0, &mut buf).expect("read should fit");
                usize::from(&buf == b"kept")
            })
            .expect("spawn should succeed");

        rt.yield_now();
        rt.tls_destroy().expect("destroy should succeed");

        assert_eq!(rt.join(child).ok(), Some(ExitStatus::Exited(1)));
        assert_eq!(rt.tls_page_addresses(child), None, "join releases the region");
    }

    #[test]
    fn regions_are_released_through_repeated_cycles() {
        let rt = cooperative(4);

        for round in 0..64u8 {
            rt.tls_create(4 * page_size()).expect("create should succeed");
            rt.tls_write(0, &[round]).expect("write should fit");
            let parent = rt.current();

            let child = rt
                .spawn(move |rt| {
                    rt.tls_clone(parent).expect("clone should succeed");
                    rt.tls_write(page_size(), &[round]).expect("write should fit");
                    0
                })
                .expect("spawn should succeed");

            rt.join(child).expect("join should succeed");
            rt.tls_destroy().expect("destroy should succeed");
            assert!(rt.tls.borrow().regions.is_empty());
        }
    }

    #[test]
    fn touching_another_threads_page_terminates_the_toucher() {
        let rt = cooperative(4);
        rt.tls_create(page_size()).expect("create should succeed");
        rt.tls_write(0, &[42]).expect("write should fit");

        let target = rt.tls_page_addresses(rt.current()).expect("main has a region")[0];
        let survived = Rc::new(Cell::new(false));

        let flag = Rc::clone(&survived);
        let intruder = rt
            .spawn(move |_| {
                // SAFETY: Not safe at all; the page is mapped `PROT_NONE` and the
                // read faults.
                let stolen = unsafe { std::ptr::read_volatile(target as *const u8) };
                flag.set(true);
                usize::from(stolen)
            })
            .expect("spawn should succeed");

        assert_eq!(rt.join(intruder).ok(), Some(ExitStatus::Faulted { address: target }));
        assert!(!survived.get());

        let mut buf = [0u8; 1];
        rt.tls_read(0, &mut buf).expect("read should fit");
        assert_eq!(buf, [42], "the victim's data is intact");
    }

    #[test]
    fn thread_zero_touching_foreign_storage_ends_only_thread_zero() {
        let name = "tls::tests::thread_zero_touching_foreign_storage_ends_only_thread_zero";
        let Some(output) = testing::isolated(name, || {
            let rt = cooperative(4);
            let page = Rc::new(Cell::new(0usize));

            let slot = Rc::clone(&page);
            rt.spawn(move |rt| {
                rt.tls_create(page_size()).expect("create should succeed");
                slot.set(rt.tls_page_addresses(rt.current()).expect("worker has a region")[0]);
                rt.yield_now();
                println!("worker outlived thread 0");
                0
            })
            .expect("spawn should succeed");

            rt.yield_now();
            // SAFETY: Not safe at all; the page is mapped `PROT_NONE` and the
            // read faults.
            let stolen = unsafe { std::ptr::read_volatile(page.get() as *const u8) };
            println!("thread 0 survived the fault: {stolen}");
        }) else {
            return;
        };

        let stdout = testing::stdout_of(&output);
        assert!(output.status.success(), "child failed: {output:?}");
        assert!(stdout.contains("worker outlived thread 0"));
        assert!(!stdout.contains("thread 0 survived the fault"));
    }
}
