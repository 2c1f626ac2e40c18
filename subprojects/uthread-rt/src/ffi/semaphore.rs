//! FFI bindings for semaphores.
//!
//! Semaphores are named by the 64-bit value of [`SemaphoreId::to_raw`].

use std::ffi::{c_int, c_uint};

use super::{to_rc, with_runtime};
use crate::SemaphoreId;

/// Creates a semaphore holding `value` units and stores its handle in `sem`.
///
/// # Safety
///
/// `sem` must be valid for writes.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn __uthread_rt__sem_init(sem: *mut u64, value: c_uint) -> c_int {
    if sem.is_null() {
        return -libc::EINVAL;
    }

    with_runtime(|rt| {
        let id = rt.sem_init(value as usize);
        // SAFETY: Non-null, valid for writes per the caller.
        unsafe { sem.write(id.to_raw()) };
        0
    })
}

/// Takes one unit, blocking while none is available.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn __uthread_rt__sem_wait(sem: u64) -> c_int {
    with_runtime(|rt| to_rc(rt.sem_wait(SemaphoreId::from_raw(sem))))
}

/// Releases one unit, handing it to the oldest waiter if there is one.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn __uthread_rt__sem_post(sem: u64) -> c_int {
    with_runtime(|rt| to_rc(rt.sem_post(SemaphoreId::from_raw(sem))))
}

/// Destroys a semaphore; its waiters fail with `EINVAL`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn __uthread_rt__sem_destroy(sem: u64) -> c_int {
    with_runtime(|rt| to_rc(rt.sem_destroy(SemaphoreId::from_raw(sem))))
}
