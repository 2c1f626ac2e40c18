//! FFI bindings for thread-local storage regions.

use std::{ffi::c_int, slice};

use super::{to_rc, with_runtime};
use crate::ThreadId;

/// Gives the calling thread a storage region of `size` bytes.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn __uthread_rt__tls_create(size: usize) -> c_int {
    with_runtime(|rt| to_rc(rt.tls_create(size)))
}

/// Copies `len` bytes from `buf` into the caller's region at `offset`.
///
/// # Safety
///
/// `buf` must be valid for reads of `len` bytes.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn __uthread_rt__tls_write(offset: usize, len: usize, buf: *const u8) -> c_int {
    if buf.is_null() && len > 0 {
        return -libc::EINVAL;
    }

    // SAFETY: Valid for `len` bytes per the caller; an empty slice needs no
    // backing memory.
    let data = if len == 0 { &[][..] } else { unsafe { slice::from_raw_parts(buf, len) } };
    with_runtime(|rt| to_rc(rt.tls_write(offset, data)))
}

/// Copies `len` bytes of the caller's region at `offset` into `buf`.
///
/// # Safety
///
/// `buf` must be valid for writes of `len` bytes.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn __uthread_rt__tls_read(offset: usize, len: usize, buf: *mut u8) -> c_int {
    if buf.is_null() && len > 0 {
        return -libc::EINVAL;
    }

    // SAFETY: As in `__uthread_rt__tls_write`.
    let data = if len == 0 { &mut [][..] } else { unsafe { slice::from_raw_parts_mut(buf, len) } };
    with_runtime(|rt| to_rc(rt.tls_read(offset, data)))
}

/// Destroys the caller's storage region.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn __uthread_rt__tls_destroy() -> c_int {
    with_runtime(|rt| to_rc(rt.tls_destroy()))
}

/// Gives the caller a copy-on-write clone of thread `tid`'s region.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn __uthread_rt__tls_clone(tid: usize) -> c_int {
    with_runtime(|rt| to_rc(rt.tls_clone(ThreadId::from_raw(tid))))
}
