//! FFI bindings for thread lifecycle and scheduling.

use std::{
    ffi::{c_int, c_void},
    ptr,
};

use super::{ToErrno, with_runtime};
use crate::{ExitStatus, Runtime, ThreadId, runtime};

/// Entry point of a thread created through [`__uthread_rt__create`].
pub type StartRoutine = extern "C" fn(arg: *mut c_void) -> *mut c_void;

/// Creates a thread running `start(arg)` and stores its id in `tid`.
///
/// # Safety
///
/// `tid` must be valid for writes. `arg` must stay valid for as long as
/// `start` uses it.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn __uthread_rt__create(tid: *mut usize, start: StartRoutine, arg: *mut c_void) -> c_int {
    if tid.is_null() {
        return -libc::EINVAL;
    }

    with_runtime(|rt| match rt.spawn(move |_| start(arg) as usize) {
        Ok(id) => {
            // SAFETY: Non-null, valid for writes per the caller.
            unsafe { tid.write(id.as_raw()) };
            0
        }
        Err(err) => err.to_errno(),
    })
}

/// Terminates the calling thread with `value` as its exit value.
///
/// Without a runtime the whole process exits.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn __uthread_rt__exit(value: *mut c_void) -> ! {
    let hosted = runtime::with_installed(|rt| rt as *const Runtime).unwrap_or(ptr::null());

    // SAFETY: A non-null pointer is the runtime installed on this OS thread,
    // alive for as long as any of its threads runs.
    match unsafe { hosted.as_ref() } {
        Some(rt) => rt.exit(value as usize),
        None => std::process::exit(0),
    }
}

/// Waits for thread `tid` and stores its exit value in `value` (if
/// non-null).
///
/// A thread terminated for touching foreign storage reports `EFAULT`, one
/// whose body panicked reports `ECANCELED`; neither has an exit value.
///
/// # Safety
///
/// `value` must be null or valid for writes.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn __uthread_rt__join(tid: usize, value: *mut *mut c_void) -> c_int {
    with_runtime(|rt| match rt.join(ThreadId::from_raw(tid)) {
        Ok(ExitStatus::Exited(exit)) => {
            if !value.is_null() {
                // SAFETY: Non-null, valid for writes per the caller.
                unsafe { value.write(exit as *mut c_void) };
            }
            0
        }
        Ok(ExitStatus::Faulted { .. }) => -libc::EFAULT,
        Ok(ExitStatus::Panicked) => -libc::ECANCELED,
        Err(err) => err.to_errno(),
    })
}

/// Returns the id of the calling thread (`0` without a runtime).
#[unsafe(no_mangle)]
pub unsafe extern "C" fn __uthread_rt__self() -> usize {
    runtime::with_installed(|rt| rt.current().as_raw()).unwrap_or(0)
}

/// Gives up the processor to the next ready thread.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn __uthread_rt__yield() -> c_int {
    with_runtime(|rt| {
        rt.yield_now();
        0
    })
}
