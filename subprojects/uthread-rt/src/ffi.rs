//! FFI bindings for the `uthread-rt` crate
//!
//! Every call returns `0` on success or a negated `errno` value. The runtime is
//! hosted by the OS thread that called [`__uthread_rt__init`] and every other
//! call must come from that OS thread.

use std::{cell::Cell, ffi::c_int, ptr};

use crate::{
    Config, CreateError, InitError, JoinError, Runtime, SemaphoreError, TlsError, runtime,
};

mod semaphore;
mod thread;
mod tls;

thread_local! {
    /// The runtime created through [`__uthread_rt__init`].
    static HOSTED: Cell<*mut Runtime> = const { Cell::new(ptr::null_mut()) };
}

/// Builds a runtime from the environment (see [`Config::from_env`]) and makes
/// the caller thread 0.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn __uthread_rt__init() -> c_int {
    let rt = match Config::from_env().map_err(InitError::from).and_then(Runtime::new) {
        Ok(rt) => rt,
        Err(err) => {
            log::error!("runtime initialization failed: {err}");
            return err.to_errno();
        }
    };

    HOSTED.with(|hosted| hosted.set(Box::into_raw(rt)));
    0
}

/// Tears down the runtime built by [`__uthread_rt__init`].
///
/// Must be called from thread 0.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn __uthread_rt__fini() -> c_int {
    let rt = HOSTED.with(|hosted| hosted.replace(ptr::null_mut()));
    if rt.is_null() {
        return -libc::ESRCH;
    }

    // SAFETY: The pointer comes from `Box::into_raw` in `__uthread_rt__init`
    // and was taken out of `HOSTED`, so it is freed once.
    drop(unsafe { Box::from_raw(rt) });
    0
}

/// Runs `f` with the runtime hosted by the calling OS thread, or fails with
/// `ESRCH`.
fn with_runtime(f: impl FnOnce(&Runtime) -> c_int) -> c_int {
    runtime::with_installed(f).unwrap_or(-libc::ESRCH)
}

/// Conversion of runtime errors into negated `errno` values.
trait ToErrno {
    fn to_errno(&self) -> c_int;
}

impl ToErrno for InitError {
    fn to_errno(&self) -> c_int {
        match self {
            InitError::AlreadyRunning => -libc::EBUSY,
            InitError::Config(_) => -libc::EINVAL,
            InitError::Signal(_) | InitError::Timer(_) => -libc::EAGAIN,
        }
    }
}

impl ToErrno for CreateError {
    fn to_errno(&self) -> c_int {
        match self {
            CreateError::ResourceExhausted => -libc::EAGAIN,
            CreateError::StackAlloc(_) => -libc::ENOMEM,
        }
    }
}

impl ToErrno for JoinError {
    fn to_errno(&self) -> c_int {
        match self {
            JoinError::InvalidTarget(_) => -libc::ESRCH,
            JoinError::AlreadyJoined { .. } => -libc::EINVAL,
            JoinError::Deadlock(_) => -libc::EDEADLK,
        }
    }
}

impl ToErrno for SemaphoreError {
    fn to_errno(&self) -> c_int {
        match self {
            SemaphoreError::Destroyed(_) => -libc::EINVAL,
            SemaphoreError::Deadlock(_) => -libc::EDEADLK,
        }
    }
}

impl ToErrno for TlsError {
    fn to_errno(&self) -> c_int {
        match self {
            TlsError::AlreadyExists(_) | TlsError::Conflict(_) => -libc::EEXIST,
            TlsError::InvalidSize | TlsError::OutOfRange => -libc::EINVAL,
            TlsError::NotFound(_) => -libc::ENOENT,
            TlsError::OutOfMemory(_) => -libc::ENOMEM,
            TlsError::Protect(_) => -libc::EFAULT,
        }
    }
}

/// Collapses a `Result` into the `0`-or-negated-`errno` convention.
fn to_rc<E: ToErrno>(result: Result<(), E>) -> c_int {
    result.map_or_else(|err| err.to_errno(), |()| 0)
}
