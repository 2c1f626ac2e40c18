//! Per-OS-thread signal mask
//!
//! These functions change the mask of the calling OS thread only. All logical
//! threads multiplexed onto that OS thread share it.
//!
//! All functions here are async-signal-safe.

use std::{io, mem, ptr};

use crate::{Signal, action::SignalError};

/// Blocks `signal` for the calling OS thread.
///
/// A blocked signal stays pending until it is unblocked.
#[inline]
pub fn block(signal: Signal) -> Result<(), SignalError> {
    change(libc::SIG_BLOCK, signal)
}

/// Unblocks `signal` for the calling OS thread.
///
/// If the signal is pending it is delivered before this function returns.
#[inline]
pub fn unblock(signal: Signal) -> Result<(), SignalError> {
    change(libc::SIG_UNBLOCK, signal)
}

fn change(how: libc::c_int, signal: Signal) -> Result<(), SignalError> {
    // SAFETY: `set` is owned, initialized by `sigemptyset` before use.
    unsafe {
        let mut set: libc::sigset_t = mem::zeroed();
        libc::sigemptyset(&mut set);
        libc::sigaddset(&mut set, signal);

        // `pthread_sigmask` reports the error number as its return value.
        let rc = libc::pthread_sigmask(how, &set, ptr::null_mut());
        if rc != 0 {
            return Err(SignalError::Mask(io::Error::from_raw_os_error(rc)));
        }
    }
    Ok(())
}
