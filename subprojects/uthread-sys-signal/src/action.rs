//! Signal disposition management

use std::{ffi::c_void, io, mem, ptr};

use bitflags::bitflags;

use crate::Signal;

/// Plain handler, `void handler(int)`.
pub type SimpleHandler = extern "C" fn(signal: Signal);

/// Extended handler, `void handler(int, siginfo_t *, void *)`.
pub type InfoHandler = extern "C" fn(signal: Signal, info: *mut libc::siginfo_t, ucontext: *mut c_void);

bitflags! {
    /// `sa_flags` bits used by the runtime.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    #[repr(transparent)]
    pub struct ActionFlags: libc::c_int {
        /// Do not block the signal while its own handler runs
        const NODEFER = libc::SA_NODEFER;
        /// Restart interruptible system calls after the handler returns
        const RESTART = libc::SA_RESTART;
    }
}

/// What to do when a signal arrives.
#[derive(Debug, Clone, Copy)]
pub enum Handler {
    /// Call a plain handler.
    Simple(SimpleHandler),
    /// Call an extended handler (`SA_SIGINFO`).
    Info(InfoHandler),
}

/// Installs `handler` for `signal`.
///
/// The handler's mask is empty, so no other signal is blocked while it runs.
///
/// # Safety
///
/// The handler runs asynchronously on whatever stack the OS thread is using
/// when the signal arrives. It must only perform operations that are safe in
/// that context.
pub unsafe fn install(signal: Signal, handler: Handler, flags: ActionFlags) -> Result<(), SignalError> {
    // SAFETY: `sigaction` is a plain C struct, all-zero is a valid value.
    let mut action: libc::sigaction = unsafe { mem::zeroed() };

    let mut sa_flags = flags.bits();
    action.sa_sigaction = match handler {
        Handler::Simple(f) => f as usize,
        Handler::Info(f) => {
            sa_flags |= libc::SA_SIGINFO;
            f as usize
        }
    };
    action.sa_flags = sa_flags;

    // SAFETY: `sa_mask` is a valid, owned signal set.
    unsafe { libc::sigemptyset(&mut action.sa_mask) };

    // SAFETY: `action` is valid for the duration of the call.
    let rc = unsafe { libc::sigaction(signal, &action, ptr::null_mut()) };
    if rc != 0 {
        return Err(SignalError::Install {
            signal,
            source: io::Error::last_os_error(),
        });
    }

    Ok(())
}

/// Resets `signal` to its default action and raises it on the calling thread.
///
/// Used by fault handlers to hand a fault they do not own back to the host:
/// once the handler returns the faulting instruction runs again and the
/// default action (usually a core dump) takes place.
///
/// Async-signal-safe.
pub fn reraise_default(signal: Signal) {
    // SAFETY: `signal` and `SIG_DFL` are valid arguments; both calls are
    // async-signal-safe.
    unsafe {
        libc::signal(signal, libc::SIG_DFL);
        libc::raise(signal);
    }
}

/// Extracts the faulting address from a `SIGSEGV`/`SIGBUS` info block.
///
/// # Safety
///
/// `info` must be the pointer handed to an [`InfoHandler`] for a memory fault.
pub unsafe fn fault_address(info: *const libc::siginfo_t) -> usize {
    // SAFETY: Upheld by the caller.
    unsafe { (*info).si_addr() as usize }
}

/// Errors that can occur when changing a signal disposition.
#[derive(Debug, thiserror::Error)]
pub enum SignalError {
    /// The `sigaction` system call failed.
    #[error("sigaction({signal}) failed: {source}")]
    Install {
        /// The signal being configured.
        signal: Signal,
        /// The OS error.
        #[source]
        source: io::Error,
    },

    /// The `pthread_sigmask` call failed.
    #[error("pthread_sigmask failed: {0}")]
    Mask(#[source] io::Error),
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    static USR1_HITS: AtomicUsize = AtomicUsize::new(0);

    extern "C" fn count_usr1(_signal: Signal) {
        USR1_HITS.fetch_add(1, Ordering::SeqCst);
    }

    #[test]
    fn installed_handler_sees_raised_signal() {
        unsafe { install(libc::SIGUSR1, Handler::Simple(count_usr1), ActionFlags::NODEFER) }
            .expect("install should succeed");

        unsafe { libc::raise(libc::SIGUSR1) };

        assert_eq!(USR1_HITS.load(Ordering::SeqCst), 1);
        unsafe { libc::signal(libc::SIGUSR1, libc::SIG_DFL) };
    }
}
