//! Fault-driven isolation of storage regions.
//!
//! Region pages are mapped `PROT_NONE`, so a thread touching one directly
//! (rather than through the runtime) takes a `SIGSEGV`. The handler below
//! turns such a fault into the termination of the offending logical thread,
//! thread 0 included: it then takes the regular thread-0 exit path. Every
//! other fault is handed back to the default disposition.

use std::sync::atomic::{AtomicBool, Ordering};

use uthread_sys_signal::{self as signal, ActionFlags, Handler, SIGBUS, SIGSEGV, Signal, SignalError};

use crate::{runtime, tcb::ExitStatus};

/// Installs the process-wide fault handler. Later calls do nothing.
pub(crate) fn install_handler() -> Result<(), SignalError> {
    static INSTALLED: AtomicBool = AtomicBool::new(false);
    if INSTALLED.load(Ordering::Acquire) {
        return Ok(());
    }

    for sig in [SIGSEGV, SIGBUS] {
        // SAFETY: `on_fault` only reads runtime state it can borrow, and either
        // leaves the faulting thread for good or restores the default action.
        unsafe {
            signal::action::install(sig, Handler::Info(on_fault), ActionFlags::NODEFER)?;
        }
    }
    INSTALLED.store(true, Ordering::Release);
    Ok(())
}

extern "C" fn on_fault(sig: Signal, info: *mut libc::siginfo_t, _ucontext: *mut libc::c_void) {
    // SAFETY: The kernel hands a valid info block to `SA_SIGINFO` handlers of
    // memory faults.
    let address = unsafe { signal::action::fault_address(info) };

    runtime::with_installed(|rt| {
        let me = rt.current();
        let in_region = rt.tls.try_borrow().is_ok_and(|tls| tls.owns_address(address));
        if in_region && rt.table.try_borrow_mut().is_ok() {
            log::warn!("thread {me} touched foreign storage at {address:#x}, terminating it");
            rt.exit_with(ExitStatus::Faulted { address });
        }
    });

    signal::action::reraise_default(sig);
}
