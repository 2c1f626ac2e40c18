//! Signal plumbing for the user-space thread runtime.
//!
//! - [`action`]: installing signal dispositions and handing faults back to
//!   the default action.
//! - [`mask`]: blocking and unblocking signals for the calling OS thread.
//! - [`timer`]: a periodic timer that targets the OS thread that created it.

pub mod action;
pub mod mask;
pub mod timer;

pub use action::{ActionFlags, Handler, SignalError};
pub use timer::{IntervalTimer, TimerError};

/// A POSIX signal number.
pub type Signal = libc::c_int;

/// Timer tick used for preemption.
pub const SIGALRM: Signal = libc::SIGALRM;

/// Invalid memory reference.
pub const SIGSEGV: Signal = libc::SIGSEGV;

/// Bus error (for example, access to a truncated mapping).
pub const SIGBUS: Signal = libc::SIGBUS;
