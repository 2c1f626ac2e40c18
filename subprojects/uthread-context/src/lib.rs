//! Execution context capture and resume
//!
//! A [`Context`] is the minimal CPU state needed to suspend a logical thread
//! and later continue it exactly where it left off: the callee-saved
//! registers, the stack pointer, the resume address and the floating-point
//! control state.
//!
//! Two primitives operate on contexts:
//! - [`switch`] saves the caller into one context and enters another. The
//!   call "returns" only when some later [`switch`] or [`resume`] enters the
//!   saved context again, and it returns the marker that resumer passed.
//! - [`resume`] enters a context without saving the caller.
//!
//! Fresh contexts are hand-assembled with [`Context::new_entry`]: the resume
//! address points at an entry stub that calls the entry function and then the
//! exit function. The stub is the outermost frame of the new stack, so stack
//! walks started on it end there.

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
compile_error!("uthread-context supports only x86_64 and aarch64");

#[cfg_attr(target_arch = "x86_64", path = "arch/x86_64.rs")]
#[cfg_attr(target_arch = "aarch64", path = "arch/aarch64.rs")]
mod arch;

pub use arch::{Context, resume, switch};

/// Entry point of a fresh context.
///
/// Receives the `arg` given to [`Context::new_entry`]. Its return value is
/// forwarded to the [`ExitFn`].
pub type EntryFn = extern "C" fn(arg: usize) -> usize;

/// Terminator of a fresh context.
///
/// Called with the value returned by the [`EntryFn`] and the original `arg`
/// once the entry function returns. It runs on the context's own stack and
/// must never return.
pub type ExitFn = extern "C" fn(value: usize, arg: usize) -> !;

/// Stack alignment required at a call boundary by both supported ABIs.
pub const STACK_ALIGN: usize = 16;
