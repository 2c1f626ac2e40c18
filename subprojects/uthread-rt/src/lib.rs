//! # uthread runtime
//!
//! A many-to-one thread runtime: many logical threads multiplexed onto the
//! single OS thread that builds the [`Runtime`].
//!
//! The runtime provides:
//! - thread creation, exit, join and self-identification ([`Runtime::spawn`],
//!   [`Runtime::exit`], [`Runtime::join`], [`Runtime::current`]);
//! - round-robin scheduling, cooperative or driven by a periodic timer
//!   ([`PreemptionMode`]);
//! - counting semaphores with direct handoff to the oldest waiter;
//! - page-granular thread-local storage regions with copy-on-write cloning and
//!   fault-driven isolation.
//!
//! ```ignore
//! let rt = Runtime::new(Config::default())?;
//! let worker = rt.spawn(|rt| {
//!     rt.yield_now();
//!     7
//! })?;
//! assert_eq!(rt.join(worker)?, ExitStatus::Exited(7));
//! ```

mod config;
mod preempt;
mod runtime;
mod scheduler;
mod semaphore;
mod tcb;
mod thread_impl;
mod tls;

#[cfg(test)]
mod testing;

pub use config::*;
pub use preempt::{NoPreempt, PreemptionMode};
pub use runtime::*;
pub use semaphore::{SemaphoreError, SemaphoreId};
pub use tcb::{ExitStatus, ThreadId, ThreadStatus};
pub use thread_impl::*;
pub use tls::TlsError;

#[cfg(feature = "ffi")]
mod ffi;
