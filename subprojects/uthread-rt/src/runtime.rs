//! The runtime object.
//!
//! A [`Runtime`] owns every piece of scheduler state: the thread table, the
//! saved execution contexts, the semaphore table, the TLS regions and the
//! preemption timer. It is built once, eagerly, on the OS thread that will
//! host all its logical threads, and it never leaves that OS thread.
//!
//! Signal handlers find the runtime of the OS thread they interrupt through a
//! per-OS-thread pointer set by [`Runtime::new`] and cleared on drop.

use std::{
    cell::{Cell, RefCell, UnsafeCell},
    fmt,
    marker::PhantomData,
    ptr,
};

use uthread_context::Context;
use uthread_sys_signal::{SignalError, TimerError};

use crate::{
    ConfigError,
    config::Config,
    preempt::{NoPreempt, Preemption},
    semaphore::SemaphoreTable,
    tcb::{TcbTable, ThreadId},
    tls::{self, TlsTable},
};

thread_local! {
    /// The runtime hosted by the current OS thread, if any.
    static INSTALLED: Cell<*const Runtime> = const { Cell::new(ptr::null()) };
}

/// Runs `f` with the runtime hosted by the calling OS thread.
///
/// Async-signal-safe: the thread-local has a constant initializer and no
/// destructor.
pub(crate) fn with_installed<R>(f: impl FnOnce(&Runtime) -> R) -> Option<R> {
    let ptr = INSTALLED.with(Cell::get);

    // SAFETY: The pointer is set to a boxed runtime by `Runtime::new` and
    // cleared by its `Drop` before the box is freed.
    unsafe { ptr.as_ref() }.map(f)
}

/// A many-to-one thread runtime bound to the OS thread that created it.
pub struct Runtime {
    config: Config,

    pub(crate) table: RefCell<TcbTable>,

    /// Saved execution contexts, indexed like the table.
    ///
    /// Kept apart from the table so a switch never holds a borrow of it.
    contexts: Box<[UnsafeCell<Context>]>,

    current: Cell<ThreadId>,

    preempt: Preemption,

    pub(crate) semaphores: RefCell<SemaphoreTable>,

    pub(crate) tls: RefCell<TlsTable>,

    _not_send: PhantomData<*const ()>,
}

impl Runtime {
    /// Builds a runtime and installs the calling OS thread as
    /// [`ThreadId::MAIN`].
    ///
    /// Installs the fault handler used for TLS isolation and, unless
    /// preemption is disabled, the tick handler and the interval timer.
    ///
    /// Each OS thread can host at most one runtime at a time.
    pub fn new(config: Config) -> Result<Box<Self>, InitError> {
        config.validate()?;

        if with_installed(|_| ()).is_some() {
            return Err(InitError::AlreadyRunning);
        }

        tls::fault::install_handler()?;
        let preempt = Preemption::start(config.preemption, config.preempt_interval)?;

        let contexts = (0..config.max_threads)
            .map(|_| UnsafeCell::new(Context::empty()))
            .collect();

        let rt = Box::new(Self {
            table: RefCell::new(TcbTable::new(config.max_threads)),
            contexts,
            current: Cell::new(ThreadId::MAIN),
            preempt,
            semaphores: RefCell::new(SemaphoreTable::default()),
            tls: RefCell::new(TlsTable::default()),
            config,
            _not_send: PhantomData,
        });

        INSTALLED.with(|installed| installed.set(&*rt));

        log::debug!(
            "runtime started: max_threads={}, stack_size={}, preemption={:?}",
            rt.config.max_threads,
            rt.config.stack_size,
            rt.config.preemption,
        );
        Ok(rt)
    }

    /// The configuration this runtime was built with.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Returns the id of the calling logical thread.
    pub fn current(&self) -> ThreadId {
        self.current.get()
    }

    /// Enters a critical section that lasts until the guard is dropped.
    pub fn no_preempt(&self) -> NoPreempt<'_> {
        NoPreempt::new(self)
    }

    pub(crate) fn set_current(&self, id: ThreadId) {
        self.current.set(id);
    }

    pub(crate) fn preemption(&self) -> &Preemption {
        &self.preempt
    }

    /// Raw pointer to the saved context of `id`.
    pub(crate) fn context_ptr(&self, id: ThreadId) -> *mut Context {
        self.contexts[id.as_raw()].get()
    }

    /// Address passed to spawned threads to find their runtime.
    pub(crate) fn as_arg(&self) -> usize {
        self as *const Self as usize
    }
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("config", &self.config)
            .field("current", &self.current.get())
            .finish_non_exhaustive()
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        let current = self.current.get();
        if !current.is_main() {
            // Only reachable through unsafe code; the stacks being freed include
            // the one we are running on.
            log::error!("runtime dropped from thread {current}, aborting");
            std::process::abort();
        }

        self.preempt.stop();
        INSTALLED.with(|installed| installed.set(ptr::null()));

        let unjoined = self.table.get_mut().live().saturating_sub(1);
        if unjoined > 0 {
            log::debug!("runtime shut down with {unjoined} unjoined threads");
        } else {
            log::debug!("runtime shut down");
        }
    }
}

/// Errors that can occur when building a [`Runtime`].
#[derive(Debug, thiserror::Error)]
pub enum InitError {
    /// The calling OS thread already hosts a runtime.
    #[error("A runtime is already running on this OS thread")]
    AlreadyRunning,

    /// The configuration was rejected.
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    /// A signal handler could not be installed.
    #[error("Signal handler installation failed: {0}")]
    Signal(#[from] SignalError),

    /// The preemption timer could not be started.
    #[error("Preemption timer setup failed: {0}")]
    Timer(#[from] TimerError),
}
