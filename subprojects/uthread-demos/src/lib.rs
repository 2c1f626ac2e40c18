//! Shared plumbing for the demonstration programs.

pub mod logger;

use uthread_rt::{Config, ConfigError, CreateError, InitError, JoinError, Runtime, SemaphoreError, TlsError};

/// Builds a runtime from the `UTHREAD_*` environment variables.
pub fn runtime_from_env() -> Result<Box<Runtime>, DemoError> {
    let config = Config::from_env()?;
    log::info!(
        "max_threads={} stack_size={} preemption={:?} every {:?}",
        config.max_threads,
        config.stack_size,
        config.preemption,
        config.preempt_interval,
    );
    Ok(Runtime::new(config)?)
}

/// Everything that can make a demo fail.
#[derive(Debug, thiserror::Error)]
pub enum DemoError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Init(#[from] InitError),

    #[error(transparent)]
    Create(#[from] CreateError),

    #[error(transparent)]
    Join(#[from] JoinError),

    #[error(transparent)]
    Semaphore(#[from] SemaphoreError),

    #[error(transparent)]
    Tls(#[from] TlsError),

    /// The demo ran but observed something wrong.
    #[error("check failed: {0}")]
    Check(String),
}

/// Turns the outcome of a thread body into its exit value: `0` on success,
/// `1` (after logging the error) otherwise.
pub fn exit_value<E: std::fmt::Display>(rt: &Runtime, result: Result<(), E>) -> usize {
    match result {
        Ok(()) => 0,
        Err(err) => {
            log::error!("thread {} failed: {err}", rt.current());
            1
        }
    }
}

/// Joins every thread in `ids`, requiring each one to exit with `0`.
pub fn join_all(rt: &Runtime, ids: impl IntoIterator<Item = uthread_rt::ThreadId>) -> Result<(), DemoError> {
    for id in ids {
        match rt.join(id)? {
            uthread_rt::ExitStatus::Exited(0) => {}
            other => return Err(DemoError::Check(format!("thread {id} finished with {other:?}"))),
        }
    }
    Ok(())
}
