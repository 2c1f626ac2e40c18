//! Thread creation

use std::panic::{self, AssertUnwindSafe};

use uthread_context::Context;
use uthread_sys_mem::{AllocError, StackMemory};

use crate::{
    Runtime,
    preempt::NoPreempt,
    tcb::{ExitStatus, Tcb, ThreadBody, ThreadId, ThreadStatus},
};

impl Runtime {
    /// Creates a new thread running `f`.
    ///
    /// The closure receives the runtime and its return value becomes the
    /// thread's exit value, exactly as if it had called [`Runtime::exit`].
    ///
    /// The thread takes the lowest free slot, gets its own stack, and is
    /// marked `Ready`: it does not run until the scheduler picks it.
    pub fn spawn<F>(&self, f: F) -> Result<ThreadId, CreateError>
    where
        F: FnOnce(&Runtime) -> usize + 'static,
    {
        let _guard = NoPreempt::new(self);
        let mut table = self.table.borrow_mut();

        let Some(id) = table.first_free() else {
            log::debug!("spawn refused: all {} slots in use", table.capacity());
            return Err(CreateError::ResourceExhausted);
        };

        let stack = StackMemory::alloc(self.config().stack_size)?;

        // SAFETY: The stack is owned by the control block written below and is
        // only unmapped after the thread has been joined or the runtime dropped.
        let ctx = unsafe { Context::new_entry(stack.top(), thread_entry, self.as_arg(), thread_terminate) };

        // SAFETY: The slot is free, so no suspended context lives in it and no
        // one else accesses it.
        unsafe { self.context_ptr(id).write(ctx) };

        table[id] = Tcb {
            status: ThreadStatus::Ready,
            stack: Some(stack),
            body: Some(into_body(f)),
            // The thread starts inside the critical section held by whoever
            // switches to it.
            saved_depth: 1,
            ..Tcb::default()
        };

        log::debug!("spawned thread {id}");
        Ok(id)
    }
}

/// First Rust code run by a spawned thread.
extern "C" fn thread_entry(arg: usize) -> usize {
    // SAFETY: `arg` is the address of the boxed runtime that spawned us, which
    // outlives all of its threads.
    let rt = unsafe { &*(arg as *const Runtime) };

    let body = {
        let _inherited = NoPreempt::adopt(rt);
        let id = rt.current();
        rt.table.borrow_mut()[id].body.take()
    };

    let Some(mut body) = body else {
        log::error!("thread {} started without a body", rt.current());
        std::process::abort();
    };

    let outcome = panic::catch_unwind(AssertUnwindSafe(|| body(rt)));

    // Frees happen inside a section; an asynchronous tick must not interrupt
    // the allocator.
    let status = {
        let _guard = NoPreempt::new(rt);
        drop(body);
        match outcome {
            Ok(value) => ExitStatus::Exited(value),
            Err(payload) => {
                log::warn!("thread {} panicked", rt.current());
                drop(payload);
                ExitStatus::Panicked
            }
        }
    };

    match status {
        ExitStatus::Exited(value) => value,
        status => rt.exit_with(status),
    }
}

/// Boxes a thread body so that the box outlives the call.
fn into_body<F>(f: F) -> ThreadBody
where
    F: FnOnce(&Runtime) -> usize + 'static,
{
    let mut f = Some(f);
    Box::new(move |rt: &Runtime| f.take().map_or(0, |f| f(rt)))
}

/// Reached when [`thread_entry`] returns.
extern "C" fn thread_terminate(value: usize, arg: usize) -> ! {
    // SAFETY: Same as in `thread_entry`.
    let rt = unsafe { &*(arg as *const Runtime) };
    rt.exit(value)
}

/// Thread creation errors
#[derive(Debug, thiserror::Error)]
pub enum CreateError {
    /// Every slot of the thread table holds a live or unjoined thread.
    ///
    /// Joining a finished thread frees its slot.
    #[error("Thread table is full")]
    ResourceExhausted,

    /// The stack of the new thread could not be mapped.
    ///
    /// This is memory exhaustion; the table is left untouched.
    #[error("Stack allocation failed: {0}")]
    StackAlloc(#[from] AllocError),
}

#[cfg(test)]
mod tests {
    use std::backtrace::{Backtrace, BacktraceStatus};

    use crate::{Config, CreateError, ExitStatus, PreemptionMode, Runtime, ThreadId, ThreadStatus};

    fn cooperative(max_threads: usize) -> Box<Runtime> {
        Runtime::new(
            Config::default()
                .with_max_threads(max_threads)
                .with_preemption(PreemptionMode::Disabled),
        )
        .expect("runtime should start")
    }

    #[test]
    fn spawn_fails_once_the_table_is_full() {
        let rt = cooperative(4);

        let ids: Vec<_> = (0..3)
            .map(|n| rt.spawn(move |_| n).expect("capacity left"))
            .collect();

        assert_eq!(ids, vec![ThreadId::from_raw(1), ThreadId::from_raw(2), ThreadId::from_raw(3)]);
        assert!(matches!(rt.spawn(|_| 0), Err(CreateError::ResourceExhausted)));
        assert_eq!(rt.live_threads(), 4);
    }

    #[test]
    fn joined_slots_are_reused() {
        let rt = cooperative(2);

        let first = rt.spawn(|_| 1).expect("capacity left");
        assert!(matches!(rt.spawn(|_| 0), Err(CreateError::ResourceExhausted)));
        assert_eq!(rt.join(first).ok(), Some(ExitStatus::Exited(1)));
        assert_eq!(rt.status(first), Some(ThreadStatus::Exited));

        let second = rt.spawn(|_| 2).expect("slot was reclaimed");
        assert_eq!(second, first);
        assert_eq!(rt.join(second).ok(), Some(ExitStatus::Exited(2)));
    }

    #[test]
    fn panicking_body_reports_panicked() {
        let rt = cooperative(4);

        let id = rt
            .spawn(|_| -> usize { panic!("thread body failure") })
            .expect("spawn should succeed");

        assert_eq!(rt.join(id).ok(), Some(ExitStatus::Panicked));
    }

    #[test]
    fn backtraces_can_be_taken_on_thread_stacks() {
        let rt = cooperative(4);

        let walker = rt
            .spawn(|_| {
                let trace = Backtrace::force_capture();
                usize::from(trace.status() == BacktraceStatus::Captured && !trace.to_string().is_empty())
            })
            .expect("spawn should succeed");
        let panicker = rt
            .spawn(|_| -> usize {
                let trace = Backtrace::force_capture();
                panic!("failing after a stack walk: {trace}")
            })
            .expect("spawn should succeed");

        assert_eq!(rt.join(walker).ok(), Some(ExitStatus::Exited(1)));
        assert_eq!(rt.join(panicker).ok(), Some(ExitStatus::Panicked));
    }

    #[test]
    fn threads_can_spawn_threads() {
        let rt = cooperative(4);

        let outer = rt
            .spawn(|rt| {
                let inner = rt.spawn(|_| 20).expect("capacity left");
                rt.join(inner).ok().and_then(ExitStatus::value).unwrap_or(0) + 1
            })
            .expect("spawn should succeed");

        assert_eq!(rt.join(outer).ok(), Some(ExitStatus::Exited(21)));
    }
}
