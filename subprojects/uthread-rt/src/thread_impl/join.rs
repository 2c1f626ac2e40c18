//! Thread join

use crate::{
    Runtime,
    preempt::NoPreempt,
    scheduler::Resumption,
    tcb::{ExitStatus, ThreadId, ThreadStatus},
};

impl Runtime {
    /// Waits for thread `id` to finish and returns how it finished.
    ///
    /// A thread that already finished is reclaimed immediately. Otherwise the
    /// caller blocks until the target exits, at which point control passes
    /// straight back to the caller.
    ///
    /// Joining reclaims the target: its stack is unmapped, its thread-local
    /// storage region (if any) destroyed, and its slot becomes free. A thread
    /// can therefore be joined at most once; later joins fail with
    /// [`JoinError::InvalidTarget`].
    pub fn join(&self, id: ThreadId) -> Result<ExitStatus, JoinError> {
        let guard = NoPreempt::new(self);
        let me = self.current();

        {
            let mut table = self.table.borrow_mut();
            if id == me || id.is_main() {
                return Err(JoinError::InvalidTarget(id));
            }
            let target = table.get_mut(id).ok_or(JoinError::InvalidTarget(id))?;

            match target.status {
                ThreadStatus::Fresh | ThreadStatus::Exited => return Err(JoinError::InvalidTarget(id)),
                ThreadStatus::WaitingExit => {
                    drop(table);
                    return Ok(self.reclaim(id));
                }
                ThreadStatus::Ready | ThreadStatus::Running | ThreadStatus::Blocked => {
                    if let Some(other) = target.joiner {
                        return Err(JoinError::AlreadyJoined { target: id, joiner: other });
                    }
                    target.joiner = Some(me);
                    table[me].status = ThreadStatus::Blocked;
                }
            }
        }

        log::debug!("thread {me} waiting for thread {id}");

        loop {
            if self.block_current(&guard) == Resumption::Stalled {
                let mut table = self.table.borrow_mut();
                table[id].joiner = None;
                table[me].status = ThreadStatus::Running;
                log::warn!("join of thread {id} by thread {me} would never return");
                return Err(JoinError::Deadlock(id));
            }

            if self.table.borrow()[id].status == ThreadStatus::WaitingExit {
                return Ok(self.reclaim(id));
            }

            self.table.borrow_mut()[me].status = ThreadStatus::Blocked;
        }
    }

    /// Tears down a thread waiting to be joined and returns its exit status.
    fn reclaim(&self, id: ThreadId) -> ExitStatus {
        let (status, stack) = {
            let mut table = self.table.borrow_mut();
            let tcb = &mut table[id];
            tcb.status = ThreadStatus::Exited;
            tcb.joiner = None;
            tcb.body = None;
            (tcb.exit.take(), tcb.stack.take())
        };

        // The target is suspended for good, so nothing runs on this stack.
        drop(stack);
        self.release_tls(id);

        log::debug!("reclaimed thread {id}");

        // `exit` is set together with `WaitingExit`.
        status.unwrap_or(ExitStatus::Exited(0))
    }
}

/// Thread join errors
#[derive(Debug, thiserror::Error)]
pub enum JoinError {
    /// The id is out of range, names a free slot, an already joined thread,
    /// thread 0, or the caller itself.
    #[error("Thread {0} cannot be joined")]
    InvalidTarget(ThreadId),

    /// Another thread is already blocked joining the target.
    ///
    /// Two concurrent joins on one thread have no meaningful outcome; the
    /// second one is refused instead.
    #[error("Thread {target} is already being joined by thread {joiner}")]
    AlreadyJoined {
        /// The thread being joined.
        target: ThreadId,
        /// The thread already waiting for it.
        joiner: ThreadId,
    },

    /// Thread 0 would block forever: no other thread can run.
    #[error("Joining thread {0} would deadlock")]
    Deadlock(ThreadId),
}

#[cfg(test)]
mod tests {
    use std::{cell::Cell, rc::Rc};

    use crate::{
        Config, ExitStatus, JoinError, PreemptionMode, Runtime, ThreadId, ThreadStatus,
    };

    fn cooperative(max_threads: usize) -> Box<Runtime> {
        Runtime::new(
            Config::default()
                .with_max_threads(max_threads)
                .with_preemption(PreemptionMode::Disabled),
        )
        .expect("runtime should start")
    }

    #[test]
    fn exit_value_reaches_the_joiner_exactly_once() {
        let rt = cooperative(4);

        let id = rt.spawn(|rt| rt.exit(0xC0FFEE)).expect("spawn should succeed");

        assert_eq!(rt.join(id).ok(), Some(ExitStatus::Exited(0xC0FFEE)));
        assert!(matches!(rt.join(id), Err(JoinError::InvalidTarget(t)) if t == id));
    }

    #[test]
    fn join_of_a_finished_thread_returns_immediately() {
        let rt = cooperative(4);
        let id = rt.spawn(|_| 5).expect("spawn should succeed");

        rt.yield_now();
        assert_eq!(rt.status(id), Some(ThreadStatus::WaitingExit));

        assert_eq!(rt.join(id).ok(), Some(ExitStatus::Exited(5)));
    }

    #[test]
    fn invalid_targets_are_rejected() {
        let rt = cooperative(4);

        assert!(matches!(rt.join(ThreadId::MAIN), Err(JoinError::InvalidTarget(_))));
        assert!(matches!(rt.join(ThreadId::from_raw(2)), Err(JoinError::InvalidTarget(_))));
        assert!(matches!(rt.join(ThreadId::from_raw(99)), Err(JoinError::InvalidTarget(_))));

        let self_join = rt
            .spawn(|rt| match rt.join(rt.current()) {
                Err(JoinError::InvalidTarget(_)) => 1,
                _ => 0,
            })
            .expect("spawn should succeed");
        assert_eq!(rt.join(self_join).ok(), Some(ExitStatus::Exited(1)));
    }

    #[test]
    fn second_concurrent_join_is_refused_without_crashing() {
        let rt = cooperative(4);

        let target = rt
            .spawn(|rt| {
                rt.yield_now();
                rt.yield_now();
                3
            })
            .expect("spawn should succeed");

        let outcome = Rc::new(Cell::new(None));
        let seen = Rc::clone(&outcome);
        let rival = rt
            .spawn(move |rt| {
                seen.set(Some(matches!(rt.join(target), Err(JoinError::AlreadyJoined { .. }))));
                0
            })
            .expect("spawn should succeed");

        // Thread 0 registers first, then the rival tries while it waits.
        assert_eq!(rt.join(target).ok(), Some(ExitStatus::Exited(3)));
        assert_eq!(rt.join(rival).ok(), Some(ExitStatus::Exited(0)));
        assert_eq!(outcome.get(), Some(true));
    }

    #[test]
    fn joiner_resumes_directly_when_the_target_exits() {
        let rt = cooperative(4);
        let order = Rc::new(Cell::new(0usize));

        let target = rt.spawn(|_| 9).expect("spawn should succeed");
        let log = Rc::clone(&order);
        let bystander = rt
            .spawn(move |_| {
                log.set(log.get() * 10 + 2);
                0
            })
            .expect("spawn should succeed");

        let result = rt.join(target);
        order.set(order.get() * 10 + 1);

        assert_eq!(result.ok(), Some(ExitStatus::Exited(9)));
        // The bystander was ready, yet thread 0 ran first after the target exited.
        assert_eq!(order.get(), 1);
        assert_eq!(rt.join(bystander).ok(), Some(ExitStatus::Exited(0)));
        assert_eq!(order.get(), 12);
    }

    #[test]
    fn joining_a_thread_blocked_forever_reports_deadlock() {
        let rt = cooperative(4);
        let sem = rt.sem_init(0);

        let stuck = rt
            .spawn(move |rt| match rt.sem_wait(sem) {
                Ok(()) => 1,
                Err(_) => 2,
            })
            .expect("spawn should succeed");

        assert!(matches!(rt.join(stuck), Err(JoinError::Deadlock(t)) if t == stuck));

        // The runtime is still usable: release the thread and join it.
        rt.sem_post(sem).expect("semaphore is alive");
        assert_eq!(rt.join(stuck).ok(), Some(ExitStatus::Exited(1)));
    }
}
