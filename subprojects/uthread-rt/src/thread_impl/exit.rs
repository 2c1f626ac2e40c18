//! Thread exit

use crate::{
    Runtime,
    preempt::NoPreempt,
    scheduler::Resumption,
    tcb::{ExitStatus, ThreadStatus},
};

impl Runtime {
    /// Terminates the calling thread with `value` as its exit value.
    ///
    /// If a thread is blocked joining this one, control passes to it directly.
    /// Otherwise the thread waits, suspended, until someone joins it; its
    /// stack and slot are reclaimed by that join (or when the runtime is
    /// dropped).
    ///
    /// Called on thread 0, this ends the process with status 0 as soon as no
    /// other thread can run.
    pub fn exit(&self, value: usize) -> ! {
        self.exit_with(ExitStatus::Exited(value))
    }

    pub(crate) fn exit_with(&self, status: ExitStatus) -> ! {
        let guard = NoPreempt::new(self);
        let me = self.current();

        let joiner = {
            let mut table = self.table.borrow_mut();
            let tcb = &mut table[me];
            tcb.status = ThreadStatus::WaitingExit;
            tcb.exit = Some(status);
            tcb.joiner.take()
        };

        log::debug!("thread {me} exiting: {status:?}");

        if let Some(joiner) = joiner {
            self.transfer_final(joiner, Resumption::Handoff, &guard);
        }

        if me.is_main() {
            // Let every other thread run to completion first; thread 0 is only
            // resumed once nothing else can run.
            while self.block_current(&guard) != Resumption::Stalled {}

            log::debug!("thread {me} exited last, terminating the process");
            std::process::exit(0);
        }

        // Nobody resumes a thread waiting to be joined.
        self.block_current(&guard);
        log::error!("exited thread {me} was resumed");
        std::process::abort();
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        Config, ExitStatus, PreemptionMode, Runtime, SemaphoreError, ThreadStatus, testing,
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
    fn last_runnable_thread_exiting_returns_control_to_thread_zero() {
        let rt = cooperative(4);
        let sem = rt.sem_init(0);

        let worker = rt.spawn(|rt| rt.exit(4)).expect("spawn should succeed");

        // The worker exits without posting; nothing else can run afterwards.
        assert!(matches!(rt.sem_wait(sem), Err(SemaphoreError::Deadlock(_))));
        assert_eq!(rt.status(worker), Some(ThreadStatus::WaitingExit));
        assert_eq!(rt.join(worker).ok(), Some(ExitStatus::Exited(4)));
    }

    #[test]
    fn thread_zero_exit_lets_the_others_finish_then_ends_the_process() {
        let name = "thread_impl::exit::tests::thread_zero_exit_lets_the_others_finish_then_ends_the_process";
        let Some(output) = testing::isolated(name, || {
            let rt = cooperative(4);
            for n in 0..2 {
                rt.spawn(move |rt| {
                    println!("worker {n} started");
                    rt.yield_now();
                    println!("worker {n} finished");
                    n
                })
                .expect("spawn should succeed");
            }
            rt.exit(3);
        }) else {
            return;
        };

        let stdout = testing::stdout_of(&output);
        assert!(output.status.success(), "child failed: {output:?}");
        for n in 0..2 {
            assert!(stdout.contains(&format!("worker {n} started")));
            assert!(stdout.contains(&format!("worker {n} finished")));
        }
    }
}
