//! Round-robin scheduler and directed transfers.
//!
//! Every function here must be called inside a critical section; the
//! `&NoPreempt` parameters make that explicit. No `RefCell` borrow is held
//! across a context switch.

use static_assertions::const_assert;

use crate::{
    Runtime,
    preempt::NoPreempt,
    tcb::{ThreadId, ThreadStatus},
};

/// Why a suspended thread was resumed.
///
/// Travels as the marker of [`uthread_context::switch`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub(crate) enum Resumption {
    /// Picked by the round-robin scan.
    Scheduled = 1,

    /// Targeted by a direct handoff (join, exit or semaphore post).
    Handoff = 2,

    /// Nothing else could run; only thread 0 is resumed this way.
    Stalled = 3,
}

// Marker 0 is reserved for contexts that were never suspended.
const_assert!(Resumption::Scheduled as usize != 0);

impl Resumption {
    fn from_marker(marker: usize) -> Self {
        match marker {
            2 => Resumption::Handoff,
            3 => Resumption::Stalled,
            _ => Resumption::Scheduled,
        }
    }
}

impl Runtime {
    /// Voluntarily gives up the processor.
    ///
    /// Switches to the next `Ready` thread after the current one, in id order
    /// with wraparound. Returns immediately when no other thread is ready.
    pub fn yield_now(&self) {
        let guard = NoPreempt::new(self);
        self.preemption().take_pending();
        self.schedule(&guard);
    }

    /// Honours a pending timer tick, if any.
    ///
    /// Long-running loops call this under [`PreemptionMode::Checkpoint`] to
    /// stay preemptible.
    ///
    /// [`PreemptionMode::Checkpoint`]: crate::PreemptionMode::Checkpoint
    pub fn preempt_point(&self) {
        if self.preemption().take_pending() {
            self.yield_now();
        }
    }

    /// Round-robin switch.
    ///
    /// Returns `None` without switching when no other thread is ready.
    /// Otherwise a running caller becomes `Ready` (a blocked or exiting one
    /// keeps its status) and the call returns once something resumes it.
    pub(crate) fn schedule(&self, guard: &NoPreempt<'_>) -> Option<Resumption> {
        let from = self.current();
        let to = {
            let mut table = self.table.borrow_mut();
            let to = table.next_ready_after(from)?;
            if table[from].status == ThreadStatus::Running {
                table[from].status = ThreadStatus::Ready;
            }
            to
        };

        Some(self.transfer(to, Resumption::Scheduled, guard))
    }

    /// Suspends a caller whose status was already set to `Blocked` or
    /// `WaitingExit`.
    ///
    /// When nothing is ready, a non-main caller hands control to thread 0
    /// with [`Resumption::Stalled`], and thread 0 gets `Stalled` back without
    /// switching at all.
    pub(crate) fn block_current(&self, guard: &NoPreempt<'_>) -> Resumption {
        let from = self.current();
        let next = self.table.borrow().next_ready_after(from);

        match next {
            Some(to) => self.transfer(to, Resumption::Scheduled, guard),
            None if from.is_main() => Resumption::Stalled,
            None => {
                log::warn!("thread {from} blocked with nothing runnable, waking thread {}", ThreadId::MAIN);
                self.transfer(ThreadId::MAIN, Resumption::Stalled, guard)
            }
        }
    }

    /// Switches to `to` right away, bypassing the round-robin scan.
    ///
    /// The caller's status must already reflect why it stops running.
    pub(crate) fn transfer(&self, to: ThreadId, why: Resumption, _guard: &NoPreempt<'_>) -> Resumption {
        let from = self.prepare_transfer(to);

        log::trace!("switch {from} -> {to} ({why:?})");

        // SAFETY: Both contexts belong to this runtime. `from` is the running
        // thread, `to` was suspended by a previous switch or built by
        // `Context::new_entry`, and its stack is still owned by its control
        // block. No borrow of runtime state is held across the switch.
        let marker = unsafe { uthread_context::switch(self.context_ptr(from), self.context_ptr(to), why as usize) };
        Resumption::from_marker(marker)
    }

    /// Switches to `to` and never comes back. Used by exiting threads.
    pub(crate) fn transfer_final(&self, to: ThreadId, why: Resumption, _guard: &NoPreempt<'_>) -> ! {
        let from = self.prepare_transfer(to);

        log::trace!("final switch {from} -> {to} ({why:?})");

        // SAFETY: As in `transfer`. The current context is abandoned; its
        // stack stays mapped until a joiner reclaims it.
        unsafe { uthread_context::resume(self.context_ptr(to), why as usize) }
    }

    fn prepare_transfer(&self, to: ThreadId) -> ThreadId {
        let from = self.current();
        let mut table = self.table.borrow_mut();

        table[from].saved_depth = self.preemption().depth();
        table[to].status = ThreadStatus::Running;
        self.preemption().set_depth(table[to].saved_depth);
        self.set_current(to);

        from
    }
}

#[cfg(test)]
mod tests {
    use std::{cell::RefCell, rc::Rc};

    use crate::{Config, PreemptionMode, Runtime, ThreadStatus};

    fn cooperative(max_threads: usize) -> Box<Runtime> {
        Runtime::new(
            Config::default()
                .with_max_threads(max_threads)
                .with_preemption(PreemptionMode::Disabled),
        )
        .expect("runtime should start")
    }

    #[test]
    fn yield_with_nothing_ready_is_a_no_op() {
        let rt = cooperative(4);

        rt.yield_now();

        assert_eq!(rt.status(rt.current()), Some(ThreadStatus::Running));
    }

    #[test]
    fn threads_run_round_robin_in_id_order() {
        let rt = cooperative(8);
        let trace = Rc::new(RefCell::new(Vec::new()));

        let ids: Vec<_> = (0..3)
            .map(|n| {
                let trace = Rc::clone(&trace);
                rt.spawn(move |rt| {
                    for round in 0..2 {
                        trace.borrow_mut().push((n, round));
                        rt.yield_now();
                    }
                    0
                })
                .expect("spawn should succeed")
            })
            .collect();

        for id in ids {
            rt.join(id).expect("join should succeed");
        }

        assert_eq!(
            *trace.borrow(),
            vec![(0, 0), (1, 0), (2, 0), (0, 1), (1, 1), (2, 1)]
        );
    }

    #[test]
    fn spawned_threads_do_not_run_until_scheduled() {
        let rt = cooperative(4);
        let ran = Rc::new(RefCell::new(false));

        let flag = Rc::clone(&ran);
        let id = rt
            .spawn(move |_| {
                *flag.borrow_mut() = true;
                0
            })
            .expect("spawn should succeed");

        assert!(!*ran.borrow());
        assert_eq!(rt.status(id), Some(ThreadStatus::Ready));
        assert_eq!(rt.ready_threads(), vec![id]);
        assert_eq!(rt.live_threads(), 2);

        rt.yield_now();
        assert!(*ran.borrow());
        assert_eq!(rt.status(id), Some(ThreadStatus::WaitingExit));
    }
}
