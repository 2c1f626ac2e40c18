//! Preemption driver and critical sections.
//!
//! A per-OS-thread interval timer raises `SIGALRM`. What the tick does depends
//! on the [`PreemptionMode`]; in every mode a tick that arrives inside a
//! [`NoPreempt`] section is only recorded, and honoured when the outermost
//! section ends.
//!
//! The critical-section depth is per logical thread: the scheduler saves it
//! in the outgoing thread's control block and restores the incoming one's.
//! Every switch happens inside a section, so a saved depth is never zero.

use std::{
    marker::PhantomData,
    str::FromStr,
    sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    time::Duration,
};

use uthread_sys_signal::{
    self as signal, ActionFlags, Handler, IntervalTimer, SIGALRM, Signal, SignalError, mask,
};

use crate::{ConfigError, Runtime, runtime};

/// How timer ticks turn into context switches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PreemptionMode {
    /// No timer. Threads switch only when they yield, block or exit.
    Disabled,

    /// The tick only marks a switch as pending. The switch happens at the next
    /// preemption-safe point: the end of the outermost [`NoPreempt`] section,
    /// [`Runtime::yield_now`] or [`Runtime::preempt_point`].
    #[default]
    Checkpoint,

    /// The tick handler switches threads directly whenever no [`NoPreempt`]
    /// section is active.
    ///
    /// Thread bodies must then be async-signal-safe outside critical sections:
    /// a thread switched out while holding a lock of the C library (for
    /// example inside the allocator) deadlocks the next thread that needs it.
    Async,
}

impl FromStr for PreemptionMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "disabled" | "off" | "none" => Ok(PreemptionMode::Disabled),
            "checkpoint" => Ok(PreemptionMode::Checkpoint),
            "async" => Ok(PreemptionMode::Async),
            _ => Err(ConfigError::UnknownMode(s.to_owned())),
        }
    }
}

/// Per-runtime preemption state.
#[derive(Debug)]
pub(crate) struct Preemption {
    mode: PreemptionMode,

    /// Critical-section depth of the running logical thread.
    depth: AtomicUsize,

    /// A tick arrived while a switch was not allowed.
    pending: AtomicBool,

    /// Total ticks delivered.
    ticks: AtomicU64,

    timer: Option<IntervalTimer>,
}

impl Preemption {
    /// Installs the tick handler and starts the timer, unless `mode` is
    /// [`PreemptionMode::Disabled`].
    pub(crate) fn start(mode: PreemptionMode, interval: Duration) -> Result<Self, runtime::InitError> {
        let timer = match mode {
            PreemptionMode::Disabled => None,
            PreemptionMode::Checkpoint | PreemptionMode::Async => {
                install_tick_handler()?;
                Some(IntervalTimer::start(SIGALRM, interval)?)
            }
        };

        Ok(Self {
            mode,
            depth: AtomicUsize::new(0),
            pending: AtomicBool::new(false),
            ticks: AtomicU64::new(0),
            timer,
        })
    }

    /// Stops the timer. Ticks already pending are ignored.
    pub(crate) fn stop(&mut self) {
        self.timer = None;
        self.pending.store(false, Ordering::Relaxed);
    }

    pub(crate) fn depth(&self) -> usize {
        self.depth.load(Ordering::Relaxed)
    }

    /// Installs the depth of the thread being switched in.
    ///
    /// Only called inside a critical section, with a non-zero `depth`.
    pub(crate) fn set_depth(&self, depth: usize) {
        debug_assert!(depth > 0, "switching into a thread outside a critical section");
        self.depth.store(depth, Ordering::Relaxed);
    }

    pub(crate) fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::Relaxed)
    }

    /// Consumes a pending tick.
    pub(crate) fn take_pending(&self) -> bool {
        self.mode != PreemptionMode::Disabled && self.pending.swap(false, Ordering::Relaxed)
    }

    fn enter(&self) {
        let prev = self.depth.fetch_add(1, Ordering::Relaxed);
        if prev == 0 && self.mode == PreemptionMode::Async {
            // The depth is raised first: a tick landing before the mask takes
            // effect sees a non-zero depth and is only recorded.
            let _ = mask::block(SIGALRM);
        }
    }

    /// Leaves one level. Returns `true` when the outermost section ended with
    /// a tick pending.
    fn leave(&self) -> bool {
        let prev = self.depth.fetch_sub(1, Ordering::Relaxed);
        debug_assert!(prev > 0, "critical section depth underflow");
        if prev != 1 {
            return false;
        }

        if self.mode == PreemptionMode::Async {
            let _ = mask::unblock(SIGALRM);
        }
        self.take_pending()
    }
}

/// A critical section: no preemptive switch happens while it is alive.
///
/// Sections nest. When the outermost one ends and a tick arrived in the
/// meantime, the thread yields right away.
///
/// The guard does not prevent the holder from blocking or yielding on its own;
/// the section is suspended with the thread and resumed with it.
#[must_use = "the critical section ends as soon as the guard is dropped"]
pub struct NoPreempt<'rt> {
    rt: &'rt Runtime,
    _not_send: PhantomData<*const ()>,
}

impl<'rt> NoPreempt<'rt> {
    pub(crate) fn new(rt: &'rt Runtime) -> Self {
        rt.preemption().enter();
        Self {
            rt,
            _not_send: PhantomData,
        }
    }

    /// Takes ownership of a level already counted in the depth.
    ///
    /// A fresh thread starts inside the section held by whoever switched to it.
    pub(crate) fn adopt(rt: &'rt Runtime) -> Self {
        Self {
            rt,
            _not_send: PhantomData,
        }
    }

    /// The runtime this section belongs to.
    pub fn runtime(&self) -> &'rt Runtime {
        self.rt
    }
}

impl Drop for NoPreempt<'_> {
    fn drop(&mut self) {
        if self.rt.preemption().leave() && !std::thread::panicking() {
            self.rt.yield_now();
        }
    }
}

fn install_tick_handler() -> Result<(), SignalError> {
    static INSTALLED: AtomicBool = AtomicBool::new(false);
    if INSTALLED.load(Ordering::Acquire) {
        return Ok(());
    }

    // Two OS threads racing here install the same handler twice, which is
    // harmless.
    // SAFETY: `on_tick` only touches atomics, except in `Async` mode where it
    // switches threads outside of critical sections.
    unsafe {
        signal::action::install(
            SIGALRM,
            Handler::Simple(on_tick),
            ActionFlags::NODEFER | ActionFlags::RESTART,
        )?;
    }
    INSTALLED.store(true, Ordering::Release);
    Ok(())
}

extern "C" fn on_tick(_signal: Signal) {
    runtime::with_installed(|rt| {
        let preempt = rt.preemption();
        preempt.ticks.fetch_add(1, Ordering::Relaxed);

        if preempt.mode == PreemptionMode::Async && preempt.depth() == 0 {
            // `errno` belongs to the OS thread and therefore to whichever
            // logical thread runs next.
            let saved = errno();
            rt.yield_now();
            set_errno(saved);
        } else {
            preempt.pending.store(true, Ordering::Relaxed);
        }
    });
}

fn errno() -> libc::c_int {
    // SAFETY: `__errno_location` always returns a valid pointer for the calling thread.
    unsafe { *libc::__errno_location() }
}

fn set_errno(value: libc::c_int) {
    // SAFETY: `__errno_location` always returns a valid pointer for the calling thread.
    unsafe { *libc::__errno_location() = value };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_names_parse_case_insensitively() {
        assert_eq!("Disabled".parse::<PreemptionMode>().ok(), Some(PreemptionMode::Disabled));
        assert_eq!(" checkpoint ".parse::<PreemptionMode>().ok(), Some(PreemptionMode::Checkpoint));
        assert_eq!("ASYNC".parse::<PreemptionMode>().ok(), Some(PreemptionMode::Async));
        assert!("eventually".parse::<PreemptionMode>().is_err());
    }

    #[test]
    fn depth_nests_and_reports_pending_ticks_once() {
        let preempt = Preemption::start(PreemptionMode::Disabled, Duration::ZERO)
            .expect("disabled preemption needs no timer");

        preempt.enter();
        preempt.enter();
        assert_eq!(preempt.depth(), 2);
        assert!(!preempt.leave());
        assert!(!preempt.leave());
        assert_eq!(preempt.depth(), 0);
    }

    #[test]
    fn pending_tick_surfaces_at_the_outermost_leave() {
        let mut preempt = Preemption::start(PreemptionMode::Checkpoint, Duration::from_secs(3600))
            .expect("timer should start");

        preempt.enter();
        preempt.enter();
        preempt.pending.store(true, Ordering::Relaxed);
        assert!(!preempt.leave());
        assert!(preempt.leave());
        assert!(!preempt.take_pending());

        preempt.stop();
    }

    fn preemptive(mode: PreemptionMode) -> Box<Runtime> {
        Runtime::new(
            crate::Config::default()
                .with_max_threads(4)
                .with_preemption(mode)
                .with_preempt_interval(Duration::from_millis(1)),
        )
        .expect("runtime should start")
    }

    #[test]
    fn checkpoints_let_spinning_threads_take_turns() {
        let rt = preemptive(PreemptionMode::Checkpoint);
        let progress = std::rc::Rc::new([std::cell::Cell::new(0u64), std::cell::Cell::new(0u64)]);

        let spinners: Vec<_> = (0..2)
            .map(|me| {
                let progress = std::rc::Rc::clone(&progress);
                rt.spawn(move |rt| {
                    // Neither thread ever yields on its own.
                    loop {
                        progress[me].set(progress[me].get() + 1);
                        if progress[1 - me].get() > 0 {
                            return me;
                        }
                        rt.preempt_point();
                    }
                })
                .expect("spawn should succeed")
            })
            .collect();

        for (me, id) in spinners.into_iter().enumerate() {
            assert_eq!(rt.join(id).ok(), Some(crate::ExitStatus::Exited(me)));
        }
        assert!(rt.preempt_ticks() > 0);
    }

    #[test]
    fn async_ticks_preempt_threads_that_never_check() {
        let rt = preemptive(PreemptionMode::Async);
        let flags = std::rc::Rc::new([AtomicBool::new(false), AtomicBool::new(false)]);

        // Nothing below allocates outside a critical section.
        let spin = |me: usize| {
            let flags = std::rc::Rc::clone(&flags);
            move |_: &Runtime| {
                flags[me].store(true, Ordering::Relaxed);
                while !flags[1 - me].load(Ordering::Relaxed) {
                    std::hint::spin_loop();
                }
                me
            }
        };

        let first = rt.spawn(spin(0)).expect("spawn should succeed");
        let second = rt.spawn(spin(1)).expect("spawn should succeed");

        assert_eq!(rt.join(first).ok(), Some(crate::ExitStatus::Exited(0)));
        assert_eq!(rt.join(second).ok(), Some(crate::ExitStatus::Exited(1)));
        assert!(rt.preempt_ticks() > 0);
    }
}
