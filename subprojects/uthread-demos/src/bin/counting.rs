//! Threads that never block, counting side by side.
//!
//! Each thread only calls the runtime at checkpoints, so any interleaving
//! comes from the preemption timer. Run with `UTHREAD_PREEMPTION=disabled` to
//! see the threads run one after the other instead.

use std::{cell::Cell, process::ExitCode, rc::Rc};

use uthread_demos::{DemoError, logger, runtime_from_env};
use uthread_rt::ExitStatus;

const THREADS: usize = 4;
const DEFAULT_TARGET: u64 = 20_000_000;

/// Iterations between two checkpoints.
const CHECKPOINT_EVERY: u64 = 4096;

fn main() -> ExitCode {
    if let Err(err) = logger::init() {
        eprintln!("logger setup failed: {err}");
    }

    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            log::error!("{err}");
            ExitCode::FAILURE
        }
    }
}

fn run() -> Result<(), DemoError> {
    let target = match std::env::args().nth(1) {
        Some(arg) => arg
            .parse()
            .map_err(|err| DemoError::Check(format!("invalid target {arg:?}: {err}")))?,
        None => DEFAULT_TARGET,
    };

    let rt = runtime_from_env()?;
    let last = Rc::new(Cell::new(usize::MAX));
    let switches = Rc::new(Cell::new(0u64));

    let mut counters = Vec::with_capacity(THREADS);
    for me in 0..THREADS {
        let last = Rc::clone(&last);
        let switches = Rc::clone(&switches);
        counters.push(rt.spawn(move |rt| {
            let mut count = 0u64;
            while count < target {
                if last.get() != me {
                    last.set(me);
                    switches.set(switches.get() + 1);
                }
                count = std::hint::black_box(count + 1);
                if count % CHECKPOINT_EVERY == 0 {
                    rt.preempt_point();
                }
            }
            log::info!("thread {} reached {count}", rt.current());
            me
        })?);
    }

    for (me, id) in counters.into_iter().enumerate() {
        let status = rt.join(id)?;
        if status != ExitStatus::Exited(me) {
            return Err(DemoError::Check(format!("counter {me} finished with {status:?}")));
        }
    }

    println!(
        "{THREADS} threads counted to {target}: {} turns, {} timer ticks",
        switches.get(),
        rt.preempt_ticks()
    );
    Ok(())
}
