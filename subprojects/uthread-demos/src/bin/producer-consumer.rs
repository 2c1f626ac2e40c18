//! Bounded-buffer producers and consumers synchronized by three semaphores.
//!
//! Every produced item must be consumed exactly once.

use std::{cell::RefCell, collections::VecDeque, process::ExitCode, rc::Rc};

use uthread_demos::{DemoError, exit_value, join_all, logger, runtime_from_env};
use uthread_rt::{Runtime, SemaphoreId};

const PRODUCERS: usize = 3;
const CONSUMERS: usize = 3;
const ITEMS_PER_PRODUCER: usize = 20;
const CAPACITY: usize = 4;

const TOTAL: usize = PRODUCERS * ITEMS_PER_PRODUCER;

struct Shared {
    buffer: RefCell<VecDeque<usize>>,
    consumed: RefCell<Vec<usize>>,
    /// Free buffer slots.
    empty: SemaphoreId,
    /// Filled buffer slots.
    full: SemaphoreId,
    mutex: SemaphoreId,
}

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
    let rt = runtime_from_env()?;

    let shared = Rc::new(Shared {
        buffer: RefCell::new(VecDeque::with_capacity(CAPACITY)),
        consumed: RefCell::new(Vec::with_capacity(TOTAL)),
        empty: rt.sem_init(CAPACITY),
        full: rt.sem_init(0),
        mutex: rt.sem_init(1),
    });

    let mut workers = Vec::with_capacity(PRODUCERS + CONSUMERS);
    for producer in 0..PRODUCERS {
        let shared = Rc::clone(&shared);
        workers.push(rt.spawn(move |rt| exit_value(rt, produce(rt, &shared, producer)))?);
    }
    for _ in 0..CONSUMERS {
        let shared = Rc::clone(&shared);
        workers.push(rt.spawn(move |rt| exit_value(rt, consume(rt, &shared, TOTAL / CONSUMERS)))?);
    }

    join_all(&rt, workers)?;

    let mut consumed = shared.consumed.take();
    consumed.sort_unstable();
    if consumed != (0..TOTAL).collect::<Vec<_>>() {
        return Err(DemoError::Check(format!("consumed items {consumed:?}")));
    }

    for sem in [shared.empty, shared.full, shared.mutex] {
        rt.sem_destroy(sem)?;
    }

    println!("{TOTAL} items passed through a {CAPACITY}-slot buffer exactly once");
    Ok(())
}

fn produce(rt: &Runtime, shared: &Shared, producer: usize) -> Result<(), DemoError> {
    for k in 0..ITEMS_PER_PRODUCER {
        let item = producer * ITEMS_PER_PRODUCER + k;

        rt.sem_wait(shared.empty)?;
        rt.sem_wait(shared.mutex)?;
        shared.buffer.borrow_mut().push_back(item);
        log::debug!("thread {} produced {item}", rt.current());
        rt.sem_post(shared.mutex)?;
        rt.sem_post(shared.full)?;

        rt.preempt_point();
    }
    Ok(())
}

fn consume(rt: &Runtime, shared: &Shared, count: usize) -> Result<(), DemoError> {
    for _ in 0..count {
        rt.sem_wait(shared.full)?;
        rt.sem_wait(shared.mutex)?;
        let item = shared.buffer.borrow_mut().pop_front();
        rt.sem_post(shared.mutex)?;
        rt.sem_post(shared.empty)?;

        let item = item.ok_or_else(|| DemoError::Check("claimed a full slot in an empty buffer".to_owned()))?;
        log::debug!("thread {} consumed {item}", rt.current());
        shared.consumed.borrow_mut().push(item);

        rt.preempt_point();
    }
    Ok(())
}
