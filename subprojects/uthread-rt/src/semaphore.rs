//! # Semaphore
//!
//! Counting semaphores owned by the runtime and referenced by
//! [`SemaphoreId`] handles.
//!
//! Waiters queue in arrival order. A post with waiters does not touch the
//! count: it hands the unit straight to the oldest waiter and switches to it
//! immediately, ahead of every other ready thread. The poster becomes ready
//! and continues when the scheduler next picks it.
//!
//! Handles carry a generation, so a handle to a destroyed semaphore stays
//! invalid even after its slot is reused.

use std::{collections::VecDeque, fmt};

use crate::{
    Runtime,
    preempt::NoPreempt,
    scheduler::Resumption,
    tcb::{ThreadId, ThreadStatus, Wakeup},
};

/// Handle to a runtime-owned semaphore.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SemaphoreId {
    index: u32,
    generation: u32,
}

impl SemaphoreId {
    /// Packs the handle into a single integer (for the C interface).
    pub fn to_raw(self) -> u64 {
        (u64::from(self.generation) << 32) | u64::from(self.index)
    }

    /// Unpacks a handle produced by [`SemaphoreId::to_raw`].
    pub fn from_raw(raw: u64) -> Self {
        Self {
            index: raw as u32,
            generation: (raw >> 32) as u32,
        }
    }
}

impl fmt::Display for SemaphoreId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sem{}.{}", self.index, self.generation)
    }
}

#[derive(Debug, Default)]
struct Semaphore {
    count: usize,
    waiters: VecDeque<ThreadId>,
}

#[derive(Debug, Default)]
struct Slot {
    generation: u32,
    sem: Option<Semaphore>,
}

/// Table of semaphores.
#[derive(Debug, Default)]
pub(crate) struct SemaphoreTable {
    slots: Vec<Slot>,
    free: Vec<u32>,
}

impl SemaphoreTable {
    fn insert(&mut self, sem: Semaphore) -> SemaphoreId {
        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                self.slots.push(Slot::default());
                (self.slots.len() - 1) as u32
            }
        };

        let slot = &mut self.slots[index as usize];
        slot.sem = Some(sem);
        SemaphoreId {
            index,
            generation: slot.generation,
        }
    }

    fn get_mut(&mut self, id: SemaphoreId) -> Option<&mut Semaphore> {
        self.slots
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.sem.as_mut())
    }

    fn remove(&mut self, id: SemaphoreId) -> Option<Semaphore> {
        let slot = self
            .slots
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation)?;

        let sem = slot.sem.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index);
        Some(sem)
    }

    /// Number of live semaphores.
    fn len(&self) -> usize {
        self.slots.len() - self.free.len()
    }
}

impl Runtime {
    /// Creates a semaphore with `initial` units.
    pub fn sem_init(&self, initial: usize) -> SemaphoreId {
        let _guard = NoPreempt::new(self);
        let id = self.semaphores.borrow_mut().insert(Semaphore {
            count: initial,
            waiters: VecDeque::new(),
        });
        log::trace!("{id} created with {initial} units");
        id
    }

    /// Takes one unit, blocking while none is available.
    ///
    /// A blocked caller is resumed directly by the [`Runtime::sem_post`] that
    /// hands it a unit, or with [`SemaphoreError::Destroyed`] if the semaphore
    /// is destroyed while it waits.
    pub fn sem_wait(&self, id: SemaphoreId) -> Result<(), SemaphoreError> {
        let guard = NoPreempt::new(self);
        let me = self.current();

        {
            let mut sems = self.semaphores.borrow_mut();
            let sem = sems.get_mut(id).ok_or(SemaphoreError::Destroyed(id))?;
            if sem.count > 0 {
                sem.count -= 1;
                return Ok(());
            }
            sem.waiters.push_back(me);

            let mut table = self.table.borrow_mut();
            table[me].status = ThreadStatus::Blocked;
            table[me].wakeup = Wakeup::None;
        }

        log::trace!("thread {me} waiting on {id}");

        if self.block_current(&guard) == Resumption::Stalled {
            if let Some(sem) = self.semaphores.borrow_mut().get_mut(id) {
                sem.waiters.retain(|&waiter| waiter != me);
            }
            self.table.borrow_mut()[me].status = ThreadStatus::Running;
            log::warn!("thread {me} would wait on {id} forever");
            return Err(SemaphoreError::Deadlock(id));
        }

        match std::mem::take(&mut self.table.borrow_mut()[me].wakeup) {
            Wakeup::SemaphoreDestroyed => Err(SemaphoreError::Destroyed(id)),
            Wakeup::None => Ok(()),
        }
    }

    /// Takes one unit if one is available, without blocking.
    pub fn sem_try_wait(&self, id: SemaphoreId) -> Result<bool, SemaphoreError> {
        let _guard = NoPreempt::new(self);
        let mut sems = self.semaphores.borrow_mut();
        let sem = sems.get_mut(id).ok_or(SemaphoreError::Destroyed(id))?;

        if sem.count == 0 {
            return Ok(false);
        }
        sem.count -= 1;
        Ok(true)
    }

    /// Releases one unit.
    ///
    /// With waiters queued, the oldest one receives the unit and runs
    /// immediately; this call returns once the scheduler picks the caller
    /// again. Otherwise the count goes up by one.
    pub fn sem_post(&self, id: SemaphoreId) -> Result<(), SemaphoreError> {
        let guard = NoPreempt::new(self);
        let me = self.current();

        let waiter = {
            let mut sems = self.semaphores.borrow_mut();
            let sem = sems.get_mut(id).ok_or(SemaphoreError::Destroyed(id))?;
            match sem.waiters.pop_front() {
                Some(waiter) => waiter,
                None => {
                    sem.count += 1;
                    return Ok(());
                }
            }
        };

        log::trace!("thread {me} hands {id} to thread {waiter}");

        self.table.borrow_mut()[me].status = ThreadStatus::Ready;
        self.transfer(waiter, Resumption::Handoff, &guard);
        Ok(())
    }

    /// Destroys a semaphore.
    ///
    /// Threads still waiting on it become ready, and their
    /// [`Runtime::sem_wait`] fails with [`SemaphoreError::Destroyed`]. The
    /// handle is invalid afterwards.
    pub fn sem_destroy(&self, id: SemaphoreId) -> Result<(), SemaphoreError> {
        let _guard = NoPreempt::new(self);
        let sem = self
            .semaphores
            .borrow_mut()
            .remove(id)
            .ok_or(SemaphoreError::Destroyed(id))?;

        let mut table = self.table.borrow_mut();
        for &waiter in &sem.waiters {
            table[waiter].status = ThreadStatus::Ready;
            table[waiter].wakeup = Wakeup::SemaphoreDestroyed;
        }

        if !sem.waiters.is_empty() {
            log::debug!("{id} destroyed with {} waiters", sem.waiters.len());
        }
        Ok(())
    }

    /// Current number of available units.
    pub fn sem_value(&self, id: SemaphoreId) -> Result<usize, SemaphoreError> {
        let _guard = NoPreempt::new(self);
        let mut sems = self.semaphores.borrow_mut();
        sems.get_mut(id)
            .map(|sem| sem.count)
            .ok_or(SemaphoreError::Destroyed(id))
    }

    /// Number of semaphores that have not been destroyed.
    pub fn sem_count(&self) -> usize {
        let _guard = NoPreempt::new(self);
        self.semaphores.borrow().len()
    }
}

/// Semaphore errors
#[derive(Debug, thiserror::Error)]
pub enum SemaphoreError {
    /// The semaphore was destroyed, before the call or while waiting.
    #[error("Semaphore {0} is destroyed")]
    Destroyed(SemaphoreId),

    /// Thread 0 would wait forever: no other thread can run.
    #[error("Waiting on semaphore {0} would deadlock")]
    Deadlock(SemaphoreId),
}
