//! Thread control blocks.
//!
//! The table is a fixed-capacity array indexed by [`ThreadId`]. Slot 0 is the
//! OS thread that built the runtime; it runs on its native stack, which the
//! runtime never owns.
//!
//! The saved execution contexts are kept outside the table (see
//! [`crate::runtime`]) so that switching never needs a borrow of it.

use std::{
    fmt,
    ops::{Index, IndexMut},
};

use uthread_sys_mem::StackMemory;

use crate::Runtime;

/// Identifier of a logical thread: its slot index.
///
/// Stable for the lifetime of the thread, reused only once the slot has been
/// fully reclaimed by a join.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct ThreadId(usize);

impl ThreadId {
    /// The OS thread that built the runtime.
    pub const MAIN: ThreadId = ThreadId(0);

    /// Creates an id from a raw slot index.
    pub const fn from_raw(index: usize) -> Self {
        Self(index)
    }

    /// Returns the raw slot index.
    pub const fn as_raw(self) -> usize {
        self.0
    }

    /// Checks whether this is [`ThreadId::MAIN`].
    pub const fn is_main(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Lifecycle state of a thread slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ThreadStatus {
    /// Never used.
    #[default]
    Fresh,
    /// Runnable, waiting for the scheduler.
    Ready,
    /// The current thread.
    Running,
    /// Waiting on a join or a semaphore.
    Blocked,
    /// Finished, waiting to be joined.
    WaitingExit,
    /// Joined and torn down; the slot can be reused.
    Exited,
}

impl ThreadStatus {
    /// Checks whether a new thread may be placed in a slot with this status.
    pub const fn is_free(self) -> bool {
        matches!(self, ThreadStatus::Fresh | ThreadStatus::Exited)
    }
}

/// How a thread finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    /// The thread returned, or called [`Runtime::exit`], with this value.
    Exited(usize),

    /// The thread touched a thread-local storage page it does not own and was
    /// terminated.
    Faulted {
        /// The faulting address.
        address: usize,
    },

    /// The thread body panicked.
    Panicked,
}

impl ExitStatus {
    /// The exit value, if the thread finished normally.
    pub fn value(self) -> Option<usize> {
        match self {
            ExitStatus::Exited(value) => Some(value),
            _ => None,
        }
    }
}

/// Why a blocked thread was made runnable again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) enum Wakeup {
    /// Nothing recorded.
    #[default]
    None,
    /// The semaphore it waited on was destroyed.
    SemaphoreDestroyed,
}

/// The body of a spawned thread. Runs once; later calls return 0.
pub(crate) type ThreadBody = Box<dyn FnMut(&Runtime) -> usize + 'static>;

/// One thread control block.
#[derive(Default)]
pub(crate) struct Tcb {
    pub status: ThreadStatus,

    /// Owned stack; `None` for thread 0 and for reclaimed slots.
    pub stack: Option<StackMemory>,

    /// Body of a thread that has not started yet.
    pub body: Option<ThreadBody>,

    /// Set by exit, consumed by join.
    pub exit: Option<ExitStatus>,

    /// Thread blocked joining this one.
    pub joiner: Option<ThreadId>,

    /// Critical-section depth held when the thread was switched out.
    pub saved_depth: usize,

    pub wakeup: Wakeup,
}

impl fmt::Debug for Tcb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tcb")
            .field("status", &self.status)
            .field("stack", &self.stack.as_ref().map(|s| s.top()))
            .field("exit", &self.exit)
            .field("joiner", &self.joiner)
            .field("saved_depth", &self.saved_depth)
            .field("wakeup", &self.wakeup)
            .finish_non_exhaustive()
    }
}

/// Fixed-capacity thread table.
#[derive(Debug)]
pub(crate) struct TcbTable {
    slots: Box<[Tcb]>,
}

impl TcbTable {
    /// Creates a table with `capacity` fresh slots and installs the caller as
    /// [`ThreadId::MAIN`], running.
    pub fn new(capacity: usize) -> Self {
        let mut slots: Box<[Tcb]> = (0..capacity).map(|_| Tcb::default()).collect();
        slots[0].status = ThreadStatus::Running;
        Self { slots }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn get(&self, id: ThreadId) -> Option<&Tcb> {
        self.slots.get(id.0)
    }

    pub fn get_mut(&mut self, id: ThreadId) -> Option<&mut Tcb> {
        self.slots.get_mut(id.0)
    }

    /// Lowest-indexed slot that can take a new thread.
    pub fn first_free(&self) -> Option<ThreadId> {
        self.slots
            .iter()
            .position(|tcb| tcb.status.is_free())
            .map(ThreadId)
    }

    /// First `Ready` slot after `from`, scanning upwards and wrapping around.
    ///
    /// `from` itself is never returned.
    pub fn next_ready_after(&self, from: ThreadId) -> Option<ThreadId> {
        let n = self.slots.len();
        (1..n)
            .map(|step| (from.0 + step) % n)
            .find(|&index| self.slots[index].status == ThreadStatus::Ready)
            .map(ThreadId)
    }

    /// Number of slots holding a thread that has not been reclaimed.
    pub fn live(&self) -> usize {
        self.slots.iter().filter(|tcb| !tcb.status.is_free()).count()
    }

    /// Iterates over `(id, tcb)` pairs.
    #[cfg(test)]
    pub fn iter(&self) -> impl Iterator<Item = (ThreadId, &Tcb)> {
        self.slots.iter().enumerate().map(|(i, tcb)| (ThreadId(i), tcb))
    }
}

impl Index<ThreadId> for TcbTable {
    type Output = Tcb;

    fn index(&self, id: ThreadId) -> &Tcb {
        &self.slots[id.0]
    }
}

impl IndexMut<ThreadId> for TcbTable {
    fn index_mut(&mut self, id: ThreadId) -> &mut Tcb {
        &mut self.slots[id.0]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_table_runs_main_and_leaves_the_rest_fresh() {
        let table = TcbTable::new(4);

        assert_eq!(table.capacity(), 4);
        assert_eq!(table[ThreadId::MAIN].status, ThreadStatus::Running);
        assert!(table.iter().skip(1).all(|(_, tcb)| tcb.status == ThreadStatus::Fresh));
        assert_eq!(table.live(), 1);
        assert_eq!(table.first_free(), Some(ThreadId(1)));
    }

    #[test]
    fn next_ready_scans_round_robin_with_wraparound() {
        let mut table = TcbTable::new(5);
        table[ThreadId(1)].status = ThreadStatus::Ready;
        table[ThreadId(3)].status = ThreadStatus::Ready;

        assert_eq!(table.next_ready_after(ThreadId(0)), Some(ThreadId(1)));
        assert_eq!(table.next_ready_after(ThreadId(1)), Some(ThreadId(3)));
        assert_eq!(table.next_ready_after(ThreadId(3)), Some(ThreadId(1)));
        assert_eq!(table.next_ready_after(ThreadId(4)), Some(ThreadId(1)));
    }

    #[test]
    fn next_ready_never_returns_the_caller() {
        let mut table = TcbTable::new(3);
        table[ThreadId(2)].status = ThreadStatus::Ready;

        assert_eq!(table.next_ready_after(ThreadId(2)), None);
    }

    #[test]
    fn exited_slots_are_reused_lowest_first() {
        let mut table = TcbTable::new(4);
        table[ThreadId(1)].status = ThreadStatus::Blocked;
        table[ThreadId(2)].status = ThreadStatus::Exited;
        table[ThreadId(3)].status = ThreadStatus::Ready;

        assert_eq!(table.first_free(), Some(ThreadId(2)));
        assert_eq!(table.live(), 3);
    }
}
