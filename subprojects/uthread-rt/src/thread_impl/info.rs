//! Thread introspection

use crate::{
    Runtime,
    preempt::NoPreempt,
    tcb::{ThreadId, ThreadStatus},
};

impl Runtime {
    /// Returns the status of slot `id`, or `None` if it is out of range.
    pub fn status(&self, id: ThreadId) -> Option<ThreadStatus> {
        let _guard = NoPreempt::new(self);
        self.table.borrow().get(id).map(|tcb| tcb.status)
    }

    /// Number of threads that have not been reclaimed, thread 0 included.
    pub fn live_threads(&self) -> usize {
        let _guard = NoPreempt::new(self);
        self.table.borrow().live()
    }

    /// Ids of the threads that are ready to run, in scheduling order after
    /// the current one.
    pub fn ready_threads(&self) -> Vec<ThreadId> {
        let _guard = NoPreempt::new(self);
        let table = self.table.borrow();
        let me = self.current();
        let n = table.capacity();

        (1..n)
            .map(|step| ThreadId::from_raw((me.as_raw() + step) % n))
            .filter(|&id| table[id].status == ThreadStatus::Ready)
            .collect()
    }

    /// Number of preemption timer ticks delivered so far.
    pub fn preempt_ticks(&self) -> u64 {
        self.preemption().ticks()
    }
}
