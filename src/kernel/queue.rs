//! Fixed-capacity FIFO of runnable thread ids.
//!
//! The queue lives inside the scheduler and is touched from the preemption signal handler,
//! so it never allocates: entries sit in a ring buffer sized by the thread table.

use crate::kernel::thread::Tid;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueueError {
    QueueFull,
}

#[derive(Clone, Copy, Debug)]
pub struct ReadyQueue<const MAX: usize> {
    slots: [Tid; MAX],
    head: usize,
    len: usize,
}

impl<const MAX: usize> ReadyQueue<MAX> {
    pub const fn new() -> Self {
        Self {
            slots: [Tid::MAIN; MAX],
            head: 0,
            len: 0,
        }
    }

    pub fn reset(&mut self) {
        self.head = 0;
        self.len = 0;
    }

    pub const fn len(&self) -> usize {
        self.len
    }

    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn push_back(&mut self, tid: Tid) -> Result<(), QueueError> {
        if self.len == MAX {
            return Err(QueueError::QueueFull);
        }
        let idx = (self.head + self.len) % MAX;
        self.slots[idx] = tid;
        self.len += 1;
        Ok(())
    }

    pub fn pop_front(&mut self) -> Option<Tid> {
        if self.len == 0 {
            return None;
        }
        let tid = self.slots[self.head];
        self.head = (self.head + 1) % MAX;
        self.len -= 1;
        Some(tid)
    }

    /// Remove `tid` if queued, keeping the order of the remaining entries.
    pub fn remove(&mut self, tid: Tid) -> bool {
        let Some(pos) = self.iter().position(|queued| queued == tid) else {
            return false;
        };
        let mut step = pos;
        while step + 1 < self.len {
            let dst = (self.head + step) % MAX;
            let src = (self.head + step + 1) % MAX;
            self.slots[dst] = self.slots[src];
            step += 1;
        }
        self.len -= 1;
        true
    }

    pub fn contains(&self, tid: Tid) -> bool {
        self.iter().any(|queued| queued == tid)
    }

    pub fn iter(&self) -> impl Iterator<Item = Tid> + '_ {
        (0..self.len).map(move |step| self.slots[(self.head + step) % MAX])
    }
}

impl<const MAX: usize> Default for ReadyQueue<MAX> {
    fn default() -> Self {
        Self::new()
    }
}
