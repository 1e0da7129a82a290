//! Quantum-based sleeping.
//!
//! A sleeping thread records the absolute value of the global quantum counter at which it
//! becomes eligible again. The scheduler runs [`expire`] at the top of every scheduling
//! decision, before the counter advances.

use crate::kernel::thread::{ThreadControlBlock, ThreadState, Tid};

/// Outcome of a sleep deadline passing for one thread.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Wakeup {
    /// The thread is runnable again and must be queued.
    Ready(Tid),
    /// The thread is still blocked and stays out of the ready queue.
    StillBlocked(Tid),
}

impl ThreadControlBlock {
    pub fn put_to_sleep(&mut self, wake_at: u64) {
        self.wake_at = wake_at;
        self.state = ThreadState::Sleeping;
    }

    /// Clear an expired deadline and move the thread out of its sleeping state.
    fn wake(&mut self) -> Wakeup {
        self.wake_at = 0;
        match self.state {
            ThreadState::SleepBlocked => {
                self.state = ThreadState::Blocked;
                Wakeup::StillBlocked(self.tid)
            }
            _ => {
                self.state = ThreadState::Ready;
                Wakeup::Ready(self.tid)
            }
        }
    }

    fn sleep_expired(&self, now: u64) -> bool {
        self.wake_at != 0 && self.wake_at <= now && self.state.is_sleeping()
    }
}

/// Wake every thread whose deadline has been reached at quantum `now`, in tid order,
/// reporting each wakeup to `on_wake`.
pub fn expire(threads: &mut [ThreadControlBlock], now: u64, mut on_wake: impl FnMut(Wakeup)) {
    for tcb in threads.iter_mut().filter(|tcb| tcb.sleep_expired(now)) {
        on_wake(tcb.wake());
    }
}
