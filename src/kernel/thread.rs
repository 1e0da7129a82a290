//! Thread control blocks and the identifiers the scheduler hands out.

use crate::arch::Context;
use crate::kernel::stack::Stack;

/// Procedure a spawned thread starts executing. Returning from it terminates the thread.
pub type ThreadEntry = fn();

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Tid(usize);

impl Tid {
    /// The thread that called `init`. Always present, never spawned.
    pub const MAIN: Tid = Tid(0);

    pub const fn new(raw: usize) -> Self {
        Self(raw)
    }

    pub const fn raw(&self) -> usize {
        self.0
    }

    pub const fn is_main(&self) -> bool {
        self.0 == 0
    }
}

impl From<usize> for Tid {
    fn from(raw: usize) -> Self {
        Self(raw)
    }
}

impl core::fmt::Display for Tid {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ThreadState {
    Running,
    Ready,
    Blocked,
    Sleeping,
    /// Both asleep and blocked; needs the countdown to expire and a `resume`.
    SleepBlocked,
    Unused,
}

impl ThreadState {
    pub const fn is_sleeping(self) -> bool {
        matches!(self, ThreadState::Sleeping | ThreadState::SleepBlocked)
    }
}

#[derive(Debug)]
pub struct ThreadControlBlock {
    pub tid: Tid,
    pub state: ThreadState,
    pub context: Context,
    pub stack: Option<Stack>,
    pub entry: Option<ThreadEntry>,
    /// Quanta this thread has started, including a partial final one.
    pub quanta: u64,
    /// Value of the global quantum counter at which a sleeping thread wakes; 0 when awake.
    pub wake_at: u64,
}

impl ThreadControlBlock {
    pub const fn unused(tid: Tid) -> Self {
        Self {
            tid,
            state: ThreadState::Unused,
            context: Context::empty(),
            stack: None,
            entry: None,
            quanta: 0,
            wake_at: 0,
        }
    }

    pub fn is_unused(&self) -> bool {
        self.state == ThreadState::Unused
    }

    pub fn mark_running(&mut self) {
        self.state = ThreadState::Running;
        self.quanta = self.quanta.saturating_add(1);
    }

    pub fn mark_ready(&mut self) {
        self.state = ThreadState::Ready;
    }

    /// Return the slot to the unused pool, handing back the stack so the caller decides
    /// when it is safe to release it.
    pub fn release(&mut self) -> Option<Stack> {
        let stack = self.stack.take();
        *self = Self::unused(self.tid);
        stack
    }
}
