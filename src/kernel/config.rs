//! Runtime configuration.

use crate::error::Result;
use crate::kernel::stack::{page_size, round_to_pages};
use crate::kernel::timer::Quantum;

/// Number of thread slots, main thread included.
pub const MAX_THREADS: usize = 100;
/// Bytes reserved for every spawned thread's stack.
pub const STACK_SIZE: usize = 64 * 1024;
/// Smallest stack the runtime accepts; the start trampoline and a panic report need room.
pub const MIN_STACK_SIZE: usize = 16 * 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Config {
    pub quantum: Quantum,
    pub stack_size: usize,
}

impl Config {
    pub fn new(quantum: Quantum) -> Self {
        Self {
            quantum,
            stack_size: STACK_SIZE,
        }
    }

    pub fn from_micros(quantum_usecs: u64) -> Result<Self> {
        Quantum::from_micros(quantum_usecs).map(Self::new)
    }

    /// Use `bytes` per spawned stack, raised to [`MIN_STACK_SIZE`] and rounded up to pages.
    pub fn with_stack_size(mut self, bytes: usize) -> Self {
        self.stack_size = round_to_pages(bytes.max(MIN_STACK_SIZE), page_size());
        self
    }
}
