//! uthreads multiplexes many user-level threads onto one native thread.
//!
//! * The **scheduler core** ([`kernel::scheduler`]) owns the thread table, the FIFO ready
//!   queue and the quantum counters. It is a plain state machine: it decides who runs next
//!   and leaves the switching to its caller.
//! * The **runtime** ([`kernel::Runtime`]) wires that core to real stacks, a hand-written
//!   x86_64 context switch and a preemption timer. Every mutation runs with the preemption
//!   signal masked, which is the only mutual exclusion a single native thread needs.
//!
//! Threads are scheduled round-robin. A thread runs until its quantum of process CPU time
//! expires (`SIGVTALRM` from `ITIMER_VIRTUAL`) or it blocks, sleeps or terminates itself.
//!
//! The [`uthread`] module exposes the process-wide API:
//!
//! ```no_run
//! use uthreads::uthread;
//!
//! fn worker() {
//!     for _ in 0..3 {
//!         uthread::sleep(2).unwrap();
//!     }
//! }
//!
//! uthread::init(10_000).unwrap();
//! let tid = uthread::spawn(Some(worker)).unwrap();
//! while uthread::state_of(tid).is_ok() {
//!     std::hint::spin_loop();
//! }
//! ```

pub mod arch;
pub mod error;
pub mod kernel;
pub mod uthread;

pub use error::{Error, Result};
pub use kernel::config::{Config, MAX_THREADS, STACK_SIZE};
pub use kernel::thread::{ThreadEntry, ThreadState, Tid};
pub use kernel::timer::{ManualTimer, PreemptionTimer, Quantum, VirtualTimer};
pub use kernel::Runtime;
