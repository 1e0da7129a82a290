use std::io;

use thiserror::Error;

use crate::kernel::thread::Tid;

/// Errors reported by the thread runtime.
///
/// Every variant is returned synchronously to the caller of the failing operation.
/// Broken scheduler invariants are not represented here; they abort the process through
/// [`crate::arch::fatal`] because they indicate a bug in the runtime rather than a misuse.
#[derive(Debug, Error)]
pub enum Error {
    /// The quantum length passed to `init` was not a positive number of microseconds.
    #[error("quantum length must be a positive number of microseconds")]
    InvalidQuantum,

    /// `spawn` was called without an entry point.
    #[error("cannot spawn a thread without an entry point")]
    NoEntryPoint,

    /// Every non-main slot of the thread table is in use.
    #[error("thread table is full")]
    TableFull,

    /// The tid is out of range, refers to an unused slot, or is the main thread where the
    /// operation does not allow it.
    #[error("invalid thread id {0}")]
    InvalidTid(Tid),

    /// `sleep` was called by the main thread or with a zero duration.
    #[error("only spawned threads may sleep, and for at least one quantum")]
    InvalidSleep,

    /// A process-wide operation was used before `init`.
    #[error("the thread runtime has not been initialized")]
    Uninitialized,

    /// A process-wide operation was called from an OS thread other than the one that
    /// called `init`.
    #[error("the thread runtime belongs to another OS thread")]
    ForeignThread,

    /// Mapping a new thread stack failed.
    #[error("failed to allocate a thread stack: {0}")]
    StackAllocation(#[source] io::Error),

    /// Installing the signal handler or arming the interval timer failed.
    #[error("failed to arm the preemption timer: {0}")]
    Timer(#[source] io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
