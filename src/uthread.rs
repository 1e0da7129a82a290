//! Process-wide thread API.
//!
//! The preemption signal handler is process-wide, so a process runs at most one
//! signal-driven runtime. These functions operate on that runtime; [`init`] creates it and
//! the calling thread becomes tid 0. The OS thread that first calls [`init`] owns the
//! runtime; calls from any other OS thread fail with [`Error::ForeignThread`].

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicU64, Ordering};

use tracing::{error, warn};

use crate::arch::fatal;
use crate::error::{Error, Result};
use crate::kernel::config::{Config, MAX_THREADS};
use crate::kernel::sync::CriticalSection;
use crate::kernel::thread::{ThreadEntry, ThreadState, Tid};
use crate::kernel::timer::VirtualTimer;
use crate::kernel::Runtime;

pub type GlobalRuntime = Runtime<MAX_THREADS, VirtualTimer>;

struct Slot(UnsafeCell<Option<GlobalRuntime>>);

// SAFETY: the slot is only read or written after `owner_check` confirmed the caller is the
// owning OS thread; the signal handler forwards deliveries on other OS threads to it.
unsafe impl Sync for Slot {}

static RUNTIME: Slot = Slot(UnsafeCell::new(None));

/// `pthread_self` of the owning OS thread, 0 before the first `init`.
static OWNER: AtomicU64 = AtomicU64::new(0);

fn this_thread() -> u64 {
    // SAFETY: pthread_self has no preconditions.
    unsafe { libc::pthread_self() as u64 }
}

fn owner_check() -> Result<()> {
    match OWNER.load(Ordering::Acquire) {
        0 => Err(Error::Uninitialized),
        owner if owner != this_thread() => Err(Error::ForeignThread),
        _ => Ok(()),
    }
}

fn runtime() -> Result<&'static GlobalRuntime> {
    owner_check()?;
    // SAFETY: owning thread only; the slot is replaced by `init` inside a critical section.
    unsafe { (*RUNTIME.0.get()).as_ref() }.ok_or(Error::Uninitialized)
}

/// Start the runtime with a quantum of `quantum_usecs` microseconds of process CPU time.
///
/// Calling it again discards every existing thread and starts over; the caller becomes the
/// new main thread. If the caller is a spawned thread, returning from its entry afterwards
/// ends the process like [`terminate`]ing tid 0.
pub fn init(quantum_usecs: u64) -> Result<()> {
    init_with(Config::from_micros(quantum_usecs)?)
}

pub fn init_with(config: Config) -> Result<()> {
    let me = this_thread();
    if let Err(owner) = OWNER.compare_exchange(0, me, Ordering::AcqRel, Ordering::Acquire) {
        if owner != me {
            return Err(Error::ForeignThread);
        }
    }

    let section = CriticalSection::enter();
    // SAFETY: owning thread, preemption masked, and no reference from `runtime()` survives
    // this call.
    let slot = unsafe { &mut *RUNTIME.0.get() };

    let adopted = slot.take().and_then(|old| {
        warn!("re-initializing the thread runtime; existing threads are discarded");
        old.retire()
    });

    match GlobalRuntime::with_main_stack(config, VirtualTimer::new(), adopted) {
        Ok(runtime) => *slot = Some(runtime),
        Err(err) => {
            error!(%err, "cannot start the thread runtime");
            fatal("failed to install the preemption timer");
        }
    }
    drop(section);
    Ok(())
}

pub fn spawn(entry: Option<ThreadEntry>) -> Result<Tid> {
    runtime()?.spawn(entry)
}

/// Terminate `tid`. Never returns when `tid` is the caller; terminating tid 0 exits the
/// process.
pub fn terminate(tid: Tid) -> Result<()> {
    runtime()?.terminate(tid)
}

pub fn block(tid: Tid) -> Result<()> {
    runtime()?.block(tid)
}

pub fn resume(tid: Tid) -> Result<()> {
    runtime()?.resume(tid)
}

pub fn sleep(quanta: u64) -> Result<()> {
    runtime()?.sleep(quanta)
}

/// Id of the running thread; tid 0 before `init`.
pub fn current_tid() -> Tid {
    runtime().map_or(Tid::MAIN, |rt| rt.current_tid())
}

/// Scheduling decisions taken so far, counting the initial quantum; 0 before `init`.
pub fn total_quanta() -> u64 {
    runtime().map_or(0, |rt| rt.total_quanta())
}

pub fn quanta_for(tid: Tid) -> Result<u64> {
    runtime()?.quanta_for(tid)
}

pub fn state_of(tid: Tid) -> Result<ThreadState> {
    runtime()?.state_of(tid)
}

/// Run `f` without being preempted, e.g. around code that is not reentrant such as writes
/// to stdout.
pub fn without_preemption<R>(f: impl FnOnce() -> R) -> R {
    let _section = CriticalSection::enter();
    f()
}
