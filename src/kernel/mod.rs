//! Thread runtime: the scheduler state machine wired to real stacks, contexts and a timer.

pub mod config;
pub mod queue;
pub mod scheduler;
pub mod sleep;
pub mod stack;
pub mod sync;
pub mod thread;
pub mod timer;

use core::cell::UnsafeCell;
use core::mem::ManuallyDrop;
use core::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use tracing::{debug, info, warn};

use crate::arch::{fatal, switch_context, Context};
use crate::error::Result;
use crate::kernel::config::Config;
use crate::kernel::scheduler::{Scheduler, Suspend, Termination};
use crate::kernel::stack::Stack;
use crate::kernel::sync::{unmask_preemption, CriticalSection};
use crate::kernel::thread::{ThreadEntry, ThreadState, Tid};
use crate::kernel::timer::{PreemptionTimer, Tick};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Cause {
    Preempted,
    Voluntary,
}

/// State shared between the runtime handle, the timer callback and every thread's start
/// routine. Boxed so its address stays fixed while the handle moves.
struct Core<const MAX: usize, T> {
    scheduler: UnsafeCell<Scheduler<MAX>>,
    // Mirrors readable without entering a critical section.
    current: AtomicUsize,
    total_quanta: AtomicU64,
    /// Set when a re-initialization adopted one of this runtime's spawned threads.
    retired: AtomicBool,
    config: Config,
    timer: T,
}

impl<const MAX: usize, T: PreemptionTimer> Core<MAX, T> {
    /// # Safety
    /// No other reference into the scheduler may be live. Holding `_section` keeps the
    /// timer callback from creating one.
    #[allow(clippy::mut_from_ref)]
    unsafe fn scheduler(&self, _section: &CriticalSection) -> &mut Scheduler<MAX> {
        unsafe { &mut *self.scheduler.get() }
    }

    fn publish(&self, scheduler: &Scheduler<MAX>) {
        self.current.store(scheduler.current().raw(), Ordering::Relaxed);
        self.total_quanta
            .store(scheduler.total_quanta(), Ordering::Relaxed);
    }

    fn current_tid(&self) -> Tid {
        Tid::new(self.current.load(Ordering::Relaxed))
    }

    /// Run one scheduling decision and switch to its winner. Returns when the calling
    /// thread is scheduled again.
    ///
    /// # Safety
    /// Must be called inside `section` with no live scheduler references.
    unsafe fn reschedule(&self, section: &CriticalSection, cause: Cause) {
        let contexts = {
            let scheduler = unsafe { self.scheduler(section) };
            let switch = scheduler.schedule();
            self.publish(scheduler);
            if switch.is_noop() {
                None
            } else {
                let from = scheduler.context_ptr(switch.from);
                let to = scheduler.context_ptr(switch.to) as *const Context;
                Some((from, to))
            }
        };
        if cause == Cause::Voluntary {
            self.timer.rearm();
        }
        if let Some((from, to)) = contexts {
            unsafe { switch_context(from, to) };
        }
        unsafe { self.resumed(section) };
    }

    /// First thing a thread does after being switched back in.
    ///
    /// # Safety
    /// Same contract as [`Core::reschedule`].
    unsafe fn resumed(&self, section: &CriticalSection) {
        let scheduler = unsafe { self.scheduler(section) };
        // The previous thread may have terminated itself; its stack is no longer in use.
        drop(scheduler.take_released());
        if scheduler.shutdown_requested() && scheduler.current().is_main() {
            unsafe { self.teardown(section) };
            std::process::exit(0);
        }
    }

    /// # Safety
    /// Same contract as [`Core::reschedule`]; must run on a stack the scheduler does not own.
    unsafe fn teardown(&self, section: &CriticalSection) -> usize {
        self.timer.disarm();
        unsafe { self.scheduler(section) }.release_all()
    }

    /// # Safety
    /// Same contract as [`Core::reschedule`].
    unsafe fn terminate(&self, section: &CriticalSection, tid: Tid) -> Result<()> {
        let outcome = unsafe { self.scheduler(section) }.terminate(tid)?;
        match outcome {
            Termination::Removed => {
                debug!(%tid, "terminated thread");
                Ok(())
            }
            Termination::SelfTerminated => {
                unsafe { self.reschedule(section, Cause::Voluntary) };
                fatal("a terminated thread was scheduled again");
            }
            Termination::Process => {
                let scheduler = unsafe { self.scheduler(section) };
                if scheduler.current().is_main() {
                    let released = unsafe { self.teardown(section) };
                    info!(released, "main thread terminated, exiting");
                    std::process::exit(0);
                }
                info!(from = %scheduler.current(), "main thread terminated, handing off for shutdown");
                let switch = scheduler.hand_off_to_main();
                self.publish(scheduler);
                let from = scheduler.context_ptr(switch.from);
                let to = scheduler.context_ptr(switch.to) as *const Context;
                unsafe { switch_context(from, to) };
                fatal("a thread resumed after process shutdown");
            }
        }
    }
}

/// Timer callback: preempt whatever is running.
unsafe fn on_tick<const MAX: usize, T: PreemptionTimer>(data: *const ()) {
    let core = unsafe { &*(data as *const Core<MAX, T>) };
    let section = CriticalSection::enter();
    unsafe { core.reschedule(&section, Cause::Preempted) };
}

/// Bottom frame of every spawned thread.
extern "C" fn thread_start<const MAX: usize, T: PreemptionTimer>(data: *const ()) -> ! {
    let core = unsafe { &*(data as *const Core<MAX, T>) };
    let entry = {
        // The switch that got us here happened inside the scheduler's critical section and
        // its guard lives on another stack; this nested one only covers the reads below.
        let section = CriticalSection::enter();
        unsafe { core.resumed(&section) };
        let scheduler = unsafe { core.scheduler(&section) };
        scheduler.entry_of(scheduler.current())
    };
    unmask_preemption();

    if let Some(entry) = entry {
        if std::panic::catch_unwind(entry).is_err() {
            fatal("thread entry panicked");
        }
    }

    if core.retired.load(Ordering::Acquire) {
        // This stack became the main thread of the process-wide runtime; returning from
        // it ends the process like terminating tid 0.
        let _ = crate::uthread::terminate(Tid::MAIN);
        fatal("adopted main thread returned but the process did not exit");
    }

    // Falling off the end of the entry terminates the thread.
    let section = CriticalSection::enter();
    let tid = core.current_tid();
    if unsafe { core.terminate(&section, tid) }.is_err() {
        fatal("a returning thread could not terminate itself");
    }
    fatal("a terminated thread was scheduled again");
}

/// An independent user-level thread runtime with `MAX` slots.
///
/// The thread that creates the runtime becomes its main thread (tid 0). Every operation
/// must be called from that OS thread or from one of the runtime's own threads.
pub struct Runtime<const MAX: usize, T: PreemptionTimer> {
    /// Freed on drop unless the runtime was retired.
    core: ManuallyDrop<Box<Core<MAX, T>>>,
}

impl<const MAX: usize, T: PreemptionTimer> Runtime<MAX, T> {
    /// Reset the thread table and arm `timer` with the configured quantum.
    pub fn new(config: Config, timer: T) -> Result<Self> {
        Self::with_main_stack(config, timer, None)
    }

    pub(crate) fn with_main_stack(config: Config, timer: T, main_stack: Option<Stack>) -> Result<Self> {
        let mut scheduler = Scheduler::new();
        if let Some(stack) = main_stack {
            scheduler.adopt_main_stack(stack);
        }
        let core = Box::new(Core {
            current: AtomicUsize::new(scheduler.current().raw()),
            total_quanta: AtomicU64::new(scheduler.total_quanta()),
            retired: AtomicBool::new(false),
            scheduler: UnsafeCell::new(scheduler),
            config,
            timer,
        });

        let data = &*core as *const Core<MAX, T> as *const ();
        // SAFETY: the core is boxed and disarms the timer before it is freed.
        let tick = unsafe { Tick::new(on_tick::<MAX, T>, data) };
        if let Err(err) = core.timer.arm(config.quantum, tick) {
            // An adopted main stack is the one executing this code.
            if let Some(stack) = unsafe { &mut *core.scheduler.get() }.detach_running_stack() {
                core::mem::forget(stack);
            }
            return Err(err);
        }

        info!(
            quantum_us = config.quantum.as_micros(),
            stack_size = config.stack_size,
            max_threads = MAX,
            "thread runtime initialized"
        );
        Ok(Self {
            core: ManuallyDrop::new(core),
        })
    }

    fn core_ptr(&self) -> *const () {
        &**self.core as *const Core<MAX, T> as *const ()
    }

    pub fn config(&self) -> &Config {
        &self.core.config
    }

    pub fn timer(&self) -> &T {
        &self.core.timer
    }

    /// Create a thread that runs `entry` and queue it behind every ready thread.
    pub fn spawn(&self, entry: Option<ThreadEntry>) -> Result<Tid> {
        let data = self.core_ptr();
        let section = CriticalSection::enter();
        let scheduler = unsafe { self.core.scheduler(&section) };
        let tid = scheduler.spawn(entry, self.core.config.stack_size, |_, stack| {
            // SAFETY: the stack stays mapped until the thread is terminated.
            unsafe { Context::prime(stack.top(), thread_start::<MAX, T>, data) }
        })?;
        debug!(%tid, ready = scheduler.ready_queue().len(), "spawned thread");
        Ok(tid)
    }

    /// Terminate `tid`. Terminating the calling thread never returns; terminating the main
    /// thread tears the runtime down and exits the process.
    pub fn terminate(&self, tid: Tid) -> Result<()> {
        let section = CriticalSection::enter();
        unsafe { self.core.terminate(&section, tid) }
    }

    /// Block `tid` until a matching [`Runtime::resume`]. Blocking the calling thread returns
    /// once it has been resumed and scheduled again.
    pub fn block(&self, tid: Tid) -> Result<()> {
        let section = CriticalSection::enter();
        let outcome = unsafe { self.core.scheduler(&section) }.block(tid)?;
        if outcome == Suspend::Reschedule {
            unsafe { self.core.reschedule(&section, Cause::Voluntary) };
        }
        Ok(())
    }

    pub fn resume(&self, tid: Tid) -> Result<()> {
        let section = CriticalSection::enter();
        unsafe { self.core.scheduler(&section) }.resume(tid)
    }

    /// Suspend the calling thread for `quanta` scheduling decisions.
    pub fn sleep(&self, quanta: u64) -> Result<()> {
        let section = CriticalSection::enter();
        let outcome = unsafe { self.core.scheduler(&section) }.sleep(quanta)?;
        if outcome == Suspend::Reschedule {
            unsafe { self.core.reschedule(&section, Cause::Voluntary) };
        }
        Ok(())
    }

    pub fn current_tid(&self) -> Tid {
        self.core.current_tid()
    }

    pub fn total_quanta(&self) -> u64 {
        self.core.total_quanta.load(Ordering::Relaxed)
    }

    pub fn quanta_for(&self, tid: Tid) -> Result<u64> {
        let section = CriticalSection::enter();
        unsafe { self.core.scheduler(&section) }.quanta_for(tid)
    }

    pub fn state_of(&self, tid: Tid) -> Result<ThreadState> {
        let section = CriticalSection::enter();
        unsafe { self.core.scheduler(&section) }.state_of(tid)
    }

    /// Take ownership of the stack the caller is running on, if the runtime owns it.
    fn detach_running_stack(&self) -> Option<Stack> {
        let section = CriticalSection::enter();
        unsafe { self.core.scheduler(&section) }.detach_running_stack()
    }

    /// Tear the runtime down for a re-initialization and hand back the stack the caller
    /// runs on, if the runtime owns it.
    ///
    /// A spawned caller keeps `thread_start` at the bottom of its stack, still pointing at
    /// this runtime's core, so in that case the core is leaked rather than freed.
    pub(crate) fn retire(self) -> Option<Stack> {
        let section = CriticalSection::enter();
        let scheduler = unsafe { self.core.scheduler(&section) };
        let stack = scheduler.detach_running_stack();
        if !scheduler.current().is_main() {
            drop(scheduler.release_main_stack());
            self.core.retired.store(true, Ordering::Release);
        }
        drop(section);
        stack
    }

    /// Disarm the timer and release every spawned thread's stack.
    pub fn shutdown(self) {
        drop(self);
    }
}

impl<const MAX: usize, T: PreemptionTimer> Drop for Runtime<MAX, T> {
    fn drop(&mut self) {
        let section = CriticalSection::enter();
        if let Some(stack) = self.detach_running_stack() {
            warn!(
                tid = %self.current_tid(),
                "runtime dropped while executing on a stack it owns; leaking that stack"
            );
            core::mem::forget(stack);
        }
        let released = unsafe { self.core.teardown(&section) };
        if self.core.retired.load(Ordering::Acquire) {
            debug!(released, "thread runtime retired, core kept for the adopted thread");
        } else {
            debug!(released, "thread runtime shut down");
            // SAFETY: the core is never touched again and no thread of this runtime is left.
            unsafe { ManuallyDrop::drop(&mut self.core) };
        }
        drop(section);
    }
}
