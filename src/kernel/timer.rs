//! Preemption timers.
//!
//! A timer owns exactly one registered [`Tick`] callback and invokes it once per quantum.
//! [`VirtualTimer`] drives it from `SIGVTALRM` raised by `setitimer(ITIMER_VIRTUAL)`, so only
//! CPU time the process actually consumes counts towards a quantum. [`ManualTimer`] never
//! fires on its own; tests call [`ManualTimer::fire`] to inject a tick at a chosen point.

use core::cell::Cell;
use core::mem::MaybeUninit;
use core::num::NonZeroU64;
use core::sync::atomic::{AtomicBool, AtomicPtr, AtomicU64, AtomicUsize, Ordering};
use std::io;

use crate::error::{Error, Result};
use crate::kernel::sync::PREEMPTION_SIGNAL;

const MICROS_PER_SEC: u64 = 1_000_000;

/// Length of one scheduling quantum.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Quantum(NonZeroU64);

impl Quantum {
    pub fn from_micros(micros: u64) -> Result<Self> {
        NonZeroU64::new(micros).map(Self).ok_or(Error::InvalidQuantum)
    }

    pub const fn as_micros(&self) -> u64 {
        self.0.get()
    }

    fn as_timeval(&self) -> libc::timeval {
        let micros = self.as_micros();
        libc::timeval {
            tv_sec: (micros / MICROS_PER_SEC) as libc::time_t,
            tv_usec: (micros % MICROS_PER_SEC) as libc::suseconds_t,
        }
    }
}

/// The callback a timer invokes on expiry: a function plus the opaque pointer it receives.
#[derive(Clone, Copy, Debug)]
pub struct Tick {
    func: unsafe fn(*const ()),
    data: *const (),
}

impl Tick {
    /// # Safety
    /// `data` must stay valid, and `func` sound to call with it, until the timer is disarmed.
    pub unsafe fn new(func: unsafe fn(*const ()), data: *const ()) -> Self {
        Self { func, data }
    }

    /// # Safety
    /// Same contract as [`Tick::new`].
    pub unsafe fn invoke(&self) {
        unsafe { (self.func)(self.data) }
    }
}

pub trait PreemptionTimer {
    /// Register `tick` and start firing it every `quantum`.
    fn arm(&self, quantum: Quantum, tick: Tick) -> Result<()>;

    /// Restart the current quantum from zero. Called when a thread gives up the CPU
    /// voluntarily so its successor receives a full slice.
    fn rearm(&self);

    /// Stop firing and forget the registered callback.
    fn disarm(&self);
}

// The signal disposition is process-wide, so the registered callback is too.
static TICK_FUNC: AtomicUsize = AtomicUsize::new(0);
static TICK_DATA: AtomicPtr<()> = AtomicPtr::new(core::ptr::null_mut());
static QUANTUM_MICROS: AtomicU64 = AtomicU64::new(0);
static OWNER: AtomicU64 = AtomicU64::new(0);
static ARMED: AtomicBool = AtomicBool::new(false);
static FORWARDED: AtomicU64 = AtomicU64::new(0);

/// Timer backed by `ITIMER_VIRTUAL` and the `SIGVTALRM` handler.
///
/// Only one instance may be armed at a time in a process.
#[derive(Debug, Default)]
pub struct VirtualTimer {
    _private: (),
}

impl VirtualTimer {
    pub const fn new() -> Self {
        Self { _private: () }
    }

    fn set_interval(value: libc::timeval) -> io::Result<()> {
        let interval = libc::itimerval {
            it_interval: value,
            it_value: value,
        };
        // SAFETY: `interval` is a valid itimerval; the old value is not requested.
        if unsafe { libc::setitimer(libc::ITIMER_VIRTUAL, &interval, core::ptr::null_mut()) } != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Deliveries that landed on a foreign OS thread and were passed on to the owner.
    pub fn forwarded() -> u64 {
        FORWARDED.load(Ordering::Relaxed)
    }

    /// Forget the registered callback and ignore the signal from now on.
    fn unregister() {
        // A signal may still be pending; its default action would kill the process.
        let _ = Self::install(libc::SIG_IGN);
        TICK_FUNC.store(0, Ordering::SeqCst);
        TICK_DATA.store(core::ptr::null_mut(), Ordering::SeqCst);
    }

    fn install(handler: libc::sighandler_t) -> io::Result<()> {
        let mut action = MaybeUninit::<libc::sigaction>::zeroed();
        // SAFETY: a zeroed sigaction is a valid starting point; the fields used are set below.
        unsafe {
            let action = action.as_mut_ptr();
            (*action).sa_sigaction = handler;
            (*action).sa_flags = libc::SA_RESTART;
            libc::sigemptyset(&mut (*action).sa_mask);
        }
        // SAFETY: `action` is fully initialised.
        let rc = unsafe { libc::sigaction(PREEMPTION_SIGNAL, action.as_ptr(), core::ptr::null_mut()) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

impl PreemptionTimer for VirtualTimer {
    fn arm(&self, quantum: Quantum, tick: Tick) -> Result<()> {
        TICK_DATA.store(tick.data as *mut (), Ordering::SeqCst);
        TICK_FUNC.store(tick.func as *const () as usize, Ordering::SeqCst);
        QUANTUM_MICROS.store(quantum.as_micros(), Ordering::SeqCst);
        // SAFETY: pthread_self has no preconditions.
        OWNER.store(unsafe { libc::pthread_self() } as u64, Ordering::SeqCst);

        let handler = on_preemption_signal as *const () as libc::sighandler_t;
        let armed = Self::install(handler).and_then(|()| Self::set_interval(quantum.as_timeval()));
        if let Err(err) = armed {
            // The caller frees whatever `tick.data` points at once this fails.
            Self::unregister();
            return Err(Error::Timer(err));
        }
        ARMED.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn rearm(&self) {
        if !ARMED.load(Ordering::SeqCst) {
            return;
        }
        let micros = QUANTUM_MICROS.load(Ordering::SeqCst);
        let Ok(quantum) = Quantum::from_micros(micros) else {
            return;
        };
        if Self::set_interval(quantum.as_timeval()).is_err() {
            crate::arch::fatal("setitimer failed while re-arming the quantum");
        }
    }

    fn disarm(&self) {
        if !ARMED.swap(false, Ordering::SeqCst) {
            return;
        }
        let zero = libc::timeval {
            tv_sec: 0,
            tv_usec: 0,
        };
        let _ = Self::set_interval(zero);
        Self::unregister();
    }
}

extern "C" fn on_preemption_signal(signal: libc::c_int) {
    // SAFETY: errno is thread-local and always addressable.
    let errno = unsafe { *libc::__errno_location() };

    let owner = OWNER.load(Ordering::SeqCst);
    // SAFETY: pthread_self has no preconditions.
    if unsafe { libc::pthread_self() } as u64 != owner {
        // The timer counts process CPU time, so the kernel may pick any OS thread. Only the
        // thread that armed it may run the scheduler.
        // SAFETY: `owner` was obtained from pthread_self in `arm` and outlives the timer.
        unsafe { libc::pthread_kill(owner as libc::pthread_t, signal) };
        FORWARDED.fetch_add(1, Ordering::Relaxed);
    } else {
        let func = TICK_FUNC.load(Ordering::SeqCst);
        let data = TICK_DATA.load(Ordering::SeqCst);
        if func != 0 {
            // SAFETY: `func` was stored from a `unsafe fn(*const ())` in `arm`.
            let func: unsafe fn(*const ()) = unsafe { core::mem::transmute::<usize, unsafe fn(*const ())>(func) };
            // SAFETY: the registrant guarantees `data` stays valid while armed.
            unsafe { func(data) };
        }
    }

    // SAFETY: errno is thread-local and always addressable.
    unsafe { *libc::__errno_location() = errno };
}

/// Timer that only fires when told to.
///
/// Firing runs the registered callback synchronously on the caller's stack, exactly as if
/// the preemption signal had arrived at that instruction.
#[derive(Debug, Default)]
pub struct ManualTimer {
    tick: Cell<Option<Tick>>,
    quantum: Cell<Option<Quantum>>,
    rearms: Cell<u64>,
}

impl ManualTimer {
    pub const fn new() -> Self {
        Self {
            tick: Cell::new(None),
            quantum: Cell::new(None),
            rearms: Cell::new(0),
        }
    }

    /// Deliver one tick. Returns `false` if the timer is not armed.
    pub fn fire(&self) -> bool {
        match self.tick.get() {
            Some(tick) => {
                // SAFETY: the registrant keeps the tick valid until `disarm`.
                unsafe { tick.invoke() };
                true
            }
            None => false,
        }
    }

    pub fn is_armed(&self) -> bool {
        self.tick.get().is_some()
    }

    pub fn quantum(&self) -> Option<Quantum> {
        self.quantum.get()
    }

    /// How many times the current quantum was restarted by a voluntary switch.
    pub fn rearms(&self) -> u64 {
        self.rearms.get()
    }
}

impl PreemptionTimer for ManualTimer {
    fn arm(&self, quantum: Quantum, tick: Tick) -> Result<()> {
        self.quantum.set(Some(quantum));
        self.tick.set(Some(tick));
        Ok(())
    }

    fn rearm(&self) {
        self.rearms.set(self.rearms.get() + 1);
    }

    fn disarm(&self) {
        self.tick.set(None);
    }
}
