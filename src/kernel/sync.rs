//! Critical sections for a single native thread shared with a signal handler.
//!
//! There is no second CPU to race with, only the preemption signal. Masking that signal for
//! the duration of a mutation is therefore all the mutual exclusion the scheduler needs.
//! The guard restores whatever mask was in place when it was created, so sections nest, and
//! a guard created inside the signal handler (where the kernel already masks the signal)
//! leaves it masked until the handler returns.

use core::mem::MaybeUninit;
use core::sync::atomic::{compiler_fence, Ordering};

/// Signal delivered by the virtual interval timer on every quantum.
pub const PREEMPTION_SIGNAL: libc::c_int = libc::SIGVTALRM;

fn preemption_set() -> libc::sigset_t {
    let mut set = MaybeUninit::<libc::sigset_t>::uninit();
    // SAFETY: sigemptyset initialises the set before sigaddset reads it.
    unsafe {
        libc::sigemptyset(set.as_mut_ptr());
        libc::sigaddset(set.as_mut_ptr(), PREEMPTION_SIGNAL);
        set.assume_init()
    }
}

fn change_mask(how: libc::c_int, set: &libc::sigset_t) -> libc::sigset_t {
    let mut previous = MaybeUninit::<libc::sigset_t>::uninit();
    // SAFETY: both pointers are valid; sigprocmask fills `previous` on success.
    let rc = unsafe { libc::sigprocmask(how, set, previous.as_mut_ptr()) };
    if rc != 0 {
        crate::arch::fatal("sigprocmask failed");
    }
    compiler_fence(Ordering::SeqCst);
    // SAFETY: initialised by the successful call above.
    unsafe { previous.assume_init() }
}

/// RAII guard keeping the preemption signal masked while alive.
///
/// The saved mask lives on the stack of the thread that entered the section. A thread that
/// is switched out while holding a guard gets its own mask back when it is resumed and the
/// guard drops.
#[must_use = "the critical section ends when the guard is dropped"]
pub struct CriticalSection {
    saved: libc::sigset_t,
}

impl CriticalSection {
    pub fn enter() -> Self {
        let saved = change_mask(libc::SIG_BLOCK, &preemption_set());
        Self { saved }
    }

    /// Whether this section is nested inside another one (or inside the signal handler).
    pub fn is_nested(&self) -> bool {
        // SAFETY: `saved` is an initialised sigset.
        unsafe { libc::sigismember(&self.saved, PREEMPTION_SIGNAL) == 1 }
    }
}

impl Drop for CriticalSection {
    fn drop(&mut self) {
        compiler_fence(Ordering::SeqCst);
        change_mask(libc::SIG_SETMASK, &self.saved);
    }
}

/// Whether the preemption signal is currently masked for the calling OS thread.
pub fn preemption_masked() -> bool {
    let current = change_mask(libc::SIG_BLOCK, &empty_set());
    // SAFETY: `current` was filled by sigprocmask.
    unsafe { libc::sigismember(&current, PREEMPTION_SIGNAL) == 1 }
}

/// Unmask the preemption signal unconditionally.
///
/// Fresh threads start inside the scheduler's critical section but have no guard of their
/// own to drop, so they open the gate with this.
pub fn unmask_preemption() {
    change_mask(libc::SIG_UNBLOCK, &preemption_set());
}

fn empty_set() -> libc::sigset_t {
    let mut set = MaybeUninit::<libc::sigset_t>::uninit();
    // SAFETY: sigemptyset fully initialises the set.
    unsafe {
        libc::sigemptyset(set.as_mut_ptr());
        set.assume_init()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guard_masks_until_dropped() {
        assert!(!preemption_masked());
        {
            let section = CriticalSection::enter();
            assert!(preemption_masked());
            assert!(!section.is_nested());
        }
        assert!(!preemption_masked());
    }

    #[test]
    fn nested_guards_unmask_at_outermost() {
        let outer = CriticalSection::enter();
        {
            let inner = CriticalSection::enter();
            assert!(inner.is_nested());
        }
        assert!(preemption_masked());
        drop(outer);
        assert!(!preemption_masked());
    }

    #[test]
    fn unmask_opens_the_gate() {
        let section = CriticalSection::enter();
        unmask_preemption();
        assert!(!preemption_masked());
        drop(section);
        assert!(!preemption_masked());
    }
}
