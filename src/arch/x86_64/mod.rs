//! Minimal 64-bit x86 support layer.
//!
//! Everything here must stay usable from inside a signal handler: no allocation, no locks,
//! and only async-signal-safe system calls.

use core::hint::spin_loop;

pub mod context;

pub use context::{switch_context, Context, ThreadStart};

/// Hint to the CPU that the current core is in a spin loop.
#[inline(always)]
pub fn cpu_relax() {
    spin_loop();
}

/// Report an unrecoverable scheduler invariant violation and abort the process.
///
/// Uses `write(2)` directly so it is safe to call from the preemption signal handler.
pub fn fatal(message: &str) -> ! {
    const PREFIX: &[u8] = b"uthreads: fatal: ";
    write_stderr(PREFIX);
    write_stderr(message.as_bytes());
    write_stderr(b"\n");
    // SAFETY: abort(3) never returns and has no preconditions.
    unsafe { libc::abort() }
}

fn write_stderr(mut bytes: &[u8]) {
    while !bytes.is_empty() {
        // SAFETY: the pointer and length describe a live slice.
        let written = unsafe { libc::write(libc::STDERR_FILENO, bytes.as_ptr().cast(), bytes.len()) };
        if written <= 0 {
            return;
        }
        bytes = &bytes[written as usize..];
    }
}
