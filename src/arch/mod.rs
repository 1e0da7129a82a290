//! Architecture specific helpers used by the thread runtime.
//!
//! Only 64-bit x86 Linux is supported: the context switch is a hand-written System V
//! trampoline and the preemption timer relies on Linux signal semantics.

#[cfg(not(all(target_arch = "x86_64", target_os = "linux")))]
compile_error!("uthreads currently supports x86_64 Linux only");

pub mod x86_64;

pub use x86_64::{fatal, switch_context, Context};
