//! Execution context capture and restore.
//!
//! A suspended thread is represented by a single saved stack pointer. Everything else the
//! System V ABI requires a callee to preserve (rbx, rbp, r12-r15, MXCSR and the x87 control
//! word) is pushed onto the suspended thread's own stack by [`switch_context`], followed by the
//! return address that resumes it.
//!
//! Saved frame layout, from the saved stack pointer upwards:
//!
//! ```text
//! +0   MXCSR (u32) | x87 control word (u16) | padding
//! +8   r15
//! +16  r14
//! +24  r13
//! +32  r12
//! +40  rbx
//! +48  rbp
//! +56  return address
//! ```

use core::arch::naked_asm;

/// Entry signature of a freshly primed context. Receives the argument given to
/// [`Context::prime`] and must never return.
pub type ThreadStart = extern "C" fn(*const ()) -> !;

/// Default MXCSR: all exceptions masked, round to nearest.
const DEFAULT_MXCSR: u32 = 0x1F80;
/// Default x87 control word: all exceptions masked, 64-bit precision.
const DEFAULT_FPU_CW: u16 = 0x037F;

const FRAME_WORDS: usize = 8;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(C)]
pub struct Context {
    rsp: usize,
}

impl Context {
    pub const fn empty() -> Self {
        Self { rsp: 0 }
    }

    /// Build a context that, once switched to, calls `start(arg)` on the stack ending at
    /// `stack_top`.
    ///
    /// # Safety
    /// `stack_top` must be the exclusive upper end of a writable region with at least 128
    /// bytes of room below it that stays mapped for as long as the context may be resumed.
    pub unsafe fn prime(stack_top: *mut u8, start: ThreadStart, arg: *const ()) -> Self {
        let top = (stack_top as usize) & !0xF;
        // One zeroed word above the return slot keeps the trampoline's frame 16-byte aligned
        // and terminates frame-pointer walks.
        let frame = (top - (FRAME_WORDS + 1) * 8) as *mut usize;

        let csr = (DEFAULT_MXCSR as usize) | ((DEFAULT_FPU_CW as usize) << 32);
        let trampoline = start_trampoline as *const () as usize;
        let words: [usize; FRAME_WORDS + 1] = [
            csr,
            0,                           // r15
            0,                           // r14
            arg as usize,                // r13
            start as *const () as usize, // r12
            0,                           // rbx
            0,                           // rbp
            trampoline,                  // return address
            0,
        ];
        for (idx, word) in words.iter().enumerate() {
            // SAFETY: the caller guarantees the region below `stack_top` is writable.
            unsafe { frame.add(idx).write(*word) };
        }

        Self {
            rsp: frame as usize,
        }
    }

    pub const fn stack_pointer(&self) -> usize {
        self.rsp
    }
}

/// Save the running context into `from` and resume `to`.
///
/// Returns when some later switch resumes `from`.
///
/// # Safety
/// - `from` must be valid for writes and `to` must hold a context produced by [`Context::prime`]
///   or by an earlier switch whose stack is still mapped.
/// - Must run with the preemption signal masked.
#[unsafe(naked)]
pub unsafe extern "C" fn switch_context(_from: *mut Context, _to: *const Context) {
    naked_asm!(
        "push rbp",
        "push rbx",
        "push r12",
        "push r13",
        "push r14",
        "push r15",
        "sub rsp, 8",
        "stmxcsr dword ptr [rsp]",
        "fnstcw word ptr [rsp + 4]",
        "mov [rdi], rsp",
        "mov rsp, [rsi]",
        "ldmxcsr dword ptr [rsp]",
        "fldcw word ptr [rsp + 4]",
        "add rsp, 8",
        "pop r15",
        "pop r14",
        "pop r13",
        "pop r12",
        "pop rbx",
        "pop rbp",
        "ret",
    );
}

/// First code a primed context runs: calls the start function held in r12 with the
/// argument held in r13.
#[unsafe(naked)]
unsafe extern "C" fn start_trampoline() -> ! {
    naked_asm!("mov rdi, r13", "and rsp, -16", "call r12", "ud2");
}
