//! AArch64 (AAPCS64) context layout and switch routines

use core::{arch::naked_asm, mem::offset_of};

use static_assertions::const_assert_eq;

use crate::{EntryFn, ExitFn, STACK_ALIGN};

/// Saved execution state of a suspended thread.
///
/// Holds the callee-saved general purpose registers `x19..x28`, the frame
/// pointer, the link register (the resume address), the stack pointer and the
/// low halves of the callee-saved SIMD registers `v8..v15`.
///
/// The field order is part of the contract with the assembly below; the
/// offsets are checked at compile time.
#[derive(Debug, Clone)]
#[repr(C)]
pub struct Context {
    x19_x28: [usize; 10],
    fp: usize,
    lr: usize,
    sp: usize,
    d8_d15: [u64; 8],
}

const_assert_eq!(offset_of!(Context, x19_x28), 0x00);
const_assert_eq!(offset_of!(Context, fp), 0x50);
const_assert_eq!(offset_of!(Context, lr), 0x58);
const_assert_eq!(offset_of!(Context, sp), 0x60);
const_assert_eq!(offset_of!(Context, d8_d15), 0x68);
const_assert_eq!(size_of::<Context>(), 0xA8);

impl Context {
    /// An all-zero context.
    ///
    /// Must be filled by [`switch`] (or replaced by [`Context::new_entry`])
    /// before anything resumes it.
    pub const fn empty() -> Self {
        Self {
            x19_x28: [0; 10],
            fp: 0,
            lr: 0,
            sp: 0,
            d8_d15: [0; 8],
        }
    }

    /// Assembles a context that starts executing `entry(arg)` on a new stack.
    ///
    /// The entry function, its argument and the exit function travel in
    /// `x19`, `x20` and `x21`. The frame pointer starts cleared.
    ///
    /// # Safety
    ///
    /// `stack_top` must be the one-past-the-end pointer of a writable stack
    /// region that outlives every use of the returned context.
    pub unsafe fn new_entry(stack_top: *mut u8, entry: EntryFn, arg: usize, exit: ExitFn) -> Self {
        let sp = stack_top as usize & !(STACK_ALIGN - 1);

        let mut ctx = Self::empty();
        ctx.x19_x28[0] = entry as usize;
        ctx.x19_x28[1] = arg;
        ctx.x19_x28[2] = exit as usize;
        ctx.fp = 0;
        ctx.lr = entry_trampoline as usize;
        ctx.sp = sp;
        ctx
    }

    /// Returns the saved stack pointer.
    pub fn stack_pointer(&self) -> usize {
        self.sp
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::empty()
    }
}

/// Saves the caller into `save` and enters `load`.
///
/// Returns when a later [`switch`] or [`resume`] enters `save` again; the
/// return value is the marker passed by that resumer.
///
/// # Safety
///
/// - `save` must be valid for writes and `load` valid for reads.
/// - `load` must hold a context captured by [`switch`] or built by
///   [`Context::new_entry`], whose stack is still alive.
/// - The caller must not hold borrows that the resumed context could
///   invalidate before this call returns.
#[unsafe(naked)]
pub unsafe extern "C" fn switch(save: *mut Context, load: *const Context, marker: usize) -> usize {
    naked_asm!(
        "stp x19, x20, [x0, #0x00]",
        "stp x21, x22, [x0, #0x10]",
        "stp x23, x24, [x0, #0x20]",
        "stp x25, x26, [x0, #0x30]",
        "stp x27, x28, [x0, #0x40]",
        "stp x29, x30, [x0, #0x50]", // The link register becomes the resume address
        "mov x9, sp",
        "str x9, [x0, #0x60]",
        "stp d8, d9, [x0, #0x68]",
        "stp d10, d11, [x0, #0x78]",
        "stp d12, d13, [x0, #0x88]",
        "stp d14, d15, [x0, #0x98]",
        "mov x0, x1",                // resume(load, marker)
        "mov x1, x2",
        "b {resume}",
        resume = sym resume,
    );
}

/// Enters `load` without saving the caller, delivering `marker` as the
/// return value of the [`switch`] that captured it.
///
/// # Safety
///
/// Same requirements on `load` as [`switch`]. Everything on the caller's
/// stack is abandoned.
#[unsafe(naked)]
pub unsafe extern "C" fn resume(load: *const Context, marker: usize) -> ! {
    naked_asm!(
        "ldp x19, x20, [x0, #0x00]",
        "ldp x21, x22, [x0, #0x10]",
        "ldp x23, x24, [x0, #0x20]",
        "ldp x25, x26, [x0, #0x30]",
        "ldp x27, x28, [x0, #0x40]",
        "ldp x29, x30, [x0, #0x50]",
        "ldr x9, [x0, #0x60]",
        "mov sp, x9",
        "ldp d8, d9, [x0, #0x68]",
        "ldp d10, d11, [x0, #0x78]",
        "ldp d12, d13, [x0, #0x88]",
        "ldp d14, d15, [x0, #0x98]",
        "mov x0, x1",                // The marker is the return value
        "ret",
    );
}

/// First code run by a fresh context.
///
/// Calls `entry(arg)` and hands its result to `exit(value, arg)`. The frame
/// marks the link register as undefined, so unwinders walking a fresh stack
/// stop here instead of reading past the stack top.
///
/// # Safety
///
/// Only ever entered through [`resume`] with a context built by
/// [`Context::new_entry`].
#[unsafe(naked)]
unsafe extern "C" fn entry_trampoline() {
    naked_asm!(
        ".cfi_startproc",
        ".cfi_undefined x30", // Outermost frame
        "mov x0, x20",        // First argument: `arg`
        "blr x19",
        "mov x1, x20",        // Second argument: `arg`; `x0` already holds the value
        "blr x21",            // exit(value, arg) never returns
        "brk #0x1",
        ".cfi_endproc",
    );
}
