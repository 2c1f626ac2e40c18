//! x86_64 (System V) context layout and switch routines

use core::{arch::naked_asm, mem::offset_of};

use static_assertions::const_assert_eq;

use crate::{EntryFn, ExitFn, STACK_ALIGN};

/// Default MXCSR value: all SSE exceptions masked, round to nearest.
const DEFAULT_MXCSR: u32 = 0x1F80;

/// Default x87 control word: all exceptions masked, 64-bit precision.
const DEFAULT_FPU_CW: u16 = 0x037F;

/// Saved execution state of a suspended thread.
///
/// Only the registers the System V ABI requires a callee to preserve are
/// stored. Everything else is, by definition, already dead at the call
/// boundary where [`switch`] is entered.
///
/// The field order is part of the contract with the assembly below; the
/// offsets are checked at compile time.
#[derive(Debug, Clone)]
#[repr(C)]
pub struct Context {
    rbx: usize,
    rbp: usize,
    r12: usize,
    r13: usize,
    r14: usize,
    r15: usize,
    rsp: usize,
    rip: usize,
    mxcsr: u32,
    fpu_cw: u16,
    _pad: u16,
}

const_assert_eq!(offset_of!(Context, rbx), 0x00);
const_assert_eq!(offset_of!(Context, rbp), 0x08);
const_assert_eq!(offset_of!(Context, r12), 0x10);
const_assert_eq!(offset_of!(Context, r13), 0x18);
const_assert_eq!(offset_of!(Context, r14), 0x20);
const_assert_eq!(offset_of!(Context, r15), 0x28);
const_assert_eq!(offset_of!(Context, rsp), 0x30);
const_assert_eq!(offset_of!(Context, rip), 0x38);
const_assert_eq!(offset_of!(Context, mxcsr), 0x40);
const_assert_eq!(offset_of!(Context, fpu_cw), 0x44);

impl Context {
    /// An all-zero context.
    ///
    /// Must be filled by [`switch`] (or replaced by [`Context::new_entry`])
    /// before anything resumes it.
    pub const fn empty() -> Self {
        Self {
            rbx: 0,
            rbp: 0,
            r12: 0,
            r13: 0,
            r14: 0,
            r15: 0,
            rsp: 0,
            rip: 0,
            mxcsr: DEFAULT_MXCSR,
            fpu_cw: DEFAULT_FPU_CW,
            _pad: 0,
        }
    }

    /// Assembles a context that starts executing `entry(arg)` on a new stack.
    ///
    /// The entry function and its argument travel in `r12` and `r13`, and the
    /// exit function in `r14`. The trampoline starts with `rsp` at the aligned
    /// stack top and `rbp` cleared.
    ///
    /// # Safety
    ///
    /// `stack_top` must be the one-past-the-end pointer of a writable stack
    /// region that outlives every use of the returned context.
    pub unsafe fn new_entry(stack_top: *mut u8, entry: EntryFn, arg: usize, exit: ExitFn) -> Self {
        // On function entry the ABI expects `rsp + 8` to be 16-byte aligned;
        // the trampoline's own `call` pushes that word.
        let rsp = stack_top as usize & !(STACK_ALIGN - 1);

        Self {
            rbp: 0,
            r12: entry as usize,
            r13: arg,
            r14: exit as usize,
            rsp,
            rip: entry_trampoline as usize,
            ..Self::empty()
        }
    }

    /// Returns the saved stack pointer.
    pub fn stack_pointer(&self) -> usize {
        self.rsp
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
        "mov [rdi + 0x00], rbx",
        "mov [rdi + 0x08], rbp",
        "mov [rdi + 0x10], r12",
        "mov [rdi + 0x18], r13",
        "mov [rdi + 0x20], r14",
        "mov [rdi + 0x28], r15",
        "lea rax, [rsp + 8]",             // Stack pointer as seen after our `ret`
        "mov [rdi + 0x30], rax",
        "mov rax, [rsp]",                 // Our return address becomes the resume address
        "mov [rdi + 0x38], rax",
        "stmxcsr dword ptr [rdi + 0x40]",
        "fnstcw word ptr [rdi + 0x44]",
        "mov rdi, rsi",                   // resume(load, marker)
        "mov rsi, rdx",
        "jmp {resume}",
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
        "ldmxcsr dword ptr [rdi + 0x40]",
        "fldcw word ptr [rdi + 0x44]",
        "mov rbx, [rdi + 0x00]",
        "mov rbp, [rdi + 0x08]",
        "mov r12, [rdi + 0x10]",
        "mov r13, [rdi + 0x18]",
        "mov r14, [rdi + 0x20]",
        "mov r15, [rdi + 0x28]",
        "mov rsp, [rdi + 0x30]",
        "mov rax, rsi",                   // The marker is the return value
        "jmp qword ptr [rdi + 0x38]",
    );
}

/// First code run by a fresh context.
///
/// Calls `entry(arg)` and hands its result to `exit(value, arg)`. The frame
/// marks the return address as undefined, so unwinders walking a fresh stack
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
        ".cfi_undefined rip", // Outermost frame
        "mov rdi, r13",       // First argument: `arg`
        "call r12",
        "mov rdi, rax",       // First argument: the entry function's return value
        "mov rsi, r13",       // Second argument: `arg`, preserved as a callee-saved register
        "call r14",           // exit(value, arg) never returns
        "ud2",
        ".cfi_endproc",
    );
}
