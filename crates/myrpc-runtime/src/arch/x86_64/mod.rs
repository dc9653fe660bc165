//! x86_64 context switching (System V AMD64)

use super::EntryFn;
use std::arch::naked_asm;

/// Callee-saved registers of a suspended context.
///
/// Field offsets are hard-coded in `switch_context`.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct Registers {
    pub rsp: u64, // 0x00
    pub rip: u64, // 0x08
    pub rbx: u64, // 0x10
    pub rbp: u64, // 0x18
    pub r12: u64, // 0x20
    pub r13: u64, // 0x28
    pub r14: u64, // 0x30
    pub r15: u64, // 0x38
}

/// Prepare `regs` so that switching to it runs `entry(arg)` on the
/// stack ending at `stack_top`.
///
/// # Safety
///
/// `stack_top` must be the high end of a writable stack mapping that
/// outlives every switch into `regs`.
#[inline]
pub unsafe fn init_context(regs: &mut Registers, stack_top: *mut u8, entry: EntryFn, arg: usize) {
    // The trampoline is entered by `jmp`, so rsp is exactly 16-aligned
    // there; its `call` then leaves the entry at rsp % 16 == 8 as the ABI expects.
    let sp = (stack_top as usize) & !0xF;

    *regs = Registers {
        rsp: sp as u64,
        rip: fiber_trampoline as usize as u64,
        r12: entry as usize as u64,
        r13: arg as u64,
        ..Registers::default()
    };
}

#[unsafe(naked)]
unsafe extern "C" fn fiber_trampoline() {
    naked_asm!(
        "xor ebp, ebp",
        "mov rdi, r13",
        "call r12",
        "ud2",
    );
}

/// Save callee-saved state into `save` and resume the context in `load`.
///
/// Returns when some other context switches back into `save`.
///
/// # Safety
///
/// `load` must hold a context produced by `init_context` or a previous
/// `switch_context` whose stack is still alive and not running.
#[unsafe(naked)]
pub unsafe extern "C" fn switch_context(_save: *mut Registers, _load: *const Registers) {
    naked_asm!(
        // Save into RDI
        "mov [rdi + 0x00], rsp",
        "lea rax, [rip + 2f]",
        "mov [rdi + 0x08], rax",
        "mov [rdi + 0x10], rbx",
        "mov [rdi + 0x18], rbp",
        "mov [rdi + 0x20], r12",
        "mov [rdi + 0x28], r13",
        "mov [rdi + 0x30], r14",
        "mov [rdi + 0x38], r15",
        // Load from RSI
        "mov rsp, [rsi + 0x00]",
        "mov rax, [rsi + 0x08]",
        "mov rbx, [rsi + 0x10]",
        "mov rbp, [rsi + 0x18]",
        "mov r12, [rsi + 0x20]",
        "mov r13, [rsi + 0x28]",
        "mov r14, [rsi + 0x30]",
        "mov r15, [rsi + 0x38]",
        "jmp rax",
        // Resumed contexts land here with rsp at their return address
        "2:",
        "ret",
    );
}
