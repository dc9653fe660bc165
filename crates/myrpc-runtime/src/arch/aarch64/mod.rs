//! aarch64 context switching (AAPCS64)

use super::EntryFn;
use std::arch::naked_asm;

/// Callee-saved registers of a suspended context: sp, lr, x19-x29, d8-d15.
///
/// Field offsets are hard-coded in `switch_context`.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct Registers {
    pub sp: u64,       // 0x00
    pub lr: u64,       // 0x08
    pub x: [u64; 11],  // 0x10..0x68, x19..x29
    pub d: [u64; 8],   // 0x68..0xa8, d8..d15
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
    let sp = (stack_top as usize) & !0xF;

    let mut x = [0u64; 11];
    x[0] = entry as usize as u64; // x19
    x[1] = arg as u64;            // x20

    *regs = Registers {
        sp: sp as u64,
        lr: fiber_trampoline as usize as u64,
        x,
        d: [0; 8],
    };
}

#[unsafe(naked)]
unsafe extern "C" fn fiber_trampoline() {
    naked_asm!(
        "mov x29, xzr",
        "mov x0, x20",
        "blr x19",
        "brk #0x1",
    );
}

/// Save callee-saved state into `save` and resume the context in `load`.
///
/// # Safety
///
/// Same contract as the x86_64 backend.
#[unsafe(naked)]
pub unsafe extern "C" fn switch_context(_save: *mut Registers, _load: *const Registers) {
    naked_asm!(
        // Save into x0
        "mov x9, sp",
        "str x9,       [x0, #0x00]",
        "str x30,      [x0, #0x08]",
        "stp x19, x20, [x0, #0x10]",
        "stp x21, x22, [x0, #0x20]",
        "stp x23, x24, [x0, #0x30]",
        "stp x25, x26, [x0, #0x40]",
        "stp x27, x28, [x0, #0x50]",
        "str x29,      [x0, #0x60]",
        "stp d8,  d9,  [x0, #0x68]",
        "stp d10, d11, [x0, #0x78]",
        "stp d12, d13, [x0, #0x88]",
        "stp d14, d15, [x0, #0x98]",
        // Load from x1
        "ldr x9,       [x1, #0x00]",
        "mov sp, x9",
        "ldr x30,      [x1, #0x08]",
        "ldp x19, x20, [x1, #0x10]",
        "ldp x21, x22, [x1, #0x20]",
        "ldp x23, x24, [x1, #0x30]",
        "ldp x25, x26, [x1, #0x40]",
        "ldp x27, x28, [x1, #0x50]",
        "ldr x29,      [x1, #0x60]",
        "ldp d8,  d9,  [x1, #0x68]",
        "ldp d10, d11, [x1, #0x78]",
        "ldp d12, d13, [x1, #0x88]",
        "ldp d14, d15, [x1, #0x98]",
        "ret",
    );
}
