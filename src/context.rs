//! Machine Context Switching
//!
//! The raw register save/restore under fiber switching. A [`Context`] holds
//! the System V callee-saved register set plus stack pointer and resume
//! address; [`switch_context`] saves the current thread of execution into
//! one and resumes another. Everything above this module (fiber state,
//! scheduling) is ordinary Rust; only the jump itself is assembly.

/// Saved execution state: rbx, rbp, r12-r15, rsp, rip.
#[repr(C)]
pub struct Context {
    regs: [u64; 8],
}

impl Context {
    /// A zeroed context. Invalid to switch into until it is either
    /// initialized by [`make_context`] or filled in by a switch *out*.
    pub const fn empty() -> Self {
        Self { regs: [0; 8] }
    }
}

#[cfg(target_arch = "x86_64")]
std::arch::global_asm!(
    // Entry shim for fresh fibers. `switch_context` restores r12 (entry
    // function) and r13 (argument) from the new context and jumps here; the
    // shim moves the argument into place and calls the entry.
    //
    // Stack discipline: rsp is 16-aligned on arrival, so the `call` leaves
    // it in the state the ABI mandates at function entry. The entry
    // function must never return (a dying fiber switches away instead);
    // `ud2` traps if it does.
    ".global filament_fiber_entry",
    "filament_fiber_entry:",
    "mov rdi, r13",
    "call r12",
    "ud2",
);

#[cfg(target_arch = "x86_64")]
extern "C" {
    fn filament_fiber_entry();
}

/// Suspend the current execution into `from` and resume `to`.
///
/// Returns (to the instruction after the switch) when something later
/// switches back into `from`.
///
/// # Safety
///
/// `from` must be valid for writes. `to` must hold either state saved by a
/// previous switch or state built by [`make_context`] over a live stack,
/// and no other thread may be running on that state.
#[cfg(target_arch = "x86_64")]
#[inline(never)]
pub unsafe fn switch_context(from: *mut Context, to: *const Context) {
    // The operand registers are pinned to rdi/rsi: the template saves and
    // then restores every callee-saved register, so letting the allocator
    // place `from` or `to` in one of those would overwrite the pointer
    // mid-restore (and store the pointer instead of the caller's register
    // on the way out).
    std::arch::asm!(
        // Save callee-saved registers into `from`.
        "mov [rdi + 0*8], rbx",
        "mov [rdi + 1*8], rbp",
        "mov [rdi + 2*8], r12",
        "mov [rdi + 3*8], r13",
        "mov [rdi + 4*8], r14",
        "mov [rdi + 5*8], r15",
        "mov [rdi + 6*8], rsp",
        "lea rax, [rip + 2f]", // Resume address for whoever switches back.
        "mov [rdi + 7*8], rax",
        // Restore from `to` and jump.
        "mov rbx, [rsi + 0*8]",
        "mov rbp, [rsi + 1*8]",
        "mov r12, [rsi + 2*8]",
        "mov r13, [rsi + 3*8]",
        "mov r14, [rsi + 4*8]",
        "mov r15, [rsi + 5*8]",
        "mov rsp, [rsi + 6*8]",
        "jmp [rsi + 7*8]",
        "2:",
        inout("rdi") from => _,
        inout("rsi") to => _,
        // Everything not explicitly saved is clobbered across the switch.
        out("rax") _,
        out("rcx") _,
        out("rdx") _,
        out("r8") _,
        out("r9") _,
        out("r10") _,
        out("r11") _,
        options(nostack),
    );
}

/// Fallback for targets without an implementation yet.
#[cfg(not(target_arch = "x86_64"))]
pub unsafe fn switch_context(_from: *mut Context, _to: *const Context) {
    unimplemented!("switch_context is only implemented for x86_64");
}

/// Initialize `ctx` so that switching into it runs `entry(arg)` on the
/// stack ending (exclusively) at `stack_top`.
///
/// # Safety
///
/// `stack_top` must point one past a mapped region large enough for the
/// entry function's frames, and be 16-byte aligned. `entry` must never
/// return.
#[cfg(target_arch = "x86_64")]
pub unsafe fn make_context(
    ctx: *mut Context,
    stack_top: *mut u8,
    entry: unsafe extern "C" fn(*mut u8),
    arg: *mut u8,
) {
    debug_assert_eq!(stack_top as usize % 16, 0);
    (*ctx).regs = [0; 8];
    (*ctx).regs[2] = entry as usize as u64; // r12: picked up by the shim.
    (*ctx).regs[3] = arg as u64; // r13: moved to rdi by the shim.
    (*ctx).regs[6] = stack_top.sub(16) as u64; // rsp
    (*ctx).regs[7] = filament_fiber_entry as usize as u64; // rip
}

/// Fallback for targets without an implementation yet.
#[cfg(not(target_arch = "x86_64"))]
pub unsafe fn make_context(
    _ctx: *mut Context,
    _stack_top: *mut u8,
    _entry: unsafe extern "C" fn(*mut u8),
    _arg: *mut u8,
) {
    unimplemented!("make_context is only implemented for x86_64");
}

#[cfg(all(test, target_arch = "x86_64"))]
mod tests {
    use super::*;
    use crate::stack::create_system_stack;

    static mut CALLER: Context = Context::empty();
    static mut VISITED: bool = false;

    unsafe extern "C" fn visit_and_return(arg: *mut u8) {
        VISITED = true;
        *(arg as *mut u32) = 99;
        switch_context(&mut Context::empty(), std::ptr::addr_of!(CALLER));
        unreachable!();
    }

    static mut PING: Context = Context::empty();
    static mut PONG: Context = Context::empty();

    unsafe extern "C" fn bouncer(arg: *mut u8) {
        let counter = arg as *mut u64;
        loop {
            *counter += 1;
            switch_context(std::ptr::addr_of_mut!(PONG), std::ptr::addr_of!(PING));
        }
    }

    // Both directions of a switch must round-trip the full register set:
    // saving the caller's registers (not the operand pointers) and restoring
    // the target's without tearing down the pointers mid-restore.
    #[test]
    fn test_switch_round_trips_repeatedly() {
        let stack = create_system_stack();
        let mut counter: u64 = 0;
        unsafe {
            let mut target = Context::empty();
            let top = stack.bottom() as usize & !15;
            make_context(
                &mut target,
                top as *mut u8,
                bouncer,
                &mut counter as *mut u64 as *mut u8,
            );
            switch_context(std::ptr::addr_of_mut!(PING), &target);
            for _ in 0..4 {
                switch_context(std::ptr::addr_of_mut!(PING), std::ptr::addr_of!(PONG));
            }
            assert_eq!(counter, 5);
        }
    }

    #[test]
    fn test_switch_runs_entry_with_argument() {
        let stack = create_system_stack();
        let mut value: u32 = 0;
        unsafe {
            let mut target = Context::empty();
            let top = stack.bottom() as usize & !15;
            make_context(
                &mut target,
                top as *mut u8,
                visit_and_return,
                &mut value as *mut u32 as *mut u8,
            );
            switch_context(std::ptr::addr_of_mut!(CALLER), &target);
            assert!(VISITED);
        }
        assert_eq!(value, 99);
    }
}
