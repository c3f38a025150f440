//! x86_64 port: cli/sti interrupt masking and a callee-saved-register
//! context switch.

use super::Arch;

/// Saved context. Only the stack pointer is stored; the callee-saved
/// registers and flags live on the thread's own stack across a switch.
#[derive(Default)]
#[repr(C)]
pub struct X86_64Context {
    rsp: u64,
}

pub struct X86_64Arch;

impl Arch for X86_64Arch {
    type SavedContext = X86_64Context;

    fn disable_interrupts() {
        unsafe { core::arch::asm!("cli", options(nomem, nostack)) };
    }

    fn enable_interrupts() {
        unsafe { core::arch::asm!("sti", options(nomem, nostack)) };
    }

    fn interrupts_enabled() -> bool {
        let rflags: u64;
        unsafe {
            core::arch::asm!("pushfq; pop {}", out(reg) rflags, options(nomem));
        }
        rflags & (1 << 9) != 0
    }

    fn cycle_count() -> u32 {
        let lo: u32;
        unsafe {
            core::arch::asm!("rdtsc", out("eax") lo, out("edx") _, options(nomem, nostack));
        }
        lo
    }

    fn cycles_per_sec() -> u32 {
        // TSC rate is board-specific; a port layer measuring against a
        // calibrated timer should replace this nominal value.
        1_000_000_000
    }

    unsafe fn init_context(ctx: &mut X86_64Context, stack: &mut [u8], entry: extern "C" fn() -> !) {
        let top = stack.as_mut_ptr().add(stack.len());
        let mut sp = (top as u64 & !0xF) as *mut u64;

        // keep the entry return slot 16-byte aligned per the SysV ABI
        sp = sp.offset(-1);
        sp = sp.offset(-1);
        *sp = entry as usize as u64;
        for _ in 0..6 {
            // rbp, rbx, r12..r15
            sp = sp.offset(-1);
            *sp = 0;
        }
        sp = sp.offset(-1);
        *sp = 0x202; // rflags with IF set

        ctx.rsp = sp as u64;
    }

    unsafe fn context_switch(prev: *mut X86_64Context, next: *const X86_64Context) {
        switch(prev, next);
    }
}

#[unsafe(naked)]
unsafe extern "C" fn switch(_prev: *mut X86_64Context, _next: *const X86_64Context) {
    core::arch::naked_asm!(
        "
        push rbp
        push rbx
        push r12
        push r13
        push r14
        push r15
        pushfq

        mov [rdi], rsp
        mov rsp, [rsi]

        popfq
        pop r15
        pop r14
        pop r13
        pop r12
        pop rbx
        pop rbp
        ret
        "
    );
}
