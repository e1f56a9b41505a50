/*
 * Machine Context Switching
 *
 * A Context holds the System V x86_64 callee-saved register set plus the
 * stack pointer. Switching between contexts is a plain function call from
 * the compiler's point of view, so caller-saved registers need no saving:
 * the switch stores the callee-saved set into the outgoing context, loads
 * the incoming one and returns on the new stack.
 *
 * The return value of `switch` is the driver's only task-completion
 * signal:
 *
 * - 1: the context was re-entered because some other context suspended
 *   back into it via `switch`.
 * - 0: the context was re-entered because a task's entry function
 *   returned and control came back through the task's link context via
 *   `terminate`.
 *
 * Stack layout prepared by `bootstrap` (high addresses up):
 *
 *   [stack top, 16-aligned]
 *   [entry address]   <- saved rsp; the first switch `ret`s into entry
 *   [... free ...]
 *
 * After that `ret` the stack pointer is 8 modulo 16, which is what the
 * ABI guarantees at any function entry, so `entry` can be ordinary
 * compiled code.
 */

use core::arch::naked_asm;
use std::ptr;

/// Saved execution state of one coroutine (or of the main context).
///
/// The field order is fixed: the switch assembly addresses the registers
/// by offset. `link` is never touched by assembly; it records the context
/// a task terminates into when its entry function returns.
#[repr(C)]
pub struct Context {
    rsp: u64, // 0x00
    r15: u64, // 0x08
    r14: u64, // 0x10
    r13: u64, // 0x18
    r12: u64, // 0x20
    rbx: u64, // 0x28
    rbp: u64, // 0x30
    /// Where control goes when the task running on this context returns.
    pub link: *const Context,
}

impl Context {
    pub fn new() -> Context {
        Context {
            rsp: 0,
            r15: 0,
            r14: 0,
            r13: 0,
            r12: 0,
            rbx: 0,
            rbp: 0,
            link: ptr::null(),
        }
    }
}

/// Prepare `ctx` so that the first switch into it enters `entry` on the
/// given stack. `entry` must never return; tasks finish by calling
/// `terminate` on their link context.
pub fn bootstrap(ctx: &mut Context, stack: &mut [u8], entry: extern "C" fn() -> !) {
    let top = (stack.as_mut_ptr() as usize + stack.len()) & !15;
    let slot = top - 16;
    // The first switch restores rsp to `slot` and `ret`s into `entry`.
    unsafe {
        (slot as *mut usize).write(entry as usize);
    }
    ctx.rsp = slot as u64;
    ctx.r15 = 0;
    ctx.r14 = 0;
    ctx.r13 = 0;
    ctx.r12 = 0;
    ctx.rbx = 0;
    ctx.rbp = 0;
}

/// Save the current execution state into `from`, restore `to` and
/// transfer control to it. Returns when something switches (1) or
/// terminates (0) back into `from`.
///
/// # Safety
///
/// Both contexts must stay at their current addresses until control
/// returns here: the caller keeps them in heap boxes owned by the task
/// driver. `to` must have been bootstrapped or previously suspended.
#[unsafe(naked)]
pub unsafe extern "C" fn switch(from: *mut Context, to: *const Context) -> u32 {
    naked_asm!(
        "mov [rdi + 0x00], rsp",
        "mov [rdi + 0x08], r15",
        "mov [rdi + 0x10], r14",
        "mov [rdi + 0x18], r13",
        "mov [rdi + 0x20], r12",
        "mov [rdi + 0x28], rbx",
        "mov [rdi + 0x30], rbp",
        "mov rsp, [rsi + 0x00]",
        "mov r15, [rsi + 0x08]",
        "mov r14, [rsi + 0x10]",
        "mov r13, [rsi + 0x18]",
        "mov r12, [rsi + 0x20]",
        "mov rbx, [rsi + 0x28]",
        "mov rbp, [rsi + 0x30]",
        "mov eax, 1",
        "ret",
    )
}

/// Restore `link` with a switch return value of 0, abandoning the current
/// stack. Called by the task wrapper after the entry function returned;
/// the pending `switch` call in the link context observes the 0 and
/// destroys the finished task.
///
/// # Safety
///
/// `link` must point to a context that is currently suspended in `switch`
/// and that outlives the terminating task.
#[unsafe(naked)]
pub unsafe extern "C" fn terminate(link: *const Context) -> ! {
    naked_asm!(
        "mov rsp, [rdi + 0x00]",
        "mov r15, [rdi + 0x08]",
        "mov r14, [rdi + 0x10]",
        "mov r13, [rdi + 0x18]",
        "mov r12, [rdi + 0x20]",
        "mov rbx, [rdi + 0x28]",
        "mov rbp, [rdi + 0x30]",
        "xor eax, eax",
        "ret",
    )
}
