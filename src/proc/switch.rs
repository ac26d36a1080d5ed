//! The kernel's three named stack-splicing primitives.
//!
//! Generalises the teacher's single-shot `userspace::process::switch_to_user_mode`
//! into three distinct operations, per the recommendation to isolate
//! stack-splicing into named routines rather than one function that both
//! launches and resumes:
//!
//! - [`enter_user`] — the one-shot ring0→ring3 transition a brand new
//!   process takes the first time it is scheduled. Never returns: control
//!   only ever leaves ring 3 again through an interrupt, not a `ret`.
//! - [`switch_kernel_stack`] — the symmetric primitive both the scheduler
//!   (round-robin resume) and `sysret` (return-to-parent) build on: saves
//!   the caller's callee-saved registers and stack pointer, then restores
//!   another PCB's.
//! - [`prepare_initial_stack`] — lays out a brand new process's kernel
//!   stack so that the *first* `switch_kernel_stack` into it lands in
//!   [`enter_user`] instead of trying to pop a nonexistent prior frame.

use core::arch::naked_asm;
use core::sync::atomic::{AtomicU64, Ordering};

use x86_64::VirtAddr;

use crate::gdt;

/// Mirrors whatever was last installed as the TSS's `privilege_stack_table[0]`,
/// so [`kernel_rsp`] can answer without re-reading the TSS.
static KERNEL_RSP: AtomicU64 = AtomicU64::new(0);

/// Records the kernel stack top the process about to run should trap back
/// into on its next ring3 -> ring0 transition, by installing it into the
/// TSS. Called by the scheduler immediately before resuming a process.
pub fn set_kernel_rsp(kernel_stack_top: VirtAddr) {
    KERNEL_RSP.store(kernel_stack_top.as_u64(), Ordering::SeqCst);
    // SAFETY: single-core kernel; called only from the scheduler, right
    // before splicing into the process this stack belongs to.
    unsafe {
        gdt::set_kernel_stack_pointer(kernel_stack_top);
    }
}

/// Returns the kernel stack top the currently running process traps back
/// into, for installing into the TSS before a context switch.
#[must_use]
pub fn kernel_rsp() -> u64 {
    KERNEL_RSP.load(Ordering::SeqCst)
}

/// Saves the current callee-saved registers and stack pointer into
/// `*save_to`, then restores `restore_from` as the stack pointer and pops
/// its callee-saved registers. Used symmetrically by the scheduler (to
/// deschedule the current PCB and resume another) and by `sysret`'s
/// return-to-parent path (to resume the parent's `execute` frame).
///
/// # Safety
/// `restore_from` must be a stack pointer previously produced by a prior
/// call to this same function (or by [`prepare_initial_stack`]) for a PCB
/// that is not concurrently being resumed elsewhere.
#[unsafe(naked)]
pub unsafe extern "C" fn switch_kernel_stack(save_to: *mut u64, restore_from: u64) {
    naked_asm!(
        "push rbp",
        "push rbx",
        "push r12",
        "push r13",
        "push r14",
        "push r15",
        "mov [rdi], rsp",
        "mov rsp, rsi",
        "pop r15",
        "pop r14",
        "pop r13",
        "pop r12",
        "pop rbx",
        "pop rbp",
        "ret",
    );
}

/// Per-CPU "what should a brand new process do on its first resume"
/// scratch, read by [`initial_entry_trampoline`]. Single-core kernel, so a
/// single static suffices.
static PENDING_ENTRY: AtomicU64 = AtomicU64::new(0);
static PENDING_USER_STACK: AtomicU64 = AtomicU64::new(0);

/// Builds a stack layout for a never-yet-run process: six dummy
/// callee-saved register slots followed by the address of
/// [`initial_entry_trampoline`], so that the first `switch_kernel_stack`
/// into `kernel_stack_top` "pops" those dummies and "returns" into the
/// trampoline exactly the way resuming an already-run process "returns"
/// into the instruction after its last `switch_kernel_stack` call.
///
/// Returns the stack pointer to store as the PCB's `saved_ksp`.
///
/// # Safety
/// `kernel_stack_top` must point one-past-the-end of a kernel stack
/// allocation at least 7 `u64`s (56 bytes) long that nothing else is using.
pub unsafe fn prepare_initial_stack(
    kernel_stack_top: u64,
    entry_point: VirtAddr,
    user_stack_top: VirtAddr,
) -> u64 {
    let mut sp = kernel_stack_top as *mut u64;

    // SAFETY: caller guarantees room for 7 u64 writes below `kernel_stack_top`.
    unsafe {
        sp = sp.sub(1);
        core::ptr::write(sp, initial_entry_trampoline as u64); // return address
        for _ in 0..6 {
            sp = sp.sub(1);
            core::ptr::write(sp, 0); // dummy rbp/rbx/r12..r15
        }
    }

    PENDING_ENTRY.store(entry_point.as_u64(), Ordering::SeqCst);
    PENDING_USER_STACK.store(user_stack_top.as_u64(), Ordering::SeqCst);

    sp as u64
}

/// Landing pad for a brand new process's first resume. Reads the entry
/// point and user stack recorded by [`prepare_initial_stack`] and completes
/// the ring0→ring3 transition.
extern "C" fn initial_entry_trampoline() -> ! {
    let entry_point = PENDING_ENTRY.load(Ordering::SeqCst);
    let user_stack_top = PENDING_USER_STACK.load(Ordering::SeqCst);

    // SAFETY: the caller of `execute` has already mapped the process image
    // and stack user-accessible before its PCB was made runnable.
    unsafe {
        enter_user(entry_point, user_stack_top);
    }
}

/// Transitions from ring 0 to ring 3 at `entry_point`, running on
/// `user_stack_top`. Never returns: control only re-enters ring 0 through an
/// interrupt or the `int 0x80` syscall gate, never through a `ret` out of
/// this function.
///
/// # Safety
/// The caller must ensure `entry_point` and `user_stack_top` lie inside
/// address space already mapped user-accessible for the process about to
/// run, and that this kernel thread owns no resources that a non-returning
/// call would leak.
unsafe fn enter_user(entry_point: u64, user_stack_top: u64) -> ! {
    use x86_64::instructions::segmentation::{Segment, DS};

    let user_cs = gdt::user_code_selector();
    let user_ds = gdt::user_data_selector();

    // SAFETY: loading DS with the user data selector before `iretq` is the
    // conventional prelude to a ring-3 transition; `iretq` itself reloads
    // CS/SS from the frame below.
    unsafe {
        DS::set_reg(user_ds);
        core::arch::asm!(
            "push {ss}",
            "push {sp}",
            "pushfq",
            // Force IF so a freshly scheduled process is preemptible even
            // when entered from a context (the timer ISR) that has
            // interrupts disabled on its own kernel stack.
            "or qword ptr [rsp], 0x200",
            "push {cs}",
            "push {ip}",
            "iretq",
            ss = in(reg) u64::from(user_ds.0),
            sp = in(reg) user_stack_top,
            cs = in(reg) u64::from(user_cs.0),
            ip = in(reg) entry_point,
            options(noreturn),
        );
    }
}
