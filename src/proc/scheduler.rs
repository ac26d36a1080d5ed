//! Round-robin scheduler.
//!
//! Driven by the timer interrupt (`interrupts::timer_interrupt_handler`).
//! Cooperative between ticks: a process only ever loses the CPU at a tick
//! boundary or when it blocks inside `execute`, never mid-instruction by any
//! other mechanism.

use x86_64::VirtAddr;

use crate::proc::{switch, PcbId, CURRENT, PROCESS_TABLE};

/// Advances every sleeping PCB's tick counter and clears `sleeping` once it
/// reaches zero. Called once per timer tick, before a reschedule decision.
pub fn tick_sleepers() {
    let mut table = PROCESS_TABLE.lock();
    for pcb in table.slots_mut() {
        if pcb.sleeping {
            if pcb.ticks_remaining == 0 {
                pcb.sleeping = false;
            } else {
                pcb.ticks_remaining -= 1;
            }
        }
    }
}

fn is_runnable(pcb: &crate::proc::Pcb) -> bool {
    pcb.in_use && !pcb.blocking_execute && !pcb.sleeping && !pcb.zombie
}

/// Frees the table slot of every zombie PCB other than `except`. Safe to
/// call once a different PCB is definitely executing, since a zombie's
/// kernel stack is only unsafe to free while control is still running on
/// top of it.
fn reap_zombies(except: Option<PcbId>) {
    let mut table = PROCESS_TABLE.lock();
    let zombies: alloc::vec::Vec<PcbId> = table
        .iter_in_use()
        .filter(|p| p.zombie && Some(p.id) != except)
        .map(|p| p.id)
        .collect();
    for id in zombies {
        table.free(id);
    }
}

/// Picks the next runnable PCB after `after`, wrapping around the table,
/// matching a classic round-robin scan.
fn pick_next(after: usize) -> Option<PcbId> {
    let table = PROCESS_TABLE.lock();
    let len = crate::proc::MAX_PROCESSES;
    for offset in 1..=len {
        let index = (after + offset) % len;
        if let Some(pcb) = table.get(PcbId(index)) {
            if is_runnable(pcb) {
                return Some(PcbId(index));
            }
        }
    }
    None
}

/// Called from the timer interrupt handler. Deschedules the current PCB (if
/// any) and resumes the next runnable one. If the chosen PCB has
/// `should_die` set, it is instead unwound through `sysret`'s kill path
/// before this function returns control to the timer handler's `iretq`.
pub fn schedule() {
    tick_sleepers();

    let current = *CURRENT.lock();
    reap_zombies(current);
    let after = current.map_or(0, |id| id.0);

    let Some(next) = pick_next(after) else {
        return;
    };

    if current == Some(next) {
        return;
    }

    let should_die = PROCESS_TABLE.lock().get(next).is_some_and(|p| p.should_die);
    if should_die {
        crate::proc::execute::kill_current_in_place(next);
        return;
    }

    *CURRENT.lock() = Some(next);

    let next_ksp = PROCESS_TABLE.lock().get(next).map(|p| p.saved_ksp).unwrap_or(0);
    let next_stack_top = PROCESS_TABLE.lock().kernel_stack_top(next).unwrap_or(0);
    switch::set_kernel_rsp(VirtAddr::new(next_stack_top));

    match current {
        Some(prev) => {
            let mut table = PROCESS_TABLE.lock();
            let saved_ksp = table.get_mut(prev).map(|pcb| core::ptr::addr_of_mut!(pcb.saved_ksp));
            // The spliced-to PCB's very first action once resumed may be a
            // syscall that locks `PROCESS_TABLE` (directly, or via `sysret`
            // unwinding into a parent that does); that lock is never reached
            // if this guard is still held across the stack switch below.
            drop(table);
            if let Some(saved_ksp) = saved_ksp {
                // SAFETY: `prev` is the PCB currently executing on this CPU
                // and `next_ksp` was produced by a prior call to
                // `switch_kernel_stack` or `prepare_initial_stack` for
                // `next`, which is not concurrently resumed elsewhere.
                // `saved_ksp` stays valid after `table` drops: the PCB's
                // `Box` isn't freed while `prev` is still the running process.
                unsafe {
                    switch::switch_kernel_stack(saved_ksp, next_ksp);
                }
            }
        }
        None => {
            // SAFETY: the idle kernel thread never resumes past this call;
            // `next_ksp` came from `prepare_initial_stack` or a prior save.
            unsafe {
                let mut discard: u64 = 0;
                switch::switch_kernel_stack(&mut discard, next_ksp);
            }
        }
    }
}
