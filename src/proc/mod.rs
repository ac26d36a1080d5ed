//! Process table and lifecycle: PCB allocation, kernel-stack ownership,
//! address-space activation and destruction.

pub mod execute;
pub mod scheduler;
pub mod switch;

use alloc::boxed::Box;
use spin::Mutex;

use crate::fs::{FileDescriptor, NUM_FDS};

/// Fixed capacity of the process table.
pub const MAX_PROCESSES: usize = 32;
/// Size, in bytes, of each process's private kernel stack.
pub const KERNEL_STACK_SIZE: usize = 4096 * 4;
/// Maximum length of a process name, including the nul terminator.
pub const PROC_NAME_LEN: usize = 64;

/// Identifies a slot in the process table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PcbId(pub usize);

/// A Process Control Block.
pub struct Pcb {
    pub id: PcbId,
    pub in_use: bool,
    pub kernel_proc: bool,
    pub uid: u32,
    name: [u8; PROC_NAME_LEN],

    /// Huge-page slot holding this process's code + stack image.
    pub proc_slot: usize,
    /// Huge-page slot holding this process's `mmap` region, once granted.
    pub mmap_slot: Option<usize>,

    pub fds: [Option<FileDescriptor>; NUM_FDS],

    /// This PCB's own saved kernel stack pointer, valid only while it is not
    /// the currently running process.
    pub saved_ksp: u64,
    /// The parent's kernel stack pointer at the moment it called `execute`
    /// for this child; restored by `sysret`'s return-to-parent path.
    pub parent_ksp: u64,
    /// The parent PCB id, so `sysret` knows who to unblock/resume.
    pub parent: Option<PcbId>,

    /// True while this PCB's child is running in blocking mode: the
    /// scheduler must not pick this PCB back up until the child exits.
    pub blocking_execute: bool,
    /// True if this PCB was launched non-blocking: on exit, `sysret` hands
    /// control to the scheduler rather than splicing directly back into the
    /// parent.
    pub nonblocking: bool,

    pub sleeping: bool,
    pub ticks_remaining: u32,
    /// Set by `sys_kill`/privileged callers; the next time this PCB would
    /// run, the scheduler instead runs it through `sysret(Killed)`.
    pub should_die: bool,
    /// Set by `sysret` for a non-blocking child that has exited: its
    /// physical resources are already freed, but its table slot (and kernel
    /// stack, which may still be the one we're executing on at the moment
    /// `sysret` runs) is reclaimed later by the scheduler, once something
    /// else is definitely running.
    pub zombie: bool,

    pub set_uid_enabled: bool,
    pub set_uid_blocking: bool,
    pub set_uid_val: u32,

    /// Exit code of the most recent child this PCB launched *blocking*,
    /// written by `sysret` just before it splices control back here.
    pub last_child_exit: i32,

    kern_stack: Box<[u8]>,
}

impl Pcb {
    fn name_bytes(name: &str) -> [u8; PROC_NAME_LEN] {
        let mut field = [0_u8; PROC_NAME_LEN];
        let bytes = name.as_bytes();
        let len = bytes.len().min(PROC_NAME_LEN - 1);
        field[..len].copy_from_slice(&bytes[..len]);
        field
    }

    /// The process's name as a UTF-8 string, for `/proc/all` serialisation.
    #[must_use]
    pub fn name_str(&self) -> &str {
        let nul = self.name.iter().position(|&b| b == 0).unwrap_or(self.name.len());
        core::str::from_utf8(&self.name[..nul]).unwrap_or("")
    }

    fn kernel_stack_top(&self) -> u64 {
        // SAFETY: `kern_stack` is heap-allocated and fixed for the PCB's
        // lifetime; taking its end address does not dereference it.
        self.kern_stack.as_ptr() as u64 + self.kern_stack.len() as u64
    }
}

/// The fixed-capacity process table.
pub struct ProcessTable {
    slots: [Option<Box<Pcb>>; MAX_PROCESSES],
}

impl ProcessTable {
    const EMPTY: Option<Box<Pcb>> = None;

    #[must_use]
    pub const fn new() -> Self {
        Self {
            slots: [Self::EMPTY; MAX_PROCESSES],
        }
    }

    /// Finds a free slot and allocates a kernel stack + PCB into it, without
    /// yet wiring an address space or entry point (that is `execute`'s job).
    pub fn allocate(
        &mut self,
        name: &str,
        uid: u32,
        kernel_proc: bool,
        parent: Option<PcbId>,
    ) -> Option<PcbId> {
        let index = self.slots.iter().position(Option::is_none)?;

        let kern_stack = alloc::vec![0_u8; KERNEL_STACK_SIZE].into_boxed_slice();
        let pcb = Pcb {
            id: PcbId(index),
            in_use: true,
            kernel_proc,
            uid,
            name: Pcb::name_bytes(name),
            proc_slot: 0,
            mmap_slot: None,
            fds: [None; NUM_FDS],
            saved_ksp: 0,
            parent_ksp: 0,
            parent,
            blocking_execute: false,
            nonblocking: false,
            sleeping: false,
            ticks_remaining: 0,
            should_die: false,
            zombie: false,
            set_uid_enabled: false,
            set_uid_blocking: false,
            set_uid_val: 0,
            last_child_exit: 0,
            kern_stack,
        };

        self.slots[index] = Some(Box::new(pcb));
        Some(PcbId(index))
    }

    #[must_use]
    pub fn get(&self, id: PcbId) -> Option<&Pcb> {
        self.slots.get(id.0).and_then(Option::as_ref).map(Box::as_ref)
    }

    pub fn get_mut(&mut self, id: PcbId) -> Option<&mut Pcb> {
        self.slots.get_mut(id.0).and_then(Option::as_mut).map(Box::as_mut)
    }

    pub fn free(&mut self, id: PcbId) {
        if let Some(slot) = self.slots.get_mut(id.0) {
            *slot = None;
        }
    }

    pub fn iter_in_use(&self) -> impl Iterator<Item = &Pcb> {
        self.slots.iter().filter_map(Option::as_ref).map(Box::as_ref)
    }

    /// Mutable access to every occupied slot, used by the scheduler to
    /// advance per-process sleep counters each tick.
    pub fn slots_mut(&mut self) -> impl Iterator<Item = &mut Pcb> {
        self.slots.iter_mut().filter_map(Option::as_mut).map(Box::as_mut)
    }

    /// Returns the kernel stack top for `id`, used when priming a freshly
    /// allocated PCB's initial stack frame.
    #[must_use]
    pub fn kernel_stack_top(&self, id: PcbId) -> Option<u64> {
        self.get(id).map(Pcb::kernel_stack_top)
    }
}

impl Default for ProcessTable {
    fn default() -> Self {
        Self::new()
    }
}

/// The global process table.
pub static PROCESS_TABLE: Mutex<ProcessTable> = Mutex::new(ProcessTable::new());

/// Identifies the PCB currently executing on this (single) CPU.
pub static CURRENT: Mutex<Option<PcbId>> = Mutex::new(None);

/// Runs `f` with shared access to the global process table.
pub fn with_table<R>(f: impl FnOnce(&ProcessTable) -> R) -> R {
    f(&PROCESS_TABLE.lock())
}

/// Runs `f` with exclusive access to the global process table.
pub fn with_table_mut<R>(f: impl FnOnce(&mut ProcessTable) -> R) -> R {
    f(&mut PROCESS_TABLE.lock())
}

#[cfg(test)]
mod tests {
    use super::ProcessTable;

    #[test_case]
    fn allocate_and_free_round_trips_a_slot() {
        let mut table = ProcessTable::new();
        let id = table.allocate("test", 0, false, None).expect("table must have room");
        assert!(table.get(id).is_some());
        table.free(id);
        assert!(table.get(id).is_none());
    }

    #[test_case]
    fn table_is_exhausted_after_max_processes_allocations() {
        let mut table = ProcessTable::new();
        for _ in 0..super::MAX_PROCESSES {
            assert!(table.allocate("p", 0, false, None).is_some());
        }
        assert!(table.allocate("overflow", 0, false, None).is_none());
    }
}
