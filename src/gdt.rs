//! GDT and TSS initialization.
//! This module sets up the Global Descriptor Table (GDT) and the Task State Segment (TSS).
//! It includes both kernel and user mode segment descriptors to support Ring 3 execution.

use lazy_static::lazy_static;
use x86_64::{
    instructions::tables::load_tss,
    registers::segmentation::{Segment, CS},
    structures::{
        gdt::{Descriptor, GlobalDescriptorTable, SegmentSelector},
        tss::TaskStateSegment,
    },
    VirtAddr,
};

/// The index of the IST entry for the double fault handler.
pub const DOUBLE_FAULT_IST_INDEX: u16 = 0;

/// Size of the kernel stack used when transitioning from Ring 3 to Ring 0.
const KERNEL_STACK_SIZE: usize = 4096 * 5;

/// Size of the double fault handler stack.
const DOUBLE_FAULT_STACK_SIZE: usize = 4096 * 5;

/// Initialize the Global Descriptor Table (GDT).
pub fn init() {
    init_tss();
    GDT.0.load();

    // SAFETY:
    // The GDT is loaded and the CS register is set to the code selector.
    unsafe {
        CS::set_reg(GDT.1.code_selector);
        load_tss(GDT.1.tss_selector);
    }
}

/// Returns the user code segment selector with Ring 3 privilege level.
#[must_use]
pub fn user_code_selector() -> SegmentSelector {
    GDT.1.user_code_selector
}

/// Returns the user data segment selector with Ring 3 privilege level.
#[must_use]
pub fn user_data_selector() -> SegmentSelector {
    GDT.1.user_data_selector
}

/// Sets the RSP0 field the CPU loads on a ring3 -> ring0 transition (an
/// `int 0x80`, a timer tick, or any fault) while a process is executing in
/// user mode. Called by the scheduler before resuming a process into ring 3
/// so that process traps onto its own private kernel stack rather than a
/// stack some other process is also using, keeping each PCB's saved kernel
/// stack pointer exclusive to it.
///
/// # Safety
/// Must only be called on this single core, and never while a ring3->ring0
/// transition for the previously current process could still be in flight.
pub unsafe fn set_kernel_stack_pointer(rsp0: VirtAddr) {
    // SAFETY: single-core kernel; the scheduler only calls this immediately
    // before splicing into a process that is about to run in ring 3, after
    // the previous process's own trap handling (if any) has completed.
    unsafe {
        (*core::ptr::addr_of_mut!(TSS)).privilege_stack_table[0] = rsp0;
    }
}

/// The TSS is a plain mutable static, not behind `lazy_static!`, because its
/// `privilege_stack_table[0]` entry must be rewritable per process by
/// [`set_kernel_stack_pointer`]; `lazy_static!` only hands out shared
/// references.
static mut TSS: TaskStateSegment = TaskStateSegment::new();

/// Fills in the TSS's double-fault stack and its initial RSP0, before the
/// GDT is built and loaded. Called once from [`init`].
fn init_tss() {
    // SAFETY: called once from `init`, before the GDT (and thus the CPU)
    // can observe the TSS, so no concurrent access is possible yet.
    unsafe {
        let tss = &mut *core::ptr::addr_of_mut!(TSS);

        tss.interrupt_stack_table[DOUBLE_FAULT_IST_INDEX as usize] = {
            static mut STACK: [u8; DOUBLE_FAULT_STACK_SIZE] = [0; DOUBLE_FAULT_STACK_SIZE];
            let stack_start = VirtAddr::from_ptr(&raw const STACK);
            stack_start + DOUBLE_FAULT_STACK_SIZE as u64
        };

        tss.privilege_stack_table[0] = {
            static mut KERNEL_STACK: [u8; KERNEL_STACK_SIZE] = [0; KERNEL_STACK_SIZE];
            let stack_start = VirtAddr::from_ptr(&raw const KERNEL_STACK);
            stack_start + KERNEL_STACK_SIZE as u64
        };
    }
}

/// Holds the GDT segment selectors used during initialization and user mode transitions.
struct Selectors {
    code_selector: SegmentSelector,
    tss_selector: SegmentSelector,
    user_code_selector: SegmentSelector,
    user_data_selector: SegmentSelector,
}

lazy_static! {
    static ref GDT: (GlobalDescriptorTable, Selectors) = {
        let mut gdt = GlobalDescriptorTable::new();
        let code_selector = gdt.add_entry(Descriptor::kernel_code_segment());
        // SAFETY: `init_tss` has already run by the time `GDT` is first
        // forced (from `init`, right before this line), and nothing mutates
        // `TSS` concurrently on this single core.
        let tss_ref: &'static TaskStateSegment = unsafe { &*core::ptr::addr_of!(TSS) };
        let tss_selector = gdt.add_entry(Descriptor::tss_segment(tss_ref));

        // Add user mode segments. The selectors returned by `add_entry` have RPL=0,
        // so we create new selectors with RPL=3 for Ring 3 execution.
        let user_data_entry = gdt.add_entry(Descriptor::user_data_segment());
        let user_code_entry = gdt.add_entry(Descriptor::user_code_segment());

        let user_data_selector = SegmentSelector(user_data_entry.0 | 3);
        let user_code_selector = SegmentSelector(user_code_entry.0 | 3);

        (
            gdt,
            Selectors {
                code_selector,
                tss_selector,
                user_code_selector,
                user_data_selector,
            },
        )
    };
}
