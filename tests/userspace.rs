//! Integration test for user space execution.
//!
//! Boots the kernel far enough to install the process table, a one-mount
//! filesystem and an address space manager, then launches a trivial program
//! blocking and checks it runs to completion and returns its exit code,
//! exercising the full `execute` -> ring3 -> `int 0x80` -> `sysret` round
//! trip.

#![no_std]
#![no_main]
#![feature(custom_test_frameworks)]
#![test_runner(citadel_kernel::test_runner)]
#![reexport_test_harness_main = "test_main"]
#![allow(missing_docs)]

extern crate alloc;

use bootloader::{entry_point, BootInfo};
use core::panic::PanicInfo;
use citadel_kernel::config::KernelConfig;
use citadel_kernel::fs::image::ImageFs;
use citadel_kernel::fs::MountTable;
use citadel_kernel::mm::AddressSpaceManager;
use citadel_kernel::{
    allocator, gdt, interrupts, memory,
    memory::BootInfoFrameAllocator,
    proc, serial_println,
};
use x86_64::VirtAddr;

entry_point!(test_kernel_main);

fn test_kernel_main(boot_info: &'static BootInfo) -> ! {
    gdt::init();
    interrupts::init_idt();

    // SAFETY: the PIC is only initialised once, here, and never unmasked in
    // this test (no timer/keyboard interrupt is exercised).
    unsafe {
        interrupts::PICS.lock().initialize();
    }

    let phys_mem_offset = VirtAddr::new(boot_info.physical_memory_offset);
    // SAFETY: physical memory offset is valid, as guaranteed by the bootloader.
    let mut mapper = unsafe { memory::init(phys_mem_offset) };
    // SAFETY: the memory map is valid, as guaranteed by the bootloader.
    let mut frame_allocator = unsafe { BootInfoFrameAllocator::new(&boot_info.memory_map) };

    allocator::init_heap(&mut mapper, &mut frame_allocator).expect("heap initialization failed");

    let address_space = AddressSpaceManager::new(mapper, frame_allocator);
    citadel_kernel::mm::init(address_space);

    let image = build_test_image();
    citadel_kernel::fs::init(MountTable::new(ImageFs::new(image)));

    test_main();

    citadel_kernel::hlt_loop();
}

/// A one-block image with no `/prot/passwd`, sufficient for launching a
/// process without going through the user table.
fn build_test_image() -> &'static [u8] {
    const BLOCK_SIZE: usize = 4096;
    let mut image = [0_u8; BLOCK_SIZE];
    image[0..4].copy_from_slice(&0xDEAD_D150_u32.to_le_bytes());
    image[4..8].copy_from_slice(&0_u32.to_le_bytes());
    alloc::boxed::Box::leak(alloc::boxed::Box::new(image))
}

/// A 28-byte header (ordinary-ELF marker byte, "ELF" magic tail, 32-bit
/// entry point) followed by `xor eax,eax` / `int 0x80` (`sys_exit`) / `jmp
/// $`: the smallest program that exercises a real ring3 -> `int 0x80` ->
/// `sysret` round trip.
fn build_exit_program() -> alloc::vec::Vec<u8> {
    const HEADER_LEN: u32 = 28;
    let mut image = alloc::vec![0_u8; HEADER_LEN as usize];
    image[0] = 0x7F;
    image[1..4].copy_from_slice(b"ELF");
    let entry_point = citadel_kernel::mm::VIRT_SLOT_BASE as u32 + HEADER_LEN;
    image[24..28].copy_from_slice(&entry_point.to_le_bytes());
    image.extend_from_slice(&[0x31, 0xC0, 0xCD, 0x80, 0xEB, 0xFE]);
    image
}

#[test_case]
fn a_blocking_child_runs_to_completion_and_returns_its_exit_code() {
    let root = proc::with_table_mut(|table| {
        table
            .allocate("root", 0, true, None)
            .expect("process table must have room")
    });

    let config = KernelConfig::standard();
    let exit_program = build_exit_program();
    let result = proc::execute::execute(root, "exit-test", &exit_program, true, &config);

    assert_eq!(result, Ok(0), "the child must exit with code 0");
    proc::with_table_mut(|table| table.free(root));

    serial_println!("[ok] blocking child ran to completion");
}

#[test_case]
fn syscall_interrupt_index_is_0x80() {
    assert_eq!(
        citadel_kernel::syscall::SYSCALL_INTERRUPT_INDEX,
        0x80,
        "the syscall interrupt vector must be 0x80",
    );
}

#[test_case]
fn huge_page_slots_are_page_aligned_and_outside_low_memory() {
    let base = citadel_kernel::mm::slot_virt_base(0);
    assert_eq!(base % 4096, 0, "slot base must be page-aligned");
    assert!(base >= citadel_kernel::mm::VIRT_SLOT_BASE);
}

#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    citadel_kernel::test_panic_handler(info)
}
