//! Kernel binary entry point: platform bring-up, subsystem initialisation,
//! then handing control to the round-robin scheduler.
//!
//! Ordering matters and cannot be collapsed into `citadel_kernel::init()`:
//! the timer handler calls `proc::scheduler::schedule()` unconditionally, so
//! the process table, mounts and first process must exist *before*
//! interrupts are unmasked, not after.

#![feature(custom_test_frameworks)]
#![test_runner(citadel_kernel::test_runner)]
#![reexport_test_harness_main = "test_main"]
#![no_std]
#![no_main]

extern crate alloc;

use alloc::boxed::Box;
use alloc::vec::Vec;
use bootloader::{entry_point, BootInfo};
use core::panic::PanicInfo;
use x86_64::VirtAddr;

use citadel_kernel::config::KernelConfig;
use citadel_kernel::fs::image::ImageFs;
use citadel_kernel::fs::MountTable;
use citadel_kernel::mm::AddressSpaceManager;
use citadel_kernel::user::UserTable;
use citadel_kernel::{allocator, gdt, interrupts, memory, println, proc, user};

entry_point!(kernel_main);

fn kernel_main(boot_info: &'static BootInfo) -> ! {
    println!("booting kernel");

    gdt::init();
    interrupts::init_idt();

    // SAFETY: the PIC is initialised exactly once, here, before interrupts
    // are unmasked at the end of this function.
    unsafe {
        interrupts::PICS.lock().initialize();
    }

    let physical_memory_offset = VirtAddr::new(boot_info.physical_memory_offset);
    // SAFETY: the bootloader maps all physical memory at this offset
    // because the `map_physical_memory` feature is enabled in Cargo.toml,
    // and this is the only call to `memory::init`.
    let mut mapper = unsafe { memory::init(physical_memory_offset) };
    // SAFETY: `boot_info.memory_map` describes the machine's actual usable
    // physical memory, supplied by the bootloader.
    let mut frame_allocator = unsafe { memory::BootInfoFrameAllocator::new(&boot_info.memory_map) };

    allocator::init_heap(&mut mapper, &mut frame_allocator).expect("heap initialisation must succeed");

    let address_space = AddressSpaceManager::new(mapper, frame_allocator);
    citadel_kernel::mm::init(address_space);

    let image = build_default_image();

    let passwd = ImageFs::new(image)
        .read_to_end("/prot/passwd")
        .unwrap_or_default();
    let passwd = core::str::from_utf8(&passwd).unwrap_or("");
    let users = UserTable::load(passwd).unwrap_or_else(|_| UserTable::empty());
    user::init(users);

    let init_program = ImageFs::new(image).read_to_end("/init").unwrap_or_default();

    citadel_kernel::fs::init(MountTable::new(ImageFs::new(image)));

    // A scaffold PCB purely to give `execute` a parent to look up a uid
    // from; it is freed immediately after launching `init` and never runs.
    let boot_pcb = proc::with_table_mut(|table| {
        table
            .allocate("boot", 0, true, None)
            .expect("the process table is empty at boot")
    });

    let config = KernelConfig::standard();
    citadel_kernel::config::init(config);
    match proc::execute::execute(boot_pcb, "init", &init_program, false, &config) {
        Ok(_) => println!("init scheduled"),
        Err(err) => println!("failed to launch init: {err:?}"),
    }
    proc::with_table_mut(|table| table.free(boot_pcb));

    x86_64::instructions::interrupts::enable();

    citadel_kernel::hlt_loop()
}

/// Assembles the filesystem image this kernel boots with: a root directory
/// containing `/prot/passwd` and `/init`. A production boot path would read
/// this image from a boot module instead; multiboot module parsing is an
/// out-of-scope external collaborator here, so the image is built in memory
/// at boot time.
fn build_default_image() -> &'static [u8] {
    const BLOCK_SIZE: usize = 4096;

    let mut image = Vec::with_capacity(BLOCK_SIZE * 6);

    // Block 0: root directory, containing "prot" (block 1) and "init" (block 3).
    let mut root = alloc::vec![0_u8; BLOCK_SIZE];
    root[0..4].copy_from_slice(&0xDEAD_D150_u32.to_le_bytes());
    root[4..8].copy_from_slice(&2_u32.to_le_bytes());
    root[72..76].copy_from_slice(&1_u32.to_le_bytes());
    root[76..80].copy_from_slice(&3_u32.to_le_bytes());
    image.extend_from_slice(&root);

    // Block 1: "/prot" directory, containing "passwd" (block 2).
    let mut prot_dir = alloc::vec![0_u8; BLOCK_SIZE];
    prot_dir[0..4].copy_from_slice(&0xDEAD_D150_u32.to_le_bytes());
    prot_dir[4..8].copy_from_slice(&1_u32.to_le_bytes());
    prot_dir[8..12].copy_from_slice(b"prot");
    prot_dir[72..76].copy_from_slice(&2_u32.to_le_bytes());
    image.extend_from_slice(&prot_dir);

    // Block 2: "/prot/passwd" file entry, one data block (block 5).
    let mut passwd_entry = alloc::vec![0_u8; BLOCK_SIZE];
    passwd_entry[0..4].copy_from_slice(&0xDEAD_DA7A_u32.to_le_bytes());
    passwd_entry[4..8].copy_from_slice(&1_u32.to_le_bytes());
    passwd_entry[8..14].copy_from_slice(b"passwd");
    passwd_entry[72..76].copy_from_slice(&5_u32.to_le_bytes());
    image.extend_from_slice(&passwd_entry);

    // Block 3: "/init" file entry, one data block (block 4).
    let mut init_entry = alloc::vec![0_u8; BLOCK_SIZE];
    init_entry[0..4].copy_from_slice(&0xDEAD_DA7A_u32.to_le_bytes());
    init_entry[4..8].copy_from_slice(&1_u32.to_le_bytes());
    init_entry[8..12].copy_from_slice(b"init");
    init_entry[72..76].copy_from_slice(&4_u32.to_le_bytes());
    image.extend_from_slice(&init_entry);

    // Block 4: init program data. A 28-byte header (ordinary-ELF marker byte,
    // "ELF" magic tail, 32-bit entry point) followed by a trivial flat binary
    // standing in for a compiled user program the way `user_programs/hello`
    // does for manual testing: xor eax,eax / int 0x80 (exit) / jmp $. Init
    // always lands in slot 0, so its entry point can be baked in as an
    // absolute address.
    const INIT_HEADER_LEN: u32 = 28;
    let code: &[u8] = &[0x31, 0xC0, 0xCD, 0x80, 0xEB, 0xFE];
    let mut init_image = alloc::vec![0_u8; INIT_HEADER_LEN as usize];
    init_image[0] = 0x7F;
    init_image[1..4].copy_from_slice(b"ELF");
    let entry_point = citadel_kernel::mm::VIRT_SLOT_BASE as u32 + INIT_HEADER_LEN;
    init_image[24..28].copy_from_slice(&entry_point.to_le_bytes());
    init_image.extend_from_slice(code);

    let mut program_data = alloc::vec![0_u8; BLOCK_SIZE];
    program_data[0..4].copy_from_slice(&(init_image.len() as u32).to_le_bytes());
    program_data[4..4 + init_image.len()].copy_from_slice(&init_image);
    image.extend_from_slice(&program_data);

    // Block 5: passwd data. One user, root, with an empty password.
    let passwd_contents = b"root\n\n";
    let mut passwd_data = alloc::vec![0_u8; BLOCK_SIZE];
    passwd_data[0..4].copy_from_slice(&(passwd_contents.len() as u32).to_le_bytes());
    passwd_data[4..4 + passwd_contents.len()].copy_from_slice(passwd_contents);
    image.extend_from_slice(&passwd_data);

    Box::leak(image.into_boxed_slice())
}

#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    println!("{info}");
    citadel_kernel::hlt_loop()
}

#[cfg(test)]
#[unsafe(no_mangle)]
pub extern "C" fn _start() -> ! {
    test_main();
    citadel_kernel::hlt_loop()
}
