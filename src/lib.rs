//! A small protected-mode kernel: per-process paging, a round-robin
//! scheduler with blocking and non-blocking `execute`, an `int 0x80`
//! syscall dispatcher, and a mount-based read-only virtual filesystem.
//!
//! Refer to `DESIGN.md` for how each module is grounded and `SPEC_FULL.md`
//! for the full requirements this crate implements.

#![no_std]
#![cfg_attr(test, no_main)]
#![feature(custom_test_frameworks)]
#![test_runner(crate::test_runner)]
#![reexport_test_harness_main = "test_main"]

extern crate alloc;

use core::panic::PanicInfo;

pub mod allocator;
pub mod config;
pub mod error;
pub mod fs;
pub mod gdt;
pub mod interrupts;
pub mod io;
pub mod memory;
pub mod mm;
pub mod proc;
pub mod serial;
pub mod syscall;
pub mod user;
pub mod vga_buffer;

const QEMU_EXIT_PORT: u16 = 0xf4;

/// Test entry point for cargo test.
#[cfg(test)]
#[unsafe(no_mangle)]
pub extern "C" fn _start() -> ! {
    init();
    test_main();
    hlt_loop();
}

/// Performs the platform bring-up every boot path needs: GDT/TSS, IDT
/// (CPU exceptions, the timer/keyboard IRQs, the syscall gate), the 8259
/// PIC remap, and unmasking interrupts. Memory management, mounts and the
/// process table are initialised separately by `entry_point`, since they
/// need the bootloader's `BootInfo` which this function does not take.
pub fn init() {
    gdt::init();
    interrupts::init_idt();

    // SAFETY: `PICS` is only initialised once, here, before interrupts are
    // enabled.
    unsafe {
        interrupts::PICS.lock().initialize();
    }

    x86_64::instructions::interrupts::enable();
}

/// Halts the CPU until the next interrupt, the kernel's idle loop body.
pub fn hlt_loop() -> ! {
    loop {
        x86_64::instructions::hlt();
    }
}

/// Define possible exit code for qemu.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum QemuExitCode {
    /// Define a successfull exit status
    Success = 0x10,
    /// Define a failure exit status
    Failure = 0x11,
}

/// Exit qemu with a specific exit code.
/// Connect to an IO Port to exit qemu.
/// Configuration for the exit port is in the config.toml file.
pub fn exit_qemu(exit_code: QemuExitCode) {
    use x86_64::instructions::port::Port;

    // SAFETY:
    // Create a `Port` to write exit_code for qemu.
    unsafe {
        let mut port = Port::new(QEMU_EXIT_PORT);
        port.write(exit_code as u32);
    }
}

/// Panic handler for external (functional) tests.
pub fn test_panic_handler(info: &PanicInfo) -> ! {
    serial_println!("[failed]\n");
    serial_println!("Error: {}\n", info);
    exit_qemu(QemuExitCode::Failure);

    #[expect(
        clippy::empty_loop,
        reason = "Endless loop if a test panics. It should not be possible as we exit_qemu before."
    )]
    loop {}
}

/// Custom test runner for `no_std` testing.
pub fn test_runner(tests: &[&dyn Testable]) {
    println!("Running {} tests", tests.len());
    for test in tests {
        test.run();
    }

    exit_qemu(QemuExitCode::Success);
}

/// Panic handler for unit tests.
#[cfg(test)]
#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    serial_println!("[failed]\n");
    serial_println!("Error: {}\n", info);
    exit_qemu(QemuExitCode::Failure);
    loop {}
}

/// Trait to generalize tests cases.
/// Encapsulate the prints
pub trait Testable {
    /// Function that encapsulate the test run function.
    fn run(&self);
}

impl<T> Testable for T
where
    T: Fn(),
{
    fn run(&self) {
        use core::any::type_name;

        serial_print!("{}...\t", type_name::<T>());
        self();
        serial_println!("[ok]");
    }
}
