//! External collaborator boundaries.
//!
//! The human-facing shell, the VGA/GUI compositor, font rendering and the
//! BMP background renderer are out of scope: this module defines the narrow
//! trait surface the in-scope kernel needs from them, plus a minimal default
//! implementation backed by the teacher's existing serial/VGA text macros so
//! the kernel is runnable without those collaborators ever being written.

use spin::Mutex;

use pc_keyboard::{layouts, DecodedKey, HandleControl, Keyboard, ScancodeSet1};

/// A sink for blocking line-oriented input, the contract the STDIO mount
/// (`src/fs/stdio.rs`) relies on. A full shell/GUI build would implement
/// this over its own "typeable" widget; here it is implemented directly
/// over the scancode queue fed by the keyboard interrupt handler.
pub trait InteractiveSink {
    /// Blocks until a full line (terminated by Enter) is available, copies
    /// it into `buf` without a trailing newline, and returns the number of
    /// bytes written. Returns `0` if `buf` has no capacity.
    fn read_line(&self, buf: &mut [u8]) -> usize;

    /// Writes `bytes` to the sink's output surface.
    fn write(&self, bytes: &[u8]);

    /// Forwards an `ENVCONFIG` syscall's raw `(arg1, arg2)` pair. A full
    /// shell/GUI build would interpret these as e.g. a color scheme or
    /// cursor mode change; the default here only logs them.
    fn configure(&self, arg1: u64, arg2: u64) {
        let _ = (arg1, arg2);
    }
}

/// Marker trait for the framebuffer compositor; the kernel only needs to
/// know that *something* owns the screen, not how it draws to it.
pub trait GraphicsCollaborator {
    /// Physical base address of the linear framebuffer this collaborator
    /// draws into.
    fn framebuffer_base(&self) -> u64;
}

const SCANCODE_QUEUE_CAPACITY: usize = 256;

struct ScancodeQueue {
    buf: [u8; SCANCODE_QUEUE_CAPACITY],
    head: usize,
    len: usize,
}

impl ScancodeQueue {
    const fn new() -> Self {
        Self {
            buf: [0; SCANCODE_QUEUE_CAPACITY],
            head: 0,
            len: 0,
        }
    }

    fn push(&mut self, scancode: u8) {
        if self.len == SCANCODE_QUEUE_CAPACITY {
            // Drop the oldest byte rather than block the interrupt handler.
            self.head = (self.head + 1) % SCANCODE_QUEUE_CAPACITY;
            self.len -= 1;
        }
        let tail = (self.head + self.len) % SCANCODE_QUEUE_CAPACITY;
        self.buf[tail] = scancode;
        self.len += 1;
    }

    fn pop(&mut self) -> Option<u8> {
        if self.len == 0 {
            return None;
        }
        let scancode = self.buf[self.head];
        self.head = (self.head + 1) % SCANCODE_QUEUE_CAPACITY;
        self.len -= 1;
        Some(scancode)
    }
}

static SCANCODE_QUEUE: Mutex<ScancodeQueue> = Mutex::new(ScancodeQueue::new());

/// Called from the keyboard interrupt handler in `interrupts.rs`.
pub fn add_scancode(scancode: u8) {
    SCANCODE_QUEUE.lock().push(scancode);
}

/// Blocks (spins, yielding via `hlt`) until a decoded character is
/// available, decoding scancodes with the standard US-104 layout.
fn next_char() -> char {
    static KEYBOARD: Mutex<Keyboard<layouts::Us104Key, ScancodeSet1>> = Mutex::new(
        Keyboard::new(ScancodeSet1::new(), layouts::Us104Key, HandleControl::Ignore),
    );

    loop {
        let scancode = SCANCODE_QUEUE.lock().pop();
        let Some(scancode) = scancode else {
            x86_64::instructions::hlt();
            continue;
        };

        let mut keyboard = KEYBOARD.lock();
        if let Ok(Some(event)) = keyboard.add_byte(scancode) {
            if let Some(DecodedKey::Unicode(character)) = keyboard.process_keyevent(event) {
                return character;
            }
        }
    }
}

/// The kernel's default [`InteractiveSink`]: keyboard in, VGA text buffer and
/// serial port out. Stands in for a real "typeable"/terminal widget.
pub struct ConsoleSink;

impl InteractiveSink for ConsoleSink {
    fn read_line(&self, buf: &mut [u8]) -> usize {
        let mut written = 0;
        while written < buf.len() {
            let character = next_char();
            if character == '\n' || character == '\r' {
                break;
            }
            let mut encoded = [0_u8; 4];
            let encoded_str = character.encode_utf8(&mut encoded);
            for byte in encoded_str.bytes() {
                if written == buf.len() {
                    break;
                }
                buf[written] = byte;
                written += 1;
            }
        }
        written
    }

    fn write(&self, bytes: &[u8]) {
        for &byte in bytes {
            crate::print!("{}", byte as char);
        }
    }

    fn configure(&self, arg1: u64, arg2: u64) {
        crate::serial_println!("envconfig: {arg1:#x} {arg2:#x}");
    }
}
