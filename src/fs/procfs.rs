//! The `/proc` pseudo-mount: a single synthetic file, `/proc/all`, that
//! serialises the live process table. Unlike the image filesystem it has no
//! tree to resolve and no seek support past its first read, matching
//! `proc_read` in the original implementation.

use core::fmt::Write as _;

use crate::error::{KernelError, KernelResult};
use crate::fs::{FdHandle, Resource};

/// Writes into a fixed, caller-owned byte buffer, tracking how much of it
/// has been filled. Used to format `/proc/all` without an allocator.
struct BufWriter<'a> {
    buf: &'a mut [u8],
    written: usize,
}

impl core::fmt::Write for BufWriter<'_> {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        let bytes = s.as_bytes();
        let space = self.buf.len() - self.written;
        let to_copy = bytes.len().min(space);
        self.buf[self.written..self.written + to_copy].copy_from_slice(&bytes[..to_copy]);
        self.written += to_copy;
        Ok(())
    }
}

/// The `/proc` mount. Stateless: all state lives in the process table it
/// reads from at serialisation time.
pub struct ProcFs;

impl ProcFs {
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    pub(crate) fn open(&self, path: &str) -> KernelResult<(FdHandle, Resource)> {
        if path == "/all" {
            Ok((FdHandle::Proc { consumed: false }, Resource::PUBLIC))
        } else {
            Err(KernelError::NotFound)
        }
    }

    /// Serialises one line per live PCB: `"<id>: <name> [KERNEL]"` for
    /// kernel processes, `"<id>: <name> (UID = <uid>)"` otherwise. A second
    /// call on the same descriptor (after the first has been consumed)
    /// returns 0, mirroring `proc_read`'s lack of seek support.
    pub(crate) fn read(&self, handle: &mut FdHandle, _cursor: u32, buf: &mut [u8]) -> usize {
        let FdHandle::Proc { consumed } = handle else {
            return 0;
        };
        if *consumed {
            return 0;
        }
        *consumed = true;

        let mut writer = BufWriter { buf, written: 0 };
        crate::proc::with_table(|table| {
            for pcb in table.iter_in_use() {
                let result = if pcb.kernel_proc {
                    write!(writer, "{:x}: {} [KERNEL]\n", pcb.id.0, pcb.name_str())
                } else {
                    write!(writer, "{:x}: {} (UID = {:x})\n", pcb.id.0, pcb.name_str(), pcb.uid)
                };
                if result.is_err() {
                    break;
                }
            }
        });

        writer.written
    }

    pub(crate) fn write(&self, _handle: &mut FdHandle, _buf: &[u8]) -> usize {
        0
    }
}
