//! The STDIO mount: binds file descriptor 0 of every process to the
//! kernel's current [`crate::io::InteractiveSink`]. Reads block for a full
//! line and append a NUL terminator, consuming the final byte of the
//! caller's buffer if the line filled it exactly, matching `stdio_read`.

use crate::error::KernelResult;
use crate::fs::{FdHandle, Resource};
use crate::io::{ConsoleSink, InteractiveSink};

/// The STDIO mount. Carries no state of its own; every descriptor opened
/// against it shares the one global interactive sink.
pub struct StdioMount;

impl StdioMount {
    pub(crate) fn open(&self, _path: &str) -> KernelResult<(FdHandle, Resource)> {
        Ok((FdHandle::Stdio, Resource::PUBLIC))
    }

    pub(crate) fn read(&self, handle: &mut FdHandle, _cursor: u32, buf: &mut [u8]) -> usize {
        let FdHandle::Stdio = handle else {
            return 0;
        };
        if buf.is_empty() {
            return 0;
        }

        let capacity_for_line = buf.len() - 1;
        let line_len = ConsoleSink.read_line(&mut buf[..capacity_for_line]);
        buf[line_len] = 0;
        line_len + 1
    }

    pub(crate) fn write(&self, handle: &mut FdHandle, buf: &[u8]) -> usize {
        let FdHandle::Stdio = handle else {
            return 0;
        };
        ConsoleSink.write(buf);
        buf.len()
    }
}
