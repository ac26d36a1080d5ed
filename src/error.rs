//! Typed error domain for the kernel's internal subsystems.
//!
//! Handlers inside the memory manager, filesystem, process table and user
//! model return `Result<T, KernelError>` instead of the bare negative
//! sentinels used at the syscall ABI boundary. [`KernelError::to_syscall_code`]
//! is the single place that flattens a typed error down to the wire-level
//! `i32` a user program observes.

/// Errors produced by kernel subsystems below the syscall dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub enum KernelError {
    /// A path, file descriptor, PCB id or user name did not resolve to
    /// anything.
    NotFound,
    /// The caller's UID does not satisfy a resource's access policy.
    PermissionDenied,
    /// A fixed-size table (process table, FD table, mount table, huge-page
    /// bitmap) has no free slot left.
    NoFreeResource,
    /// A syscall argument failed validation (out-of-range pointer, bad
    /// length, malformed path).
    InvalidArgument,
    /// An operation that requires ring-0 privilege was attempted by a
    /// process not holding it.
    PrivilegeDenied,
    /// The calling process has been marked for death and must not observe
    /// any further syscall result.
    Killed,
}

impl KernelError {
    /// Maps a [`KernelError`] onto the negative return code a user process
    /// observes in `EAX` after an `int 0x80`, per the syscall ABI's error
    /// table.
    #[must_use]
    pub const fn to_syscall_code(self) -> i32 {
        match self {
            Self::NotFound | Self::InvalidArgument => -1,
            Self::PermissionDenied => -2,
            Self::NoFreeResource => -3,
            Self::PrivilegeDenied => -5,
            Self::Killed => -8,
        }
    }
}

/// Result alias used throughout the kernel's internal subsystems.
pub type KernelResult<T> = Result<T, KernelError>;
