//! Filesystem registry.
//!
//! A small number of mounts (the read-only image filesystem, the `/proc`
//! pseudo-mount and the per-process STDIO mount) are registered at boot.
//! [`MountTable::open_common`] resolves a path to the owning mount, applies
//! that mount's optional permission check, and claims a free file
//! descriptor — in that order, matching the original `open_common`.

pub mod image;
pub mod procfs;
pub mod stdio;

use crate::error::{KernelError, KernelResult};

/// Maximum number of mounts the table can hold.
pub const MAX_FILESYSTEMS: usize = 8;
/// Maximum number of simultaneously open file descriptors per process.
pub const NUM_FDS: usize = 32;
/// Maximum length of a path component's name, including the nul terminator.
pub const FS_NAME_LEN: usize = 64;

/// Whether a [`Resource`] requires UID matching to access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    /// Readable/writable by any UID.
    Public,
    /// Readable/writable only by its owning UID or by UID 0.
    Protected,
}

/// The owner and visibility of an openable object (a file, or a mount-level
/// default applied to every file it exposes).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resource {
    /// UID of the owning user; meaningless when `kind` is `Public`.
    pub owner_uid: u32,
    /// Visibility class.
    pub kind: ResourceKind,
}

impl Resource {
    /// The unrestricted, UID-0-flavoured public resource most files expose.
    pub const PUBLIC: Self = Self {
        owner_uid: 0,
        kind: ResourceKind::Public,
    };

    /// Evaluates whether `caller_uid` may access this resource.
    ///
    /// `PUBLIC` resources are always granted. `PROTECTED` resources are
    /// granted only to their owning UID or to UID 0 (superuser), matching
    /// `access_ok` in the original user model.
    #[must_use]
    pub const fn access_ok(&self, caller_uid: u32) -> bool {
        match self.kind {
            ResourceKind::Public => true,
            ResourceKind::Protected => caller_uid == self.owner_uid || caller_uid == 0,
        }
    }
}

/// Per-mount handle state kept inside an open file descriptor. Each mount
/// contributes one variant; the dispatcher never needs to know which.
#[derive(Debug, Clone, Copy)]
pub enum FdHandle {
    /// A resolved node inside the image filesystem.
    Image(image::ImageHandle),
    /// The process-table pseudo-file; `true` once its one read has happened.
    Proc { consumed: bool },
    /// The STDIO mount; carries no extra state.
    Stdio,
}

/// One open file descriptor slot.
#[derive(Debug, Clone, Copy)]
pub struct FileDescriptor {
    pub(crate) mount: MountId,
    pub(crate) resource: Resource,
    pub(crate) cursor: u32,
    pub(crate) handle: FdHandle,
}

/// Identifies a registered mount by its slot in the [`MountTable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MountId(pub u8);

/// Operations a mount must provide. `check_perm` defaults to always-allow;
/// mounts that gate specific subpaths (the image filesystem's `/prot`
/// prefix) override it.
pub trait Mount {
    /// The path prefix this mount is responsible for (e.g. `"/"`, `"/proc"`).
    fn prefix(&self) -> &str;

    /// Resolves `path` (already stripped of this mount's prefix) to a handle
    /// and the resource controlling access to it.
    fn open(&self, path: &str) -> KernelResult<(FdHandle, Resource)>;

    /// Reads into `buf` starting at `cursor`, returning the number of bytes
    /// written and the updated handle (mounts with no notion of position,
    /// like STDIO, ignore `cursor`).
    fn read(&self, handle: &mut FdHandle, cursor: u32, buf: &mut [u8]) -> usize;

    /// Writes `buf`; the read-only mounts in this kernel always return 0.
    fn write(&self, handle: &mut FdHandle, buf: &[u8]) -> usize {
        let _ = (handle, buf);
        0
    }

    /// Releases any resources a handle holds. No mount in this kernel needs
    /// more than dropping the handle, so the default is a no-op.
    fn close(&self, handle: &FdHandle) {
        let _ = handle;
    }
}

/// The set of registered mounts plus per-process file descriptor storage is
/// split: the table below is global (mounts never change after boot); file
/// descriptors live inside each PCB (`proc::Pcb::fds`).
pub struct MountTable {
    image: image::ImageFs,
    procfs: procfs::ProcFs,
    stdio: stdio::StdioMount,
}

impl MountTable {
    /// Builds the fixed three-mount table this kernel boots with.
    #[must_use]
    pub const fn new(image: image::ImageFs) -> Self {
        Self {
            image,
            procfs: procfs::ProcFs::new(),
            stdio: stdio::StdioMount,
        }
    }

    fn dispatch(&self, path: &str) -> Option<(MountId, &str)> {
        if let Some(rest) = path.strip_prefix("/proc") {
            return Some((MountId(1), rest));
        }
        if let Some(rest) = path.strip_prefix("/stdio") {
            return Some((MountId(2), rest));
        }
        Some((MountId(0), path))
    }

    /// Resolves `path` to a mount, applies that mount's permission check
    /// against `caller_uid`, and returns the `(handle, resource, mount)`
    /// triple ready to be installed in a free file-descriptor slot.
    ///
    /// Ordering matches the original `open_common`: the path is resolved and
    /// permission-checked *before* a descriptor slot is claimed, so a denied
    /// or missing path never consumes a slot.
    pub fn open_common(
        &self,
        path: &str,
        caller_uid: u32,
    ) -> KernelResult<(FdHandle, Resource, MountId)> {
        let (mount_id, rest) = self.dispatch(path).ok_or(KernelError::NotFound)?;
        let (handle, resource) = match mount_id.0 {
            0 => self.image.open(rest)?,
            1 => self.procfs.open(rest)?,
            2 => self.stdio.open(rest)?,
            _ => return Err(KernelError::NotFound),
        };

        if !resource.access_ok(caller_uid) {
            return Err(KernelError::PermissionDenied);
        }

        Ok((handle, resource, mount_id))
    }

    /// Reads through the mount identified by `mount`.
    #[must_use]
    pub fn read(&self, mount: MountId, handle: &mut FdHandle, cursor: u32, buf: &mut [u8]) -> usize {
        match mount.0 {
            0 => self.image.read(handle, cursor, buf),
            1 => self.procfs.read(handle, cursor, buf),
            2 => self.stdio.read(handle, cursor, buf),
            _ => 0,
        }
    }

    /// Writes through the mount identified by `mount`.
    #[must_use]
    pub fn write(&self, mount: MountId, handle: &mut FdHandle, buf: &[u8]) -> usize {
        match mount.0 {
            0 => self.image.write(handle, buf),
            1 => self.procfs.write(handle, buf),
            2 => self.stdio.write(handle, buf),
            _ => 0,
        }
    }
}

/// The global mount table, installed once at boot.
pub static MOUNT_TABLE: spin::Mutex<Option<MountTable>> = spin::Mutex::new(None);

/// Installs the global mount table.
pub fn init(table: MountTable) {
    *MOUNT_TABLE.lock() = Some(table);
}

#[cfg(test)]
mod tests {
    use super::{Resource, ResourceKind};

    #[test_case]
    fn public_resource_grants_any_uid() {
        assert!(Resource::PUBLIC.access_ok(0));
        assert!(Resource::PUBLIC.access_ok(42));
    }

    #[test_case]
    fn protected_resource_grants_owner_and_root_only() {
        let resource = Resource {
            owner_uid: 7,
            kind: ResourceKind::Protected,
        };
        assert!(resource.access_ok(7), "owner must be granted");
        assert!(resource.access_ok(0), "root must be granted");
        assert!(!resource.access_ok(8), "other uids must be denied");
    }
}
