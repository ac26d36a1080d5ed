//! The built-in read-only image filesystem.
//!
//! The boot module hands the kernel one flat byte slice: a sequence of
//! 4 KiB blocks. Block 0 is the tree root, always a directory block. Every
//! block starts with a 4-byte magic number identifying its kind; the layout
//! of the remaining bytes depends on that kind. Writes are always rejected
//! with 0 bytes written, never with an error: the image is read-only by
//! construction, not by a permission check.

use crate::error::{KernelError, KernelResult};
use crate::fs::{FdHandle, Resource, ResourceKind};

const BLOCK_SIZE: usize = 4096;
const NAME_OFFSET: usize = 8;
const NAME_LEN: usize = 64;
const CHILDREN_OFFSET: usize = NAME_OFFSET + NAME_LEN;

/// Magic tag of a directory block.
const DIR_MAGIC: u32 = 0xDEAD_D150;
/// Magic tag of a file-entry block (a file's metadata, distinct from its
/// data blocks).
const FILE_MAGIC: u32 = 0xDEAD_DA7A;

/// A resolved node inside the image tree: the index of its metadata block
/// (directory or file-entry) and which kind it is.
#[derive(Debug, Clone, Copy)]
pub struct ImageHandle {
    block: u32,
    is_dir: bool,
}

/// Wraps the boot-supplied filesystem image and resolves paths against it.
pub struct ImageFs {
    image: &'static [u8],
}

impl ImageFs {
    /// Wraps an already-validated filesystem image.
    #[must_use]
    pub const fn new(image: &'static [u8]) -> Self {
        Self { image }
    }

    fn block(&self, index: u32) -> Option<&[u8]> {
        let start = index as usize * BLOCK_SIZE;
        let end = start.checked_add(BLOCK_SIZE)?;
        self.image.get(start..end)
    }

    fn magic(block: &[u8]) -> u32 {
        u32::from_le_bytes([block[0], block[1], block[2], block[3]])
    }

    fn child_count(block: &[u8]) -> u32 {
        u32::from_le_bytes([block[4], block[5], block[6], block[7]])
    }

    fn name(block: &[u8]) -> &str {
        let raw = &block[NAME_OFFSET..NAME_OFFSET + NAME_LEN];
        let nul = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
        core::str::from_utf8(&raw[..nul]).unwrap_or("")
    }

    fn child(block: &[u8], index: u32) -> u32 {
        let offset = CHILDREN_OFFSET + index as usize * 4;
        u32::from_le_bytes([
            block[offset],
            block[offset + 1],
            block[offset + 2],
            block[offset + 3],
        ])
    }

    /// Resolves a `/`-separated path, starting from the root directory
    /// block. A trailing slash (or the empty path) resolves to the
    /// directory itself rather than erroring, matching the original
    /// `check_path`/`filesys_lookup` convention.
    fn lookup(&self, path: &str) -> KernelResult<ImageHandle> {
        let mut current = 0_u32;
        let mut is_dir = true;

        for component in path.split('/').filter(|c| !c.is_empty()) {
            let block = self.block(current).ok_or(KernelError::NotFound)?;
            if Self::magic(block) != DIR_MAGIC {
                return Err(KernelError::NotFound);
            }

            let count = Self::child_count(block);
            let mut found = None;
            for i in 0..count {
                let child_index = Self::child(block, i);
                let Some(child_block) = self.block(child_index) else {
                    continue;
                };
                if Self::name(child_block) == component {
                    found = Some(child_index);
                    break;
                }
            }

            current = found.ok_or(KernelError::NotFound)?;
            let child_block = self.block(current).ok_or(KernelError::NotFound)?;
            is_dir = Self::magic(child_block) == DIR_MAGIC;
            if !is_dir && Self::magic(child_block) != FILE_MAGIC {
                return Err(KernelError::NotFound);
            }
        }

        Ok(ImageHandle {
            block: current,
            is_dir,
        })
    }

    fn resource_for(path: &str) -> Resource {
        if path == "/prot" || path.starts_with("/prot/") {
            Resource {
                owner_uid: 0,
                kind: ResourceKind::Protected,
            }
        } else {
            Resource::PUBLIC
        }
    }

    pub(crate) fn open(&self, path: &str) -> KernelResult<(FdHandle, Resource)> {
        let handle = self.lookup(path)?;
        Ok((FdHandle::Image(handle), Self::resource_for(path)))
    }

    /// Serialises a directory's child names separated by `\n`, with the
    /// final separator rewritten to `\0`, matching
    /// `filesys_read_bytes_dentry`.
    fn read_dir(&self, block_index: u32, cursor: u32, buf: &mut [u8]) -> usize {
        if cursor != 0 {
            return 0;
        }
        let Some(block) = self.block(block_index) else {
            return 0;
        };
        let count = Self::child_count(block);

        let mut written = 0;
        for i in 0..count {
            let child_index = Self::child(block, i);
            let Some(child_block) = self.block(child_index) else {
                continue;
            };
            let name = Self::name(child_block);
            for byte in name.bytes() {
                if written == buf.len() {
                    return written;
                }
                buf[written] = byte;
                written += 1;
            }
            if written == buf.len() {
                return written;
            }
            buf[written] = b'\n';
            written += 1;
        }

        if written > 0 && buf[written - 1] == b'\n' {
            buf[written - 1] = 0;
        }
        written
    }

    /// Copies a file's data blocks sequentially, each bounded by its own
    /// declared payload size, matching `filesys_read_bytes_fentry`.
    fn read_file(&self, block_index: u32, cursor: u32, buf: &mut [u8]) -> usize {
        let Some(entry) = self.block(block_index) else {
            return 0;
        };
        let block_count = Self::child_count(entry);

        let mut remaining_skip = cursor as usize;
        let mut written = 0;

        for i in 0..block_count {
            if written == buf.len() {
                break;
            }
            let data_index = Self::child(entry, i);
            let Some(data_block) = self.block(data_index) else {
                continue;
            };
            let declared = u32::from_le_bytes([
                data_block[0],
                data_block[1],
                data_block[2],
                data_block[3],
            ]) as usize;
            let payload_len = declared.min(BLOCK_SIZE - 4);
            let payload = &data_block[4..4 + payload_len];

            if remaining_skip >= payload.len() {
                remaining_skip -= payload.len();
                continue;
            }

            let available = &payload[remaining_skip..];
            remaining_skip = 0;
            let to_copy = available.len().min(buf.len() - written);
            buf[written..written + to_copy].copy_from_slice(&available[..to_copy]);
            written += to_copy;
        }

        written
    }

    pub(crate) fn read(&self, handle: &mut FdHandle, cursor: u32, buf: &mut [u8]) -> usize {
        let FdHandle::Image(image_handle) = handle else {
            return 0;
        };
        if image_handle.is_dir {
            self.read_dir(image_handle.block, cursor, buf)
        } else {
            self.read_file(image_handle.block, cursor, buf)
        }
    }

    pub(crate) fn write(&self, _handle: &mut FdHandle, _buf: &[u8]) -> usize {
        0
    }

    /// Reads a whole file's contents in one call, for boot-time callers
    /// (loading `/prot/passwd` and the init program) that run before the
    /// mount table and per-process file descriptors exist.
    pub fn read_to_end(&self, path: &str) -> KernelResult<alloc::vec::Vec<u8>> {
        let handle = self.lookup(path)?;
        if handle.is_dir {
            return Err(KernelError::InvalidArgument);
        }

        let mut out = alloc::vec::Vec::new();
        let mut chunk = [0_u8; 512];
        loop {
            let read = self.read_file(handle.block, out.len() as u32, &mut chunk);
            if read == 0 {
                break;
            }
            out.extend_from_slice(&chunk[..read]);
            if read < chunk.len() {
                break;
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use alloc::boxed::Box;

    use super::{ImageFs, BLOCK_SIZE, DIR_MAGIC};

    fn name_into(block: &mut [u8], name: &str) {
        let bytes = name.as_bytes();
        block[8..8 + bytes.len()].copy_from_slice(bytes);
    }

    fn build_single_file_image() -> [u8; BLOCK_SIZE * 3] {
        let mut image = [0_u8; BLOCK_SIZE * 3];

        image[0..4].copy_from_slice(&DIR_MAGIC.to_le_bytes());
        image[4..8].copy_from_slice(&1_u32.to_le_bytes());
        name_into(&mut image[0..BLOCK_SIZE], "");
        image[72..76].copy_from_slice(&1_u32.to_le_bytes());

        let file_block = &mut image[BLOCK_SIZE..BLOCK_SIZE * 2];
        file_block[0..4].copy_from_slice(&super::FILE_MAGIC.to_le_bytes());
        file_block[4..8].copy_from_slice(&1_u32.to_le_bytes());
        name_into(file_block, "hello.txt");
        file_block[72..76].copy_from_slice(&2_u32.to_le_bytes());

        let data_block = &mut image[BLOCK_SIZE * 2..BLOCK_SIZE * 3];
        data_block[0..4].copy_from_slice(&5_u32.to_le_bytes());
        data_block[4..9].copy_from_slice(b"howdy");

        image
    }

    #[test_case]
    fn resolves_a_nested_file_and_reads_its_bytes() {
        let image: &'static [u8; BLOCK_SIZE * 3] = Box::leak(Box::new(build_single_file_image()));
        let fs = ImageFs::new(image);
        let handle = fs.lookup("/hello.txt").expect("file must resolve");
        assert!(!handle.is_dir);

        let mut buf = [0_u8; 16];
        let read = fs.read_file(handle.block, 0, &mut buf);
        assert_eq!(&buf[..read], b"howdy");
    }

    #[test_case]
    fn missing_path_is_not_found() {
        let image: &'static [u8; BLOCK_SIZE * 3] = Box::leak(Box::new(build_single_file_image()));
        let fs = ImageFs::new(image);
        assert!(fs.lookup("/nope.txt").is_err());
    }
}
