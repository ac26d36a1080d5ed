//! `execute` / `sysret`: process launch and the manual stack-splice back to
//! a parent (or, for a non-blocking child, back into the scheduler).
//!
//! Mirrors `process_launch`/`sysret` in the original implementation: the
//! parent's frame is captured *before* the child runs, and the child's
//! frame is torn down *before* any parent-frame splice, never after.

use x86_64::VirtAddr;

use crate::config::KernelConfig;
use crate::error::{KernelError, KernelResult};
use crate::mm::ADDRESS_SPACE;
use crate::proc::{switch, PcbId, CURRENT, PROCESS_TABLE};

/// Byte offset of the 32-bit little-endian entry point within an image.
const ENTRY_POINT_OFFSET: usize = 24;

/// Bytes 1..4 of a conforming image, matching the original's
/// `(*(u32*)image) & 0xFFFFFF00 == ELF_MAGIC & 0xFFFFFF00` check: with
/// `ELF_MAGIC = 0x464c457f` laid out little-endian as `7F 45 4C 46`, masking
/// off the word's low byte leaves memory bytes `[1],[2],[3]` against
/// `b"ELF"` and frees byte `[0]` for the set-uid header encoding below.
const ELF_MAGIC_TAIL: &[u8; 3] = b"ELF";

struct ImageHeader {
    entry_point: u32,
    set_uid_enabled: bool,
    set_uid_blocking: bool,
    set_uid_val: u32,
}

/// Validates the ELF magic and decodes the repurposed header byte and entry
/// point of a process image. Returns `None` if the image is too short or the
/// magic bytes don't match, which callers treat as "roll back and fail".
fn decode_header(image: &[u8]) -> Option<ImageHeader> {
    if image.len() < ENTRY_POINT_OFFSET + 4 {
        return None;
    }
    if &image[1..4] != ELF_MAGIC_TAIL {
        return None;
    }

    let header_byte = image[0];
    let (set_uid_enabled, set_uid_blocking, set_uid_val) = if header_byte == 0x7F {
        (false, false, 0)
    } else {
        (true, header_byte & 0x80 != 0, u32::from(header_byte & 0x7F))
    };

    let entry_bytes: [u8; 4] = image[ENTRY_POINT_OFFSET..ENTRY_POINT_OFFSET + 4]
        .try_into()
        .expect("slice is exactly 4 bytes");
    let entry_point = u32::from_le_bytes(entry_bytes);

    Some(ImageHeader { entry_point, set_uid_enabled, set_uid_blocking, set_uid_val })
}

/// Launches `image` as a child of `parent_id`.
///
/// When `blocking` is true, the parent is marked non-runnable and this
/// function does not return until the child exits, at which point it
/// returns the child's `sysret` code. When `blocking` is false, the child is
/// inserted into the round-robin rotation and this function returns `Ok(0)`
/// immediately; the eventual exit code is only observable by the parent if
/// it calls `execute` again in blocking mode for a rendezvous, which this
/// kernel (matching the original design) does not provide.
pub fn execute(
    parent_id: PcbId,
    name: &str,
    image: &[u8],
    blocking: bool,
    config: &KernelConfig,
) -> KernelResult<i32> {
    let parent_uid = PROCESS_TABLE
        .lock()
        .get(parent_id)
        .map(|p| p.uid)
        .ok_or(KernelError::NotFound)?;

    let child_id = PROCESS_TABLE
        .lock()
        .allocate(name, parent_uid, false, Some(parent_id))
        .ok_or(KernelError::NoFreeResource)?;

    if let Err(err) = launch_child(child_id, image, blocking, config) {
        PROCESS_TABLE.lock().free(child_id);
        return Err(err);
    }

    if !blocking {
        return Ok(0);
    }

    // Capture the parent's frame, mark it non-runnable, then splice into the
    // child. This call only returns once the child's `sysret` splices back
    // with exactly this stack pointer.
    let mut table = PROCESS_TABLE.lock();
    let child_ksp = table.get(child_id).map(|p| p.saved_ksp).ok_or(KernelError::NotFound)?;
    let child_stack_top = table.kernel_stack_top(child_id).ok_or(KernelError::NotFound)?;
    if let Some(parent) = table.get_mut(parent_id) {
        parent.blocking_execute = true;
    }
    drop(table);

    // The child is about to run in ring 3; its own traps must land on its
    // own kernel stack, not whichever stack last held that role.
    switch::set_kernel_rsp(VirtAddr::new(child_stack_top));

    *CURRENT.lock() = Some(child_id);
    {
        let mut table = PROCESS_TABLE.lock();
        let saved_ksp = table.get_mut(parent_id).map(|parent| core::ptr::addr_of_mut!(parent.saved_ksp));
        // The child is about to run in ring 3, and its very first `int 0x80`
        // (or an immediate `sysret`) will try to lock `PROCESS_TABLE` again;
        // that must not find this guard still held.
        drop(table);
        if let Some(saved_ksp) = saved_ksp {
            // SAFETY: `child_ksp` was just produced by `prepare_initial_stack`
            // for `child_id`, which nothing else resumes concurrently.
            // `saved_ksp` stays valid after `table` drops: the parent's `Box`
            // isn't freed while this function's caller is still suspended.
            unsafe {
                switch::switch_kernel_stack(saved_ksp, child_ksp);
            }
        }
    }

    // Resumed here once the child has spliced back. Always restore our own
    // page tables / CURRENT / reap the zombie child, regardless of how the
    // child exited, per the original `execute`'s "always restore caller"
    // guarantee.
    *CURRENT.lock() = Some(parent_id);
    PROCESS_TABLE.lock().free(child_id);

    let exit_code = PROCESS_TABLE
        .lock()
        .get(parent_id)
        .map_or(0, |p| p.last_child_exit);
    Ok(exit_code)
}

/// Distance from a process's huge page base to its user stack's initial top,
/// per the image layout convention (distinct from the 4 MiB huge page size:
/// the stack starts 2 MiB in, leaving the lower half for code and data).
const USER_STACK_OFFSET: u64 = 0x0020_0000;

fn launch_child(
    child_id: PcbId,
    image: &[u8],
    blocking: bool,
    config: &KernelConfig,
) -> KernelResult<()> {
    let header = decode_header(image).ok_or(KernelError::InvalidArgument)?;

    let slot = {
        let mut space = ADDRESS_SPACE.lock();
        let space = space.as_mut().ok_or(KernelError::NoFreeResource)?;
        let mut table = PROCESS_TABLE.lock();
        let pcb = table.get_mut(child_id).ok_or(KernelError::NotFound)?;

        space.alloc_huge_page(pcb.proc_slot, true, true)?;
        space.write_slot(pcb.proc_slot, image)?;
        space.seal_executable(pcb.proc_slot)?;

        pcb.set_uid_enabled = header.set_uid_enabled;
        pcb.set_uid_blocking = header.set_uid_blocking;
        pcb.set_uid_val = header.set_uid_val;

        // A set-uid image overrides both the child's uid and the caller's
        // requested blocking mode with the values baked into its header.
        let blocking = if config.set_uid_images_enabled && header.set_uid_enabled {
            pcb.uid = header.set_uid_val;
            header.set_uid_blocking
        } else {
            blocking
        };
        pcb.nonblocking = !blocking;
        pcb.proc_slot
    };

    let entry_point = VirtAddr::new(u64::from(header.entry_point));
    let user_stack_top = VirtAddr::new(crate::mm::slot_virt_base(slot) + USER_STACK_OFFSET);
    let kernel_stack_top = PROCESS_TABLE
        .lock()
        .kernel_stack_top(child_id)
        .ok_or(KernelError::NotFound)?;

    // SAFETY: the image was just mapped user-accessible above and the
    // kernel stack belongs solely to `child_id`, which has not yet run.
    let initial_ksp =
        unsafe { switch::prepare_initial_stack(kernel_stack_top, entry_point, user_stack_top) };

    if let Some(pcb) = PROCESS_TABLE.lock().get_mut(child_id) {
        pcb.saved_ksp = initial_ksp;
    }

    Ok(())
}

/// Requests a second 4 MiB region for the current process. Idempotent: a
/// second call returns the same address as the first rather than granting a
/// new region, per the kernel's `mmap` contract.
pub fn mmap(pcb_id: PcbId) -> KernelResult<u64> {
    let existing_slot = PROCESS_TABLE.lock().get(pcb_id).and_then(|p| p.mmap_slot);
    if let Some(slot) = existing_slot {
        return Ok(crate::mm::slot_virt_base(slot));
    }

    let mut space = ADDRESS_SPACE.lock();
    let space = space.as_mut().ok_or(KernelError::NoFreeResource)?;
    let slot = space.alloc_any_huge_page(true, true)?;

    if let Some(pcb) = PROCESS_TABLE.lock().get_mut(pcb_id) {
        pcb.mmap_slot = Some(slot);
    }

    Ok(crate::mm::slot_virt_base(slot))
}

/// Terminates the currently running process with `exit_code`, destroys its
/// owned physical resources, and unwinds to whoever should run next.
///
/// Blocking children splice directly back into the parent's saved frame
/// (`leave_to_parent`-style), restoring the parent's runnability and
/// recording `exit_code` for it to observe. Non-blocking children instead
/// fall through to the scheduler, which resumes whatever PCB is next in the
/// round-robin rotation.
///
/// # Safety
/// Must only be called from the syscall dispatcher on behalf of the
/// currently running process, with interrupts in a state where a stack
/// switch is safe (matching the syscall entry's existing discipline).
pub unsafe fn sysret(exit_code: i32) -> ! {
    let current_id = CURRENT.lock().expect("sysret called with no running process");

    destroy_owned_resources(current_id);

    let (parent_id, nonblocking, parent_ksp) = {
        let table = PROCESS_TABLE.lock();
        let pcb = table.get(current_id).expect("current pcb must exist");
        (pcb.parent, pcb.nonblocking, pcb.parent_ksp)
    };

    if !nonblocking {
        if let Some(parent_id) = parent_id {
            let mut table = PROCESS_TABLE.lock();
            if let Some(parent) = table.get_mut(parent_id) {
                parent.last_child_exit = exit_code;
                parent.blocking_execute = false;
            }
            drop(table);

            // The child's own table slot (and kernel stack we are currently
            // executing on) is freed by the parent immediately after this
            // call returns control to it in `execute`.
            // SAFETY: `parent_ksp` was saved by `execute`'s call into
            // `switch_kernel_stack` for this exact child.
            unsafe {
                let mut discard: u64 = 0;
                switch::switch_kernel_stack(core::ptr::addr_of_mut!(discard), parent_ksp);
            }
            unreachable!("blocking sysret's stack is abandoned once control returns to the parent");
        }
    }

    // Non-blocking exit, or a blocking child with no live parent (should not
    // happen in practice, but is handled rather than left undefined): mark
    // the PCB a zombie so its stack is reclaimed only once something else is
    // definitely running, then fall into the scheduler.
    if let Some(pcb) = PROCESS_TABLE.lock().get_mut(current_id) {
        pcb.zombie = true;
        pcb.in_use = false;
    }
    *CURRENT.lock() = None;
    crate::proc::scheduler::schedule();
    unreachable!("schedule() never returns into a destroyed process");
}

fn destroy_owned_resources(id: PcbId) {
    let (proc_slot, mmap_slot) = {
        let table = PROCESS_TABLE.lock();
        let Some(pcb) = table.get(id) else {
            return;
        };
        (pcb.proc_slot, pcb.mmap_slot)
    };

    let mut space = ADDRESS_SPACE.lock();
    if let Some(space) = space.as_mut() {
        let _ = space.free_huge_page(proc_slot);
        if let Some(slot) = mmap_slot {
            let _ = space.free_huge_page(slot);
        }
    }
}

/// Invoked by the scheduler when it picks a PCB marked `should_die`: runs it
/// through the kill exit path instead of resuming it normally.
pub fn kill_current_in_place(id: PcbId) {
    *CURRENT.lock() = Some(id);
    // SAFETY: the scheduler only calls this for the PCB it is about to make
    // current, immediately before any resume would otherwise happen.
    unsafe {
        sysret(KernelError::Killed.to_syscall_code());
    }
}

#[cfg(test)]
mod tests {
    use super::decode_header;

    fn image_with(header_byte: u8, entry_point: u32) -> [u8; 28] {
        let mut image = [0u8; 28];
        image[0] = header_byte;
        image[1..4].copy_from_slice(b"ELF");
        image[24..28].copy_from_slice(&entry_point.to_le_bytes());
        image
    }

    #[test_case]
    fn ordinary_image_has_no_set_uid() {
        let image = image_with(0x7F, 0x1000);
        let header = decode_header(&image).expect("valid magic");
        assert!(!header.set_uid_enabled);
        assert_eq!(header.entry_point, 0x1000);
    }

    #[test_case]
    fn set_uid_header_byte_splits_blocking_flag_and_uid() {
        let blocking = image_with(0x87, 0x2000);
        let header = decode_header(&blocking).expect("valid magic");
        assert!(header.set_uid_enabled);
        assert!(header.set_uid_blocking);
        assert_eq!(header.set_uid_val, 7);

        let nonblocking = image_with(0x07, 0x2000);
        let header = decode_header(&nonblocking).expect("valid magic");
        assert!(header.set_uid_enabled);
        assert!(!header.set_uid_blocking);
        assert_eq!(header.set_uid_val, 7);
    }

    #[test_case]
    fn bad_magic_or_short_image_is_rejected() {
        let mut bad_magic = image_with(0x7F, 0x1000);
        bad_magic[2] = b'X';
        assert!(decode_header(&bad_magic).is_none());
        assert!(decode_header(&[]).is_none());
    }
}
