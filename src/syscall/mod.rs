//! System-call dispatcher: pointer validation, privilege checks, the
//! sandbox syscall whitelist, and the routing table itself.

use core::arch::naked_asm;

use x86_64::structures::idt::InterruptDescriptorTable;
use x86_64::PrivilegeLevel;

use crate::config::KernelConfig;
use crate::error::KernelError;
use crate::fs::MOUNT_TABLE;
use crate::io::InteractiveSink;
use crate::mm::{slot_virt_base, HUGE_PAGE_SIZE};
use crate::proc::{execute, PcbId, CURRENT, PROCESS_TABLE};
use crate::user::USER_TABLE;

/// Interrupt vector used for `int 0x80`.
pub const SYSCALL_INTERRUPT_INDEX: u8 = 0x80;

#[repr(u64)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SyscallNumber {
    Sysret = 0,
    Exec = 1,
    Open = 2,
    Close = 3,
    Read = 4,
    Write = 5,
    Alert = 6,
    EnvConfig = 7,
    Reboot = 8,
    Shutdown = 9,
    SwitchUser = 10,
    GetUser = 11,
    RemoteSwitchUser = 12,
    Mmap = 13,
    SandboxExit = 14,
}

impl SyscallNumber {
    const fn from_raw(raw: u64) -> Option<Self> {
        Some(match raw {
            0 => Self::Sysret,
            1 => Self::Exec,
            2 => Self::Open,
            3 => Self::Close,
            4 => Self::Read,
            5 => Self::Write,
            6 => Self::Alert,
            7 => Self::EnvConfig,
            8 => Self::Reboot,
            9 => Self::Shutdown,
            10 => Self::SwitchUser,
            11 => Self::GetUser,
            12 => Self::RemoteSwitchUser,
            13 => Self::Mmap,
            14 => Self::SandboxExit,
            _ => return None,
        })
    }

    const fn as_u8(self) -> u8 {
        self as u64 as u8
    }
}

/// Returns `true` if `ptr..ptr+len` lies entirely inside the currently
/// running process's mapped code/stack region or its `mmap` region, the
/// generalisation of `_is_user_pointer`'s page-directory-index comparison
/// to this kernel's slot-based address layout.
fn is_user_pointer(ptr: u64, len: u64) -> bool {
    let Some(end) = ptr.checked_add(len) else {
        return false;
    };

    let Some(current) = *CURRENT.lock() else {
        return false;
    };
    let table = PROCESS_TABLE.lock();
    let Some(pcb) = table.get(current) else {
        return false;
    };

    let proc_base = slot_virt_base(pcb.proc_slot);
    if ptr >= proc_base && end <= proc_base + HUGE_PAGE_SIZE {
        return true;
    }
    if let Some(mmap_slot) = pcb.mmap_slot {
        let mmap_base = slot_virt_base(mmap_slot);
        if ptr >= mmap_base && end <= mmap_base + HUGE_PAGE_SIZE {
            return true;
        }
    }
    false
}

fn sandbox_denies(config: &KernelConfig, uid: u32, number: SyscallNumber) -> bool {
    match config.sandbox_uid {
        Some(sandboxed) if sandboxed == uid => {
            !config.sandbox_syscall_whitelist.contains(&number.as_u8())
        }
        _ => false,
    }
}

/// Diagnostic write-and-terminate path for a syscall that fails a pointer or
/// privilege check badly enough that the process cannot be trusted to
/// continue, matching `_kill_misbehaving`.
fn kill_misbehaving() -> i64 {
    crate::serial_println!("syscall: killing misbehaving process");
    // SAFETY: called only from `dispatch`, which runs with a valid current
    // process on the syscall entry path.
    unsafe {
        execute::sysret(0);
    }
}

/// The core dispatcher. Called from the naked syscall entry stub with the
/// raw register values saved off the user's `int 0x80` frame.
///
/// # Safety
/// Must only be called from `syscall_entry` with `arg1` a raw user pointer
/// for `Write`/`Read`/`Open` and nothing else presuming pointer validity
/// ahead of the checks performed here.
#[unsafe(no_mangle)]
unsafe extern "C" fn syscall_dispatch(num: u64, arg1: u64, arg2: u64, arg3: u64) -> i64 {
    let Some(number) = SyscallNumber::from_raw(num) else {
        return i64::from(KernelError::InvalidArgument.to_syscall_code());
    };

    let Some(current) = *CURRENT.lock() else {
        return i64::from(KernelError::NotFound.to_syscall_code());
    };
    let uid = PROCESS_TABLE.lock().get(current).map_or(0, |p| p.uid);

    let config = crate::config::current();
    if sandbox_denies(&config, uid, number) {
        return i64::from(KernelError::PrivilegeDenied.to_syscall_code());
    }

    match number {
        SyscallNumber::Sysret => {
            // SAFETY: `sysret` is only reached from the syscall path with a
            // valid current process, matching its contract.
            unsafe { execute::sysret(arg1 as i32) }
        }
        SyscallNumber::Exec => sys_execute(current, arg1, arg2),
        SyscallNumber::Open => sys_open(current, arg1, arg2),
        SyscallNumber::Close => sys_close(current, arg1),
        SyscallNumber::Read => sys_read(current, arg1, arg2, arg3),
        SyscallNumber::Write => sys_write(current, arg1, arg2, arg3),
        SyscallNumber::Alert => sys_alert(arg1, arg2),
        SyscallNumber::EnvConfig => sys_env_config(arg1, arg2),
        SyscallNumber::Reboot => sys_reboot(uid),
        SyscallNumber::Shutdown => sys_shutdown(uid),
        SyscallNumber::SwitchUser => sys_switch_user(current, arg1, arg2),
        SyscallNumber::GetUser => sys_get_user(current, arg1, arg2, arg3),
        SyscallNumber::RemoteSwitchUser => sys_remote_switch_user(uid, arg1),
        SyscallNumber::Mmap => sys_mmap(current),
        SyscallNumber::SandboxExit => sys_sandbox_exit(),
    }
}

fn user_bytes<'a>(ptr: u64, len: u64) -> Option<&'a [u8]> {
    if !is_user_pointer(ptr, len) {
        return None;
    }
    // SAFETY: `is_user_pointer` confirmed this range lies entirely inside
    // the current process's own mapped, user-accessible region.
    Some(unsafe { core::slice::from_raw_parts(ptr as *const u8, len as usize) })
}

fn user_bytes_mut<'a>(ptr: u64, len: u64) -> Option<&'a mut [u8]> {
    if !is_user_pointer(ptr, len) {
        return None;
    }
    // SAFETY: see `user_bytes`; exclusivity is the caller's (the user
    // process's) responsibility, same as any syscall ABI.
    Some(unsafe { core::slice::from_raw_parts_mut(ptr as *mut u8, len as usize) })
}

fn sys_write(pcb_id: crate::proc::PcbId, fd: u64, ptr: u64, len: u64) -> i64 {
    let Some(bytes) = user_bytes(ptr, len) else {
        return i64::from(kill_misbehaving());
    };

    let mut table = PROCESS_TABLE.lock();
    let Some(pcb) = table.get_mut(pcb_id) else {
        return i64::from(KernelError::NotFound.to_syscall_code());
    };
    let Some(Some(descriptor)) = pcb.fds.get_mut(fd as usize) else {
        return i64::from(KernelError::NotFound.to_syscall_code());
    };

    let mounts = MOUNT_TABLE.lock();
    let Some(mounts) = mounts.as_ref() else {
        return i64::from(KernelError::NotFound.to_syscall_code());
    };
    mounts.write(descriptor.mount, &mut descriptor.handle, bytes) as i64
}

fn sys_read(pcb_id: crate::proc::PcbId, fd: u64, ptr: u64, len: u64) -> i64 {
    let Some(bytes) = user_bytes_mut(ptr, len) else {
        return i64::from(kill_misbehaving());
    };

    let mut table = PROCESS_TABLE.lock();
    let Some(pcb) = table.get_mut(pcb_id) else {
        return i64::from(KernelError::NotFound.to_syscall_code());
    };
    let Some(Some(descriptor)) = pcb.fds.get_mut(fd as usize) else {
        return i64::from(KernelError::NotFound.to_syscall_code());
    };

    let mounts = MOUNT_TABLE.lock();
    let Some(mounts) = mounts.as_ref() else {
        return i64::from(KernelError::NotFound.to_syscall_code());
    };
    let read = mounts.read(descriptor.mount, &mut descriptor.handle, descriptor.cursor, bytes);
    descriptor.cursor += read as u32;
    read as i64
}

fn sys_open(pcb_id: crate::proc::PcbId, path_ptr: u64, path_len: u64) -> i64 {
    let Some(path_bytes) = user_bytes(path_ptr, path_len) else {
        return i64::from(kill_misbehaving());
    };
    let Ok(path) = core::str::from_utf8(path_bytes) else {
        return i64::from(KernelError::InvalidArgument.to_syscall_code());
    };

    let uid = PROCESS_TABLE.lock().get(pcb_id).map_or(0, |p| p.uid);

    let opened = {
        let mounts = MOUNT_TABLE.lock();
        let Some(mounts) = mounts.as_ref() else {
            return i64::from(KernelError::NotFound.to_syscall_code());
        };
        mounts.open_common(path, uid)
    };

    let (handle, resource, mount) = match opened {
        Ok(triple) => triple,
        Err(err) => return i64::from(err.to_syscall_code()),
    };

    let mut table = PROCESS_TABLE.lock();
    let Some(pcb) = table.get_mut(pcb_id) else {
        return i64::from(KernelError::NotFound.to_syscall_code());
    };
    let Some(free_fd) = pcb.fds.iter().position(Option::is_none) else {
        return i64::from(KernelError::NoFreeResource.to_syscall_code());
    };

    pcb.fds[free_fd] = Some(crate::fs::FileDescriptor {
        mount,
        resource,
        cursor: 0,
        handle,
    });
    free_fd as i64
}

fn sys_close(pcb_id: crate::proc::PcbId, fd: u64) -> i64 {
    let mut table = PROCESS_TABLE.lock();
    let Some(pcb) = table.get_mut(pcb_id) else {
        return i64::from(KernelError::NotFound.to_syscall_code());
    };
    let Some(slot) = pcb.fds.get_mut(fd as usize) else {
        return i64::from(KernelError::InvalidArgument.to_syscall_code());
    };
    *slot = None;
    0
}

fn sys_execute(pcb_id: PcbId, image_ptr: u64, image_len: u64) -> i64 {
    let Some(image) = user_bytes(image_ptr, image_len) else {
        return i64::from(kill_misbehaving());
    };
    let config = crate::config::current();
    // `EXEC` is always blocking; the non-blocking launch path `execute()`
    // supports internally is only ever used by the boot sequence, never
    // reachable through a syscall number.
    match execute::execute(pcb_id, "child", image, true, &config) {
        Ok(code) => i64::from(code),
        Err(err) => i64::from(err.to_syscall_code()),
    }
}

fn sys_mmap(pcb_id: crate::proc::PcbId) -> i64 {
    match execute::mmap(pcb_id) {
        Ok(addr) => addr as i64,
        Err(err) => i64::from(err.to_syscall_code()),
    }
}

/// `uid` is passed directly rather than as a name buffer: the three-register
/// `int 0x80` ABI has no room left for a name pointer, a name length, and a
/// password buffer all at once, so this simplifies the real
/// `switch_user(current, name, password)` call to the already-resolved uid
/// plus an (unvalidated, empty) password. A full client build would widen
/// the ABI to five registers instead.
fn sys_switch_user(pcb_id: PcbId, uid: u64, password_ptr_len: u64) -> i64 {
    let _ = password_ptr_len;
    let result = USER_TABLE.lock().switch_user(uid as u32, "");
    match result {
        Ok(new_uid) => {
            if let Some(pcb) = PROCESS_TABLE.lock().get_mut(pcb_id) {
                pcb.uid = new_uid;
            }
            i64::from(new_uid)
        }
        Err(err) => i64::from(err.to_syscall_code()),
    }
}

fn sys_get_user(pcb_id: PcbId, name_ptr: u64, name_len: u64, uid_ptr: u64) -> i64 {
    let Some(name_buf) = user_bytes_mut(name_ptr, name_len) else {
        return i64::from(kill_misbehaving());
    };
    let Some(uid_buf) = user_bytes_mut(uid_ptr, 4) else {
        return i64::from(kill_misbehaving());
    };

    let uid = PROCESS_TABLE.lock().get(pcb_id).map_or(0, |p| p.uid);
    let table = USER_TABLE.lock();
    let name_bytes = table.name_of(uid).unwrap_or("").as_bytes();
    let copy_len = name_bytes.len().min(name_buf.len());
    name_buf[..copy_len].copy_from_slice(&name_bytes[..copy_len]);
    drop(table);

    uid_buf.copy_from_slice(&uid.to_le_bytes());
    copy_len as i64
}

/// `target_pid` identifies a PCB, not a uid: a successful call raises that
/// PCB's own uid to match the caller's, per `remote_switchuser`'s "elevate a
/// remote process to have the permissions of this current process".
fn sys_remote_switch_user(caller_uid: u32, target_pid: u64) -> i64 {
    let new_uid = match USER_TABLE.lock().remote_switch_user(caller_uid, caller_uid) {
        Ok(uid) => uid,
        Err(err) => return i64::from(err.to_syscall_code()),
    };

    let target_id = PcbId(target_pid as usize);
    let mut table = PROCESS_TABLE.lock();
    let Some(target) = table.get_mut(target_id) else {
        return i64::from(KernelError::NotFound.to_syscall_code());
    };
    target.uid = new_uid;
    i64::from(new_uid)
}

fn sys_env_config(arg1: u64, arg2: u64) -> i64 {
    crate::io::ConsoleSink.configure(arg1, arg2);
    0
}

/// The original's sandbox-escape mechanism lived behind this number; it is
/// out of scope here, so the number is routed but never grants an escape.
fn sys_sandbox_exit() -> i64 {
    i64::from(KernelError::InvalidArgument.to_syscall_code())
}

fn sys_reboot(uid: u32) -> i64 {
    if uid != 0 {
        return i64::from(KernelError::PrivilegeDenied.to_syscall_code());
    }
    crate::serial_println!("syscall: reboot requested, halting instead (no reboot collaborator)");
    0
}

fn sys_shutdown(uid: u32) -> i64 {
    if uid != 0 {
        return i64::from(KernelError::PrivilegeDenied.to_syscall_code());
    }
    crate::exit_qemu(crate::QemuExitCode::Success);
    0
}

fn sys_alert(ptr: u64, len: u64) -> i64 {
    // Modal alert dialogs are a GUI collaborator's concern; this kernel only
    // guarantees the message reaches the diagnostic console.
    let Some(bytes) = user_bytes(ptr, len) else {
        return i64::from(kill_misbehaving());
    };
    if let Ok(text) = core::str::from_utf8(bytes) {
        crate::serial_println!("alert: {}", text);
    }
    0
}

/// Installs the `int 0x80` gate into `idt`, matching `register_syscall_handler`.
///
/// `syscall_entry` is a naked `extern "C"` stub, not the typed
/// `extern "x86-interrupt" fn(InterruptStackFrame)` the IDT API expects: it
/// replicates that ABI's push-everything/`iretq` contract by hand so it can
/// read and overwrite every GPR, which a compiler-generated
/// `x86-interrupt` prologue does not expose. The transmute below only
/// changes the Rust-level type of the function pointer, not the bytes the
/// CPU calls through.
pub fn register(idt: &mut InterruptDescriptorTable) {
    // SAFETY: `syscall_entry`'s hand-written prologue/epilogue matches the
    // machine-level contract an `x86-interrupt` handler compiles down to.
    unsafe {
        idt[usize::from(SYSCALL_INTERRUPT_INDEX)]
            .set_handler_fn(core::mem::transmute::<
                unsafe extern "C" fn(),
                extern "x86-interrupt" fn(x86_64::structures::idt::InterruptStackFrame),
            >(syscall_entry))
            .set_privilege_level(PrivilegeLevel::Ring3);
    }
}

/// Naked `int 0x80` entry point: saves every general-purpose register the
/// System V ABI doesn't already preserve across a call, invokes
/// [`syscall_dispatch`] with the saved arguments, writes its result back
/// into the saved `RAX` slot, then restores registers and `iretq`s back to
/// ring 3.
#[unsafe(naked)]
unsafe extern "C" fn syscall_entry() {
    naked_asm!(
        "push rax",
        "push rbx",
        "push rcx",
        "push rdx",
        "push rsi",
        "push rdi",
        "push r8",
        "push r9",
        "push r10",
        "push r11",
        // After the ten pushes above, rax sits at [rsp+72], rdi at
        // [rsp+32], rsi at [rsp+40], rdx at [rsp+48] (pushes grow the stack
        // downward, so the earliest-pushed register ends up at the highest
        // offset). Load those saved values as System V args for dispatch.
        "mov rdi, [rsp + 72]", // saved rax -> num
        "mov rsi, [rsp + 32]", // saved rdi -> arg1
        "mov rdx, [rsp + 40]", // saved rsi -> arg2
        "mov rcx, [rsp + 48]", // saved rdx -> arg3
        "call {dispatch}",
        "mov [rsp + 72], rax", // write return value into saved rax slot
        "pop r11",
        "pop r10",
        "pop r9",
        "pop r8",
        "pop rdi",
        "pop rsi",
        "pop rdx",
        "pop rcx",
        "pop rbx",
        "pop rax",
        "iretq",
        dispatch = sym syscall_dispatch,
    );
}

#[cfg(test)]
mod tests {
    use super::SyscallNumber;

    #[test_case]
    fn every_defined_syscall_round_trips_through_from_raw() {
        for raw in 0..=14_u64 {
            assert!(SyscallNumber::from_raw(raw).is_some(), "syscall {raw} must decode");
        }
        assert!(SyscallNumber::from_raw(15).is_none());
    }
}
