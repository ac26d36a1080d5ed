//! Boot-time kernel configuration.
//!
//! Two policies that the original implementation hardcoded behind
//! `#ifdef`-style compile switches are expressed here as plain data so the
//! kernel can be instantiated with different policies under test.

/// Policy knobs resolved once at boot and threaded through the modules that
/// need them.
#[derive(Debug, Clone, Copy)]
pub struct KernelConfig {
    /// UID, if any, whose `mmap` region is preserved across a context switch
    /// instead of being unmapped when absent. `None` disables the exception
    /// entirely: every process's `mmap` region is unmapped/remapped exactly
    /// like its code region.
    pub sandboxed_mmap_uid: Option<u32>,
    /// Whether a loaded ELF image's set-uid header byte is honoured. When
    /// `false`, every process inherits its parent's UID regardless of what
    /// the image requests.
    pub set_uid_images_enabled: bool,
    /// UID, if any, restricted to a fixed syscall whitelist. `None` disables
    /// sandboxing entirely: no UID is overlaid with a whitelist.
    pub sandbox_uid: Option<u32>,
    /// The syscall numbers a sandboxed UID may still invoke; ignored unless
    /// `sandbox_uid` is set.
    pub sandbox_syscall_whitelist: &'static [u8],
}

impl KernelConfig {
    /// The configuration this kernel boots with in the absence of any
    /// override: no sandboxed UID, set-uid images honoured, no whitelist.
    #[must_use]
    pub const fn standard() -> Self {
        Self {
            sandboxed_mmap_uid: None,
            set_uid_images_enabled: true,
            sandbox_uid: None,
            sandbox_syscall_whitelist: &[],
        }
    }
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self::standard()
    }
}

/// The policy this boot is running under. Read by the syscall dispatcher and
/// `execute` on every call rather than threaded as a parameter everywhere,
/// since it is fixed for the kernel's entire lifetime once installed.
static KERNEL_CONFIG: spin::Mutex<KernelConfig> = spin::Mutex::new(KernelConfig::standard());

/// Installs the boot-time configuration, replacing the standard default.
pub fn init(config: KernelConfig) {
    *KERNEL_CONFIG.lock() = config;
}

/// Returns the currently installed configuration.
#[must_use]
pub fn current() -> KernelConfig {
    *KERNEL_CONFIG.lock()
}
