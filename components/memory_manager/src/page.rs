//! Platform page mapping and protection.
//!
//! Protection-flag sets are injected as configuration (`ProtectionProfile`)
//! rather than branched on at every call site, and all mapping and
//! protection changes go through the `PageBackend` capability with one
//! backend per platform.

use crate::allocator::AllocError;

// POSIX protection bits (PROT_READ / PROT_WRITE / PROT_EXEC).
const POSIX_READ: u32 = 0x1;
const POSIX_WRITE: u32 = 0x2;
const POSIX_EXEC: u32 = 0x4;

// Windows page-protection constants (PAGE_READWRITE / PAGE_EXECUTE_READWRITE).
const WIN_PAGE_READWRITE: u32 = 0x04;
const WIN_PAGE_EXECUTE_READWRITE: u32 = 0x40;

/// The pair of protection-flag sets a platform uses for data and for
/// executable pages.
///
/// The allocator is configured with one profile at construction; the page
/// backend interprets the raw flag values for its platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtectionProfile {
    /// Flags for readable/writable data pages
    pub data: u32,
    /// Flags for readable/writable/executable pages
    pub exec: u32,
}

impl ProtectionProfile {
    /// POSIX-style rwx bit profile (mmap/mprotect).
    pub fn posix() -> Self {
        Self {
            data: POSIX_READ | POSIX_WRITE,
            exec: POSIX_READ | POSIX_WRITE | POSIX_EXEC,
        }
    }

    /// Windows page-protection constant profile (VirtualAlloc/VirtualProtect).
    pub fn windows() -> Self {
        Self {
            data: WIN_PAGE_READWRITE,
            exec: WIN_PAGE_EXECUTE_READWRITE,
        }
    }

    /// The profile matching the compilation target.
    pub fn host() -> Self {
        if cfg!(windows) {
            Self::windows()
        } else {
            Self::posix()
        }
    }

    /// Flags for the requested executability.
    pub fn flags_for(&self, executable: bool) -> u32 {
        if executable {
            self.exec
        } else {
            self.data
        }
    }
}

/// Page mapping and protection capability.
///
/// One implementation exists per platform; the allocator never issues a
/// platform call directly.
pub trait PageBackend {
    /// Size of an OS page in bytes.
    fn page_size(&self) -> usize;

    /// Map a new anonymous region of `size` bytes with the given flags.
    /// `size` must already be page-aligned.
    fn map(&self, size: usize, flags: u32) -> Result<usize, AllocError>;

    /// Unmap a region previously returned by `map`.
    fn unmap(&self, address: usize, size: usize) -> Result<(), AllocError>;

    /// Change the protection of a mapped region.
    fn protect(&self, address: usize, size: usize, flags: u32) -> Result<(), AllocError>;
}

/// The page backend for the compilation target.
#[derive(Debug, Clone, Copy, Default)]
pub struct HostPages;

#[cfg(unix)]
impl PageBackend for HostPages {
    fn page_size(&self) -> usize {
        // SAFETY: sysconf is always safe to call
        unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
    }

    fn map(&self, size: usize, flags: u32) -> Result<usize, AllocError> {
        // SAFETY: anonymous private mapping with no fixed address; the
        // kernel chooses the placement and we own the region on success
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                flags as i32,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(AllocError::Map(std::io::Error::last_os_error().to_string()));
        }
        Ok(ptr as usize)
    }

    fn unmap(&self, address: usize, size: usize) -> Result<(), AllocError> {
        // SAFETY: address/size describe a region we mapped and have not
        // unmapped since
        let rc = unsafe { libc::munmap(address as *mut libc::c_void, size) };
        if rc != 0 {
            return Err(AllocError::Map(std::io::Error::last_os_error().to_string()));
        }
        Ok(())
    }

    fn protect(&self, address: usize, size: usize, flags: u32) -> Result<(), AllocError> {
        // SAFETY: address/size describe a live mapping owned by the allocator
        let rc = unsafe { libc::mprotect(address as *mut libc::c_void, size, flags as i32) };
        if rc != 0 {
            return Err(AllocError::Protect(
                std::io::Error::last_os_error().to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(windows)]
impl PageBackend for HostPages {
    fn page_size(&self) -> usize {
        // Windows pages are 4 KiB on every architecture this core targets
        4096
    }

    fn map(&self, size: usize, flags: u32) -> Result<usize, AllocError> {
        use windows_sys::Win32::System::Memory::{VirtualAlloc, MEM_COMMIT, MEM_RESERVE};

        // SAFETY: reserving and committing fresh pages; no existing
        // allocation is touched
        let ptr = unsafe {
            VirtualAlloc(std::ptr::null_mut(), size, MEM_COMMIT | MEM_RESERVE, flags)
        };
        if ptr.is_null() {
            return Err(AllocError::Map(std::io::Error::last_os_error().to_string()));
        }
        Ok(ptr as usize)
    }

    fn unmap(&self, address: usize, _size: usize) -> Result<(), AllocError> {
        use windows_sys::Win32::System::Memory::{VirtualFree, MEM_RELEASE};

        // SAFETY: releasing a region VirtualAlloc returned; size must be 0
        // with MEM_RELEASE
        let rc = unsafe { VirtualFree(address as *mut core::ffi::c_void, 0, MEM_RELEASE) };
        if rc == 0 {
            return Err(AllocError::Map(std::io::Error::last_os_error().to_string()));
        }
        Ok(())
    }

    fn protect(&self, address: usize, size: usize, flags: u32) -> Result<(), AllocError> {
        use windows_sys::Win32::System::Memory::VirtualProtect;

        let mut old = 0u32;
        // SAFETY: address/size describe a live mapping owned by the allocator
        let rc = unsafe {
            VirtualProtect(address as *mut core::ffi::c_void, size, flags, &mut old)
        };
        if rc == 0 {
            return Err(AllocError::Protect(
                std::io::Error::last_os_error().to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(not(any(unix, windows)))]
impl PageBackend for HostPages {
    fn page_size(&self) -> usize {
        4096
    }

    fn map(&self, _size: usize, _flags: u32) -> Result<usize, AllocError> {
        Err(AllocError::Map("unsupported platform".to_string()))
    }

    fn unmap(&self, _address: usize, _size: usize) -> Result<(), AllocError> {
        Err(AllocError::Map("unsupported platform".to_string()))
    }

    fn protect(&self, _address: usize, _size: usize, _flags: u32) -> Result<(), AllocError> {
        Err(AllocError::Protect("unsupported platform".to_string()))
    }
}
