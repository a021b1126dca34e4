//! OS-backed protected memory.
//!
//! This module is the only place in the crate that talks to the operating
//! system's memory APIs. Everything above it (secrets, keys, the cache) sees
//! a `SecureRegion` and the three allocator operations: `alloc`, `protect`
//! and `free`.
//!
//! Guarantees for every region:
//! - **Not swapped**: pages are locked (mlock / VirtualLock).
//! - **Not dumped**: per-region `MADV_DONTDUMP` on Linux; process-wide
//!   `RLIMIT_CORE = 0` on macOS and other unix systems, applied once.
//! - **Wiped**: zeroed with a volatile wipe before the pages are released.
//!
//! Windows cannot exclude a region from a crash dump the same way. Its
//! backend instead keeps the region encrypted with `CryptProtectMemory`
//! whenever it is in the `NoAccess` state.

mod allocator;
#[cfg(unix)]
mod unix;
#[cfg(windows)]
mod windows;

use std::fmt;
use std::ptr::NonNull;

use zeroize::Zeroize;

use crate::error::Result;

pub use allocator::{CoreDumps, ProtectedMemoryAllocator, RegionLayout, SecureRegion};

/// Access state of a protected region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protection {
    /// Any access faults. Region content must not be interpreted.
    NoAccess,
    ReadOnly,
    ReadWrite,
}

/// Native memory calls for one operating system.
///
/// Exactly one implementation is compiled in and chosen by [`platform`].
/// Call sites never branch on the OS themselves.
///
/// All pointer-taking methods are unsafe: `ptr..ptr + len` must be a
/// page-aligned range previously returned by `map` on the same backend.
pub(crate) trait PlatformMemory: Send + Sync + fmt::Debug {
    /// Allocation granularity in bytes.
    fn page_size(&self) -> usize;

    /// Maximum lockable bytes for this process, `None` if unlimited.
    fn mem_lock_limit(&self) -> Result<Option<u64>>;

    /// True when the platform cannot suppress dumps per region and needs
    /// core dumps disabled for the whole process instead.
    fn disables_dumps_globally(&self) -> bool;

    /// Disable core dumps for the whole process.
    fn disable_core_dumps(&self) -> Result<()>;

    /// Map `len` bytes of private, zeroed, read-write memory.
    fn map(&self, len: usize) -> Result<NonNull<u8>>;

    unsafe fn unmap(&self, ptr: NonNull<u8>, len: usize) -> Result<()>;

    unsafe fn protect(&self, ptr: NonNull<u8>, len: usize, protection: Protection) -> Result<()>;

    unsafe fn lock(&self, ptr: NonNull<u8>, len: usize) -> Result<()>;

    unsafe fn unlock(&self, ptr: NonNull<u8>, len: usize) -> Result<()>;

    /// Keep the range out of core dumps. A no-op where dumps are handled
    /// process-wide.
    unsafe fn set_no_dump(&self, ptr: NonNull<u8>, len: usize) -> Result<()>;

    /// True when region contents are encrypted in place while `NoAccess`.
    fn seals_at_rest(&self) -> bool {
        false
    }

    /// Encrypt the range in place. The range must be writable.
    unsafe fn seal(&self, _ptr: NonNull<u8>, _len: usize) -> Result<()> {
        Ok(())
    }

    /// Decrypt a range sealed by `seal`. The range must be writable.
    unsafe fn unseal(&self, _ptr: NonNull<u8>, _len: usize) -> Result<()> {
        Ok(())
    }
}

/// The backend for the current operating system.
pub(crate) fn platform() -> &'static dyn PlatformMemory {
    #[cfg(unix)]
    {
        &unix::LIBC_MEMORY
    }
    #[cfg(windows)]
    {
        &windows::WINDOWS_MEMORY
    }
}

/// Round `len` up to a multiple of `page`. Zero rounds up to one page.
pub(crate) fn round_to_pages(len: usize, page: usize) -> usize {
    let len = len.max(1);
    len.div_ceil(page) * page
}

/// Zero a buffer in a way the optimizer cannot remove.
pub(crate) fn wipe(bytes: &mut [u8]) {
    bytes.zeroize();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_to_pages() {
        assert_eq!(round_to_pages(0, 4096), 4096);
        assert_eq!(round_to_pages(1, 4096), 4096);
        assert_eq!(round_to_pages(4096, 4096), 4096);
        assert_eq!(round_to_pages(4097, 4096), 8192);
    }

    #[test]
    fn test_platform_page_size_is_power_of_two() {
        let page = platform().page_size();
        assert!(page >= 4096);
        assert!(page.is_power_of_two());
    }

    #[test]
    fn test_wipe_zeroes_buffer() {
        let mut buf = vec![0xAAu8; 64];
        wipe(&mut buf);
        assert!(buf.iter().all(|&b| b == 0));
    }
}
