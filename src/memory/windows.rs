//! Windows backend.
//!
//! Pages are reserved and committed with `VirtualAlloc` and locked with
//! `VirtualLock`. Windows offers no per-region crash-dump exclusion, so
//! regions are encrypted in place with `CryptProtectMemory` whenever they
//! are set to `NoAccess`. This is a different guarantee from the unix
//! backends: a dump may contain the region, but only as ciphertext bound to
//! this process.

use std::ffi::c_void;
use std::mem::MaybeUninit;
use std::ptr::NonNull;

use once_cell::sync::Lazy;
use windows_sys::Win32::Security::Cryptography::{
    CryptProtectMemory, CryptUnprotectMemory, CRYPTPROTECTMEMORY_SAME_PROCESS,
};
use windows_sys::Win32::System::Memory::{
    VirtualAlloc, VirtualFree, VirtualLock, VirtualProtect, VirtualUnlock, MEM_COMMIT,
    MEM_RELEASE, MEM_RESERVE, PAGE_NOACCESS, PAGE_READONLY, PAGE_READWRITE,
};
use windows_sys::Win32::System::SystemInformation::{GetSystemInfo, SYSTEM_INFO};

use super::{PlatformMemory, Protection};
use crate::error::{Error, Result};

static PAGE_SIZE: Lazy<usize> = Lazy::new(|| {
    let mut info = MaybeUninit::<SYSTEM_INFO>::zeroed();
    // SAFETY: GetSystemInfo fills the whole struct.
    let info = unsafe {
        GetSystemInfo(info.as_mut_ptr());
        info.assume_init()
    };
    info.dwPageSize as usize
});

pub(crate) static WINDOWS_MEMORY: WindowsMemory = WindowsMemory;

#[derive(Debug)]
pub(crate) struct WindowsMemory;

fn check_bool(result: i32, operation: &'static str) -> Result<()> {
    if result == 0 {
        return Err(Error::last_os_error(operation));
    }
    Ok(())
}

impl PlatformMemory for WindowsMemory {
    fn page_size(&self) -> usize {
        *PAGE_SIZE
    }

    fn mem_lock_limit(&self) -> Result<Option<u64>> {
        // Bounded by the working set; VirtualLock reports the failure.
        Ok(None)
    }

    fn disables_dumps_globally(&self) -> bool {
        false
    }

    fn disable_core_dumps(&self) -> Result<()> {
        Ok(())
    }

    fn map(&self, len: usize) -> Result<NonNull<u8>> {
        // SAFETY: fresh reservation at a system-chosen address.
        let addr = unsafe {
            VirtualAlloc(
                std::ptr::null(),
                len,
                MEM_COMMIT | MEM_RESERVE,
                PAGE_READWRITE,
            )
        };
        NonNull::new(addr as *mut u8).ok_or_else(|| Error::allocation("VirtualAlloc"))
    }

    unsafe fn unmap(&self, ptr: NonNull<u8>, _len: usize) -> Result<()> {
        check_bool(
            VirtualFree(ptr.as_ptr() as *mut c_void, 0, MEM_RELEASE),
            "VirtualFree",
        )
    }

    unsafe fn protect(&self, ptr: NonNull<u8>, len: usize, protection: Protection) -> Result<()> {
        let (flag, operation) = match protection {
            Protection::NoAccess => (PAGE_NOACCESS, "VirtualProtect(PAGE_NOACCESS)"),
            Protection::ReadOnly => (PAGE_READONLY, "VirtualProtect(PAGE_READONLY)"),
            Protection::ReadWrite => (PAGE_READWRITE, "VirtualProtect(PAGE_READWRITE)"),
        };
        let mut old = 0;
        check_bool(
            VirtualProtect(ptr.as_ptr() as *const c_void, len, flag, &mut old),
            operation,
        )
    }

    unsafe fn lock(&self, ptr: NonNull<u8>, len: usize) -> Result<()> {
        check_bool(VirtualLock(ptr.as_ptr() as *const c_void, len), "VirtualLock")
    }

    unsafe fn unlock(&self, ptr: NonNull<u8>, len: usize) -> Result<()> {
        check_bool(VirtualUnlock(ptr.as_ptr() as *const c_void, len), "VirtualUnlock")
    }

    unsafe fn set_no_dump(&self, _ptr: NonNull<u8>, _len: usize) -> Result<()> {
        Ok(())
    }

    fn seals_at_rest(&self) -> bool {
        true
    }

    // Region lengths are page multiples, which satisfies the
    // CRYPTPROTECTMEMORY_BLOCK_SIZE requirement.
    unsafe fn seal(&self, ptr: NonNull<u8>, len: usize) -> Result<()> {
        let len = u32::try_from(len).map_err(|_| Error::OperationFailed {
            operation: "CryptProtectMemory",
            code: 0,
        })?;
        check_bool(
            CryptProtectMemory(ptr.as_ptr() as *mut c_void, len, CRYPTPROTECTMEMORY_SAME_PROCESS),
            "CryptProtectMemory",
        )
    }

    unsafe fn unseal(&self, ptr: NonNull<u8>, len: usize) -> Result<()> {
        let len = u32::try_from(len).map_err(|_| Error::OperationFailed {
            operation: "CryptUnprotectMemory",
            code: 0,
        })?;
        check_bool(
            CryptUnprotectMemory(ptr.as_ptr() as *mut c_void, len, CRYPTPROTECTMEMORY_SAME_PROCESS),
            "CryptUnprotectMemory",
        )
    }
}
