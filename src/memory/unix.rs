//! libc backend for Linux, macOS and other unix systems.
//!
//! Linux suppresses dumps per region with `madvise(MADV_DONTDUMP)`. The
//! other systems have no equivalent, so the allocator disables core dumps
//! for the whole process before the first region is handed out.

use std::ptr::{self, NonNull};

use once_cell::sync::Lazy;

use super::{PlatformMemory, Protection};
use crate::error::{Error, Result};

static PAGE_SIZE: Lazy<usize> = Lazy::new(|| {
    // SAFETY: sysconf has no memory-safety preconditions.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 {
        size as usize
    } else {
        4096
    }
});

pub(crate) static LIBC_MEMORY: LibcMemory = LibcMemory {
    per_region_no_dump: cfg!(any(target_os = "linux", target_os = "android")),
};

#[derive(Debug)]
pub(crate) struct LibcMemory {
    per_region_no_dump: bool,
}

fn check_zero(result: libc::c_int, operation: &'static str) -> Result<()> {
    if result != 0 {
        return Err(Error::last_os_error(operation));
    }
    Ok(())
}

impl PlatformMemory for LibcMemory {
    fn page_size(&self) -> usize {
        *PAGE_SIZE
    }

    fn mem_lock_limit(&self) -> Result<Option<u64>> {
        let mut limit = libc::rlimit {
            rlim_cur: 0,
            rlim_max: 0,
        };
        // SAFETY: `limit` is a valid, writable rlimit.
        check_zero(
            unsafe { libc::getrlimit(libc::RLIMIT_MEMLOCK, &mut limit) },
            "getrlimit(RLIMIT_MEMLOCK)",
        )?;
        if limit.rlim_max == libc::RLIM_INFINITY {
            return Ok(None);
        }
        Ok(Some(limit.rlim_max as u64))
    }

    fn disables_dumps_globally(&self) -> bool {
        !self.per_region_no_dump
    }

    fn disable_core_dumps(&self) -> Result<()> {
        let zero = libc::rlimit {
            rlim_cur: 0,
            rlim_max: 0,
        };
        // SAFETY: `zero` is a valid rlimit.
        check_zero(
            unsafe { libc::setrlimit(libc::RLIMIT_CORE, &zero) },
            "setrlimit(RLIMIT_CORE)",
        )
    }

    fn map(&self, len: usize) -> Result<NonNull<u8>> {
        // SAFETY: anonymous private mapping at a kernel-chosen address.
        // Some platforms require fd = -1 even with MAP_ANON.
        let addr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANON,
                -1,
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(Error::allocation("mmap"));
        }
        NonNull::new(addr as *mut u8).ok_or_else(|| Error::allocation("mmap"))
    }

    unsafe fn unmap(&self, ptr: NonNull<u8>, len: usize) -> Result<()> {
        check_zero(libc::munmap(ptr.as_ptr() as *mut libc::c_void, len), "munmap")
    }

    unsafe fn protect(&self, ptr: NonNull<u8>, len: usize, protection: Protection) -> Result<()> {
        let (prot, operation) = match protection {
            Protection::NoAccess => (libc::PROT_NONE, "mprotect(PROT_NONE)"),
            Protection::ReadOnly => (libc::PROT_READ, "mprotect(PROT_READ)"),
            Protection::ReadWrite => (
                libc::PROT_READ | libc::PROT_WRITE,
                "mprotect(PROT_READ | PROT_WRITE)",
            ),
        };
        check_zero(
            libc::mprotect(ptr.as_ptr() as *mut libc::c_void, len, prot),
            operation,
        )
    }

    unsafe fn lock(&self, ptr: NonNull<u8>, len: usize) -> Result<()> {
        check_zero(libc::mlock(ptr.as_ptr() as *const libc::c_void, len), "mlock")
    }

    unsafe fn unlock(&self, ptr: NonNull<u8>, len: usize) -> Result<()> {
        check_zero(libc::munlock(ptr.as_ptr() as *const libc::c_void, len), "munlock")
    }

    #[cfg(any(target_os = "linux", target_os = "android"))]
    unsafe fn set_no_dump(&self, ptr: NonNull<u8>, len: usize) -> Result<()> {
        check_zero(
            libc::madvise(ptr.as_ptr() as *mut libc::c_void, len, libc::MADV_DONTDUMP),
            "madvise(MADV_DONTDUMP)",
        )
    }

    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    unsafe fn set_no_dump(&self, _ptr: NonNull<u8>, _len: usize) -> Result<()> {
        Ok(())
    }
}
