//! Region allocation, protection and release.
//!
//! ## Layouts
//!
//! ```text
//! Standard:  [ data .......... | slack ]                   (page multiple)
//! Guarded:   [ guard | canary .. | data ] [ guard ]        (+2 pages)
//! ```
//!
//! In the guarded layout the data is right-aligned against the trailing
//! guard page so that an overflow faults immediately, and the slack in front
//! of it holds a process-wide random canary that is verified on release.

use std::ptr::NonNull;
use std::slice;

use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use ring::rand::{SecureRandom, SystemRandom};
use tracing::{debug, error, warn};

use super::{platform, round_to_pages, wipe, PlatformMemory, Protection};
use crate::error::{Error, Result};

/// How a region is laid out in its mapping. Chosen once per factory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RegionLayout {
    /// Page-rounded locked mapping.
    #[default]
    Standard,
    /// Guard pages on both sides plus a canary. Two extra pages per region.
    Guarded,
}

// ---------------------------------------------------------------------------
// Process-wide core dump state
// ---------------------------------------------------------------------------

/// Whether core dumps have been disabled for this process.
///
/// Platforms without per-region dump suppression disable dumps for the
/// whole process. That happens at most once, through
/// [`CoreDumps::ensure_disabled`], when the first allocator is built.
#[derive(Debug, Default)]
pub struct CoreDumps {
    disabled: OnceCell<()>,
}

static PROCESS_CORE_DUMPS: CoreDumps = CoreDumps::new();

impl CoreDumps {
    pub const fn new() -> Self {
        Self {
            disabled: OnceCell::new(),
        }
    }

    /// The state shared by every allocator in this process.
    pub fn process() -> &'static CoreDumps {
        &PROCESS_CORE_DUMPS
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled.get().is_some()
    }

    pub(crate) fn ensure_disabled(&self, platform: &dyn PlatformMemory) -> Result<()> {
        if self.is_disabled() {
            debug!("core dumps already disabled for this process");
            return Ok(());
        }
        self.disabled.get_or_try_init(|| {
            platform.disable_core_dumps()?;
            warn!("core dumps disabled process-wide; platform lacks per-region dump suppression");
            Ok::<_, Error>(())
        })?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Canary
// ---------------------------------------------------------------------------

static CANARY: OnceCell<Vec<u8>> = OnceCell::new();

fn canary(len: usize) -> Result<&'static [u8]> {
    let bytes = CANARY.get_or_try_init(|| {
        let mut bytes = vec![0u8; len];
        SystemRandom::new()
            .fill(&mut bytes)
            .map_err(|_| Error::RandomnessFailure)?;
        Ok::<_, Error>(bytes)
    })?;
    Ok(&bytes[..len.min(bytes.len())])
}

// ---------------------------------------------------------------------------
// Region
// ---------------------------------------------------------------------------

/// One OS-backed allocation holding a secret.
///
/// Content is only meaningful while the protection is not `NoAccess`.
/// Dropping a region that was never freed still wipes and releases it.
pub struct SecureRegion {
    platform: &'static dyn PlatformMemory,
    base: NonNull<u8>,
    mapped_len: usize,
    inner_offset: usize,
    inner_len: usize,
    data_offset: usize,
    len: usize,
    layout: RegionLayout,
    state: Mutex<Protection>,
    locked: bool,
    released: bool,
}

// SAFETY: the region exclusively owns its mapping. Protection changes are
// serialized by `state`, and byte access goes through unsafe accessors whose
// callers (the `Secret` access guards) provide the required exclusion.
unsafe impl Send for SecureRegion {}
unsafe impl Sync for SecureRegion {}

impl std::fmt::Debug for SecureRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecureRegion")
            .field("base", &self.base)
            .field("len", &self.len)
            .field("mapped_len", &self.mapped_len)
            .field("layout", &self.layout)
            .field("protection", &*self.state.lock())
            .finish()
    }
}

impl SecureRegion {
    /// Number of usable bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Total bytes mapped, guard pages included.
    pub fn mapped_len(&self) -> usize {
        self.mapped_len
    }

    pub fn layout(&self) -> RegionLayout {
        self.layout
    }

    pub fn protection(&self) -> Protection {
        *self.state.lock()
    }

    fn inner_ptr(&self) -> NonNull<u8> {
        // SAFETY: inner_offset < mapped_len.
        unsafe { NonNull::new_unchecked(self.base.as_ptr().add(self.inner_offset)) }
    }

    /// View of the data bytes.
    ///
    /// # Safety
    /// The region must be readable and no `bytes_mut` view may be alive.
    pub(crate) unsafe fn bytes(&self) -> &[u8] {
        slice::from_raw_parts(self.base.as_ptr().add(self.data_offset), self.len)
    }

    /// Mutable view of the data bytes.
    ///
    /// # Safety
    /// The region must be read-write and the caller must hold the only view.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn bytes_mut(&self) -> &mut [u8] {
        slice::from_raw_parts_mut(self.base.as_ptr().add(self.data_offset), self.len)
    }

    fn set_protection(&self, target: Protection) -> Result<()> {
        let mut state = self.state.lock();
        if *state == target {
            return Ok(());
        }
        let (ptr, len) = (self.inner_ptr(), self.inner_len);
        // SAFETY: ptr/len describe the inner pages of our own mapping.
        unsafe {
            if self.platform.seals_at_rest() {
                if *state == Protection::NoAccess {
                    self.platform.protect(ptr, len, Protection::ReadWrite)?;
                    *state = Protection::ReadWrite;
                    self.platform.unseal(ptr, len)?;
                }
                if target == Protection::NoAccess {
                    if *state != Protection::ReadWrite {
                        self.platform.protect(ptr, len, Protection::ReadWrite)?;
                        *state = Protection::ReadWrite;
                    }
                    self.platform.seal(ptr, len)?;
                }
            }
            self.platform.protect(ptr, len, target)?;
        }
        *state = target;
        Ok(())
    }

    /// Guard pages, lock, dump suppression and canary for a fresh mapping.
    fn prepare(&mut self, page: usize) -> Result<()> {
        let inner = self.inner_ptr();
        // SAFETY: all ranges lie inside our own mapping.
        unsafe {
            if self.layout == RegionLayout::Guarded {
                let post = NonNull::new_unchecked(inner.as_ptr().add(self.inner_len));
                self.platform.protect(self.base, page, Protection::NoAccess)?;
                self.platform.protect(post, page, Protection::NoAccess)?;
            }
            self.platform.lock(inner, self.inner_len)?;
            self.locked = true;
            self.platform.set_no_dump(inner, self.inner_len)?;

            let slack = self.data_offset - self.inner_offset;
            if self.layout == RegionLayout::Guarded && slack > 0 {
                let canary = canary(page)?;
                slice::from_raw_parts_mut(inner.as_ptr(), slack).copy_from_slice(&canary[..slack]);
            }
        }
        Ok(())
    }

    fn canary_intact(&self) -> bool {
        let slack = self.data_offset - self.inner_offset;
        if self.layout != RegionLayout::Guarded || slack == 0 {
            return true;
        }
        match CANARY.get() {
            // SAFETY: called only while the inner pages are readable.
            Some(expected) => unsafe {
                slice::from_raw_parts(self.inner_ptr().as_ptr(), slack) == &expected[..slack]
            },
            None => false,
        }
    }

    /// Wipe, unlock and unmap. Every step runs even if an earlier one
    /// failed; the first failure is returned.
    fn release(&mut self) -> Result<()> {
        if self.released {
            return Ok(());
        }
        self.released = true;

        let mut first: Option<Error> = None;
        let mut record = |result: Result<()>| {
            if let Err(err) = result {
                first.get_or_insert(err);
            }
        };

        let inner = self.inner_ptr();
        // SAFETY: inner pages and full mapping are our own; nothing else
        // references them once `release` runs.
        unsafe {
            // Unseals as well on platforms that encrypt at rest.
            let writable = self.set_protection(Protection::ReadWrite);
            record(writable);
            if *self.state.get_mut() == Protection::ReadWrite {
                if !self.canary_intact() {
                    record(Err(Error::CanaryMismatch));
                }
                wipe(slice::from_raw_parts_mut(inner.as_ptr(), self.inner_len));
            } else {
                error!(base = ?self.base, "region not writable on release; skipping wipe");
            }
            if self.locked {
                record(self.platform.unlock(inner, self.inner_len));
            }
            record(self.platform.unmap(self.base, self.mapped_len));
        }

        debug!(base = ?self.base, len = self.len, "released protected region");
        first.map_or(Ok(()), Err)
    }
}

impl Drop for SecureRegion {
    fn drop(&mut self) {
        if let Err(err) = self.release() {
            error!(error = %err, "failed to release protected region");
        }
    }
}

// ---------------------------------------------------------------------------
// Allocator
// ---------------------------------------------------------------------------

fn as_allocation_failure(err: Error) -> Error {
    match err {
        Error::OperationFailed { operation, code } => Error::AllocationFailure {
            operation,
            reason: format!("OS error code {code}"),
        },
        other => other,
    }
}

/// Allocates, protects and frees `SecureRegion`s on the current platform.
#[derive(Debug)]
pub struct ProtectedMemoryAllocator {
    platform: &'static dyn PlatformMemory,
    core_dumps: &'static CoreDumps,
    layout: RegionLayout,
}

impl ProtectedMemoryAllocator {
    /// Build an allocator for this OS, sharing the process core dump state.
    pub fn new(layout: RegionLayout) -> Result<Self> {
        Self::with_platform(platform(), CoreDumps::process(), layout)
    }

    pub(crate) fn with_platform(
        platform: &'static dyn PlatformMemory,
        core_dumps: &'static CoreDumps,
        layout: RegionLayout,
    ) -> Result<Self> {
        if platform.disables_dumps_globally() {
            core_dumps.ensure_disabled(platform)?;
        }
        Ok(Self {
            platform,
            core_dumps,
            layout,
        })
    }

    pub fn layout(&self) -> RegionLayout {
        self.layout
    }

    /// Allocate a read-write region of at least `len` bytes.
    ///
    /// On failure anything partially allocated is released before the
    /// `AllocationFailure` is returned.
    pub fn alloc(&self, len: usize) -> Result<SecureRegion> {
        let page = self.platform.page_size();
        let inner_len = round_to_pages(len, page);
        let guard_len = match self.layout {
            RegionLayout::Standard => 0,
            RegionLayout::Guarded => page,
        };
        let data_offset = match self.layout {
            RegionLayout::Standard => 0,
            RegionLayout::Guarded => guard_len + inner_len - len,
        };

        if let Some(max) = self
            .platform
            .mem_lock_limit()
            .map_err(as_allocation_failure)?
        {
            if max < inner_len as u64 {
                return Err(Error::AllocationFailure {
                    operation: "getrlimit(RLIMIT_MEMLOCK)",
                    reason: format!("requested {inner_len} bytes exceeds memlock limit of {max}"),
                });
            }
        }

        if self.platform.disables_dumps_globally() && !self.core_dumps.is_disabled() {
            self.core_dumps
                .ensure_disabled(self.platform)
                .map_err(as_allocation_failure)?;
        }

        let mapped_len = inner_len + 2 * guard_len;
        let base = self.platform.map(mapped_len)?;
        let mut region = SecureRegion {
            platform: self.platform,
            base,
            mapped_len,
            inner_offset: guard_len,
            inner_len,
            data_offset,
            len,
            layout: self.layout,
            state: Mutex::new(Protection::ReadWrite),
            locked: false,
            released: false,
        };
        // On error `region` drops here, which unlocks and unmaps it.
        region.prepare(page).map_err(as_allocation_failure)?;

        debug!(base = ?base, len, mapped_len, layout = ?self.layout, "allocated protected region");
        Ok(region)
    }

    /// Change the protection of a region.
    pub fn protect(&self, region: &SecureRegion, protection: Protection) -> Result<()> {
        region.set_protection(protection)
    }

    /// Wipe and release a region.
    pub fn free(&self, mut region: SecureRegion) -> Result<()> {
        region.release()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Delegates to the real backend, optionally failing `mlock` and
    /// pretending dumps must be disabled globally.
    #[derive(Debug, Default)]
    struct TestPlatform {
        fail_lock: bool,
        global_dumps: bool,
        unmaps: AtomicUsize,
        dump_disables: AtomicUsize,
    }

    impl PlatformMemory for TestPlatform {
        fn page_size(&self) -> usize {
            platform().page_size()
        }
        fn mem_lock_limit(&self) -> Result<Option<u64>> {
            Ok(None)
        }
        fn disables_dumps_globally(&self) -> bool {
            self.global_dumps
        }
        fn disable_core_dumps(&self) -> Result<()> {
            self.dump_disables.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        fn map(&self, len: usize) -> Result<NonNull<u8>> {
            platform().map(len)
        }
        unsafe fn unmap(&self, ptr: NonNull<u8>, len: usize) -> Result<()> {
            self.unmaps.fetch_add(1, Ordering::SeqCst);
            platform().unmap(ptr, len)
        }
        unsafe fn protect(&self, ptr: NonNull<u8>, len: usize, p: Protection) -> Result<()> {
            platform().protect(ptr, len, p)
        }
        unsafe fn lock(&self, ptr: NonNull<u8>, len: usize) -> Result<()> {
            if self.fail_lock {
                return Err(Error::OperationFailed {
                    operation: "mlock",
                    code: 12,
                });
            }
            platform().lock(ptr, len)
        }
        unsafe fn unlock(&self, ptr: NonNull<u8>, len: usize) -> Result<()> {
            platform().unlock(ptr, len)
        }
        unsafe fn set_no_dump(&self, _ptr: NonNull<u8>, _len: usize) -> Result<()> {
            Ok(())
        }
    }

    fn leak<T>(value: T) -> &'static T {
        Box::leak(Box::new(value))
    }

    #[test]
    fn test_standard_alloc_protect_free() {
        let allocator = ProtectedMemoryAllocator::new(RegionLayout::Standard).unwrap();
        let page = platform().page_size();
        let region = allocator.alloc(10).unwrap();

        assert_eq!(region.len(), 10);
        assert_eq!(region.mapped_len(), page);
        assert_eq!(region.protection(), Protection::ReadWrite);

        unsafe { region.bytes_mut().copy_from_slice(b"0123456789") };
        allocator.protect(&region, Protection::NoAccess).unwrap();
        assert_eq!(region.protection(), Protection::NoAccess);

        allocator.protect(&region, Protection::ReadOnly).unwrap();
        assert_eq!(unsafe { region.bytes() }, b"0123456789");

        allocator.free(region).unwrap();
    }

    #[test]
    fn test_guarded_layout_adds_two_pages() {
        let allocator = ProtectedMemoryAllocator::new(RegionLayout::Guarded).unwrap();
        let page = platform().page_size();
        let region = allocator.alloc(32).unwrap();

        assert_eq!(region.mapped_len(), page * 3);
        assert_eq!(region.layout(), RegionLayout::Guarded);

        unsafe { region.bytes_mut().fill(7) };
        allocator.protect(&region, Protection::ReadOnly).unwrap();
        assert!(unsafe { region.bytes() }.iter().all(|&b| b == 7));

        allocator.free(region).unwrap();
    }

    #[test]
    fn test_guarded_canary_corruption_detected() {
        let allocator = ProtectedMemoryAllocator::new(RegionLayout::Guarded).unwrap();
        let region = allocator.alloc(32).unwrap();

        // First byte of the canary slack in front of the data.
        unsafe { *region.inner_ptr().as_ptr() ^= 0xFF };

        assert!(matches!(allocator.free(region), Err(Error::CanaryMismatch)));
    }

    #[test]
    fn test_failed_lock_releases_mapping() {
        let test_platform = leak(TestPlatform {
            fail_lock: true,
            ..Default::default()
        });
        let allocator = ProtectedMemoryAllocator::with_platform(
            test_platform,
            leak(CoreDumps::new()),
            RegionLayout::Standard,
        )
        .unwrap();

        let result = allocator.alloc(16);

        assert!(matches!(
            result,
            Err(Error::AllocationFailure {
                operation: "mlock",
                ..
            })
        ));
        assert_eq!(test_platform.unmaps.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_global_dump_disable_happens_once() {
        let test_platform = leak(TestPlatform {
            global_dumps: true,
            ..Default::default()
        });
        let core_dumps = leak(CoreDumps::new());

        let first =
            ProtectedMemoryAllocator::with_platform(test_platform, core_dumps, RegionLayout::Standard)
                .unwrap();
        let _second =
            ProtectedMemoryAllocator::with_platform(test_platform, core_dumps, RegionLayout::Guarded)
                .unwrap();
        let region = first.alloc(8).unwrap();
        first.free(region).unwrap();

        assert!(core_dumps.is_disabled());
        assert_eq!(test_platform.dump_disables.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_zero_length_region() {
        let allocator = ProtectedMemoryAllocator::new(RegionLayout::Standard).unwrap();
        let region = allocator.alloc(0).unwrap();
        assert!(region.is_empty());
        allocator.protect(&region, Protection::NoAccess).unwrap();
        allocator.free(region).unwrap();
    }
}
