//! Secrets: scoped access to bytes held in protected memory.
//!
//! A `Secret` owns exactly one `SecureRegion`. The region sits in
//! `NoAccess` except while a caller is inside `with_bytes` /
//! `with_bytes_mut`. Opening and closing are done by guard objects, so the
//! region is locked again on every exit path: normal return, error, or
//! panic unwinding out of the callback.
//!
//! Many threads may read one shared `Secret` at once. The first reader opens
//! the region and the last one out closes it; the counter and the
//! protection change form one critical section.
//!
//! Access is not re-entrant across kinds. From inside its own callback a
//! thread may read the same secret again, but `close` and `with_bytes_mut`
//! (and any read from inside `with_bytes_mut`) fail with `InvalidState`
//! rather than waiting on a lock the thread itself holds.

use std::cell::RefCell;
use std::fmt;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use ring::rand::{SecureRandom, SystemRandom};
use tracing::{debug, error};
use zeroize::Zeroizing;

use crate::error::{Error, Result};
use crate::memory::{wipe, ProtectedMemoryAllocator, Protection, RegionLayout, SecureRegion};

// ---------------------------------------------------------------------------
// Factory
// ---------------------------------------------------------------------------

/// Creates secrets backed by one allocator.
///
/// The region layout (standard or guarded) is fixed here; secrets created
/// by either kind of factory expose the same interface.
#[derive(Debug, Clone)]
pub struct SecretFactory {
    allocator: Arc<ProtectedMemoryAllocator>,
}

impl SecretFactory {
    /// Factory using the standard layout.
    pub fn new() -> Result<Self> {
        Self::with_layout(RegionLayout::Standard)
    }

    pub fn with_layout(layout: RegionLayout) -> Result<Self> {
        Ok(Self {
            allocator: Arc::new(ProtectedMemoryAllocator::new(layout)?),
        })
    }

    pub fn layout(&self) -> RegionLayout {
        self.allocator.layout()
    }

    /// Copy `bytes` into a new secret and wipe the caller's buffer.
    pub fn create(&self, bytes: &mut [u8]) -> Result<Secret> {
        Secret::new(Arc::clone(&self.allocator), bytes)
    }

    /// A secret of `len` random bytes, generated directly into protected
    /// memory.
    pub fn create_random(&self, len: usize) -> Result<Secret> {
        let region = self.allocator.alloc(len)?;
        // SAFETY: fresh regions are read-write and not yet shared.
        SystemRandom::new()
            .fill(unsafe { region.bytes_mut() })
            .map_err(|_| Error::RandomnessFailure)?;
        self.allocator.protect(&region, Protection::NoAccess)?;
        Ok(Secret::from_region(Arc::clone(&self.allocator), region))
    }
}

// ---------------------------------------------------------------------------
// Access guards
// ---------------------------------------------------------------------------

thread_local! {
    /// Secrets this thread is currently inside a callback for, keyed by
    /// address. `true` marks write access.
    static IN_ACCESS: RefCell<Vec<(usize, bool)>> = const { RefCell::new(Vec::new()) };
}

/// Records that the current thread is inside a callback for one secret.
struct AccessMark {
    owner: usize,
    write: bool,
}

impl AccessMark {
    fn enter(owner: usize, write: bool) -> Self {
        IN_ACCESS.with(|marks| marks.borrow_mut().push((owner, write)));
        Self { owner, write }
    }

    /// Whether this thread holds any access to `owner`, or only write access
    /// when `write_only` is set.
    fn held(owner: usize, write_only: bool) -> bool {
        IN_ACCESS.with(|marks| {
            marks
                .borrow()
                .iter()
                .any(|&(o, w)| o == owner && (w || !write_only))
        })
    }
}

impl Drop for AccessMark {
    fn drop(&mut self) {
        // The thread-local may already be gone while a thread exits.
        let _ = IN_ACCESS.try_with(|marks| {
            let mut marks = marks.borrow_mut();
            if let Some(pos) = marks.iter().rposition(|&m| m == (self.owner, self.write)) {
                marks.remove(pos);
            }
        });
    }
}

/// Shared read access. Holds one slot of the reader count.
struct ReadAccess<'a> {
    readers: &'a Mutex<usize>,
    allocator: &'a ProtectedMemoryAllocator,
    region: &'a SecureRegion,
    _mark: AccessMark,
}

impl<'a> ReadAccess<'a> {
    fn acquire(
        owner: usize,
        readers: &'a Mutex<usize>,
        allocator: &'a ProtectedMemoryAllocator,
        region: &'a SecureRegion,
    ) -> Result<Self> {
        let mut count = readers.lock();
        if *count == 0 {
            allocator.protect(region, Protection::ReadOnly)?;
        }
        *count += 1;
        Ok(Self {
            readers,
            allocator,
            region,
            _mark: AccessMark::enter(owner, false),
        })
    }
}

impl Drop for ReadAccess<'_> {
    fn drop(&mut self) {
        let mut count = self.readers.lock();
        *count -= 1;
        if *count == 0 {
            if let Err(err) = self.allocator.protect(self.region, Protection::NoAccess) {
                error!(error = %err, "failed to restore NoAccess after read");
            }
        }
    }
}

/// Exclusive read-write access. Only created under the write lock.
struct WriteAccess<'a> {
    allocator: &'a ProtectedMemoryAllocator,
    region: &'a SecureRegion,
    _mark: AccessMark,
}

impl<'a> WriteAccess<'a> {
    fn acquire(
        owner: usize,
        allocator: &'a ProtectedMemoryAllocator,
        region: &'a SecureRegion,
    ) -> Result<Self> {
        allocator.protect(region, Protection::ReadWrite)?;
        Ok(Self {
            allocator,
            region,
            _mark: AccessMark::enter(owner, true),
        })
    }
}

impl Drop for WriteAccess<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.allocator.protect(self.region, Protection::NoAccess) {
            error!(error = %err, "failed to restore NoAccess after write");
        }
    }
}

// ---------------------------------------------------------------------------
// Secret
// ---------------------------------------------------------------------------

/// Bytes held in protected memory.
///
/// - Not `Clone`. Use [`Secret::copy`] for an independent region.
/// - Closed explicitly with [`Secret::close`] or on drop. Closing is
///   idempotent; any other operation on a closed secret is `InvalidState`.
pub struct Secret {
    allocator: Arc<ProtectedMemoryAllocator>,
    region: RwLock<Option<SecureRegion>>,
    readers: Mutex<usize>,
    len: usize,
}

impl Secret {
    fn new(allocator: Arc<ProtectedMemoryAllocator>, bytes: &mut [u8]) -> Result<Self> {
        let region = allocator.alloc(bytes.len())?;
        // SAFETY: fresh regions are read-write and not yet shared.
        unsafe { region.bytes_mut() }.copy_from_slice(bytes);
        allocator.protect(&region, Protection::NoAccess)?;

        // Only a successful copy consumes the caller's buffer.
        wipe(bytes);
        Ok(Self::from_region(allocator, region))
    }

    fn from_region(allocator: Arc<ProtectedMemoryAllocator>, region: SecureRegion) -> Self {
        Self {
            len: region.len(),
            allocator,
            region: RwLock::new(Some(region)),
            readers: Mutex::new(0),
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_closed(&self) -> bool {
        if AccessMark::held(self.owner(), true) {
            // Inside our own write callback, so the region is open.
            return false;
        }
        self.region.read_recursive().is_none()
    }

    fn owner(&self) -> usize {
        self as *const Self as usize
    }

    /// Run `f` with a read-only view of the secret bytes.
    ///
    /// The view must not escape `f`; copy what you need and wipe the copy.
    /// `f` may read this secret again, but calling [`Secret::close`] or
    /// [`Secret::with_bytes_mut`] on it from inside `f` returns
    /// `InvalidState`.
    pub fn with_bytes<R>(&self, f: impl FnOnce(&[u8]) -> Result<R>) -> Result<R> {
        if AccessMark::held(self.owner(), true) {
            return Err(Error::InvalidState("secret read from inside its own write access"));
        }
        // Recursive read so nested access from `f` cannot deadlock behind a
        // queued `close`.
        let guard = self.region.read_recursive();
        let region = guard
            .as_ref()
            .ok_or(Error::InvalidState("attempted to access a closed secret"))?;
        let _access = ReadAccess::acquire(self.owner(), &self.readers, &self.allocator, region)?;
        // SAFETY: readable while `_access` lives; writers are excluded by
        // the read lock.
        f(unsafe { region.bytes() })
    }

    /// Run `f` with exclusive, writable access to the secret bytes.
    ///
    /// Fails with `InvalidState` when called from inside another callback
    /// on this secret.
    pub fn with_bytes_mut<R>(&self, f: impl FnOnce(&mut [u8]) -> Result<R>) -> Result<R> {
        if AccessMark::held(self.owner(), false) {
            return Err(Error::InvalidState("secret written from inside its own access"));
        }
        let guard = self.region.write();
        let region = guard
            .as_ref()
            .ok_or(Error::InvalidState("attempted to access a closed secret"))?;
        let _access = WriteAccess::acquire(self.owner(), &self.allocator, region)?;
        // SAFETY: read-write while `_access` lives; the write lock makes
        // this the only view.
        f(unsafe { region.bytes_mut() })
    }

    /// Run `f` with the secret decoded as UTF-8.
    pub fn with_str<R>(&self, f: impl FnOnce(&str) -> Result<R>) -> Result<R> {
        self.with_bytes(|bytes| {
            let text = std::str::from_utf8(bytes).map_err(|_| Error::InvalidUtf8)?;
            f(text)
        })
    }

    /// Copy the bytes into a new, independently owned secret.
    pub fn copy(&self) -> Result<Secret> {
        self.with_bytes(|bytes| {
            let mut scratch = Zeroizing::new(bytes.to_vec());
            Secret::new(Arc::clone(&self.allocator), &mut scratch)
        })
    }

    /// Wipe and free the region. Waits for in-flight readers on other
    /// threads. A second call is a no-op. Fails with `InvalidState` when
    /// called from inside a callback on this secret.
    pub fn close(&self) -> Result<()> {
        if AccessMark::held(self.owner(), false) {
            return Err(Error::InvalidState("secret closed from inside its own access"));
        }
        let region = self.region.write().take();
        match region {
            Some(region) => {
                debug!(len = self.len, "closing secret");
                self.allocator.free(region)
            }
            None => Ok(()),
        }
    }
}

impl Drop for Secret {
    fn drop(&mut self) {
        if let Some(region) = self.region.get_mut().take() {
            if let Err(err) = self.allocator.free(region) {
                error!(error = %err, "failed to free secret on drop");
            }
        }
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Secret")
            .field("len", &self.len)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}
