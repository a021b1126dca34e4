//! Crypto keys: dated, revocable wrappers around a `Secret`.
//!
//! A key exists in exactly one owned form and any number of shared views:
//!
//! - `CryptoKey::Owned` holds the key material. Closing it closes the
//!   underlying secret, after which every view fails with `InvalidState`.
//! - `CryptoKey::Shared` refers to an owned key held elsewhere (normally by
//!   the key cache). Closing a shared view does nothing, which makes it safe
//!   to hand one to every caller.
//!
//! Revocation is shared state: marking any view revoked marks the key.

use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::error;

use crate::error::Result;
use crate::secret::Secret;

/// The key material and metadata behind every `CryptoKey` variant.
pub struct SecretCryptoKey {
    secret: Secret,
    created: DateTime<Utc>,
    revoked: AtomicBool,
}

impl SecretCryptoKey {
    pub fn new(secret: Secret, created: DateTime<Utc>, revoked: bool) -> Self {
        Self {
            secret,
            created,
            revoked: AtomicBool::new(revoked),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.secret.is_closed()
    }

    fn close(&self) -> Result<()> {
        self.secret.close()
    }
}

impl fmt::Debug for SecretCryptoKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecretCryptoKey")
            .field("created", &self.created)
            .field("revoked", &self.revoked.load(Ordering::Acquire))
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// A key usable for encryption, either owned or a shared view.
///
/// - Not `Clone`. Use [`CryptoKey::share`] to hand out a view that cannot
///   close the key.
#[derive(Debug)]
pub enum CryptoKey {
    Owned(Arc<SecretCryptoKey>),
    Shared(Arc<SecretCryptoKey>),
}

impl CryptoKey {
    /// Wrap a secret as a new owned key.
    pub fn new(secret: Secret, created: DateTime<Utc>, revoked: bool) -> Self {
        Self::Owned(Arc::new(SecretCryptoKey::new(secret, created, revoked)))
    }

    fn inner(&self) -> &Arc<SecretCryptoKey> {
        match self {
            Self::Owned(key) | Self::Shared(key) => key,
        }
    }

    /// Run `f` with the raw key bytes. The bytes never outlive the call.
    pub fn with_key<R>(&self, f: impl FnOnce(&[u8]) -> Result<R>) -> Result<R> {
        self.inner().secret.with_bytes(f)
    }

    pub fn created(&self) -> DateTime<Utc> {
        self.inner().created
    }

    pub fn is_revoked(&self) -> bool {
        self.inner().revoked.load(Ordering::Acquire)
    }

    /// Mark the key revoked. There is no way back.
    pub fn mark_revoked(&self) {
        self.inner().revoked.store(true, Ordering::Release);
    }

    pub fn is_shared(&self) -> bool {
        matches!(self, Self::Shared(_))
    }

    /// True once the underlying owned key has been closed.
    pub fn is_closed(&self) -> bool {
        self.inner().is_closed()
    }

    /// A non-owning view of the same key.
    pub fn share(&self) -> CryptoKey {
        Self::Shared(Arc::clone(self.inner()))
    }

    /// Close an owned key's secret. A no-op for shared views.
    pub fn close(&self) -> Result<()> {
        match self {
            Self::Owned(key) => key.close(),
            Self::Shared(_) => Ok(()),
        }
    }
}

/// Closes the key it holds when dropped, on every exit path of the scope
/// that owns it. Close failures are logged.
pub(crate) struct KeyGuard(CryptoKey);

impl KeyGuard {
    pub(crate) fn new(key: CryptoKey) -> Self {
        Self(key)
    }
}

impl Deref for KeyGuard {
    type Target = CryptoKey;

    fn deref(&self) -> &CryptoKey {
        &self.0
    }
}

impl Drop for KeyGuard {
    fn drop(&mut self) {
        if let Err(err) = self.0.close() {
            error!(error = %err, "failed to close key");
        }
    }
}
