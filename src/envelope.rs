//! Envelope encryption on top of [`AeadCrypto`].
//!
//! A payload is encrypted with a fresh data key, and the data key is in turn
//! encrypted with a longer-lived key-encryption key (KEK). Only the wrapped
//! data key is ever persisted:
//!
//! ```text
//! plaintext --(ephemeral DRK)--> cipher_text
//! DRK       --(KEK)-----------> encrypted_key
//! ```
//!
//! Ephemeral keys are closed before every envelope call returns, on success
//! and on failure.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::crypto::{AeadCrypto, Aes256GcmCrypto};
use crate::error::Result;
use crate::key::{CryptoKey, KeyGuard};

/// Identifies a key in the hierarchy: its id and creation time.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct KeyMeta {
    #[serde(rename = "KeyId")]
    pub id: String,
    /// Creation time in epoch seconds.
    #[serde(rename = "Created")]
    pub created: i64,
}

impl KeyMeta {
    pub fn new(id: impl Into<String>, created: i64) -> Self {
        Self {
            id: id.into(),
            created,
        }
    }

    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(self.created, 0)
    }
}

/// Output of [`AeadEnvelopeCrypto::envelope_encrypt_with_state`].
///
/// `user_state` is carried through untouched, typically the [`KeyMeta`] of
/// the KEK that wrapped `encrypted_key`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvelopeEncryptResult<U> {
    pub cipher_text: Vec<u8>,
    pub encrypted_key: Vec<u8>,
    pub user_state: U,
}

/// Key wrapping and envelope composition for any [`AeadCrypto`].
pub trait AeadEnvelopeCrypto: AeadCrypto {
    /// Encrypt `key`'s bytes under `kek`.
    fn encrypt_key(&self, key: &CryptoKey, kek: &CryptoKey) -> Result<Vec<u8>> {
        key.with_key(|key_bytes| self.encrypt(key_bytes, kek))
    }

    /// Decrypt a wrapped key into a new owned key. The intermediate plaintext
    /// is wiped whether or not the key can be built.
    fn decrypt_key(
        &self,
        encrypted_key: &[u8],
        created: DateTime<Utc>,
        kek: &CryptoKey,
        revoked: bool,
    ) -> Result<CryptoKey> {
        let mut plaintext = Zeroizing::new(self.decrypt(encrypted_key, kek)?);
        self.generate_key_from_bytes(&mut plaintext, created, revoked)
    }

    /// Envelope-encrypt with no user state.
    fn envelope_encrypt(
        &self,
        plaintext: &[u8],
        kek: &CryptoKey,
    ) -> Result<EnvelopeEncryptResult<()>> {
        self.envelope_encrypt_with_state(plaintext, kek, ())
    }

    /// Encrypt `plaintext` under a fresh data key and wrap that key with
    /// `kek`.
    fn envelope_encrypt_with_state<U>(
        &self,
        plaintext: &[u8],
        kek: &CryptoKey,
        user_state: U,
    ) -> Result<EnvelopeEncryptResult<U>> {
        let drk = KeyGuard::new(self.generate_key()?);
        let cipher_text = self.encrypt(plaintext, &drk)?;
        let encrypted_key = self.encrypt_key(&drk, kek)?;
        Ok(EnvelopeEncryptResult {
            cipher_text,
            encrypted_key,
            user_state,
        })
    }

    /// Unwrap `encrypted_key` with `kek` and decrypt `cipher_text` with it.
    fn envelope_decrypt(
        &self,
        cipher_text: &[u8],
        encrypted_key: &[u8],
        created: DateTime<Utc>,
        kek: &CryptoKey,
    ) -> Result<Vec<u8>> {
        let drk = KeyGuard::new(self.decrypt_key(encrypted_key, created, kek, false)?);
        self.decrypt(cipher_text, &drk)
    }
}

impl AeadEnvelopeCrypto for Aes256GcmCrypto {}
