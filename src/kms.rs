//! Master-key operations.
//!
//! The key management service wraps the top of the key hierarchy (system
//! keys). Production backends call out to an HSM or hosted KMS; this crate
//! ships only [`StaticKeyManagementService`], which holds a fixed master key
//! in protected memory and must not be used outside tests and demos.

use chrono::{DateTime, Utc};

use crate::crypto::{AeadCrypto, Aes256GcmCrypto, KEY_LEN};
use crate::envelope::AeadEnvelopeCrypto;
use crate::error::{Error, Result};
use crate::key::CryptoKey;

/// Wraps and unwraps system keys with a master key.
pub trait KeyManagementService: Send + Sync {
    fn encrypt_key(&self, key: &CryptoKey) -> Result<Vec<u8>>;

    fn decrypt_key(
        &self,
        encrypted_key: &[u8],
        created: DateTime<Utc>,
        revoked: bool,
    ) -> Result<CryptoKey>;

    /// Decrypt a key, run `f` with it, and close it before returning.
    fn with_decrypted_key<R>(
        &self,
        encrypted_key: &[u8],
        created: DateTime<Utc>,
        revoked: bool,
        f: impl FnOnce(&CryptoKey) -> Result<R>,
    ) -> Result<R>
    where
        Self: Sized,
    {
        let key = self.decrypt_key(encrypted_key, created, revoked)?;
        let result = f(&key);
        let closed = key.close();
        let value = result?;
        closed?;
        Ok(value)
    }
}

/// A KMS backed by one static AES-256 master key.
#[derive(Debug)]
pub struct StaticKeyManagementService {
    master_key: CryptoKey,
    crypto: Aes256GcmCrypto,
}

impl StaticKeyManagementService {
    /// Build from a 32-byte master key. `master_key` is wiped once copied.
    pub fn new(master_key: &mut [u8]) -> Result<Self> {
        if master_key.len() != KEY_LEN {
            return Err(Error::Kms(format!(
                "master key must be {KEY_LEN} bytes, got {}",
                master_key.len()
            )));
        }
        let crypto = Aes256GcmCrypto::new()?;
        let master_key = crypto.generate_key_from_bytes(master_key, Utc::now(), false)?;
        Ok(Self { master_key, crypto })
    }

    pub fn crypto(&self) -> &Aes256GcmCrypto {
        &self.crypto
    }
}

impl KeyManagementService for StaticKeyManagementService {
    fn encrypt_key(&self, key: &CryptoKey) -> Result<Vec<u8>> {
        self.crypto.encrypt_key(key, &self.master_key)
    }

    fn decrypt_key(
        &self,
        encrypted_key: &[u8],
        created: DateTime<Utc>,
        revoked: bool,
    ) -> Result<CryptoKey> {
        self.crypto
            .decrypt_key(encrypted_key, created, &self.master_key, revoked)
    }
}
