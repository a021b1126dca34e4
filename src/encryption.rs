//! The key hierarchy behind one partition.
//!
//! ```text
//! master key (KMS) --wraps--> system key       _SK_{service}_{product}
//! system key       --wraps--> intermediate key _IK_{partition}_{service}_{product}
//! intermediate key --wraps--> data row key     (ephemeral, one per payload)
//! ```
//!
//! [`EnvelopeEncryption`] resolves the latest usable system and intermediate
//! keys through the caches and the metastore, creating and persisting new
//! ones when the policy says the current ones have expired. Every key it
//! touches is closed before the call returns; cached keys are only ever
//! handed out as shared views.
//!
//! Key creation races are settled by the metastore: the loser of a
//! duplicate `store` closes its key and loads the winner's.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::cache::KeyCache;
use crate::crypto::{AeadCrypto, Aes256GcmCrypto};
use crate::envelope::{AeadEnvelopeCrypto, KeyMeta};
use crate::error::{Error, Result};
use crate::key::{CryptoKey, KeyGuard};
use crate::kms::KeyManagementService;
use crate::metastore::{EncryptedKeyRecord, Metastore};
use crate::partition::Partition;
use crate::policy::CryptoPolicy;

// ---------------------------------------------------------------------------
// Data row record
// ---------------------------------------------------------------------------

/// An encrypted payload and its wrapped data key, as the caller persists it.
///
/// JSON form: `{"Key": {"Created": .., "Key": "<base64>", "ParentKeyMeta": {..}}, "Data": "<base64>"}`.
/// `Key.ParentKeyMeta` names the intermediate key that wrapped the data key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataRowRecord {
    #[serde(rename = "Key")]
    pub key: EncryptedKeyRecord,
    #[serde(rename = "Data", with = "crate::metastore::base64_bytes")]
    pub data: Vec<u8>,
}

impl DataRowRecord {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Cache id for a key version. Zero-padding keeps versions of one id in
/// creation order, which `KeyCache::get_last` relies on.
fn cache_id(id: &str, created: i64) -> String {
    format!("{id}:{created:020}")
}

fn created_at(secs: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp(secs, 0)
        .ok_or_else(|| Error::MetadataMissing(format!("invalid key creation time {secs}")))
}

// ---------------------------------------------------------------------------
// EnvelopeEncryption
// ---------------------------------------------------------------------------

/// Encrypts and decrypts payloads for one partition.
///
/// The system key cache is usually shared by every partition of a
/// service/product (see [`SessionFactory`](crate::session::SessionFactory));
/// the intermediate key cache belongs to this value and is closed with it.
pub struct EnvelopeEncryption<C = Aes256GcmCrypto> {
    partition: Arc<dyn Partition>,
    metastore: Arc<dyn Metastore>,
    kms: Arc<dyn KeyManagementService>,
    policy: Arc<dyn CryptoPolicy>,
    crypto: Arc<C>,
    system_keys: Arc<KeyCache>,
    intermediate_keys: KeyCache,
}

impl<C: AeadEnvelopeCrypto> EnvelopeEncryption<C> {
    pub fn new(
        partition: Arc<dyn Partition>,
        metastore: Arc<dyn Metastore>,
        kms: Arc<dyn KeyManagementService>,
        policy: Arc<dyn CryptoPolicy>,
        crypto: Arc<C>,
        system_keys: Arc<KeyCache>,
    ) -> Self {
        let intermediate_keys = KeyCache::from_policy(policy.as_ref());
        Self {
            partition,
            metastore,
            kms,
            policy,
            crypto,
            system_keys,
            intermediate_keys,
        }
    }

    pub fn partition(&self) -> &dyn Partition {
        self.partition.as_ref()
    }

    /// Encrypt `data` under a fresh data key wrapped by the partition's
    /// latest intermediate key, creating keys as needed.
    pub fn encrypt_payload(&self, data: &[u8]) -> Result<DataRowRecord> {
        self.with_intermediate_key_for_write(|ik, ik_meta| {
            let sealed = self.crypto.envelope_encrypt_with_state(data, ik, ik_meta)?;
            Ok(DataRowRecord {
                key: EncryptedKeyRecord::new(
                    Utc::now().timestamp(),
                    sealed.encrypted_key,
                    Some(sealed.user_state),
                ),
                data: sealed.cipher_text,
            })
        })
    }

    /// Decrypt a record produced by [`EnvelopeEncryption::encrypt_payload`]
    /// for this partition.
    ///
    /// Records whose intermediate key belongs to another partition fail with
    /// `MetadataMissing` before any key is loaded.
    pub fn decrypt_data_row_record(&self, drr: &DataRowRecord) -> Result<Vec<u8>> {
        let ik_meta = drr.key.parent_key_meta.as_ref().ok_or_else(|| {
            Error::MetadataMissing("data row record has no intermediate key".to_string())
        })?;
        if !self.partition.is_valid_intermediate_key_id(&ik_meta.id) {
            return Err(Error::MetadataMissing(format!(
                "intermediate key {} does not belong to this partition",
                ik_meta.id
            )));
        }

        let ik = KeyGuard::new(self.existing_intermediate_key(ik_meta)?);
        self.crypto.envelope_decrypt(
            &drr.data,
            &drr.key.encrypted_key,
            created_at(drr.key.created)?,
            &ik,
        )
    }

    /// Close the intermediate key cache. The shared system key cache is
    /// left to its owner.
    pub fn close(&self) -> Result<()> {
        self.intermediate_keys.close()
    }

    // -- policy checks -------------------------------------------------------

    fn is_key_invalid(&self, key: &CryptoKey) -> bool {
        key.is_revoked() || self.policy.is_key_expired(key.created())
    }

    fn is_record_invalid(&self, record: &EncryptedKeyRecord) -> Result<bool> {
        Ok(record.revoked || self.policy.is_key_expired(created_at(record.created)?))
    }

    /// Whether the latest stored key can still be written under.
    fn is_record_writable(&self, id: &str, record: &EncryptedKeyRecord) -> Result<bool> {
        if !self.is_record_invalid(record)? {
            return Ok(true);
        }
        if self.policy.is_queued_key_rotation() {
            debug!(id, created = record.created, "key expired, rotation left to queue");
            return Ok(true);
        }
        Ok(false)
    }

    // -- intermediate keys ---------------------------------------------------

    fn with_intermediate_key_for_write<R>(
        &self,
        f: impl FnOnce(&CryptoKey, KeyMeta) -> Result<R>,
    ) -> Result<R> {
        let ik_id = self.partition.intermediate_key_id();

        if self.policy.can_cache_intermediate_keys() {
            if let Some(cached) = self.intermediate_keys.get_last()? {
                let cached = KeyGuard::new(cached);
                if !self.is_key_invalid(&cached) {
                    let meta = KeyMeta::new(ik_id, cached.created().timestamp());
                    return f(&cached, meta);
                }
            }
        }

        let key = self.latest_or_create_intermediate_key(&ik_id)?;
        let created = key.created().timestamp();
        let key = if self.policy.can_cache_intermediate_keys() {
            self.intermediate_keys
                .put_and_get_usable(&cache_id(&ik_id, created), key)?
        } else {
            key
        };
        let key = KeyGuard::new(key);
        f(&key, KeyMeta::new(ik_id, created))
    }

    fn latest_or_create_intermediate_key(&self, ik_id: &str) -> Result<CryptoKey> {
        if let Some(record) = self.metastore.load_latest(ik_id)? {
            if self.is_record_writable(ik_id, &record)? {
                match self.decrypt_intermediate_record(ik_id, &record, false) {
                    Ok(key) => return Ok(key),
                    Err(Error::MetadataMissing(reason)) => {
                        debug!(id = ik_id, %reason, "latest intermediate key unusable");
                    }
                    Err(err) => return Err(err),
                }
            }
        }

        let created = self
            .policy
            .truncate_to_intermediate_key_precision(Utc::now());
        let key = self.crypto.generate_key_at(created)?;
        let stored = self.with_system_key_for_write(|sk, sk_meta| {
            let record = EncryptedKeyRecord::new(
                created.timestamp(),
                self.crypto.encrypt_key(&key, sk)?,
                Some(sk_meta),
            );
            self.metastore.store(ik_id, created.timestamp(), record)
        });

        match stored {
            Ok(true) => {
                debug!(id = ik_id, created = created.timestamp(), "created intermediate key");
                Ok(key)
            }
            Ok(false) => {
                drop(KeyGuard::new(key));
                debug!(id = ik_id, "intermediate key created elsewhere, loading it");
                let record = self.metastore.load_latest(ik_id)?.ok_or_else(|| {
                    Error::MetadataMissing(format!("intermediate key {ik_id} vanished after write"))
                })?;
                self.decrypt_intermediate_record(ik_id, &record, true)
            }
            Err(err) => {
                drop(KeyGuard::new(key));
                Err(err)
            }
        }
    }

    fn existing_intermediate_key(&self, meta: &KeyMeta) -> Result<CryptoKey> {
        let id = cache_id(&meta.id, meta.created);
        let caching = self.policy.can_cache_intermediate_keys();

        let cached = if caching {
            self.intermediate_keys.get(&id)?
        } else {
            None
        };
        let key = match cached {
            Some(key) => key,
            None => {
                let record = self.metastore.load(&meta.id, meta.created)?.ok_or_else(|| {
                    Error::MetadataMissing(format!(
                        "intermediate key {} at {} not found",
                        meta.id, meta.created
                    ))
                })?;
                let key = self.decrypt_intermediate_record(&meta.id, &record, false)?;
                if caching {
                    self.intermediate_keys.put_and_get_usable(&id, key)?
                } else {
                    key
                }
            }
        };

        if self.policy.notify_expired_intermediate_key_on_read() && self.is_key_invalid(&key) {
            warn!(id = %meta.id, created = meta.created, "read with expired or revoked intermediate key");
        }
        Ok(key)
    }

    fn decrypt_intermediate_record(
        &self,
        ik_id: &str,
        record: &EncryptedKeyRecord,
        treat_expired_as_missing: bool,
    ) -> Result<CryptoKey> {
        let sk_meta = record.parent_key_meta.as_ref().ok_or_else(|| {
            Error::MetadataMissing(format!("intermediate key {ik_id} has no system key"))
        })?;
        let created = created_at(record.created)?;
        let sk = KeyGuard::new(self.existing_system_key(sk_meta, treat_expired_as_missing)?);
        self.crypto
            .decrypt_key(&record.encrypted_key, created, &sk, record.revoked)
    }

    // -- system keys ---------------------------------------------------------

    fn with_system_key_for_write<R>(
        &self,
        f: impl FnOnce(&CryptoKey, KeyMeta) -> Result<R>,
    ) -> Result<R> {
        let (key, meta) = self.latest_or_create_system_key()?;
        let key = KeyGuard::new(key);
        f(&key, meta)
    }

    fn latest_or_create_system_key(&self) -> Result<(CryptoKey, KeyMeta)> {
        let sk_id = self.partition.system_key_id();
        if let Some(record) = self.metastore.load_latest(&sk_id)? {
            if self.is_record_writable(&sk_id, &record)? {
                let meta = KeyMeta::new(sk_id, record.created);
                return Ok((self.existing_system_key(&meta, false)?, meta));
            }
        }

        let created = self.policy.truncate_to_system_key_precision(Utc::now());
        let key = self.crypto.generate_key_at(created)?;
        let stored = self.kms.encrypt_key(&key).and_then(|wrapped| {
            let record = EncryptedKeyRecord::new(created.timestamp(), wrapped, None);
            self.metastore.store(&sk_id, created.timestamp(), record)
        });

        match stored {
            Ok(true) => {
                debug!(id = %sk_id, created = created.timestamp(), "created system key");
                let meta = KeyMeta::new(sk_id, created.timestamp());
                Ok((self.cache_system_key(&meta, key)?, meta))
            }
            Ok(false) => {
                drop(KeyGuard::new(key));
                debug!(id = %sk_id, "system key created elsewhere, loading it");
                let record = self.metastore.load_latest(&sk_id)?.ok_or_else(|| {
                    Error::MetadataMissing(format!("system key {sk_id} vanished after write"))
                })?;
                let meta = KeyMeta::new(sk_id, record.created);
                Ok((self.existing_system_key(&meta, true)?, meta))
            }
            Err(err) => {
                drop(KeyGuard::new(key));
                Err(err)
            }
        }
    }

    /// The system key at `meta`, from the cache or unwrapped by the KMS.
    fn existing_system_key(&self, meta: &KeyMeta, treat_expired_as_missing: bool) -> Result<CryptoKey> {
        let cached = if self.policy.can_cache_system_keys() {
            self.system_keys.get(&cache_id(&meta.id, meta.created))?
        } else {
            None
        };
        let key = match cached {
            Some(key) => key,
            None => {
                let key = self.load_system_key(meta, treat_expired_as_missing)?;
                self.cache_system_key(meta, key)?
            }
        };

        if self.policy.notify_expired_system_key_on_read() && self.is_key_invalid(&key) {
            warn!(id = %meta.id, created = meta.created, "read with expired or revoked system key");
        }
        Ok(key)
    }

    fn load_system_key(&self, meta: &KeyMeta, treat_expired_as_missing: bool) -> Result<CryptoKey> {
        let record = self.metastore.load(&meta.id, meta.created)?.ok_or_else(|| {
            Error::MetadataMissing(format!("system key {} at {} not found", meta.id, meta.created))
        })?;
        if treat_expired_as_missing && self.is_record_invalid(&record)? {
            return Err(Error::MetadataMissing(format!(
                "system key {} at {} is expired or revoked",
                meta.id, meta.created
            )));
        }
        self.kms
            .decrypt_key(&record.encrypted_key, created_at(record.created)?, record.revoked)
    }

    fn cache_system_key(&self, meta: &KeyMeta, key: CryptoKey) -> Result<CryptoKey> {
        if self.policy.can_cache_system_keys() {
            self.system_keys
                .put_and_get_usable(&cache_id(&meta.id, meta.created), key)
        } else {
            Ok(key)
        }
    }
}

impl<C> fmt::Debug for EnvelopeEncryption<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EnvelopeEncryption")
            .field("partition", &self.partition)
            .field("intermediate_keys", &self.intermediate_keys.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KEY_LEN;
    use crate::kms::StaticKeyManagementService;
    use crate::metastore::InMemoryMetastore;
    use crate::partition::DefaultPartition;
    use crate::policy::BasicExpiringCryptoPolicy;

    fn encryption(partition: &str) -> (EnvelopeEncryption, Arc<InMemoryMetastore>) {
        let metastore = Arc::new(InMemoryMetastore::new());
        let policy = BasicExpiringCryptoPolicy::builder(90, 60).build();
        let encryption = EnvelopeEncryption::new(
            Arc::new(DefaultPartition::new(partition, "svc", "product")),
            metastore.clone(),
            Arc::new(StaticKeyManagementService::new(&mut [3u8; KEY_LEN]).unwrap()),
            Arc::new(policy.clone()),
            Arc::new(Aes256GcmCrypto::new().unwrap()),
            Arc::new(KeyCache::from_policy(&policy)),
        );
        (encryption, metastore)
    }

    #[test]
    fn test_cache_ids_sort_by_creation() {
        assert!(cache_id("_IK_a_s_p", 999) < cache_id("_IK_a_s_p", 1_000));
        assert!(cache_id("_IK_a_s_p", 1_699_999_999) < cache_id("_IK_a_s_p", 1_700_000_000));
    }

    #[test]
    fn test_first_encrypt_creates_both_keys() {
        let (encryption, metastore) = encryption("user1");
        let drr = encryption.encrypt_payload(b"secret row").unwrap();

        assert_eq!(metastore.len(), 2);
        let ik_meta = drr.key.parent_key_meta.clone().unwrap();
        assert_eq!(ik_meta.id, "_IK_user1_svc_product");
        let ik_record = metastore.load(&ik_meta.id, ik_meta.created).unwrap().unwrap();
        assert_eq!(ik_record.parent_key_meta.unwrap().id, "_SK_svc_product");

        assert_eq!(encryption.decrypt_data_row_record(&drr).unwrap(), b"secret row");
    }

    #[test]
    fn test_missing_parent_meta_is_metadata_missing() {
        let (encryption, _) = encryption("user1");
        let mut drr = encryption.encrypt_payload(b"x").unwrap();
        drr.key.parent_key_meta = None;
        assert!(matches!(
            encryption.decrypt_data_row_record(&drr),
            Err(Error::MetadataMissing(_))
        ));
    }

    #[test]
    fn test_data_row_record_json_shape() {
        let drr = DataRowRecord {
            key: EncryptedKeyRecord::new(
                1_700_000_000,
                vec![0xde, 0xad],
                Some(KeyMeta::new("_IK_u_s_p", 1_699_999_980)),
            ),
            data: vec![0xbe, 0xef],
        };
        let json = drr.to_json().unwrap();
        assert_eq!(
            json,
            r#"{"Key":{"Created":1700000000,"Key":"3q0=","ParentKeyMeta":{"KeyId":"_IK_u_s_p","Created":1699999980}},"Data":"vu8="}"#
        );
        assert_eq!(DataRowRecord::from_json(&json).unwrap(), drr);
    }

    #[test]
    fn test_closed_encryption_rejects_cached_writes() {
        let (encryption, _) = encryption("user1");
        encryption.encrypt_payload(b"warm").unwrap();
        encryption.close().unwrap();
        assert!(matches!(
            encryption.encrypt_payload(b"again"),
            Err(Error::InvalidState(_))
        ));
    }
}
