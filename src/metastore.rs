//! Persistence of wrapped keys.
//!
//! A metastore holds [`EncryptedKeyRecord`]s addressed by `(id, created)`.
//! Writes are insert-only: storing an existing address reports `false`
//! instead of overwriting, which is how concurrent key creation is resolved.

use std::collections::BTreeMap;

use base64::{engine::general_purpose, Engine};
use parking_lot::RwLock;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tracing::debug;

use crate::envelope::KeyMeta;
use crate::error::Result;

/// A wrapped key as it is persisted.
///
/// JSON form: `{"Created": .., "Key": "<base64>", "ParentKeyMeta": {..}, "Revoked": true}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedKeyRecord {
    /// Creation time in epoch seconds.
    #[serde(rename = "Created")]
    pub created: i64,
    #[serde(rename = "Key", with = "base64_bytes")]
    pub encrypted_key: Vec<u8>,
    /// The key that wrapped this one. `None` for keys wrapped by the KMS.
    #[serde(
        rename = "ParentKeyMeta",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub parent_key_meta: Option<KeyMeta>,
    #[serde(rename = "Revoked", default, skip_serializing_if = "is_false")]
    pub revoked: bool,
}

fn is_false(value: &bool) -> bool {
    !*value
}

pub(crate) mod base64_bytes {
    use super::*;

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&general_purpose::STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        general_purpose::STANDARD
            .decode(encoded)
            .map_err(serde::de::Error::custom)
    }
}

impl EncryptedKeyRecord {
    pub fn new(created: i64, encrypted_key: Vec<u8>, parent_key_meta: Option<KeyMeta>) -> Self {
        Self {
            created,
            encrypted_key,
            parent_key_meta,
            revoked: false,
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

/// Storage for wrapped keys.
pub trait Metastore: Send + Sync {
    /// The record stored at exactly `(id, created)`.
    fn load(&self, id: &str, created: i64) -> Result<Option<EncryptedKeyRecord>>;

    /// The record with the newest `created` for `id`.
    fn load_latest(&self, id: &str) -> Result<Option<EncryptedKeyRecord>>;

    /// Insert `record` at `(id, created)`. Returns `false` if something is
    /// already stored there; the existing record is left untouched.
    fn store(&self, id: &str, created: i64, record: EncryptedKeyRecord) -> Result<bool>;
}

/// A process-local metastore for tests and demos.
#[derive(Debug, Default)]
pub struct InMemoryMetastore {
    records: RwLock<BTreeMap<(String, i64), EncryptedKeyRecord>>,
}

impl InMemoryMetastore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}

impl Metastore for InMemoryMetastore {
    fn load(&self, id: &str, created: i64) -> Result<Option<EncryptedKeyRecord>> {
        Ok(self.records.read().get(&(id.to_string(), created)).cloned())
    }

    fn load_latest(&self, id: &str) -> Result<Option<EncryptedKeyRecord>> {
        let records = self.records.read();
        let latest = records
            .range((id.to_string(), i64::MIN)..=(id.to_string(), i64::MAX))
            .next_back()
            .map(|(_, record)| record.clone());
        Ok(latest)
    }

    fn store(&self, id: &str, created: i64, record: EncryptedKeyRecord) -> Result<bool> {
        let mut records = self.records.write();
        let address = (id.to_string(), created);
        if records.contains_key(&address) {
            debug!(id, created, "metastore record already exists");
            return Ok(false);
        }
        records.insert(address, record);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(created: i64, byte: u8) -> EncryptedKeyRecord {
        EncryptedKeyRecord::new(created, vec![byte; 4], None)
    }

    #[test]
    fn test_store_is_insert_only() {
        let store = InMemoryMetastore::new();
        assert!(store.store("ik", 10, record(10, 1)).unwrap());
        assert!(!store.store("ik", 10, record(10, 2)).unwrap());

        let loaded = store.load("ik", 10).unwrap().unwrap();
        assert_eq!(loaded.encrypted_key, vec![1; 4]);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_load_latest_scopes_to_id() {
        let store = InMemoryMetastore::new();
        store.store("a", 5, record(5, 1)).unwrap();
        store.store("a", 20, record(20, 2)).unwrap();
        store.store("ab", 99, record(99, 3)).unwrap();

        assert_eq!(store.load_latest("a").unwrap().unwrap().created, 20);
        assert_eq!(store.load_latest("ab").unwrap().unwrap().created, 99);
        assert!(store.load_latest("b").unwrap().is_none());
        assert!(store.load("a", 6).unwrap().is_none());
    }

    #[test]
    fn test_record_json_shape() {
        let mut rec = EncryptedKeyRecord::new(
            1_700_000_000,
            vec![0xde, 0xad, 0xbe, 0xef],
            Some(KeyMeta::new("_SK_svc_product", 1_699_999_000)),
        );
        let json = rec.to_json().unwrap();
        assert_eq!(
            json,
            r#"{"Created":1700000000,"Key":"3q2+7w==","ParentKeyMeta":{"KeyId":"_SK_svc_product","Created":1699999000}}"#
        );

        rec.revoked = true;
        rec.parent_key_meta = None;
        let json = rec.to_json().unwrap();
        assert_eq!(json, r#"{"Created":1700000000,"Key":"3q2+7w==","Revoked":true}"#);
        assert_eq!(EncryptedKeyRecord::from_json(&json).unwrap(), rec);
    }

    #[test]
    fn test_record_rejects_bad_base64() {
        let err = EncryptedKeyRecord::from_json(r#"{"Created":1,"Key":"***"}"#).unwrap_err();
        assert!(matches!(err, crate::error::Error::Serialization(_)));
    }
}
