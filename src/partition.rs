//! Key naming for one partition of the hierarchy.
//!
//! Every service/product pair shares one system key, and every partition
//! (typically a user or tenant id) under it gets its own intermediate key:
//!
//! ```text
//! _SK_{service}_{product}
//! _IK_{partition}_{service}_{product}
//! ```

use std::fmt;

/// Names the system and intermediate keys a partition encrypts under.
pub trait Partition: Send + Sync + fmt::Debug {
    fn system_key_id(&self) -> String;

    fn intermediate_key_id(&self) -> String;

    /// Whether a stored record's intermediate key belongs to this partition.
    /// Records that fail this check are never decrypted.
    fn is_valid_intermediate_key_id(&self, id: &str) -> bool;
}

/// The standard `_SK_` / `_IK_` naming scheme.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DefaultPartition {
    id: String,
    service: String,
    product: String,
}

impl DefaultPartition {
    pub fn new(
        id: impl Into<String>,
        service: impl Into<String>,
        product: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            service: service.into(),
            product: product.into(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }
}

impl Partition for DefaultPartition {
    fn system_key_id(&self) -> String {
        format!("_SK_{}_{}", self.service, self.product)
    }

    fn intermediate_key_id(&self) -> String {
        format!("_IK_{}_{}_{}", self.id, self.service, self.product)
    }

    fn is_valid_intermediate_key_id(&self, id: &str) -> bool {
        id == self.intermediate_key_id()
    }
}

/// [`DefaultPartition`] with a suffix appended to both key ids, used to
/// keep regional copies of a hierarchy apart.
///
/// Records written under the unsuffixed intermediate key stay readable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SuffixedPartition {
    inner: DefaultPartition,
    suffix: String,
}

impl SuffixedPartition {
    pub fn new(
        id: impl Into<String>,
        service: impl Into<String>,
        product: impl Into<String>,
        suffix: impl Into<String>,
    ) -> Self {
        Self {
            inner: DefaultPartition::new(id, service, product),
            suffix: suffix.into(),
        }
    }
}

impl Partition for SuffixedPartition {
    fn system_key_id(&self) -> String {
        format!("{}_{}", self.inner.system_key_id(), self.suffix)
    }

    fn intermediate_key_id(&self) -> String {
        format!("{}_{}", self.inner.intermediate_key_id(), self.suffix)
    }

    fn is_valid_intermediate_key_id(&self, id: &str) -> bool {
        id == self.intermediate_key_id() || id.starts_with(&self.inner.intermediate_key_id())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_partition_ids() {
        let partition = DefaultPartition::new("user42", "billing", "cards");
        assert_eq!(partition.system_key_id(), "_SK_billing_cards");
        assert_eq!(partition.intermediate_key_id(), "_IK_user42_billing_cards");
        assert!(partition.is_valid_intermediate_key_id("_IK_user42_billing_cards"));
        assert!(!partition.is_valid_intermediate_key_id("_IK_user43_billing_cards"));
        assert!(!partition.is_valid_intermediate_key_id("_SK_billing_cards"));
    }

    #[test]
    fn test_suffixed_partition_accepts_unsuffixed_records() {
        let partition = SuffixedPartition::new("user42", "billing", "cards", "eu-west-1");
        assert_eq!(partition.system_key_id(), "_SK_billing_cards_eu-west-1");
        assert_eq!(
            partition.intermediate_key_id(),
            "_IK_user42_billing_cards_eu-west-1"
        );
        assert!(partition.is_valid_intermediate_key_id("_IK_user42_billing_cards"));
        assert!(partition.is_valid_intermediate_key_id("_IK_user42_billing_cards_us-east-1"));
        assert!(!partition.is_valid_intermediate_key_id("_IK_user4_billing_cards"));
    }
}
