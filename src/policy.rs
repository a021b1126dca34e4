//! Crypto policy: key expiry, revocation checks and caching switches.
//!
//! The policy is consumed by [`EnvelopeEncryption`](crate::encryption::EnvelopeEncryption)
//! and [`SessionFactory`](crate::session::SessionFactory), not by the crypto
//! primitives. [`BasicExpiringCryptoPolicy`] can be built in code
//! or deserialized from configuration:
//!
//! ```json
//! { "keyExpirationDays": 90, "revokeCheckMinutes": 60, "keyRotationStrategy": "queued" }
//! ```

use chrono::{DateTime, DurationRound, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

const MILLIS_PER_MINUTE: i64 = 60 * 1000;
const MILLIS_PER_DAY: i64 = 24 * 60 * MILLIS_PER_MINUTE;

/// When an expired key is replaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyRotationStrategy {
    /// Create the replacement key on the request that notices expiry.
    #[default]
    Inline,
    /// Hand the rotation to a background process.
    Queued,
}

/// Policy decisions about key lifetime and caching.
pub trait CryptoPolicy: Send + Sync {
    fn is_key_expired(&self, created: DateTime<Utc>) -> bool;

    /// How long a cached, non-revoked key is trusted before the metastore
    /// must be consulted again.
    fn revoke_check_period_millis(&self) -> i64;

    fn can_cache_system_keys(&self) -> bool;

    fn can_cache_intermediate_keys(&self) -> bool;

    fn can_cache_sessions(&self) -> bool;

    fn session_cache_max_size(&self) -> u64;

    fn session_cache_expire_millis(&self) -> i64;

    fn notify_expired_system_key_on_read(&self) -> bool;

    fn notify_expired_intermediate_key_on_read(&self) -> bool;

    fn key_rotation_strategy(&self) -> KeyRotationStrategy;

    fn is_inline_key_rotation(&self) -> bool {
        self.key_rotation_strategy() == KeyRotationStrategy::Inline
    }

    fn is_queued_key_rotation(&self) -> bool {
        self.key_rotation_strategy() == KeyRotationStrategy::Queued
    }

    /// Truncate a system key's creation time to the minute.
    fn truncate_to_system_key_precision(&self, instant: DateTime<Utc>) -> DateTime<Utc> {
        truncate_to_minute(instant)
    }

    /// Truncate an intermediate key's creation time to the minute.
    fn truncate_to_intermediate_key_precision(&self, instant: DateTime<Utc>) -> DateTime<Utc> {
        truncate_to_minute(instant)
    }
}

fn truncate_to_minute(instant: DateTime<Utc>) -> DateTime<Utc> {
    instant
        .duration_trunc(TimeDelta::minutes(1))
        .unwrap_or(instant)
}

/// A policy that expires keys after a fixed number of days.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BasicExpiringCryptoPolicy {
    pub key_expiration_days: u32,
    pub revoke_check_minutes: u32,
    pub key_rotation_strategy: KeyRotationStrategy,
    pub can_cache_system_keys: bool,
    pub can_cache_intermediate_keys: bool,
    pub can_cache_sessions: bool,
    pub session_cache_max_size: u64,
    pub session_cache_expire_minutes: u32,
    pub notify_expired_system_key_on_read: bool,
    pub notify_expired_intermediate_key_on_read: bool,
}

impl Default for BasicExpiringCryptoPolicy {
    fn default() -> Self {
        Self {
            key_expiration_days: 90,
            revoke_check_minutes: 60,
            key_rotation_strategy: KeyRotationStrategy::Inline,
            can_cache_system_keys: true,
            can_cache_intermediate_keys: true,
            can_cache_sessions: false,
            session_cache_max_size: 1000,
            session_cache_expire_minutes: 120,
            notify_expired_system_key_on_read: false,
            notify_expired_intermediate_key_on_read: false,
        }
    }
}

impl BasicExpiringCryptoPolicy {
    /// Start a builder with the two required settings.
    pub fn builder(key_expiration_days: u32, revoke_check_minutes: u32) -> PolicyBuilder {
        PolicyBuilder {
            policy: Self {
                key_expiration_days,
                revoke_check_minutes,
                ..Self::default()
            },
        }
    }
}

impl CryptoPolicy for BasicExpiringCryptoPolicy {
    fn is_key_expired(&self, created: DateTime<Utc>) -> bool {
        let expires = created.timestamp_millis() + i64::from(self.key_expiration_days) * MILLIS_PER_DAY;
        Utc::now().timestamp_millis() > expires
    }

    fn revoke_check_period_millis(&self) -> i64 {
        i64::from(self.revoke_check_minutes) * MILLIS_PER_MINUTE
    }

    fn can_cache_system_keys(&self) -> bool {
        self.can_cache_system_keys
    }

    fn can_cache_intermediate_keys(&self) -> bool {
        self.can_cache_intermediate_keys
    }

    fn can_cache_sessions(&self) -> bool {
        self.can_cache_sessions
    }

    fn session_cache_max_size(&self) -> u64 {
        self.session_cache_max_size
    }

    fn session_cache_expire_millis(&self) -> i64 {
        i64::from(self.session_cache_expire_minutes) * MILLIS_PER_MINUTE
    }

    fn notify_expired_system_key_on_read(&self) -> bool {
        self.notify_expired_system_key_on_read
    }

    fn notify_expired_intermediate_key_on_read(&self) -> bool {
        self.notify_expired_intermediate_key_on_read
    }

    fn key_rotation_strategy(&self) -> KeyRotationStrategy {
        self.key_rotation_strategy
    }
}

/// Builder for the optional settings of [`BasicExpiringCryptoPolicy`].
#[derive(Debug, Clone)]
pub struct PolicyBuilder {
    policy: BasicExpiringCryptoPolicy,
}

impl PolicyBuilder {
    pub fn rotation_strategy(mut self, strategy: KeyRotationStrategy) -> Self {
        self.policy.key_rotation_strategy = strategy;
        self
    }

    pub fn cache_system_keys(mut self, enabled: bool) -> Self {
        self.policy.can_cache_system_keys = enabled;
        self
    }

    pub fn cache_intermediate_keys(mut self, enabled: bool) -> Self {
        self.policy.can_cache_intermediate_keys = enabled;
        self
    }

    pub fn cache_sessions(mut self, enabled: bool) -> Self {
        self.policy.can_cache_sessions = enabled;
        self
    }

    pub fn session_cache_max_size(mut self, size: u64) -> Self {
        self.policy.session_cache_max_size = size;
        self
    }

    pub fn session_cache_expire_minutes(mut self, minutes: u32) -> Self {
        self.policy.session_cache_expire_minutes = minutes;
        self
    }

    pub fn notify_expired_system_key_on_read(mut self, notify: bool) -> Self {
        self.policy.notify_expired_system_key_on_read = notify;
        self
    }

    pub fn notify_expired_intermediate_key_on_read(mut self, notify: bool) -> Self {
        self.policy.notify_expired_intermediate_key_on_read = notify;
        self
    }

    pub fn build(self) -> BasicExpiringCryptoPolicy {
        self.policy
    }
}
