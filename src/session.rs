//! Per-partition sessions sharing one system key cache.
//!
//! A [`SessionFactory`] is created once per service/product. It hands out
//! an [`EnvelopeEncryption`] per partition id. When the policy allows
//! session caching those are reused until they sit idle past the expiry, and
//! the least recently used one is evicted once the cache is full.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::debug;

use crate::cache::KeyCache;
use crate::crypto::Aes256GcmCrypto;
use crate::encryption::EnvelopeEncryption;
use crate::envelope::AeadEnvelopeCrypto;
use crate::error::{Error, Result};
use crate::kms::KeyManagementService;
use crate::metastore::Metastore;
use crate::partition::DefaultPartition;
use crate::policy::CryptoPolicy;

struct CachedSession<C> {
    session: Arc<EnvelopeEncryption<C>>,
    last_used: Instant,
}

/// Creates [`EnvelopeEncryption`] sessions for one service/product.
pub struct SessionFactory<C = Aes256GcmCrypto> {
    service: String,
    product: String,
    metastore: Arc<dyn Metastore>,
    kms: Arc<dyn KeyManagementService>,
    policy: Arc<dyn CryptoPolicy>,
    crypto: Arc<C>,
    system_keys: Arc<KeyCache>,
    sessions: Mutex<HashMap<String, CachedSession<C>>>,
}

impl<C: AeadEnvelopeCrypto> SessionFactory<C> {
    pub fn new(
        service: impl Into<String>,
        product: impl Into<String>,
        metastore: Arc<dyn Metastore>,
        kms: Arc<dyn KeyManagementService>,
        policy: Arc<dyn CryptoPolicy>,
        crypto: Arc<C>,
    ) -> Self {
        let system_keys = Arc::new(KeyCache::from_policy(policy.as_ref()));
        Self {
            service: service.into(),
            product: product.into(),
            metastore,
            kms,
            policy,
            crypto,
            system_keys,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// The session for `partition_id`.
    pub fn get_session(&self, partition_id: &str) -> Result<Arc<EnvelopeEncryption<C>>> {
        if self.is_closed() {
            return Err(Error::InvalidState("attempted to get session after factory close"));
        }
        if !self.policy.can_cache_sessions() {
            return Ok(Arc::new(self.new_session(partition_id)));
        }

        let now = Instant::now();
        let ttl = Duration::from_millis(self.policy.session_cache_expire_millis().max(0) as u64);
        let max = usize::try_from(self.policy.session_cache_max_size()).unwrap_or(usize::MAX);

        let mut sessions = self.sessions.lock();
        sessions.retain(|id, cached| {
            let live = now.duration_since(cached.last_used) < ttl;
            if !live {
                debug!(partition = %id, "session expired");
            }
            live
        });

        if let Some(cached) = sessions.get_mut(partition_id) {
            cached.last_used = now;
            return Ok(Arc::clone(&cached.session));
        }

        while !sessions.is_empty() && sessions.len() >= max {
            let oldest = sessions
                .iter()
                .min_by_key(|(_, cached)| cached.last_used)
                .map(|(id, _)| id.clone());
            if let Some(id) = oldest {
                debug!(partition = %id, "evicting least recently used session");
                sessions.remove(&id);
            }
        }

        let session = Arc::new(self.new_session(partition_id));
        if max > 0 {
            sessions.insert(
                partition_id.to_string(),
                CachedSession {
                    session: Arc::clone(&session),
                    last_used: now,
                },
            );
        }
        Ok(session)
    }

    fn new_session(&self, partition_id: &str) -> EnvelopeEncryption<C> {
        debug!(partition = partition_id, "creating session");
        EnvelopeEncryption::new(
            Arc::new(DefaultPartition::new(
                partition_id,
                self.service.as_str(),
                self.product.as_str(),
            )),
            Arc::clone(&self.metastore),
            Arc::clone(&self.kms),
            Arc::clone(&self.policy),
            Arc::clone(&self.crypto),
            Arc::clone(&self.system_keys),
        )
    }

    pub fn cached_sessions(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_closed(&self) -> bool {
        self.system_keys.is_closed()
    }

    /// Drop cached sessions and close the system key cache. Sessions still
    /// held by callers fail once they need a system key.
    pub fn close(&self) -> Result<()> {
        self.sessions.lock().clear();
        self.system_keys.close()
    }
}

impl<C> fmt::Debug for SessionFactory<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionFactory")
            .field("service", &self.service)
            .field("product", &self.product)
            .field("sessions", &self.sessions.lock().len())
            .finish_non_exhaustive()
    }
}
