//! # lockbox
//!
//! Envelope encryption with a protected-memory key lifecycle.
//!
//! Key material never sits in ordinary heap memory. It lives in
//! page-aligned regions that are locked against swapping, excluded from
//! core dumps, kept inaccessible between uses, and wiped before release.
//! On top of that:
//!
//! - [`Secret`] gives scoped, callback-only access to protected bytes.
//! - [`CryptoKey`] adds a creation time and a revocation flag, in an owned
//!   form and a shared view that can never free the key.
//! - [`KeyCache`] shares long-lived keys between callers and bounds how long
//!   a revoked key can stay trusted.
//! - [`AeadEnvelopeCrypto`] encrypts payloads under ephemeral data keys and
//!   wraps those keys with a key-encryption key.
//! - [`SessionFactory`] and [`EnvelopeEncryption`] run the full hierarchy
//!   (master key, system key, intermediate key, data key) per partition,
//!   persisting wrapped keys through a [`Metastore`].
//!
//! ```no_run
//! use lockbox::{AeadCrypto, AeadEnvelopeCrypto, Aes256GcmCrypto};
//!
//! # fn main() -> lockbox::Result<()> {
//! let crypto = Aes256GcmCrypto::new()?;
//! let kek = crypto.generate_key()?;
//!
//! let sealed = crypto.envelope_encrypt(b"card number", &kek)?;
//! let plaintext =
//!     crypto.envelope_decrypt(&sealed.cipher_text, &sealed.encrypted_key, kek.created(), &kek)?;
//! assert_eq!(plaintext, b"card number");
//! # Ok(())
//! # }
//! ```
//!
//! The library logs through `tracing` and never installs a subscriber.

pub mod cache;
pub mod crypto;
pub mod encryption;
pub mod envelope;
pub mod error;
pub mod key;
pub mod kms;
pub mod memory;
pub mod metastore;
pub mod partition;
pub mod policy;
pub mod secret;
pub mod session;

pub use cache::KeyCache;
pub use crypto::{AeadCrypto, Aes256GcmCrypto};
pub use encryption::{DataRowRecord, EnvelopeEncryption};
pub use envelope::{AeadEnvelopeCrypto, EnvelopeEncryptResult, KeyMeta};
pub use error::{Error, Result};
pub use key::{CryptoKey, SecretCryptoKey};
pub use kms::{KeyManagementService, StaticKeyManagementService};
pub use memory::{CoreDumps, Protection, RegionLayout};
pub use metastore::{EncryptedKeyRecord, InMemoryMetastore, Metastore};
pub use partition::{DefaultPartition, Partition, SuffixedPartition};
pub use policy::{BasicExpiringCryptoPolicy, CryptoPolicy, KeyRotationStrategy};
pub use secret::{Secret, SecretFactory};
pub use session::SessionFactory;
