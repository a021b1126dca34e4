//! Low-level AEAD operations.
//!
//! This module is the only place in the crate that imports `ring::aead`.
//! Everything else encrypts and decrypts through the [`AeadCrypto`] trait.
//!
//! Primitive choices:
//! - **Cipher**: AES-256-GCM (authenticated encryption)
//! - **Nonce**: 96-bit (12 bytes), generated fresh per operation via `SystemRandom`
//! - **Key size**: 256 bits (32 bytes)
//!
//! # Layout of encrypted bytes
//! ```text
//! [ ciphertext ][ GCM tag (16 bytes) ][ nonce (12 bytes) ]
//! ```
//! The nonce is a fixed-length suffix, so no length prefix is needed.

use chrono::{DateTime, Utc};
use ring::aead::{self, Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM};
use ring::rand::{SecureRandom, SystemRandom};
use zeroize::{Zeroize, Zeroizing};

use crate::error::{Error, Result};
use crate::key::CryptoKey;
use crate::secret::SecretFactory;

/// The AEAD algorithm used throughout lockbox.
const ALGORITHM: &aead::Algorithm = &AES_256_GCM;

/// Size of the nonce in bytes (96 bits).
pub const NONCE_LEN: usize = 12;

/// Size of the GCM authentication tag in bytes.
pub const TAG_LEN: usize = 16;

/// Size of a data or key-encryption key in bytes (256 bits).
pub const KEY_LEN: usize = 32;

/// Largest plaintext GCM can seal under one nonce: (2^32 - 2) blocks.
pub const MAX_PLAINTEXT_LEN: u64 = ((1u64 << 32) - 2) * 16;

/// Raw authenticated encryption over `CryptoKey`s, plus key generation.
pub trait AeadCrypto: Send + Sync {
    /// Encrypt `plaintext` under `key`. Output is `ciphertext || tag || nonce`.
    fn encrypt(&self, plaintext: &[u8], key: &CryptoKey) -> Result<Vec<u8>>;

    /// Decrypt bytes produced by `encrypt`. Any authentication or length
    /// failure is `CipherAuthFailure` and no plaintext is returned.
    fn decrypt(&self, input: &[u8], key: &CryptoKey) -> Result<Vec<u8>>;

    /// Factory used for every key this cipher creates.
    fn secret_factory(&self) -> &SecretFactory;

    fn key_len(&self) -> usize {
        KEY_LEN
    }

    /// A random key created now.
    fn generate_key(&self) -> Result<CryptoKey> {
        self.generate_key_at(Utc::now())
    }

    /// A random key with the given creation time. The bytes are generated
    /// directly into protected memory.
    fn generate_key_at(&self, created: DateTime<Utc>) -> Result<CryptoKey> {
        let secret = self.secret_factory().create_random(self.key_len())?;
        Ok(CryptoKey::new(secret, created, false))
    }

    /// An owned key holding a copy of `bytes`. `bytes` is wiped once copied.
    fn generate_key_from_bytes(
        &self,
        bytes: &mut [u8],
        created: DateTime<Utc>,
        revoked: bool,
    ) -> Result<CryptoKey> {
        let secret = self.secret_factory().create(bytes)?;
        Ok(CryptoKey::new(secret, created, revoked))
    }
}

/// AES-256-GCM backed by `ring`.
#[derive(Debug, Clone)]
pub struct Aes256GcmCrypto {
    factory: SecretFactory,
    rng: SystemRandom,
}

impl Aes256GcmCrypto {
    /// Cipher whose keys live in standard protected regions.
    pub fn new() -> Result<Self> {
        Ok(Self::with_factory(SecretFactory::new()?))
    }

    pub fn with_factory(factory: SecretFactory) -> Self {
        Self {
            factory,
            rng: SystemRandom::new(),
        }
    }

    /// Generate a cryptographically secure random nonce.
    ///
    /// A fresh nonce is generated for every encryption call. There is no
    /// nonce caching or counter-based generation.
    fn generate_nonce(&self) -> Result<[u8; NONCE_LEN]> {
        let mut nonce = [0u8; NONCE_LEN];
        self.rng
            .fill(&mut nonce)
            .map_err(|_| Error::RandomnessFailure)?;
        Ok(nonce)
    }
}

fn less_safe_key(key_bytes: &[u8]) -> Result<LessSafeKey> {
    let unbound = UnboundKey::new(ALGORITHM, key_bytes).map_err(|_| Error::InvalidKey)?;
    Ok(LessSafeKey::new(unbound))
}

impl AeadCrypto for Aes256GcmCrypto {
    fn encrypt(&self, plaintext: &[u8], key: &CryptoKey) -> Result<Vec<u8>> {
        if plaintext.len() as u64 > MAX_PLAINTEXT_LEN {
            return Err(Error::DataTooLarge);
        }
        let nonce = self.generate_nonce()?;

        key.with_key(|key_bytes| {
            let sealing_key = less_safe_key(key_bytes)?;

            let mut output = Vec::with_capacity(plaintext.len() + TAG_LEN + NONCE_LEN);
            output.extend_from_slice(plaintext);

            // Encrypts `output` in place and appends the tag.
            if sealing_key
                .seal_in_place_append_tag(
                    Nonce::assume_unique_for_key(nonce),
                    Aad::empty(),
                    &mut output,
                )
                .is_err()
            {
                output.zeroize();
                return Err(Error::EncryptionFailure);
            }

            output.extend_from_slice(&nonce);
            Ok(output)
        })
    }

    fn decrypt(&self, input: &[u8], key: &CryptoKey) -> Result<Vec<u8>> {
        if input.len() < NONCE_LEN + TAG_LEN {
            return Err(Error::CipherAuthFailure);
        }
        let (sealed, nonce_bytes) = input.split_at(input.len() - NONCE_LEN);
        let nonce: [u8; NONCE_LEN] = nonce_bytes
            .try_into()
            .map_err(|_| Error::CipherAuthFailure)?;
        let expected_len = sealed.len() - TAG_LEN;

        key.with_key(|key_bytes| {
            let opening_key = less_safe_key(key_bytes)?;

            // Wiped on every exit path.
            let mut scratch = Zeroizing::new(sealed.to_vec());
            let plaintext = opening_key
                .open_in_place(Nonce::assume_unique_for_key(nonce), Aad::empty(), &mut scratch)
                .map_err(|_| Error::CipherAuthFailure)?;

            if plaintext.len() != expected_len {
                return Err(Error::CipherAuthFailure);
            }
            Ok(plaintext.to_vec())
        })
    }

    fn secret_factory(&self) -> &SecretFactory {
        &self.factory
    }
}
