use aes_gcm::aead::{generic_array::GenericArray, Aead, KeyInit};
use aes_gcm::{Aes128Gcm, Aes256Gcm};
use chacha20poly1305::{ChaCha20Poly1305, XChaCha20Poly1305};
use hmac::{Hmac, Mac};
use sha2::{Sha256, Sha384, Sha512};
use sha3::Sha3_256;
use std::fmt;
use std::sync::Arc;
use stek_core::{
    CipherAlgorithm, DigestAlgorithm, KeyName, KeyRecord, RandomSource, MIN_MAC_KEY_LEN,
};
use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

use crate::error::TicketError;

enum AeadImpl {
    Aes128(Box<Aes128Gcm>),
    Aes256(Box<Aes256Gcm>),
    ChaCha(ChaCha20Poly1305),
    XChaCha(XChaCha20Poly1305),
}

impl AeadImpl {
    fn encrypt(&self, iv: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, TicketError> {
        match self {
            AeadImpl::Aes128(cipher) => cipher.encrypt(GenericArray::from_slice(iv), plaintext),
            AeadImpl::Aes256(cipher) => cipher.encrypt(GenericArray::from_slice(iv), plaintext),
            AeadImpl::ChaCha(cipher) => cipher.encrypt(GenericArray::from_slice(iv), plaintext),
            AeadImpl::XChaCha(cipher) => cipher.encrypt(GenericArray::from_slice(iv), plaintext),
        }
        .map_err(|_| TicketError::Encrypt)
    }

    fn decrypt(&self, iv: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>, TicketError> {
        match self {
            AeadImpl::Aes128(cipher) => cipher.decrypt(GenericArray::from_slice(iv), ciphertext),
            AeadImpl::Aes256(cipher) => cipher.decrypt(GenericArray::from_slice(iv), ciphertext),
            AeadImpl::ChaCha(cipher) => cipher.decrypt(GenericArray::from_slice(iv), ciphertext),
            AeadImpl::XChaCha(cipher) => cipher.decrypt(GenericArray::from_slice(iv), ciphertext),
        }
        .map_err(|_| TicketError::Decrypt)
    }
}

/// Keyed cipher for one ticket operation. Immutable once built.
pub struct CipherContext {
    algorithm: CipherAlgorithm,
    aead: AeadImpl,
}

impl CipherContext {
    pub fn new(algorithm: CipherAlgorithm, key: &[u8]) -> Result<Self, TicketError> {
        if key.len() != algorithm.key_len() {
            return Err(TicketError::CryptoInit(format!(
                "{} expects a {}-byte key, got {}",
                algorithm.label(),
                algorithm.key_len(),
                key.len()
            )));
        }
        let reject = |_| TicketError::CryptoInit(format!("{} rejected key", algorithm.label()));
        let aead = match algorithm {
            CipherAlgorithm::Aes128Gcm => {
                AeadImpl::Aes128(Box::new(Aes128Gcm::new_from_slice(key).map_err(reject)?))
            }
            CipherAlgorithm::Aes256Gcm => {
                AeadImpl::Aes256(Box::new(Aes256Gcm::new_from_slice(key).map_err(reject)?))
            }
            CipherAlgorithm::ChaCha20Poly1305 => {
                AeadImpl::ChaCha(ChaCha20Poly1305::new_from_slice(key).map_err(reject)?)
            }
            CipherAlgorithm::XChaCha20Poly1305 => {
                AeadImpl::XChaCha(XChaCha20Poly1305::new_from_slice(key).map_err(reject)?)
            }
        };
        Ok(Self { algorithm, aead })
    }

    pub fn algorithm(&self) -> CipherAlgorithm {
        self.algorithm
    }

    pub fn iv_len(&self) -> usize {
        self.algorithm.iv_len()
    }

    pub fn seal(&self, iv: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, TicketError> {
        if iv.len() != self.iv_len() {
            return Err(TicketError::CryptoInit(format!(
                "{} expects a {}-byte iv, got {}",
                self.algorithm.label(),
                self.iv_len(),
                iv.len()
            )));
        }
        self.aead.encrypt(iv, plaintext)
    }

    pub fn open(&self, iv: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>, TicketError> {
        if iv.len() != self.iv_len() {
            return Err(TicketError::Malformed);
        }
        self.aead.decrypt(iv, ciphertext)
    }
}

impl fmt::Debug for CipherContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CipherContext")
            .field("algorithm", &self.algorithm.label())
            .finish()
    }
}

/// HMAC key bound to a digest algorithm.
pub struct MacContext {
    digest: DigestAlgorithm,
    key: Zeroizing<Vec<u8>>,
}

impl MacContext {
    pub fn new(digest: DigestAlgorithm, key: &[u8]) -> Result<Self, TicketError> {
        if key.len() < MIN_MAC_KEY_LEN {
            return Err(TicketError::CryptoInit(format!(
                "mac key must be at least {MIN_MAC_KEY_LEN} bytes, got {}",
                key.len()
            )));
        }
        Ok(Self {
            digest,
            key: Zeroizing::new(key.to_vec()),
        })
    }

    pub fn digest(&self) -> DigestAlgorithm {
        self.digest
    }

    pub fn tag_len(&self) -> usize {
        self.digest.output_len()
    }

    /// MAC over the concatenation of `parts`.
    pub fn compute(&self, parts: &[&[u8]]) -> Result<Vec<u8>, TicketError> {
        match self.digest {
            DigestAlgorithm::Sha256 => hmac_parts::<Hmac<Sha256>>(&self.key, parts),
            DigestAlgorithm::Sha384 => hmac_parts::<Hmac<Sha384>>(&self.key, parts),
            DigestAlgorithm::Sha512 => hmac_parts::<Hmac<Sha512>>(&self.key, parts),
            DigestAlgorithm::Sha3_256 => hmac_parts::<Hmac<Sha3_256>>(&self.key, parts),
        }
    }

    /// Constant-time comparison of `tag` against the MAC over `parts`.
    pub fn verify(&self, parts: &[&[u8]], tag: &[u8]) -> Result<bool, TicketError> {
        let expected = self.compute(parts)?;
        Ok(expected.as_slice().ct_eq(tag).unwrap_u8() == 1)
    }
}

fn hmac_parts<M>(key: &[u8], parts: &[&[u8]]) -> Result<Vec<u8>, TicketError>
where
    M: Mac + hmac::digest::KeyInit,
{
    let mut mac = <M as Mac>::new_from_slice(key)
        .map_err(|_| TicketError::CryptoInit("mac key rejected".into()))?;
    for part in parts {
        mac.update(part);
    }
    Ok(mac.finalize().into_bytes().to_vec())
}

impl fmt::Debug for MacContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MacContext")
            .field("digest", &self.digest.label())
            .finish()
    }
}

/// Everything needed to seal or open one ticket, built fresh per handshake.
///
/// Encrypt-mode keys carry a newly drawn IV; decrypt-mode keys take the IV
/// from the presented ticket. Dropping the value discards both contexts.
pub struct TicketKeys {
    record: Arc<KeyRecord>,
    iv: Option<Vec<u8>>,
    cipher: CipherContext,
    mac: MacContext,
}

impl TicketKeys {
    pub fn for_encrypt(
        record: Arc<KeyRecord>,
        rng: &dyn RandomSource,
    ) -> Result<Self, TicketError> {
        let (cipher, mac) = contexts(&record)?;
        let mut iv = vec![0u8; cipher.iv_len()];
        rng.try_fill(&mut iv)?;
        Ok(Self {
            record,
            iv: Some(iv),
            cipher,
            mac,
        })
    }

    pub fn for_decrypt(record: Arc<KeyRecord>) -> Result<Self, TicketError> {
        let (cipher, mac) = contexts(&record)?;
        Ok(Self {
            record,
            iv: None,
            cipher,
            mac,
        })
    }

    pub fn key_name(&self) -> &KeyName {
        self.record.name()
    }

    pub fn iv(&self) -> Option<&[u8]> {
        self.iv.as_deref()
    }

    pub fn cipher(&self) -> &CipherContext {
        &self.cipher
    }

    pub fn mac(&self) -> &MacContext {
        &self.mac
    }

    pub fn record(&self) -> &Arc<KeyRecord> {
        &self.record
    }
}

fn contexts(record: &KeyRecord) -> Result<(CipherContext, MacContext), TicketError> {
    let cipher = CipherContext::new(record.cipher(), record.cipher_key())?;
    let mac = MacContext::new(record.digest(), record.mac_key())?;
    Ok((cipher, mac))
}

impl fmt::Debug for TicketKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TicketKeys")
            .field("key_name", self.key_name())
            .field("mode", &if self.iv.is_some() { "encrypt" } else { "decrypt" })
            .field("cipher", &self.cipher)
            .field("mac", &self.mac)
            .finish()
    }
}
