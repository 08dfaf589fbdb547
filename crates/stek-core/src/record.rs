use std::fmt;
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::entropy::{EntropyError, RandomSource};

/// Length of the key name that prefixes every ticket.
pub const KEY_NAME_LEN: usize = 16;

/// Largest IV any supported cipher asks for.
pub const MAX_IV_LEN: usize = 24;

/// Shortest MAC key accepted when building a MAC context.
pub const MIN_MAC_KEY_LEN: usize = 16;

#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
cpufeatures::new!(aes_hw, "aes", "pclmulqdq");

/// 16-byte identifier naming a ticket key record.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KeyName([u8; KEY_NAME_LEN]);

impl KeyName {
    pub const fn new(bytes: [u8; KEY_NAME_LEN]) -> Self {
        Self(bytes)
    }

    /// Reads a key name from the first 16 bytes of `bytes`.
    pub fn from_prefix(bytes: &[u8]) -> Option<Self> {
        let prefix = bytes.get(..KEY_NAME_LEN)?;
        let mut name = [0u8; KEY_NAME_LEN];
        name.copy_from_slice(prefix);
        Some(Self(name))
    }

    pub fn random(rng: &dyn RandomSource) -> Result<Self, EntropyError> {
        let mut name = [0u8; KEY_NAME_LEN];
        rng.try_fill(&mut name)?;
        Ok(Self(name))
    }

    pub fn as_bytes(&self) -> &[u8; KEY_NAME_LEN] {
        &self.0
    }
}

impl fmt::Display for KeyName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for KeyName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyName({self})")
    }
}

/// Ticket cipher bound to a key record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CipherAlgorithm {
    #[serde(rename = "aes-128-gcm")]
    Aes128Gcm,
    #[serde(rename = "aes-256-gcm")]
    Aes256Gcm,
    #[serde(rename = "chacha20-poly1305")]
    ChaCha20Poly1305,
    #[serde(rename = "xchacha20-poly1305")]
    XChaCha20Poly1305,
}

impl CipherAlgorithm {
    pub const fn key_len(self) -> usize {
        match self {
            CipherAlgorithm::Aes128Gcm => 16,
            CipherAlgorithm::Aes256Gcm
            | CipherAlgorithm::ChaCha20Poly1305
            | CipherAlgorithm::XChaCha20Poly1305 => 32,
        }
    }

    pub const fn iv_len(self) -> usize {
        match self {
            CipherAlgorithm::XChaCha20Poly1305 => 24,
            _ => 12,
        }
    }

    pub const fn label(self) -> &'static str {
        match self {
            CipherAlgorithm::Aes128Gcm => "aes-128-gcm",
            CipherAlgorithm::Aes256Gcm => "aes-256-gcm",
            CipherAlgorithm::ChaCha20Poly1305 => "chacha20-poly1305",
            CipherAlgorithm::XChaCha20Poly1305 => "xchacha20-poly1305",
        }
    }

    /// AES-256-GCM when the CPU has AES instructions, ChaCha20-Poly1305 otherwise.
    pub fn preferred() -> Self {
        if supports_aes_gcm() {
            CipherAlgorithm::Aes256Gcm
        } else {
            CipherAlgorithm::ChaCha20Poly1305
        }
    }
}

fn supports_aes_gcm() -> bool {
    #[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
    {
        aes_hw::get()
    }
    #[cfg(not(any(target_arch = "x86", target_arch = "x86_64")))]
    {
        false
    }
}

/// Digest used for the HMAC tag appended to each ticket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum DigestAlgorithm {
    #[default]
    Sha256,
    Sha384,
    Sha512,
    #[serde(rename = "sha3-256")]
    Sha3_256,
}

impl DigestAlgorithm {
    pub const fn output_len(self) -> usize {
        match self {
            DigestAlgorithm::Sha256 | DigestAlgorithm::Sha3_256 => 32,
            DigestAlgorithm::Sha384 => 48,
            DigestAlgorithm::Sha512 => 64,
        }
    }

    pub const fn label(self) -> &'static str {
        match self {
            DigestAlgorithm::Sha256 => "sha256",
            DigestAlgorithm::Sha384 => "sha384",
            DigestAlgorithm::Sha512 => "sha512",
            DigestAlgorithm::Sha3_256 => "sha3-256",
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RecordError {
    #[error("{cipher} expects a {expected}-byte key, got {actual}")]
    CipherKeyLength {
        cipher: &'static str,
        expected: usize,
        actual: usize,
    },
    #[error("mac key must be at least 16 bytes, got {0}")]
    MacKeyLength(usize),
    #[error("key record expires before it is created")]
    Lifetime,
}

/// Named symmetric key material used to protect session tickets.
///
/// Records are never edited after construction: rotation publishes a new
/// record and leaves older ones resolvable until they are retired.
pub struct KeyRecord {
    name: KeyName,
    cipher: CipherAlgorithm,
    digest: DigestAlgorithm,
    cipher_key: Zeroizing<Vec<u8>>,
    mac_key: Zeroizing<Vec<u8>>,
    created_at: SystemTime,
    expires_at: SystemTime,
}

impl KeyRecord {
    /// Wraps caller-supplied key material. Key lengths are checked when the
    /// record is turned into cipher/MAC contexts, or eagerly via
    /// [`KeyRecord::check`].
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: KeyName,
        cipher: CipherAlgorithm,
        digest: DigestAlgorithm,
        cipher_key: Vec<u8>,
        mac_key: Vec<u8>,
        created_at: SystemTime,
        expires_at: SystemTime,
    ) -> Self {
        Self {
            name,
            cipher,
            digest,
            cipher_key: Zeroizing::new(cipher_key),
            mac_key: Zeroizing::new(mac_key),
            created_at,
            expires_at,
        }
    }

    /// Draws a fresh name and fresh key material from `rng`.
    pub fn generate(
        rng: &dyn RandomSource,
        cipher: CipherAlgorithm,
        digest: DigestAlgorithm,
        created_at: SystemTime,
        lifetime: Duration,
    ) -> Result<Self, EntropyError> {
        let name = KeyName::random(rng)?;
        Self::generate_named(rng, name, cipher, digest, created_at, lifetime)
    }

    pub(crate) fn generate_named(
        rng: &dyn RandomSource,
        name: KeyName,
        cipher: CipherAlgorithm,
        digest: DigestAlgorithm,
        created_at: SystemTime,
        lifetime: Duration,
    ) -> Result<Self, EntropyError> {
        let mut cipher_key = vec![0u8; cipher.key_len()];
        rng.try_fill(&mut cipher_key)?;
        let mut mac_key = vec![0u8; digest.output_len()];
        rng.try_fill(&mut mac_key)?;
        Ok(Self::new(
            name,
            cipher,
            digest,
            cipher_key,
            mac_key,
            created_at,
            created_at + lifetime,
        ))
    }

    pub fn check(&self) -> Result<(), RecordError> {
        if self.cipher_key.len() != self.cipher.key_len() {
            return Err(RecordError::CipherKeyLength {
                cipher: self.cipher.label(),
                expected: self.cipher.key_len(),
                actual: self.cipher_key.len(),
            });
        }
        if self.mac_key.len() < MIN_MAC_KEY_LEN {
            return Err(RecordError::MacKeyLength(self.mac_key.len()));
        }
        if self.expires_at <= self.created_at {
            return Err(RecordError::Lifetime);
        }
        Ok(())
    }

    pub fn name(&self) -> &KeyName {
        &self.name
    }

    pub fn cipher(&self) -> CipherAlgorithm {
        self.cipher
    }

    pub fn digest(&self) -> DigestAlgorithm {
        self.digest
    }

    pub fn cipher_key(&self) -> &[u8] {
        &self.cipher_key
    }

    pub fn mac_key(&self) -> &[u8] {
        &self.mac_key
    }

    pub fn created_at(&self) -> SystemTime {
        self.created_at
    }

    pub fn expires_at(&self) -> SystemTime {
        self.expires_at
    }

    /// A record whose expiry equals `now` is already expired.
    pub fn is_expired(&self, now: SystemTime) -> bool {
        now >= self.expires_at
    }

    /// True once `now` has entered the last `window` before expiry.
    pub fn within(&self, window: Duration, now: SystemTime) -> bool {
        let boundary = self
            .expires_at
            .checked_sub(window)
            .unwrap_or(SystemTime::UNIX_EPOCH);
        now >= boundary
    }
}

impl fmt::Debug for KeyRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyRecord")
            .field("name", &self.name)
            .field("cipher", &self.cipher.label())
            .field("digest", &self.digest.label())
            .field("created_at", &self.created_at)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entropy::OsEntropy;
    use std::time::UNIX_EPOCH;

    fn at(secs: u64) -> SystemTime {
        UNIX_EPOCH + Duration::from_secs(secs)
    }

    #[test]
    fn expiry_boundary_is_inclusive() {
        let record = KeyRecord::generate(
            &OsEntropy,
            CipherAlgorithm::Aes256Gcm,
            DigestAlgorithm::Sha256,
            at(0),
            Duration::from_secs(3600),
        )
        .expect("generate");
        assert!(!record.is_expired(at(3599)));
        assert!(record.is_expired(at(3600)));
        assert!(record.is_expired(at(3601)));
    }

    #[test]
    fn renewal_window_starts_at_threshold() {
        let record = KeyRecord::generate(
            &OsEntropy,
            CipherAlgorithm::ChaCha20Poly1305,
            DigestAlgorithm::Sha384,
            at(0),
            Duration::from_secs(3600),
        )
        .expect("generate");
        let window = Duration::from_secs(300);
        assert!(!record.within(window, at(3299)));
        assert!(record.within(window, at(3300)));
        assert!(record.within(window, at(3400)));
    }

    #[test]
    fn generated_material_matches_algorithms() {
        let record = KeyRecord::generate(
            &OsEntropy,
            CipherAlgorithm::Aes128Gcm,
            DigestAlgorithm::Sha512,
            at(10),
            Duration::from_secs(60),
        )
        .expect("generate");
        assert_eq!(record.cipher_key().len(), 16);
        assert_eq!(record.mac_key().len(), 64);
        assert_eq!(record.check(), Ok(()));
    }

    #[test]
    fn check_rejects_short_keys() {
        let record = KeyRecord::new(
            KeyName::new([1u8; KEY_NAME_LEN]),
            CipherAlgorithm::Aes256Gcm,
            DigestAlgorithm::Sha256,
            vec![0u8; 16],
            vec![0u8; 32],
            at(0),
            at(60),
        );
        assert!(matches!(
            record.check(),
            Err(RecordError::CipherKeyLength { expected: 32, actual: 16, .. })
        ));
    }

    #[test]
    fn key_name_renders_hex() {
        let mut bytes = [0u8; KEY_NAME_LEN];
        bytes[0] = 0xab;
        bytes[15] = 0x01;
        let name = KeyName::new(bytes);
        assert_eq!(name.to_string(), "ab000000000000000000000000000001");
        assert_eq!(KeyName::from_prefix(&bytes[..8]), None);
    }
}
