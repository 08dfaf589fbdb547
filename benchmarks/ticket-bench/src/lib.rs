//! Shared fixtures for the ticket benchmarks.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use stek_core::{CipherAlgorithm, DigestAlgorithm, KeyRecord, OsEntropy};

/// Roughly the size of a TLS 1.3 resumption state with a short ALPN.
pub const STATE_LEN: usize = 180;

pub const CIPHERS: [CipherAlgorithm; 4] = [
    CipherAlgorithm::Aes128Gcm,
    CipherAlgorithm::Aes256Gcm,
    CipherAlgorithm::ChaCha20Poly1305,
    CipherAlgorithm::XChaCha20Poly1305,
];

pub fn bench_record(cipher: CipherAlgorithm) -> Arc<KeyRecord> {
    let record = KeyRecord::generate(
        &OsEntropy,
        cipher,
        DigestAlgorithm::Sha256,
        SystemTime::now(),
        Duration::from_secs(3600),
    )
    .unwrap_or_else(|err| panic!("benchmark key generation failed: {err}"));
    Arc::new(record)
}
