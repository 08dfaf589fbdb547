use parking_lot::Mutex;
use rand::{rngs::OsRng, RngCore, SeedableRng};
use rand_chacha::ChaCha20Rng;
use sha3::{Digest, Sha3_512};
use std::fmt;
use std::time::{Duration, Instant, SystemTime};

/// Raised when a source cannot supply the requested bytes.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum EntropyError {
    #[error("entropy source failed: {0}")]
    Source(String),
}

/// Fallible randomness used for key names, key material and ticket IVs.
pub trait RandomSource: Send + Sync {
    fn try_fill(&self, buf: &mut [u8]) -> Result<(), EntropyError>;
}

/// Reads straight from the operating system RNG.
#[derive(Debug, Default, Clone, Copy)]
pub struct OsEntropy;

impl RandomSource for OsEntropy {
    fn try_fill(&self, buf: &mut [u8]) -> Result<(), EntropyError> {
        OsRng
            .try_fill_bytes(buf)
            .map_err(|err| EntropyError::Source(err.to_string()))
    }
}

const DEFAULT_RESEED_INTERVAL: Duration = Duration::from_millis(250);

struct Mixer {
    rng: ChaCha20Rng,
    last_reseed: Instant,
    interval: Duration,
}

impl Mixer {
    fn seeded(interval: Duration) -> Result<Self, EntropyError> {
        let mut seed = [0u8; 32];
        OsEntropy.try_fill(&mut seed)?;
        Ok(Self {
            rng: ChaCha20Rng::from_seed(seed),
            last_reseed: Instant::now(),
            interval,
        })
    }

    fn reseed_if_needed(&mut self) -> Result<(), EntropyError> {
        let elapsed = self.last_reseed.elapsed();
        if elapsed <= self.interval {
            return Ok(());
        }
        // Fold fresh OS bytes, wall-clock time and the DRBG's own output into the next seed.
        let mut fresh = [0u8; 64];
        OsEntropy.try_fill(&mut fresh)?;
        let mut carry = [0u8; 32];
        self.rng.fill_bytes(&mut carry);
        let nanos = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default();

        let mut hasher = Sha3_512::new();
        hasher.update(fresh);
        hasher.update(carry);
        hasher.update(nanos.to_le_bytes());
        hasher.update(elapsed.as_nanos().to_le_bytes());
        let digest = hasher.finalize();
        let mut seed = [0u8; 32];
        seed.copy_from_slice(&digest[..32]);
        self.rng = ChaCha20Rng::from_seed(seed);
        self.last_reseed = Instant::now();
        Ok(())
    }
}

/// ChaCha20 DRBG that periodically reseeds itself from the OS.
///
/// Useful when IV generation sits on a hot handshake path and OS RNG calls
/// are comparatively expensive. Reseeding failures surface as errors rather
/// than silently continuing on stale state.
pub struct ReseedingEntropy {
    mixer: Mutex<Mixer>,
}

impl ReseedingEntropy {
    pub fn new() -> Result<Self, EntropyError> {
        Self::with_interval(DEFAULT_RESEED_INTERVAL)
    }

    pub fn with_interval(interval: Duration) -> Result<Self, EntropyError> {
        Ok(Self {
            mixer: Mutex::new(Mixer::seeded(interval)?),
        })
    }
}

impl RandomSource for ReseedingEntropy {
    fn try_fill(&self, buf: &mut [u8]) -> Result<(), EntropyError> {
        let mut mixer = self.mixer.lock();
        mixer.reseed_if_needed()?;
        mixer.rng.fill_bytes(buf);
        Ok(())
    }
}

impl fmt::Debug for ReseedingEntropy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReseedingEntropy")
            .field("interval", &self.mixer.lock().interval)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn os_entropy_fills_buffer() {
        let mut a = [0u8; 32];
        let mut b = [0u8; 32];
        OsEntropy.try_fill(&mut a).expect("fill a");
        OsEntropy.try_fill(&mut b).expect("fill b");
        assert_ne!(a, b);
    }

    #[test]
    fn reseeding_source_keeps_producing_distinct_output() {
        let source = ReseedingEntropy::with_interval(Duration::ZERO).expect("seed");
        let mut first = [0u8; 24];
        let mut second = [0u8; 24];
        source.try_fill(&mut first).expect("first");
        std::thread::sleep(Duration::from_millis(1));
        source.try_fill(&mut second).expect("second");
        assert_ne!(first, second);
    }
}
