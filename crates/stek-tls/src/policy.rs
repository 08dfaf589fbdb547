use std::time::{Duration, SystemTime};

use stek_core::KeyRecord;

/// Decides when a ticket that still decrypts should be reissued under a newer key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenewalPolicy {
    threshold: Duration,
}

impl RenewalPolicy {
    pub const fn new(threshold: Duration) -> Self {
        Self { threshold }
    }

    /// Never asks for renewal; tickets are only replaced after their key expires.
    pub const fn never() -> Self {
        Self {
            threshold: Duration::ZERO,
        }
    }

    pub fn threshold(&self) -> Duration {
        self.threshold
    }

    /// `now >= expires_at - threshold`.
    pub fn is_due(&self, record: &KeyRecord, now: SystemTime) -> bool {
        !self.threshold.is_zero() && record.within(self.threshold, now)
    }
}

impl Default for RenewalPolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(60 * 60))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stek_core::{from_unix, CipherAlgorithm, DigestAlgorithm, OsEntropy};

    fn record() -> KeyRecord {
        KeyRecord::generate(
            &OsEntropy,
            CipherAlgorithm::Aes256Gcm,
            DigestAlgorithm::Sha256,
            from_unix(0),
            Duration::from_secs(3600),
        )
        .expect("generate")
    }

    #[test]
    fn due_from_threshold_onwards() {
        let policy = RenewalPolicy::new(Duration::from_secs(300));
        let record = record();
        assert!(!policy.is_due(&record, from_unix(0)));
        assert!(!policy.is_due(&record, from_unix(3299)));
        assert!(policy.is_due(&record, from_unix(3300)));
        assert!(policy.is_due(&record, from_unix(3400)));
    }

    #[test]
    fn threshold_longer_than_lifetime_is_always_due() {
        let policy = RenewalPolicy::new(Duration::from_secs(7200));
        assert!(policy.is_due(&record(), from_unix(0)));
    }

    #[test]
    fn never_policy_does_not_renew() {
        let record = record();
        assert!(!RenewalPolicy::never().is_due(&record, from_unix(3599)));
    }
}
