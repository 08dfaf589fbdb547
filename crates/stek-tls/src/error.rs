use stek_core::{EntropyError, StoreError};

/// Failures raised while building ticket keys, sealing or opening tickets.
///
/// Lookup-class variants are recoverable: the handshake simply does not
/// resume. They are deliberately reported to the peer the same way.
#[derive(Debug, thiserror::Error)]
pub enum TicketError {
    #[error("session tickets are misconfigured: {0}")]
    Configuration(String),
    #[error("ticket key not found")]
    KeyNotFound,
    #[error("ticket key expired")]
    KeyExpired,
    #[error("ticket integrity check failed")]
    TagMismatch,
    #[error("malformed session ticket")]
    Malformed,
    #[error("ticket decryption failed")]
    Decrypt,
    #[error("ticket encryption failed")]
    Encrypt,
    #[error("randomness unavailable: {0}")]
    RandomnessFailure(#[from] EntropyError),
    #[error("failed to initialise ticket crypto: {0}")]
    CryptoInit(String),
    #[error("key store error: {0}")]
    Store(#[source] StoreError),
}

impl From<StoreError> for TicketError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Entropy(err) => TicketError::RandomnessFailure(err),
            other => TicketError::Store(other),
        }
    }
}

impl TicketError {
    /// Errors that must abort the handshake.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            TicketError::RandomnessFailure(_)
                | TicketError::CryptoInit(_)
                | TicketError::Encrypt
                | TicketError::Store(StoreError::Entropy(_))
        )
    }

    /// Errors that collapse into a silent fallback to full negotiation.
    pub fn is_lookup_failure(&self) -> bool {
        match self {
            TicketError::KeyNotFound
            | TicketError::KeyExpired
            | TicketError::TagMismatch
            | TicketError::Malformed
            | TicketError::Decrypt => true,
            TicketError::Store(err) => !matches!(err, StoreError::Entropy(_)),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_failures_are_never_fatal() {
        let lookups = [
            TicketError::KeyNotFound,
            TicketError::KeyExpired,
            TicketError::TagMismatch,
            TicketError::Malformed,
            TicketError::Decrypt,
        ];
        for err in lookups {
            assert!(err.is_lookup_failure(), "{err}");
            assert!(!err.is_fatal(), "{err}");
        }
        assert!(TicketError::CryptoInit("bad key".into()).is_fatal());
        assert!(TicketError::RandomnessFailure(EntropyError::Source("empty".into())).is_fatal());
        assert!(!TicketError::Configuration("off".into()).is_lookup_failure());
    }

    #[test]
    fn store_randomness_failure_is_fatal() {
        let drained = || EntropyError::Source("drained".into());
        let err = TicketError::from(StoreError::Entropy(drained()));
        assert!(matches!(err, TicketError::RandomnessFailure(_)));
        assert!(err.is_fatal());
        assert!(!err.is_lookup_failure());

        let wrapped = TicketError::Store(StoreError::Entropy(drained()));
        assert!(wrapped.is_fatal());
        assert!(!wrapped.is_lookup_failure());

        let outage = TicketError::from(StoreError::Backend("offline".into()));
        assert!(matches!(outage, TicketError::Store(_)));
        assert!(outage.is_lookup_failure());
        assert!(!outage.is_fatal());
    }
}
