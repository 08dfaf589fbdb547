use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use stek_core::{Clock, KeyName, KeyStore, OsEntropy, RandomSource, StoreError, SystemClock};
use tracing::{debug, warn};

use crate::crypto::TicketKeys;
use crate::error::TicketError;
use crate::policy::RenewalPolicy;

/// Callback return code: established, and the ticket should be replaced.
pub const CODE_RENEW: i32 = 2;
/// Callback return code: established.
pub const CODE_ESTABLISHED: i32 = 1;
/// Callback return code: no usable key, continue without ticket resumption.
pub const CODE_FALLBACK: i32 = 0;
/// Callback return code: abort the handshake.
pub const CODE_ERROR: i32 = -1;

/// Connection metadata passed through to the callback, used for logging.
#[derive(Debug, Clone, Default)]
pub struct ConnectionInfo {
    pub peer: Option<SocketAddr>,
    pub server_name: Option<String>,
}

impl ConnectionInfo {
    pub fn new(peer: SocketAddr) -> Self {
        Self {
            peer: Some(peer),
            server_name: None,
        }
    }

    pub fn with_server_name(mut self, name: impl Into<String>) -> Self {
        self.server_name = Some(name.into());
        self
    }
}

/// What the handshake engine needs keys for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TicketKeyRequest {
    /// Issue a new ticket: pick a key and draw a fresh IV.
    Encrypt,
    /// Open a presented ticket carrying `key_name`.
    Decrypt { key_name: KeyName },
}

/// Result of one callback invocation.
pub enum CallbackOutcome {
    Established(TicketKeys),
    EstablishedAndRenew(TicketKeys),
    Fallback,
    Error(TicketError),
}

impl CallbackOutcome {
    pub fn code(&self) -> i32 {
        match self {
            CallbackOutcome::EstablishedAndRenew(_) => CODE_RENEW,
            CallbackOutcome::Established(_) => CODE_ESTABLISHED,
            CallbackOutcome::Fallback => CODE_FALLBACK,
            CallbackOutcome::Error(_) => CODE_ERROR,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            CallbackOutcome::EstablishedAndRenew(_) => "established+renew",
            CallbackOutcome::Established(_) => "established",
            CallbackOutcome::Fallback => "fallback",
            CallbackOutcome::Error(_) => "error",
        }
    }

    pub fn keys(&self) -> Option<&TicketKeys> {
        match self {
            CallbackOutcome::Established(keys) | CallbackOutcome::EstablishedAndRenew(keys) => {
                Some(keys)
            }
            _ => None,
        }
    }
}

impl fmt::Debug for CallbackOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallbackOutcome::Established(keys) => {
                f.debug_tuple("Established").field(keys.key_name()).finish()
            }
            CallbackOutcome::EstablishedAndRenew(keys) => f
                .debug_tuple("EstablishedAndRenew")
                .field(keys.key_name())
                .finish(),
            CallbackOutcome::Fallback => f.write_str("Fallback"),
            CallbackOutcome::Error(err) => f.debug_tuple("Error").field(err).finish(),
        }
    }
}

/// Hook the handshake engine calls when it issues or receives a ticket.
///
/// Each call returns freshly built contexts. An invocation abandoned midway
/// (the handshake aborts) simply drops them.
#[async_trait]
pub trait TicketKeyCallback: Send + Sync + fmt::Debug {
    async fn invoke(&self, conn: &ConnectionInfo, request: TicketKeyRequest) -> CallbackOutcome;
}

/// Default callback resolving keys through an injected [`KeyStore`].
pub struct TicketKeyDispatcher {
    store: Arc<dyn KeyStore>,
    renewal: RenewalPolicy,
    clock: Arc<dyn Clock>,
    entropy: Arc<dyn RandomSource>,
}

impl TicketKeyDispatcher {
    pub fn new(store: Arc<dyn KeyStore>, renewal: RenewalPolicy) -> Self {
        Self {
            store,
            renewal,
            clock: Arc::new(SystemClock),
            entropy: Arc::new(OsEntropy),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_entropy(mut self, entropy: Arc<dyn RandomSource>) -> Self {
        self.entropy = entropy;
        self
    }

    pub fn renewal(&self) -> RenewalPolicy {
        self.renewal
    }

    async fn encrypt_keys(&self, conn: &ConnectionInfo) -> CallbackOutcome {
        let record = match self.store.current().await {
            Ok(Some(record)) => record,
            Ok(None) => {
                debug!(target: "stek::dispatcher", peer = ?conn.peer, "no current ticket key");
                return CallbackOutcome::Fallback;
            }
            Err(err) => return self.store_failure(conn, err),
        };
        if record.is_expired(self.clock.now()) {
            debug!(target: "stek::dispatcher", key_name = %record.name(), "store returned an expired key");
            return CallbackOutcome::Fallback;
        }
        match TicketKeys::for_encrypt(record, self.entropy.as_ref()) {
            Ok(keys) => CallbackOutcome::Established(keys),
            Err(err) => {
                warn!(target: "stek::dispatcher", peer = ?conn.peer, error = %err, "cannot build ticket encryption keys");
                CallbackOutcome::Error(err)
            }
        }
    }

    async fn decrypt_keys(&self, conn: &ConnectionInfo, key_name: &KeyName) -> CallbackOutcome {
        let record = match self.store.lookup(key_name).await {
            Ok(Some(record)) => record,
            Ok(None) => return self.not_accepted(conn, TicketError::KeyNotFound),
            Err(err) => return self.store_failure(conn, err),
        };
        let now = self.clock.now();
        if record.is_expired(now) {
            return self.not_accepted(conn, TicketError::KeyExpired);
        }
        let renew = self.renewal.is_due(&record, now);
        match TicketKeys::for_decrypt(record) {
            Ok(keys) if renew => CallbackOutcome::EstablishedAndRenew(keys),
            Ok(keys) => CallbackOutcome::Established(keys),
            Err(err) => {
                warn!(target: "stek::dispatcher", key_name = %key_name, error = %err, "cannot build ticket decryption keys");
                CallbackOutcome::Error(err)
            }
        }
    }

    fn store_failure(&self, conn: &ConnectionInfo, err: StoreError) -> CallbackOutcome {
        let err = TicketError::from(err);
        if err.is_fatal() {
            warn!(target: "stek::dispatcher", peer = ?conn.peer, error = %err, "key store cannot mint a ticket key");
            return CallbackOutcome::Error(err);
        }
        self.not_accepted(conn, err)
    }

    fn not_accepted(&self, conn: &ConnectionInfo, reason: TicketError) -> CallbackOutcome {
        debug!(target: "stek::dispatcher", peer = ?conn.peer, reason = %reason, "ticket not accepted");
        CallbackOutcome::Fallback
    }
}

#[async_trait]
impl TicketKeyCallback for TicketKeyDispatcher {
    async fn invoke(&self, conn: &ConnectionInfo, request: TicketKeyRequest) -> CallbackOutcome {
        match request {
            TicketKeyRequest::Encrypt => self.encrypt_keys(conn).await,
            TicketKeyRequest::Decrypt { key_name } => self.decrypt_keys(conn, &key_name).await,
        }
    }
}

impl fmt::Debug for TicketKeyDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TicketKeyDispatcher")
            .field("store", &self.store)
            .field("renewal", &self.renewal)
            .field("clock", &self.clock)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use stek_core::{
        from_unix, CipherAlgorithm, DigestAlgorithm, EntropyError, InMemoryKeyStore, KeyRecord,
        ManualClock, RotationPolicy,
    };

    #[derive(Debug)]
    struct FixedStore(Arc<KeyRecord>);

    #[async_trait]
    impl KeyStore for FixedStore {
        async fn lookup(&self, _name: &KeyName) -> Result<Option<Arc<KeyRecord>>, StoreError> {
            Ok(Some(Arc::clone(&self.0)))
        }

        async fn current(&self) -> Result<Option<Arc<KeyRecord>>, StoreError> {
            Ok(Some(Arc::clone(&self.0)))
        }
    }

    #[derive(Debug)]
    struct BrokenStore;

    #[async_trait]
    impl KeyStore for BrokenStore {
        async fn lookup(&self, _name: &KeyName) -> Result<Option<Arc<KeyRecord>>, StoreError> {
            Err(StoreError::Backend("secret service unreachable".into()))
        }

        async fn current(&self) -> Result<Option<Arc<KeyRecord>>, StoreError> {
            Err(StoreError::Backend("secret service unreachable".into()))
        }
    }

    struct EmptyEntropy;

    impl RandomSource for EmptyEntropy {
        fn try_fill(&self, _buf: &mut [u8]) -> Result<(), EntropyError> {
            Err(EntropyError::Source("drained".into()))
        }
    }

    fn rotating(clock: Arc<ManualClock>) -> (Arc<InMemoryKeyStore>, TicketKeyDispatcher) {
        let policy = RotationPolicy::default()
            .with_lifetime(Duration::from_secs(3600))
            .with_rotate_before_expiry(Duration::from_secs(300))
            .with_algorithms(CipherAlgorithm::Aes256Gcm, DigestAlgorithm::Sha256);
        let store = Arc::new(InMemoryKeyStore::new(
            policy,
            clock.clone(),
            Arc::new(OsEntropy),
        ));
        let dispatcher =
            TicketKeyDispatcher::new(store.clone(), RenewalPolicy::new(Duration::from_secs(300)))
                .with_clock(clock);
        (store, dispatcher)
    }

    #[tokio::test]
    async fn encrypt_request_yields_keys_with_fresh_iv() {
        let clock = Arc::new(ManualClock::at(0));
        let (store, dispatcher) = rotating(clock);
        let outcome = dispatcher
            .invoke(&ConnectionInfo::default(), TicketKeyRequest::Encrypt)
            .await;
        assert_eq!(outcome.code(), CODE_ESTABLISHED);
        let keys = outcome.keys().expect("keys");
        assert_eq!(keys.iv().map(<[u8]>::len), Some(12));
        let current = store.current_record().expect("current").expect("record");
        assert_eq!(keys.key_name(), current.name());
    }

    #[tokio::test]
    async fn unknown_key_name_falls_back() {
        let clock = Arc::new(ManualClock::at(0));
        let (_store, dispatcher) = rotating(clock);
        let outcome = dispatcher
            .invoke(
                &ConnectionInfo::default(),
                TicketKeyRequest::Decrypt {
                    key_name: KeyName::new([0x42; 16]),
                },
            )
            .await;
        assert!(matches!(outcome, CallbackOutcome::Fallback));
        assert_eq!(outcome.code(), CODE_FALLBACK);
    }

    #[tokio::test]
    async fn decrypt_outcome_tracks_expiry_and_renewal() {
        let clock = Arc::new(ManualClock::at(0));
        let (store, dispatcher) = rotating(clock.clone());
        let name = *store.current_record().expect("current").expect("record").name();
        let request = TicketKeyRequest::Decrypt { key_name: name };
        let conn = ConnectionInfo::default();

        assert_eq!(dispatcher.invoke(&conn, request).await.code(), CODE_ESTABLISHED);
        clock.set(3299);
        assert_eq!(dispatcher.invoke(&conn, request).await.code(), CODE_ESTABLISHED);
        clock.set(3300);
        assert_eq!(dispatcher.invoke(&conn, request).await.code(), CODE_RENEW);
        clock.set(3599);
        assert_eq!(dispatcher.invoke(&conn, request).await.code(), CODE_RENEW);
        clock.set(3600);
        assert_eq!(dispatcher.invoke(&conn, request).await.code(), CODE_FALLBACK);
    }

    #[tokio::test]
    async fn bad_key_length_is_fatal() {
        let record = KeyRecord::new(
            KeyName::new([7u8; 16]),
            CipherAlgorithm::Aes256Gcm,
            DigestAlgorithm::Sha256,
            vec![1u8; 20],
            vec![2u8; 32],
            from_unix(0),
            from_unix(3600),
        );
        let dispatcher = TicketKeyDispatcher::new(
            Arc::new(FixedStore(Arc::new(record))),
            RenewalPolicy::default(),
        )
        .with_clock(Arc::new(ManualClock::at(10)));
        let conn = ConnectionInfo::default();

        let outcome = dispatcher.invoke(&conn, TicketKeyRequest::Encrypt).await;
        assert!(matches!(outcome, CallbackOutcome::Error(TicketError::CryptoInit(_))));
        assert!(outcome.code() < 0);

        let outcome = dispatcher
            .invoke(
                &conn,
                TicketKeyRequest::Decrypt {
                    key_name: KeyName::new([7u8; 16]),
                },
            )
            .await;
        assert!(outcome.code() < 0);
    }

    #[tokio::test]
    async fn store_outage_falls_back() {
        let dispatcher = TicketKeyDispatcher::new(Arc::new(BrokenStore), RenewalPolicy::default());
        let conn = ConnectionInfo::default();
        assert_eq!(
            dispatcher.invoke(&conn, TicketKeyRequest::Encrypt).await.code(),
            CODE_FALLBACK
        );
        let request = TicketKeyRequest::Decrypt {
            key_name: KeyName::new([1u8; 16]),
        };
        assert_eq!(dispatcher.invoke(&conn, request).await.code(), CODE_FALLBACK);
    }

    #[tokio::test]
    async fn drained_entropy_aborts_issuance() {
        let clock = Arc::new(ManualClock::at(0));
        let (store, dispatcher) = rotating(clock);
        store.current_record().expect("current");
        let dispatcher = dispatcher.with_entropy(Arc::new(EmptyEntropy));
        let outcome = dispatcher
            .invoke(&ConnectionInfo::default(), TicketKeyRequest::Encrypt)
            .await;
        assert!(matches!(
            outcome,
            CallbackOutcome::Error(TicketError::RandomnessFailure(_))
        ));
    }

    #[tokio::test]
    async fn store_that_cannot_mint_aborts_issuance() {
        let clock = Arc::new(ManualClock::at(0));
        let store = Arc::new(InMemoryKeyStore::new(
            RotationPolicy::default(),
            clock.clone(),
            Arc::new(EmptyEntropy),
        ));
        let dispatcher = TicketKeyDispatcher::new(store.clone(), RenewalPolicy::default())
            .with_clock(clock)
            .with_entropy(Arc::new(EmptyEntropy));
        let outcome = dispatcher
            .invoke(&ConnectionInfo::default(), TicketKeyRequest::Encrypt)
            .await;
        assert_eq!(outcome.code(), CODE_ERROR);
        match outcome {
            CallbackOutcome::Error(err) => {
                assert!(matches!(err, TicketError::RandomnessFailure(_)));
                assert!(err.is_fatal());
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert!(store.records().is_empty());
    }
}
