use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use parking_lot::{RwLock, RwLockUpgradableReadGuard};
use tracing::{debug, info};

use crate::clock::Clock;
use crate::entropy::{EntropyError, RandomSource};
use crate::record::{CipherAlgorithm, DigestAlgorithm, KeyName, KeyRecord, RecordError};

const NAME_ATTEMPTS: usize = 4;

/// Errors raised by key record stores.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("key {0} is already present in the store")]
    Duplicate(KeyName),
    #[error("key {0} was retired and cannot be reused")]
    Retired(KeyName),
    #[error("entropy unavailable while minting a key: {0}")]
    Entropy(#[from] EntropyError),
    #[error("key record rejected: {0}")]
    Record(#[from] RecordError),
    #[error("key store backend error: {0}")]
    Backend(String),
}

/// Application-owned source of ticket key records.
///
/// Both methods are called concurrently from every in-flight handshake.
/// Implementations backed by remote secret stores may suspend; they must not
/// block the executor thread while doing so.
#[async_trait]
pub trait KeyStore: Send + Sync + fmt::Debug {
    /// Resolves a record by the name carried in a presented ticket.
    async fn lookup(&self, name: &KeyName) -> Result<Option<Arc<KeyRecord>>, StoreError>;

    /// Returns the record new tickets should be issued under, creating one
    /// when the rotation policy asks for it.
    async fn current(&self) -> Result<Option<Arc<KeyRecord>>, StoreError>;
}

/// When and how [`InMemoryKeyStore`] mints replacement keys.
#[derive(Debug, Clone)]
pub struct RotationPolicy {
    pub key_lifetime: Duration,
    /// The current key stops being used for new tickets this long before it expires.
    pub rotate_before_expiry: Duration,
    pub cipher: CipherAlgorithm,
    pub digest: DigestAlgorithm,
    /// Mint keys lazily from `current()`. When false only inserted records are used.
    pub auto_generate: bool,
}

impl Default for RotationPolicy {
    fn default() -> Self {
        Self {
            key_lifetime: Duration::from_secs(12 * 60 * 60),
            rotate_before_expiry: Duration::from_secs(60 * 60),
            cipher: CipherAlgorithm::preferred(),
            digest: DigestAlgorithm::Sha256,
            auto_generate: true,
        }
    }
}

impl RotationPolicy {
    pub fn with_lifetime(mut self, lifetime: Duration) -> Self {
        self.key_lifetime = lifetime;
        self
    }

    pub fn with_rotate_before_expiry(mut self, window: Duration) -> Self {
        self.rotate_before_expiry = window;
        self
    }

    pub fn with_algorithms(mut self, cipher: CipherAlgorithm, digest: DigestAlgorithm) -> Self {
        self.cipher = cipher;
        self.digest = digest;
        self
    }

    pub fn manual(mut self) -> Self {
        self.auto_generate = false;
        self
    }
}

#[derive(Debug, Default)]
struct StoreState {
    records: HashMap<KeyName, Arc<KeyRecord>>,
    current: Option<KeyName>,
    retired: HashSet<KeyName>,
}

impl StoreState {
    fn current_record(&self) -> Option<&Arc<KeyRecord>> {
        self.current.as_ref().and_then(|name| self.records.get(name))
    }

    /// The current record if it may still be handed out for new tickets.
    fn issuable(&self, policy: &RotationPolicy, now: SystemTime) -> Option<Arc<KeyRecord>> {
        let record = self.current_record()?;
        if record.is_expired(now) {
            return None;
        }
        if policy.auto_generate && record.within(policy.rotate_before_expiry, now) {
            return None;
        }
        Some(Arc::clone(record))
    }

    fn admit(&self, name: &KeyName) -> Result<(), StoreError> {
        if self.retired.contains(name) {
            return Err(StoreError::Retired(*name));
        }
        if self.records.contains_key(name) {
            return Err(StoreError::Duplicate(*name));
        }
        Ok(())
    }

    fn publish(&mut self, record: Arc<KeyRecord>, make_current: bool) {
        let name = *record.name();
        self.records.insert(name, record);
        if make_current {
            self.current = Some(name);
        }
    }
}

/// Process-wide key store holding every resolvable record in memory.
///
/// Readers share a read lock. Rotation goes through an upgradable read so a
/// single writer publishes the replacement and every concurrent caller that
/// lost the race returns the winner's record.
pub struct InMemoryKeyStore {
    state: RwLock<StoreState>,
    policy: RotationPolicy,
    clock: Arc<dyn Clock>,
    entropy: Arc<dyn RandomSource>,
}

impl InMemoryKeyStore {
    pub fn new(
        policy: RotationPolicy,
        clock: Arc<dyn Clock>,
        entropy: Arc<dyn RandomSource>,
    ) -> Self {
        Self {
            state: RwLock::new(StoreState::default()),
            policy,
            clock,
            entropy,
        }
    }

    /// Builds a store from previously persisted records. The newest record
    /// that has not expired becomes current.
    pub fn from_records(
        policy: RotationPolicy,
        clock: Arc<dyn Clock>,
        entropy: Arc<dyn RandomSource>,
        records: impl IntoIterator<Item = KeyRecord>,
    ) -> Result<Self, StoreError> {
        let store = Self::new(policy, clock, entropy);
        let now = store.clock.now();
        let mut newest: Option<(SystemTime, KeyName)> = None;
        for record in records {
            let created = record.created_at();
            let live = !record.is_expired(now);
            let inserted = store.insert(record)?;
            if live && newest.map_or(true, |(at, _)| created > at) {
                newest = Some((created, *inserted.name()));
            }
        }
        if let Some((_, name)) = newest {
            store.state.write().current = Some(name);
        }
        Ok(store)
    }

    pub fn policy(&self) -> &RotationPolicy {
        &self.policy
    }

    pub fn lookup_record(&self, name: &KeyName) -> Option<Arc<KeyRecord>> {
        self.state.read().records.get(name).cloned()
    }

    pub fn current_record(&self) -> Result<Option<Arc<KeyRecord>>, StoreError> {
        let now = self.clock.now();
        if let Some(record) = self.state.read().issuable(&self.policy, now) {
            return Ok(Some(record));
        }

        let state = self.state.upgradable_read();
        // Another caller may have rotated while we waited for the upgradable lock.
        if let Some(record) = state.issuable(&self.policy, now) {
            return Ok(Some(record));
        }
        if !self.policy.auto_generate {
            return Ok(state
                .current_record()
                .filter(|record| !record.is_expired(now))
                .cloned());
        }
        let record = self.mint(&state, now)?;
        let mut state = RwLockUpgradableReadGuard::upgrade(state);
        state.publish(Arc::clone(&record), true);
        info!(
            target: "stek::store",
            key_name = %record.name(),
            cipher = record.cipher().label(),
            "rotated ticket key"
        );
        Ok(Some(record))
    }

    /// Unconditionally replaces the current key (externally triggered rotation).
    pub fn rotate(&self) -> Result<Arc<KeyRecord>, StoreError> {
        let expected = self.state.read().current;
        self.rotate_from(expected.as_ref())
    }

    /// Compare-and-swap rotation: replaces the current key only if it is still
    /// `expected`. Otherwise returns the record some other caller published.
    pub fn rotate_from(&self, expected: Option<&KeyName>) -> Result<Arc<KeyRecord>, StoreError> {
        let now = self.clock.now();
        let state = self.state.upgradable_read();
        if state.current.as_ref() != expected {
            if let Some(record) = state.current_record().filter(|r| !r.is_expired(now)) {
                debug!(target: "stek::store", key_name = %record.name(), "rotation lost race");
                return Ok(Arc::clone(record));
            }
        }
        let record = self.mint(&state, now)?;
        let mut state = RwLockUpgradableReadGuard::upgrade(state);
        state.publish(Arc::clone(&record), true);
        info!(target: "stek::store", key_name = %record.name(), "rotated ticket key on request");
        Ok(record)
    }

    /// Adds a record that stays resolvable for decryption without becoming current.
    pub fn insert(&self, record: KeyRecord) -> Result<Arc<KeyRecord>, StoreError> {
        record.check()?;
        let mut state = self.state.write();
        state.admit(record.name())?;
        let record = Arc::new(record);
        state.publish(Arc::clone(&record), false);
        Ok(record)
    }

    /// Adds a record and makes it the key for new tickets.
    pub fn insert_current(&self, record: KeyRecord) -> Result<Arc<KeyRecord>, StoreError> {
        record.check()?;
        let mut state = self.state.write();
        state.admit(record.name())?;
        let record = Arc::new(record);
        state.publish(Arc::clone(&record), true);
        Ok(record)
    }

    /// Removes a record for good. Its name can never be published again.
    pub fn retire(&self, name: &KeyName) -> Option<Arc<KeyRecord>> {
        let mut state = self.state.write();
        let removed = state.records.remove(name)?;
        state.retired.insert(*name);
        if state.current.as_ref() == Some(name) {
            state.current = None;
        }
        debug!(target: "stek::store", key_name = %name, "retired ticket key");
        Some(removed)
    }

    /// Retires every record that has expired. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let expired: Vec<KeyName> = self
            .state
            .read()
            .records
            .values()
            .filter(|record| record.is_expired(now))
            .map(|record| *record.name())
            .collect();
        expired
            .iter()
            .filter(|name| self.retire(name).is_some())
            .count()
    }

    /// Snapshot of every resolvable record, oldest first.
    pub fn records(&self) -> Vec<Arc<KeyRecord>> {
        let mut records: Vec<_> = self.state.read().records.values().cloned().collect();
        records.sort_by_key(|record| record.created_at());
        records
    }

    fn mint(&self, state: &StoreState, now: SystemTime) -> Result<Arc<KeyRecord>, StoreError> {
        for _ in 0..NAME_ATTEMPTS {
            let name = KeyName::random(self.entropy.as_ref())?;
            if state.admit(&name).is_err() {
                continue;
            }
            let record = KeyRecord::generate_named(
                self.entropy.as_ref(),
                name,
                self.policy.cipher,
                self.policy.digest,
                now,
                self.policy.key_lifetime,
            )?;
            return Ok(Arc::new(record));
        }
        Err(StoreError::Backend("could not draw an unused key name".into()))
    }
}

#[async_trait]
impl KeyStore for InMemoryKeyStore {
    async fn lookup(&self, name: &KeyName) -> Result<Option<Arc<KeyRecord>>, StoreError> {
        Ok(self.lookup_record(name))
    }

    async fn current(&self) -> Result<Option<Arc<KeyRecord>>, StoreError> {
        self.current_record()
    }
}

impl fmt::Debug for InMemoryKeyStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.read();
        f.debug_struct("InMemoryKeyStore")
            .field("records", &state.records.len())
            .field("current", &state.current)
            .field("retired", &state.retired.len())
            .field("policy", &self.policy)
            .finish()
    }
}
