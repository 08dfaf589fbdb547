//! Key records and key stores for stateless session tickets.
//!
//! This crate owns the key side of ticket protection: immutable named key
//! records, the store contract the ticket dispatcher resolves keys through,
//! an in-memory store with shared reads and single-winner rotation, and
//! the entropy and clock sources those pieces are built on.

pub mod clock;
pub mod entropy;
pub mod keyfile;
pub mod record;
pub mod store;

pub use clock::{from_unix, to_unix, Clock, ManualClock, SystemClock};
pub use entropy::{EntropyError, OsEntropy, RandomSource, ReseedingEntropy};
pub use keyfile::{KeyEntry, KeyFile, KeyFileError, KEYFILE_VERSION};
pub use record::{
    CipherAlgorithm, DigestAlgorithm, KeyName, KeyRecord, RecordError, KEY_NAME_LEN, MAX_IV_LEN,
    MIN_MAC_KEY_LEN,
};
pub use store::{InMemoryKeyStore, KeyStore, RotationPolicy, StoreError};
