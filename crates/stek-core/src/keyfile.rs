//! JSON persistence for ticket key records.
//!
//! Key material is stored base64 encoded, timestamps as unix seconds. The file
//! is only a convenience for operators who rotate keys out of band; stores are
//! free to source records from anywhere else.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD as BASE64_STANDARD, Engine};
use serde::{Deserialize, Serialize};

use crate::clock::{from_unix, to_unix};
use crate::record::{CipherAlgorithm, DigestAlgorithm, KeyName, KeyRecord, RecordError};

pub const KEYFILE_VERSION: u32 = 1;

#[derive(Debug, thiserror::Error)]
pub enum KeyFileError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("key file is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unsupported key file version {0}")]
    Version(u32),
    #[error("key entry {index}: {reason}")]
    Entry { index: usize, reason: String },
    #[error("key entry {index}: {source}")]
    Record {
        index: usize,
        #[source]
        source: RecordError,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyFile {
    pub version: u32,
    #[serde(default)]
    pub keys: Vec<KeyEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyEntry {
    pub name: String,
    pub cipher: CipherAlgorithm,
    #[serde(default)]
    pub digest: DigestAlgorithm,
    pub cipher_key: String,
    pub mac_key: String,
    pub created_at: u64,
    pub expires_at: u64,
}

impl Default for KeyFile {
    fn default() -> Self {
        Self {
            version: KEYFILE_VERSION,
            keys: Vec::new(),
        }
    }
}

impl KeyFile {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, KeyFileError> {
        let source = fs::read_to_string(path)?;
        let file: KeyFile = serde_json::from_str(&source)?;
        if file.version != KEYFILE_VERSION {
            return Err(KeyFileError::Version(file.version));
        }
        Ok(file)
    }

    /// Loads `path` when it exists, otherwise starts an empty file.
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self, KeyFileError> {
        let path = path.as_ref();
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), KeyFileError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let body = serde_json::to_vec_pretty(self)?;
        // Write next to the target and rename so readers never see a torn file.
        let staging = path.with_extension("tmp");
        fs::write(&staging, body)?;
        fs::rename(&staging, path)?;
        Ok(())
    }

    pub fn from_records<'a>(records: impl IntoIterator<Item = &'a Arc<KeyRecord>>) -> Self {
        Self {
            version: KEYFILE_VERSION,
            keys: records.into_iter().map(|r| KeyEntry::from_record(r)).collect(),
        }
    }

    pub fn push(&mut self, record: &KeyRecord) {
        self.keys.push(KeyEntry::from_record(record));
    }

    /// Decodes every entry, rejecting material whose lengths do not fit its algorithms.
    pub fn records(&self) -> Result<Vec<KeyRecord>, KeyFileError> {
        self.keys
            .iter()
            .enumerate()
            .map(|(index, entry)| {
                let record = entry.to_record(index)?;
                record
                    .check()
                    .map_err(|source| KeyFileError::Record { index, source })?;
                Ok(record)
            })
            .collect()
    }
}

impl KeyEntry {
    pub fn from_record(record: &KeyRecord) -> Self {
        Self {
            name: BASE64_STANDARD.encode(record.name().as_bytes()),
            cipher: record.cipher(),
            digest: record.digest(),
            cipher_key: BASE64_STANDARD.encode(record.cipher_key()),
            mac_key: BASE64_STANDARD.encode(record.mac_key()),
            created_at: to_unix(record.created_at()),
            expires_at: to_unix(record.expires_at()),
        }
    }

    fn to_record(&self, index: usize) -> Result<KeyRecord, KeyFileError> {
        let decode = |field: &str, value: &str| {
            BASE64_STANDARD
                .decode(value)
                .map_err(|err| KeyFileError::Entry {
                    index,
                    reason: format!("{field} is not valid base64: {err}"),
                })
        };
        let name_bytes = decode("name", &self.name)?;
        let name = if name_bytes.len() == crate::record::KEY_NAME_LEN {
            KeyName::from_prefix(&name_bytes)
        } else {
            None
        }
        .ok_or_else(|| KeyFileError::Entry {
            index,
            reason: format!("name must be 16 bytes, got {}", name_bytes.len()),
        })?;
        Ok(KeyRecord::new(
            name,
            self.cipher,
            self.digest,
            decode("cipher_key", &self.cipher_key)?,
            decode("mac_key", &self.mac_key)?,
            from_unix(self.created_at),
            from_unix(self.expires_at),
        ))
    }
}
