//! Ticket wire format.
//!
//! ```text
//! ticket  := key_name(16) || iv(cipher iv len) || ciphertext || mac_tag(digest len)
//! mac_tag := HMAC(mac_key, key_name || iv || ciphertext)
//! ```
//!
//! The tag is checked in constant time before any decryption is attempted.

use std::fmt;
use std::sync::Arc;

use stek_core::{KeyName, KeyRecord, RandomSource, KEY_NAME_LEN};

use crate::crypto::TicketKeys;
use crate::error::TicketError;

/// Opaque ticket bytes handed to the client.
#[derive(Clone, PartialEq, Eq)]
pub struct Ticket(Vec<u8>);

impl Ticket {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn key_name(&self) -> Option<KeyName> {
        KeyName::from_prefix(&self.0)
    }
}

impl AsRef<[u8]> for Ticket {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for Ticket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ticket")
            .field("key_name", &self.key_name())
            .field("len", &self.0.len())
            .finish()
    }
}

/// Borrowed split of a ticket once the IV and tag lengths are known.
#[derive(Debug, Clone, Copy)]
pub struct TicketView<'a> {
    pub key_name: KeyName,
    pub iv: &'a [u8],
    pub ciphertext: &'a [u8],
    pub tag: &'a [u8],
    /// `key_name || iv || ciphertext`, the bytes covered by the tag.
    pub authenticated: &'a [u8],
}

impl<'a> TicketView<'a> {
    pub fn parse(bytes: &'a [u8], iv_len: usize, tag_len: usize) -> Result<Self, TicketError> {
        if bytes.len() < KEY_NAME_LEN + iv_len + tag_len {
            return Err(TicketError::Malformed);
        }
        let (authenticated, tag) = bytes.split_at(bytes.len() - tag_len);
        let (name, rest) = authenticated.split_at(KEY_NAME_LEN);
        let (iv, ciphertext) = rest.split_at(iv_len);
        let key_name = KeyName::from_prefix(name).ok_or(TicketError::Malformed)?;
        Ok(Self {
            key_name,
            iv,
            ciphertext,
            tag,
            authenticated,
        })
    }
}

/// Encrypts `session_state` with encrypt-mode keys.
pub fn seal(keys: &TicketKeys, session_state: &[u8]) -> Result<Ticket, TicketError> {
    let iv = keys
        .iv()
        .ok_or_else(|| TicketError::CryptoInit("decrypt-mode keys cannot seal".into()))?;
    let ciphertext = keys.cipher().seal(iv, session_state)?;
    let mut out =
        Vec::with_capacity(KEY_NAME_LEN + iv.len() + ciphertext.len() + keys.mac().tag_len());
    out.extend_from_slice(keys.key_name().as_bytes());
    out.extend_from_slice(iv);
    out.extend_from_slice(&ciphertext);
    let tag = keys.mac().compute(&[out.as_slice()])?;
    out.extend_from_slice(&tag);
    Ok(Ticket(out))
}

/// Authenticates and decrypts `ticket` with keys resolved for its key name.
pub fn open(keys: &TicketKeys, ticket: &[u8]) -> Result<Vec<u8>, TicketError> {
    let view = TicketView::parse(ticket, keys.cipher().iv_len(), keys.mac().tag_len())?;
    if &view.key_name != keys.key_name() {
        return Err(TicketError::KeyNotFound);
    }
    if !keys.mac().verify(&[view.authenticated], view.tag)? {
        return Err(TicketError::TagMismatch);
    }
    keys.cipher().open(view.iv, view.ciphertext)
}

/// Issues a ticket for `session_state` under `record`, drawing a fresh IV from `rng`.
pub fn encode(
    session_state: &[u8],
    record: &Arc<KeyRecord>,
    rng: &dyn RandomSource,
) -> Result<Ticket, TicketError> {
    let keys = TicketKeys::for_encrypt(Arc::clone(record), rng)?;
    seal(&keys, session_state)
}

/// Resolves the ticket's key through `lookup`, then authenticates and decrypts it.
///
/// Returns the session state together with the record so callers can apply
/// expiry and renewal decisions.
pub fn decode<F>(ticket: &[u8], lookup: F) -> Result<(Vec<u8>, Arc<KeyRecord>), TicketError>
where
    F: FnOnce(&KeyName) -> Option<Arc<KeyRecord>>,
{
    let name = KeyName::from_prefix(ticket).ok_or(TicketError::Malformed)?;
    let record = lookup(&name).ok_or(TicketError::KeyNotFound)?;
    let keys = TicketKeys::for_decrypt(Arc::clone(&record))?;
    let state = open(&keys, ticket)?;
    Ok((state, record))
}
