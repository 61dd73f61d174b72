//! DHT collaborator boundary.
//!
//! Everything stored in the DHT lives under a four-part [`StorageKey`]
//! (location, domain, content, version). The first three parts name a
//! [`ContentAddress`] slot; all versions of one slot share the slot's
//! protection key. Writes against a protected slot must carry a [`WriteAuth`]
//! proving possession of that key.

use async_trait::async_trait;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

pub const KEY_LEN: usize = 32;

const AUTHORIZE_TAG: &[u8] = b"hivesync-authorize";

/// 256-bit identifier used for every part of a storage key.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct Key(pub [u8; KEY_LEN]);

impl Key {
    pub const ZERO: Key = Key([0u8; KEY_LEN]);
    pub const MAX: Key = Key([0xffu8; KEY_LEN]);

    /// Hash a human readable name (user id, file path, domain name) into a key.
    pub fn hash(name: &str) -> Self {
        Self::digest(name.as_bytes())
    }

    pub fn digest(data: &[u8]) -> Self {
        let mut out = [0u8; KEY_LEN];
        out.copy_from_slice(&Sha256::digest(data));
        Key(out)
    }

    /// Derive a version key.
    ///
    /// The first 8 bytes hold the chain sequence (predecessor + 1, or 0 for
    /// the first version), the remaining 24 bytes are taken from the SHA-256
    /// of the content. Newer versions therefore sort after older ones.
    pub fn version(based_on: Option<&Key>, content: &[u8]) -> Self {
        let sequence = based_on.map(|k| k.sequence().saturating_add(1)).unwrap_or(0);
        let digest = Sha256::digest(content);
        let mut out = [0u8; KEY_LEN];
        out[..8].copy_from_slice(&sequence.to_be_bytes());
        out[8..].copy_from_slice(&digest[..KEY_LEN - 8]);
        Key(out)
    }

    /// Chain sequence encoded in a version key.
    pub fn sequence(&self) -> u64 {
        let mut seq = [0u8; 8];
        seq.copy_from_slice(&self.0[..8]);
        u64::from_be_bytes(seq)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let mut out = [0u8; KEY_LEN];
        hex::decode_to_slice(s, &mut out)?;
        Ok(Key(out))
    }

    /// Short form for log lines.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Key({})", self.short())
    }
}

/// A slot in the DHT: every version of one logical item.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Serialize, Deserialize)]
pub struct ContentAddress {
    pub location: Key,
    pub domain: Key,
    pub content: Key,
}

impl ContentAddress {
    pub fn new(location: Key, domain: Key, content: Key) -> Self {
        Self { location, domain, content }
    }

    pub fn at(&self, version: Key) -> StorageKey {
        StorageKey {
            location: self.location,
            domain: self.domain,
            content: self.content,
            version,
        }
    }

    /// Range covering every version of this slot, oldest first.
    pub fn versions(&self) -> KeyRange {
        KeyRange::new(self.at(Key::ZERO), self.at(Key::MAX))
    }

    fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(KEY_LEN * 3);
        out.extend_from_slice(&self.location.0);
        out.extend_from_slice(&self.domain.0);
        out.extend_from_slice(&self.content.0);
        out
    }
}

impl fmt::Display for ContentAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.location.short(),
            self.domain.short(),
            self.content.short()
        )
    }
}

/// Full four-part key of one stored snapshot.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Serialize, Deserialize)]
pub struct StorageKey {
    pub location: Key,
    pub domain: Key,
    pub content: Key,
    pub version: Key,
}

impl StorageKey {
    pub fn address(&self) -> ContentAddress {
        ContentAddress::new(self.location, self.domain, self.content)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = self.address().to_bytes();
        out.extend_from_slice(&self.version.0);
        out
    }
}

impl fmt::Display for StorageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.address(), self.version.short())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimeToLive {
    Unlimited,
    Seconds(u32),
}

impl TimeToLive {
    pub fn is_expired(&self, age_secs: u64) -> bool {
        match self {
            TimeToLive::Unlimited => false,
            TimeToLive::Seconds(ttl) => age_secs >= u64::from(*ttl),
        }
    }
}

impl Default for TimeToLive {
    fn default() -> Self {
        TimeToLive::Unlimited
    }
}

/// Signature binding an entry's payload to its key, made with the slot's
/// (new) protection key.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Protection {
    pub public_key: [u8; 32],
    pub signature: Vec<u8>,
}

impl Protection {
    pub fn sign(signing_key: &SigningKey, key: &StorageKey, data: &[u8]) -> Self {
        let sig = signing_key.sign(&Self::message(key, data));
        Self {
            public_key: signing_key.verifying_key().to_bytes(),
            signature: sig.to_bytes().to_vec(),
        }
    }

    pub fn verify(&self, key: &StorageKey, data: &[u8]) -> bool {
        verify_signature(&self.public_key, &Self::message(key, data), &self.signature)
    }

    fn message(key: &StorageKey, data: &[u8]) -> Vec<u8> {
        let mut msg = key.to_bytes();
        msg.extend_from_slice(data);
        msg
    }
}

/// Proof of possession of a protection key for one slot.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteAuth {
    pub public_key: [u8; 32],
    pub signature: Vec<u8>,
}

impl WriteAuth {
    pub fn sign(signing_key: &SigningKey, address: &ContentAddress) -> Self {
        let sig = signing_key.sign(&Self::message(address));
        Self {
            public_key: signing_key.verifying_key().to_bytes(),
            signature: sig.to_bytes().to_vec(),
        }
    }

    pub fn verify(&self, address: &ContentAddress) -> bool {
        verify_signature(&self.public_key, &Self::message(address), &self.signature)
    }

    fn message(address: &ContentAddress) -> Vec<u8> {
        let mut msg = AUTHORIZE_TAG.to_vec();
        msg.extend_from_slice(&address.to_bytes());
        msg
    }
}

fn verify_signature(public_key: &[u8; 32], msg: &[u8], sig: &[u8]) -> bool {
    let Ok(pk) = VerifyingKey::from_bytes(public_key) else {
        return false;
    };
    let Ok(sig) = Signature::from_slice(sig) else {
        return false;
    };
    pk.verify(msg, &sig).is_ok()
}

/// Raw stored snapshot.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub data: Vec<u8>,
    pub based_on: Option<Key>,
    pub ttl: TimeToLive,
    pub protection: Option<Protection>,
}

impl Entry {
    pub fn new(data: Vec<u8>, based_on: Option<Key>, ttl: TimeToLive) -> Self {
        Self {
            data,
            based_on,
            ttl,
            protection: None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Order {
    Ascending,
    Descending,
}

/// Inclusive key range with ordering and an optional result bound.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyRange {
    pub from: StorageKey,
    pub to: StorageKey,
    pub order: Order,
    pub limit: Option<usize>,
}

impl KeyRange {
    pub fn new(from: StorageKey, to: StorageKey) -> Self {
        Self {
            from,
            to,
            order: Order::Ascending,
            limit: None,
        }
    }

    pub fn descending(mut self) -> Self {
        self.order = Order::Descending;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// Lightweight summary of what is stored under a location key:
/// every key present together with its BasedOnKey.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DigestInfo {
    pub entries: BTreeMap<StorageKey, Option<Key>>,
}

impl DigestInfo {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, key: &StorageKey) -> bool {
        self.entries.contains_key(key)
    }

    /// Version keys present for one slot, oldest first.
    pub fn versions_of(&self, address: &ContentAddress) -> Vec<Key> {
        self.entries
            .keys()
            .filter(|k| k.address() == *address)
            .map(|k| k.version)
            .collect()
    }

    /// Keys present in `self` but absent from `other`.
    pub fn missing_from(&self, other: &DigestInfo) -> Vec<StorageKey> {
        self.entries
            .keys()
            .filter(|k| !other.entries.contains_key(k))
            .copied()
            .collect()
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DhtError {
    #[error("peer unreachable: {0}")]
    Unreachable(String),
    #[error("operation timed out")]
    Timeout,
    #[error("malformed response: {0}")]
    Malformed(String),
    #[error("protection key mismatch for {0}")]
    ProtectionMismatch(ContentAddress),
    #[error("cannot remove protection from {0}")]
    ProtectionDowngrade(ContentAddress),
    #[error("not connected to the network")]
    NotConnected,
}

impl DhtError {
    /// Transport-level failures that a caller may retry.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            DhtError::Unreachable(_) | DhtError::Timeout | DhtError::Malformed(_)
        )
    }
}

/// Asynchronous key-value store the core talks to.
#[async_trait]
pub trait DhtStore: Send + Sync {
    fn is_connected(&self) -> bool {
        true
    }

    /// Store `entry` under `key`. `auth` must prove the slot's current
    /// protection key (or the new one when the slot is unprotected).
    async fn put(&self, key: StorageKey, entry: Entry, auth: Option<WriteAuth>)
        -> Result<(), DhtError>;

    async fn get(&self, key: &StorageKey) -> Result<Option<Entry>, DhtError>;

    async fn get_range(&self, range: KeyRange) -> Result<Vec<(StorageKey, Entry)>, DhtError>;

    /// Returns whether something was removed.
    async fn remove(&self, key: &StorageKey, auth: Option<WriteAuth>) -> Result<bool, DhtError>;

    /// Returns how many entries were removed.
    async fn remove_range(&self, range: KeyRange, auth: Option<WriteAuth>)
        -> Result<usize, DhtError>;

    async fn digest(&self, location: &Key) -> Result<DigestInfo, DhtError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand_core::OsRng;

    #[test]
    fn test_version_key_sequence() {
        let v1 = Key::version(None, b"one");
        let v2 = Key::version(Some(&v1), b"two");
        let v3 = Key::version(Some(&v2), b"three");

        assert_eq!(v1.sequence(), 0);
        assert_eq!(v3.sequence(), 2);
        assert!(v1 < v2 && v2 < v3);
        assert_eq!(Key::version(Some(&v1), b"two"), v2);
    }

    #[test]
    fn test_key_hex() {
        let k = Key::hash("alice");
        assert_eq!(Key::from_hex(&k.to_hex()).unwrap(), k);
        assert!(Key::from_hex("abcd").is_err());
    }

    #[test]
    fn test_signatures() {
        let sk = SigningKey::generate(&mut OsRng);
        let other = SigningKey::generate(&mut OsRng);
        let address = ContentAddress::new(Key::hash("a"), Key::hash("b"), Key::hash("c"));
        let key = address.at(Key::version(None, b"data"));

        let protection = Protection::sign(&sk, &key, b"data");
        assert!(protection.verify(&key, b"data"));
        assert!(!protection.verify(&key, b"tampered"));

        let auth = WriteAuth::sign(&sk, &address);
        assert!(auth.verify(&address));
        let forged = WriteAuth {
            public_key: other.verifying_key().to_bytes(),
            signature: auth.signature.clone(),
        };
        assert!(!forged.verify(&address));
    }
}
