//! In-process DHT used by tests and the CLI.

use crate::dht::{
    ContentAddress, DhtError, DhtStore, DigestInfo, Entry, Key, KeyRange, Order, StorageKey,
    WriteAuth,
};
use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

#[derive(Clone, Debug, Serialize, Deserialize)]
struct StoredEntry {
    entry: Entry,
    stored_at: u64,
}

impl StoredEntry {
    fn is_expired(&self, now: u64) -> bool {
        self.entry.ttl.is_expired(now.saturating_sub(self.stored_at))
    }
}

/// Serializable image of a [`MemoryDht`].
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct DhtSnapshot {
    entries: BTreeMap<StorageKey, StoredEntry>,
    protection: BTreeMap<ContentAddress, [u8; 32]>,
}

#[derive(Default)]
struct Faults {
    offline: AtomicBool,
    disconnected: AtomicBool,
    fail_next: AtomicUsize,
    latency_ms: AtomicU64,
}

#[derive(Default)]
struct Inner {
    state: RwLock<DhtSnapshot>,
    faults: Faults,
}

/// Memory-backed [`DhtStore`] with slot-level protection, TTL eviction and
/// fault injection.
#[derive(Clone, Default)]
pub struct MemoryDht {
    inner: Arc<Inner>,
}

impl MemoryDht {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_snapshot(snapshot: DhtSnapshot) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: RwLock::new(snapshot),
                faults: Faults::default(),
            }),
        }
    }

    pub fn snapshot(&self) -> DhtSnapshot {
        self.inner.state.read().clone()
    }

    /// Load a snapshot written by [`MemoryDht::save`]; a missing file yields
    /// an empty store.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::new());
        }
        let data = std::fs::read(path)
            .with_context(|| format!("Failed to read DHT snapshot {}", path.display()))?;
        let snapshot: DhtSnapshot =
            bincode::deserialize(&data).context("Failed to decode DHT snapshot")?;
        tracing::debug!("Loaded {} DHT entries from {:?}", snapshot.entries.len(), path);
        Ok(Self::from_snapshot(snapshot))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let data = bincode::serialize(&self.snapshot()).context("Failed to encode DHT snapshot")?;
        std::fs::write(path, data)
            .with_context(|| format!("Failed to write DHT snapshot {}", path.display()))?;
        Ok(())
    }

    /// Every operation fails with [`DhtError::Unreachable`] while offline.
    pub fn set_offline(&self, offline: bool) {
        self.inner.faults.offline.store(offline, AtomicOrdering::SeqCst);
    }

    pub fn set_connected(&self, connected: bool) {
        self.inner
            .faults
            .disconnected
            .store(!connected, AtomicOrdering::SeqCst);
    }

    /// Fail the next `n` operations with [`DhtError::Unreachable`].
    pub fn fail_next(&self, n: usize) {
        self.inner.faults.fail_next.store(n, AtomicOrdering::SeqCst);
    }

    pub fn set_latency(&self, latency: Duration) {
        self.inner
            .faults
            .latency_ms
            .store(
                u64::try_from(latency.as_millis()).unwrap_or(u64::MAX),
                AtomicOrdering::SeqCst,
            );
    }

    pub fn len(&self) -> usize {
        let now = unix_now();
        self.inner
            .state
            .read()
            .entries
            .values()
            .filter(|e| !e.is_expired(now))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop expired entries, returning how many were evicted.
    pub fn purge_expired(&self) -> usize {
        let now = unix_now();
        let mut state = self.inner.state.write();
        let before = state.entries.len();
        state.entries.retain(|_, e| !e.is_expired(now));
        let slots: Vec<ContentAddress> = state.protection.keys().copied().collect();
        for address in &slots {
            release_if_empty(&mut state, address, now);
        }
        before - state.entries.len()
    }

    /// Public key currently protecting a slot.
    pub fn protection_of(&self, address: &ContentAddress) -> Option<[u8; 32]> {
        self.inner.state.read().protection.get(address).copied()
    }

    async fn network(&self) -> Result<(), DhtError> {
        let faults = &self.inner.faults;
        let latency = faults.latency_ms.load(AtomicOrdering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        if faults.disconnected.load(AtomicOrdering::SeqCst) {
            return Err(DhtError::NotConnected);
        }
        if faults.offline.load(AtomicOrdering::SeqCst) {
            return Err(DhtError::Unreachable("store is offline".into()));
        }
        let injected = faults
            .fail_next
            .fetch_update(AtomicOrdering::SeqCst, AtomicOrdering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(DhtError::Unreachable("injected failure".into()));
        }
        Ok(())
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn authorize(
    auth: Option<&WriteAuth>,
    address: &ContentAddress,
    expected: &[u8; 32],
) -> Result<(), DhtError> {
    match auth {
        Some(a) if a.public_key == *expected && a.verify(address) => Ok(()),
        _ => Err(DhtError::ProtectionMismatch(*address)),
    }
}

#[async_trait]
impl DhtStore for MemoryDht {
    fn is_connected(&self) -> bool {
        !self.inner.faults.disconnected.load(AtomicOrdering::SeqCst)
    }

    async fn put(
        &self,
        key: StorageKey,
        entry: Entry,
        auth: Option<WriteAuth>,
    ) -> Result<(), DhtError> {
        self.network().await?;

        if let Some(p) = &entry.protection {
            if !p.verify(&key, &entry.data) {
                return Err(DhtError::Malformed(format!("invalid entry signature for {}", key)));
            }
        }

        let address = key.address();
        let mut state = self.inner.state.write();
        let current = state.protection.get(&address).copied();
        match (current, &entry.protection) {
            (None, None) => {}
            (None, Some(p)) => authorize(auth.as_ref(), &address, &p.public_key)?,
            (Some(_), None) => return Err(DhtError::ProtectionDowngrade(address)),
            (Some(cur), Some(_)) => authorize(auth.as_ref(), &address, &cur)?,
        }

        if let Some(p) = &entry.protection {
            state.protection.insert(address, p.public_key);
        }

        tracing::debug!(
            "Stored {} ({} bytes, protected={})",
            key,
            entry.data.len(),
            entry.protection.is_some()
        );
        state.entries.insert(
            key,
            StoredEntry {
                entry,
                stored_at: unix_now(),
            },
        );
        Ok(())
    }

    async fn get(&self, key: &StorageKey) -> Result<Option<Entry>, DhtError> {
        self.network().await?;
        let now = unix_now();
        let state = self.inner.state.read();
        Ok(state
            .entries
            .get(key)
            .filter(|e| !e.is_expired(now))
            .map(|e| e.entry.clone()))
    }

    async fn get_range(&self, range: KeyRange) -> Result<Vec<(StorageKey, Entry)>, DhtError> {
        self.network().await?;
        let now = unix_now();
        let limit = range.limit.unwrap_or(usize::MAX);
        let state = self.inner.state.read();
        let live = state
            .entries
            .range(range.from..=range.to)
            .filter(|(_, e)| !e.is_expired(now))
            .map(|(k, e)| (*k, e.entry.clone()));

        let out = match range.order {
            Order::Ascending => live.take(limit).collect(),
            Order::Descending => live.rev().take(limit).collect(),
        };
        Ok(out)
    }

    async fn remove(&self, key: &StorageKey, auth: Option<WriteAuth>) -> Result<bool, DhtError> {
        self.network().await?;
        let address = key.address();
        let mut state = self.inner.state.write();
        if !state.entries.contains_key(key) {
            return Ok(false);
        }
        if let Some(cur) = state.protection.get(&address).copied() {
            authorize(auth.as_ref(), &address, &cur)?;
        }
        state.entries.remove(key);
        release_if_empty(&mut state, &address, unix_now());
        tracing::debug!("Removed {}", key);
        Ok(true)
    }

    async fn remove_range(
        &self,
        range: KeyRange,
        auth: Option<WriteAuth>,
    ) -> Result<usize, DhtError> {
        self.network().await?;
        let mut state = self.inner.state.write();
        let keys: Vec<StorageKey> = state
            .entries
            .range(range.from..=range.to)
            .map(|(k, _)| *k)
            .collect();

        // All-or-nothing: check every affected slot before touching any.
        for key in &keys {
            let address = key.address();
            if let Some(cur) = state.protection.get(&address).copied() {
                authorize(auth.as_ref(), &address, &cur)?;
            }
        }

        let now = unix_now();
        for key in &keys {
            state.entries.remove(key);
            release_if_empty(&mut state, &key.address(), now);
        }
        tracing::debug!("Removed {} entries in range", keys.len());
        Ok(keys.len())
    }

    async fn digest(&self, location: &Key) -> Result<DigestInfo, DhtError> {
        self.network().await?;
        let now = unix_now();
        let from = ContentAddress::new(*location, Key::ZERO, Key::ZERO).at(Key::ZERO);
        let to = ContentAddress::new(*location, Key::MAX, Key::MAX).at(Key::MAX);
        let state = self.inner.state.read();
        let entries = state
            .entries
            .range(from..=to)
            .filter(|(_, e)| !e.is_expired(now))
            .map(|(k, e)| (*k, e.entry.based_on))
            .collect();
        Ok(DigestInfo { entries })
    }
}

/// Drop the slot's protection once it holds no live entry.
fn release_if_empty(state: &mut DhtSnapshot, address: &ContentAddress, now: u64) {
    let range = address.versions();
    let live = state
        .entries
        .range(range.from..=range.to)
        .any(|(_, e)| !e.is_expired(now));
    if !live {
        state.protection.remove(address);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dht::{Protection, TimeToLive};
    use ed25519_dalek::SigningKey;
    use rand_core::OsRng;
    use tempfile::TempDir;

    fn slot(name: &str) -> ContentAddress {
        ContentAddress::new(Key::hash("alice"), Key::hash("meta"), Key::hash(name))
    }

    fn entry(data: &[u8], based_on: Option<Key>) -> Entry {
        Entry::new(data.to_vec(), based_on, TimeToLive::Unlimited)
    }

    fn protected(sk: &SigningKey, key: &StorageKey, data: &[u8]) -> Entry {
        let mut e = entry(data, None);
        e.protection = Some(Protection::sign(sk, key, data));
        e
    }

    #[tokio::test]
    async fn test_latest_by_descending_scan() -> Result<()> {
        let dht = MemoryDht::new();
        let address = slot("a");
        let v1 = Key::version(None, b"1");
        let v2 = Key::version(Some(&v1), b"2");
        let v3 = Key::version(Some(&v2), b"3");
        for (v, data, based) in [(v2, b"2", Some(v1)), (v1, b"1", None), (v3, b"3", Some(v2))] {
            dht.put(address.at(v), entry(data, based), None).await?;
        }

        let latest = dht.get_range(address.versions().descending().limit(1)).await?;
        assert_eq!(latest.len(), 1);
        assert_eq!(latest[0].0.version, v3);
        assert_eq!(latest[0].1.based_on, Some(v2));

        let exact = dht.get(&address.at(v1)).await?;
        assert_eq!(exact.map(|e| e.data), Some(b"1".to_vec()));
        Ok(())
    }

    #[tokio::test]
    async fn test_protection_rules() -> Result<()> {
        let dht = MemoryDht::new();
        let owner = SigningKey::generate(&mut OsRng);
        let intruder = SigningKey::generate(&mut OsRng);
        let address = slot("p");
        let key = address.at(Key::version(None, b"x"));

        dht.put(key, protected(&owner, &key, b"x"), Some(WriteAuth::sign(&owner, &address)))
            .await?;
        assert_eq!(dht.protection_of(&address), Some(owner.verifying_key().to_bytes()));

        let key2 = address.at(Key::version(Some(&key.version), b"y"));
        let err = dht
            .put(key2, protected(&intruder, &key2, b"y"), Some(WriteAuth::sign(&intruder, &address)))
            .await
            .unwrap_err();
        assert_eq!(err, DhtError::ProtectionMismatch(address));

        let err = dht.put(key2, entry(b"y", Some(key.version)), None).await.unwrap_err();
        assert_eq!(err, DhtError::ProtectionDowngrade(address));

        let err = dht.remove(&key, None).await.unwrap_err();
        assert_eq!(err, DhtError::ProtectionMismatch(address));

        assert!(dht.remove(&key, Some(WriteAuth::sign(&owner, &address))).await?);
        assert_eq!(dht.protection_of(&address), None);
        Ok(())
    }

    #[tokio::test]
    async fn test_ttl_and_digest() -> Result<()> {
        let dht = MemoryDht::new();
        let keep = slot("keep").at(Key::version(None, b"k"));
        let gone = slot("gone").at(Key::version(None, b"g"));
        dht.put(keep, entry(b"k", None), None).await?;
        dht.put(gone, Entry::new(b"g".to_vec(), None, TimeToLive::Seconds(0)), None)
            .await?;

        assert_eq!(dht.get(&gone).await?, None);
        let digest = dht.digest(&Key::hash("alice")).await?;
        assert!(digest.contains(&keep));
        assert!(!digest.contains(&gone));
        assert_eq!(dht.purge_expired(), 1);

        assert!(dht.digest(&Key::hash("bob")).await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_expired_entries_do_not_hold_protection() -> Result<()> {
        let dht = MemoryDht::new();
        let owner = SigningKey::generate(&mut OsRng);
        let address = slot("lapsed");
        let auth = || Some(WriteAuth::sign(&owner, &address));

        let short = address.at(Key::version(None, b"short"));
        let mut lapsed = protected(&owner, &short, b"short");
        lapsed.ttl = TimeToLive::Seconds(0);
        dht.put(short, lapsed, auth()).await?;
        let long = address.at(Key::version(Some(&short.version), b"long"));
        dht.put(long, protected(&owner, &long, b"long"), auth()).await?;

        assert!(dht.remove(&long, auth()).await?);
        assert_eq!(dht.protection_of(&address), None);

        let again = slot("lapsed-again");
        let auth = Some(WriteAuth::sign(&owner, &again));
        let key = again.at(Key::version(None, b"gone"));
        let mut gone = protected(&owner, &key, b"gone");
        gone.ttl = TimeToLive::Seconds(0);
        dht.put(key, gone, auth).await?;
        assert_eq!(dht.purge_expired(), 2);
        assert_eq!(dht.protection_of(&again), None);
        Ok(())
    }

    #[test]
    fn test_latency_saturates() {
        let dht = MemoryDht::new();
        dht.set_latency(Duration::MAX);
        assert_eq!(dht.inner.faults.latency_ms.load(AtomicOrdering::SeqCst), u64::MAX);
    }

    #[tokio::test]
    async fn test_fault_injection() -> Result<()> {
        let dht = MemoryDht::new();
        let key = slot("f").at(Key::version(None, b"f"));

        dht.fail_next(1);
        let err = dht.put(key, entry(b"f", None), None).await.unwrap_err();
        assert!(err.is_transient());
        dht.put(key, entry(b"f", None), None).await?;

        dht.set_connected(false);
        assert!(!dht.is_connected());
        assert_eq!(dht.get(&key).await.unwrap_err(), DhtError::NotConnected);
        Ok(())
    }

    #[tokio::test]
    async fn test_snapshot_roundtrip() -> Result<()> {
        let temp = TempDir::new()?;
        let path = temp.path().join("dht.bin");
        let dht = MemoryDht::new();
        let key = slot("s").at(Key::version(None, b"s"));
        dht.put(key, entry(b"s", None), None).await?;
        dht.save(&path)?;

        let restored = MemoryDht::load(&path)?;
        assert_eq!(restored.get(&key).await?.map(|e| e.data), Some(b"s".to_vec()));
        assert!(MemoryDht::load(&temp.path().join("missing.bin"))?.is_empty());
        Ok(())
    }
}
