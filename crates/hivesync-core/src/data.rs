//! Data access layer: put/get/remove/digest against the DHT with
//! protection-key transitions, version chains and TTL.

use crate::address::Domain;
use crate::bridge::PendingOperation;
use crate::content::{decode, encode, NetworkContent};
use crate::error::{Result, SyncError};
use crate::keys::ProtectionKeys;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use storage::{
    ContentAddress, DhtStore, DigestInfo, Entry, Key, KeyRange, StorageKey, WriteAuth,
};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// A decoded snapshot together with what the DHT recorded about it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Retrieved<T> {
    pub content: T,
    pub key: StorageKey,
    pub based_on: Option<Key>,
    /// Public key whose signature was verified on this snapshot.
    pub signed_by: Option<[u8; 32]>,
}

impl<T> Retrieved<T> {
    pub fn version_key(&self) -> Key {
        self.key.version
    }
}

/// Per-slot async mutexes serializing writes to the same content address.
#[derive(Default)]
pub struct AddressLocks {
    slots: Mutex<HashMap<ContentAddress, Arc<AsyncMutex<()>>>>,
}

impl AddressLocks {
    pub async fn acquire(&self, address: ContentAddress) -> OwnedMutexGuard<()> {
        let slot = {
            let mut slots = self.slots.lock();
            slots.retain(|_, m| Arc::strong_count(m) > 1);
            slots.entry(address).or_default().clone()
        };
        slot.lock_owned().await
    }

    /// Slots with a writer holding or waiting for the lock.
    pub fn active(&self) -> usize {
        self.slots
            .lock()
            .values()
            .filter(|m| Arc::strong_count(m) > 1)
            .count()
    }
}

#[derive(Clone)]
pub struct DataManager {
    store: Arc<dyn DhtStore>,
    locks: Option<Arc<AddressLocks>>,
}

impl DataManager {
    pub fn new(store: Arc<dyn DhtStore>) -> Self {
        Self { store, locks: None }
    }

    /// Serialize puts and removes that target the same slot. Independent
    /// callers are otherwise free to race on one address.
    pub fn with_write_serialization(mut self, enabled: bool) -> Self {
        self.locks = enabled.then(|| Arc::new(AddressLocks::default()));
        self
    }

    pub fn serializes_writes(&self) -> bool {
        self.locks.is_some()
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.store.is_connected() {
            Ok(())
        } else {
            Err(SyncError::precondition("no peer connection"))
        }
    }

    /// Store `content` under `address`.
    ///
    /// | old key | new key | effect                                             |
    /// |---------|---------|----------------------------------------------------|
    /// | none    | none    | unprotected put                                    |
    /// | none    | some    | protect for the first time, authorized by new key  |
    /// | some    | some    | keep or change protection, authorized by old key   |
    /// | some    | none    | refused with `UnsupportedTransition`, not attempted |
    ///
    /// Resolves to the version key the content was stored under.
    pub fn put<T: NetworkContent>(
        &self,
        address: ContentAddress,
        content: &T,
        old_keys: Option<&ProtectionKeys>,
        new_keys: Option<&ProtectionKeys>,
    ) -> PendingOperation<Key> {
        let prepared = self
            .ensure_connected()
            .and_then(|_| prepare_put(address, content, old_keys, new_keys));
        let (key, entry, auth) = match prepared {
            Ok(p) => p,
            Err(err) => return PendingOperation::failed("put", err),
        };

        tracing::debug!(
            "put {} based_on={:?} ttl={:?} protected={}",
            key,
            entry.based_on,
            entry.ttl,
            entry.protection.is_some()
        );

        let store = self.store.clone();
        let locks = self.locks.clone();
        PendingOperation::spawn("put", async move {
            let _guard = match &locks {
                Some(l) => Some(l.acquire(address).await),
                None => None,
            };
            store.put(key, entry, auth).await?;
            Ok(key.version)
        })
    }

    /// Fetch a snapshot: the given version, or the latest one found by a
    /// descending scan bounded to one result.
    pub fn get<T: NetworkContent>(
        &self,
        address: ContentAddress,
        version: Option<Key>,
    ) -> PendingOperation<Option<Retrieved<T>>> {
        if let Err(err) = self.ensure_connected() {
            return PendingOperation::failed("get", err);
        }
        tracing::debug!("get {} version={:?}", address, version);

        let store = self.store.clone();
        PendingOperation::spawn("get", async move {
            let found = match version {
                Some(v) => {
                    let key = address.at(v);
                    store.get(&key).await?.map(|entry| (key, entry))
                }
                None => store
                    .get_range(address.versions().descending().limit(1))
                    .await?
                    .into_iter()
                    .next(),
            };
            found.map(|(key, entry)| decode_entry(key, entry)).transpose()
        })
    }

    /// Remove one version, or the whole version range when `version` is
    /// `None`. Resolves to the number of removed snapshots.
    pub fn remove(
        &self,
        address: ContentAddress,
        version: Option<Key>,
        keys: Option<&ProtectionKeys>,
    ) -> PendingOperation<usize> {
        if let Err(err) = self.ensure_connected() {
            return PendingOperation::failed("remove", err);
        }
        tracing::debug!("remove {} version={:?}", address, version);

        let auth: Option<WriteAuth> = keys.map(|k| k.authorize(&address));
        let store = self.store.clone();
        let locks = self.locks.clone();
        PendingOperation::spawn("remove", async move {
            let _guard = match &locks {
                Some(l) => Some(l.acquire(address).await),
                None => None,
            };
            let removed = match version {
                Some(v) => usize::from(store.remove(&address.at(v), auth).await?),
                None => store.remove_range(address.versions(), auth).await?,
            };
            Ok(removed)
        })
    }

    /// Queue `task` for the user at `location`. Use [`crate::address::task_id`]
    /// for `task_id` to keep the queue in arrival order.
    pub fn put_user_profile_task<T: NetworkContent>(
        &self,
        location: Key,
        task_id: Key,
        task: &T,
        keys: Option<&ProtectionKeys>,
    ) -> PendingOperation<Key> {
        let address = Domain::UserProfileTask.address(location, task_id);
        self.put(address, task, keys, keys)
    }

    /// Oldest queued task of the user at `location`, if any.
    pub fn get_user_profile_task<T: NetworkContent>(
        &self,
        location: Key,
    ) -> PendingOperation<Option<Retrieved<T>>> {
        if let Err(err) = self.ensure_connected() {
            return PendingOperation::failed("get-task", err);
        }
        let domain = Domain::UserProfileTask;
        let range = KeyRange::new(
            domain.address(location, Key::ZERO).at(Key::ZERO),
            domain.address(location, Key::MAX).at(Key::MAX),
        )
        .limit(1);
        tracing::debug!("get oldest task of {}", location.short());

        let store = self.store.clone();
        PendingOperation::spawn("get-task", async move {
            store
                .get_range(range)
                .await?
                .into_iter()
                .next()
                .map(|(key, entry)| decode_entry(key, entry))
                .transpose()
        })
    }

    /// Drop a handled task with all its versions.
    pub fn remove_user_profile_task(
        &self,
        location: Key,
        task_id: Key,
        keys: Option<&ProtectionKeys>,
    ) -> PendingOperation<usize> {
        self.remove(Domain::UserProfileTask.address(location, task_id), None, keys)
    }

    pub fn digest(&self, location: Key) -> PendingOperation<DigestInfo> {
        if let Err(err) = self.ensure_connected() {
            return PendingOperation::failed("digest", err);
        }
        let store = self.store.clone();
        PendingOperation::spawn("digest", async move { Ok(store.digest(&location).await?) })
    }
}

fn prepare_put<T: NetworkContent>(
    address: ContentAddress,
    content: &T,
    old_keys: Option<&ProtectionKeys>,
    new_keys: Option<&ProtectionKeys>,
) -> Result<(StorageKey, Entry, Option<WriteAuth>)> {
    let key = address.at(content.version_key()?);
    let mut entry = Entry::new(encode(content)?, content.based_on_key(), content.time_to_live());

    let auth = match (old_keys, new_keys) {
        (None, None) => None,
        (Some(_), None) => {
            return Err(SyncError::UnsupportedTransition(format!(
                "cannot remove protection from {address}"
            )))
        }
        (None, Some(new)) => {
            entry.protection = Some(new.protect(&key, &entry.data));
            Some(new.authorize(&address))
        }
        (Some(old), Some(new)) => {
            entry.protection = Some(new.protect(&key, &entry.data));
            Some(old.authorize(&address))
        }
    };
    Ok((key, entry, auth))
}

fn decode_entry<T: NetworkContent>(key: StorageKey, entry: Entry) -> Result<Retrieved<T>> {
    let signed_by = match &entry.protection {
        Some(p) if p.verify(&key, &entry.data) => Some(p.public_key),
        Some(_) => return Err(SyncError::network(format!("bad signature on {key}"))),
        None => None,
    };
    Ok(Retrieved {
        content: decode(&entry.data)?,
        key,
        based_on: entry.based_on,
        signed_by,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::task_id;
    use crate::model::{ContentHash, FileVersion};
    use serde::{Deserialize, Serialize};
    use std::time::Duration;
    use storage::{MemoryDht, TimeToLive};

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    struct Note {
        based_on: Option<Key>,
        text: String,
    }

    impl NetworkContent for Note {
        fn based_on_key(&self) -> Option<Key> {
            self.based_on
        }
    }

    fn note(text: &str, based_on: Option<Key>) -> Note {
        Note {
            based_on,
            text: text.to_string(),
        }
    }

    fn setup() -> (MemoryDht, DataManager, ContentAddress) {
        let dht = MemoryDht::new();
        let data = DataManager::new(Arc::new(dht.clone()));
        let address = Domain::MetaFile.address(Key::hash("alice"), Key::hash("notes"));
        (dht, data, address)
    }

    #[tokio::test]
    async fn test_put_get_roundtrip() -> Result<()> {
        let (_dht, data, address) = setup();
        let content = note("hello", None);

        let version = data.put(address, &content, None, None).await?;
        assert_eq!(version, content.version_key()?);

        let got = data.get::<Note>(address, None).await?.expect("stored");
        assert_eq!(got.content, content);
        assert_eq!(got.version_key(), version);
        assert_eq!(got.signed_by, None);
        Ok(())
    }

    #[tokio::test]
    async fn test_latest_and_exact_versions() -> Result<()> {
        let (_dht, data, address) = setup();
        let hash = ContentHash::of(b"x");
        let v1 = FileVersion::new(None, hash, 1, 1, 1);
        let v2 = FileVersion::new(Some(&v1), hash, 1, 2, 1);
        let v3 = FileVersion::new(Some(&v2), hash, 1, 3, 1);
        for v in [&v1, &v3, &v2] {
            data.put(address, v, None, None).await?;
        }

        let latest = data.get::<FileVersion>(address, None).await?.expect("latest");
        assert_eq!(latest.content, v3);
        assert_eq!(latest.based_on, Some(v2.version_key()));

        let first = data
            .get::<FileVersion>(address, Some(v1.version_key()))
            .await?
            .expect("v1");
        assert_eq!(first.content, v1);

        let missing = data.get::<FileVersion>(address, Some(Key::hash("nope"))).await?;
        assert!(missing.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn test_protection_contract() -> Result<()> {
        let (_dht, data, address) = setup();
        let k1 = ProtectionKeys::generate();
        let k2 = ProtectionKeys::generate();
        let first = note("v1", None);
        let second = note("v2", Some(first.version_key()?));

        data.put(address, &first, None, Some(&k1)).await?;

        let err = data.put(address, &second, None, Some(&k2)).await.unwrap_err();
        assert!(matches!(err, SyncError::ProtectionKeyMismatch(_)));

        data.put(address, &second, Some(&k1), Some(&k2)).await?;
        let got = data.get::<Note>(address, None).await?.expect("stored");
        assert_eq!(got.content, second);
        assert_eq!(got.signed_by, Some(k2.public_key_bytes()));
        Ok(())
    }

    #[tokio::test]
    async fn test_unprotecting_is_refused() -> Result<()> {
        let (dht, data, address) = setup();
        let keys = ProtectionKeys::generate();
        let first = note("v1", None);
        let second = note("v2", Some(first.version_key()?));
        data.put(address, &first, Some(&keys), Some(&keys)).await?;

        let err = data.put(address, &second, Some(&keys), None).await.unwrap_err();
        assert!(matches!(err, SyncError::UnsupportedTransition(_)));

        let err = data.put(address, &second, None, None).await.unwrap_err();
        assert!(matches!(err, SyncError::UnsupportedTransition(_)));

        let got = data.get::<Note>(address, None).await?.expect("stored");
        assert_eq!(got.content, first);
        assert_eq!(got.signed_by, Some(keys.public_key_bytes()));
        assert_eq!(dht.protection_of(&address), Some(keys.public_key_bytes()));
        Ok(())
    }

    #[tokio::test]
    async fn test_remove_requires_key() -> Result<()> {
        let (_dht, data, address) = setup();
        let keys = ProtectionKeys::generate();
        let first = note("v1", None);
        let second = note("v2", Some(first.version_key()?));
        data.put(address, &first, Some(&keys), Some(&keys)).await?;
        data.put(address, &second, Some(&keys), Some(&keys)).await?;

        let err = data.remove(address, None, None).await.unwrap_err();
        assert!(matches!(err, SyncError::ProtectionKeyMismatch(_)));

        let removed = data.remove(address, Some(second.version_key()?), Some(&keys)).await?;
        assert_eq!(removed, 1);
        let latest = data.get::<Note>(address, None).await?.expect("v1 left");
        assert_eq!(latest.content, first);

        assert_eq!(data.remove(address, None, Some(&keys)).await?, 1);
        assert!(data.get::<Note>(address, None).await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn test_ttl_recorded() -> Result<()> {
        #[derive(Debug, Serialize, Deserialize)]
        struct Ephemeral(u8);
        impl NetworkContent for Ephemeral {
            fn time_to_live(&self) -> TimeToLive {
                TimeToLive::Seconds(0)
            }
        }

        let (dht, data, address) = setup();
        data.put(address, &Ephemeral(1), None, None).await?;
        assert!(data.get::<Ephemeral>(address, None).await?.is_none());
        assert_eq!(dht.purge_expired(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_failure_classification() -> Result<()> {
        let (dht, data, address) = setup();

        dht.fail_next(1);
        let err = data.put(address, &note("x", None), None, None).await.unwrap_err();
        assert!(err.is_retryable());

        dht.set_latency(Duration::from_millis(200));
        let err = data
            .get::<Note>(address, None)
            .wait(Duration::from_millis(10))
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        dht.set_latency(Duration::ZERO);

        dht.set_connected(false);
        let err = data.get::<Note>(address, None).await.unwrap_err();
        assert!(matches!(err, SyncError::PreconditionViolation(_)));
        Ok(())
    }

    #[tokio::test]
    async fn test_digest_lists_versions() -> Result<()> {
        let (_dht, data, address) = setup();
        let first = note("v1", None);
        let second = note("v2", Some(first.version_key()?));
        data.put(address, &first, None, None).await?;
        data.put(address, &second, None, None).await?;

        let digest = data.digest(Key::hash("alice")).await?;
        assert_eq!(
            digest.versions_of(&address),
            vec![first.version_key()?, second.version_key()?]
        );
        assert_eq!(digest.entries.get(&address.at(second.version_key()?)), Some(&Some(first.version_key()?)));
        Ok(())
    }

    #[tokio::test]
    async fn test_serialized_writes() -> Result<()> {
        let (dht, data, address) = setup();
        let data = data.with_write_serialization(true);
        assert!(data.serializes_writes());
        dht.set_latency(Duration::from_millis(20));

        let first = note("a", None);
        let second = note("b", None);
        let a = data.put(address, &first, None, None);
        let b = data.put(address, &second, None, None);
        let (a, b) = tokio::join!(a, b);
        a?;
        b?;

        let digest = data.digest(Key::hash("alice")).await?;
        assert_eq!(digest.versions_of(&address).len(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn test_task_queue_is_fifo() -> Result<()> {
        let (dht, data, _) = setup();
        let keys = ProtectionKeys::generate();
        let alice = Key::hash("alice");

        let queued = [(30, "third"), (10, "first"), (20, "second")];
        for (at, text) in queued {
            let id = task_id(at, text.as_bytes());
            data.put_user_profile_task(alice, id, &note(text, None), Some(&keys))
                .await?;
        }
        data.put_user_profile_task(Key::hash("bob"), task_id(1, b"other"), &note("bob", None), None)
            .await?;

        let mut handled = Vec::new();
        while let Some(task) = data.get_user_profile_task::<Note>(alice).await? {
            assert_eq!(task.signed_by, Some(keys.public_key_bytes()));
            handled.push(task.content.text.clone());
            let removed = data
                .remove_user_profile_task(alice, task.key.content, Some(&keys))
                .await?;
            assert_eq!(removed, 1);
        }
        assert_eq!(handled, ["first", "second", "third"]);
        assert_eq!(dht.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_task_removal_needs_key() -> Result<()> {
        let (_dht, data, _) = setup();
        let keys = ProtectionKeys::generate();
        let alice = Key::hash("alice");
        let id = task_id(5, b"t");
        data.put_user_profile_task(alice, id, &note("t", None), Some(&keys))
            .await?;

        let err = data.remove_user_profile_task(alice, id, None).await.unwrap_err();
        assert!(matches!(err, SyncError::ProtectionKeyMismatch(_)));
        assert!(data.get_user_profile_task::<Note>(alice).await?.is_some());
        Ok(())
    }

    #[tokio::test]
    async fn test_address_locks_exclusive() {
        let locks = AddressLocks::default();
        let address = Domain::MetaFile.address(Key::hash("u"), Key::hash("f"));

        let guard = locks.acquire(address).await;
        assert_eq!(locks.active(), 1);
        let waiting = tokio::time::timeout(Duration::from_millis(20), locks.acquire(address)).await;
        assert!(waiting.is_err());

        drop(guard);
        let _again = locks.acquire(address).await;
    }
}
