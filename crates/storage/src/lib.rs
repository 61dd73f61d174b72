//! Storage collaborators: the DHT key-value boundary and the local file system.

pub mod dht;
pub mod files;
pub mod memory;

pub use dht::{
    ContentAddress, DhtError, DhtStore, DigestInfo, Entry, Key, KeyRange, Order, Protection,
    StorageKey, TimeToLive, WriteAuth,
};
pub use files::{FileStore, LocalFile, LocalFiles};
pub use memory::{DhtSnapshot, MemoryDht};
