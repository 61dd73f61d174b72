//! File synchronization processes built on the process framework.

mod context;
mod processes;
mod resolver;
mod steps;

pub use context::{chunk_count, FileContext, FileEnv, FileLimits, StoredMeta};
pub use processes::{
    download_process, file_versions_process, inspect_remote_process, upload_process,
};
pub use resolver::{DhtVersionResolver, VersionResolver};
pub use steps::{
    BuildVersion, GetChunks, GetMetaFile, PutChunks, PutMetaFile, PutVersionIndex, ReadLocalFile,
    ResolveVersions, SelectVersion, WriteLocalFile,
};

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::address::user_location;
    use crate::data::DataManager;
    use crate::keys::ProtectionKeys;
    use std::sync::Arc;
    use std::time::Duration;
    use storage::{DhtStore, FileStore, MemoryDht, TimeToLive};

    /// Tiny chunks so short test payloads span several of them.
    pub fn limits() -> FileLimits {
        FileLimits {
            chunk_size: 4,
            max_file_size: 1024,
            large_file_threshold: 1024,
            chunk_ttl: TimeToLive::Unlimited,
            network_timeout: Duration::from_secs(2),
        }
    }

    pub fn env(dht: &MemoryDht, files: Arc<dyn FileStore>, limits: FileLimits) -> FileEnv {
        env_for(dht, files, Arc::new(ProtectionKeys::generate()), limits)
    }

    pub fn env_for(
        dht: &MemoryDht,
        files: Arc<dyn FileStore>,
        keys: Arc<ProtectionKeys>,
        limits: FileLimits,
    ) -> FileEnv {
        env_on(Arc::new(dht.clone()), files, keys, limits)
    }

    pub fn env_on(
        store: Arc<dyn DhtStore>,
        files: Arc<dyn FileStore>,
        keys: Arc<ProtectionKeys>,
        limits: FileLimits,
    ) -> FileEnv {
        let data = DataManager::new(store);
        FileEnv {
            resolver: Arc::new(DhtVersionResolver::new(data.clone(), limits.network_timeout)),
            data,
            files,
            keys,
            location: user_location("alice"),
            limits,
        }
    }
}
