//! Shared state of the file processes.

use super::resolver::VersionResolver;
use crate::address::{self, Domain};
use crate::config::SyncConfig;
use crate::crypto::ContentCipher;
use crate::data::DataManager;
use crate::error::Result;
use crate::keys::ProtectionKeys;
use crate::model::{FileVersion, MetaFile};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use storage::{ContentAddress, FileStore, Key, LocalFile, TimeToLive};

/// Size limits and timeouts applied by the file steps.
#[derive(Debug, Clone)]
pub struct FileLimits {
    pub chunk_size: usize,
    pub max_file_size: u64,
    pub large_file_threshold: u64,
    pub chunk_ttl: TimeToLive,
    pub network_timeout: Duration,
}

impl FileLimits {
    pub fn from_config(cfg: &SyncConfig) -> Self {
        Self {
            chunk_size: cfg.chunk_size.max(1),
            max_file_size: cfg.max_file_size,
            large_file_threshold: cfg.large_file_threshold,
            chunk_ttl: cfg
                .chunk_ttl_secs
                .map(TimeToLive::Seconds)
                .unwrap_or(TimeToLive::Unlimited),
            network_timeout: cfg.network_timeout(),
        }
    }

    pub fn chunk_count(&self, size: u64) -> u32 {
        chunk_count(size, self.chunk_size)
    }
}

/// Number of chunks a payload of `size` bytes is split into.
pub fn chunk_count(size: u64, chunk_size: usize) -> u32 {
    let chunk_size = chunk_size.max(1) as u64;
    size.div_ceil(chunk_size) as u32
}

/// Collaborators every file process needs, cloned into each context.
#[derive(Clone)]
pub struct FileEnv {
    pub data: DataManager,
    pub files: Arc<dyn FileStore>,
    pub resolver: Arc<dyn VersionResolver>,
    pub keys: Arc<ProtectionKeys>,
    pub location: Key,
    pub limits: FileLimits,
}

/// The meta file snapshot found in the DHT.
#[derive(Debug, Clone)]
pub struct StoredMeta {
    pub meta: MetaFile,
    pub version: Key,
}

/// Process context of one file. Owned by exactly one running tree; steps
/// read what earlier steps left here and add their own results.
pub struct FileContext {
    pub env: FileEnv,
    pub path: PathBuf,
    pub file_id: Key,
    pub cipher: ContentCipher,

    pub local: Option<LocalFile>,
    pub meta: Option<StoredMeta>,
    pub versions: Vec<FileVersion>,

    // upload
    pub new_version: Option<FileVersion>,
    pub next_meta: Option<MetaFile>,
    pub next_chain: Vec<FileVersion>,

    // download
    pub requested: Option<Key>,
    pub selected: Option<FileVersion>,
    pub payload: Option<Vec<u8>>,
}

impl FileContext {
    pub fn new(env: FileEnv, path: &Path) -> Result<Self> {
        let file_id = address::file_id(path);
        let cipher = ContentCipher::derive(&env.keys, &file_id)?;
        Ok(Self {
            env,
            path: path.to_path_buf(),
            file_id,
            cipher,
            local: None,
            meta: None,
            versions: Vec::new(),
            new_version: None,
            next_meta: None,
            next_chain: Vec::new(),
            requested: None,
            selected: None,
            payload: None,
        })
    }

    /// Download a specific version instead of the latest one.
    pub fn requesting(mut self, version: Option<Key>) -> Self {
        self.requested = version;
        self
    }

    pub fn meta_address(&self) -> ContentAddress {
        Domain::MetaFile.address(self.env.location, self.file_id)
    }

    pub fn chunk_address(&self, version: &Key, index: u32) -> ContentAddress {
        let content = crate::model::FileChunk::content_key(version, index);
        Domain::FileChunk.address(self.env.location, content)
    }

    pub fn timeout(&self) -> Duration {
        self.env.limits.network_timeout
    }

    pub fn keys(&self) -> &ProtectionKeys {
        &self.env.keys
    }
}
