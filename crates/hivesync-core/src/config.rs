use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Directory for keys, the sync index and the local DHT snapshot
    pub data_dir: PathBuf,

    /// Folder kept in sync with the network
    pub sync_root: PathBuf,

    /// User id; hashed into the location key of everything this user stores
    pub user_id: String,

    /// Size of the chunks a file payload is split into (256 KiB)
    pub chunk_size: usize,

    /// Files larger than this are refused
    pub max_file_size: u64,

    /// New files above this size keep their version chain in a separate index
    pub large_file_threshold: u64,

    /// Bounded wait applied to every network operation, in milliseconds
    pub network_timeout_ms: u64,

    /// Serialize puts/removes that target the same slot
    pub serialize_writes: bool,

    /// Optional time-to-live for payload chunks, in seconds
    pub chunk_ttl_secs: Option<u32>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        let base = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        Self {
            data_dir: base.join(".hivesync"),
            sync_root: base.join("hivesync"),
            user_id: "".to_string(),
            chunk_size: 256 * 1024, // 256 KiB
            max_file_size: 512 * 1024 * 1024,
            large_file_threshold: 64 * 1024 * 1024,
            network_timeout_ms: 10_000,
            serialize_writes: false,
            chunk_ttl_secs: None,
        }
    }
}

impl SyncConfig {
    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = user_id.into();
        self
    }

    pub fn network_timeout(&self) -> Duration {
        Duration::from_millis(self.network_timeout_ms)
    }

    pub fn keys_path(&self) -> PathBuf {
        self.data_dir.join("protection.key")
    }

    pub fn dht_snapshot_path(&self) -> PathBuf {
        self.data_dir.join("dht.bin")
    }

    pub fn sync_index_path(&self) -> PathBuf {
        self.data_dir.join("sync-index.json")
    }

    pub fn ensure_data_dir(&self) -> anyhow::Result<()> {
        std::fs::create_dir_all(&self.data_dir)?;
        std::fs::create_dir_all(&self.sync_root)?;
        Ok(())
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let cfg = serde_json::from_str(&json).context("Invalid config file")?;
        Ok(cfg)
    }

    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)
            .with_context(|| format!("Failed to write config {}", path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_config_save_load() -> anyhow::Result<()> {
        let temp = TempDir::new()?;
        let mut cfg = SyncConfig::default().with_user("alice");
        cfg.data_dir = temp.path().join("data");
        cfg.sync_root = temp.path().join("files");
        cfg.serialize_writes = true;
        cfg.ensure_data_dir()?;

        let path = cfg.data_dir.join("config.json");
        cfg.save(&path)?;
        let loaded = SyncConfig::load(&path)?;

        assert_eq!(loaded.user_id, "alice");
        assert!(loaded.serialize_writes);
        assert_eq!(loaded.chunk_size, 256 * 1024);
        assert_eq!(loaded.network_timeout(), Duration::from_secs(10));
        Ok(())
    }
}
