//! High-level client that drives the file processes for one user.
//!
//! The client is generic over the local [`FileStore`] and talks to the
//! network through a shared [`DhtStore`]. Every operation runs as a process
//! tree on the client's [`ProcessManager`], so it can be paused, cancelled
//! and rolled back like any other process.

use crate::address::user_location;
use crate::config::SyncConfig;
use crate::data::DataManager;
use crate::error::SyncError;
use crate::files::{
    download_process, file_versions_process, inspect_remote_process, upload_process,
    DhtVersionResolver, FileContext, FileEnv, FileLimits, VersionResolver,
};
use crate::keys::ProtectionKeys;
use crate::model::FileVersion;
use crate::process::{ProcessFailure, ProcessHandle, ProcessManager, ResultProcess};
use crate::sync::{
    ConflictPolicy, LocalSnapshot, Resolution, SurfaceConflict, SyncDecision, Synchronizer,
};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use storage::{DhtStore, FileStore, Key};

/// What [`SyncClient::sync_file`] did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    Unchanged,
    Uploaded(FileVersion),
    Downloaded(FileVersion),
}

impl SyncOutcome {
    /// The version local and remote agree on afterwards, if any.
    pub fn version(&self) -> Option<&FileVersion> {
        match self {
            SyncOutcome::Unchanged => None,
            SyncOutcome::Uploaded(v) | SyncOutcome::Downloaded(v) => Some(v),
        }
    }
}

#[derive(Clone)]
pub struct SyncClient<F> {
    pub cfg: SyncConfig,
    pub keys: Arc<ProtectionKeys>,
    pub files: Arc<F>,
    data: DataManager,
    processes: ProcessManager,
    resolver: Arc<dyn VersionResolver>,
    policy: Arc<dyn ConflictPolicy>,
    synchronizer: Synchronizer,
    location: Key,
    op_timeout: Option<Duration>,
}

impl<F> SyncClient<F>
where
    F: FileStore + 'static,
{
    pub fn new(cfg: SyncConfig, keys: ProtectionKeys, store: Arc<dyn DhtStore>, files: F) -> Self {
        let data = DataManager::new(store).with_write_serialization(cfg.serialize_writes);
        let resolver = Arc::new(DhtVersionResolver::new(data.clone(), cfg.network_timeout()));
        Self {
            keys: Arc::new(keys),
            files: Arc::new(files),
            processes: ProcessManager::new(),
            resolver,
            policy: Arc::new(SurfaceConflict),
            synchronizer: Synchronizer::new(cfg.chunk_size),
            location: user_location(&cfg.user_id),
            op_timeout: None,
            data,
            cfg,
        }
    }

    /// Bound every process tree the client runs. A tree still running when
    /// the bound expires is cancelled and compensated before the call
    /// returns a network failure.
    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.op_timeout = Some(timeout);
        self
    }

    pub fn with_conflict_policy(mut self, policy: impl ConflictPolicy + 'static) -> Self {
        self.policy = Arc::new(policy);
        self
    }

    pub fn processes(&self) -> &ProcessManager {
        &self.processes
    }

    pub fn data(&self) -> &DataManager {
        &self.data
    }

    pub fn location(&self) -> Key {
        self.location
    }

    pub fn env(&self) -> FileEnv {
        FileEnv {
            data: self.data.clone(),
            files: self.files.clone(),
            resolver: self.resolver.clone(),
            keys: self.keys.clone(),
            location: self.location,
            limits: FileLimits::from_config(&self.cfg),
        }
    }

    fn context(&self, path: &Path) -> crate::error::Result<FileContext> {
        FileContext::new(self.env(), path)
    }

    /// Start uploading the current local content of `path`.
    pub fn start_upload(&self, path: &Path) -> crate::error::Result<ProcessHandle<FileContext>> {
        tracing::info!("Starting upload: {}", path.display());
        self.processes
            .start(Box::new(upload_process()), self.context(path)?)
    }

    /// Start downloading `version` (or the latest one) of `path`.
    pub fn start_download(
        &self,
        path: &Path,
        version: Option<Key>,
    ) -> crate::error::Result<ProcessHandle<FileContext>> {
        tracing::info!("Starting download: {}", path.display());
        let ctx = self.context(path)?.requesting(version);
        self.processes.start(Box::new(download_process()), ctx)
    }

    /// A not yet started version listing for `path`. Attach listeners before
    /// handing both halves to [`ProcessManager::start`].
    pub fn file_versions_process(
        &self,
        path: &Path,
    ) -> crate::error::Result<(ResultProcess<FileContext, Vec<FileVersion>>, FileContext)> {
        Ok((file_versions_process(), self.context(path)?))
    }

    pub async fn upload_file(&self, path: &Path) -> Result<FileVersion, ProcessFailure> {
        let handle = self
            .start_upload(path)
            .map_err(|e| ProcessFailure::new(e, "upload-file"))?;
        let ctx = self.finish(handle, "upload-file").await?;
        let version = ctx
            .new_version
            .ok_or_else(|| ProcessFailure::new(SyncError::step("no version built"), "upload-file"))?;
        tracing::info!("Uploaded {} as {}", path.display(), version.version_key().short());
        Ok(version)
    }

    pub async fn download_file(
        &self,
        path: &Path,
        version: Option<Key>,
    ) -> Result<FileVersion, ProcessFailure> {
        let handle = self
            .start_download(path, version)
            .map_err(|e| ProcessFailure::new(e, "download-file"))?;
        let ctx = self.finish(handle, "download-file").await?;
        let version = ctx.selected.ok_or_else(|| {
            ProcessFailure::new(SyncError::step("no version selected"), "download-file")
        })?;
        tracing::info!("Downloaded {} at {}", path.display(), version.version_key().short());
        Ok(version)
    }

    /// Version chain of `path`, oldest first.
    pub async fn get_file_versions(&self, path: &Path) -> Result<Vec<FileVersion>, ProcessFailure> {
        let fail = |e| ProcessFailure::new(e, "get-file-versions");
        let (process, ctx) = self.file_versions_process(path).map_err(fail)?;

        let (tx, rx) = tokio::sync::oneshot::channel();
        process.attach(move |versions: &Vec<FileVersion>| {
            let _ = tx.send(versions.clone());
        });
        let handle = self.processes.start(Box::new(process), ctx).map_err(fail)?;
        self.finish(handle, "get-file-versions").await?;

        rx.await
            .map_err(|_| fail(SyncError::step("version listing delivered no result")))
    }

    /// Bring local and remote copies of `path` into agreement.
    ///
    /// `last_synced` is the remote version the local file was last equal to.
    /// Conflicts go through the configured [`ConflictPolicy`]; a surfaced
    /// conflict fails with [`SyncError::ConflictDetected`].
    pub async fn sync_file(
        &self,
        path: &Path,
        last_synced: Option<Key>,
    ) -> Result<SyncOutcome, ProcessFailure> {
        let fail = |e| ProcessFailure::new(e, "sync-file");

        // 1) Snapshot the local copy
        let local = self
            .files
            .read_file(path)
            .await
            .map_err(|e| fail(SyncError::step(format!("reading {}: {e:#}", path.display()))))?
            .map(|file| LocalSnapshot::of(path, &file));

        // 2) Load the remote history
        let handle = self
            .processes
            .start(Box::new(inspect_remote_process()), self.context(path).map_err(fail)?)
            .map_err(fail)?;
        let remote = self.finish(handle, "inspect-remote").await?.versions;

        // 3) Decide and act
        let decision = self.synchronizer.decide(local.as_ref(), last_synced, &remote);
        tracing::debug!("sync decision for {}: {:?}", path.display(), decision);
        match decision {
            SyncDecision::NoChange => Ok(SyncOutcome::Unchanged),
            SyncDecision::Upload(_) => Ok(SyncOutcome::Uploaded(self.upload_file(path).await?)),
            SyncDecision::Download(v) => Ok(SyncOutcome::Downloaded(
                self.download_file(path, Some(v.version_key())).await?,
            )),
            SyncDecision::Conflict(conflict) => match self.policy.resolve(&conflict) {
                Resolution::Surface => {
                    tracing::warn!("Conflict on {}", path.display());
                    Err(fail(conflict.into_error()))
                }
                Resolution::KeepLocal => Ok(SyncOutcome::Uploaded(self.upload_file(path).await?)),
                Resolution::TakeRemote => Ok(SyncOutcome::Downloaded(
                    self.download_file(path, Some(conflict.remote.version_key()))
                        .await?,
                )),
            },
        }
    }

    /// Drive a started tree to rest and hand back its context.
    async fn finish(
        &self,
        handle: ProcessHandle<FileContext>,
        op: &'static str,
    ) -> Result<FileContext, ProcessFailure> {
        let report = match self.op_timeout {
            Some(timeout) => handle.wait(timeout).await,
            None => handle.join().await,
        };
        report.map_err(|e| ProcessFailure::new(e, op))?.into_context()
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::{PreferLocal, PreferRemote};
    use storage::{LocalFiles, MemoryDht};
    use tempfile::TempDir;

    struct Device {
        _dir: TempDir,
        client: SyncClient<LocalFiles>,
    }

    fn device(dht: &MemoryDht, secret: [u8; 32]) -> anyhow::Result<Device> {
        let dir = TempDir::new()?;
        let mut cfg = SyncConfig::default().with_user("alice");
        cfg.data_dir = dir.path().join("data");
        cfg.sync_root = dir.path().join("files");
        cfg.chunk_size = 4;
        let files = LocalFiles::new(cfg.sync_root.clone())?;
        let keys = ProtectionKeys::from_secret(secret);
        let client = SyncClient::new(cfg, keys, Arc::new(dht.clone()), files);
        Ok(Device { _dir: dir, client })
    }

    #[tokio::test]
    async fn test_upload_versions_download() -> anyhow::Result<()> {
        let dht = MemoryDht::new();
        let laptop = device(&dht, [7u8; 32])?;
        let phone = device(&dht, [7u8; 32])?;
        let path = Path::new("report.md");

        laptop.client.files.write_file(path, b"draft one").await?;
        let v1 = laptop.client.upload_file(path).await?;
        laptop.client.files.write_file(path, b"draft two!").await?;
        let v2 = laptop.client.upload_file(path).await?;

        let versions = phone.client.get_file_versions(path).await?;
        assert_eq!(versions, vec![v1.clone(), v2.clone()]);

        let got = phone.client.download_file(path, None).await?;
        assert_eq!(got, v2);
        let local = phone.client.files.read_file(path).await?;
        assert_eq!(local.map(|f| f.data), Some(b"draft two!".to_vec()));
        assert!(phone.client.processes().running().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_versions_of_unknown_file_fail() -> anyhow::Result<()> {
        let dht = MemoryDht::new();
        let laptop = device(&dht, [1u8; 32])?;
        let failure = laptop
            .client
            .get_file_versions(Path::new("never.txt"))
            .await
            .unwrap_err();
        assert_eq!(failure.path, ["get-file-versions", "get-meta-file"]);
        assert_eq!(failure.kind(), "step");
        Ok(())
    }

    #[tokio::test]
    async fn test_sync_round_trip_between_devices() -> anyhow::Result<()> {
        let dht = MemoryDht::new();
        let laptop = device(&dht, [3u8; 32])?;
        let phone = device(&dht, [3u8; 32])?;
        let path = Path::new("todo.txt");

        laptop.client.files.write_file(path, b"milk").await?;
        let uploaded = laptop.client.sync_file(path, None).await?;
        let Some(base) = uploaded.version().cloned() else {
            panic!("expected upload, got {uploaded:?}");
        };
        assert!(matches!(uploaded, SyncOutcome::Uploaded(_)));

        let pulled = phone.client.sync_file(path, None).await?;
        assert_eq!(pulled, SyncOutcome::Downloaded(base.clone()));
        assert_eq!(
            phone.client.sync_file(path, Some(base.version_key())).await?,
            SyncOutcome::Unchanged
        );

        phone.client.files.write_file(path, b"milk, eggs").await?;
        let pushed = phone.client.sync_file(path, Some(base.version_key())).await?;
        let SyncOutcome::Uploaded(next) = pushed else {
            panic!("expected upload, got {pushed:?}");
        };
        assert_eq!(next.based_on(), Some(base.version_key()));

        let refreshed = laptop.client.sync_file(path, Some(base.version_key())).await?;
        assert_eq!(refreshed, SyncOutcome::Downloaded(next));
        let local = laptop.client.files.read_file(path).await?;
        assert_eq!(local.map(|f| f.data), Some(b"milk, eggs".to_vec()));
        Ok(())
    }

    #[tokio::test]
    async fn test_conflict_policies() -> anyhow::Result<()> {
        let dht = MemoryDht::new();
        let laptop = device(&dht, [9u8; 32])?;
        let path = Path::new("shared.txt");

        laptop.client.files.write_file(path, b"base").await?;
        let base = laptop.client.upload_file(path).await?;
        laptop.client.files.write_file(path, b"remote edit").await?;
        let remote = laptop.client.upload_file(path).await?;

        // Local edit made against `base` while `remote` was published.
        laptop.client.files.write_file(path, b"local edit").await?;
        let failure = laptop
            .client
            .sync_file(path, Some(base.version_key()))
            .await
            .unwrap_err();
        assert!(matches!(
            failure.error,
            SyncError::ConflictDetected { remote_version, .. } if remote_version == remote.version_key()
        ));

        let keep = laptop.client.clone().with_conflict_policy(PreferLocal);
        let kept = keep.sync_file(path, Some(base.version_key())).await?;
        assert!(matches!(kept, SyncOutcome::Uploaded(ref v) if v.based_on() == Some(remote.version_key())));

        laptop.client.files.write_file(path, b"another local edit").await?;
        let take = laptop.client.clone().with_conflict_policy(PreferRemote);
        let taken = take.sync_file(path, Some(remote.version_key())).await?;
        let latest = kept.version().cloned();
        assert_eq!(taken.version(), latest.as_ref());
        let local = laptop.client.files.read_file(path).await?;
        assert_eq!(local.map(|f| f.data), Some(b"local edit".to_vec()));
        Ok(())
    }

    #[tokio::test]
    async fn test_operation_timeout_cancels_and_settles() -> anyhow::Result<()> {
        let dht = MemoryDht::new();
        let mut laptop = device(&dht, [5u8; 32])?;
        laptop.client.cfg.network_timeout_ms = 10_000;
        let client = laptop.client.clone().with_operation_timeout(Duration::from_millis(50));
        let path = Path::new("slow.txt");

        client.files.write_file(path, b"payload").await?;
        dht.set_latency(Duration::from_millis(200));
        let failure = client.sync_file(path, None).await.unwrap_err();
        assert!(failure.error.is_retryable());
        assert_eq!(failure.kind(), "network");
        assert!(client.processes().running().is_empty());

        dht.set_latency(Duration::ZERO);
        assert!(dht.is_empty());
        let uploaded = client.sync_file(path, None).await?;
        assert!(matches!(uploaded, SyncOutcome::Uploaded(_)));
        Ok(())
    }
}
