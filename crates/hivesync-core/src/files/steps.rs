//! Leaf steps of the file processes.
//!
//! Each step performs one externally visible action. Steps that write to the
//! DHT remember what they wrote and remove exactly that on rollback; a step
//! that fails halfway removes its own partial writes before reporting.

use super::context::{FileContext, StoredMeta};
use crate::address::Domain;
use crate::content::NetworkContent;
use crate::crypto::SealedContent;
use crate::error::{Result, SyncError};
use crate::model::{
    append_version, validate_chain, ContentHash, FileChunk, FileVersion, MetaFile, VersionIndex,
};
use crate::process::Step;
use async_trait::async_trait;
use std::path::Path;
use storage::{ContentAddress, Key};

fn local_failure<'a>(
    action: &'static str,
    path: &'a Path,
) -> impl FnOnce(anyhow::Error) -> SyncError + 'a {
    move |err| SyncError::step(format!("cannot {action} {}: {err:#}", path.display()))
}

fn missing(what: &str) -> SyncError {
    SyncError::step(format!("{what} not available to this step"))
}

/// Remove the given snapshots, newest first. Keeps going past failures and
/// reports the first one.
async fn remove_all(ctx: &FileContext, written: Vec<(ContentAddress, Key)>) -> Result<()> {
    let mut first_error = None;
    for (address, version) in written.into_iter().rev() {
        let removed = ctx
            .env
            .data
            .remove(address, Some(version), Some(ctx.keys()))
            .wait(ctx.timeout())
            .await;
        if let Err(err) = removed {
            tracing::warn!("could not remove {}: {}", address.at(version), err);
            first_error.get_or_insert(err);
        }
    }
    first_error.map_or(Ok(()), Err)
}

/// Store one sealed snapshot and return where it landed.
///
/// The target snapshot is known before the put is sent. If the put fails
/// with a retryable error it may still have reached the store, so that
/// snapshot is removed again before the error is reported.
async fn put_sealed(
    ctx: &FileContext,
    address: ContentAddress,
    sealed: &SealedContent,
) -> Result<(ContentAddress, Key)> {
    let attempted = (address, sealed.version_key()?);
    let stored = ctx
        .env
        .data
        .put(address, sealed, Some(ctx.keys()), Some(ctx.keys()))
        .wait(ctx.timeout())
        .await;
    match stored {
        Ok(version) => Ok((address, version)),
        Err(err) if err.is_retryable() => {
            if let Err(cleanup) = remove_all(ctx, vec![attempted]).await {
                tracing::warn!("unconfirmed write to {} left behind: {}", address, cleanup);
            }
            Err(err)
        }
        Err(err) => Err(err),
    }
}

pub struct ReadLocalFile;

#[async_trait]
impl Step<FileContext> for ReadLocalFile {
    fn name(&self) -> &'static str {
        "read-local-file"
    }

    async fn execute(&mut self, ctx: &mut FileContext) -> Result<()> {
        let local = ctx
            .env
            .files
            .read_file(&ctx.path)
            .await
            .map_err(local_failure("read", &ctx.path))?
            .ok_or_else(|| SyncError::step(format!("{} does not exist", ctx.path.display())))?;

        let limit = ctx.env.limits.max_file_size;
        if local.size > limit {
            return Err(SyncError::step(format!(
                "{} is {} bytes, above the {} byte limit",
                ctx.path.display(),
                local.size,
                limit
            )));
        }

        tracing::debug!("read {} ({} bytes)", ctx.path.display(), local.size);
        ctx.local = Some(local);
        Ok(())
    }
}

/// Fetch and open the latest meta file snapshot of the context's file.
pub struct GetMetaFile {
    required: bool,
}

impl GetMetaFile {
    /// A missing meta file is fine: the file is new.
    pub fn optional() -> Self {
        Self { required: false }
    }

    pub fn required() -> Self {
        Self { required: true }
    }
}

#[async_trait]
impl Step<FileContext> for GetMetaFile {
    fn name(&self) -> &'static str {
        "get-meta-file"
    }

    async fn execute(&mut self, ctx: &mut FileContext) -> Result<()> {
        let found = ctx
            .env
            .data
            .get::<SealedContent>(ctx.meta_address(), None)
            .wait(ctx.timeout())
            .await?;

        let Some(found) = found else {
            if self.required {
                return Err(SyncError::step(format!(
                    "{} has never been uploaded",
                    ctx.path.display()
                )));
            }
            tracing::debug!("no meta file yet for {}", ctx.path.display());
            ctx.meta = None;
            return Ok(());
        };

        if found.signed_by != Some(ctx.keys().public_key_bytes()) {
            return Err(SyncError::ProtectionKeyMismatch(format!(
                "meta file of {} is not signed by this user",
                ctx.path.display()
            )));
        }

        let meta: MetaFile = ctx.cipher.open(&found.content)?;
        if meta.file_id() != ctx.file_id {
            return Err(SyncError::step(format!(
                "meta file at {} describes another file",
                ctx.meta_address()
            )));
        }

        tracing::debug!(
            "meta file {} for {} ({})",
            found.version_key().short(),
            ctx.path.display(),
            if meta.is_large() { "large" } else { "small" }
        );
        ctx.meta = Some(StoredMeta {
            meta,
            version: found.version_key(),
        });
        Ok(())
    }
}

/// Materialize the version chain: inline for small meta files, through the
/// resolver for large ones.
pub struct ResolveVersions;

#[async_trait]
impl Step<FileContext> for ResolveVersions {
    fn name(&self) -> &'static str {
        "resolve-versions"
    }

    async fn execute(&mut self, ctx: &mut FileContext) -> Result<()> {
        let versions = match ctx.meta.as_ref().map(|s| &s.meta) {
            None => Vec::new(),
            Some(MetaFile::Small(small)) => {
                validate_chain(&small.versions)?;
                small.versions.clone()
            }
            Some(MetaFile::Large(large)) => {
                ctx.env
                    .resolver
                    .resolve(ctx.env.location, large, &ctx.cipher)
                    .await?
            }
        };
        ctx.versions = versions;
        Ok(())
    }
}

/// Describe the local content as the next version and prepare the meta file
/// that will record it.
pub struct BuildVersion;

#[async_trait]
impl Step<FileContext> for BuildVersion {
    fn name(&self) -> &'static str {
        "build-version"
    }

    async fn execute(&mut self, ctx: &mut FileContext) -> Result<()> {
        let local = ctx.local.as_ref().ok_or_else(|| missing("local file"))?;
        let hash = ContentHash::of(&local.data);
        let latest = ctx.versions.last();

        if let Some(latest) = latest.filter(|v| v.content_hash() == hash) {
            return Err(SyncError::step(format!(
                "{} is unchanged since version {}",
                ctx.path.display(),
                latest.version_key().short()
            )));
        }

        let version = FileVersion::new(
            latest,
            hash,
            local.size,
            local.modified_ms,
            ctx.env.limits.chunk_count(local.size),
        );
        let mut chain = ctx.versions.clone();
        append_version(&mut chain, version.clone())?;

        let (template, current) = match &ctx.meta {
            Some(stored) => (stored.meta.clone(), Some(stored.version)),
            None if local.size > ctx.env.limits.large_file_threshold => {
                (MetaFile::new_large(ctx.file_id), None)
            }
            None => (MetaFile::new_small(ctx.file_id), None),
        };

        tracing::debug!(
            "version {} of {} ({} chunks)",
            version.index(),
            ctx.path.display(),
            version.chunk_count()
        );
        ctx.next_meta = Some(template.successor(current, &chain));
        ctx.next_chain = chain;
        ctx.new_version = Some(version);
        Ok(())
    }

    async fn rollback(&mut self, ctx: &mut FileContext) -> Result<()> {
        ctx.new_version = None;
        ctx.next_meta = None;
        ctx.next_chain.clear();
        Ok(())
    }
}

/// Store the payload of the new version as sealed chunks.
#[derive(Default)]
pub struct PutChunks {
    written: Vec<(ContentAddress, Key)>,
}

impl PutChunks {
    async fn put_all(&mut self, ctx: &FileContext) -> Result<()> {
        let version = ctx.new_version.as_ref().ok_or_else(|| missing("new version"))?;
        let local = ctx.local.as_ref().ok_or_else(|| missing("local file"))?;
        let version_key = version.version_key();

        for (index, piece) in local.data.chunks(ctx.env.limits.chunk_size).enumerate() {
            let index = index as u32;
            let chunk = FileChunk {
                version: version_key,
                index,
                data: piece.to_vec(),
                ttl: ctx.env.limits.chunk_ttl,
            };
            let sealed = ctx.cipher.seal(&chunk)?;
            let address = ctx.chunk_address(&version_key, index);
            self.written.push(put_sealed(ctx, address, &sealed).await?);
        }
        tracing::debug!("stored {} chunks of {}", self.written.len(), version_key.short());
        Ok(())
    }
}

#[async_trait]
impl Step<FileContext> for PutChunks {
    fn name(&self) -> &'static str {
        "put-chunks"
    }

    async fn execute(&mut self, ctx: &mut FileContext) -> Result<()> {
        if let Err(err) = self.put_all(ctx).await {
            if let Err(cleanup) = remove_all(ctx, std::mem::take(&mut self.written)).await {
                tracing::warn!("partial chunk upload left behind: {}", cleanup);
            }
            return Err(err);
        }
        Ok(())
    }

    async fn rollback(&mut self, ctx: &mut FileContext) -> Result<()> {
        remove_all(ctx, std::mem::take(&mut self.written)).await
    }
}

/// Store the external version chain of a large file. Small files carry their
/// chain inline, so this step does nothing for them.
#[derive(Default)]
pub struct PutVersionIndex {
    written: Option<(ContentAddress, Key)>,
}

#[async_trait]
impl Step<FileContext> for PutVersionIndex {
    fn name(&self) -> &'static str {
        "put-version-index"
    }

    async fn execute(&mut self, ctx: &mut FileContext) -> Result<()> {
        let Some(MetaFile::Large(large)) = &ctx.next_meta else {
            return Ok(());
        };
        let address = Domain::VersionIndex.address(ctx.env.location, large.index);

        let current = ctx
            .env
            .data
            .get::<SealedContent>(address, None)
            .wait(ctx.timeout())
            .await?
            .map(|found| found.version_key());
        let index = VersionIndex {
            file_id: ctx.file_id,
            based_on: current,
            versions: ctx.next_chain.clone(),
        };
        let sealed = ctx.cipher.seal(&index)?;
        self.written = Some(put_sealed(ctx, address, &sealed).await?);
        Ok(())
    }

    async fn rollback(&mut self, ctx: &mut FileContext) -> Result<()> {
        remove_all(ctx, self.written.take().into_iter().collect()).await
    }
}

/// Store the next meta file snapshot, superseding the one read earlier.
#[derive(Default)]
pub struct PutMetaFile {
    written: Option<(ContentAddress, Key)>,
}

#[async_trait]
impl Step<FileContext> for PutMetaFile {
    fn name(&self) -> &'static str {
        "put-meta-file"
    }

    async fn execute(&mut self, ctx: &mut FileContext) -> Result<()> {
        let next = ctx.next_meta.as_ref().ok_or_else(|| missing("next meta file"))?;
        let sealed = ctx.cipher.seal(next)?;
        let address = ctx.meta_address();

        let written = put_sealed(ctx, address, &sealed).await?;
        tracing::info!("{} now at meta version {}", ctx.path.display(), written.1.short());
        self.written = Some(written);
        Ok(())
    }

    async fn rollback(&mut self, ctx: &mut FileContext) -> Result<()> {
        remove_all(ctx, self.written.take().into_iter().collect()).await
    }
}

/// Pick the version to download: the requested one or the latest.
pub struct SelectVersion;

#[async_trait]
impl Step<FileContext> for SelectVersion {
    fn name(&self) -> &'static str {
        "select-version"
    }

    async fn execute(&mut self, ctx: &mut FileContext) -> Result<()> {
        let selected = match ctx.requested {
            None => ctx.versions.last(),
            Some(wanted) => ctx.versions.iter().find(|v| v.version_key() == wanted),
        };
        let selected = selected.cloned().ok_or_else(|| match ctx.requested {
            None => SyncError::step(format!("{} has no versions", ctx.path.display())),
            Some(wanted) => SyncError::step(format!(
                "{} has no version {}",
                ctx.path.display(),
                wanted.short()
            )),
        })?;
        ctx.selected = Some(selected);
        Ok(())
    }
}

/// Fetch, open and verify every chunk of the selected version.
pub struct GetChunks;

#[async_trait]
impl Step<FileContext> for GetChunks {
    fn name(&self) -> &'static str {
        "get-chunks"
    }

    async fn execute(&mut self, ctx: &mut FileContext) -> Result<()> {
        let version = ctx.selected.clone().ok_or_else(|| missing("selected version"))?;
        let version_key = version.version_key();
        let limit = ctx.env.limits.max_file_size;
        if version.size() > limit {
            return Err(SyncError::step(format!(
                "version {} is {} bytes, above the {} byte limit",
                version_key.short(),
                version.size(),
                limit
            )));
        }
        let mut payload = Vec::with_capacity(usize::try_from(version.size()).unwrap_or(0));

        for index in 0..version.chunk_count() {
            let found = ctx
                .env
                .data
                .get::<SealedContent>(ctx.chunk_address(&version_key, index), None)
                .wait(ctx.timeout())
                .await?
                .ok_or_else(|| {
                    SyncError::step(format!(
                        "chunk {index} of version {} is missing",
                        version_key.short()
                    ))
                })?;
            let chunk: FileChunk = ctx.cipher.open(&found.content)?;
            if chunk.version != version_key || chunk.index != index {
                return Err(SyncError::step(format!(
                    "chunk {index} of version {} is misplaced",
                    version_key.short()
                )));
            }
            payload.extend_from_slice(&chunk.data);
        }

        if payload.len() as u64 != version.size()
            || ContentHash::of(&payload) != version.content_hash()
        {
            return Err(SyncError::step(format!(
                "payload of version {} fails verification",
                version_key.short()
            )));
        }
        ctx.payload = Some(payload);
        Ok(())
    }
}

/// Overwrite the local file. Rollback restores what was there before.
#[derive(Default)]
pub struct WriteLocalFile {
    previous: Option<Option<Vec<u8>>>,
}

#[async_trait]
impl Step<FileContext> for WriteLocalFile {
    fn name(&self) -> &'static str {
        "write-local-file"
    }

    async fn execute(&mut self, ctx: &mut FileContext) -> Result<()> {
        let payload = ctx.payload.as_ref().ok_or_else(|| missing("payload"))?;
        let files = &ctx.env.files;

        let previous = files
            .read_file(&ctx.path)
            .await
            .map_err(local_failure("read", &ctx.path))?;
        files
            .write_file(&ctx.path, payload)
            .await
            .map_err(local_failure("write", &ctx.path))?;

        tracing::info!("wrote {} ({} bytes)", ctx.path.display(), payload.len());
        self.previous = Some(previous.map(|f| f.data));
        Ok(())
    }

    async fn rollback(&mut self, ctx: &mut FileContext) -> Result<()> {
        let files = &ctx.env.files;
        match self.previous.take() {
            Some(Some(bytes)) => files
                .write_file(&ctx.path, &bytes)
                .await
                .map_err(local_failure("restore", &ctx.path)),
            Some(None) => files
                .remove_file(&ctx.path)
                .await
                .map(|_| ())
                .map_err(local_failure("remove", &ctx.path)),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::files::testing;
    use crate::keys::ProtectionKeys;
    use std::sync::Arc;
    use storage::{FileStore, LocalFiles, MemoryDht};
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_write_rollback_restores_previous() -> anyhow::Result<()> {
        let temp = TempDir::new()?;
        let files = LocalFiles::new(temp.path().to_path_buf())?;
        let env = testing::env(&MemoryDht::new(), Arc::new(files.clone()), testing::limits());
        let path = Path::new("a.txt");

        files.write_file(path, b"old").await?;
        let mut ctx = FileContext::new(env.clone(), path)?;
        ctx.payload = Some(b"new".to_vec());
        let mut step = WriteLocalFile::default();
        step.execute(&mut ctx).await?;
        assert_eq!(files.read_file(path).await?.map(|f| f.data), Some(b"new".to_vec()));
        step.rollback(&mut ctx).await?;
        assert_eq!(files.read_file(path).await?.map(|f| f.data), Some(b"old".to_vec()));

        let fresh = Path::new("b.txt");
        let mut ctx = FileContext::new(env, fresh)?;
        ctx.payload = Some(b"new".to_vec());
        let mut step = WriteLocalFile::default();
        step.execute(&mut ctx).await?;
        step.rollback(&mut ctx).await?;
        assert_eq!(files.read_file(fresh).await?, None);
        Ok(())
    }

    #[tokio::test]
    async fn test_put_chunks_cleans_up_partial_upload() -> anyhow::Result<()> {
        let temp = TempDir::new()?;
        let dht = MemoryDht::new();
        let files = LocalFiles::new(temp.path().to_path_buf())?;
        let env = testing::env(&dht, Arc::new(files), testing::limits());
        let mut ctx = FileContext::new(env, Path::new("c.bin"))?;

        let data = vec![7u8; 10];
        ctx.local = Some(storage::LocalFile {
            size: data.len() as u64,
            data,
            modified_ms: 1,
        });
        BuildVersion.execute(&mut ctx).await?;

        let mut first = PutChunks::default();
        first.execute(&mut ctx).await?;
        assert_eq!(dht.len(), 3);
        first.rollback(&mut ctx).await?;
        assert!(dht.is_empty());

        // Another user owns the slot of the second chunk.
        let version = ctx.new_version.clone().expect("built");
        let taken = ctx.chunk_address(&version.version_key(), 1);
        let intruder = ProtectionKeys::generate();
        let squatter = FileChunk {
            version: Key::ZERO,
            index: 0,
            data: Vec::new(),
            ttl: storage::TimeToLive::Unlimited,
        };
        ctx.env
            .data
            .put(taken, &squatter, None, Some(&intruder))
            .await?;

        let mut second = PutChunks::default();
        let err = second.execute(&mut ctx).await.unwrap_err();
        assert!(matches!(err, SyncError::ProtectionKeyMismatch(_)));
        assert_eq!(dht.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_oversized_version_is_not_fetched() -> anyhow::Result<()> {
        let temp = TempDir::new()?;
        let dht = MemoryDht::new();
        let files = LocalFiles::new(temp.path().to_path_buf())?;
        let env = testing::env(&dht, Arc::new(files), testing::limits());
        let mut ctx = FileContext::new(env, Path::new("huge.bin"))?;

        let claimed = u64::MAX;
        ctx.selected = Some(FileVersion::new(None, ContentHash::of(b"x"), claimed, 1, 1));
        dht.set_connected(false);
        let err = GetChunks.execute(&mut ctx).await.unwrap_err();
        assert!(matches!(err, SyncError::StepExecutionFailure(ref m) if m.contains("limit")));
        assert!(ctx.payload.is_none());
        Ok(())
    }
}
