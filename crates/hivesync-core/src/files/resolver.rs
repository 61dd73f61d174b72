//! Enumeration of version chains that are not stored inline.

use crate::address::Domain;
use crate::crypto::{ContentCipher, SealedContent};
use crate::data::DataManager;
use crate::error::{Result, SyncError};
use crate::model::{validate_chain, FileVersion, MetaFileLarge, VersionIndex};
use async_trait::async_trait;
use std::time::Duration;
use storage::Key;

/// Resolves the version chain of a large meta file.
#[async_trait]
pub trait VersionResolver: Send + Sync {
    async fn resolve(
        &self,
        location: Key,
        meta: &MetaFileLarge,
        cipher: &ContentCipher,
    ) -> Result<Vec<FileVersion>>;
}

/// Reads the sealed [`VersionIndex`] of a large file from the DHT.
pub struct DhtVersionResolver {
    data: DataManager,
    timeout: Duration,
}

impl DhtVersionResolver {
    pub fn new(data: DataManager, timeout: Duration) -> Self {
        Self { data, timeout }
    }
}

#[async_trait]
impl VersionResolver for DhtVersionResolver {
    async fn resolve(
        &self,
        location: Key,
        meta: &MetaFileLarge,
        cipher: &ContentCipher,
    ) -> Result<Vec<FileVersion>> {
        let address = Domain::VersionIndex.address(location, meta.index);
        let stored = self
            .data
            .get::<SealedContent>(address, None)
            .wait(self.timeout)
            .await?;

        let versions = match stored {
            Some(found) => {
                let index: VersionIndex = cipher.open(&found.content)?;
                if index.file_id != meta.file_id {
                    return Err(SyncError::step(format!(
                        "version index {} belongs to another file",
                        meta.index.short()
                    )));
                }
                index.versions
            }
            None => Vec::new(),
        };

        validate_chain(&versions)?;
        if versions.len() as u64 != meta.version_count
            || versions.last().map(|v| v.version_key())
                != meta.latest.as_ref().map(|v| v.version_key())
        {
            return Err(SyncError::step(format!(
                "version index of {} is out of step with its meta file ({} of {} versions)",
                meta.file_id.short(),
                versions.len(),
                meta.version_count
            )));
        }
        tracing::debug!("resolved {} versions from index {}", versions.len(), meta.index.short());
        Ok(versions)
    }
}
