//! Local/remote version reconciliation.
//!
//! [`Synchronizer::decide`] compares a local snapshot with the remote version
//! chain and, optionally, the version the two sides last agreed on. The
//! outcome depends only on its inputs.

use crate::error::SyncError;
use crate::files::chunk_count;
use crate::model::{ContentHash, FileVersion};
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use storage::{Key, LocalFile};

/// What the synchronizer knows about the local copy of a file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalSnapshot {
    pub path: PathBuf,
    pub size: u64,
    pub content_hash: ContentHash,
    /// Modification time in milliseconds since the Unix epoch.
    pub modified: u64,
}

impl LocalSnapshot {
    pub fn of(path: &Path, file: &LocalFile) -> Self {
        Self {
            path: path.to_path_buf(),
            size: file.size,
            content_hash: ContentHash::of(&file.data),
            modified: file.modified_ms,
        }
    }
}

/// Both sides changed since they last agreed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conflict {
    pub path: PathBuf,
    pub base: Option<Key>,
    pub local_hash: ContentHash,
    pub remote: FileVersion,
}

impl Conflict {
    pub fn into_error(self) -> SyncError {
        SyncError::ConflictDetected {
            path: self.path.display().to_string(),
            local_hash: self.local_hash.to_hex(),
            remote_version: self.remote.version_key(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncDecision {
    NoChange,
    /// Local is ahead: append this version.
    Upload(FileVersion),
    /// Remote is ahead: fetch this version.
    Download(FileVersion),
    Conflict(Conflict),
}

#[derive(Debug, Clone)]
pub struct Synchronizer {
    chunk_size: usize,
}

impl Synchronizer {
    pub fn new(chunk_size: usize) -> Self {
        Self { chunk_size }
    }

    /// Version that would be appended for `local` on top of `remote`.
    pub fn next_version(&self, local: &LocalSnapshot, remote: &[FileVersion]) -> FileVersion {
        FileVersion::new(
            remote.last(),
            local.content_hash,
            local.size,
            local.modified,
            chunk_count(local.size, self.chunk_size),
        )
    }

    /// Decide how to reconcile `local` with the remote chain.
    ///
    /// `last_synced` is the remote version the local copy was last equal to.
    /// When it is missing or no longer in the chain, a local copy whose
    /// content appears somewhere in the chain is considered stale and is
    /// replaced by the latest version. Any other local content is uploaded
    /// on top of the latest version without being reported as a conflict,
    /// since there is no base to compare against.
    pub fn decide(
        &self,
        local: Option<&LocalSnapshot>,
        last_synced: Option<Key>,
        remote: &[FileVersion],
    ) -> SyncDecision {
        let (local, latest) = match (local, remote.last()) {
            (None, None) => return SyncDecision::NoChange,
            (None, Some(latest)) => return SyncDecision::Download(latest.clone()),
            (Some(local), None) => return SyncDecision::Upload(self.next_version(local, remote)),
            (Some(local), Some(latest)) => (local, latest),
        };

        if local.content_hash == latest.content_hash() {
            return SyncDecision::NoChange;
        }
        if last_synced == Some(latest.version_key()) {
            return SyncDecision::Upload(self.next_version(local, remote));
        }

        let base = last_synced.and_then(|k| remote.iter().find(|v| v.version_key() == k));
        match base {
            Some(base) if base.content_hash() == local.content_hash => {
                SyncDecision::Download(latest.clone())
            }
            Some(base) => SyncDecision::Conflict(Conflict {
                path: local.path.clone(),
                base: Some(base.version_key()),
                local_hash: local.content_hash,
                remote: latest.clone(),
            }),
            None if remote.iter().any(|v| v.content_hash() == local.content_hash) => {
                SyncDecision::Download(latest.clone())
            }
            // No base to tell a concurrent edit from a newer one.
            None => SyncDecision::Upload(self.next_version(local, remote)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Report the conflict to the caller.
    Surface,
    /// Publish the local copy on top of the remote chain.
    KeepLocal,
    /// Replace the local copy with the latest remote version.
    TakeRemote,
}

/// Strategy applied to detected conflicts.
pub trait ConflictPolicy: Send + Sync {
    fn resolve(&self, conflict: &Conflict) -> Resolution;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SurfaceConflict;

impl ConflictPolicy for SurfaceConflict {
    fn resolve(&self, _conflict: &Conflict) -> Resolution {
        Resolution::Surface
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct PreferLocal;

impl ConflictPolicy for PreferLocal {
    fn resolve(&self, _conflict: &Conflict) -> Resolution {
        Resolution::KeepLocal
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct PreferRemote;

impl ConflictPolicy for PreferRemote {
    fn resolve(&self, _conflict: &Conflict) -> Resolution {
        Resolution::TakeRemote
    }
}

/// Remote version each local file was last equal to, keyed by relative path.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncIndex {
    entries: BTreeMap<String, String>,
}

impl SyncIndex {
    /// Load the index, starting empty when none was saved yet.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read sync index {}", path.display()))?;
        serde_json::from_str(&json).context("Invalid sync index")
    }

    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)
            .with_context(|| format!("Failed to write sync index {}", path.display()))?;
        Ok(())
    }

    pub fn last_synced(&self, file: &Path) -> Option<Key> {
        let hex = self.entries.get(&file.to_string_lossy().into_owned())?;
        Key::from_hex(hex).ok()
    }

    pub fn record(&mut self, file: &Path, version: Key) {
        self.entries
            .insert(file.to_string_lossy().into_owned(), version.to_hex());
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
