//! File metadata and version model.
//!
//! A [`MetaFile`] is the synchronized identity of one file. Small meta files
//! carry their whole [`FileVersion`] chain inline; large ones only reference a
//! [`VersionIndex`] stored separately. Callers branch on the variant (or on
//! [`MetaFile::inline_versions`]) rather than on a concrete type.

use crate::content::NetworkContent;
use crate::error::{Result, SyncError};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use storage::{Key, TimeToLive};

/// SHA-256 of a file's full payload.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContentHash(pub [u8; 32]);

impl ContentHash {
    pub fn of(data: &[u8]) -> Self {
        let mut out = [0u8; 32];
        out.copy_from_slice(&Sha256::digest(data));
        ContentHash(out)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentHash({})", hex::encode(&self.0[..4]))
    }
}

/// One immutable snapshot of a file. Edits append a new record; existing
/// records are never changed, so the fields are only readable.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileVersion {
    version_key: Key,
    based_on: Option<Key>,
    content_hash: ContentHash,
    size: u64,
    timestamp: u64,
    chunk_count: u32,
}

impl FileVersion {
    /// Build the version that follows `previous` (or the first version).
    pub fn new(
        previous: Option<&FileVersion>,
        content_hash: ContentHash,
        size: u64,
        timestamp: u64,
        chunk_count: u32,
    ) -> Self {
        let based_on = previous.map(|p| p.version_key);
        let mut fingerprint = Vec::with_capacity(32 + 8 + 8 + 4);
        fingerprint.extend_from_slice(&content_hash.0);
        fingerprint.extend_from_slice(&size.to_be_bytes());
        fingerprint.extend_from_slice(&timestamp.to_be_bytes());
        fingerprint.extend_from_slice(&chunk_count.to_be_bytes());

        Self {
            version_key: Key::version(based_on.as_ref(), &fingerprint),
            based_on,
            content_hash,
            size,
            timestamp,
            chunk_count,
        }
    }

    pub fn version_key(&self) -> Key {
        self.version_key
    }

    pub fn based_on(&self) -> Option<Key> {
        self.based_on
    }

    pub fn content_hash(&self) -> ContentHash {
        self.content_hash
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Milliseconds since the Unix epoch.
    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    pub fn chunk_count(&self) -> u32 {
        self.chunk_count
    }

    /// Position in the chain, starting at 0.
    pub fn index(&self) -> u64 {
        self.version_key.sequence()
    }
}

impl NetworkContent for FileVersion {
    fn based_on_key(&self) -> Option<Key> {
        self.based_on
    }

    fn version_key(&self) -> Result<Key> {
        Ok(self.version_key)
    }
}

/// Check the append-only chain: the first version has no predecessor and
/// every later one is based on the version right before it.
pub fn validate_chain(versions: &[FileVersion]) -> Result<()> {
    let mut previous: Option<Key> = None;
    for version in versions {
        if version.based_on != previous {
            return Err(SyncError::step(format!(
                "broken version chain at {}: based on {:?}, expected {:?}",
                version.version_key.short(),
                version.based_on,
                previous
            )));
        }
        previous = Some(version.version_key);
    }
    Ok(())
}

/// Append `version` to `chain`, enforcing the chain invariant.
pub fn append_version(chain: &mut Vec<FileVersion>, version: FileVersion) -> Result<()> {
    let latest = chain.last().map(|v| v.version_key);
    if version.based_on != latest {
        return Err(SyncError::step(format!(
            "version {} is not based on the latest version {:?}",
            version.version_key.short(),
            latest
        )));
    }
    chain.push(version);
    Ok(())
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetaFileSmall {
    pub file_id: Key,
    pub based_on: Option<Key>,
    pub versions: Vec<FileVersion>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetaFileLarge {
    pub file_id: Key,
    pub based_on: Option<Key>,
    /// Content key of the [`VersionIndex`] holding the chain.
    pub index: Key,
    pub latest: Option<FileVersion>,
    pub version_count: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MetaFile {
    Small(MetaFileSmall),
    Large(MetaFileLarge),
}

impl MetaFile {
    pub fn new_small(file_id: Key) -> Self {
        MetaFile::Small(MetaFileSmall {
            file_id,
            based_on: None,
            versions: Vec::new(),
        })
    }

    pub fn new_large(file_id: Key) -> Self {
        MetaFile::Large(MetaFileLarge {
            file_id,
            based_on: None,
            index: file_id,
            latest: None,
            version_count: 0,
        })
    }

    pub fn file_id(&self) -> Key {
        match self {
            MetaFile::Small(m) => m.file_id,
            MetaFile::Large(m) => m.file_id,
        }
    }

    pub fn based_on(&self) -> Option<Key> {
        match self {
            MetaFile::Small(m) => m.based_on,
            MetaFile::Large(m) => m.based_on,
        }
    }

    pub fn is_large(&self) -> bool {
        matches!(self, MetaFile::Large(_))
    }

    /// The version chain, when it is stored inline.
    pub fn inline_versions(&self) -> Option<&[FileVersion]> {
        match self {
            MetaFile::Small(m) => Some(&m.versions),
            MetaFile::Large(_) => None,
        }
    }

    /// Next snapshot of this meta file, superseding the stored snapshot
    /// `current` and describing `chain`.
    pub fn successor(&self, current: Option<Key>, chain: &[FileVersion]) -> MetaFile {
        match self {
            MetaFile::Small(m) => MetaFile::Small(MetaFileSmall {
                file_id: m.file_id,
                based_on: current,
                versions: chain.to_vec(),
            }),
            MetaFile::Large(m) => MetaFile::Large(MetaFileLarge {
                file_id: m.file_id,
                based_on: current,
                index: m.index,
                latest: chain.last().cloned(),
                version_count: chain.len() as u64,
            }),
        }
    }
}

impl NetworkContent for MetaFile {
    fn based_on_key(&self) -> Option<Key> {
        self.based_on()
    }
}

/// Externally stored version chain of a large file.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionIndex {
    pub file_id: Key,
    pub based_on: Option<Key>,
    pub versions: Vec<FileVersion>,
}

impl NetworkContent for VersionIndex {
    fn based_on_key(&self) -> Option<Key> {
        self.based_on
    }
}

/// One slice of a file version's payload.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChunk {
    pub version: Key,
    pub index: u32,
    pub data: Vec<u8>,
    pub ttl: TimeToLive,
}

impl FileChunk {
    /// Content key of chunk `index` of a file version.
    pub fn content_key(version: &Key, index: u32) -> Key {
        let mut seed = version.as_bytes().to_vec();
        seed.extend_from_slice(&index.to_be_bytes());
        Key::digest(&seed)
    }
}

impl NetworkContent for FileChunk {
    fn time_to_live(&self) -> TimeToLive {
        self.ttl
    }
}
