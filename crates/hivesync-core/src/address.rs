//! Domain partitioning of the DHT key space.

use std::path::{Component, Path};
use storage::dht::KEY_LEN;
use storage::{ContentAddress, Key};

/// Purpose a stored item serves. Each domain maps to its own domain key.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Domain {
    /// Queue of pending work addressed to a user, oldest first.
    UserProfileTask,
    MetaFile,
    VersionIndex,
    FileChunk,
}

impl Domain {
    pub fn name(&self) -> &'static str {
        match self {
            Domain::UserProfileTask => "user-profile-task",
            Domain::MetaFile => "meta-file",
            Domain::VersionIndex => "version-index",
            Domain::FileChunk => "file-chunk",
        }
    }

    pub fn key(&self) -> Key {
        Key::hash(self.name())
    }

    pub fn address(&self, location: Key, content: Key) -> ContentAddress {
        ContentAddress::new(location, self.key(), content)
    }
}

pub fn user_location(user_id: &str) -> Key {
    Key::hash(user_id)
}

/// Content key of a queued task. The enqueue time leads, so an ascending
/// scan over a user's task domain yields the oldest task first.
pub fn task_id(enqueued_ms: u64, nonce: &[u8]) -> Key {
    let digest = Key::digest(nonce);
    let mut out = [0u8; KEY_LEN];
    out[..8].copy_from_slice(&enqueued_ms.to_be_bytes());
    out[8..].copy_from_slice(&digest.0[..KEY_LEN - 8]);
    Key(out)
}

/// Stable identity of a file inside the sync root, independent of the
/// platform's path separator.
pub fn file_id(path: &Path) -> Key {
    let normalized = path
        .components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/");
    Key::hash(&normalized)
}
