//! Payloads that can be stored in the DHT.

use crate::error::{Result, SyncError};
use serde::de::DeserializeOwned;
use serde::Serialize;
use storage::{Key, TimeToLive};

/// Anything stored under a content address.
///
/// The version key defaults to a digest of the serialized content chained to
/// its predecessor, so identical snapshots always share a key.
pub trait NetworkContent: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Version this snapshot supersedes; `None` for the first version.
    fn based_on_key(&self) -> Option<Key> {
        None
    }

    fn time_to_live(&self) -> TimeToLive {
        TimeToLive::Unlimited
    }

    fn version_key(&self) -> Result<Key> {
        let bytes = encode(self)?;
        Ok(Key::version(self.based_on_key().as_ref(), &bytes))
    }
}

pub fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>> {
    bincode::serialize(value).map_err(|e| SyncError::step(format!("cannot encode content: {e}")))
}

/// Decode a payload received from the network. A payload that does not parse
/// is a malformed response, which is a network-level failure.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    bincode::deserialize(bytes).map_err(|e| SyncError::network(format!("malformed payload: {e}")))
}
