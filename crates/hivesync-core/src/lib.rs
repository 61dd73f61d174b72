//! HiveSync Core - versioned file synchronization over a DHT
//!
//! Files are stored as encrypted chunks under protected DHT slots, described
//! by a versioned meta file, and moved by rollback-capable process trees.

pub mod address;
pub mod bridge;
pub mod client;
pub mod config;
pub mod content;
pub mod crypto;
pub mod data;
pub mod error;
pub mod files;
pub mod keys;
pub mod model;
pub mod process;
pub mod sync;

// Re-export commonly used types
pub use client::{SyncClient, SyncOutcome};
pub use config::SyncConfig;
pub use data::{DataManager, Retrieved};
pub use error::{Result, SyncError};
pub use keys::ProtectionKeys;
pub use model::{ContentHash, FileVersion, MetaFile};
pub use process::{ProcessFailure, ProcessHandle, ProcessManager, ProcessState};
pub use sync::{ConflictPolicy, PreferLocal, PreferRemote, SurfaceConflict, SyncDecision, SyncIndex};
