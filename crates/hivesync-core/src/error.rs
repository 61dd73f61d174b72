//! Failure taxonomy shared by the data access layer, the process framework
//! and the synchronizer.

use storage::{DhtError, Key};
use thiserror::Error;

pub type Result<T, E = SyncError> = std::result::Result<T, E>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    /// Transport, timeout or no-route failure. Retryable by caller policy.
    #[error("network operation failed: {0}")]
    NetworkOperationFailure(String),

    #[error("protection key mismatch: {0}")]
    ProtectionKeyMismatch(String),

    #[error("unsupported protection transition: {0}")]
    UnsupportedTransition(String),

    #[error("precondition violated: {0}")]
    PreconditionViolation(String),

    #[error("step failed: {0}")]
    StepExecutionFailure(String),

    #[error("conflicting histories for {path}: local content {local_hash} diverges from remote version {remote_version}")]
    ConflictDetected {
        path: String,
        local_hash: String,
        remote_version: Key,
    },

    #[error("process cancelled")]
    Cancelled,
}

impl SyncError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, SyncError::NetworkOperationFailure(_))
    }

    pub fn step(msg: impl Into<String>) -> Self {
        SyncError::StepExecutionFailure(msg.into())
    }

    pub fn precondition(msg: impl Into<String>) -> Self {
        SyncError::PreconditionViolation(msg.into())
    }

    pub fn network(msg: impl Into<String>) -> Self {
        SyncError::NetworkOperationFailure(msg.into())
    }

    /// Stable short name of the failure kind, used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            SyncError::NetworkOperationFailure(_) => "network",
            SyncError::ProtectionKeyMismatch(_) => "protection-mismatch",
            SyncError::UnsupportedTransition(_) => "unsupported-transition",
            SyncError::PreconditionViolation(_) => "precondition",
            SyncError::StepExecutionFailure(_) => "step",
            SyncError::ConflictDetected { .. } => "conflict",
            SyncError::Cancelled => "cancelled",
        }
    }
}

impl From<DhtError> for SyncError {
    fn from(err: DhtError) -> Self {
        match err {
            DhtError::Unreachable(_) | DhtError::Timeout | DhtError::Malformed(_) => {
                SyncError::NetworkOperationFailure(err.to_string())
            }
            DhtError::ProtectionMismatch(_) => SyncError::ProtectionKeyMismatch(err.to_string()),
            DhtError::ProtectionDowngrade(_) => SyncError::UnsupportedTransition(err.to_string()),
            DhtError::NotConnected => SyncError::PreconditionViolation(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use storage::ContentAddress;

    #[test]
    fn test_transport_translation() {
        let address = ContentAddress::new(Key::hash("a"), Key::hash("b"), Key::hash("c"));

        let timeout: SyncError = DhtError::Timeout.into();
        assert!(timeout.is_retryable());

        let mismatch: SyncError = DhtError::ProtectionMismatch(address).into();
        assert!(matches!(mismatch, SyncError::ProtectionKeyMismatch(_)));
        assert!(!mismatch.is_retryable());

        let downgrade: SyncError = DhtError::ProtectionDowngrade(address).into();
        assert_eq!(downgrade.kind(), "unsupported-transition");

        let offline: SyncError = DhtError::NotConnected.into();
        assert!(matches!(offline, SyncError::PreconditionViolation(_)));
    }
}
