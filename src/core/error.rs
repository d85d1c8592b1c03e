//! Error types for the subnet lease registry.
//!
//! The taxonomy separates failures the caller can act on (missing keys,
//! malformed entries, cancellation) from failures of the backing store,
//! which are propagated unchanged. Bulk operations (listing, watching)
//! never surface [`RegistryError::Malformed`]; they log and skip instead.

use crate::store::StoreError;
use crate::subnet::Subnet;
use thiserror::Error;

/// Common registry error conditions.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// The config key or a single subnet key is absent.
    #[error("key not found: {key}")]
    NotFound { key: String },

    /// A key suffix or stored value failed to decode.
    #[error("malformed entry {key}: {reason}")]
    Malformed { key: String, reason: String },

    /// Network or RPC failure reported by the backing store.
    #[error("store unavailable: {0}")]
    StoreUnavailable(#[from] StoreError),

    /// The distributed lock could not be established, acquired or released.
    #[error("lock failure during {stage}: {reason}")]
    LockFailure { stage: LockStage, reason: String },

    /// The lock was held and the guarded critical section failed.
    #[error("critical section failed: {source}")]
    CriticalSection {
        #[source]
        source: Box<RegistryError>,
    },

    /// The call's context was cancelled or its deadline passed.
    #[error("operation cancelled: {reason}")]
    Cancelled { reason: CancelReason },

    /// A new subnet overlaps an existing lease (only when overlap rejection is enabled).
    #[error("subnet {requested} overlaps existing lease {existing}")]
    Overlap { requested: Subnet, existing: Subnet },

    /// Transient condition; the caller should retry.
    #[error("try again")]
    TryAgain,

    /// Invalid request.
    #[error("invalid request: {message}")]
    InvalidRequest { message: String },
}

/// Which step of the lock lifecycle failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockStage {
    /// Creating the liveness session.
    Session,
    /// Acquiring the mutex.
    Acquire,
    /// Releasing the mutex or closing the session.
    Release,
}

impl std::fmt::Display for LockStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Session => write!(f, "session"),
            Self::Acquire => write!(f, "acquire"),
            Self::Release => write!(f, "release"),
        }
    }
}

/// Why a context finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    /// Explicit cancellation.
    Cancelled,
    /// The context deadline passed.
    DeadlineExceeded,
}

impl std::fmt::Display for CancelReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cancelled => write!(f, "context canceled"),
            Self::DeadlineExceeded => write!(f, "context deadline exceeded"),
        }
    }
}

impl RegistryError {
    /// Create a NotFound error.
    pub fn not_found(key: impl Into<String>) -> Self {
        Self::NotFound { key: key.into() }
    }

    /// Create a Malformed error.
    pub fn malformed(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Malformed {
            key: key.into(),
            reason: reason.into(),
        }
    }

    /// Create a LockFailure error.
    pub fn lock_failure(stage: LockStage, reason: impl std::fmt::Display) -> Self {
        Self::LockFailure {
            stage,
            reason: reason.to_string(),
        }
    }

    /// Wrap an error raised while the lock was held.
    pub fn critical_section(source: RegistryError) -> Self {
        Self::CriticalSection {
            source: Box::new(source),
        }
    }

    /// Check if this error indicates the operation should be retried.
    pub fn is_retriable(&self) -> bool {
        match self {
            Self::TryAgain => true,
            Self::StoreUnavailable(e) => e.is_transient(),
            Self::LockFailure { stage, .. } => *stage != LockStage::Release,
            Self::CriticalSection { source } => source.is_retriable(),
            _ => false,
        }
    }

    /// Check if this error is a NotFound.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Check if this error is a cancellation.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }

    /// For lock-related errors, report whether the lock had been acquired.
    ///
    /// Returns `None` for errors unrelated to the mutual exclusion guard.
    pub fn lock_acquired(&self) -> Option<bool> {
        match self {
            Self::LockFailure {
                stage: LockStage::Release,
                ..
            } => Some(true),
            Self::LockFailure { .. } => Some(false),
            Self::CriticalSection { .. } => Some(true),
            _ => None,
        }
    }
}

/// Result type using RegistryError.
pub type RegistryResult<T> = Result<T, RegistryError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_acquired_distinguishes_stages() {
        let never = RegistryError::lock_failure(LockStage::Acquire, "timeout");
        assert_eq!(never.lock_acquired(), Some(false));

        let session = RegistryError::lock_failure(LockStage::Session, "no lease");
        assert_eq!(session.lock_acquired(), Some(false));

        let failed = RegistryError::critical_section(RegistryError::not_found("/a"));
        assert_eq!(failed.lock_acquired(), Some(true));

        assert_eq!(RegistryError::TryAgain.lock_acquired(), None);
    }

    #[test]
    fn test_retriable() {
        assert!(RegistryError::TryAgain.is_retriable());
        assert!(RegistryError::StoreUnavailable(StoreError::unavailable("down")).is_retriable());
        assert!(!RegistryError::not_found("/x").is_retriable());
        assert!(!RegistryError::malformed("/x", "bad").is_retriable());
    }

    #[test]
    fn test_display() {
        let err = RegistryError::Cancelled {
            reason: CancelReason::DeadlineExceeded,
        };
        assert_eq!(err.to_string(), "operation cancelled: context deadline exceeded");

        let err = RegistryError::lock_failure(LockStage::Acquire, "busy");
        assert_eq!(err.to_string(), "lock failure during acquire: busy");
    }
}
