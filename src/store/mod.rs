//! Backing key-value store interface.
//!
//! The registry needs a small capability surface from the store:
//! linearizable reads that report a revision, puts bound to a TTL lease,
//! deletes, revision-resumable watches, lease introspection, and a
//! session-scoped mutex. [`KvBackend`] captures exactly that surface; any
//! etcd-v3-like store can implement it.
//!
//! - [`state`] - MVCC key index and revision history
//! - [`lease`] - TTL lease table
//! - [`watch`] - watch ranges and event batches
//! - [`memory`] - complete in-process implementation of [`KvBackend`]
//! - `etcd` - etcd v3 client implementation (feature `etcd`)

#[cfg(feature = "etcd")]
pub mod etcd;
pub mod lease;
pub mod memory;
pub mod state;
pub mod watch;

use crate::subnet::Revision;
use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[cfg(feature = "etcd")]
pub use etcd::EtcdStore;
pub use memory::{Faults, MemoryStore};
pub use watch::{EventType, WatchBatch, WatchEvent, WatchRange};

/// Store lease handle.
pub type LeaseId = i64;

/// Liveness session handle. A session is a lease owned by one client.
pub type SessionId = LeaseId;

/// Stream of watch batches, in revision order.
pub type WatchStream = BoxStream<'static, Result<WatchBatch, StoreError>>;

/// Errors reported by the backing store.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    /// Network or RPC failure.
    #[error("store unavailable: {message}")]
    Unavailable { message: String },

    /// Lease handle unknown or expired.
    #[error("lease {lease_id} not found")]
    LeaseNotFound { lease_id: LeaseId },

    /// Requested revision is below the compaction floor.
    #[error("revision {revision} has been compacted; compaction floor is {compaction_floor}")]
    Compacted {
        revision: Revision,
        compaction_floor: Revision,
    },

    /// Session lease expired or was closed.
    #[error("session {session_id} expired")]
    SessionExpired { session_id: SessionId },

    /// Unlock by a session that does not hold the mutex.
    #[error("lock {path} not held by session {session_id}")]
    LockNotHeld { path: String, session_id: SessionId },

    /// Store handle closed.
    #[error("store closed")]
    Closed,
}

impl StoreError {
    /// Create an Unavailable error.
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable {
            message: message.into(),
        }
    }

    /// Check if retrying the same request may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable { .. })
    }
}

/// A stored key-value pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyValue {
    /// Key.
    pub key: Vec<u8>,
    /// Value.
    pub value: Vec<u8>,
    /// Revision when created.
    pub create_revision: Revision,
    /// Revision of last modification.
    pub mod_revision: Revision,
    /// Number of modifications since creation.
    pub version: u64,
    /// Attached lease, if any.
    pub lease: Option<LeaseId>,
}

/// Result of a get or prefix read.
#[derive(Debug, Clone, Default)]
pub struct GetResponse {
    /// Matching pairs, sorted by key.
    pub kvs: Vec<KeyValue>,
    /// Store revision the read was served at.
    pub revision: Revision,
}

impl GetResponse {
    /// Number of matching pairs.
    pub fn count(&self) -> usize {
        self.kvs.len()
    }

    /// First pair, if any.
    pub fn first(&self) -> Option<&KeyValue> {
        self.kvs.first()
    }
}

/// Result of a delete.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeleteResponse {
    /// Number of keys removed (0 or 1).
    pub deleted: u64,
    /// Store revision after the delete.
    pub revision: Revision,
}

/// Capability surface the registry requires from a backing store.
///
/// Implementations must be safe for concurrent use by many callers.
#[async_trait]
pub trait KvBackend: Send + Sync {
    /// Read one key.
    async fn get(&self, key: &[u8]) -> Result<GetResponse, StoreError>;

    /// Read every key starting with `prefix`.
    async fn get_prefix(&self, prefix: &[u8]) -> Result<GetResponse, StoreError>;

    /// Write a value, optionally bound to a lease.
    async fn put(
        &self,
        key: &[u8],
        value: Vec<u8>,
        lease: Option<LeaseId>,
    ) -> Result<Revision, StoreError>;

    /// Delete one key. Deleting an absent key succeeds with `deleted == 0`.
    async fn delete(&self, key: &[u8]) -> Result<DeleteResponse, StoreError>;

    /// Watch a key or prefix from `start_revision` (inclusive).
    ///
    /// A start revision of 0 means "after the current revision".
    async fn watch(
        &self,
        range: WatchRange,
        start_revision: Revision,
    ) -> Result<WatchStream, StoreError>;

    /// Grant a lease with the given TTL.
    async fn grant(&self, ttl_seconds: i64) -> Result<LeaseId, StoreError>;

    /// Remaining TTL of a lease in seconds.
    async fn time_to_live(&self, lease: LeaseId) -> Result<i64, StoreError>;

    /// Revoke a lease, deleting every key attached to it.
    async fn revoke(&self, lease: LeaseId) -> Result<(), StoreError>;

    /// Open a liveness session.
    async fn open_session(&self, ttl_seconds: i64) -> Result<SessionId, StoreError>;

    /// Acquire the mutex at `path` for `session`, waiting while another session holds it.
    async fn lock(&self, session: SessionId, path: &[u8]) -> Result<(), StoreError>;

    /// Release the mutex at `path`.
    async fn unlock(&self, session: SessionId, path: &[u8]) -> Result<(), StoreError>;

    /// Close a session, releasing every mutex it holds.
    async fn close_session(&self, session: SessionId) -> Result<(), StoreError>;
}

#[async_trait]
impl<T: KvBackend + ?Sized> KvBackend for std::sync::Arc<T> {
    async fn get(&self, key: &[u8]) -> Result<GetResponse, StoreError> {
        (**self).get(key).await
    }

    async fn get_prefix(&self, prefix: &[u8]) -> Result<GetResponse, StoreError> {
        (**self).get_prefix(prefix).await
    }

    async fn put(
        &self,
        key: &[u8],
        value: Vec<u8>,
        lease: Option<LeaseId>,
    ) -> Result<Revision, StoreError> {
        (**self).put(key, value, lease).await
    }

    async fn delete(&self, key: &[u8]) -> Result<DeleteResponse, StoreError> {
        (**self).delete(key).await
    }

    async fn watch(
        &self,
        range: WatchRange,
        start_revision: Revision,
    ) -> Result<WatchStream, StoreError> {
        (**self).watch(range, start_revision).await
    }

    async fn grant(&self, ttl_seconds: i64) -> Result<LeaseId, StoreError> {
        (**self).grant(ttl_seconds).await
    }

    async fn time_to_live(&self, lease: LeaseId) -> Result<i64, StoreError> {
        (**self).time_to_live(lease).await
    }

    async fn revoke(&self, lease: LeaseId) -> Result<(), StoreError> {
        (**self).revoke(lease).await
    }

    async fn open_session(&self, ttl_seconds: i64) -> Result<SessionId, StoreError> {
        (**self).open_session(ttl_seconds).await
    }

    async fn lock(&self, session: SessionId, path: &[u8]) -> Result<(), StoreError> {
        (**self).lock(session, path).await
    }

    async fn unlock(&self, session: SessionId, path: &[u8]) -> Result<(), StoreError> {
        (**self).unlock(session, path).await
    }

    async fn close_session(&self, session: SessionId) -> Result<(), StoreError> {
        (**self).close_session(session).await
    }
}
