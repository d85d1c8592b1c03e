//! In-process implementation of [`KvBackend`].
//!
//! Combines the MVCC index, the lease table and a mutex table behind one
//! lock. Expired leases are reaped before every operation (and periodically
//! by watch streams and the optional reaper task); reaping deletes the keys
//! attached to the lease and releases any mutex held by a session lease.
//!
//! Watchers are woken through a revision channel; lock waiters through a
//! [`Notify`]. Both also re-check on a short interval so that lease expiry
//! is observed even when no other client touches the store.

use super::lease::LeaseTable;
use super::state::KvState;
use super::watch::{WatchBatch, WatchRange};
use super::{
    DeleteResponse, GetResponse, KvBackend, LeaseId, SessionId, StoreError, WatchStream,
};
use crate::core::time::{Clock, SystemClock, Tick};
use crate::subnet::Revision;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Interval at which blocked watchers and lock waiters re-check expiry.
const RECHECK_INTERVAL: Duration = Duration::from_millis(100);

/// Revisions of history kept for watchers that resume later.
pub const DEFAULT_HISTORY_RETENTION: Revision = 1000;

bitflags::bitflags! {
    /// Failures injected into store operations.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Faults: u32 {
        /// Every operation fails with `Unavailable`.
        const UNAVAILABLE = 0b0000_0001;
        /// Lease TTL lookups fail.
        const TTL_LOOKUP = 0b0000_0010;
        /// Opening a session fails.
        const SESSION = 0b0000_0100;
        /// Acquiring a mutex fails.
        const LOCK = 0b0000_1000;
    }
}

/// In-memory revisioned store with leases, watches and session mutexes.
///
/// Cloning yields another handle to the same store.
#[derive(Clone)]
pub struct MemoryStore {
    shared: Arc<Shared>,
}

struct Shared {
    inner: Mutex<Inner>,
    revision_tx: watch::Sender<Revision>,
    lock_released: Notify,
    clock: Arc<dyn Clock>,
}

#[derive(Default)]
struct Inner {
    state: KvState,
    leases: LeaseTable,
    /// Mutex path -> holding session.
    locks: HashMap<Vec<u8>, SessionId>,
    sessions: HashSet<SessionId>,
    faults: Faults,
    locks_released: bool,
    /// Minimum revisions of history kept.
    history_retention: Revision,
    /// Open watch cursor -> first revision it still needs.
    watchers: HashMap<u64, Revision>,
    next_watcher_id: u64,
}

impl Inner {
    /// Drop every lease expired at `now`. Returns the number dropped.
    fn reap(&mut self, now: Tick) -> usize {
        let expired = self.leases.collect_expired(now);
        for id in &expired {
            tracing::debug!(lease_id = id, "lease expired");
            self.drop_lease(*id);
        }
        expired.len()
    }

    /// Remove a lease, deleting its keys and releasing its mutexes.
    fn drop_lease(&mut self, id: LeaseId) -> bool {
        let Some(lease) = self.leases.revoke(id) else {
            return false;
        };

        let mut keys: Vec<Vec<u8>> = lease.attached_keys.into_iter().collect();
        keys.sort();
        for key in keys {
            let still_bound = self
                .state
                .get(&key)
                .is_some_and(|r| r.lease_id == Some(id));
            if still_bound {
                self.state.delete(&key);
            }
        }

        if self.sessions.remove(&id) {
            let held = self.locks.len();
            self.locks.retain(|_, holder| *holder != id);
            if self.locks.len() != held {
                self.locks_released = true;
            }
        }
        true
    }

    /// Compact history older than the retention window, never past the
    /// oldest open watch cursor. Runs in chunks of one retention window.
    fn auto_compact(&mut self) {
        let retention = self.history_retention.max(1);
        let current = self.state.current_revision();
        if current < retention {
            return;
        }
        let mut floor = current + 1 - retention;
        if let Some(oldest) = self.watchers.values().min() {
            floor = floor.min(*oldest);
        }
        if floor.saturating_sub(self.state.compaction_floor()) >= retention {
            let removed = self.state.compact(floor);
            tracing::debug!(floor, removed, "compacted watch history");
        }
    }

    fn session_alive(&self, session: SessionId, now: Tick) -> bool {
        self.sessions.contains(&session) && self.leases.get_live(session, now).is_some()
    }
}

impl Shared {
    /// Run `f` under the store lock, then publish revision and lock changes.
    fn with_inner<T>(&self, f: impl FnOnce(&mut Inner, Tick) -> T) -> T {
        let now = self.clock.now();
        let (result, revision, released) = {
            let mut inner = self.inner.lock();
            let before = inner.state.current_revision();
            let result = f(&mut inner, now);
            let after = inner.state.current_revision();
            let released = std::mem::take(&mut inner.locks_released);
            (result, (after != before).then_some(after), released)
        };
        if let Some(revision) = revision {
            self.revision_tx.send_replace(revision);
        }
        if released {
            self.lock_released.notify_waiters();
        }
        result
    }

    /// A client-visible operation: fault check, reap, then `f`.
    fn op<T>(
        &self,
        f: impl FnOnce(&mut Inner, Tick) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        self.check_fault(Faults::UNAVAILABLE, "store unavailable")?;
        self.with_inner(|inner, now| {
            inner.reap(now);
            let result = f(inner, now);
            inner.auto_compact();
            result
        })
    }

    fn check_fault(&self, fault: Faults, message: &str) -> Result<(), StoreError> {
        if self.inner.lock().faults.intersects(fault) {
            return Err(StoreError::unavailable(message));
        }
        Ok(())
    }
}

impl MemoryStore {
    /// Create a store driven by the wall clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create a store driven by the given clock.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        let (revision_tx, _) = watch::channel(0);
        Self {
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner {
                    history_retention: DEFAULT_HISTORY_RETENTION,
                    ..Inner::default()
                }),
                revision_tx,
                lock_released: Notify::new(),
                clock,
            }),
        }
    }

    /// The clock driving lease expiry.
    pub fn clock(&self) -> Arc<dyn Clock> {
        Arc::clone(&self.shared.clock)
    }

    /// Current store revision.
    pub fn current_revision(&self) -> Revision {
        self.shared.inner.lock().state.current_revision()
    }

    /// Number of live keys.
    pub fn key_count(&self) -> usize {
        self.shared.inner.lock().state.live_key_count()
    }

    /// Number of active leases (sessions included).
    pub fn lease_count(&self) -> usize {
        self.shared.inner.lock().leases.lease_count()
    }

    /// Session currently holding the mutex at `path`.
    pub fn lock_holder(&self, path: &[u8]) -> Option<SessionId> {
        self.shared.inner.lock().locks.get(path).copied()
    }

    /// Inject failures into subsequent operations.
    pub fn inject(&self, faults: Faults) {
        self.shared.inner.lock().faults.insert(faults);
    }

    /// Remove all injected failures.
    pub fn clear_faults(&self) {
        self.shared.inner.lock().faults = Faults::empty();
    }

    /// Keep at least `revisions` of watch history (minimum 1). Older history
    /// is compacted as writes arrive, except what open watches still need.
    pub fn set_history_retention(&self, revisions: Revision) {
        self.shared.inner.lock().history_retention = revisions.max(1);
    }

    /// Lowest revision a new watch may start from.
    pub fn compaction_floor(&self) -> Revision {
        self.shared.inner.lock().state.compaction_floor()
    }

    /// Compact history below `revision`. Returns the number of entries removed.
    pub fn compact(&self, revision: Revision) -> usize {
        self.shared
            .with_inner(|inner, _| inner.state.compact(revision))
    }

    /// Renew a lease, returning its refreshed TTL in seconds.
    pub fn keepalive(&self, lease: LeaseId) -> Result<i64, StoreError> {
        self.shared.op(|inner, now| {
            if !inner.leases.keepalive(lease, now) {
                return Err(StoreError::LeaseNotFound { lease_id: lease });
            }
            inner
                .leases
                .get_live(lease, now)
                .map(|l| l.remaining_seconds_at(now))
                .ok_or(StoreError::LeaseNotFound { lease_id: lease })
        })
    }

    /// Reap expired leases now. Returns the number of leases dropped.
    pub fn expire_due(&self) -> usize {
        self.shared.with_inner(|inner, now| inner.reap(now))
    }

    /// Reap expired leases every `period` until `token` is cancelled.
    pub fn spawn_reaper(&self, period: Duration, token: CancellationToken) -> JoinHandle<()> {
        let store = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let expired = store.expire_due();
                        if expired > 0 {
                            tracing::debug!(expired, "reaper dropped expired leases");
                        }
                    }
                }
            }
        })
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.shared.inner.lock();
        f.debug_struct("MemoryStore")
            .field("revision", &inner.state.current_revision())
            .field("keys", &inner.state.live_key_count())
            .field("leases", &inner.leases.lease_count())
            .field("locks", &inner.locks.len())
            .field("watchers", &inner.watchers.len())
            .finish()
    }
}

/// Cursor behind a watch stream.
struct WatchCursor {
    id: u64,
    shared: Arc<Shared>,
    range: WatchRange,
    next: Revision,
    pending: VecDeque<WatchBatch>,
    rx: watch::Receiver<Revision>,
    finished: bool,
}

impl WatchCursor {
    async fn next_batch(&mut self) -> Option<Result<WatchBatch, StoreError>> {
        if self.finished {
            return None;
        }
        loop {
            if let Some(batch) = self.pending.pop_front() {
                return Some(Ok(batch));
            }

            let range = &self.range;
            let id = self.id;
            let next = self.next;
            // Every revision up to the current one has been scanned.
            match self.shared.op(|inner, _| {
                let batches = inner.state.batches_since(range, next)?;
                let resume = next.max(inner.state.current_revision() + 1);
                inner.watchers.insert(id, resume);
                Ok((batches, resume))
            }) {
                Ok((batches, resume)) => {
                    self.next = resume;
                    self.pending.extend(batches);
                    if !self.pending.is_empty() {
                        continue;
                    }
                }
                Err(e) => {
                    self.finished = true;
                    return Some(Err(e));
                }
            }

            tokio::select! {
                changed = self.rx.changed() => {
                    if changed.is_err() {
                        return None;
                    }
                }
                _ = tokio::time::sleep(RECHECK_INTERVAL) => {}
            }
        }
    }
}

impl Drop for WatchCursor {
    fn drop(&mut self) {
        self.shared.inner.lock().watchers.remove(&self.id);
    }
}

/// Lease TTL in milliseconds, at least one second and saturating.
fn ttl_ms(ttl_seconds: i64) -> u64 {
    (ttl_seconds.max(1) as u64).saturating_mul(1000)
}

#[async_trait]
impl KvBackend for MemoryStore {
    async fn get(&self, key: &[u8]) -> Result<GetResponse, StoreError> {
        self.shared.op(|inner, _| {
            Ok(GetResponse {
                kvs: inner.state.get_kv(key).into_iter().collect(),
                revision: inner.state.current_revision(),
            })
        })
    }

    async fn get_prefix(&self, prefix: &[u8]) -> Result<GetResponse, StoreError> {
        self.shared.op(|inner, _| {
            Ok(GetResponse {
                kvs: inner.state.prefix(prefix),
                revision: inner.state.current_revision(),
            })
        })
    }

    async fn put(
        &self,
        key: &[u8],
        value: Vec<u8>,
        lease: Option<LeaseId>,
    ) -> Result<Revision, StoreError> {
        self.shared.op(|inner, now| {
            if let Some(id) = lease {
                if inner.leases.get_live(id, now).is_none() {
                    return Err(StoreError::LeaseNotFound { lease_id: id });
                }
            }

            let (revision, prev) = inner.state.put(key.to_vec(), value, lease);
            if let Some(old) = prev.and_then(|p| p.lease_id) {
                if Some(old) != lease {
                    inner.leases.detach_key(old, key);
                }
            }
            if let Some(id) = lease {
                inner.leases.attach_key(id, key.to_vec());
            }
            Ok(revision)
        })
    }

    async fn delete(&self, key: &[u8]) -> Result<DeleteResponse, StoreError> {
        self.shared.op(|inner, _| match inner.state.delete(key) {
            Some((revision, prev)) => {
                if let Some(old) = prev.lease_id {
                    inner.leases.detach_key(old, key);
                }
                Ok(DeleteResponse {
                    deleted: 1,
                    revision,
                })
            }
            None => Ok(DeleteResponse {
                deleted: 0,
                revision: inner.state.current_revision(),
            }),
        })
    }

    async fn watch(
        &self,
        range: WatchRange,
        start_revision: Revision,
    ) -> Result<WatchStream, StoreError> {
        let rx = self.shared.revision_tx.subscribe();
        let (id, start) = self.shared.op(|inner, _| {
            let start = if start_revision == 0 {
                inner.state.current_revision() + 1
            } else {
                start_revision
            };
            if start < inner.state.compaction_floor() {
                return Err(StoreError::Compacted {
                    revision: start,
                    compaction_floor: inner.state.compaction_floor(),
                });
            }
            let id = inner.next_watcher_id;
            inner.next_watcher_id += 1;
            inner.watchers.insert(id, start);
            Ok((id, start))
        })?;

        let cursor = WatchCursor {
            id,
            shared: Arc::clone(&self.shared),
            range,
            next: start,
            pending: VecDeque::new(),
            rx,
            finished: false,
        };
        Ok(Box::pin(futures::stream::unfold(
            cursor,
            |mut cursor| async move {
                let item = cursor.next_batch().await?;
                Some((item, cursor))
            },
        )))
    }

    async fn grant(&self, ttl_seconds: i64) -> Result<LeaseId, StoreError> {
        let ttl_ms = ttl_ms(ttl_seconds);
        self.shared
            .op(|inner, now| Ok(inner.leases.grant(ttl_ms, now)))
    }

    async fn time_to_live(&self, lease: LeaseId) -> Result<i64, StoreError> {
        self.shared
            .check_fault(Faults::TTL_LOOKUP, "lease ttl lookup failed")?;
        self.shared.op(|inner, now| {
            inner
                .leases
                .get_live(lease, now)
                .map(|l| l.remaining_seconds_at(now))
                .ok_or(StoreError::LeaseNotFound { lease_id: lease })
        })
    }

    async fn revoke(&self, lease: LeaseId) -> Result<(), StoreError> {
        self.shared.op(|inner, _| {
            if inner.drop_lease(lease) {
                Ok(())
            } else {
                Err(StoreError::LeaseNotFound { lease_id: lease })
            }
        })
    }

    async fn open_session(&self, ttl_seconds: i64) -> Result<SessionId, StoreError> {
        self.shared
            .check_fault(Faults::SESSION, "session creation failed")?;
        let ttl_ms = ttl_ms(ttl_seconds);
        self.shared.op(|inner, now| {
            let id = inner.leases.grant(ttl_ms, now);
            inner.sessions.insert(id);
            Ok(id)
        })
    }

    async fn lock(&self, session: SessionId, path: &[u8]) -> Result<(), StoreError> {
        self.shared
            .check_fault(Faults::LOCK, "mutex acquisition failed")?;
        loop {
            let notified = self.shared.lock_released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let acquired = self.shared.op(|inner, now| {
                if !inner.session_alive(session, now) {
                    return Err(StoreError::SessionExpired {
                        session_id: session,
                    });
                }
                match inner.locks.get(path) {
                    None => {
                        inner.locks.insert(path.to_vec(), session);
                        Ok(true)
                    }
                    Some(holder) => Ok(*holder == session),
                }
            })?;
            if acquired {
                return Ok(());
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep(RECHECK_INTERVAL) => {}
            }
        }
    }

    async fn unlock(&self, session: SessionId, path: &[u8]) -> Result<(), StoreError> {
        self.shared.op(|inner, _| match inner.locks.get(path) {
            Some(holder) if *holder == session => {
                inner.locks.remove(path);
                inner.locks_released = true;
                Ok(())
            }
            _ => Err(StoreError::LockNotHeld {
                path: String::from_utf8_lossy(path).into_owned(),
                session_id: session,
            }),
        })
    }

    async fn close_session(&self, session: SessionId) -> Result<(), StoreError> {
        self.shared.op(|inner, _| {
            if inner.sessions.contains(&session) && inner.drop_lease(session) {
                Ok(())
            } else {
                Err(StoreError::SessionExpired {
                    session_id: session,
                })
            }
        })
    }
}
