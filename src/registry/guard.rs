//! Cluster-wide mutual exclusion.
//!
//! Every guarded section takes the same store mutex at [`LOCK_PATH`], so all
//! guarded sections across all processes sharing the store run one at a
//! time. The mutex is held by a liveness session; if the session expires
//! while the section runs, the release reports the lock as lost.

use crate::core::context::Context;
use crate::core::error::{LockStage, RegistryError, RegistryResult};
use crate::store::{KvBackend, SessionId};
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, warn};

/// Path of the registry-wide mutex.
pub const LOCK_PATH: &str = "/my-lock/";

/// Serializes critical sections through a session-scoped store mutex.
pub struct MutualExclusionGuard<B: KvBackend + 'static> {
    backend: Arc<B>,
    session_ttl: i64,
}

impl<B: KvBackend + 'static> MutualExclusionGuard<B> {
    /// Create a guard whose sessions live `session_ttl` seconds unless the
    /// calling context expires sooner.
    pub fn new(backend: Arc<B>, session_ttl: i64) -> Self {
        Self {
            backend,
            session_ttl: session_ttl.max(1),
        }
    }

    /// Session TTL for a call under `ctx`.
    pub fn session_ttl_for(&self, ctx: &Context) -> i64 {
        match ctx.remaining() {
            Some(left) => {
                let secs = left.as_millis().div_ceil(1000) as i64;
                secs.clamp(1, self.session_ttl)
            }
            None => self.session_ttl,
        }
    }

    /// Run `section` while holding the registry mutex.
    ///
    /// Errors distinguish a lock that was never acquired
    /// ([`RegistryError::LockFailure`] at `Session` or `Acquire`) from a held
    /// lock whose section failed ([`RegistryError::CriticalSection`]). A
    /// section that succeeded but whose lock could not be released cleanly
    /// fails with `LockFailure` at `Release`. Mutex and session are released
    /// on every path, including when the returned future is dropped.
    pub async fn with_lock<T, F, Fut>(&self, ctx: &Context, section: F) -> RegistryResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = RegistryResult<T>>,
    {
        let ttl = self.session_ttl_for(ctx);
        let session = ctx
            .run(async { Ok(self.backend.open_session(ttl).await?) })
            .await
            .map_err(|e| RegistryError::lock_failure(LockStage::Session, e))?;
        let mut held = HeldLock::new(Arc::clone(&self.backend), session);

        let acquired = ctx
            .run(async { Ok(self.backend.lock(session, LOCK_PATH.as_bytes()).await?) })
            .await;
        if let Err(e) = acquired {
            let _ = held.release().await;
            return Err(RegistryError::lock_failure(LockStage::Acquire, e));
        }
        held.locked = true;
        debug!(session, path = LOCK_PATH, "lock acquired");

        let outcome = section().await;
        let released = held.release().await;

        match (outcome, released) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(e)) => Err(RegistryError::lock_failure(LockStage::Release, e)),
            (Err(e), released) => {
                if let Err(release_err) = released {
                    warn!(session, error = %release_err, "lock release failed after section error");
                }
                Err(RegistryError::critical_section(e))
            }
        }
    }
}

impl<B: KvBackend + 'static> std::fmt::Debug for MutualExclusionGuard<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MutualExclusionGuard")
            .field("path", &LOCK_PATH)
            .field("session_ttl", &self.session_ttl)
            .finish()
    }
}

/// An open session, possibly holding the mutex.
///
/// Dropped without [`release`](Self::release), it releases in the background.
struct HeldLock<B: KvBackend + 'static> {
    backend: Arc<B>,
    session: SessionId,
    locked: bool,
    armed: bool,
}

impl<B: KvBackend + 'static> HeldLock<B> {
    fn new(backend: Arc<B>, session: SessionId) -> Self {
        Self {
            backend,
            session,
            locked: false,
            armed: true,
        }
    }

    /// Unlock (if held) and close the session.
    ///
    /// Only the unlock outcome is reported; a failed session close is logged.
    async fn release(&mut self) -> Result<(), crate::store::StoreError> {
        self.armed = false;
        let unlocked = if self.locked {
            self.locked = false;
            self.backend
                .unlock(self.session, LOCK_PATH.as_bytes())
                .await
        } else {
            Ok(())
        };
        if let Err(e) = self.backend.close_session(self.session).await {
            warn!(session = self.session, error = %e, "session close failed");
        }
        debug!(session = self.session, "lock session released");
        unlocked
    }
}

impl<B: KvBackend + 'static> Drop for HeldLock<B> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(session = self.session, "no runtime to release abandoned lock session");
            return;
        };
        let backend = Arc::clone(&self.backend);
        let session = self.session;
        let locked = self.locked;
        handle.spawn(async move {
            if locked {
                let _ = backend.unlock(session, LOCK_PATH.as_bytes()).await;
            }
            let _ = backend.close_session(session).await;
            debug!(session, "abandoned lock session released");
        });
    }
}
