//! etcd v3 implementation of [`KvBackend`].
//!
//! Sessions are leases kept alive by a background task until closed, the
//! same contract as etcd's concurrency sessions. Mutexes use etcd's lock
//! service with the session lease attached; the lock key it returns is
//! remembered per session so unlock and close can release it.

use super::watch::{WatchBatch, WatchEvent, WatchRange};
use super::{DeleteResponse, GetResponse, KeyValue, KvBackend, LeaseId, SessionId, StoreError};
use super::WatchStream;
use crate::core::config::ClientOptions;
use crate::subnet::Revision;
use async_trait::async_trait;
use etcd_client::{
    Certificate, Client, ConnectOptions, EventType as EtcdEventType, GetOptions, Identity,
    LockOptions, PutOptions, TlsOptions, WatchOptions, Watcher,
};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Shortest interval between session keepalives.
const MIN_KEEPALIVE_PERIOD: Duration = Duration::from_millis(500);

/// Backing store client for an etcd v3 cluster.
#[derive(Clone)]
pub struct EtcdStore {
    client: Client,
    sessions: Arc<Mutex<HashMap<SessionId, Session>>>,
}

struct Session {
    keepalive: CancellationToken,
    /// Mutex path -> lock key owned in etcd.
    locks: HashMap<Vec<u8>, Vec<u8>>,
}

impl EtcdStore {
    /// Connect using resolved client options.
    pub async fn connect(options: &ClientOptions) -> Result<Self, StoreError> {
        let mut connect = ConnectOptions::new();
        if let Some(credentials) = &options.credentials {
            connect = connect.with_user(
                credentials.username.clone(),
                credentials.password.clone(),
            );
        }
        if let Some(tls) = &options.tls {
            let tls_options = TlsOptions::new()
                .ca_certificate(Certificate::from_pem(&tls.trust.ca_certs_pem))
                .identity(Identity::from_pem(
                    &tls.identity.cert_chain_pem,
                    &tls.identity.key_pem,
                ));
            connect = connect.with_tls(tls_options);
        }

        let client = Client::connect(&options.endpoints, Some(connect))
            .await
            .map_err(unavailable)?;
        debug!(endpoints = ?options.endpoints, tls = options.tls.is_some(), "connected to etcd");
        Ok(Self {
            client,
            sessions: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    fn client(&self) -> Client {
        self.client.clone()
    }
}

impl std::fmt::Debug for EtcdStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EtcdStore")
            .field("sessions", &self.sessions.lock().len())
            .finish()
    }
}

fn unavailable(err: etcd_client::Error) -> StoreError {
    StoreError::unavailable(err.to_string())
}

/// etcd reports "no lease" as lease id 0.
fn lease_of(raw: i64) -> Option<LeaseId> {
    (raw != 0).then_some(raw)
}

fn revision_of(raw: i64) -> Revision {
    raw.max(0) as Revision
}

fn keepalive_period(ttl_seconds: i64) -> Duration {
    let ttl = Duration::from_secs(ttl_seconds.max(1) as u64);
    (ttl / 3).max(MIN_KEEPALIVE_PERIOD)
}

fn to_key_value(kv: &etcd_client::KeyValue) -> KeyValue {
    KeyValue {
        key: kv.key().to_vec(),
        value: kv.value().to_vec(),
        create_revision: revision_of(kv.create_revision()),
        mod_revision: revision_of(kv.mod_revision()),
        version: kv.version().max(0) as u64,
        lease: lease_of(kv.lease()),
    }
}

fn to_get_response(resp: &etcd_client::GetResponse) -> GetResponse {
    GetResponse {
        kvs: resp.kvs().iter().map(to_key_value).collect(),
        revision: resp.header().map(|h| revision_of(h.revision())).unwrap_or(0),
    }
}

/// State behind one watch stream.
struct EtcdWatch {
    // Dropping the watcher cancels the watch server-side.
    _watcher: Watcher,
    stream: etcd_client::WatchStream,
    start: Revision,
    pending: VecDeque<WatchBatch>,
    finished: bool,
}

impl EtcdWatch {
    async fn next_batch(&mut self) -> Option<Result<WatchBatch, StoreError>> {
        loop {
            if let Some(batch) = self.pending.pop_front() {
                return Some(Ok(batch));
            }
            if self.finished {
                return None;
            }

            let resp = match self.stream.message().await {
                Ok(Some(resp)) => resp,
                Ok(None) => return self.fail(StoreError::Closed),
                Err(e) => return self.fail(unavailable(e)),
            };
            if resp.compact_revision() > 0 {
                return self.fail(StoreError::Compacted {
                    revision: self.start,
                    compaction_floor: revision_of(resp.compact_revision()),
                });
            }
            if resp.canceled() {
                return self.fail(StoreError::Closed);
            }

            let events = resp.events().iter().filter_map(|event| {
                let kv = event.kv()?;
                Some(match event.event_type() {
                    EtcdEventType::Put => WatchEvent::put(to_key_value(kv)),
                    EtcdEventType::Delete => {
                        WatchEvent::delete(kv.key().to_vec(), revision_of(kv.mod_revision()))
                    }
                })
            });
            self.pending.extend(WatchBatch::group_by_revision(events));
        }
    }

    fn fail(&mut self, err: StoreError) -> Option<Result<WatchBatch, StoreError>> {
        self.finished = true;
        Some(Err(err))
    }
}

#[async_trait]
impl KvBackend for EtcdStore {
    async fn get(&self, key: &[u8]) -> Result<GetResponse, StoreError> {
        let resp = self
            .client()
            .get(key.to_vec(), None)
            .await
            .map_err(unavailable)?;
        Ok(to_get_response(&resp))
    }

    async fn get_prefix(&self, prefix: &[u8]) -> Result<GetResponse, StoreError> {
        let resp = self
            .client()
            .get(prefix.to_vec(), Some(GetOptions::new().with_prefix()))
            .await
            .map_err(unavailable)?;
        Ok(to_get_response(&resp))
    }

    async fn put(
        &self,
        key: &[u8],
        value: Vec<u8>,
        lease: Option<LeaseId>,
    ) -> Result<Revision, StoreError> {
        let options = lease.map(|id| PutOptions::new().with_lease(id));
        let resp = self
            .client()
            .put(key.to_vec(), value, options)
            .await
            .map_err(unavailable)?;
        Ok(resp.header().map(|h| revision_of(h.revision())).unwrap_or(0))
    }

    async fn delete(&self, key: &[u8]) -> Result<DeleteResponse, StoreError> {
        let resp = self
            .client()
            .delete(key.to_vec(), None)
            .await
            .map_err(unavailable)?;
        Ok(DeleteResponse {
            deleted: resp.deleted().max(0) as u64,
            revision: resp.header().map(|h| revision_of(h.revision())).unwrap_or(0),
        })
    }

    async fn watch(
        &self,
        range: WatchRange,
        start_revision: Revision,
    ) -> Result<WatchStream, StoreError> {
        let (key, options) = match range {
            WatchRange::Key(key) => (key, WatchOptions::new()),
            WatchRange::Prefix(prefix) => (prefix, WatchOptions::new().with_prefix()),
        };
        let options = if start_revision > 0 {
            options.with_start_revision(start_revision as i64)
        } else {
            options
        };
        let (watcher, stream) = self
            .client()
            .watch(key, Some(options))
            .await
            .map_err(unavailable)?;

        let state = EtcdWatch {
            _watcher: watcher,
            stream,
            start: start_revision,
            pending: VecDeque::new(),
            finished: false,
        };
        Ok(Box::pin(futures::stream::unfold(
            state,
            |mut state| async move {
                let item = state.next_batch().await?;
                Some((item, state))
            },
        )))
    }

    async fn grant(&self, ttl_seconds: i64) -> Result<LeaseId, StoreError> {
        let resp = self
            .client()
            .lease_grant(ttl_seconds.max(1), None)
            .await
            .map_err(unavailable)?;
        Ok(resp.id())
    }

    async fn time_to_live(&self, lease: LeaseId) -> Result<i64, StoreError> {
        let resp = self
            .client()
            .lease_time_to_live(lease, None)
            .await
            .map_err(unavailable)?;
        // An expired or unknown lease reports -1.
        if resp.ttl() < 0 {
            return Err(StoreError::LeaseNotFound { lease_id: lease });
        }
        Ok(resp.ttl())
    }

    async fn revoke(&self, lease: LeaseId) -> Result<(), StoreError> {
        self.client()
            .lease_revoke(lease)
            .await
            .map_err(unavailable)?;
        Ok(())
    }

    async fn open_session(&self, ttl_seconds: i64) -> Result<SessionId, StoreError> {
        let mut client = self.client();
        let id = client
            .lease_grant(ttl_seconds.max(1), None)
            .await
            .map_err(unavailable)?
            .id();
        let (mut keeper, mut responses) =
            client.lease_keep_alive(id).await.map_err(unavailable)?;

        let token = CancellationToken::new();
        let stop = token.clone();
        let period = keepalive_period(ttl_seconds);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = keeper.keep_alive().await {
                            warn!(session = id, error = %e, "session keepalive failed");
                            break;
                        }
                        match responses.message().await {
                            Ok(Some(resp)) if resp.ttl() > 0 => {}
                            Ok(_) => {
                                warn!(session = id, "session lease expired");
                                break;
                            }
                            Err(e) => {
                                warn!(session = id, error = %e, "session keepalive failed");
                                break;
                            }
                        }
                    }
                }
            }
        });

        self.sessions.lock().insert(
            id,
            Session {
                keepalive: token,
                locks: HashMap::new(),
            },
        );
        debug!(session = id, ttl_seconds, "session opened");
        Ok(id)
    }

    async fn lock(&self, session: SessionId, path: &[u8]) -> Result<(), StoreError> {
        if !self.sessions.lock().contains_key(&session) {
            return Err(StoreError::SessionExpired {
                session_id: session,
            });
        }
        let resp = self
            .client()
            .lock(path.to_vec(), Some(LockOptions::new().with_lease(session)))
            .await
            .map_err(unavailable)?;

        let mut sessions = self.sessions.lock();
        match sessions.get_mut(&session) {
            Some(state) => {
                state.locks.insert(path.to_vec(), resp.key().to_vec());
                Ok(())
            }
            // Closed while waiting; the lease revoke already dropped the lock key.
            None => Err(StoreError::SessionExpired {
                session_id: session,
            }),
        }
    }

    async fn unlock(&self, session: SessionId, path: &[u8]) -> Result<(), StoreError> {
        let lock_key = self
            .sessions
            .lock()
            .get_mut(&session)
            .and_then(|state| state.locks.remove(path))
            .ok_or_else(|| StoreError::LockNotHeld {
                path: String::from_utf8_lossy(path).into_owned(),
                session_id: session,
            })?;
        self.client()
            .unlock(lock_key)
            .await
            .map_err(unavailable)?;
        Ok(())
    }

    async fn close_session(&self, session: SessionId) -> Result<(), StoreError> {
        let state = self
            .sessions
            .lock()
            .remove(&session)
            .ok_or(StoreError::SessionExpired {
                session_id: session,
            })?;
        state.keepalive.cancel();
        self.client()
            .lease_revoke(session)
            .await
            .map_err(unavailable)?;
        debug!(session, "session closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_lease_is_none() {
        assert_eq!(lease_of(0), None);
        assert_eq!(lease_of(7587), Some(7587));
    }

    #[test]
    fn test_negative_revision_clamps() {
        assert_eq!(revision_of(-1), 0);
        assert_eq!(revision_of(42), 42);
    }

    #[test]
    fn test_keepalive_period() {
        assert_eq!(keepalive_period(60), Duration::from_secs(20));
        assert_eq!(keepalive_period(1), MIN_KEEPALIVE_PERIOD);
        assert_eq!(keepalive_period(0), MIN_KEEPALIVE_PERIOD);
    }
}
