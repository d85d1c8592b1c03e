//! Lease reads and writes against the backing store.
//!
//! Subnet entries are stored as serialized attributes bound to a TTL lease.
//! Expirations are never stored: they are recomputed on every read from the
//! lease's remaining TTL.

use crate::core::context::Context;
use crate::core::error::{RegistryError, RegistryResult};
use crate::core::time::{expiration_from_ttl, Clock};
use crate::store::{KvBackend, LeaseId};
use crate::subnet::{encode_attrs, KeyLayout, Lease, LeaseAttrs, Revision, Subnet};
use std::sync::Arc;
use tracing::{debug, warn};

/// Lease CRUD over one key namespace.
pub struct LeaseStore<B> {
    backend: Arc<B>,
    layout: KeyLayout,
    clock: Arc<dyn Clock>,
}

impl<B: KvBackend> LeaseStore<B> {
    /// Create a lease store over `backend` rooted at `layout`.
    pub fn new(backend: Arc<B>, layout: KeyLayout, clock: Arc<dyn Clock>) -> Self {
        Self {
            backend,
            layout,
            clock,
        }
    }

    /// The backing store.
    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    /// The key layout.
    pub fn layout(&self) -> &KeyLayout {
        &self.layout
    }

    /// Read the network config blob.
    pub async fn get_network_config(&self, ctx: &Context) -> RegistryResult<String> {
        let key = self.layout.config_key();
        let resp = ctx
            .run(async { Ok(self.backend.get(key.as_bytes()).await?) })
            .await?;
        let kv = resp.first().ok_or_else(|| RegistryError::not_found(&key))?;
        String::from_utf8(kv.value.clone())
            .map_err(|e| RegistryError::malformed(&key, e.to_string()))
    }

    /// Read one subnet's lease.
    pub async fn get_subnet(
        &self,
        ctx: &Context,
        subnet: Subnet,
    ) -> RegistryResult<(Lease, Revision)> {
        let key = self.layout.subnet_key(&subnet);
        let resp = ctx
            .run(async { Ok(self.backend.get(key.as_bytes()).await?) })
            .await?;
        let kv = resp.first().ok_or_else(|| RegistryError::not_found(&key))?;

        let lease = self.materialize(ctx, &kv.key, &kv.value, kv.lease).await?;
        Ok((lease, resp.revision))
    }

    /// Read every subnet lease in the namespace.
    ///
    /// Keys that do not name a subnet are ignored; entries that fail to
    /// decode are logged and skipped. Each surviving entry costs one TTL
    /// lookup.
    pub async fn get_subnets(&self, ctx: &Context) -> RegistryResult<(Vec<Lease>, Revision)> {
        let prefix = self.layout.subnets_prefix();
        let resp = ctx
            .run(async { Ok(self.backend.get_prefix(prefix.as_bytes()).await?) })
            .await?;

        let mut leases = Vec::with_capacity(resp.count());
        for kv in &resp.kvs {
            if !self.layout.is_subnet_key(&kv.key) {
                continue;
            }
            let lease = match self.layout.parse_lease(&kv.key, &kv.value) {
                Ok(lease) => lease,
                Err(e) => {
                    warn!(
                        key = %String::from_utf8_lossy(&kv.key),
                        error = %e,
                        "skipping malformed subnet entry"
                    );
                    continue;
                }
            };
            leases.push(self.with_expiration(ctx, lease, kv.lease).await?);
        }

        debug!(count = leases.len(), revision = resp.revision, "listed subnets");
        Ok((leases, resp.revision))
    }

    /// Write a subnet lease bound to a fresh TTL lease. Always overwrites.
    ///
    /// Returns the TTL the entry was written with.
    pub async fn create_subnet(
        &self,
        ctx: &Context,
        subnet: Subnet,
        attrs: &LeaseAttrs,
        ttl: i64,
    ) -> RegistryResult<i64> {
        if ttl <= 0 {
            return Err(RegistryError::InvalidRequest {
                message: format!("lease ttl must be positive, got {ttl}"),
            });
        }
        let key = self.layout.subnet_key(&subnet);
        let value = encode_attrs(attrs)?;

        let revision = ctx
            .run(async {
                let lease = self.backend.grant(ttl).await?;
                Ok(self.backend.put(key.as_bytes(), value, Some(lease)).await?)
            })
            .await?;

        debug!(%subnet, ttl, revision, "subnet lease written");
        Ok(ttl)
    }

    /// Re-create a subnet lease with new attributes and TTL.
    ///
    /// `as_of` is accepted but not checked against the stored revision.
    pub async fn update_subnet(
        &self,
        ctx: &Context,
        subnet: Subnet,
        attrs: &LeaseAttrs,
        ttl: i64,
        as_of: Revision,
    ) -> RegistryResult<i64> {
        debug!(%subnet, as_of, "update ignores the prior revision");
        self.create_subnet(ctx, subnet, attrs, ttl).await
    }

    /// Delete a subnet lease. Deleting an absent entry succeeds.
    pub async fn delete_subnet(&self, ctx: &Context, subnet: Subnet) -> RegistryResult<()> {
        let key = self.layout.subnet_key(&subnet);
        let resp = ctx
            .run(async { Ok(self.backend.delete(key.as_bytes()).await?) })
            .await?;
        debug!(%subnet, deleted = resp.deleted, revision = resp.revision, "subnet lease deleted");
        Ok(())
    }

    /// Remaining seconds on a store lease.
    pub async fn lease_ttl(&self, ctx: &Context, lease: LeaseId) -> RegistryResult<i64> {
        ctx.run(async { Ok(self.backend.time_to_live(lease).await?) })
            .await
    }

    /// Decode a stored pair and compute its expiration.
    pub(crate) async fn materialize(
        &self,
        ctx: &Context,
        key: &[u8],
        value: &[u8],
        lease: Option<LeaseId>,
    ) -> RegistryResult<Lease> {
        let decoded = self
            .layout
            .parse_lease(key, value)
            .map_err(|e| RegistryError::malformed(String::from_utf8_lossy(key), e.to_string()))?;
        self.with_expiration(ctx, decoded, lease).await
    }

    /// Set expiration from the bound lease's remaining TTL.
    ///
    /// A failed TTL lookup reports the lease as expiring now rather than
    /// failing the read. Cancellation still fails the read.
    async fn with_expiration(
        &self,
        ctx: &Context,
        lease: Lease,
        lease_id: Option<LeaseId>,
    ) -> RegistryResult<Lease> {
        let lookup = match lease_id {
            Some(id) => self.lease_ttl(ctx, id).await,
            None => Err(RegistryError::InvalidRequest {
                message: "entry is not bound to a lease".to_string(),
            }),
        };

        let now = self.clock.now();
        match lookup {
            Ok(ttl) => Ok(lease.with_expiration(expiration_from_ttl(now, ttl), ttl)),
            Err(e) if e.is_cancelled() => Err(e),
            Err(e) => {
                warn!(subnet = %lease.subnet, error = %e, "lease ttl lookup failed; treating as expired");
                let mut lease = lease;
                lease.expiration = Some(now.to_datetime());
                Ok(lease)
            }
        }
    }
}

impl<B> std::fmt::Debug for LeaseStore<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaseStore")
            .field("prefix", &self.layout.prefix())
            .finish()
    }
}
