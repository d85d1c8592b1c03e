//! Subnet lease registry.
//!
//! [`Registry`] is the whole surface exposed to allocators. [`LeaseRegistry`]
//! implements it over any [`KvBackend`]:
//!
//! - [`leases`] - reads and writes of lease entries
//! - [`watch`] - change batches to subnet events, [`SubnetWatcher`]
//! - [`guard`] - cluster-wide mutual exclusion
//!
//! Every operation takes a [`Context`]; a context that is already done fails
//! the call with [`RegistryError::Cancelled`] before the store is touched.

pub mod guard;
pub mod leases;
pub mod watch;

use crate::core::config::{Config, RegistryConfig};
use crate::core::context::Context;
use crate::core::error::{RegistryError, RegistryResult};
use crate::core::time::{Clock, SystemClock};
use crate::store::{KvBackend, LeaseId};
use crate::subnet::{Event, KeyLayout, Lease, LeaseAttrs, Revision, Subnet};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info};

pub use guard::{MutualExclusionGuard, LOCK_PATH};
pub use leases::LeaseStore;
pub use watch::{SubnetWatcher, WatchScope};

/// Operations available to subnet allocators.
#[async_trait]
pub trait Registry: Send + Sync {
    /// Read the opaque network config blob.
    async fn get_network_config(&self, ctx: &Context) -> RegistryResult<String>;

    /// List every subnet lease with the revision the listing was read at.
    async fn get_subnets(&self, ctx: &Context) -> RegistryResult<(Vec<Lease>, Revision)>;

    /// Read one subnet lease.
    async fn get_subnet(&self, ctx: &Context, subnet: Subnet) -> RegistryResult<(Lease, Revision)>;

    /// Write a subnet lease with a fresh TTL. Returns the TTL.
    async fn create_subnet(
        &self,
        ctx: &Context,
        subnet: Subnet,
        attrs: &LeaseAttrs,
        ttl: i64,
    ) -> RegistryResult<i64>;

    /// Re-create a subnet lease. `as_of` is not enforced.
    async fn update_subnet(
        &self,
        ctx: &Context,
        subnet: Subnet,
        attrs: &LeaseAttrs,
        ttl: i64,
        as_of: Revision,
    ) -> RegistryResult<i64>;

    /// Delete a subnet lease. Succeeds if absent.
    async fn delete_subnet(&self, ctx: &Context, subnet: Subnet) -> RegistryResult<()>;

    /// Wait for the next event on any subnet after `since`.
    async fn watch_subnets(&self, ctx: &Context, since: Revision) -> RegistryResult<(Event, Revision)>;

    /// Wait for the next event on `subnet` after `since`.
    async fn watch_subnet(
        &self,
        ctx: &Context,
        since: Revision,
        subnet: Subnet,
    ) -> RegistryResult<(Event, Revision)>;
}

/// Registry over a [`KvBackend`].
pub struct LeaseRegistry<B: KvBackend + 'static> {
    leases: Arc<LeaseStore<B>>,
    guard: MutualExclusionGuard<B>,
    reject_overlapping: bool,
}

impl<B: KvBackend + 'static> LeaseRegistry<B> {
    /// Create a registry driven by the wall clock.
    pub fn new(backend: B, config: &RegistryConfig) -> Self {
        Self::with_clock(backend, config, Arc::new(SystemClock))
    }

    /// Validate a full configuration and create a registry over `backend`.
    pub fn from_config(backend: B, config: &Config) -> anyhow::Result<Self> {
        config.validate()?;
        Ok(Self::new(backend, &config.registry))
    }

    /// Create a registry computing expirations from `clock`.
    pub fn with_clock(backend: B, config: &RegistryConfig, clock: Arc<dyn Clock>) -> Self {
        let backend = Arc::new(backend);
        let layout = KeyLayout::new(&config.prefix);
        info!(
            prefix = layout.prefix(),
            reject_overlapping = config.reject_overlapping,
            "lease registry ready"
        );
        Self {
            leases: Arc::new(LeaseStore::new(Arc::clone(&backend), layout, clock)),
            guard: MutualExclusionGuard::new(backend, config.lock_session_ttl_seconds),
            reject_overlapping: config.reject_overlapping,
        }
    }

    /// The backing store.
    pub fn backend(&self) -> &B {
        self.leases.backend()
    }

    /// The key layout.
    pub fn layout(&self) -> &KeyLayout {
        self.leases.layout()
    }

    /// The lease operations.
    pub fn leases(&self) -> &LeaseStore<B> {
        &self.leases
    }

    /// The registry-wide mutual exclusion guard.
    pub fn guard(&self) -> &MutualExclusionGuard<B> {
        &self.guard
    }

    /// Remaining seconds on a store lease.
    pub async fn lease_ttl(&self, ctx: &Context, lease: LeaseId) -> RegistryResult<i64> {
        ctx.check()?;
        self.leases.lease_ttl(ctx, lease).await
    }

    /// A watcher over every subnet, resuming after `since`.
    pub fn watcher(&self, since: Revision) -> SubnetWatcher<B> {
        SubnetWatcher::new(Arc::clone(&self.leases), WatchScope::All, since)
    }

    /// A watcher over one subnet, resuming after `since`.
    pub fn watcher_for(&self, subnet: Subnet, since: Revision) -> SubnetWatcher<B> {
        SubnetWatcher::new(Arc::clone(&self.leases), WatchScope::Subnet(subnet), since)
    }

    /// Create under the guard, rejecting overlap with a different live subnet.
    async fn create_exclusive(
        &self,
        ctx: &Context,
        subnet: Subnet,
        attrs: &LeaseAttrs,
        ttl: i64,
    ) -> RegistryResult<i64> {
        self.guard
            .with_lock(ctx, || async {
                let (existing, revision) = self.leases.get_subnets(ctx).await?;
                if let Some(clash) = existing
                    .iter()
                    .find(|lease| lease.subnet != subnet && lease.subnet.overlaps(&subnet))
                {
                    debug!(%subnet, existing = %clash.subnet, revision, "subnet overlaps existing lease");
                    return Err(RegistryError::Overlap {
                        requested: subnet,
                        existing: clash.subnet,
                    });
                }
                self.leases.create_subnet(ctx, subnet, attrs, ttl).await
            })
            .await
            .map_err(|e| match e {
                RegistryError::CriticalSection { source }
                    if matches!(*source, RegistryError::Overlap { .. }) =>
                {
                    *source
                }
                other => other,
            })
    }
}

#[cfg(feature = "etcd")]
impl LeaseRegistry<crate::store::EtcdStore> {
    /// Validate `config`, connect to the etcd cluster it names and build a registry.
    pub async fn connect(config: &Config) -> anyhow::Result<Self> {
        config.validate()?;
        let options = config.store.client_options()?;
        let backend = crate::store::EtcdStore::connect(&options).await?;
        Ok(Self::new(backend, &config.registry))
    }
}

impl<B: KvBackend + 'static> std::fmt::Debug for LeaseRegistry<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaseRegistry")
            .field("prefix", &self.layout().prefix())
            .field("reject_overlapping", &self.reject_overlapping)
            .finish()
    }
}

#[async_trait]
impl<B: KvBackend + 'static> Registry for LeaseRegistry<B> {
    async fn get_network_config(&self, ctx: &Context) -> RegistryResult<String> {
        ctx.check()?;
        self.leases.get_network_config(ctx).await
    }

    async fn get_subnets(&self, ctx: &Context) -> RegistryResult<(Vec<Lease>, Revision)> {
        ctx.check()?;
        self.leases.get_subnets(ctx).await
    }

    async fn get_subnet(&self, ctx: &Context, subnet: Subnet) -> RegistryResult<(Lease, Revision)> {
        ctx.check()?;
        self.leases.get_subnet(ctx, subnet).await
    }

    async fn create_subnet(
        &self,
        ctx: &Context,
        subnet: Subnet,
        attrs: &LeaseAttrs,
        ttl: i64,
    ) -> RegistryResult<i64> {
        ctx.check()?;
        if self.reject_overlapping {
            self.create_exclusive(ctx, subnet, attrs, ttl).await
        } else {
            self.leases.create_subnet(ctx, subnet, attrs, ttl).await
        }
    }

    async fn update_subnet(
        &self,
        ctx: &Context,
        subnet: Subnet,
        attrs: &LeaseAttrs,
        ttl: i64,
        as_of: Revision,
    ) -> RegistryResult<i64> {
        ctx.check()?;
        self.leases
            .update_subnet(ctx, subnet, attrs, ttl, as_of)
            .await
    }

    async fn delete_subnet(&self, ctx: &Context, subnet: Subnet) -> RegistryResult<()> {
        ctx.check()?;
        self.leases.delete_subnet(ctx, subnet).await
    }

    async fn watch_subnets(&self, ctx: &Context, since: Revision) -> RegistryResult<(Event, Revision)> {
        ctx.check()?;
        self.leases.watch(ctx, WatchScope::All, since).await
    }

    async fn watch_subnet(
        &self,
        ctx: &Context,
        since: Revision,
        subnet: Subnet,
    ) -> RegistryResult<(Event, Revision)> {
        ctx.check()?;
        self.leases
            .watch(ctx, WatchScope::Subnet(subnet), since)
            .await
    }
}
