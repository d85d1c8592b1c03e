//! Translation of store change batches into subnet events.
//!
//! A watch call opens a store watch at `since + 1` and waits for the first
//! batch that carries a subnet event. Within a batch the first event whose
//! key names a subnet wins; later events of the same batch are not examined.
//! Batches without such an event are skipped.
//!
//! [`SubnetWatcher`] wraps the one-shot call into a pull-based iterator that
//! carries the resume revision between calls.

use super::leases::LeaseStore;
use crate::core::context::Context;
use crate::core::error::{RegistryError, RegistryResult};
use crate::store::{EventType, KvBackend, StoreError, WatchBatch, WatchRange};
use crate::subnet::{Event, Lease, Revision, Subnet};
use futures::stream::BoxStream;
use futures::StreamExt;
use std::sync::Arc;
use tracing::{debug, warn};

/// What a watch covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchScope {
    /// Every subnet in the namespace.
    All,
    /// One subnet.
    Subnet(Subnet),
}

impl<B: KvBackend> LeaseStore<B> {
    fn watch_range(&self, scope: WatchScope) -> WatchRange {
        match scope {
            WatchScope::All => WatchRange::prefix(self.layout().subnets_prefix()),
            WatchScope::Subnet(subnet) => WatchRange::key(self.layout().subnet_key(&subnet)),
        }
    }

    /// Wait for the next subnet event after `since`.
    pub async fn watch(
        &self,
        ctx: &Context,
        scope: WatchScope,
        since: Revision,
    ) -> RegistryResult<(Event, Revision)> {
        let range = self.watch_range(scope);
        let start = since.saturating_add(1);
        let mut stream = ctx
            .run(async { Ok(self.backend().watch(range, start).await?) })
            .await?;

        loop {
            let batch = ctx
                .run(async {
                    match stream.next().await {
                        Some(batch) => Ok(batch?),
                        None => Err(RegistryError::from(StoreError::Closed)),
                    }
                })
                .await?;

            if let Some(event) = self.translate(ctx, &batch).await? {
                return Ok((event, batch.revision));
            }
            debug!(revision = batch.revision, "batch carried no subnet event");
        }
    }

    /// Materialize the first subnet event of a batch.
    async fn translate(&self, ctx: &Context, batch: &WatchBatch) -> RegistryResult<Option<Event>> {
        for event in &batch.events {
            if !self.layout().is_subnet_key(event.key()) {
                continue;
            }
            match event.kind {
                EventType::Put => {
                    match self
                        .materialize(ctx, event.key(), event.value(), event.lease())
                        .await
                    {
                        Ok(lease) => return Ok(Some(Event::Added(lease))),
                        Err(RegistryError::Malformed { key, reason }) => {
                            warn!(%key, %reason, revision = batch.revision, "skipping malformed subnet event");
                        }
                        Err(e) => return Err(e),
                    }
                }
                EventType::Delete => match self.layout().parse_subnet_key(event.key()) {
                    Ok(subnet) => return Ok(Some(Event::Removed(Lease::tombstone(subnet)))),
                    Err(e) => {
                        warn!(
                            key = %String::from_utf8_lossy(event.key()),
                            error = %e,
                            revision = batch.revision,
                            "skipping malformed subnet event"
                        );
                    }
                },
            }
        }
        Ok(None)
    }
}

/// Pull-based subnet event iterator.
///
/// Each [`next`](Self::next) call yields one event and advances the resume
/// revision, so repeated calls observe every subnet change in order.
pub struct SubnetWatcher<B> {
    leases: Arc<LeaseStore<B>>,
    scope: WatchScope,
    since: Revision,
}

impl<B: KvBackend + 'static> SubnetWatcher<B> {
    pub(crate) fn new(leases: Arc<LeaseStore<B>>, scope: WatchScope, since: Revision) -> Self {
        Self {
            leases,
            scope,
            since,
        }
    }

    /// The revision the next call resumes after.
    pub fn revision(&self) -> Revision {
        self.since
    }

    /// What this watcher covers.
    pub fn scope(&self) -> WatchScope {
        self.scope
    }

    /// Wait for the next event.
    pub async fn next(&mut self, ctx: &Context) -> RegistryResult<(Event, Revision)> {
        let (event, revision) = self.leases.watch(ctx, self.scope, self.since).await?;
        self.since = revision;
        Ok((event, revision))
    }

    /// Turn the watcher into a stream that ends after the first error.
    pub fn into_stream(self, ctx: Context) -> BoxStream<'static, RegistryResult<(Event, Revision)>> {
        futures::stream::unfold(Some((self, ctx)), |state| async move {
            let (mut watcher, ctx) = state?;
            match watcher.next(&ctx).await {
                Ok(item) => Some((Ok(item), Some((watcher, ctx)))),
                Err(e) => Some((Err(e), None)),
            }
        })
        .boxed()
    }
}

impl<B> std::fmt::Debug for SubnetWatcher<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubnetWatcher")
            .field("scope", &self.scope)
            .field("since", &self.since)
            .finish()
    }
}
