//! Owner of the cache tiers, the reconciler and the invalidation bus.
//!
//! Build one per process (or per logical session) and hand it to the entity façades.
//! Caches handed out here stay subscribed to invalidation only while a caller holds them.

use std::sync::Arc;
use std::time::Duration;

use crate::cache::{
  CacheProvider, Cacheable, DiskCacheProvider, EntityCache, NoopProvider, ProviderInvalidator,
  TieredCache,
};
use crate::changeset::{ChangeAction, ChangeEntry, ChangeSetReconciler, ChangeSource};
use crate::config::CacheConfig;
use crate::error::{CacheResult, ReconcileError};
use crate::invalidation::{ChangeEvent, ChangePoller, InvalidationBus};

pub struct CacheContext<S: ChangeSource> {
  provider: Arc<dyn CacheProvider>,
  /// The bus holds listeners weakly; this keeps the disk tier subscribed.
  _invalidator: Arc<ProviderInvalidator>,
  reconciler: Arc<ChangeSetReconciler<S>>,
  bus: Arc<InvalidationBus>,
  poll_interval: Duration,
  fetch_timeout: Duration,
}

impl<S: ChangeSource> CacheContext<S> {
  /// Build a context from configuration, opening a fresh disk tier if enabled.
  pub fn new(config: &CacheConfig, source: S) -> CacheResult<Self> {
    let provider: Arc<dyn CacheProvider> = if config.disk_enabled {
      let disk = match &config.disk_path {
        Some(path) => DiskCacheProvider::open(path)?,
        None => DiskCacheProvider::open_default()?,
      };
      Arc::new(disk)
    } else {
      tracing::info!("disk cache disabled");
      Arc::new(NoopProvider)
    };

    Ok(Self::with_provider(
      provider,
      source,
      config.poll_interval(),
      config.fetch_timeout(),
    ))
  }

  pub fn with_provider(
    provider: Arc<dyn CacheProvider>,
    source: S,
    poll_interval: Duration,
    fetch_timeout: Duration,
  ) -> Self {
    let bus = Arc::new(InvalidationBus::new());
    let invalidator = Arc::new(ProviderInvalidator::new(Arc::clone(&provider)));
    bus.subscribe(&invalidator);

    Self {
      provider,
      _invalidator: invalidator,
      reconciler: Arc::new(ChangeSetReconciler::new(source)),
      bus,
      poll_interval,
      fetch_timeout,
    }
  }

  pub fn provider(&self) -> &Arc<dyn CacheProvider> {
    &self.provider
  }

  pub fn reconciler(&self) -> &Arc<ChangeSetReconciler<S>> {
    &self.reconciler
  }

  pub fn bus(&self) -> &Arc<InvalidationBus> {
    &self.bus
  }

  /// A new memory cache for `T`, subscribed to invalidation until the last clone is dropped.
  pub fn entity_cache<T: Cacheable>(&self) -> Arc<EntityCache<T>> {
    let cache = Arc::new(EntityCache::with_rule(self.provider.id_rule()));
    self.bus.subscribe(&cache);
    cache
  }

  /// A read-through cache for `T` over a new subscribed memory cache and the shared disk tier.
  pub fn tiered<T: Cacheable>(&self) -> TieredCache<T> {
    TieredCache::new(self.entity_cache::<T>(), Arc::clone(&self.provider))
  }

  /// Baseline the watermark at the remote store's last sequence.
  pub async fn start(&self) -> Result<i64, ReconcileError> {
    self.reconciler.set_baseline().await
  }

  /// Report a mutation this process just completed remotely.
  ///
  /// Registers one change per ID so the echo in the change log is suppressed, and drops
  /// the IDs from every cache tier right away.
  pub fn record_local_mutation(&self, table: &str, action: ChangeAction, ids: &[String]) {
    self.record_local_changes(
      ids
        .iter()
        .map(|id| ChangeEntry::local(table, action, id.as_str()))
        .collect(),
    );
  }

  /// Like [`record_local_mutation`](Self::record_local_mutation), with explicit counts.
  pub fn record_local_changes(&self, entries: Vec<ChangeEntry>) {
    let events = ChangeEvent::group(&entries);
    self.reconciler.register_local_change(entries);
    for event in &events {
      self.bus.publish(event);
    }
  }

  /// Poller over this context's reconciler and bus.
  pub fn poller(&self) -> ChangePoller<S> {
    ChangePoller::new(
      Arc::clone(&self.reconciler),
      Arc::clone(&self.bus),
      self.poll_interval,
      self.fetch_timeout,
    )
  }
}
