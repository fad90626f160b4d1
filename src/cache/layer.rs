//! Read-through orchestration across the cache tiers and the remote store.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;

use super::memory::EntityCache;
use super::provider::CacheProvider;
use super::traits::{valid_ids, Cacheable};

/// Records returned by a tiered lookup, with where they came from.
#[derive(Debug, Clone)]
pub struct Fetched<T> {
  /// Found records, in request order
  pub records: Vec<T>,
  /// Valid IDs that no tier and not the remote store could supply
  pub missing: Vec<String>,
  pub memory_hits: usize,
  pub disk_hits: usize,
  pub remote_hits: usize,
}

/// Memory tier in front of a persistent tier in front of the remote store.
///
/// Lower tiers fill the ones above them on the way back. The cache never makes a read
/// fail: a persistent-tier fault is a miss and a failed fill is only logged.
pub struct TieredCache<T: Cacheable> {
  memory: Arc<EntityCache<T>>,
  provider: Arc<dyn CacheProvider>,
}

impl<T: Cacheable> TieredCache<T> {
  pub fn new(memory: Arc<EntityCache<T>>, provider: Arc<dyn CacheProvider>) -> Self {
    Self { memory, provider }
  }

  pub fn memory(&self) -> &Arc<EntityCache<T>> {
    &self.memory
  }

  /// Look `ids` up tier by tier, asking `fetcher` for whatever is still wanted.
  ///
  /// The fetcher receives the wanted IDs and is only called when there are any. Its
  /// error is the only error this returns.
  pub async fn fetch_by_ids<F, Fut, E>(&self, ids: &[String], fetcher: F) -> Result<Fetched<T>, E>
  where
    F: FnOnce(Vec<String>) -> Fut,
    Fut: Future<Output = Result<Vec<T>, E>>,
  {
    let entity = T::entity_type();
    let order = valid_ids(ids, self.memory.rule());

    let cached = self.memory.select_by_ids(&order);
    let memory_hits = cached.records.len();
    let mut found: HashMap<String, T> = cached
      .records
      .into_iter()
      .map(|record| (self.key_of(&record), record))
      .collect();
    let mut wanted = cached.want_ids;

    let mut disk_hits = 0;
    if !wanted.is_empty() {
      let stored = self.provider.select_by_ids(entity, &wanted);
      let decoded: Vec<T> = stored
        .records
        .iter()
        .filter_map(|content| match serde_json::from_str::<T>(content) {
          Ok(record) => Some(record),
          Err(e) => {
            tracing::warn!(entity, error = %e, "undecodable disk cache record, treating as miss");
            None
          }
        })
        .collect();

      let keys: HashSet<String> = decoded.iter().map(|record| self.key_of(record)).collect();
      wanted.retain(|id| !keys.contains(id));
      disk_hits = decoded.len();

      self.memory.put(decoded.iter().cloned());
      found.extend(decoded.into_iter().map(|record| (self.key_of(&record), record)));
    }

    let mut remote_hits = 0;
    if !wanted.is_empty() {
      let fetched = fetcher(wanted).await?;
      remote_hits = fetched.len();
      self.fill(entity, &fetched);
      found.extend(fetched.into_iter().map(|record| (self.key_of(&record), record)));
    }

    let mut records = Vec::with_capacity(order.len());
    let mut missing = Vec::new();
    for id in order {
      match found.remove(&id) {
        Some(record) => records.push(record),
        None => missing.push(id),
      }
    }

    tracing::debug!(entity, memory_hits, disk_hits, remote_hits, missing = missing.len(), "tiered lookup");
    Ok(Fetched {
      records,
      missing,
      memory_hits,
      disk_hits,
      remote_hits,
    })
  }

  /// Key a record the way the requested IDs were canonicalized.
  fn key_of(&self, record: &T) -> String {
    let key = record.cache_key();
    self.memory.rule().canonical(&key).unwrap_or(key)
  }

  /// Store freshly fetched records in both tiers.
  fn fill(&self, entity: &str, records: &[T]) {
    let contents: Vec<String> = records
      .iter()
      .filter_map(|record| match serde_json::to_string(record) {
        Ok(content) => Some(content),
        Err(e) => {
          tracing::warn!(entity, error = %e, "failed to serialize record for disk cache");
          None
        }
      })
      .collect();

    if let Err(e) = self.provider.set(entity, &contents) {
      tracing::warn!(entity, error = %e, "failed to fill disk cache");
    }
    self.memory.put(records.iter().cloned());
  }
}

impl<T: Cacheable> Clone for TieredCache<T> {
  fn clone(&self) -> Self {
    Self {
      memory: Arc::clone(&self.memory),
      provider: Arc::clone(&self.provider),
    }
  }
}
