//! Persistent cache tier interface.

use std::collections::HashMap;
use std::sync::Arc;

use super::record::parse_id;
use super::traits::{CacheSet, IdRule};
use crate::error::{CacheResult, ParseError};
use crate::invalidation::{ChangeEvent, InvalidationListener};

/// Trait for second-tier cache backends, one logical table per entity type.
///
/// Reads never fail: a fault is reported elsewhere and shows up as a miss. Writes are
/// all-or-nothing per call and return the number of rows affected.
pub trait CacheProvider: Send + Sync {
  /// Every cached record of `entity`, keyed by ID.
  fn select_all(&self, entity: &str) -> HashMap<String, String>;

  /// Split `ids` into cached contents and IDs still wanted.
  fn select_by_ids(&self, entity: &str, ids: &[String]) -> CacheSet<String>;

  /// Upsert: each record replaces any existing one with the same ID.
  fn set(&self, entity: &str, records: &[String]) -> CacheResult<usize>;

  /// Insert-if-absent: records whose ID already exists are ignored.
  fn insert(&self, entity: &str, records: &[String]) -> CacheResult<usize>;

  /// Update existing rows only. Absent IDs match nothing and are not inserted.
  fn update(&self, entity: &str, records: &[String]) -> CacheResult<usize>;

  fn delete(&self, entity: &str, ids: &[String]) -> CacheResult<usize>;

  /// Remove every record of `entity`.
  fn truncate(&self, entity: &str) -> CacheResult<usize>;

  /// ID validation applied by this provider.
  fn id_rule(&self) -> IdRule {
    IdRule::default()
  }

  /// Extract the canonical ID from record content.
  fn parse_id(&self, content: &str) -> Result<String, ParseError> {
    parse_id(content, self.id_rule())
  }
}

/// Provider that doesn't cache anything.
/// Used when the disk tier is disabled - every read is a miss, writes are discarded.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopProvider;

impl CacheProvider for NoopProvider {
  fn select_all(&self, _entity: &str) -> HashMap<String, String> {
    HashMap::new()
  }

  fn select_by_ids(&self, _entity: &str, ids: &[String]) -> CacheSet<String> {
    CacheSet::split(ids, self.id_rule(), |_| None)
  }

  fn set(&self, _entity: &str, _records: &[String]) -> CacheResult<usize> {
    Ok(0)
  }

  fn insert(&self, _entity: &str, _records: &[String]) -> CacheResult<usize> {
    Ok(0)
  }

  fn update(&self, _entity: &str, _records: &[String]) -> CacheResult<usize> {
    Ok(0)
  }

  fn delete(&self, _entity: &str, _ids: &[String]) -> CacheResult<usize> {
    Ok(0)
  }

  fn truncate(&self, _entity: &str) -> CacheResult<usize> {
    Ok(0)
  }
}

/// Routes invalidation events to a provider's `delete`/`truncate`.
pub struct ProviderInvalidator {
  provider: Arc<dyn CacheProvider>,
}

impl ProviderInvalidator {
  pub fn new(provider: Arc<dyn CacheProvider>) -> Self {
    Self { provider }
  }
}

impl InvalidationListener for ProviderInvalidator {
  fn on_remove(&self, event: &ChangeEvent) {
    if let Err(e) = self.provider.delete(&event.table, &event.ids) {
      tracing::warn!(table = %event.table, error = %e, "failed to invalidate persistent cache entries");
    }
  }

  fn on_clear(&self, table: &str) {
    if let Err(e) = self.provider.truncate(table) {
      tracing::warn!(table, error = %e, "failed to truncate persistent cache table");
    }
  }
}
