//! First cache tier: an in-process map from entity ID to entity.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use super::traits::{CacheSet, Cacheable, IdRule};
use crate::invalidation::{ChangeEvent, InvalidationListener};

/// In-memory entity cache.
///
/// Entries are replaced on fill and removed on invalidation, never edited in place. None of
/// the operations fail: invalid IDs are ignored and a poisoned lock is recovered.
pub struct EntityCache<T: Cacheable> {
  entries: RwLock<HashMap<String, T>>,
  rule: IdRule,
}

impl<T: Cacheable> Default for EntityCache<T> {
  fn default() -> Self {
    Self::new()
  }
}

impl<T: Cacheable> EntityCache<T> {
  pub fn new() -> Self {
    Self::with_rule(IdRule::default())
  }

  pub fn with_rule(rule: IdRule) -> Self {
    Self {
      entries: RwLock::new(HashMap::new()),
      rule,
    }
  }

  pub fn rule(&self) -> IdRule {
    self.rule
  }

  fn read(&self) -> RwLockReadGuard<'_, HashMap<String, T>> {
    self.entries.read().unwrap_or_else(PoisonError::into_inner)
  }

  fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, T>> {
    self.entries.write().unwrap_or_else(PoisonError::into_inner)
  }

  /// Split `ids` into cached records and IDs still wanted.
  pub fn select_by_ids<I, S>(&self, ids: I) -> CacheSet<T>
  where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
  {
    let entries = self.read();
    CacheSet::split(ids, self.rule, |id| entries.get(id).cloned())
  }

  /// Store records under their canonical key, replacing any entry with the same key.
  /// Returns how many were stored.
  pub fn put<I>(&self, records: I) -> usize
  where
    I: IntoIterator<Item = T>,
  {
    let mut entries = self.write();
    let mut stored = 0;
    for record in records {
      if let Some(key) = self.rule.canonical(&record.cache_key()) {
        entries.insert(key, record);
        stored += 1;
      }
    }
    stored
  }

  /// Remove the given IDs, returning how many were actually present.
  pub fn remove<I, S>(&self, ids: I) -> usize
  where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
  {
    let mut entries = self.write();
    ids
      .into_iter()
      .filter_map(|id| self.rule.canonical(id.as_ref()))
      .filter(|id| entries.remove(id).is_some())
      .count()
  }

  pub fn clear(&self) {
    self.write().clear();
  }

  /// Invalidation hook: drop every key listed in the event.
  pub fn notify_remove(&self, event: &ChangeEvent) -> usize {
    self.remove(&event.ids)
  }

  pub fn contains(&self, id: &str) -> bool {
    self
      .rule
      .canonical(id)
      .is_some_and(|id| self.read().contains_key(&id))
  }

  pub fn len(&self) -> usize {
    self.read().len()
  }

  pub fn is_empty(&self) -> bool {
    self.read().is_empty()
  }
}

impl<T: Cacheable> InvalidationListener for EntityCache<T> {
  fn on_remove(&self, event: &ChangeEvent) {
    if event.table == T::entity_type() {
      let removed = self.notify_remove(event);
      tracing::debug!(table = %event.table, removed, "invalidated memory cache entries");
    }
  }

  fn on_clear(&self, table: &str) {
    if table == T::entity_type() {
      self.clear();
    }
  }
}

#[cfg(test)]
pub(crate) mod tests {
  use super::*;
  use serde::{Deserialize, Serialize};

  #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
  pub(crate) struct Student {
    #[serde(rename = "ID")]
    pub id: String,
    pub name: String,
  }

  impl Student {
    pub fn new(id: &str, name: &str) -> Self {
      Self {
        id: id.to_string(),
        name: name.to_string(),
      }
    }
  }

  impl Cacheable for Student {
    fn cache_key(&self) -> String {
      self.id.clone()
    }

    fn entity_type() -> &'static str {
      "Student"
    }
  }

  fn cache_with(ids: &[&str]) -> EntityCache<Student> {
    let cache = EntityCache::new();
    cache.put(ids.iter().map(|id| Student::new(id, "n")));
    cache
  }

  #[test]
  fn test_select_partitions_valid_ids() {
    let cache = cache_with(&["1", "2"]);
    let set = cache.select_by_ids(["1", "3", "oops", "2", "-4"]);

    let hit_keys: Vec<String> = set.records.iter().map(|s| s.cache_key()).collect();
    assert_eq!(hit_keys, vec!["1", "2"]);
    assert_eq!(set.want_ids, vec!["3"]);
  }

  #[test]
  fn test_every_valid_id_lands_in_exactly_one_list() {
    let cache = cache_with(&["10", "20", "30"]);
    let request = ["5", "10", "abc", "20", "25", "", "30", "35"];
    let set = cache.select_by_ids(request);

    for id in request.iter().filter(|id| IdRule::default().is_valid(id)) {
      let in_records = set.records.iter().any(|s| s.id == *id);
      let in_wanted = set.want_ids.iter().any(|w| w == id);
      assert!(in_records ^ in_wanted, "id {id} must be in exactly one list");
    }
    assert!(!set.want_ids.iter().any(|w| w == "abc" || w.is_empty()));
    assert_eq!(set.records.len() + set.want_ids.len(), 6);
  }

  #[test]
  fn test_other_spellings_hit_the_canonical_entry() {
    let cache = cache_with(&["5", "07"]);
    let set = cache.select_by_ids(["05", "+5", "5", "7"]);

    assert_eq!(set.records.len(), 2);
    assert_eq!(set.records[0].id, "5");
    assert_eq!(set.records[1].id, "07");
    assert!(set.want_ids.is_empty());
    assert!(cache.contains("+7"));

    assert_eq!(cache.remove(["005"]), 1);
    assert_eq!(cache.select_by_ids(["5"]).want_ids, vec!["5"]);
  }

  #[test]
  fn test_remove_is_idempotent() {
    let cache = cache_with(&["1", "2"]);
    assert_eq!(cache.remove(["1"]), 1);
    assert_eq!(cache.remove(["1"]), 0);
    assert_eq!(cache.remove(["1", "2", "9"]), 1);
    assert!(cache.is_empty());
  }

  #[test]
  fn test_put_replaces_and_skips_invalid_keys() {
    let cache = cache_with(&["1"]);
    assert_eq!(cache.put([Student::new("1", "new"), Student::new("bad", "x")]), 1);
    assert_eq!(cache.len(), 1);
    assert_eq!(cache.select_by_ids(["1"]).records[0].name, "new");
  }

  #[test]
  fn test_clear_drops_everything() {
    let cache = cache_with(&["1", "2", "3"]);
    cache.clear();
    assert!(cache.is_empty());
    assert_eq!(cache.select_by_ids(["1"]).want_ids, vec!["1"]);
  }

  #[test]
  fn test_listener_ignores_other_tables() {
    let cache = cache_with(&["1", "2"]);
    cache.on_remove(&ChangeEvent::new("Course", ["1"]));
    assert_eq!(cache.len(), 2);

    let event = ChangeEvent::new("Student", ["1", "1"]);
    cache.on_remove(&event);
    cache.on_remove(&event);
    assert!(!cache.contains("1"));
    assert!(cache.contains("2"));

    cache.on_clear("Student");
    assert!(cache.is_empty());
  }
}
