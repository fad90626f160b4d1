//! Core traits and types for the caching system.

use serde::{de::DeserializeOwned, Serialize};
use std::collections::HashSet;

/// Trait for entities that can be cached.
///
/// The serialized form of an implementor must carry its key in the top-level `ID` field,
/// since the persistent tier recovers keys from content alone.
pub trait Cacheable: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {
  /// Unique identifier for this entity (e.g. a student number)
  fn cache_key(&self) -> String;

  /// Entity type name, used as the table name in the persistent tier (e.g. "Student")
  fn entity_type() -> &'static str;
}

/// Syntactic validation applied to IDs before any lookup or store.
#[derive(Debug, Clone, Copy, Default)]
pub enum IdRule {
  /// Parseable as a non-negative integer.
  #[default]
  NonNegativeInteger,
  /// Caller-supplied predicate.
  Custom(fn(&str) -> bool),
}

impl IdRule {
  pub fn is_valid(&self, id: &str) -> bool {
    self.canonical(id).is_some()
  }

  /// The single spelling every tier keys `id` under, or `None` if it is invalid.
  ///
  /// Integer IDs are re-formatted, so "05" and "+5" both become "5". Custom rules keep the
  /// ID as given.
  pub fn canonical(&self, id: &str) -> Option<String> {
    match self {
      IdRule::NonNegativeInteger => id.parse::<u64>().ok().map(|n| n.to_string()),
      IdRule::Custom(check) => check(id).then(|| id.to_string()),
    }
  }
}

/// Result of looking up a set of IDs against one cache tier.
///
/// Every valid requested ID ends up, in canonical form, in exactly one of `records` (by key)
/// or `want_ids`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheSet<T> {
  /// Records found, in request order
  pub records: Vec<T>,
  /// IDs still wanted from the next tier, in request order
  pub want_ids: Vec<String>,
}

impl<T> Default for CacheSet<T> {
  fn default() -> Self {
    Self {
      records: Vec::new(),
      want_ids: Vec::new(),
    }
  }
}

impl<T> CacheSet<T> {
  /// Split `ids` into hits and misses using `lookup`.
  ///
  /// Invalid IDs are dropped without calling `lookup`. Every other ID is canonicalized
  /// first, so `lookup` and `want_ids` only ever see canonical IDs and spellings of the
  /// same ID are considered once.
  pub fn split<I, S, F>(ids: I, rule: IdRule, mut lookup: F) -> Self
  where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
    F: FnMut(&str) -> Option<T>,
  {
    let mut set = Self::default();
    let mut seen = HashSet::new();

    for id in ids {
      let Some(id) = rule.canonical(id.as_ref()) else {
        continue;
      };
      if !seen.insert(id.clone()) {
        continue;
      }
      match lookup(&id) {
        Some(record) => set.records.push(record),
        None => set.want_ids.push(id),
      }
    }

    set
  }
}

/// Valid, de-duplicated IDs from `ids` in canonical form and original order.
pub fn valid_ids<I, S>(ids: I, rule: IdRule) -> Vec<String>
where
  I: IntoIterator<Item = S>,
  S: AsRef<str>,
{
  let mut seen = HashSet::new();
  ids
    .into_iter()
    .filter_map(|id| rule.canonical(id.as_ref()))
    .filter(|id| seen.insert(id.clone()))
    .collect()
}
