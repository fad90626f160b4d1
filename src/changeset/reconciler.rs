//! Self-caused change suppression.
//!
//! Every process sharing the remote store sees every mutation in the change log, including
//! its own. Mutations this process made are registered as pending right after they succeed
//! remotely; a reconciliation pass cancels the change log against that pending set so only
//! the part caused by someone else comes out the other end.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use super::source::ChangeSource;
use super::types::{ChangeEntry, ChangeKey};
use crate::error::ReconcileError;

#[derive(Debug, Default)]
struct State {
  /// Highest sequence already accounted for
  current_sequence: i64,
  /// Outstanding local counts per composite key, oldest first
  pending: HashMap<ChangeKey, VecDeque<u32>>,
}

impl State {
  /// Cancel `count` against the pending queue for `key`, returning what is left over.
  fn consume(&mut self, key: &ChangeKey, count: u32) -> u32 {
    let Some(queue) = self.pending.get_mut(key) else {
      return count;
    };

    let mut remaining = count;
    while remaining > 0 {
      match queue.front_mut() {
        None => break,
        Some(outstanding) if *outstanding > remaining => {
          *outstanding -= remaining;
          remaining = 0;
        }
        Some(outstanding) => {
          remaining -= *outstanding;
          queue.pop_front();
        }
      }
    }

    if queue.is_empty() {
      self.pending.remove(key);
    }
    remaining
  }

  fn apply(&mut self, since: i64, entries: Vec<ChangeEntry>) -> Vec<ChangeEntry> {
    let mut external = Vec::new();

    for entry in entries {
      if entry.sequence <= since {
        tracing::debug!(sequence = entry.sequence, since, "skipping change at or below watermark");
        continue;
      }
      self.current_sequence = self.current_sequence.max(entry.sequence);

      let remaining = self.consume(&entry.key(), entry.count);
      if remaining > 0 {
        external.push(ChangeEntry {
          count: remaining,
          ..entry
        });
      }
    }

    external
  }
}

/// Pulls the remote change log and filters out this process's own mutations.
///
/// `register_local_change` may be called from any thread while a pass is running: the
/// fetch happens without holding the state lock and the result is applied atomically.
/// Passes themselves are serialized.
pub struct ChangeSetReconciler<S> {
  source: S,
  state: Mutex<State>,
  pass: tokio::sync::Mutex<()>,
}

impl<S: ChangeSource> ChangeSetReconciler<S> {
  pub fn new(source: S) -> Self {
    Self {
      source,
      state: Mutex::new(State::default()),
      pass: tokio::sync::Mutex::new(()),
    }
  }

  pub fn source(&self) -> &S {
    &self.source
  }

  fn lock(&self) -> MutexGuard<'_, State> {
    self.state.lock().unwrap_or_else(PoisonError::into_inner)
  }

  /// Treat everything the remote store has recorded so far as already accounted for.
  pub async fn set_baseline(&self) -> Result<i64, ReconcileError> {
    let sequence = self
      .source
      .last_sequence()
      .await
      .map_err(ReconcileError::LastSequence)?;
    self.set_baseline_to(sequence);
    Ok(sequence)
  }

  /// Set the watermark explicitly, e.g. when resuming from a persisted value.
  pub fn set_baseline_to(&self, sequence: i64) {
    self.lock().current_sequence = sequence;
    tracing::info!(sequence, "change set baseline set");
  }

  pub fn current_sequence(&self) -> i64 {
    self.lock().current_sequence
  }

  /// Record mutations this process just completed against the remote store.
  ///
  /// Counts are summed per composite key within one call and queued behind any earlier
  /// registrations for the same key. Zero counts are ignored.
  pub fn register_local_change<I>(&self, entries: I)
  where
    I: IntoIterator<Item = ChangeEntry>,
  {
    let mut grouped: HashMap<ChangeKey, u32> = HashMap::new();
    for entry in entries.into_iter().filter(|e| e.count > 0) {
      let count = grouped.entry(entry.key()).or_insert(0);
      *count = count.saturating_add(entry.count);
    }

    let mut state = self.lock();
    for (key, count) in grouped {
      tracing::trace!(%key, count, "registered local change");
      state.pending.entry(key).or_default().push_back(count);
    }
  }

  /// Number of composite keys with outstanding local changes.
  pub fn pending_len(&self) -> usize {
    self.lock().pending.len()
  }

  /// Total outstanding local count for `key`.
  pub fn pending_for(&self, key: &ChangeKey) -> u32 {
    self
      .lock()
      .pending
      .get(key)
      .map(|queue| queue.iter().sum())
      .unwrap_or(0)
  }

  /// Fetch changes past the watermark and return the externally caused part.
  ///
  /// On failure nothing is changed and the pass can simply be retried.
  pub async fn reconcile(&self) -> Result<Vec<ChangeEntry>, ReconcileError> {
    let _pass = self.pass.lock().await;

    let since = self.current_sequence();
    let mut entries = self
      .source
      .change_set(since)
      .await
      .map_err(|source| ReconcileError::ChangeSet { since, source })?;

    if !entries.windows(2).all(|w| w[0].sequence <= w[1].sequence) {
      tracing::warn!(since, "change set arrived out of sequence order, sorting");
      entries.sort_by_key(|e| e.sequence);
    }

    let fetched = entries.len();
    let mut state = self.lock();
    let external = state.apply(since, entries);
    tracing::debug!(
      since,
      fetched,
      external = external.len(),
      current_sequence = state.current_sequence,
      pending = state.pending.len(),
      "reconciled change set"
    );

    Ok(external)
  }
}

#[cfg(test)]
pub(crate) mod tests {
  use super::*;
  use crate::changeset::{ChangeAction, JsonChangeLog};
  use crate::error::BoxError;
  use std::sync::atomic::{AtomicBool, Ordering};
  use std::sync::Arc;

  /// Change log whose fetches can be made to fail.
  #[derive(Default)]
  pub(crate) struct FlakySource {
    pub log: JsonChangeLog,
    pub failing: AtomicBool,
  }

  impl FlakySource {
    pub fn fail(&self, failing: bool) {
      self.failing.store(failing, Ordering::SeqCst);
    }
  }

  impl ChangeSource for FlakySource {
    async fn last_sequence(&self) -> Result<i64, BoxError> {
      if self.failing.load(Ordering::SeqCst) {
        return Err("remote unavailable".into());
      }
      self.log.last_sequence().await
    }

    async fn change_set(&self, since: i64) -> Result<Vec<ChangeEntry>, BoxError> {
      if self.failing.load(Ordering::SeqCst) {
        return Err("remote unavailable".into());
      }
      self.log.change_set(since).await
    }
  }

  fn entry(action: ChangeAction, id: &str, count: u32, sequence: i64) -> ChangeEntry {
    ChangeEntry::new("Student", action, id, count, sequence)
  }

  fn local(action: ChangeAction, id: &str, count: u32) -> ChangeEntry {
    ChangeEntry::new("Student", action, id, count, 0)
  }

  fn reconciler(entries: Vec<ChangeEntry>) -> ChangeSetReconciler<Arc<FlakySource>> {
    let source = FlakySource {
      log: JsonChangeLog::new(entries),
      ..Default::default()
    };
    ChangeSetReconciler::new(Arc::new(source))
  }

  #[tokio::test]
  async fn test_exact_match_is_suppressed() {
    let reconciler = reconciler(vec![entry(ChangeAction::Insert, "5", 1, 7)]);
    reconciler.register_local_change([local(ChangeAction::Insert, "5", 1)]);

    assert!(reconciler.reconcile().await.unwrap().is_empty());
    assert_eq!(reconciler.current_sequence(), 7);
    assert_eq!(reconciler.pending_len(), 0);
  }

  #[tokio::test]
  async fn test_partial_local_count_emits_remainder() {
    let reconciler = reconciler(vec![entry(ChangeAction::Update, "5", 5, 3)]);
    reconciler.register_local_change([local(ChangeAction::Update, "5", 3)]);

    let external = reconciler.reconcile().await.unwrap();
    assert_eq!(external, vec![entry(ChangeAction::Update, "5", 2, 3)]);
    assert_eq!(reconciler.pending_len(), 0);
  }

  #[tokio::test]
  async fn test_larger_local_count_stays_pending() {
    let reconciler = reconciler(vec![entry(ChangeAction::Update, "5", 2, 4)]);
    reconciler.register_local_change([local(ChangeAction::Update, "5", 3)]);

    assert!(reconciler.reconcile().await.unwrap().is_empty());
    let key = ChangeKey::new("Student", ChangeAction::Update, "5");
    assert_eq!(reconciler.pending_for(&key), 1);

    reconciler
      .source()
      .log
      .push(entry(ChangeAction::Update, "5", 1, 6));
    assert!(reconciler.reconcile().await.unwrap().is_empty());
    assert_eq!(reconciler.pending_for(&key), 0);
    assert_eq!(reconciler.current_sequence(), 6);
  }

  #[tokio::test]
  async fn test_unmatched_entry_passes_through() {
    let server = entry(ChangeAction::Delete, "8", 1, 2);
    let reconciler = reconciler(vec![server.clone()]);
    reconciler.register_local_change([local(ChangeAction::Update, "8", 1)]);

    assert_eq!(reconciler.reconcile().await.unwrap(), vec![server]);
    assert_eq!(reconciler.pending_len(), 1);
  }

  #[tokio::test]
  async fn test_counts_consumed_across_registrations() {
    let reconciler = reconciler(vec![entry(ChangeAction::Update, "1", 3, 9)]);
    reconciler.register_local_change([local(ChangeAction::Update, "1", 1)]);
    reconciler.register_local_change([local(ChangeAction::Update, "1", 1)]);

    let external = reconciler.reconcile().await.unwrap();
    assert_eq!(external, vec![entry(ChangeAction::Update, "1", 1, 9)]);
    assert_eq!(reconciler.pending_len(), 0);
  }

  #[tokio::test]
  async fn test_registration_groups_by_key() {
    let reconciler = reconciler(Vec::new());
    reconciler.register_local_change([
      local(ChangeAction::Update, "1", 1),
      local(ChangeAction::Update, "1", 1),
      local(ChangeAction::Insert, "1", 1),
      local(ChangeAction::Update, "2", 0),
    ]);

    assert_eq!(reconciler.pending_len(), 2);
    assert_eq!(
      reconciler.pending_for(&ChangeKey::new("Student", ChangeAction::Update, "1")),
      2
    );
  }

  #[tokio::test]
  async fn test_large_batch_is_grouped_into_one_registration_per_key() {
    let reconciler = reconciler(Vec::new());
    let batch: Vec<ChangeEntry> = (0..20_000)
      .map(|i| local(ChangeAction::Update, &(i % 2_000).to_string(), 1))
      .collect();
    reconciler.register_local_change(batch);

    assert_eq!(reconciler.pending_len(), 2_000);
    assert_eq!(
      reconciler.pending_for(&ChangeKey::new("Student", ChangeAction::Update, "1999")),
      10
    );

    // a single server entry per key must cancel the whole summed registration
    for id in 0..2_000 {
      reconciler
        .source()
        .log
        .push(entry(ChangeAction::Update, &id.to_string(), 10, id + 1));
    }
    assert!(reconciler.reconcile().await.unwrap().is_empty());
    assert_eq!(reconciler.pending_len(), 0);
  }

  #[tokio::test]
  async fn test_watermark_advances_past_suppressed_entries() {
    let reconciler = reconciler(vec![
      entry(ChangeAction::Insert, "1", 1, 4),
      entry(ChangeAction::Insert, "2", 1, 9),
    ]);
    reconciler.register_local_change([
      local(ChangeAction::Insert, "1", 1),
      local(ChangeAction::Insert, "2", 1),
    ]);

    assert!(reconciler.reconcile().await.unwrap().is_empty());
    assert_eq!(reconciler.current_sequence(), 9);
    assert!(reconciler.reconcile().await.unwrap().is_empty());
    assert_eq!(reconciler.current_sequence(), 9);
  }

  #[tokio::test]
  async fn test_watermark_is_monotonic_and_tracks_max() {
    let reconciler = reconciler(Vec::new());
    let mut previous = reconciler.current_sequence();
    let mut max_seen = 0;

    for (id, sequence) in [("1", 3), ("2", 5), ("3", 6), ("4", 10)] {
      reconciler
        .source()
        .log
        .push(entry(ChangeAction::Update, id, 1, sequence));
      max_seen = max_seen.max(sequence);

      reconciler.reconcile().await.unwrap();
      let current = reconciler.current_sequence();
      assert!(current >= previous);
      assert_eq!(current, max_seen);
      previous = current;
    }
  }

  #[tokio::test]
  async fn test_entries_sharing_a_sequence_are_all_processed() {
    let reconciler = reconciler(vec![
      entry(ChangeAction::Update, "1", 1, 4),
      entry(ChangeAction::Update, "2", 1, 4),
    ]);

    assert_eq!(reconciler.reconcile().await.unwrap().len(), 2);
    assert_eq!(reconciler.current_sequence(), 4);
  }

  #[tokio::test]
  async fn test_out_of_order_entries_are_sorted() {
    let reconciler = reconciler(vec![
      entry(ChangeAction::Update, "2", 1, 8),
      entry(ChangeAction::Update, "1", 1, 6),
    ]);

    let external = reconciler.reconcile().await.unwrap();
    let sequences: Vec<i64> = external.iter().map(|e| e.sequence).collect();
    assert_eq!(sequences, vec![6, 8]);
    assert_eq!(reconciler.current_sequence(), 8);
  }

  #[tokio::test]
  async fn test_failed_fetch_leaves_state_untouched() {
    let reconciler = reconciler(vec![entry(ChangeAction::Update, "1", 1, 4)]);
    reconciler.set_baseline_to(2);
    reconciler.register_local_change([local(ChangeAction::Update, "1", 1)]);
    reconciler.source().fail(true);

    let err = reconciler.reconcile().await.unwrap_err();
    assert!(matches!(err, ReconcileError::ChangeSet { since: 2, .. }));
    assert_eq!(reconciler.current_sequence(), 2);
    assert_eq!(reconciler.pending_len(), 1);
    assert!(reconciler.set_baseline().await.is_err());
    assert_eq!(reconciler.current_sequence(), 2);

    reconciler.source().fail(false);
    assert!(reconciler.reconcile().await.unwrap().is_empty());
    assert_eq!(reconciler.current_sequence(), 4);
  }

  #[tokio::test]
  async fn test_scenario_own_update_is_not_reported() {
    let reconciler = reconciler(vec![entry(ChangeAction::Insert, "42", 1, 10)]);
    assert_eq!(reconciler.set_baseline().await.unwrap(), 10);

    reconciler.register_local_change([local(ChangeAction::Update, "42", 1)]);
    reconciler
      .source()
      .log
      .push(entry(ChangeAction::Update, "42", 1, 11));

    assert!(reconciler.reconcile().await.unwrap().is_empty());
    assert_eq!(reconciler.current_sequence(), 11);
  }

  #[tokio::test]
  async fn test_scenario_concurrent_foreign_update_is_reported() {
    let reconciler = reconciler(vec![entry(ChangeAction::Insert, "42", 1, 10)]);
    reconciler.set_baseline().await.unwrap();

    reconciler.register_local_change([local(ChangeAction::Update, "42", 1)]);
    reconciler
      .source()
      .log
      .push(entry(ChangeAction::Update, "42", 2, 12));

    let external = reconciler.reconcile().await.unwrap();
    assert_eq!(external, vec![entry(ChangeAction::Update, "42", 1, 12)]);
    assert_eq!(reconciler.pending_len(), 0);
    assert_eq!(reconciler.current_sequence(), 12);
  }

  #[tokio::test]
  async fn test_concurrent_registration_is_not_lost() {
    let reconciler = Arc::new(reconciler(Vec::new()));

    let writers: Vec<_> = (0..8)
      .map(|i| {
        let reconciler = Arc::clone(&reconciler);
        std::thread::spawn(move || {
          for _ in 0..25 {
            reconciler.register_local_change([local(ChangeAction::Update, &i.to_string(), 1)]);
          }
        })
      })
      .collect();
    for writer in writers {
      writer.join().unwrap();
    }

    for i in 0..8 {
      reconciler
        .source()
        .log
        .push(entry(ChangeAction::Update, &i.to_string(), 25, i64::from(i) + 1));
    }
    assert!(reconciler.reconcile().await.unwrap().is_empty());
    assert_eq!(reconciler.pending_len(), 0);
  }
}
