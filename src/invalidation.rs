//! Invalidation wiring between the change-set reconciler and the cache tiers.
//!
//! Caches subscribe to an [`InvalidationBus`] explicitly; whoever learns about a change
//! (a local mutation, or the background [`ChangePoller`]) publishes a [`ChangeEvent`] and
//! the subscribers are notified in registration order. The bus only holds listeners
//! weakly: a cache that is dropped stops receiving events and is pruned on the next publish.

use chrono::{DateTime, Utc};
use std::sync::{Arc, PoisonError, RwLock, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::changeset::{ChangeEntry, ChangeSetReconciler, ChangeSource};
use crate::error::ReconcileError;

/// Keys of one entity table that must be dropped from the caches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
  pub table: String,
  pub ids: Vec<String>,
}

impl ChangeEvent {
  pub fn new<I, S>(table: impl Into<String>, ids: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    Self {
      table: table.into(),
      ids: ids.into_iter().map(Into::into).collect(),
    }
  }

  /// One event per table, in first-seen order, with each ID listed once.
  pub fn group(entries: &[ChangeEntry]) -> Vec<ChangeEvent> {
    let mut events: Vec<ChangeEvent> = Vec::new();
    for entry in entries {
      let index = match events.iter().position(|e| e.table == entry.table_name) {
        Some(index) => index,
        None => {
          events.push(ChangeEvent::new(entry.table_name.clone(), Vec::<String>::new()));
          events.len() - 1
        }
      };
      let event = &mut events[index];
      if !event.ids.contains(&entry.data_id) {
        event.ids.push(entry.data_id.clone());
      }
    }
    events
  }
}

/// A cache tier that reacts to invalidation.
pub trait InvalidationListener: Send + Sync {
  /// Drop the event's keys. Must tolerate repeated and overlapping events.
  fn on_remove(&self, event: &ChangeEvent);

  /// Drop every entry of `table`.
  fn on_clear(&self, table: &str);
}

/// Fan-out of invalidation events to explicitly registered listeners.
#[derive(Default)]
pub struct InvalidationBus {
  listeners: RwLock<Vec<Weak<dyn InvalidationListener>>>,
}

impl InvalidationBus {
  pub fn new() -> Self {
    Self::default()
  }

  /// Register `listener` for as long as the caller keeps it alive.
  pub fn subscribe<L: InvalidationListener + 'static>(&self, listener: &Arc<L>) {
    let listener: Weak<dyn InvalidationListener> = Arc::<L>::downgrade(listener);
    self
      .listeners
      .write()
      .unwrap_or_else(PoisonError::into_inner)
      .push(listener);
  }

  /// Live listeners in registration order; dropped ones are pruned.
  fn snapshot(&self) -> Vec<Arc<dyn InvalidationListener>> {
    let mut listeners = self.listeners.write().unwrap_or_else(PoisonError::into_inner);
    listeners.retain(|listener| listener.strong_count() > 0);
    listeners.iter().filter_map(Weak::upgrade).collect()
  }

  pub fn publish(&self, event: &ChangeEvent) {
    if event.ids.is_empty() {
      return;
    }
    for listener in self.snapshot() {
      listener.on_remove(event);
    }
  }

  pub fn publish_clear(&self, table: &str) {
    for listener in self.snapshot() {
      listener.on_clear(table);
    }
  }

  pub fn listener_count(&self) -> usize {
    self.snapshot().len()
  }
}

/// Outcome of one poll.
#[derive(Debug, Clone)]
pub struct PollReport {
  pub polled_at: DateTime<Utc>,
  /// Externally caused changes that were invalidated
  pub external: Vec<ChangeEntry>,
  pub current_sequence: i64,
}

/// Periodically reconciles the change log and invalidates what other processes changed.
pub struct ChangePoller<S: ChangeSource> {
  reconciler: Arc<ChangeSetReconciler<S>>,
  bus: Arc<InvalidationBus>,
  interval: Duration,
  fetch_timeout: Duration,
}

impl<S: ChangeSource> ChangePoller<S> {
  pub fn new(
    reconciler: Arc<ChangeSetReconciler<S>>,
    bus: Arc<InvalidationBus>,
    interval: Duration,
    fetch_timeout: Duration,
  ) -> Self {
    Self {
      reconciler,
      bus,
      interval,
      fetch_timeout,
    }
  }

  /// Run one reconciliation pass and publish its result.
  pub async fn poll_once(&self) -> Result<PollReport, ReconcileError> {
    let external = tokio::time::timeout(self.fetch_timeout, self.reconciler.reconcile())
      .await
      .map_err(|_| ReconcileError::Timeout(self.fetch_timeout))??;

    for event in ChangeEvent::group(&external) {
      tracing::debug!(table = %event.table, ids = event.ids.len(), "invalidating external changes");
      self.bus.publish(&event);
    }

    Ok(PollReport {
      polled_at: Utc::now(),
      external,
      current_sequence: self.reconciler.current_sequence(),
    })
  }

  /// Poll on a fixed interval until the returned handle is shut down.
  pub fn spawn(self) -> PollerHandle {
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

    let task = tokio::spawn(async move {
      let mut ticker = tokio::time::interval(self.interval);
      ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
      tracing::info!(interval = ?self.interval, "change poller started");

      loop {
        tokio::select! {
          _ = ticker.tick() => {}
          _ = shutdown_rx.changed() => break,
        }

        match self.poll_once().await {
          Ok(report) if !report.external.is_empty() => tracing::info!(
            changes = report.external.len(),
            sequence = report.current_sequence,
            "invalidated externally changed entities"
          ),
          Ok(_) => {}
          Err(e) => tracing::warn!(error = %e, "change poll failed, retrying next tick"),
        }
      }

      tracing::info!("change poller stopped");
    });

    PollerHandle {
      shutdown: shutdown_tx,
      task,
    }
  }
}

/// Handle to a running [`ChangePoller`].
pub struct PollerHandle {
  shutdown: watch::Sender<bool>,
  task: JoinHandle<()>,
}

impl PollerHandle {
  /// Stop polling and wait for the in-flight pass, if any, to finish.
  pub async fn shutdown(self) {
    let _ = self.shutdown.send(true);
    if let Err(e) = self.task.await {
      tracing::warn!(error = %e, "change poller task failed");
    }
  }
}
