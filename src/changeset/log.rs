//! File-backed change log, used for offline replay.

use color_eyre::{eyre::eyre, Result};
use std::path::Path;
use std::sync::{Mutex, PoisonError};

use super::source::ChangeSource;
use super::types::ChangeEntry;
use crate::error::BoxError;

/// A change log held in memory, optionally loaded from a JSON array of entries.
#[derive(Debug, Default)]
pub struct JsonChangeLog {
  entries: Mutex<Vec<ChangeEntry>>,
}

impl JsonChangeLog {
  pub fn new(entries: Vec<ChangeEntry>) -> Self {
    Self {
      entries: Mutex::new(entries),
    }
  }

  /// Load entries from a JSON file.
  pub fn load(path: &Path) -> Result<Self> {
    let entries = read_entries(path)?;
    tracing::debug!(path = %path.display(), entries = entries.len(), "loaded change log");
    Ok(Self::new(entries))
  }

  /// Append an entry, as the remote store would after a mutation.
  pub fn push(&self, entry: ChangeEntry) {
    self
      .entries
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .push(entry);
  }

  fn snapshot(&self) -> Vec<ChangeEntry> {
    self
      .entries
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .clone()
  }
}

/// Read a JSON array of change entries.
pub fn read_entries(path: &Path) -> Result<Vec<ChangeEntry>> {
  let contents = std::fs::read_to_string(path)
    .map_err(|e| eyre!("Failed to read change log {}: {}", path.display(), e))?;

  serde_json::from_str(&contents)
    .map_err(|e| eyre!("Failed to parse change log {}: {}", path.display(), e))
}

impl ChangeSource for JsonChangeLog {
  async fn last_sequence(&self) -> Result<i64, BoxError> {
    Ok(self.snapshot().iter().map(|e| e.sequence).max().unwrap_or(0))
  }

  async fn change_set(&self, since: i64) -> Result<Vec<ChangeEntry>, BoxError> {
    Ok(
      self
        .snapshot()
        .into_iter()
        .filter(|e| e.sequence > since)
        .collect(),
    )
  }
}
