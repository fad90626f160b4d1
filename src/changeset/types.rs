//! Change-log records reported by the remote store.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of mutation recorded in the change log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChangeAction {
  Insert,
  Update,
  Delete,
}

impl fmt::Display for ChangeAction {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      ChangeAction::Insert => "Insert",
      ChangeAction::Update => "Update",
      ChangeAction::Delete => "Delete",
    };
    f.write_str(name)
  }
}

/// `count` mutations of kind `action` to `data_id` in `table_name`, visible up to
/// watermark `sequence`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ChangeEntry {
  pub table_name: String,
  pub action: ChangeAction,
  #[serde(rename = "DataID")]
  pub data_id: String,
  pub count: u32,
  /// Zero for locally registered changes, which have no sequence yet
  #[serde(default)]
  pub sequence: i64,
}

impl ChangeEntry {
  pub fn new(
    table_name: impl Into<String>,
    action: ChangeAction,
    data_id: impl Into<String>,
    count: u32,
    sequence: i64,
  ) -> Self {
    Self {
      table_name: table_name.into(),
      action,
      data_id: data_id.into(),
      count,
      sequence,
    }
  }

  /// A single local mutation awaiting its echo from the change log.
  pub fn local(table_name: impl Into<String>, action: ChangeAction, data_id: impl Into<String>) -> Self {
    Self::new(table_name, action, data_id, 1, 0)
  }

  pub fn key(&self) -> ChangeKey {
    ChangeKey {
      table_name: self.table_name.clone(),
      action: self.action,
      data_id: self.data_id.clone(),
    }
  }
}

/// Composite key correlating local and remote change records.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChangeKey {
  pub table_name: String,
  pub action: ChangeAction,
  pub data_id: String,
}

impl ChangeKey {
  pub fn new(table_name: impl Into<String>, action: ChangeAction, data_id: impl Into<String>) -> Self {
    Self {
      table_name: table_name.into(),
      action,
      data_id: data_id.into(),
    }
  }
}

impl fmt::Display for ChangeKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}:{}:{}", self.table_name, self.action, self.data_id)
  }
}
