//! Remote change-log collaborator.

use std::future::Future;
use std::sync::Arc;

use super::types::ChangeEntry;
use crate::error::BoxError;

/// Access to the remote store's change history.
///
/// Implementors are usually a thin wrapper around the remote RPC client; `async fn` in the
/// impl is fine.
pub trait ChangeSource: Send + Sync + 'static {
  /// The latest sequence number the remote store has assigned.
  fn last_sequence(&self) -> impl Future<Output = Result<i64, BoxError>> + Send;

  /// Every change with `sequence > since`, in the order the store reports them.
  fn change_set(&self, since: i64) -> impl Future<Output = Result<Vec<ChangeEntry>, BoxError>> + Send;
}

impl<S: ChangeSource> ChangeSource for Arc<S> {
  fn last_sequence(&self) -> impl Future<Output = Result<i64, BoxError>> + Send {
    S::last_sequence(self)
  }

  fn change_set(&self, since: i64) -> impl Future<Output = Result<Vec<ChangeEntry>, BoxError>> + Send {
    S::change_set(self, since)
  }
}
