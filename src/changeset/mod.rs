//! Remote change-log model and reconciliation against local mutations.

mod log;
pub(crate) mod reconciler;
mod source;
mod types;

pub use log::{read_entries, JsonChangeLog};
pub use reconciler::ChangeSetReconciler;
pub use source::ChangeSource;
pub use types::{ChangeAction, ChangeEntry, ChangeKey};
