//! Client-side caching and change reconciliation for a remote school-records store.
//!
//! Reads go memory → disk → remote. Writes made by this process are registered with the
//! [`ChangeSetReconciler`](changeset::ChangeSetReconciler) so that their echo in the remote
//! change log does not invalidate the caches again, while changes made by other processes
//! are picked up by the [`ChangePoller`](invalidation::ChangePoller).

pub mod cache;
pub mod changeset;
pub mod config;
pub mod context;
pub mod error;
pub mod invalidation;
pub mod logging;

pub use context::CacheContext;
pub use error::{CacheError, ParseError, ReconcileError};
