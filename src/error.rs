//! Error types for the cache tiers and the change-set reconciler.

use thiserror::Error;

/// Boxed error returned by remote collaborators.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Result type for cache write operations.
pub type CacheResult<T> = Result<T, CacheError>;

/// Errors raised by the persistent cache tier.
#[derive(Debug, Error)]
pub enum CacheError {
  /// Error from the embedded SQLite store.
  #[error("database error: {0}")]
  Database(#[from] rusqlite::Error),

  /// IO error (cache file handling).
  #[error("IO error: {0}")]
  Io(#[from] std::io::Error),

  /// Serialization/deserialization error.
  #[error("serialization error: {0}")]
  Serialization(#[from] serde_json::Error),

  /// A record's ID could not be extracted.
  #[error(transparent)]
  Parse(#[from] ParseError),

  /// Entity type names become table names and must be plain identifiers.
  #[error("invalid entity name: {0:?}")]
  InvalidEntityName(String),

  #[error("cache lock poisoned")]
  LockPoisoned,
}

/// Failure to extract the canonical ID from serialized record content.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
  /// Content is not a JSON object, or carries more than one `ID` member.
  #[error("malformed record: {0}")]
  Malformed(String),

  #[error("record has no ID field")]
  MissingId,

  #[error("record ID is empty")]
  EmptyId,

  /// The ID is present but not syntactically valid.
  #[error("invalid record ID: {0:?}")]
  InvalidId(String),
}

/// Errors raised by a reconciliation pass. The reconciler state is untouched when any of
/// these is returned.
#[derive(Debug, Error)]
pub enum ReconcileError {
  #[error("failed to fetch last sequence")]
  LastSequence(#[source] BoxError),

  #[error("failed to fetch change set since sequence {since}")]
  ChangeSet {
    since: i64,
    #[source]
    source: BoxError,
  },

  #[error("change set fetch timed out after {0:?}")]
  Timeout(std::time::Duration),
}
