//! SQLite-backed persistent cache tier.
//!
//! One table per entity type, created on first write:
//!
//! ```sql
//! CREATE TABLE "entity_<Name>" (ID INTEGER PRIMARY KEY, CONTENT TEXT NOT NULL)
//! ```
//!
//! The database file is deleted and recreated on open, so the tier only lives as long as
//! the process that owns it.

use rusqlite::{params, params_from_iter, Connection, Transaction};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use super::provider::CacheProvider;
use super::record::parse_id;
use super::traits::{valid_ids, CacheSet, IdRule};
use crate::error::{CacheError, CacheResult, ParseError};

/// Stays well below SQLite's bound-parameter limit.
const MAX_IDS_PER_QUERY: usize = 500;

/// Receives read-path faults that were downgraded to misses.
pub type FaultHook = Arc<dyn Fn(&str, &CacheError) + Send + Sync>;

struct Inner {
  conn: Connection,
  /// Entity types whose table exists in this run
  tables: HashSet<String>,
}

/// Disk cache provider.
///
/// All operations go through one connection behind a mutex.
pub struct DiskCacheProvider {
  inner: Mutex<Inner>,
  path: PathBuf,
  rule: IdRule,
  on_fault: FaultHook,
}

impl DiskCacheProvider {
  /// Create a fresh cache database at `path`, discarding any previous one.
  pub fn open(path: impl AsRef<Path>) -> CacheResult<Self> {
    let path = path.as_ref().to_path_buf();

    // Ensure parent directory exists
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
      std::fs::create_dir_all(parent)?;
    }

    for stale in [path.clone(), journal_path(&path)] {
      match std::fs::remove_file(&stale) {
        Ok(()) => tracing::debug!(path = %stale.display(), "removed previous cache file"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
      }
    }

    let conn = Connection::open(&path)?;
    tracing::info!(path = %path.display(), "opened disk cache");

    Ok(Self {
      inner: Mutex::new(Inner {
        conn,
        tables: HashSet::new(),
      }),
      path,
      rule: IdRule::default(),
      on_fault: Arc::new(log_fault),
    })
  }

  /// Open a fresh cache database at the default location.
  pub fn open_default() -> CacheResult<Self> {
    Self::open(Self::default_path()?)
  }

  /// Get the default database path.
  pub fn default_path() -> CacheResult<PathBuf> {
    let cache_dir = dirs::cache_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".cache")))
      .ok_or_else(|| {
        std::io::Error::new(
          std::io::ErrorKind::NotFound,
          "could not determine cache directory",
        )
      })?;

    Ok(cache_dir.join("rostercache").join("cache.db"))
  }

  /// Validate IDs with `rule` instead of the default.
  ///
  /// The ID column stays an integer, so only IDs spelled exactly as an `i64` formats can be
  /// stored; any other ID the rule admits reads as a miss.
  pub fn with_rule(mut self, rule: IdRule) -> Self {
    self.rule = rule;
    self
  }

  /// Replace the default read-fault logger.
  pub fn with_fault_hook(mut self, hook: FaultHook) -> Self {
    self.on_fault = hook;
    self
  }

  pub fn path(&self) -> &Path {
    &self.path
  }

  fn lock(&self) -> CacheResult<MutexGuard<'_, Inner>> {
    self.inner.lock().map_err(|_| CacheError::LockPoisoned)
  }

  fn report(&self, entity: &str, error: &CacheError) {
    (self.on_fault)(entity, error);
  }

  /// Parse the disk key of a record; the ID column is an integer.
  fn record_key(&self, content: &str) -> Result<i64, ParseError> {
    let id = parse_id(content, self.rule)?;
    disk_key(&id).ok_or(ParseError::InvalidId(id))
  }

  fn try_select_all(&self, entity: &str) -> CacheResult<HashMap<String, String>> {
    let table = table_name(entity)?;
    let inner = self.lock()?;
    if !inner.tables.contains(entity) {
      return Ok(HashMap::new());
    }

    let mut stmt = inner
      .conn
      .prepare(&format!("SELECT ID, CONTENT FROM {table}"))?;
    let rows = stmt.query_map([], |row| {
      Ok((row.get::<_, i64>(0)?.to_string(), row.get::<_, String>(1)?))
    })?;

    let mut all = HashMap::new();
    for row in rows {
      let (id, content) = row?;
      all.insert(id, content);
    }
    Ok(all)
  }

  fn try_select_by_ids(&self, entity: &str, ids: &[String]) -> CacheResult<HashMap<i64, String>> {
    let table = table_name(entity)?;
    let inner = self.lock()?;
    if !inner.tables.contains(entity) {
      return Ok(HashMap::new());
    }

    let keys: Vec<i64> = ids.iter().filter_map(|id| disk_key(id)).collect();
    let mut found = HashMap::with_capacity(keys.len());

    for chunk in keys.chunks(MAX_IDS_PER_QUERY) {
      let placeholders = vec!["?"; chunk.len()].join(", ");
      let mut stmt = inner.conn.prepare(&format!(
        "SELECT ID, CONTENT FROM {table} WHERE ID IN ({placeholders})"
      ))?;
      let rows = stmt.query_map(params_from_iter(chunk.iter()), |row| {
        Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
      })?;
      for row in rows {
        let (id, content) = row?;
        found.insert(id, content);
      }
    }

    Ok(found)
  }

  /// Run one statement per record inside a single transaction.
  ///
  /// Every record is parsed before anything is written, and any failure rolls the whole
  /// batch back.
  fn write_records(
    &self,
    entity: &str,
    records: &[String],
    write: WriteKind,
  ) -> CacheResult<usize> {
    let table = table_name(entity)?;
    let rows = records
      .iter()
      .map(|content| Ok((self.record_key(content)?, content.as_str())))
      .collect::<CacheResult<Vec<_>>>()?;

    let mut guard = self.lock()?;
    let inner = &mut *guard;
    if write == WriteKind::Update && !inner.tables.contains(entity) {
      return Ok(0);
    }

    let tx = inner.conn.transaction()?;
    create_table(&tx, &table)?;
    let affected = {
      let mut stmt = tx.prepare(&write.statement(&table))?;
      let mut affected = 0;
      for (id, content) in &rows {
        affected += stmt.execute(params![id, content])?;
      }
      affected
    };
    tx.commit()?;

    inner.tables.insert(entity.to_string());
    tracing::debug!(entity, ?write, records = rows.len(), affected, "wrote disk cache records");
    Ok(affected)
  }
}

impl CacheProvider for DiskCacheProvider {
  fn select_all(&self, entity: &str) -> HashMap<String, String> {
    self.try_select_all(entity).unwrap_or_else(|e| {
      self.report(entity, &e);
      HashMap::new()
    })
  }

  fn select_by_ids(&self, entity: &str, ids: &[String]) -> CacheSet<String> {
    let wanted = valid_ids(ids, self.rule);
    let mut found = self.try_select_by_ids(entity, &wanted).unwrap_or_else(|e| {
      self.report(entity, &e);
      HashMap::new()
    });

    CacheSet::split(&wanted, self.rule, |id| {
      disk_key(id).and_then(|key| found.remove(&key))
    })
  }

  fn set(&self, entity: &str, records: &[String]) -> CacheResult<usize> {
    self.write_records(entity, records, WriteKind::Upsert)
  }

  fn insert(&self, entity: &str, records: &[String]) -> CacheResult<usize> {
    self.write_records(entity, records, WriteKind::InsertIfAbsent)
  }

  fn update(&self, entity: &str, records: &[String]) -> CacheResult<usize> {
    self.write_records(entity, records, WriteKind::Update)
  }

  fn delete(&self, entity: &str, ids: &[String]) -> CacheResult<usize> {
    let table = table_name(entity)?;
    let keys: Vec<i64> = valid_ids(ids, self.rule)
      .iter()
      .filter_map(|id| disk_key(id))
      .collect();

    let mut guard = self.lock()?;
    let inner = &mut *guard;
    if !inner.tables.contains(entity) || keys.is_empty() {
      return Ok(0);
    }

    let tx = inner.conn.transaction()?;
    let removed = {
      let mut stmt = tx.prepare(&format!("DELETE FROM {table} WHERE ID = ?1"))?;
      let mut removed = 0;
      for key in &keys {
        removed += stmt.execute(params![key])?;
      }
      removed
    };
    tx.commit()?;
    Ok(removed)
  }

  fn truncate(&self, entity: &str) -> CacheResult<usize> {
    let table = table_name(entity)?;
    let inner = self.lock()?;
    if !inner.tables.contains(entity) {
      return Ok(0);
    }
    Ok(inner.conn.execute(&format!("DELETE FROM {table}"), [])?)
  }

  fn id_rule(&self) -> IdRule {
    self.rule
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteKind {
  Upsert,
  InsertIfAbsent,
  Update,
}

impl WriteKind {
  fn statement(self, table: &str) -> String {
    match self {
      WriteKind::Upsert => format!("INSERT OR REPLACE INTO {table} (ID, CONTENT) VALUES (?1, ?2)"),
      WriteKind::InsertIfAbsent => {
        format!("INSERT OR IGNORE INTO {table} (ID, CONTENT) VALUES (?1, ?2)")
      }
      WriteKind::Update => format!("UPDATE {table} SET CONTENT = ?2 WHERE ID = ?1"),
    }
  }
}

fn create_table(tx: &Transaction<'_>, table: &str) -> rusqlite::Result<()> {
  tx.execute_batch(&format!(
    "CREATE TABLE IF NOT EXISTS {table} (ID INTEGER PRIMARY KEY, CONTENT TEXT NOT NULL);"
  ))
}

/// Quoted table name for an entity type. Only plain identifiers are accepted.
fn table_name(entity: &str) -> CacheResult<String> {
  let mut chars = entity.chars();
  let valid = chars
    .next()
    .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
    && chars.all(|c| c.is_ascii_alphanumeric() || c == '_');

  if valid {
    Ok(format!("\"entity_{entity}\""))
  } else {
    Err(CacheError::InvalidEntityName(entity.to_string()))
  }
}

/// Integer primary key for a canonical ID. Spellings that do not round-trip have no row.
fn disk_key(id: &str) -> Option<i64> {
  id.parse::<i64>().ok().filter(|key| key.to_string() == id)
}

fn journal_path(path: &Path) -> PathBuf {
  let mut name = path.as_os_str().to_owned();
  name.push("-journal");
  PathBuf::from(name)
}

fn log_fault(entity: &str, error: &CacheError) {
  tracing::warn!(entity, %error, "disk cache read failed, treating as miss");
}
