use std::collections::HashMap;
use std::path::Path;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{FromRow, SqlitePool};

use crate::{Digest, Fingerprint, StoreError};

/// One action cache record: the digest of a process request and the digest
/// of its serialized result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionEntry {
  pub action: Digest,
  pub result: Digest,
  pub stored_at: DateTime<Utc>,
}

/// Persistent index from process request digests to result digests.
///
/// The result bytes themselves live in the content store.
#[async_trait]
pub trait ActionCache: Send + Sync {
  async fn get(&self, action: Digest) -> Result<Option<ActionEntry>, StoreError>;

  async fn put(&self, action: Digest, result: Digest) -> Result<(), StoreError>;

  async fn remove(&self, action: Digest) -> Result<bool, StoreError>;

  async fn entries(&self) -> Result<Vec<ActionEntry>, StoreError>;
}

/// SQLite-backed action cache.
pub struct SqliteActionCache {
  pool: SqlitePool,
}

#[derive(FromRow)]
struct ActionRow {
  action_hash: String,
  action_size: i64,
  result_hash: String,
  result_size: i64,
  stored_at: DateTime<Utc>,
}

impl TryFrom<ActionRow> for ActionEntry {
  type Error = StoreError;

  fn try_from(row: ActionRow) -> Result<Self, Self::Error> {
    Ok(Self {
      action: Digest::new(Fingerprint::from_hex(&row.action_hash)?, row.action_size as u64),
      result: Digest::new(Fingerprint::from_hex(&row.result_hash)?, row.result_size as u64),
      stored_at: row.stored_at,
    })
  }
}

impl SqliteActionCache {
  /// Create an action cache over an existing pool.
  pub fn new(pool: SqlitePool) -> Self {
    Self { pool }
  }

  /// Open (creating if needed) the database at `path` and run migrations.
  pub async fn open(path: &Path) -> Result<Self, StoreError> {
    if let Some(parent) = path.parent() {
      tokio::fs::create_dir_all(parent).await?;
    }
    let options = SqliteConnectOptions::new()
      .filename(path)
      .create_if_missing(true);
    let pool = SqlitePoolOptions::new()
      .max_connections(4)
      .connect_with(options)
      .await?;
    let cache = Self::new(pool);
    cache.migrate().await?;
    Ok(cache)
  }

  /// Run database migrations.
  pub async fn migrate(&self) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("./migrations").run(&self.pool).await
  }
}

#[async_trait]
impl ActionCache for SqliteActionCache {
  async fn get(&self, action: Digest) -> Result<Option<ActionEntry>, StoreError> {
    let row: Option<ActionRow> = sqlx::query_as(
      r#"
      SELECT action_hash, action_size, result_hash, result_size, stored_at
      FROM action_cache
      WHERE action_hash = ? AND action_size = ?
      "#,
    )
    .bind(action.hash.to_hex())
    .bind(action.size_bytes as i64)
    .fetch_optional(&self.pool)
    .await?;

    row.map(ActionEntry::try_from).transpose()
  }

  async fn put(&self, action: Digest, result: Digest) -> Result<(), StoreError> {
    sqlx::query(
      r#"
      INSERT INTO action_cache (action_hash, action_size, result_hash, result_size, stored_at)
      VALUES (?, ?, ?, ?, ?)
      ON CONFLICT (action_hash) DO UPDATE SET
        action_size = excluded.action_size,
        result_hash = excluded.result_hash,
        result_size = excluded.result_size,
        stored_at = excluded.stored_at
      "#,
    )
    .bind(action.hash.to_hex())
    .bind(action.size_bytes as i64)
    .bind(result.hash.to_hex())
    .bind(result.size_bytes as i64)
    .bind(Utc::now())
    .execute(&self.pool)
    .await?;

    Ok(())
  }

  async fn remove(&self, action: Digest) -> Result<bool, StoreError> {
    let done = sqlx::query("DELETE FROM action_cache WHERE action_hash = ?")
      .bind(action.hash.to_hex())
      .execute(&self.pool)
      .await?;
    Ok(done.rows_affected() > 0)
  }

  async fn entries(&self) -> Result<Vec<ActionEntry>, StoreError> {
    let rows: Vec<ActionRow> = sqlx::query_as(
      r#"
      SELECT action_hash, action_size, result_hash, result_size, stored_at
      FROM action_cache
      ORDER BY stored_at DESC
      "#,
    )
    .fetch_all(&self.pool)
    .await?;

    rows.into_iter().map(ActionEntry::try_from).collect()
  }
}

/// In-memory action cache.
#[derive(Default)]
pub struct MemoryActionCache {
  entries: RwLock<HashMap<Digest, ActionEntry>>,
}

impl MemoryActionCache {
  pub fn new() -> Self {
    Self::default()
  }
}

#[async_trait]
impl ActionCache for MemoryActionCache {
  async fn get(&self, action: Digest) -> Result<Option<ActionEntry>, StoreError> {
    let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
    Ok(entries.get(&action).cloned())
  }

  async fn put(&self, action: Digest, result: Digest) -> Result<(), StoreError> {
    let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
    entries.insert(
      action,
      ActionEntry {
        action,
        result,
        stored_at: Utc::now(),
      },
    );
    Ok(())
  }

  async fn remove(&self, action: Digest) -> Result<bool, StoreError> {
    let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
    Ok(entries.remove(&action).is_some())
  }

  async fn entries(&self) -> Result<Vec<ActionEntry>, StoreError> {
    let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
    let mut all: Vec<ActionEntry> = entries.values().cloned().collect();
    all.sort_by(|a, b| b.stored_at.cmp(&a.stored_at));
    Ok(all)
  }
}
