//! Local key-value store for settings and processing history.
//!
//! A single SQLite table of JSON values keyed by name. The dispatcher never
//! touches the store; callers load limits from it at startup and write them
//! back when the user changes them.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use std::str::FromStr;

use crate::error::{Error, Result};
use crate::limits::Limits;
use crate::model::WorkId;

const KEY_RPM: &str = "settings.rpm";
const KEY_MAX_CONCURRENT: &str = "settings.max_concurrent";
const KEY_COUPLED: &str = "settings.couple_concurrency";
const KEY_HISTORY: &str = "history";

/// History entries kept; older ones are dropped on append.
pub const HISTORY_LIMIT: usize = 200;

/// Asynchronous get/put store of JSON values.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<serde_json::Value>>;
    async fn put(&self, key: &str, value: serde_json::Value) -> Result<()>;
    async fn delete(&self, key: &str) -> Result<()>;
}

/// SQLite-backed [`KvStore`].
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (creating if missing) the database at `url` and bootstrap the schema.
    pub async fn connect(url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.bootstrap().await?;
        Ok(store)
    }

    /// Private in-memory database (for testing).
    pub async fn in_memory() -> Result<Self> {
        // One connection: every new in-memory connection is a fresh database.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;
        let store = Self { pool };
        store.bootstrap().await?;
        Ok(store)
    }

    async fn bootstrap(&self) -> Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS kv (
                key         TEXT PRIMARY KEY NOT NULL,
                value       TEXT NOT NULL,
                updated_at  TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Simple health check: run a SELECT 1.
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl KvStore for SqliteStore {
    async fn get(&self, key: &str) -> Result<Option<serde_json::Value>> {
        let row: Option<(String,)> = sqlx::query_as("SELECT value FROM kv WHERE key = ?1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some((raw,)) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    async fn put(&self, key: &str, value: serde_json::Value) -> Result<()> {
        sqlx::query(
            "INSERT INTO kv (key, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT (key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
        )
        .bind(key)
        .bind(serde_json::to_string(&value)?)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        sqlx::query("DELETE FROM kv WHERE key = ?1")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

/// Load persisted limits, falling back to [`Limits::default`] per field.
pub async fn load_limits(store: &dyn KvStore) -> Result<Limits> {
    let defaults = Limits::default();
    let rpm = get_u32(store, KEY_RPM).await?.unwrap_or(defaults.rpm);
    let coupled = match store.get(KEY_COUPLED).await? {
        Some(v) => v
            .as_bool()
            .ok_or_else(|| Error::Config(format!("{KEY_COUPLED} must be a boolean")))?,
        None => defaults.coupled,
    };
    let max_concurrent = if coupled {
        rpm
    } else {
        get_u32(store, KEY_MAX_CONCURRENT).await?.unwrap_or(rpm)
    };
    Ok(Limits {
        rpm,
        max_concurrent,
        coupled,
    })
}

pub async fn save_limits(store: &dyn KvStore, limits: &Limits) -> Result<()> {
    store.put(KEY_RPM, limits.rpm.into()).await?;
    store
        .put(KEY_MAX_CONCURRENT, limits.max_concurrent.into())
        .await?;
    store.put(KEY_COUPLED, limits.coupled.into()).await?;
    Ok(())
}

async fn get_u32(store: &dyn KvStore, key: &str) -> Result<Option<u32>> {
    match store.get(key).await? {
        Some(v) => v
            .as_u64()
            .and_then(|n| u32::try_from(n).ok())
            .map(Some)
            .ok_or_else(|| Error::Config(format!("{key} must be a non-negative integer"))),
        None => Ok(None),
    }
}

// ---------------------------------------------------------------------------
// History
// ---------------------------------------------------------------------------

/// A finished piece of work, kept for later review.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub id: WorkId,
    pub source: String,
    pub model: String,
    pub text: Option<String>,
    pub thinking: Option<String>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Append an entry, keeping the newest [`HISTORY_LIMIT`].
pub async fn append_history(store: &dyn KvStore, entry: HistoryEntry) -> Result<()> {
    let mut entries = read_history(store).await?;
    entries.push(entry);
    if entries.len() > HISTORY_LIMIT {
        let excess = entries.len() - HISTORY_LIMIT;
        entries.drain(..excess);
    }
    store
        .put(KEY_HISTORY, serde_json::to_value(&entries)?)
        .await
}

/// Most recent entries first.
pub async fn load_history(store: &dyn KvStore, limit: usize) -> Result<Vec<HistoryEntry>> {
    let mut entries = read_history(store).await?;
    entries.reverse();
    entries.truncate(limit);
    Ok(entries)
}

async fn read_history(store: &dyn KvStore) -> Result<Vec<HistoryEntry>> {
    match store.get(KEY_HISTORY).await? {
        Some(v) => Ok(serde_json::from_value(v)?),
        None => Ok(Vec::new()),
    }
}
