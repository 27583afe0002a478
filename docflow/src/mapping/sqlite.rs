//! SQLite-backed mapping cache.

use super::{Fingerprint, MappingCache, MappingCacheEntry};
use crate::errors::CacheError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::fmt;
use std::path::Path;
use std::sync::Arc;

/// Persistent cache in a `mapping_cache` table.
#[derive(Clone)]
pub struct SqliteMappingCache {
    conn: Arc<Mutex<Connection>>,
}

impl fmt::Debug for SqliteMappingCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SqliteMappingCache").finish_non_exhaustive()
    }
}

fn unavailable(err: impl fmt::Display) -> CacheError {
    CacheError::Unavailable(err.to_string())
}

impl SqliteMappingCache {
    /// Opens (and if needed creates) the cache database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, CacheError> {
        let conn = Connection::open(path).map_err(unavailable)?;
        Self::from_connection(conn)
    }

    /// Creates an in-memory database, mostly for tests.
    pub fn in_memory() -> Result<Self, CacheError> {
        let conn = Connection::open_in_memory().map_err(unavailable)?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self, CacheError> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS mapping_cache (
                hash_key TEXT PRIMARY KEY,
                sql_code TEXT NOT NULL,
                created_at TEXT NOT NULL
            )",
            [],
        )
        .map_err(unavailable)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, CacheError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, CacheError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || f(&conn.lock()))
            .await
            .map_err(unavailable)?
    }
}

#[async_trait]
impl MappingCache for SqliteMappingCache {
    async fn lookup(&self, fingerprint: &Fingerprint) -> Result<Option<MappingCacheEntry>, CacheError> {
        let key = fingerprint.clone();
        self.with_conn(move |conn| {
            let row = conn
                .query_row(
                    "SELECT sql_code, created_at FROM mapping_cache WHERE hash_key = ?1",
                    params![key.as_str()],
                    |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
                )
                .optional()
                .map_err(unavailable)?;

            row.map(|(mapping, created_at)| {
                let created_at = DateTime::parse_from_rfc3339(&created_at)
                    .map_err(|err| CacheError::Corrupt {
                        fingerprint: key.to_string(),
                        reason: err.to_string(),
                    })?
                    .with_timezone(&Utc);
                Ok(MappingCacheEntry {
                    fingerprint: key.clone(),
                    mapping,
                    created_at,
                })
            })
            .transpose()
        })
        .await
    }

    async fn store(&self, entry: MappingCacheEntry) -> Result<(), CacheError> {
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO mapping_cache (hash_key, sql_code, created_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(hash_key) DO UPDATE SET
                    sql_code = excluded.sql_code,
                    created_at = excluded.created_at",
                params![
                    entry.fingerprint.as_str(),
                    entry.mapping,
                    entry.created_at.to_rfc3339()
                ],
            )
            .map_err(unavailable)?;
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_sqlite_roundtrip_and_upsert() {
        let cache = SqliteMappingCache::in_memory().unwrap();
        let fp = Fingerprint::compute(1, &["name", "amount"]);

        assert!(cache.lookup(&fp).await.unwrap().is_none());

        cache.store(MappingCacheEntry::new(fp.clone(), "v1")).await.unwrap();
        cache.store(MappingCacheEntry::new(fp.clone(), "v2")).await.unwrap();

        let hit = cache.lookup(&fp).await.unwrap().unwrap();
        assert_eq!(hit.mapping, "v2");
        assert_eq!(hit.fingerprint, fp);
    }

    #[tokio::test]
    async fn test_sqlite_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.db");
        let fp = Fingerprint::compute(3, &["a"]);

        {
            let cache = SqliteMappingCache::open(&path).unwrap();
            cache.store(MappingCacheEntry::new(fp.clone(), "SELECT a AS x FROM df")).await.unwrap();
        }

        let reopened = SqliteMappingCache::open(&path).unwrap();
        let hit = reopened.lookup(&fp).await.unwrap().unwrap();
        assert_eq!(hit.mapping, "SELECT a AS x FROM df");
    }

    #[tokio::test]
    async fn test_corrupt_timestamp_is_reported() {
        let cache = SqliteMappingCache::in_memory().unwrap();
        let fp = Fingerprint::compute(1, &["z"]);
        cache
            .conn
            .lock()
            .execute(
                "INSERT INTO mapping_cache VALUES (?1, 'SELECT 1', 'yesterday')",
                params![fp.as_str()],
            )
            .unwrap();

        let result = cache.lookup(&fp).await;
        assert!(matches!(result, Err(CacheError::Corrupt { .. })));
    }
}
