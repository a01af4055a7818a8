//! SQLite-backed shared rate-limit store.
//!
//! Every engine process pointing at the same database file shares these
//! counters. Each check is a single write transaction: prune, count, insert.

use std::time::Duration;

use chrono::Utc;
use gantry_core::repository::rate_limit::{RateLimitDecision, RateLimitStore};
use gantry_types::error::RepositoryError;

use super::pool::DatabasePool;

#[derive(Debug, Clone)]
pub struct SqliteRateLimitStore {
    pool: DatabasePool,
}

impl SqliteRateLimitStore {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

fn db_err(e: sqlx::Error) -> RepositoryError {
    match e {
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => RepositoryError::Connection,
        other => RepositoryError::Query(other.to_string()),
    }
}

impl RateLimitStore for SqliteRateLimitStore {
    async fn increment_and_check(
        &self,
        key: &str,
        window: Duration,
        limit: u32,
    ) -> Result<RateLimitDecision, RepositoryError> {
        let now_ms = Utc::now().timestamp_millis();
        let window_ms = i64::try_from(window.as_millis()).unwrap_or(i64::MAX);
        let cutoff = now_ms.saturating_sub(window_ms);

        let mut tx = self.pool.writer.begin().await.map_err(db_err)?;

        // The prune is the first statement so the write lock is held before counting.
        sqlx::query("DELETE FROM rate_limit_hits WHERE key = ? AND hit_at_ms <= ?")
            .bind(key)
            .bind(cutoff)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM rate_limit_hits WHERE key = ?")
            .bind(key)
            .fetch_one(&mut *tx)
            .await
            .map_err(db_err)?;
        let count = u64::try_from(count).unwrap_or_default();

        if count >= u64::from(limit) {
            tx.commit().await.map_err(db_err)?;
            tracing::debug!(key, count, limit, "shared rate limit reached");
            return Ok(RateLimitDecision {
                allowed: false,
                current_count: count,
            });
        }

        sqlx::query("INSERT INTO rate_limit_hits (key, hit_at_ms) VALUES (?, ?)")
            .bind(key)
            .bind(now_ms)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        tx.commit().await.map_err(db_err)?;

        Ok(RateLimitDecision {
            allowed: true,
            current_count: count + 1,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    async fn test_store() -> (SqliteRateLimitStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let pool = DatabasePool::open_in(dir.path()).await.unwrap();
        (SqliteRateLimitStore::new(pool), dir)
    }

    #[tokio::test]
    async fn test_admits_up_to_limit() {
        let (store, _dir) = test_store().await;
        let window = Duration::from_secs(60);

        for expected in 1..=3 {
            let decision = store.increment_and_check("llm", window, 3).await.unwrap();
            assert!(decision.allowed);
            assert_eq!(decision.current_count, expected);
        }
        let rejected = store.increment_and_check("llm", window, 3).await.unwrap();
        assert!(!rejected.allowed);
        assert_eq!(rejected.current_count, 3);

        let other = store.increment_and_check("shell", window, 3).await.unwrap();
        assert!(other.allowed, "keys are counted independently");
    }

    #[tokio::test]
    async fn test_window_expiry_frees_slots() {
        let (store, _dir) = test_store().await;
        let window = Duration::from_millis(50);

        assert!(store.increment_and_check("llm", window, 1).await.unwrap().allowed);
        assert!(!store.increment_and_check("llm", window, 1).await.unwrap().allowed);
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(store.increment_and_check("llm", window, 1).await.unwrap().allowed);
    }

    #[tokio::test]
    async fn test_concurrent_checks_never_overadmit() {
        let (store, _dir) = test_store().await;
        let store = Arc::new(store);
        let mut handles = Vec::new();
        for _ in 0..20 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .increment_and_check("llm", Duration::from_secs(60), 5)
                    .await
                    .unwrap()
                    .allowed
            }));
        }
        let mut admitted = 0;
        for handle in handles {
            if handle.await.unwrap() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 5);
    }
}
