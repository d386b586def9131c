//! Named locks backed by the `engine_locks` table.
//!
//! A lock row carries an expiry so a holder that crashed without releasing
//! cannot wedge the key forever: expired rows are cleared before every
//! acquisition attempt.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{Duration, Utc};
use tracing::debug;

use tracklink_core::engine::{LockHandle, NamedLock};

use crate::backend::{rand_hex, ts_to_sql};
use crate::DuckDbBackend;

#[async_trait]
impl NamedLock for DuckDbBackend {
    async fn try_acquire(&self, key: &str) -> Result<Option<LockHandle>> {
        let now = Utc::now();
        let expires_at = now + Duration::seconds(self.settings.lock_ttl_seconds);
        let holder = rand_hex(16);

        let conn = self.conn.lock().await;
        // Separate statements: DuckDB rejects delete + re-insert of one key
        // inside a single transaction.
        conn.execute(
            "DELETE FROM engine_locks WHERE lock_key = ?1 AND expires_at <= CAST(?2 AS TIMESTAMP)",
            duckdb::params![key, ts_to_sql(now)],
        )?;
        let inserted = conn.execute(
            "INSERT INTO engine_locks (lock_key, holder, acquired_at, expires_at) \
             VALUES (?1, ?2, ?3, ?4) ON CONFLICT (lock_key) DO NOTHING",
            duckdb::params![key, holder, ts_to_sql(now), ts_to_sql(expires_at)],
        )?;

        if inserted == 1 {
            debug!(key, "Named lock acquired");
            Ok(Some(LockHandle {
                key: key.to_string(),
                holder,
            }))
        } else {
            debug!(key, "Named lock busy");
            Ok(None)
        }
    }

    async fn release(&self, handle: LockHandle) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "DELETE FROM engine_locks WHERE lock_key = ?1 AND holder = ?2",
            duckdb::params![handle.key, handle.holder],
        )?;
        debug!(key = %handle.key, "Named lock released");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn second_acquire_is_refused_until_release() {
        let db = DuckDbBackend::open_in_memory().unwrap();
        let first = db.try_acquire("identity_k").await.unwrap().unwrap();
        assert!(db.try_acquire("identity_k").await.unwrap().is_none());
        assert!(db.try_acquire("identity_other").await.unwrap().is_some());

        db.release(first).await.unwrap();
        assert!(db.try_acquire("identity_k").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn expired_lock_can_be_taken_over() {
        let db = DuckDbBackend::open_in_memory().unwrap();
        {
            let conn = db.conn_for_test().await;
            conn.execute(
                "INSERT INTO engine_locks VALUES ('identity_k', 'crashed', \
                 TIMESTAMP '2020-01-01 00:00:00', TIMESTAMP '2020-01-01 00:01:00')",
                [],
            )
            .unwrap();
        }
        let handle = db.try_acquire("identity_k").await.unwrap();
        assert!(handle.is_some_and(|h| h.holder != "crashed"));
    }

    #[tokio::test]
    async fn stale_release_does_not_drop_a_new_holder() {
        let db = DuckDbBackend::open_in_memory().unwrap();
        let current = db.try_acquire("identity_k").await.unwrap().unwrap();
        let stale = LockHandle {
            key: current.key.clone(),
            holder: "someone-else".to_string(),
        };
        db.release(stale).await.unwrap();
        assert!(db.try_acquire("identity_k").await.unwrap().is_none());
    }
}
