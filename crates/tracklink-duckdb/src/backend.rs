use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use duckdb::Connection;
use tokio::sync::Mutex;
use tracing::info;

use tracklink_core::config::EngineSettings;

use crate::schema::{init_sql, INITIAL_MIGRATION_ID, MIGRATIONS_TABLE_SQL};

/// Generate a cryptographically random hex string of `n` bytes (2n hex chars).
pub(crate) fn rand_hex(n: usize) -> String {
    use rand::RngCore;
    let mut buf = vec![0u8; n];
    rand::thread_rng().fill_bytes(&mut buf);
    hex::encode(buf)
}

const TS_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.f";

/// Format a UTC timestamp the way DuckDB parses `TIMESTAMP` literals.
pub(crate) fn ts_to_sql(ts: DateTime<Utc>) -> String {
    ts.format(TS_FORMAT).to_string()
}

/// Parse a `CAST(ts AS VARCHAR)` value back into UTC.
pub(crate) fn ts_from_sql(raw: &str) -> Result<DateTime<Utc>> {
    let naive = NaiveDateTime::parse_from_str(raw.trim(), TS_FORMAT)
        .with_context(|| format!("invalid timestamp from DuckDB: {raw}"))?;
    Ok(naive.and_utc())
}

pub(crate) fn date_from_sql(raw: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
        .with_context(|| format!("invalid date from DuckDB: {raw}"))
}

/// DuckDB-backed storage for the identity and attribution engine.
///
/// DuckDB is single-writer, so the one connection sits behind an
/// `Arc<Mutex<_>>`. Every public operation locks it once and runs the
/// synchronous helpers in this crate against the connection or an open
/// transaction; helpers never lock it again.
///
/// Memory and thread limits are enforced by [`init_sql`] at open time.
pub struct DuckDbBackend {
    pub(crate) conn: Arc<Mutex<Connection>>,
    pub(crate) settings: EngineSettings,
}

impl DuckDbBackend {
    /// Open (or create) a DuckDB database file at `path`.
    ///
    /// `memory_limit` is a DuckDB size string such as `"1GB"` or `"512MB"`.
    /// Engine settings start at their defaults; see [`Self::with_settings`].
    pub fn open(path: &str, memory_limit: &str) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::init_sync(&conn, memory_limit)?;
        info!(
            path,
            memory_limit, "DuckDB opened with threads=2"
        );
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            settings: EngineSettings::default(),
        })
    }

    /// Open an **in-memory** DuckDB database.
    ///
    /// Intended for tests; data is discarded when the struct is dropped.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init_sync(&conn, "1GB")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            settings: EngineSettings::default(),
        })
    }

    pub fn with_settings(mut self, settings: EngineSettings) -> Self {
        self.settings = settings.clamped();
        self
    }

    fn init_sync(conn: &Connection, memory_limit: &str) -> Result<()> {
        conn.execute_batch(MIGRATIONS_TABLE_SQL)?;
        conn.execute_batch(&init_sql(memory_limit))?;
        conn.execute(
            "INSERT INTO _migrations (id) VALUES (?1) ON CONFLICT (id) DO NOTHING",
            duckdb::params![INITIAL_MIGRATION_ID],
        )?;
        Ok(())
    }

    /// Execute `SELECT 1` as a lightweight liveness check.
    ///
    /// Called by the `/health` endpoint.
    pub async fn ping(&self) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute_batch("SELECT 1")?;
        Ok(())
    }

    /// Acquire the DuckDB connection lock for direct queries.
    ///
    /// Intended for integration tests that seed fixtures or verify stored
    /// data. Production code should use the typed methods.
    pub async fn conn_for_test(&self) -> tokio::sync::MutexGuard<'_, Connection> {
        self.conn.lock().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn timestamps_survive_the_varchar_round_trip() {
        let ts = Utc.with_ymd_and_hms(2025, 1, 10, 8, 30, 5).unwrap();
        assert_eq!(ts_from_sql(&ts_to_sql(ts)).unwrap(), ts);
        // DuckDB drops the fraction when it is zero.
        assert_eq!(ts_from_sql("2025-01-10 08:30:05").unwrap(), ts);
        assert!(ts_from_sql("yesterday").is_err());
    }

    #[tokio::test]
    async fn reopening_schema_is_idempotent() {
        let db = DuckDbBackend::open_in_memory().unwrap();
        let conn = db.conn_for_test().await;
        DuckDbBackend::init_sync(&conn, "1GB").unwrap();
        let applied: i64 = conn
            .query_row("SELECT COUNT(*) FROM _migrations", [], |row| row.get(0))
            .unwrap();
        assert_eq!(applied, 1);
    }
}
