use std::sync::Arc;

use tracklink_core::config::Config;
use tracklink_duckdb::DuckDbBackend;

/// Shared application state injected into every Axum handler via
/// [`axum::extract::State`].
pub struct AppState {
    /// The DuckDB backend. Internally uses `Arc<tokio::sync::Mutex<Connection>>`
    /// so it is already async-safe.
    pub db: Arc<DuckDbBackend>,

    /// Parsed configuration, loaded once at startup from environment variables.
    pub config: Arc<Config>,
}

impl AppState {
    /// Wrap `db` and `config`. The backend's engine settings are replaced by
    /// `config.engine` so handlers and storage agree on the tunables.
    pub fn new(db: DuckDbBackend, config: Config) -> Self {
        Self {
            db: Arc::new(db.with_settings(config.engine.clone())),
            config: Arc::new(config),
        }
    }
}
