use std::sync::Arc;

use anyhow::Result;
use tracing::info;

use tracklink_server::state::AppState;

/// `tracklink health`: liveness probe for container health checks.
///
/// Calls `GET http://localhost:$TRACKLINK_PORT/health`.
/// Exits 0 if the server responds with HTTP 200, exits 1 otherwise.
fn run_health_check() -> ! {
    let port = std::env::var("TRACKLINK_PORT").unwrap_or_else(|_| "3000".to_string());
    let url = format!("http://localhost:{}/health", port);
    match ureq::get(&url).call() {
        Ok(resp) if resp.status() == 200 => std::process::exit(0),
        _ => std::process::exit(1),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();
    if args.get(1).map(|s| s.as_str()) == Some("health") {
        run_health_check();
    }
    // Structured JSON logging. Level controlled via RUST_LOG.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("tracklink=info".parse()?),
        )
        .json()
        .init();

    let cfg = tracklink_core::config::Config::from_env().map_err(|e| anyhow::anyhow!(e))?;

    std::fs::create_dir_all(&cfg.data_dir)?;
    let db_path = format!("{}/tracklink.db", cfg.data_dir);
    let db = tracklink_duckdb::DuckDbBackend::open(&db_path, &cfg.duckdb_memory_limit)?;

    info!(
        fallback_window_days = cfg.engine.fallback_window_days,
        auto_link_probability = cfg.engine.auto_link_probability,
        ad_platform_patterns = ?cfg.engine.ad_platform_patterns,
        "Engine settings loaded"
    );

    let state = Arc::new(AppState::new(db, cfg.clone()));
    let addr = format!("0.0.0.0:{}", cfg.port);
    let app = tracklink_server::app::build_app(state);

    info!(port = cfg.port, "Tracklink listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            tokio::signal::ctrl_c().await.ok();
        })
        .await?;

    Ok(())
}
