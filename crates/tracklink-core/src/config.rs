use crate::attribution::{AdPlatformMatcher, AttributionWindow};

pub const DEFAULT_AD_PLATFORM_PATTERNS: &[&str] = &[
    "facebook", "fb", "meta", "instagram", "google", "adwords", "tiktok", "paid", "cpc", "ppc",
];

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub data_dir: String,
    /// DuckDB memory limit, e.g. `"1GB"`.
    pub duckdb_memory_limit: String,
    pub engine: EngineSettings,
}

/// Tunables for the identity and attribution engine.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineSettings {
    pub ad_platform_patterns: Vec<String>,
    pub fallback_window_days: i64,
    pub session_lookback_days: Option<i64>,
    pub similar_lookback_days: i64,
    pub similar_max_results: usize,
    pub auto_link_probability: f64,
    pub lock_ttl_seconds: i64,
    pub cleanup_chunk_size: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            ad_platform_patterns: DEFAULT_AD_PLATFORM_PATTERNS
                .iter()
                .map(|p| p.to_string())
                .collect(),
            fallback_window_days: 3,
            session_lookback_days: None,
            similar_lookback_days: 30,
            similar_max_results: 20,
            auto_link_probability: 0.70,
            lock_ttl_seconds: 60,
            cleanup_chunk_size: 50,
        }
    }
}

/// Longest look-back accepted for any day-based window (ten years).
pub const MAX_WINDOW_DAYS: i64 = 3650;

impl EngineSettings {
    /// Pull every tunable into its supported range.
    pub fn clamped(self) -> Self {
        Self {
            fallback_window_days: self.fallback_window_days.clamp(0, MAX_WINDOW_DAYS),
            session_lookback_days: self
                .session_lookback_days
                .filter(|days| *days > 0)
                .map(|days| days.min(MAX_WINDOW_DAYS)),
            similar_lookback_days: self.similar_lookback_days.clamp(1, MAX_WINDOW_DAYS),
            similar_max_results: self.similar_max_results.clamp(1, 500),
            lock_ttl_seconds: self.lock_ttl_seconds.clamp(5, 3600),
            cleanup_chunk_size: self.cleanup_chunk_size.clamp(1, 1000),
            ..self
        }
    }

    pub fn ad_platform_matcher(&self) -> AdPlatformMatcher {
        AdPlatformMatcher::new(&self.ad_platform_patterns)
    }

    pub fn attribution_window(&self) -> AttributionWindow {
        AttributionWindow {
            session_lookback_days: self.session_lookback_days,
            fallback_days: self.fallback_window_days,
        }
    }
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

impl Config {
    pub fn from_env() -> Result<Self, String> {
        let defaults = EngineSettings::default();
        let auto_link_probability: f64 =
            env_or("TRACKLINK_AUTO_LINK_PROBABILITY", defaults.auto_link_probability);
        if !(0.0..=1.0).contains(&auto_link_probability) {
            return Err(format!(
                "TRACKLINK_AUTO_LINK_PROBABILITY must be within 0..=1, got {auto_link_probability}"
            ));
        }

        Ok(Self {
            port: std::env::var("TRACKLINK_PORT")
                .unwrap_or_else(|_| "3000".to_string())
                .parse()
                .map_err(|e| format!("invalid port: {e}"))?,
            data_dir: std::env::var("TRACKLINK_DATA_DIR").unwrap_or_else(|_| "./data".to_string()),
            duckdb_memory_limit: std::env::var("TRACKLINK_DUCKDB_MEMORY")
                .unwrap_or_else(|_| "1GB".to_string()),
            engine: EngineSettings {
                ad_platform_patterns: std::env::var("TRACKLINK_AD_PLATFORM_PATTERNS")
                    .map(|v| {
                        v.split(',')
                            .map(|p| p.trim().to_string())
                            .filter(|p| !p.is_empty())
                            .collect()
                    })
                    .unwrap_or(defaults.ad_platform_patterns),
                fallback_window_days: env_or(
                    "TRACKLINK_FALLBACK_WINDOW_DAYS",
                    defaults.fallback_window_days,
                ),
                session_lookback_days: std::env::var("TRACKLINK_SESSION_LOOKBACK_DAYS")
                    .ok()
                    .and_then(|v| v.trim().parse::<i64>().ok()),
                similar_lookback_days: env_or(
                    "TRACKLINK_SIMILAR_LOOKBACK_DAYS",
                    defaults.similar_lookback_days,
                ),
                similar_max_results: env_or(
                    "TRACKLINK_SIMILAR_MAX_RESULTS",
                    defaults.similar_max_results,
                ),
                auto_link_probability,
                lock_ttl_seconds: env_or("TRACKLINK_LOCK_TTL_SECONDS", defaults.lock_ttl_seconds),
                cleanup_chunk_size: env_or(
                    "TRACKLINK_CLEANUP_CHUNK_SIZE",
                    defaults.cleanup_chunk_size,
                ),
            }
            .clamped(),
        })
    }
}
