/// DuckDB initialization SQL.
///
/// Executed once at database open time via `Connection::execute_batch`.
/// All statements use `IF NOT EXISTS` so they are safe to re-run on every
/// startup.
///
/// IMPORTANT:
///   - Always set an explicit memory limit; the DuckDB default (80% of system
///     RAM) is not acceptable for a server process.
///   - Indexes are only created on columns that are never updated. DuckDB
///     rewrites an UPDATE of an indexed column as delete + insert, which
///     trips key checks inside a transaction. `contact_id` on sessions,
///     payments and appointments is repointed by merges, so it stays
///     unindexed, and `ad_touchpoints` has no key because the feed deletes
///     and re-inserts the same `(ad_id, date)` pairs in one transaction.
pub fn init_sql(memory_limit: &str) -> String {
    format!(
        r#"SET memory_limit = '{memory_limit}';
SET threads = 2;

-- ===========================================
-- SESSIONS (append-only telemetry)
-- ===========================================
-- contact_id is written only by the session linker (NULL -> value) and
-- repointed by contact merges.
CREATE TABLE IF NOT EXISTS sessions (
    session_id        VARCHAR PRIMARY KEY,
    visitor_id        VARCHAR NOT NULL,
    contact_id        VARCHAR,
    started_at        TIMESTAMP NOT NULL,
    channel           VARCHAR,
    source_platform   VARCHAR,
    utm_source        VARCHAR,
    ad_id             VARCHAR,
    canvas_hash       VARCHAR,
    webgl_hash        VARCHAR,
    audio_hash        VARCHAR,
    fonts_hash        VARCHAR,
    screen_hash       VARCHAR,
    device_signature  VARCHAR,
    ip                VARCHAR,
    timezone          VARCHAR
);
CREATE INDEX IF NOT EXISTS idx_sessions_visitor_started
    ON sessions(visitor_id, started_at DESC);
CREATE INDEX IF NOT EXISTS idx_sessions_started
    ON sessions(started_at DESC);

-- ===========================================
-- IDENTITY GRAPH
-- ===========================================
-- One row per identifier. First link wins; rows are never updated or deleted.
CREATE TABLE IF NOT EXISTS identity_links (
    identifier_type      VARCHAR NOT NULL,   -- 'visitor_id' | 'contact_id' | 'device_signature'
    identifier_value     VARCHAR NOT NULL,
    primary_identity_id  VARCHAR NOT NULL,
    source               VARCHAR NOT NULL,
    confidence           DOUBLE NOT NULL,
    created_at           TIMESTAMP NOT NULL,
    PRIMARY KEY (identifier_type, identifier_value)
);
CREATE INDEX IF NOT EXISTS idx_identity_links_primary
    ON identity_links(primary_identity_id);

-- Disjoint-set forest over primary identities. A root has parent_id = itself.
CREATE TABLE IF NOT EXISTS identity_roots (
    primary_identity_id  VARCHAR PRIMARY KEY,
    parent_id            VARCHAR NOT NULL,
    rank                 BIGINT NOT NULL DEFAULT 0,
    created_at           TIMESTAMP NOT NULL
);

-- Every similar-session match above the score floor, for audit and review.
CREATE TABLE IF NOT EXISTS fingerprint_matches (
    id                   VARCHAR PRIMARY KEY,
    primary_identity_id  VARCHAR NOT NULL,
    session_id           VARCHAR NOT NULL,
    matched_session_id   VARCHAR NOT NULL,
    matched_visitor_id   VARCHAR NOT NULL,
    score                BIGINT NOT NULL,
    probability          DOUBLE NOT NULL,
    matched_signals      VARCHAR NOT NULL,    -- JSON array of signal names
    auto_linked          BOOLEAN NOT NULL,
    created_at           TIMESTAMP NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_fingerprint_matches_primary
    ON fingerprint_matches(primary_identity_id);

-- ===========================================
-- CONTACTS
-- ===========================================
CREATE TABLE IF NOT EXISTS contacts (
    contact_id    VARCHAR PRIMARY KEY,           -- 'ct_' + 32 hex
    ext_crm_id    VARCHAR,
    first_name    VARCHAR,
    last_name     VARCHAR,
    email         VARCHAR,
    phone         VARCHAR,
    company       VARCHAR,
    visitor_id    VARCHAR,
    rstk_adid     VARCHAR,
    rstk_source   VARCHAR,
    status        VARCHAR NOT NULL DEFAULT 'lead',  -- 'lead' | 'appointment' | 'client'
    created_at    TIMESTAMP NOT NULL,              -- attribution anchor, never moved by merges
    updated_at    TIMESTAMP NOT NULL
);

CREATE TABLE IF NOT EXISTS appointments (
    appointment_id  VARCHAR PRIMARY KEY,
    contact_id      VARCHAR NOT NULL,
    status          VARCHAR NOT NULL,
    scheduled_at    TIMESTAMP,
    created_at      TIMESTAMP NOT NULL
);

CREATE TABLE IF NOT EXISTS payments (
    payment_id  VARCHAR PRIMARY KEY,
    contact_id  VARCHAR NOT NULL,
    amount      DOUBLE NOT NULL,
    status      VARCHAR NOT NULL,                 -- only 'completed' counts as a sale
    paid_at     TIMESTAMP NOT NULL
);

-- ===========================================
-- AD TOUCHPOINTS (replaced by the ad-platform sync)
-- ===========================================
CREATE TABLE IF NOT EXISTS ad_touchpoints (
    ad_id        VARCHAR NOT NULL,
    campaign_id  VARCHAR NOT NULL,
    adset_id     VARCHAR NOT NULL,
    date         DATE NOT NULL,
    spend        DOUBLE NOT NULL DEFAULT 0,
    clicks       BIGINT NOT NULL DEFAULT 0,
    reach        BIGINT NOT NULL DEFAULT 0
);

-- ===========================================
-- NAMED LOCKS
-- ===========================================
-- Rows past expires_at are stale and may be taken over.
CREATE TABLE IF NOT EXISTS engine_locks (
    lock_key     VARCHAR PRIMARY KEY,
    holder       VARCHAR NOT NULL,
    acquired_at  TIMESTAMP NOT NULL,
    expires_at   TIMESTAMP NOT NULL
);
"#
    )
}

/// Migrations tracking table SQL.
///
/// Run before the init SQL. Tracks which numbered migrations have been
/// applied so restarts don't re-run them.
pub const MIGRATIONS_TABLE_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS _migrations (
    id          VARCHAR PRIMARY KEY,
    applied_at  TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
);
"#;

/// Id recorded in `_migrations` once the tables above exist.
pub const INITIAL_MIGRATION_ID: &str = "0001_identity_attribution_engine";
