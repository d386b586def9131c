use anyhow::Result;
use chrono::{DateTime, Utc};
use duckdb::Connection;

use tracklink_core::fingerprint::FingerprintSet;
use tracklink_core::session::Session;

use crate::backend::{ts_from_sql, ts_to_sql};

/// Column list shared by every session read; keep in step with [`RawSession`].
pub(crate) const SESSION_COLUMNS: &str = "session_id, visitor_id, contact_id, \
     CAST(started_at AS VARCHAR), channel, source_platform, utm_source, ad_id, \
     canvas_hash, webgl_hash, audio_hash, fonts_hash, screen_hash, device_signature, \
     ip, timezone";

pub(crate) struct RawSession {
    session_id: String,
    visitor_id: String,
    contact_id: Option<String>,
    started_at: String,
    channel: Option<String>,
    source_platform: Option<String>,
    utm_source: Option<String>,
    ad_id: Option<String>,
    fingerprint: FingerprintSet,
}

impl RawSession {
    pub(crate) fn from_row(row: &duckdb::Row<'_>) -> duckdb::Result<Self> {
        Ok(Self {
            session_id: row.get(0)?,
            visitor_id: row.get(1)?,
            contact_id: row.get(2)?,
            started_at: row.get(3)?,
            channel: row.get(4)?,
            source_platform: row.get(5)?,
            utm_source: row.get(6)?,
            ad_id: row.get(7)?,
            fingerprint: FingerprintSet {
                canvas_hash: row.get(8)?,
                webgl_hash: row.get(9)?,
                audio_hash: row.get(10)?,
                fonts_hash: row.get(11)?,
                screen_hash: row.get(12)?,
                device_signature: row.get(13)?,
                ip: row.get(14)?,
                timezone: row.get(15)?,
            },
        })
    }

    pub(crate) fn into_session(self) -> Result<Session> {
        Ok(Session {
            session_id: self.session_id,
            visitor_id: self.visitor_id,
            contact_id: self.contact_id,
            started_at: ts_from_sql(&self.started_at)?,
            channel: self.channel,
            source_platform: self.source_platform,
            utm_source: self.utm_source,
            ad_id: self.ad_id,
            fingerprint: self.fingerprint,
        })
    }
}

fn query_sessions(
    conn: &Connection,
    sql: &str,
    params: &[&dyn duckdb::types::ToSql],
) -> Result<Vec<Session>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(params, RawSession::from_row)?;
    let mut sessions = Vec::new();
    for raw in rows {
        sessions.push(raw?.into_session()?);
    }
    Ok(sessions)
}

/// Append a telemetry session. Returns `false` if the id already exists.
///
/// `contact_id` is never taken from telemetry.
pub(crate) fn insert_session_sync(conn: &Connection, session: &Session) -> Result<bool> {
    let fp = &session.fingerprint;
    let inserted = conn.execute(
        r#"INSERT INTO sessions (
            session_id, visitor_id, contact_id, started_at,
            channel, source_platform, utm_source, ad_id,
            canvas_hash, webgl_hash, audio_hash, fonts_hash, screen_hash,
            device_signature, ip, timezone
        ) VALUES (
            ?1, ?2, NULL, ?3,
            ?4, ?5, ?6, ?7,
            ?8, ?9, ?10, ?11, ?12,
            ?13, ?14, ?15
        ) ON CONFLICT (session_id) DO NOTHING"#,
        duckdb::params![
            session.session_id,
            session.visitor_id,
            ts_to_sql(session.started_at),
            session.channel,
            session.source_platform,
            session.utm_source,
            session.ad_id,
            fp.canvas_hash,
            fp.webgl_hash,
            fp.audio_hash,
            fp.fonts_hash,
            fp.screen_hash,
            fp.device_signature,
            fp.ip,
            fp.timezone,
        ],
    )?;
    Ok(inserted == 1)
}

pub(crate) fn get_session_sync(conn: &Connection, session_id: &str) -> Result<Option<Session>> {
    let sql = format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE session_id = ?1");
    Ok(query_sessions(conn, &sql, &[&session_id])?.into_iter().next())
}

pub(crate) fn latest_session_for_visitor_sync(
    conn: &Connection,
    visitor_id: &str,
) -> Result<Option<Session>> {
    let sql = format!(
        "SELECT {SESSION_COLUMNS} FROM sessions WHERE visitor_id = ?1 \
         ORDER BY started_at DESC, session_id DESC LIMIT 1"
    );
    Ok(query_sessions(conn, &sql, &[&visitor_id])?.into_iter().next())
}

/// Fingerprinted sessions of other visitors started at or after `since`.
pub(crate) fn similar_candidates_sync(
    conn: &Connection,
    current: &Session,
    since: DateTime<Utc>,
) -> Result<Vec<Session>> {
    let sql = format!(
        "SELECT {SESSION_COLUMNS} FROM sessions \
         WHERE visitor_id <> ?1 AND session_id <> ?2 \
           AND started_at >= CAST(?3 AS TIMESTAMP) \
           AND (canvas_hash IS NOT NULL OR webgl_hash IS NOT NULL OR audio_hash IS NOT NULL \
                OR fonts_hash IS NOT NULL OR screen_hash IS NOT NULL \
                OR device_signature IS NOT NULL OR ip IS NOT NULL) \
         ORDER BY started_at DESC"
    );
    let since = ts_to_sql(since);
    query_sessions(conn, &sql, &[&current.visitor_id, &current.session_id, &since])
}

/// Sessions owned by a contact directly or through its visitor id.
pub(crate) fn sessions_for_contact_sync(
    conn: &Connection,
    contact_id: &str,
    visitor_id: Option<&str>,
) -> Result<Vec<Session>> {
    let sql = format!(
        "SELECT {SESSION_COLUMNS} FROM sessions \
         WHERE contact_id = ?1 OR visitor_id = CAST(?2 AS VARCHAR) \
         ORDER BY started_at, session_id"
    );
    query_sessions(conn, &sql, &[&contact_id, &visitor_id])
}

/// Set `contact_id` on the visitors' sessions that have none.
///
/// Sessions already attached to a contact are never overwritten.
pub(crate) fn attach_sessions_sync(
    conn: &Connection,
    contact_id: &str,
    visitor_ids: &[String],
) -> Result<usize> {
    let mut updated = 0;
    for visitor_id in visitor_ids {
        updated += conn.execute(
            "UPDATE sessions SET contact_id = ?1 WHERE visitor_id = ?2 AND contact_id IS NULL",
            duckdb::params![contact_id, visitor_id],
        )?;
    }
    Ok(updated)
}
