//! Session linker: ties a converting contact to every session its identity
//! has produced, across visitor ids.

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use duckdb::Connection;
use tracing::{info, warn};

use tracklink_core::engine::NamedLock;
use tracklink_core::identity::{
    identity_lock_key, new_primary_identity_id, IdentifierType, NewIdentityLink,
};
use tracklink_core::session::{rank_similar_sessions, Session, SessionLinkOutcome, SimilarSession};

use crate::backend::{rand_hex, ts_to_sql};
use crate::identity::{find_root_sync, link_or_union_sync, resolve_sync, set_identifiers_sync};
use crate::sessions::{attach_sessions_sync, similar_candidates_sync};
use crate::DuckDbBackend;

pub(crate) const SOURCE_CONVERSION: &str = "conversion";
pub(crate) const SOURCE_FINGERPRINT: &str = "fingerprint";

fn similar_sessions_sync(
    db: &DuckDbBackend,
    conn: &Connection,
    current: &Session,
) -> Result<Vec<SimilarSession>> {
    let settings = &db.settings;
    let since = current
        .started_at
        .checked_sub_signed(Duration::days(settings.similar_lookback_days))
        .unwrap_or(DateTime::<Utc>::MIN_UTC);
    let candidates = similar_candidates_sync(conn, current, since)?;
    Ok(rank_similar_sessions(
        current,
        &candidates,
        settings.similar_max_results,
        settings.auto_link_probability,
    ))
}

pub(crate) async fn find_similar_sessions_inner(
    db: &DuckDbBackend,
    current: &Session,
) -> Result<Vec<SimilarSession>> {
    let conn = db.conn.lock().await;
    similar_sessions_sync(db, &conn, current)
}

fn record_match_sync(
    conn: &Connection,
    primary_identity_id: &str,
    current: &Session,
    matched: &SimilarSession,
    now: DateTime<Utc>,
) -> Result<()> {
    conn.execute(
        r#"INSERT INTO fingerprint_matches (
            id, primary_identity_id, session_id, matched_session_id, matched_visitor_id,
            score, probability, matched_signals, auto_linked, created_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)"#,
        duckdb::params![
            rand_hex(16),
            primary_identity_id,
            current.session_id,
            matched.session_id,
            matched.visitor_id,
            matched.score,
            matched.probability,
            serde_json::to_string(&matched.matched_signals)?,
            matched.auto_linkable,
            ts_to_sql(now),
        ],
    )?;
    Ok(())
}

/// Resolve (or mint) the identity for the converting visitor, attach the
/// contact, its device signature and any auto-linkable fingerprint
/// matches, and return the final root plus every visitor id in its set.
fn link_identity_sync(
    db: &DuckDbBackend,
    conn: &Connection,
    contact_id: &str,
    current: &Session,
    now: DateTime<Utc>,
) -> Result<(String, Vec<String>)> {
    let primary = match resolve_sync(conn, IdentifierType::VisitorId, &current.visitor_id)? {
        Some(root) => root,
        None => match resolve_sync(conn, IdentifierType::ContactId, contact_id)? {
            Some(root) => root,
            None => new_primary_identity_id(),
        },
    };

    let mut root = link_or_union_sync(
        conn,
        &NewIdentityLink::new(
            &primary,
            IdentifierType::VisitorId,
            &current.visitor_id,
            SOURCE_CONVERSION,
            1.0,
        ),
        now,
    )?;
    root = link_or_union_sync(
        conn,
        &NewIdentityLink::new(
            &root,
            IdentifierType::ContactId,
            contact_id,
            SOURCE_CONVERSION,
            1.0,
        ),
        now,
    )?;
    if let Some(signature) = current
        .fingerprint
        .device_signature
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
    {
        root = link_or_union_sync(
            conn,
            &NewIdentityLink::new(
                &root,
                IdentifierType::DeviceSignature,
                signature,
                SOURCE_CONVERSION,
                1.0,
            ),
            now,
        )?;
    }

    for matched in similar_sessions_sync(db, conn, current)? {
        if matched.auto_linkable {
            root = link_or_union_sync(
                conn,
                &NewIdentityLink::new(
                    &root,
                    IdentifierType::VisitorId,
                    &matched.visitor_id,
                    SOURCE_FINGERPRINT,
                    matched.probability,
                ),
                now,
            )?;
        }
        record_match_sync(conn, &root, current, &matched, now)?;
    }

    let root = find_root_sync(conn, &root)?;
    let visitor_ids = set_identifiers_sync(conn, &root, IdentifierType::VisitorId)?;
    Ok((root, visitor_ids))
}

async fn propagate_contact(
    db: &DuckDbBackend,
    contact_id: &str,
    visitor_ids: &[String],
    current: &Session,
    now: DateTime<Utc>,
) -> Result<(usize, bool)> {
    let mut conn = db.conn.lock().await;
    let tx = conn.transaction()?;
    let sessions_updated = attach_sessions_sync(&tx, contact_id, visitor_ids)?;
    let backfilled = tx.execute(
        "UPDATE contacts SET visitor_id = ?1, updated_at = ?2 \
         WHERE contact_id = ?3 AND (visitor_id IS NULL OR trim(visitor_id) = '')",
        duckdb::params![current.visitor_id, ts_to_sql(now), contact_id],
    )?;
    tx.commit()?;
    Ok((sessions_updated, backfilled > 0))
}

/// Link `contact_id` to the identity behind `current` and stamp it onto
/// every unattached session of that identity's visitors.
///
/// The session writes happen under the identity's named lock; if another
/// worker holds it the call returns [`SessionLinkOutcome::SkippedLockHeld`]
/// since that worker is propagating the same identity.
pub(crate) async fn unify_sessions_on_conversion_inner(
    db: &DuckDbBackend,
    contact_id: &str,
    current: &Session,
    now: DateTime<Utc>,
) -> Result<SessionLinkOutcome> {
    let (primary_identity_id, visitor_ids) = {
        let mut conn = db.conn.lock().await;
        let tx = conn.transaction()?;
        let linked = link_identity_sync(db, &tx, contact_id, current, now)?;
        tx.commit()?;
        linked
    };

    let key = identity_lock_key(&primary_identity_id);
    let Some(handle) = db.try_acquire(&key).await? else {
        info!(
            %primary_identity_id,
            contact_id,
            "Identity lock held elsewhere; skipping session propagation"
        );
        return Ok(SessionLinkOutcome::SkippedLockHeld {
            primary_identity_id,
        });
    };

    let propagated = propagate_contact(db, contact_id, &visitor_ids, current, now).await;
    if let Err(e) = db.release(handle).await {
        warn!(%primary_identity_id, error = %e, "Failed to release identity lock");
    }
    let (sessions_updated, contact_visitor_backfilled) = propagated?;

    info!(
        %primary_identity_id,
        contact_id,
        visitors = visitor_ids.len(),
        sessions_updated,
        "Sessions linked to contact"
    );
    Ok(SessionLinkOutcome::Linked {
        primary_identity_id,
        visitor_ids,
        sessions_updated,
        contact_visitor_backfilled,
    })
}
