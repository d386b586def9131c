//! Identity graph persistence: first-writer-wins links plus the union-find
//! forest in `identity_roots`.
//!
//! Every helper here is synchronous and takes a `&Connection`, so callers
//! can run them inside an open transaction (which derefs to a connection).

use anyhow::Result;
use chrono::{DateTime, Utc};
use duckdb::Connection;
use tracing::{info, warn};

use tracklink_core::disjoint_set::{choose_root, ForestRoot};
use tracklink_core::identity::{
    IdentifierType, IdentityLink, IdentityState, LinkOutcome, NewIdentityLink,
};

use crate::backend::{ts_from_sql, ts_to_sql};
use crate::DuckDbBackend;

/// Raw primary id stored for a key, without walking the forest.
pub(crate) fn lookup_link_sync(
    conn: &Connection,
    identifier_type: IdentifierType,
    identifier_value: &str,
) -> Result<Option<String>> {
    let mut stmt = conn.prepare(
        "SELECT primary_identity_id FROM identity_links \
         WHERE identifier_type = ?1 AND identifier_value = ?2",
    )?;
    let mut rows = stmt.query_map(
        duckdb::params![identifier_type.as_str(), identifier_value],
        |row| row.get::<_, String>(0),
    )?;
    Ok(rows.next().transpose()?)
}

/// Register `primary_identity_id` as a singleton set if it is not in the
/// forest yet.
pub(crate) fn ensure_root_sync(
    conn: &Connection,
    primary_identity_id: &str,
    now: DateTime<Utc>,
) -> Result<()> {
    conn.execute(
        "INSERT INTO identity_roots (primary_identity_id, parent_id, rank, created_at) \
         VALUES (?1, ?1, 0, ?2) ON CONFLICT (primary_identity_id) DO NOTHING",
        duckdb::params![primary_identity_id, ts_to_sql(now)],
    )?;
    Ok(())
}

fn parent_sync(conn: &Connection, id: &str) -> Result<Option<String>> {
    let mut stmt =
        conn.prepare("SELECT parent_id FROM identity_roots WHERE primary_identity_id = ?1")?;
    let mut rows = stmt.query_map(duckdb::params![id], |row| row.get::<_, String>(0))?;
    Ok(rows.next().transpose()?)
}

/// Root of the set containing `primary_identity_id`, compressing the path.
///
/// An id missing from the forest is its own root.
pub(crate) fn find_root_sync(conn: &Connection, primary_identity_id: &str) -> Result<String> {
    let mut path = Vec::new();
    let mut current = primary_identity_id.to_string();
    loop {
        match parent_sync(conn, &current)? {
            Some(parent) if parent != current => {
                path.push(current);
                current = parent;
            }
            _ => break,
        }
    }
    // The last node on the path already points at the root.
    if path.len() > 1 {
        for node in &path[..path.len() - 1] {
            conn.execute(
                "UPDATE identity_roots SET parent_id = ?1 WHERE primary_identity_id = ?2",
                duckdb::params![current, node],
            )?;
        }
    }
    Ok(current)
}

fn forest_root_sync(conn: &Connection, id: &str) -> Result<ForestRoot> {
    let mut stmt = conn.prepare(
        "SELECT rank, CAST(created_at AS VARCHAR) FROM identity_roots \
         WHERE primary_identity_id = ?1",
    )?;
    let mut rows = stmt.query_map(duckdb::params![id], |row| {
        Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
    })?;
    let (rank, created_at) = rows
        .next()
        .transpose()?
        .ok_or_else(|| anyhow::anyhow!("identity {id} missing from forest"))?;
    Ok(ForestRoot {
        id: id.to_string(),
        rank,
        created_at: ts_from_sql(&created_at)?,
    })
}

/// Union the sets of `a` and `b`; returns the surviving root.
pub(crate) fn union_sync(conn: &Connection, a: &str, b: &str, now: DateTime<Utc>) -> Result<String> {
    ensure_root_sync(conn, a, now)?;
    ensure_root_sync(conn, b, now)?;
    let root_a = find_root_sync(conn, a)?;
    let root_b = find_root_sync(conn, b)?;
    if root_a == root_b {
        return Ok(root_a);
    }

    let (root, child) = choose_root(
        forest_root_sync(conn, &root_a)?,
        forest_root_sync(conn, &root_b)?,
    );
    conn.execute(
        "UPDATE identity_roots SET parent_id = ?1 WHERE primary_identity_id = ?2",
        duckdb::params![root.id, child.id],
    )?;
    conn.execute(
        "UPDATE identity_roots SET rank = ?1 WHERE primary_identity_id = ?2",
        duckdb::params![root.rank, root.id],
    )?;
    info!(root = %root.id, absorbed = %child.id, "Identities unioned");
    Ok(root.id)
}

/// Every primary id in the set rooted at `root`.
pub(crate) fn set_members_sync(conn: &Connection, root: &str) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(
        "WITH RECURSIVE tree(id) AS ( \
             SELECT CAST(?1 AS VARCHAR) \
             UNION \
             SELECT r.primary_identity_id FROM identity_roots r \
             JOIN tree t ON r.parent_id = t.id \
             WHERE r.primary_identity_id <> r.parent_id \
         ) SELECT id FROM tree ORDER BY id",
    )?;
    let rows = stmt.query_map(duckdb::params![root], |row| row.get::<_, String>(0))?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

struct RawLink {
    primary_identity_id: String,
    identifier_type: String,
    identifier_value: String,
    source: String,
    confidence: f64,
    created_at: String,
}

/// All link rows whose primary id belongs to the set rooted at `root`,
/// optionally restricted to one identifier type.
pub(crate) fn set_links_sync(
    conn: &Connection,
    root: &str,
    only: Option<IdentifierType>,
) -> Result<Vec<IdentityLink>> {
    let members = set_members_sync(conn, root)?;
    let mut links = Vec::new();
    let mut stmt = conn.prepare(
        "SELECT primary_identity_id, identifier_type, identifier_value, source, confidence, \
                CAST(created_at AS VARCHAR) \
         FROM identity_links WHERE primary_identity_id = ?1 \
         ORDER BY created_at, identifier_type, identifier_value",
    )?;
    for member in &members {
        let rows = stmt.query_map(duckdb::params![member], |row| {
            Ok(RawLink {
                primary_identity_id: row.get(0)?,
                identifier_type: row.get(1)?,
                identifier_value: row.get(2)?,
                source: row.get(3)?,
                confidence: row.get(4)?,
                created_at: row.get(5)?,
            })
        })?;
        for raw in rows {
            let raw = raw?;
            let identifier_type = IdentifierType::parse(&raw.identifier_type)
                .map_err(|e| anyhow::anyhow!("corrupt identity link: {e}"))?;
            if only.is_some_and(|t| t != identifier_type) {
                continue;
            }
            links.push(IdentityLink {
                primary_identity_id: raw.primary_identity_id,
                identifier_type,
                identifier_value: raw.identifier_value,
                source: raw.source,
                confidence: raw.confidence,
                created_at: ts_from_sql(&raw.created_at)?,
            });
        }
    }
    Ok(links)
}

/// Identifier values of one type in the set rooted at `root`, sorted and
/// deduplicated.
pub(crate) fn set_identifiers_sync(
    conn: &Connection,
    root: &str,
    identifier_type: IdentifierType,
) -> Result<Vec<String>> {
    let mut values: Vec<String> = set_links_sync(conn, root, Some(identifier_type))?
        .into_iter()
        .map(|l| l.identifier_value)
        .collect();
    values.sort();
    values.dedup();
    Ok(values)
}

/// Root identity for a key, or `None` if the key was never linked.
pub(crate) fn resolve_sync(
    conn: &Connection,
    identifier_type: IdentifierType,
    identifier_value: &str,
) -> Result<Option<String>> {
    match lookup_link_sync(conn, identifier_type, identifier_value)? {
        Some(primary) => Ok(Some(find_root_sync(conn, &primary)?)),
        None => Ok(None),
    }
}

/// First-writer-wins insert of one link.
///
/// A key that already maps into a different set is reported as a conflict
/// and left untouched.
pub(crate) fn link_identifier_sync(
    conn: &Connection,
    link: &NewIdentityLink,
    now: DateTime<Utc>,
) -> Result<LinkOutcome> {
    ensure_root_sync(conn, &link.primary_identity_id, now)?;
    let inserted = conn.execute(
        "INSERT INTO identity_links \
            (identifier_type, identifier_value, primary_identity_id, source, confidence, created_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6) \
         ON CONFLICT (identifier_type, identifier_value) DO NOTHING",
        duckdb::params![
            link.identifier_type.as_str(),
            link.identifier_value,
            link.primary_identity_id,
            link.source,
            link.confidence,
            ts_to_sql(now),
        ],
    )?;
    if inserted == 1 {
        return Ok(LinkOutcome::Created);
    }

    let existing = lookup_link_sync(conn, link.identifier_type, &link.identifier_value)?
        .ok_or_else(|| anyhow::anyhow!("identity link vanished during upsert"))?;
    let existing_root = find_root_sync(conn, &existing)?;
    if existing_root == find_root_sync(conn, &link.primary_identity_id)? {
        Ok(LinkOutcome::AlreadyLinked)
    } else {
        warn!(
            identifier_type = link.identifier_type.as_str(),
            identifier_value = %link.identifier_value,
            requested = %link.primary_identity_id,
            existing = %existing_root,
            "Identity link conflict; keeping existing mapping"
        );
        Ok(LinkOutcome::Conflict {
            existing_primary_id: existing_root,
        })
    }
}

pub(crate) async fn link_identifier_inner(
    db: &DuckDbBackend,
    link: &NewIdentityLink,
    now: DateTime<Utc>,
) -> Result<LinkOutcome> {
    let mut conn = db.conn.lock().await;
    let tx = conn.transaction()?;
    let outcome = link_identifier_sync(&tx, link, now)?;
    tx.commit()?;
    Ok(outcome)
}

/// Union two sets unless that would put two different contacts in one
/// identity. Returns the root that `a` ends up in.
pub(crate) fn union_if_compatible_sync(
    conn: &Connection,
    a: &str,
    b: &str,
    now: DateTime<Utc>,
) -> Result<String> {
    let root_a = find_root_sync(conn, a)?;
    let root_b = find_root_sync(conn, b)?;
    if root_a == root_b {
        return Ok(root_a);
    }
    let contacts_a = set_identifiers_sync(conn, &root_a, IdentifierType::ContactId)?;
    let contacts_b = set_identifiers_sync(conn, &root_b, IdentifierType::ContactId)?;
    let disjoint_contacts = !contacts_a.is_empty()
        && !contacts_b.is_empty()
        && contacts_a.iter().all(|c| !contacts_b.contains(c));
    if disjoint_contacts {
        warn!(
            left = %root_a,
            right = %root_b,
            "Refusing to union identities attached to different contacts"
        );
        return Ok(root_a);
    }
    union_sync(conn, &root_a, &root_b, now)
}

/// Link `link` and, on conflict, fold the existing identity into the
/// requested one when that is safe. Returns the root the caller should
/// keep using.
pub(crate) fn link_or_union_sync(
    conn: &Connection,
    link: &NewIdentityLink,
    now: DateTime<Utc>,
) -> Result<String> {
    match link_identifier_sync(conn, link, now)? {
        LinkOutcome::Created | LinkOutcome::AlreadyLinked => {
            find_root_sync(conn, &link.primary_identity_id)
        }
        LinkOutcome::Conflict { existing_primary_id } => {
            union_if_compatible_sync(conn, &link.primary_identity_id, &existing_primary_id, now)
        }
    }
}

pub(crate) fn visitor_state_sync(conn: &Connection, visitor_id: &str) -> Result<IdentityState> {
    let root = resolve_sync(conn, IdentifierType::VisitorId, visitor_id)?;
    let contacts = match &root {
        Some(root) => set_identifiers_sync(conn, root, IdentifierType::ContactId)?,
        None => Vec::new(),
    };
    Ok(IdentityState::classify(root, &contacts))
}
