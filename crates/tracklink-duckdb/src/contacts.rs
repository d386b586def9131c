//! Contact storage: duplicate lookup, transactional merge and the
//! retroactive cleanup sweep.

use anyhow::Result;
use chrono::{DateTime, Utc};
use duckdb::Connection;
use tracing::{info, warn};

use tracklink_core::contact::{
    contact_from_candidate, group_duplicates, plan_merge, CleanupReport, Contact,
    ContactCandidate, ContactStatus, MergeReport,
};
use tracklink_core::conversion::{AppointmentRecord, PaymentRecord};
use tracklink_core::identity::{IdentifierType, NewIdentityLink};

use crate::backend::{ts_from_sql, ts_to_sql};
use crate::identity::{link_identifier_sync, resolve_sync, union_sync};
use crate::DuckDbBackend;

const CONTACT_COLUMNS: &str = "contact_id, ext_crm_id, first_name, last_name, email, phone, \
     company, visitor_id, rstk_adid, rstk_source, status, \
     CAST(created_at AS VARCHAR), CAST(updated_at AS VARCHAR)";

/// Source recorded on identity links created when contacts merge.
const SOURCE_MERGE: &str = "merge";

struct RawContact {
    contact_id: String,
    ext_crm_id: Option<String>,
    first_name: Option<String>,
    last_name: Option<String>,
    email: Option<String>,
    phone: Option<String>,
    company: Option<String>,
    visitor_id: Option<String>,
    rstk_adid: Option<String>,
    rstk_source: Option<String>,
    status: String,
    created_at: String,
    updated_at: String,
}

impl RawContact {
    fn from_row(row: &duckdb::Row<'_>) -> duckdb::Result<Self> {
        Ok(Self {
            contact_id: row.get(0)?,
            ext_crm_id: row.get(1)?,
            first_name: row.get(2)?,
            last_name: row.get(3)?,
            email: row.get(4)?,
            phone: row.get(5)?,
            company: row.get(6)?,
            visitor_id: row.get(7)?,
            rstk_adid: row.get(8)?,
            rstk_source: row.get(9)?,
            status: row.get(10)?,
            created_at: row.get(11)?,
            updated_at: row.get(12)?,
        })
    }

    fn into_contact(self) -> Result<Contact> {
        Ok(Contact {
            contact_id: self.contact_id,
            ext_crm_id: self.ext_crm_id,
            first_name: self.first_name,
            last_name: self.last_name,
            email: self.email,
            phone: self.phone,
            company: self.company,
            visitor_id: self.visitor_id,
            rstk_adid: self.rstk_adid,
            rstk_source: self.rstk_source,
            status: ContactStatus::parse(&self.status)
                .map_err(|e| anyhow::anyhow!("corrupt contact status: {e}"))?,
            created_at: ts_from_sql(&self.created_at)?,
            updated_at: ts_from_sql(&self.updated_at)?,
        })
    }
}

fn query_contacts(
    conn: &Connection,
    sql: &str,
    params: &[&dyn duckdb::types::ToSql],
) -> Result<Vec<Contact>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(params, RawContact::from_row)?;
    let mut contacts = Vec::new();
    for raw in rows {
        contacts.push(raw?.into_contact()?);
    }
    Ok(contacts)
}

pub(crate) fn get_contact_sync(conn: &Connection, contact_id: &str) -> Result<Option<Contact>> {
    let sql = format!("SELECT {CONTACT_COLUMNS} FROM contacts WHERE contact_id = ?1");
    Ok(query_contacts(conn, &sql, &[&contact_id])?.into_iter().next())
}

/// Contacts sharing any normalised match key with `candidate`, oldest first.
///
/// Keys the candidate lacks contribute no predicate; a candidate with no
/// keys at all matches nothing.
pub(crate) fn find_duplicates_sync(
    conn: &Connection,
    candidate: &ContactCandidate,
) -> Result<Vec<Contact>> {
    let keys = candidate.match_keys();
    if keys.is_empty() {
        return Ok(Vec::new());
    }

    let mut predicates: Vec<String> = Vec::new();
    let mut params: Vec<Box<dyn duckdb::types::ToSql>> = Vec::new();
    let mut push = |predicate: &str, value: String| {
        params.push(Box::new(value));
        predicates.push(predicate.replace("{}", &format!("?{}", params.len())));
    };

    if let Some(ext_crm_id) = keys.ext_crm_id {
        push("ext_crm_id = {}", ext_crm_id);
    }
    if let Some(contact_id) = keys.contact_id {
        push("contact_id = {}", contact_id);
    }
    if let Some(email) = keys.email {
        push("lower(trim(email)) = {}", email);
    }
    if let Some(phone_tail) = keys.phone_tail {
        push(
            "right(regexp_replace(phone, '[^0-9]', '', 'g'), 10) = {}",
            phone_tail,
        );
    }

    let sql = format!(
        "SELECT {CONTACT_COLUMNS} FROM contacts WHERE {} ORDER BY created_at, contact_id",
        predicates.join(" OR ")
    );
    let param_refs: Vec<&dyn duckdb::types::ToSql> = params.iter().map(|p| p.as_ref()).collect();
    query_contacts(conn, &sql, param_refs.as_slice())
}

fn insert_contact_sync(conn: &Connection, c: &Contact) -> Result<()> {
    conn.execute(
        r#"INSERT INTO contacts (
            contact_id, ext_crm_id, first_name, last_name, email, phone, company,
            visitor_id, rstk_adid, rstk_source, status, created_at, updated_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)"#,
        duckdb::params![
            c.contact_id,
            c.ext_crm_id,
            c.first_name,
            c.last_name,
            c.email,
            c.phone,
            c.company,
            c.visitor_id,
            c.rstk_adid,
            c.rstk_source,
            c.status.as_str(),
            ts_to_sql(c.created_at),
            ts_to_sql(c.updated_at),
        ],
    )?;
    Ok(())
}

/// Rewrite the mutable fields of a contact. `created_at` is never touched.
fn update_contact_sync(conn: &Connection, c: &Contact) -> Result<()> {
    conn.execute(
        r#"UPDATE contacts SET
            ext_crm_id = ?2, first_name = ?3, last_name = ?4, email = ?5, phone = ?6,
            company = ?7, visitor_id = ?8, rstk_adid = ?9, rstk_source = ?10,
            status = ?11, updated_at = ?12
        WHERE contact_id = ?1"#,
        duckdb::params![
            c.contact_id,
            c.ext_crm_id,
            c.first_name,
            c.last_name,
            c.email,
            c.phone,
            c.company,
            c.visitor_id,
            c.rstk_adid,
            c.rstk_source,
            c.status.as_str(),
            ts_to_sql(c.updated_at),
        ],
    )?;
    Ok(())
}

/// Repoint everything a loser owns at the master. Returns
/// `(payments, appointments, sessions)` moved.
fn migrate_children_sync(conn: &Connection, from: &str, to: &str) -> Result<(usize, usize, usize)> {
    let payments = conn.execute(
        "UPDATE payments SET contact_id = ?1 WHERE contact_id = ?2",
        duckdb::params![to, from],
    )?;
    let appointments = conn.execute(
        "UPDATE appointments SET contact_id = ?1 WHERE contact_id = ?2",
        duckdb::params![to, from],
    )?;
    let sessions = conn.execute(
        "UPDATE sessions SET contact_id = ?1 WHERE contact_id = ?2",
        duckdb::params![to, from],
    )?;
    Ok((payments, appointments, sessions))
}

/// Put the loser's identity (if any) into the master's set.
fn merge_identities_sync(
    conn: &Connection,
    master_id: &str,
    loser_id: &str,
    now: DateTime<Utc>,
) -> Result<()> {
    let Some(loser_root) = resolve_sync(conn, IdentifierType::ContactId, loser_id)? else {
        return Ok(());
    };
    match resolve_sync(conn, IdentifierType::ContactId, master_id)? {
        Some(master_root) => {
            union_sync(conn, &master_root, &loser_root, now)?;
        }
        None => {
            link_identifier_sync(
                conn,
                &NewIdentityLink::new(
                    &loser_root,
                    IdentifierType::ContactId,
                    master_id,
                    SOURCE_MERGE,
                    1.0,
                ),
                now,
            )?;
        }
    }
    Ok(())
}

/// Merge `duplicates` and `incoming` into one stored contact.
///
/// Duplicates are re-read first, so rows that a concurrent merge already
/// removed are ignored. The lookup is then repeated against the candidate
/// inside the same transaction and its hits are added, so a contact stored
/// after the caller's own lookup still absorbs the candidate. With no
/// duplicates at all the candidate becomes a new contact.
fn unify_sync(
    conn: &Connection,
    duplicates: &[Contact],
    incoming: &ContactCandidate,
    now: DateTime<Utc>,
) -> Result<(Contact, MergeReport)> {
    let mut fresh = Vec::with_capacity(duplicates.len());
    for dup in duplicates {
        if let Some(current) = get_contact_sync(conn, &dup.contact_id)? {
            fresh.push(current);
        }
    }
    for found in find_duplicates_sync(conn, incoming)? {
        if !fresh.iter().any(|c| c.contact_id == found.contact_id) {
            fresh.push(found);
        }
    }

    let Some(plan) = plan_merge(&fresh, incoming) else {
        let contact = contact_from_candidate(incoming, now);
        insert_contact_sync(conn, &contact)?;
        let report = MergeReport {
            master_contact_id: contact.contact_id.clone(),
            created: true,
            ..Default::default()
        };
        return Ok((contact, report));
    };

    let mut master = plan.master;
    let mut report = MergeReport {
        master_contact_id: master.contact_id.clone(),
        merged_contact_ids: plan.loser_ids.clone(),
        ..Default::default()
    };

    for loser_id in &plan.loser_ids {
        let (payments, appointments, sessions) =
            migrate_children_sync(conn, loser_id, &master.contact_id)?;
        report.payments_migrated += payments;
        report.appointments_migrated += appointments;
        report.sessions_migrated += sessions;
        merge_identities_sync(conn, &master.contact_id, loser_id, now)?;
        conn.execute(
            "DELETE FROM contacts WHERE contact_id = ?1",
            duckdb::params![loser_id],
        )?;
    }

    if plan.changed {
        master.updated_at = now;
        update_contact_sync(conn, &master)?;
    }
    Ok((master, report))
}

pub(crate) async fn unify_contacts_inner(
    db: &DuckDbBackend,
    duplicates: &[Contact],
    incoming: &ContactCandidate,
    now: DateTime<Utc>,
) -> Result<(Contact, MergeReport)> {
    let mut conn = db.conn.lock().await;
    let tx = conn.transaction()?;
    let (contact, report) = unify_sync(&tx, duplicates, incoming, now)?;
    tx.commit()?;

    if !report.merged_contact_ids.is_empty() {
        info!(
            master = %report.master_contact_id,
            merged = ?report.merged_contact_ids,
            payments = report.payments_migrated,
            appointments = report.appointments_migrated,
            sessions = report.sessions_migrated,
            "Contacts merged"
        );
    }
    Ok((contact, report))
}

fn merge_chunk_sync(
    conn: &mut Connection,
    chunk: &[Vec<String>],
    now: DateTime<Utc>,
) -> Result<Vec<MergeReport>> {
    let tx = conn.transaction()?;
    let mut merges = Vec::with_capacity(chunk.len());
    for group in chunk {
        let mut members = Vec::with_capacity(group.len());
        for contact_id in group {
            if let Some(contact) = get_contact_sync(&tx, contact_id)? {
                members.push(contact);
            }
        }
        // An earlier sweep or a live merge may have folded the group already.
        if members.len() < 2 {
            continue;
        }
        let (_, merge) = unify_sync(&tx, &members, &ContactCandidate::default(), now)?;
        merges.push(merge);
    }
    tx.commit()?;
    Ok(merges)
}

/// Merge every group of contacts that share an email or phone key.
///
/// Groups are committed `cleanup_chunk_size` at a time; a chunk that fails
/// rolls back on its own and is counted in `groups_failed`, leaving earlier
/// chunks in place. The connection is released between chunks.
pub(crate) async fn cleanup_duplicates_inner(
    db: &DuckDbBackend,
    now: DateTime<Utc>,
) -> Result<CleanupReport> {
    let contacts = {
        let conn = db.conn.lock().await;
        let sql = format!(
            "SELECT {CONTACT_COLUMNS} FROM contacts \
             WHERE email IS NOT NULL OR phone IS NOT NULL ORDER BY created_at, contact_id"
        );
        query_contacts(&conn, &sql, &[])?
    };
    let groups = group_duplicates(&contacts);
    let mut report = CleanupReport {
        contacts_scanned: contacts.len(),
        groups_found: groups.len(),
        ..Default::default()
    };

    for chunk in groups.chunks(db.settings.cleanup_chunk_size.max(1)) {
        let mut conn = db.conn.lock().await;
        match merge_chunk_sync(&mut conn, chunk, now) {
            Ok(merges) => {
                report.groups_merged += merges.len();
                report.contacts_removed += merges
                    .iter()
                    .map(|m| m.merged_contact_ids.len())
                    .sum::<usize>();
            }
            Err(e) => {
                report.groups_failed += chunk.len();
                warn!(groups = chunk.len(), error = %e, "Duplicate cleanup chunk rolled back");
            }
        }
    }

    info!(
        scanned = report.contacts_scanned,
        groups = report.groups_found,
        merged = report.groups_merged,
        removed = report.contacts_removed,
        failed = report.groups_failed,
        "Duplicate cleanup finished"
    );
    Ok(report)
}

/// Store an appointment by natural key. Returns `false` if it already existed.
pub(crate) fn record_appointment_sync(conn: &Connection, a: &AppointmentRecord) -> Result<bool> {
    let inserted = conn.execute(
        "INSERT INTO appointments (appointment_id, contact_id, status, scheduled_at, created_at) \
         VALUES (?1, ?2, ?3, ?4, ?5) ON CONFLICT (appointment_id) DO NOTHING",
        duckdb::params![
            a.appointment_id,
            a.contact_id,
            a.status,
            a.scheduled_at.map(ts_to_sql),
            ts_to_sql(a.created_at),
        ],
    )?;
    Ok(inserted == 1)
}

/// Store a payment by natural key. Returns `false` if it already existed.
pub(crate) fn record_payment_sync(conn: &Connection, p: &PaymentRecord) -> Result<bool> {
    let inserted = conn.execute(
        "INSERT INTO payments (payment_id, contact_id, amount, status, paid_at) \
         VALUES (?1, ?2, ?3, ?4, ?5) ON CONFLICT (payment_id) DO NOTHING",
        duckdb::params![
            p.payment_id,
            p.contact_id,
            p.amount,
            p.status,
            ts_to_sql(p.paid_at),
        ],
    )?;
    Ok(inserted == 1)
}
