use std::collections::{BTreeSet, HashMap};

use anyhow::Result;
use chrono::NaiveDate;
use duckdb::Connection;

use tracklink_core::attribution::{
    build_report, AdTouchpoint, Attribution, AttributionReport, AttributionResolver,
    AttributionWindow, ContactAnchor, ConversionKind, ConversionRecord, TouchpointIndex,
};
use tracklink_core::contact::Contact;
use tracklink_core::conversion::PAYMENT_COMPLETED;

use crate::backend::{date_from_sql, ts_from_sql};
use crate::contacts::get_contact_sync;
use crate::sessions::sessions_for_contact_sync;
use crate::DuckDbBackend;

const TOUCHPOINT_COLUMNS: &str =
    "ad_id, campaign_id, adset_id, CAST(date AS VARCHAR), spend, clicks, reach";

fn query_touchpoints(
    conn: &Connection,
    sql: &str,
    params: &[&dyn duckdb::types::ToSql],
) -> Result<Vec<AdTouchpoint>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(params, |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
            row.get::<_, String>(3)?,
            row.get::<_, f64>(4)?,
            row.get::<_, i64>(5)?,
            row.get::<_, i64>(6)?,
        ))
    })?;
    let mut touchpoints = Vec::new();
    for row in rows {
        let (ad_id, campaign_id, adset_id, date, spend, clicks, reach) = row?;
        touchpoints.push(AdTouchpoint {
            ad_id,
            campaign_id,
            adset_id,
            date: date_from_sql(&date)?,
            spend,
            clicks,
            reach,
        });
    }
    Ok(touchpoints)
}

pub(crate) fn all_touchpoints_sync(conn: &Connection) -> Result<Vec<AdTouchpoint>> {
    let sql = format!("SELECT {TOUCHPOINT_COLUMNS} FROM ad_touchpoints ORDER BY ad_id, date");
    query_touchpoints(conn, &sql, &[])
}

pub(crate) fn touchpoints_between_sync(
    conn: &Connection,
    start: NaiveDate,
    end: NaiveDate,
) -> Result<Vec<AdTouchpoint>> {
    let sql = format!(
        "SELECT {TOUCHPOINT_COLUMNS} FROM ad_touchpoints \
         WHERE date >= CAST(?1 AS DATE) AND date <= CAST(?2 AS DATE) ORDER BY ad_id, date"
    );
    let (start, end) = (start.to_string(), end.to_string());
    query_touchpoints(conn, &sql, &[&start, &end])
}

fn attribute_contact_sync(
    conn: &Connection,
    resolver: &AttributionResolver<'_>,
    contact: &Contact,
) -> Result<Option<Attribution>> {
    let sessions =
        sessions_for_contact_sync(conn, &contact.contact_id, contact.visitor_id.as_deref())?;
    Ok(resolver.resolve(&ContactAnchor::from(contact), &sessions))
}

/// Attribute a stored contact. Touchpoints are loaded once per call.
pub(crate) async fn attribute_contact_inner(
    db: &DuckDbBackend,
    contact: &Contact,
    window: &AttributionWindow,
) -> Result<Option<Attribution>> {
    let conn = db.conn.lock().await;
    let matcher = db.settings.ad_platform_matcher();
    let index = TouchpointIndex::from_rows(all_touchpoints_sync(&conn)?);
    let resolver = AttributionResolver::new(&matcher, &index, *window);
    attribute_contact_sync(&conn, &resolver, contact)
}

fn attribute_many_sync(
    db: &DuckDbBackend,
    conn: &Connection,
    contact_ids: impl IntoIterator<Item = String>,
    window: &AttributionWindow,
) -> Result<HashMap<String, Option<Attribution>>> {
    let matcher = db.settings.ad_platform_matcher();
    let index = TouchpointIndex::from_rows(all_touchpoints_sync(conn)?);
    let resolver = AttributionResolver::new(&matcher, &index, *window);

    let mut out = HashMap::new();
    for contact_id in contact_ids {
        let attribution = match get_contact_sync(conn, &contact_id)? {
            Some(contact) => attribute_contact_sync(conn, &resolver, &contact)?,
            None => None,
        };
        out.insert(contact_id, attribution);
    }
    Ok(out)
}

/// Attribute many contacts with a single touchpoint load. Unknown contact
/// ids map to `None`.
pub(crate) async fn attribute_contacts_inner(
    db: &DuckDbBackend,
    contact_ids: &[String],
    window: &AttributionWindow,
) -> Result<HashMap<String, Option<Attribution>>> {
    let conn = db.conn.lock().await;
    attribute_many_sync(db, &conn, contact_ids.iter().cloned(), window)
}

fn conversions_between_sync(
    conn: &Connection,
    start: NaiveDate,
    end: NaiveDate,
) -> Result<Vec<ConversionRecord>> {
    let (start, end) = (start.to_string(), end.to_string());
    let sources: [(ConversionKind, &str); 3] = [
        (
            ConversionKind::Lead,
            "SELECT contact_id, CAST(created_at AS VARCHAR), CAST(0 AS DOUBLE) FROM contacts \
             WHERE CAST(created_at AS DATE) BETWEEN CAST(?1 AS DATE) AND CAST(?2 AS DATE)",
        ),
        (
            ConversionKind::Appointment,
            "SELECT contact_id, CAST(created_at AS VARCHAR), CAST(0 AS DOUBLE) FROM appointments \
             WHERE CAST(created_at AS DATE) BETWEEN CAST(?1 AS DATE) AND CAST(?2 AS DATE)",
        ),
        (
            ConversionKind::Sale,
            "SELECT contact_id, CAST(paid_at AS VARCHAR), amount FROM payments \
             WHERE status = ?3 \
               AND CAST(paid_at AS DATE) BETWEEN CAST(?1 AS DATE) AND CAST(?2 AS DATE)",
        ),
    ];

    let mut records = Vec::new();
    for (kind, sql) in sources {
        let mut stmt = conn.prepare(sql)?;
        let rows = if kind == ConversionKind::Sale {
            stmt.query_map(duckdb::params![start, end, PAYMENT_COMPLETED], raw_conversion)?
                .collect::<Result<Vec<_>, _>>()?
        } else {
            stmt.query_map(duckdb::params![start, end], raw_conversion)?
                .collect::<Result<Vec<_>, _>>()?
        };
        for (contact_id, occurred_at, amount) in rows {
            records.push(ConversionRecord {
                kind,
                contact_id,
                occurred_at: ts_from_sql(&occurred_at)?,
                amount,
            });
        }
    }
    records.sort_by(|a, b| {
        a.occurred_at
            .cmp(&b.occurred_at)
            .then_with(|| a.contact_id.cmp(&b.contact_id))
    });
    Ok(records)
}

fn raw_conversion(row: &duckdb::Row<'_>) -> duckdb::Result<(String, String, f64)> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?))
}

/// Per-ad spend and attributed conversions for `[start, end]`.
///
/// Each contact is attributed once; all of its conversions follow that
/// single answer.
pub(crate) async fn attribution_report_inner(
    db: &DuckDbBackend,
    start: NaiveDate,
    end: NaiveDate,
    window: &AttributionWindow,
) -> Result<AttributionReport> {
    let conn = db.conn.lock().await;
    let spend = touchpoints_between_sync(&conn, start, end)?;
    let conversions = conversions_between_sync(&conn, start, end)?;
    let contact_ids: BTreeSet<String> =
        conversions.iter().map(|c| c.contact_id.clone()).collect();
    let attributions = attribute_many_sync(db, &conn, contact_ids, window)?;
    Ok(build_report(start, end, &spend, &conversions, &attributions))
}
