use anyhow::Result;
use chrono::NaiveDate;
use tracing::info;

use tracklink_core::attribution::AdTouchpoint;

use crate::DuckDbBackend;

/// Swap the touchpoints dated within `[start, end]` for `rows` in one
/// transaction. Rows must already be validated against the range.
pub(crate) async fn replace_touchpoints_inner(
    db: &DuckDbBackend,
    start: NaiveDate,
    end: NaiveDate,
    rows: &[AdTouchpoint],
) -> Result<usize> {
    let mut conn = db.conn.lock().await;
    let tx = conn.transaction()?;
    let removed = tx.execute(
        "DELETE FROM ad_touchpoints WHERE date >= CAST(?1 AS DATE) AND date <= CAST(?2 AS DATE)",
        duckdb::params![start.to_string(), end.to_string()],
    )?;
    {
        let mut stmt = tx.prepare(
            "INSERT INTO ad_touchpoints (ad_id, campaign_id, adset_id, date, spend, clicks, reach) \
             VALUES (?1, ?2, ?3, CAST(?4 AS DATE), ?5, ?6, ?7)",
        )?;
        for row in rows {
            stmt.execute(duckdb::params![
                row.ad_id.trim(),
                row.campaign_id,
                row.adset_id,
                row.date.to_string(),
                row.spend,
                row.clicks,
                row.reach,
            ])?;
        }
    }
    tx.commit()?;
    info!(%start, %end, removed, inserted = rows.len(), "Ad touchpoints replaced");
    Ok(rows.len())
}
