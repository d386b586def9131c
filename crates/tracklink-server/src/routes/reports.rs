use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::NaiveDate;
use serde::Deserialize;
use serde_json::json;

use tracklink_core::attribution::AttributionReport;
use tracklink_core::engine::EngineBackend;

use crate::{error::AppError, state::AppState};

/// Maximum report range (one year plus a leap day).
const MAX_REPORT_DAYS: i64 = 366;

#[derive(Debug, Deserialize)]
pub struct ReportQuery {
    pub start_date: Option<String>,
    pub end_date: Option<String>,
    pub timezone: Option<String>,
    pub format: Option<String>,
}

/// Resolve the requested range. Missing dates default to the last seven days
/// ending today in `timezone` (UTC when absent).
fn parse_date_range(
    start_date: Option<&str>,
    end_date: Option<&str>,
    timezone: Option<&str>,
) -> Result<(NaiveDate, NaiveDate), AppError> {
    let today = match timezone.map(str::trim).filter(|tz| !tz.is_empty()) {
        None => chrono::Utc::now().date_naive(),
        Some(raw) => {
            let tz = raw
                .parse::<chrono_tz::Tz>()
                .map_err(|_| AppError::BadRequest("invalid timezone".to_string()))?;
            chrono::Utc::now().with_timezone(&tz).date_naive()
        }
    };
    let parse = |value: Option<&str>, field: &str| -> Result<Option<NaiveDate>, AppError> {
        value
            .map(|raw| {
                NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d").map_err(|_| {
                    AppError::BadRequest(format!("invalid {field} (expected YYYY-MM-DD)"))
                })
            })
            .transpose()
    };
    let end = parse(end_date, "end_date")?.unwrap_or(today);
    let start = match parse(start_date, "start_date")? {
        Some(start) => start,
        None => end
            .checked_sub_days(chrono::Days::new(6))
            .ok_or_else(|| AppError::BadRequest("end_date out of range".to_string()))?,
    };
    if end < start {
        return Err(AppError::BadRequest(
            "end_date must be on or after start_date".to_string(),
        ));
    }
    let range_days = (end - start).num_days() + 1;
    if range_days > MAX_REPORT_DAYS {
        return Err(AppError::BadRequest(format!(
            "date range too large: {range_days} days (max {MAX_REPORT_DAYS})"
        )));
    }
    Ok((start, end))
}

/// `GET /api/reports/attribution`: spend and attributed conversions per ad.
///
/// `format=csv` downloads the rows as CSV; the default is JSON.
#[tracing::instrument(skip(state))]
pub async fn attribution_report(
    State(state): State<Arc<AppState>>,
    Query(q): Query<ReportQuery>,
) -> Result<Response, AppError> {
    let as_csv = match q.format.as_deref().map(str::trim) {
        None | Some("") | Some("json") => false,
        Some("csv") => true,
        Some(other) => {
            return Err(AppError::BadRequest(format!(
                "unsupported format: {other}; expected json or csv"
            )))
        }
    };
    let (start, end) = parse_date_range(
        q.start_date.as_deref(),
        q.end_date.as_deref(),
        q.timezone.as_deref(),
    )?;

    let window = state.config.engine.attribution_window();
    let report = state.db.attribution_report(start, end, &window).await?;

    if as_csv {
        let body = build_csv(&report)?;
        let filename = format!("attribution-{start}-{end}.csv");
        return Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, "text/csv; charset=utf-8")
            .header(
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{filename}\""),
            )
            .body(axum::body::Body::from(body))
            .map_err(|e| AppError::Internal(anyhow::anyhow!("response build failed: {e}")));
    }
    Ok(Json(json!({ "data": report })).into_response())
}

/// Prefix values a spreadsheet would read as a formula with a quote.
fn sanitize_csv_field(val: &str) -> std::borrow::Cow<'_, str> {
    if val.starts_with(['=', '+', '-', '@', '\t', '\r']) {
        std::borrow::Cow::Owned(format!("'{val}"))
    } else {
        std::borrow::Cow::Borrowed(val)
    }
}

fn build_csv(report: &AttributionReport) -> anyhow::Result<Vec<u8>> {
    let mut wtr = csv::Writer::from_writer(Vec::with_capacity((report.rows.len() + 2) * 96));
    wtr.write_record([
        "ad_id",
        "campaign_id",
        "adset_id",
        "spend",
        "clicks",
        "reach",
        "leads",
        "appointments",
        "sales",
        "revenue",
        "roas",
    ])
    .map_err(|e| anyhow::anyhow!("csv write_record failed: {e}"))?;

    for row in &report.rows {
        wtr.write_record([
            sanitize_csv_field(&row.ad_id).into_owned(),
            sanitize_csv_field(&row.campaign_id).into_owned(),
            sanitize_csv_field(&row.adset_id).into_owned(),
            format!("{:.2}", row.spend),
            row.clicks.to_string(),
            row.reach.to_string(),
            row.leads.to_string(),
            row.appointments.to_string(),
            row.sales.to_string(),
            format!("{:.2}", row.revenue),
            row.roas.map(|r| format!("{r:.2}")).unwrap_or_default(),
        ])
        .map_err(|e| anyhow::anyhow!("csv write_record failed: {e}"))?;
    }

    let unattributed = &report.unattributed;
    wtr.write_record([
        "(unattributed)".to_string(),
        String::new(),
        String::new(),
        String::new(),
        String::new(),
        String::new(),
        unattributed.leads.to_string(),
        unattributed.appointments.to_string(),
        unattributed.sales.to_string(),
        format!("{:.2}", unattributed.revenue),
        String::new(),
    ])
    .map_err(|e| anyhow::anyhow!("csv write_record failed: {e}"))?;

    wtr.into_inner()
        .map_err(|e| anyhow::anyhow!("csv flush failed: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn csv_fields_that_look_like_formulas_are_quoted() {
        assert_eq!(sanitize_csv_field("=SUM(A1)"), "'=SUM(A1)");
        assert_eq!(sanitize_csv_field("ad_7"), "ad_7");
    }

    #[test]
    fn explicit_range_is_kept() {
        let (start, end) =
            parse_date_range(Some("2025-01-01"), Some("2025-01-31"), Some("Europe/Berlin"))
                .unwrap();
        assert_eq!(start, NaiveDate::from_ymd_opt(2025, 1, 1).unwrap());
        assert_eq!(end, NaiveDate::from_ymd_opt(2025, 1, 31).unwrap());
    }

    #[test]
    fn missing_start_defaults_to_a_week_before_end() {
        let (start, end) = parse_date_range(None, Some("2025-01-31"), None).unwrap();
        assert_eq!(end - start, chrono::Duration::days(6));
    }

    #[test]
    fn earliest_end_date_without_start_is_rejected() {
        let err = parse_date_range(None, Some("-262143-01-01"), None).unwrap_err();
        assert!(matches!(err, AppError::BadRequest(_)));
    }

    #[test]
    fn bad_timezone_and_inverted_ranges_are_rejected() {
        assert!(parse_date_range(None, None, Some("Mars/Olympus")).is_err());
        assert!(parse_date_range(Some("2025-02-01"), Some("2025-01-01"), None).is_err());
        assert!(parse_date_range(Some("2023-01-01"), Some("2025-01-01"), None).is_err());
    }
}
