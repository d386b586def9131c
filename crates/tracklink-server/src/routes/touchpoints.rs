use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, State},
    response::IntoResponse,
    Json,
};
use chrono::NaiveDate;
use serde::Deserialize;
use serde_json::json;

use tracklink_core::attribution::AdTouchpoint;
use tracklink_core::engine::EngineBackend;

use crate::{error::AppError, state::AppState};

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TouchpointFeed {
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    #[serde(default)]
    pub rows: Vec<AdTouchpoint>,
}

/// `PUT /api/touchpoints`: replace the ad feed for a date range.
///
/// Every stored row dated within `[start_date, end_date]` is swapped for
/// `rows` atomically. An empty `rows` clears the range.
#[tracing::instrument(skip(state, payload))]
pub async fn replace_touchpoints(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<TouchpointFeed>, JsonRejection>,
) -> Result<impl IntoResponse, AppError> {
    let Json(feed) = payload.map_err(|e| AppError::BadRequest(e.body_text()))?;
    let replaced = state
        .db
        .replace_touchpoints(feed.start_date, feed.end_date, &feed.rows)
        .await?;
    Ok(Json(json!({
        "data": {
            "start_date": feed.start_date,
            "end_date": feed.end_date,
            "rows": replaced
        }
    })))
}
