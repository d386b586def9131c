use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, State},
    response::IntoResponse,
    Json,
};
use chrono::Utc;
use serde_json::json;

use tracklink_core::conversion::{process_conversion, ConversionInput};

use crate::{error::AppError, state::AppState};

/// `POST /api/conversions`: CRM webhook for leads, appointments and sales.
///
/// Matches the payload against existing contacts, merges duplicates, records
/// the appointment or payment, then links the visitor's sessions. Redelivery
/// of the same payload is harmless.
#[tracing::instrument(skip(state, payload))]
pub async fn ingest_conversion(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<ConversionInput>, JsonRejection>,
) -> Result<impl IntoResponse, AppError> {
    let Json(input) = payload.map_err(|e| AppError::BadRequest(e.body_text()))?;
    let outcome = process_conversion(&*state.db, &input, Utc::now()).await?;
    Ok(Json(json!({ "data": outcome })))
}
