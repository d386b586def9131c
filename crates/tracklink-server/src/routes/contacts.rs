use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    response::IntoResponse,
    Json,
};
use serde_json::json;

use tracklink_core::attribution::{ConversionEvent, ConversionKind};
use tracklink_core::contact::ContactCandidate;
use tracklink_core::engine::EngineBackend;

use crate::{error::AppError, state::AppState};

/// `POST /api/contacts/duplicates`: contacts sharing any match key with the
/// candidate, oldest first.
#[tracing::instrument(skip(state, payload))]
pub async fn find_duplicates(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<ContactCandidate>, JsonRejection>,
) -> Result<impl IntoResponse, AppError> {
    let Json(candidate) = payload.map_err(|e| AppError::BadRequest(e.body_text()))?;
    if candidate.match_keys().is_empty() {
        return Err(AppError::BadRequest(
            "at least one of ext_crm_id, contact_id, email or phone is required".to_string(),
        ));
    }
    let contacts = state.db.find_duplicates(&candidate).await?;
    Ok(Json(json!({ "data": contacts })))
}

/// `POST /api/contacts/cleanup`: merge every group of contacts sharing an
/// email or phone. Meant for a periodic external trigger.
#[tracing::instrument(skip(state))]
pub async fn cleanup_duplicates(
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, AppError> {
    let report = state.db.cleanup_duplicates().await?;
    Ok(Json(json!({ "data": report })))
}

/// `GET /api/contacts/{id}/attribution`: the touchpoint the contact's
/// conversions are credited to, or `null`.
#[tracing::instrument(skip(state))]
pub async fn contact_attribution(
    State(state): State<Arc<AppState>>,
    Path(contact_id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let contact = state
        .db
        .get_contact(&contact_id)
        .await?
        .ok_or_else(|| AppError::NotFound("Contact not found".to_string()))?;
    let event = ConversionEvent {
        kind: ConversionKind::Lead,
        contact_id: contact.contact_id.clone(),
        occurred_at: contact.created_at,
    };
    let window = state.config.engine.attribution_window();
    let attribution = state.db.attribute(&event, &window).await?;
    Ok(Json(json!({
        "data": {
            "contact_id": contact.contact_id,
            "status": contact.status,
            "attribution": attribution
        }
    })))
}
