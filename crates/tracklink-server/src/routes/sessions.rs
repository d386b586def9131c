use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde_json::json;

use tracklink_core::engine::EngineBackend;
use tracklink_core::session::Session;

use crate::{error::AppError, state::AppState};

/// `POST /api/sessions`: store one session from the tracking pipeline.
///
/// Always answers 201; `recorded` is false when the session id was already
/// stored.
#[tracing::instrument(skip(state, payload))]
pub async fn record_session(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<Session>, JsonRejection>,
) -> Result<impl IntoResponse, AppError> {
    let Json(session) = payload.map_err(|e| AppError::BadRequest(e.body_text()))?;
    if session.contact_id.is_some() {
        return Err(AppError::BadRequest(
            "contact_id is assigned by the engine".to_string(),
        ));
    }
    let recorded = state.db.record_session(&session).await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({
            "data": {
                "session_id": session.session_id,
                "recorded": recorded
            }
        })),
    ))
}

/// `GET /api/sessions/{id}/similar`: fingerprint matches for a session.
#[tracing::instrument(skip(state))]
pub async fn similar_sessions(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let session = state
        .db
        .get_session(&session_id)
        .await?
        .ok_or_else(|| AppError::NotFound("Session not found".to_string()))?;
    let similar = state.db.find_similar_sessions(&session).await?;
    Ok(Json(json!({ "data": similar })))
}
