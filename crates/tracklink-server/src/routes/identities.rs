use std::sync::Arc;

use axum::{
    extract::{Query, State},
    response::IntoResponse,
    Json,
};
use serde::Deserialize;
use serde_json::json;

use tracklink_core::engine::EngineBackend;
use tracklink_core::identity::{IdentifierType, IdentityState};

use crate::{error::AppError, state::AppState};

#[derive(Debug, Deserialize)]
pub struct ResolveQuery {
    pub identifier_type: String,
    pub identifier_value: String,
}

/// `GET /api/identities/resolve`: root identity for an identifier plus
/// every link in its set.
#[tracing::instrument(skip(state))]
pub async fn resolve_identity(
    State(state): State<Arc<AppState>>,
    Query(q): Query<ResolveQuery>,
) -> Result<impl IntoResponse, AppError> {
    let identifier_type = IdentifierType::parse(&q.identifier_type)?;
    let value = q.identifier_value.trim();
    if value.is_empty() {
        return Err(AppError::Validation {
            field: "identifier_value",
            message: "must not be empty".to_string(),
        });
    }

    let root = state
        .db
        .resolve_identity(identifier_type, value)
        .await?
        .ok_or_else(|| AppError::NotFound("Identifier not linked".to_string()))?;
    let links = state.db.identity_links(&root).await?;
    let state_json = match identifier_type {
        IdentifierType::VisitorId => Some(state.db.visitor_state(value).await?),
        _ => None::<IdentityState>,
    };

    Ok(Json(json!({
        "data": {
            "primary_identity_id": root,
            "links": links,
            "visitor_state": state_json
        }
    })))
}
