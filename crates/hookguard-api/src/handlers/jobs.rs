//! Undo for delayed jobs.

use axum::{
    extract::{Path, State},
    Extension, Json,
};
use hookguard_core::{HookguardError, RelatedEntity};
use serde::Serialize;
use tracing::{info, instrument};

use crate::{error::ApiError, middleware::auth::Operator, state::AppState};

/// Result of an undo request.
#[derive(Debug, Serialize)]
pub struct CancelResponse {
    /// Whether a waiting job was cancelled. `false` when it already ran,
    /// was cancelled before, or never existed.
    pub cancelled: bool,
}

/// `DELETE /api/scheduled-jobs/{kind}/{entity_type}/{entity_id}`
#[instrument(name = "cancel_job", skip(state, operator), fields(user_id = %operator.user_id))]
pub async fn cancel_job(
    State(state): State<AppState>,
    Extension(operator): Extension<Operator>,
    Path((kind, entity_type, entity_id)): Path<(String, String, String)>,
) -> Result<Json<CancelResponse>, ApiError> {
    let entity = RelatedEntity::from_parts(&entity_type, &entity_id)
        .map_err(|e| HookguardError::validation(e.to_string()))?;

    let cancelled = state.scheduler.cancel(&kind, entity).await.map_err(HookguardError::from)?;
    info!(%kind, %entity_type, %entity_id, cancelled, "Undo requested");

    Ok(Json(CancelResponse { cancelled }))
}
