//! Worker pool control and queue inspection.

use axum::extract::{Path, State};
use axum::Json;
use serde::Serialize;

use conduit_core::{PoolStatus, QueueDepth, Stage, Tier};

use crate::error::ApiError;
use crate::AppState;

#[derive(Debug, Serialize)]
pub struct PoolActionResponse {
    pub action: String,
    /// Whether the action changed anything.
    pub changed: bool,
    pub status: PoolStatus,
}

pub async fn list_pools(State(state): State<AppState>) -> Json<Vec<PoolStatus>> {
    Json(state.pipeline.supervisor.statuses().await)
}

/// `start`, `stop` or `restart` one (tier, stage) pool.
pub async fn pool_action(
    State(state): State<AppState>,
    Path((tier, stage, action)): Path<(String, String, String)>,
) -> Result<Json<PoolActionResponse>, ApiError> {
    let tier: Tier = tier.parse().map_err(ApiError::BadRequest)?;
    let stage: Stage = stage.parse().map_err(ApiError::BadRequest)?;
    let supervisor = &state.pipeline.supervisor;

    let changed = match action.as_str() {
        "start" => {
            supervisor
                .start(tier, stage, supervisor.sizes().get(tier))
                .await?
        }
        "stop" => supervisor.stop(tier, stage).await,
        "restart" => {
            supervisor.restart(tier, stage).await?;
            true
        }
        other => {
            return Err(ApiError::BadRequest(format!(
                "unknown pool action {}; expected start, stop or restart",
                other
            )))
        }
    };

    Ok(Json(PoolActionResponse {
        action,
        changed,
        status: supervisor.status(tier, stage).await,
    }))
}

pub async fn list_queues(State(state): State<AppState>) -> Result<Json<Vec<QueueDepth>>, ApiError> {
    Ok(Json(state.pipeline.router.depths().await?))
}
