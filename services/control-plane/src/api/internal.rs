//! Operator endpoints that poke the reconciler for one workspace.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::post,
    Json, Router,
};
use fleet_id::WorkspaceId;
use serde::Serialize;
use tracing::info;

use super::error::ApiError;
use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/workspaces/{workspace_id}/sync", post(sync))
        .route("/workspaces/{workspace_id}/recover", post(recover))
}

#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct RecoverResponse {
    pub workspace_id: String,
    pub recovered: bool,
}

fn parse_id(raw: &str) -> Result<WorkspaceId, ApiError> {
    raw.parse()
        .map_err(|e| ApiError::bad_request("invalid_workspace_id", format!("{raw}: {e}")))
}

async fn sync(
    State(state): State<AppState>,
    Path(workspace_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let id = parse_id(&workspace_id)?;
    state.manager().request_sync(id);
    Ok(StatusCode::ACCEPTED)
}

async fn recover(
    State(state): State<AppState>,
    Path(workspace_id): Path<String>,
) -> Result<Json<RecoverResponse>, ApiError> {
    let id = parse_id(&workspace_id)?;
    let recovered = state.manager().recover(id).await?;
    info!(workspace_id = %id, recovered, "Recovery requested");
    Ok(Json(RecoverResponse {
        workspace_id: id.to_string(),
        recovered,
    }))
}
