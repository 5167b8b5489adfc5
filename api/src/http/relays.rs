use crate::error::ApiResult;
use crate::state::SharedState;
use axum::{extract::State, Json};
use signet_signer::RelayHealth;

/// GET /relays: per-relay connection status from the pool.
pub async fn get_relays(State(state): State<SharedState>) -> ApiResult<Json<Vec<RelayHealth>>> {
    Ok(Json(state.relays.health_snapshot().await))
}
