use crate::error::{ApiError, ApiResult};
use crate::state::SharedState;
use axum::{
    extract::{Path, State},
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};
use signet_core::types::connection_token::ConnectionToken;
use signet_core::types::policy::{Policy, PolicyRule};

#[derive(Debug, Deserialize)]
pub struct MintTokenBody {
    /// Key the token binds to.
    pub key: String,
    /// Optional permission bundle materialized on redemption.
    #[serde(default)]
    pub policy: Option<MintPolicy>,
    #[serde(default)]
    pub ttl_secs: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct MintPolicy {
    pub name: String,
    pub rules: Vec<PolicyRule>,
}

/// POST /tokens
pub async fn mint_token(
    State(state): State<SharedState>,
    Json(body): Json<MintTokenBody>,
) -> ApiResult<Json<ConnectionToken>> {
    if state.vault.keys_for(&body.key).await.is_none() {
        return Err(ApiError::not_found(format!(
            "No online key named '{}'",
            body.key
        )));
    }

    let policy_id = match body.policy {
        Some(mint) => Some(Policy::create(&state.pool, &mint.name, &mint.rules).await?.id),
        None => None,
    };

    let token = ConnectionToken::mint(&state.pool, &body.key, policy_id, body.ttl_secs).await?;
    Ok(Json(token))
}

/// GET /tokens
pub async fn list_tokens(
    State(state): State<SharedState>,
) -> ApiResult<Json<Vec<ConnectionToken>>> {
    Ok(Json(ConnectionToken::list(&state.pool).await?))
}

/// DELETE /tokens/:id
pub async fn delete_token(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> ApiResult<Json<Value>> {
    ConnectionToken::delete(&state.pool, id).await?;
    Ok(Json(json!({ "ok": true })))
}
