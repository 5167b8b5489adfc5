use crate::error::ApiResult;
use crate::state::SharedState;
use axum::{
    extract::{Path, State},
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};
use signet_core::vault::KeyInfo;

#[derive(Debug, Deserialize)]
pub struct CreateKeyBody {
    pub name: String,
    #[serde(default)]
    pub passphrase: Option<String>,
    #[serde(default)]
    pub secret: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RenameKeyBody {
    pub name: String,
}

#[derive(Debug, Deserialize, Default)]
pub struct DeleteKeyBody {
    #[serde(default)]
    pub passphrase: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct PassphraseBody {
    pub passphrase: String,
}

/// GET /keys
pub async fn list_keys(State(state): State<SharedState>) -> ApiResult<Json<Vec<KeyInfo>>> {
    Ok(Json(state.vault.list().await?))
}

/// POST /keys
pub async fn create_key(
    State(state): State<SharedState>,
    Json(body): Json<CreateKeyBody>,
) -> ApiResult<Json<KeyInfo>> {
    let info = state
        .vault
        .create(&body.name, body.passphrase.as_deref(), body.secret.as_deref())
        .await?;
    Ok(Json(info))
}

/// PATCH /keys/:name — rename.
pub async fn rename_key(
    State(state): State<SharedState>,
    Path(name): Path<String>,
    Json(body): Json<RenameKeyBody>,
) -> ApiResult<Json<Value>> {
    state.vault.rename(&name, &body.name).await?;
    // Cached ACL entries are keyed by the old name.
    state.acl.invalidate_key(&name);
    Ok(Json(json!({ "ok": true })))
}

/// DELETE /keys/:name — passphrase proof required for encrypted keys.
pub async fn delete_key(
    State(state): State<SharedState>,
    Path(name): Path<String>,
    body: Option<Json<DeleteKeyBody>>,
) -> ApiResult<Json<Value>> {
    let passphrase = body.and_then(|Json(b)| b.passphrase);
    let revoked = state.vault.delete(&name, passphrase.as_deref()).await?;
    state.acl.invalidate_key(&name);
    Ok(Json(json!({ "ok": true, "revoked": revoked })))
}

/// POST /keys/:name/unlock
pub async fn unlock_key(
    State(state): State<SharedState>,
    Path(name): Path<String>,
    Json(body): Json<PassphraseBody>,
) -> ApiResult<Json<KeyInfo>> {
    let info = state.vault.unlock(&name, &body.passphrase).await?;
    Ok(Json(info))
}

/// POST /keys/:name/set-passphrase
pub async fn set_passphrase(
    State(state): State<SharedState>,
    Path(name): Path<String>,
    Json(body): Json<PassphraseBody>,
) -> ApiResult<Json<Value>> {
    state.vault.set_passphrase(&name, &body.passphrase).await?;
    Ok(Json(json!({ "ok": true })))
}
