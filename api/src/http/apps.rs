use crate::error::ApiResult;
use crate::state::SharedState;
use axum::{
    extract::{Path, Query, State},
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use signet_core::bus::Topic;
use signet_core::types::activity::Activity;
use signet_core::types::key_user::{KeyUser, TrustLevel};
use signet_core::types::signing_condition::SigningCondition;

#[derive(Debug, Deserialize)]
pub struct ListAppsQuery {
    #[serde(default)]
    pub key: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct AppView {
    #[serde(flatten)]
    pub user: KeyUser,
    pub conditions: Vec<SigningCondition>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateAppBody {
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub trust_level: Option<TrustLevel>,
}

#[derive(Debug, Deserialize, Default)]
pub struct SuspendBody {
    #[serde(default)]
    pub until: Option<DateTime<Utc>>,
}

/// GET /apps[?key=name]
pub async fn list_apps(
    State(state): State<SharedState>,
    Query(query): Query<ListAppsQuery>,
) -> ApiResult<Json<Vec<AppView>>> {
    let users = KeyUser::list(&state.pool, query.key.as_deref()).await?;
    let mut views = Vec::with_capacity(users.len());
    for user in users {
        let conditions = SigningCondition::list_for_user(&state.pool, user.id).await?;
        views.push(AppView { user, conditions });
    }
    Ok(Json(views))
}

/// PATCH /apps/:id — description and/or trust level.
pub async fn update_app(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
    Json(body): Json<UpdateAppBody>,
) -> ApiResult<Json<KeyUser>> {
    let updated = KeyUser::update(
        &state.pool,
        id,
        body.description.as_deref(),
        body.trust_level,
    )
    .await?;
    state
        .acl
        .invalidate(&updated.key_name, &updated.user_pubkey)
        .await;
    Ok(Json(updated))
}

/// POST /apps/:id/revoke — permanent; the cache is flushed in the same
/// call so the very next request from that pubkey is denied.
pub async fn revoke_app(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> ApiResult<Json<Value>> {
    let user = KeyUser::find(&state.pool, id).await?;
    KeyUser::revoke(&state.pool, id).await?;
    state
        .acl
        .invalidate(&user.key_name, &user.user_pubkey)
        .await;

    Activity::record(&state.pool, "app_revoked", None, None, Some(id), None).await?;
    state.bus.publish(
        Topic::AppRevoked,
        json!({ "id": id, "key": user.key_name, "pubkey": user.user_pubkey }),
    );
    Ok(Json(json!({ "ok": true })))
}

/// POST /apps/:id/suspend — time-bounded with `until`, else indefinite.
pub async fn suspend_app(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
    body: Option<Json<SuspendBody>>,
) -> ApiResult<Json<Value>> {
    let until = body.and_then(|Json(b)| b.until);
    let user = KeyUser::find(&state.pool, id).await?;
    KeyUser::suspend(&state.pool, id, until).await?;
    state
        .acl
        .invalidate(&user.key_name, &user.user_pubkey)
        .await;
    Ok(Json(json!({ "ok": true })))
}

/// POST /apps/:id/unsuspend
pub async fn unsuspend_app(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> ApiResult<Json<Value>> {
    let user = KeyUser::find(&state.pool, id).await?;
    KeyUser::unsuspend(&state.pool, id).await?;
    state
        .acl
        .invalidate(&user.key_name, &user.user_pubkey)
        .await;
    Ok(Json(json!({ "ok": true })))
}
