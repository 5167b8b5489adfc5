use crate::error::{ApiError, ApiResult};
use crate::state::SharedState;
use axum::{
    extract::{Path, Query, State},
    Json,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use signet_core::pending::ApproveScope;
use signet_core::types::key_user::TrustLevel;
use signet_core::types::request::{Request, RequestStatus};

const DEFAULT_LIMIT: i64 = 50;
const MAX_LIMIT: i64 = 500;

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    #[serde(default)]
    pub status: Option<RequestStatus>,
    #[serde(default)]
    pub limit: Option<i64>,
    #[serde(default)]
    pub offset: Option<i64>,
}

#[derive(Debug, Deserialize, Default)]
pub struct GetQuery {
    /// Long-poll until decided or expired.
    #[serde(default)]
    pub wait: Option<u8>,
}

#[derive(Debug, Serialize)]
pub struct RequestView {
    #[serde(flatten)]
    pub request: Request,
    pub status: RequestStatus,
}

impl From<Request> for RequestView {
    fn from(request: Request) -> Self {
        let status = request.status(Utc::now());
        Self { request, status }
    }
}

#[derive(Debug, Deserialize)]
pub struct DecisionBody {
    pub allow: bool,
    #[serde(default)]
    pub always_allow: bool,
    #[serde(default)]
    pub trust_level: Option<TrustLevel>,
}

#[derive(Debug, Deserialize)]
pub struct BatchBody {
    pub ids: Vec<String>,
    pub allow: bool,
}

/// GET /requests?status=&limit=&offset=
pub async fn list_requests(
    State(state): State<SharedState>,
    Query(query): Query<ListQuery>,
) -> ApiResult<Json<Vec<RequestView>>> {
    let limit = query.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT);
    let offset = query.offset.unwrap_or(0).max(0);
    let rows = Request::list(&state.pool, query.status, limit, offset).await?;
    Ok(Json(rows.into_iter().map(RequestView::from).collect()))
}

/// GET /requests/:id[?wait=1] — with `wait` the response blocks until
/// the request is decided or its TTL fires (polling fallback for
/// clients without an SSE stream).
pub async fn get_request(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Query(query): Query<GetQuery>,
) -> ApiResult<Json<RequestView>> {
    if query.wait.unwrap_or(0) != 0 {
        state.pending.wait_polling(&id).await?;
    }
    let request = Request::find(&state.pool, &id).await?;
    Ok(Json(request.into()))
}

/// POST /requests/:id {allow, always_allow?, trust_level?}
pub async fn decide_request(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Json(body): Json<DecisionBody>,
) -> ApiResult<Json<RequestView>> {
    let request = if body.allow {
        state
            .pending
            .approve(
                &id,
                ApproveScope {
                    always_allow: body.always_allow,
                    trust_level: body.trust_level,
                },
            )
            .await?
    } else {
        if body.always_allow {
            return Err(ApiError::bad_request(
                "always_allow only applies to approvals",
            ));
        }
        state.pending.deny(&id).await?
    };
    Ok(Json(request.into()))
}

/// POST /requests/batch {ids, allow} — per-id outcomes; a decided or
/// missing id does not abort the rest.
pub async fn decide_batch(
    State(state): State<SharedState>,
    Json(body): Json<BatchBody>,
) -> ApiResult<Json<Value>> {
    if body.ids.is_empty() {
        return Err(ApiError::bad_request("ids must not be empty"));
    }

    let mut outcomes = Vec::with_capacity(body.ids.len());
    for id in &body.ids {
        let result = if body.allow {
            state.pending.approve(id, ApproveScope::default()).await
        } else {
            state.pending.deny(id).await
        };
        outcomes.push(json!({
            "id": id,
            "ok": result.is_ok(),
            "error": result.err().map(|e| e.to_string()),
        }));
    }
    Ok(Json(json!({ "results": outcomes })))
}
