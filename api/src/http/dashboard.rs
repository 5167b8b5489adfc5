use crate::error::ApiResult;
use crate::state::SharedState;
use axum::{extract::State, Json};
use serde::Serialize;
use signet_core::types::activity::{Activity, ActivityStats};
use signet_core::types::key_user::KeyUser;
use signet_core::types::request::Request;

const RECENT_LIMIT: i64 = 20;

#[derive(Debug, Serialize)]
pub struct DashboardResponse {
    pub stats: ActivityStats,
    pub pending: i64,
    pub apps: i64,
    pub recent: Vec<Activity>,
    pub hourly: [i64; 24],
}

/// GET /dashboard: aggregate stats, recent activity, and the 24-hour
/// histogram the dashboard renders.
pub async fn get_dashboard(
    State(state): State<SharedState>,
) -> ApiResult<Json<DashboardResponse>> {
    let stats = Activity::stats(&state.pool).await?;
    let pending = Request::count_pending(&state.pool).await?;
    let apps = KeyUser::list(&state.pool, None)
        .await?
        .into_iter()
        .filter(|u| u.revoked_at.is_none())
        .count() as i64;
    let recent = Activity::recent(&state.pool, RECENT_LIMIT).await?;
    let hourly = Activity::hourly_histogram(&state.pool).await?;

    Ok(Json(DashboardResponse {
        stats,
        pending,
        apps,
        recent,
        hourly,
    }))
}
