use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ActivityError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// How a request came to be approved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum ApprovalType {
    Manual,
    AutoTrust,
    AutoPermission,
}

/// Append-only audit row. Approvals, denials, auto-approvals, app
/// registrations, and relay publish failures all land here.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Activity {
    pub id: i64,
    pub log_type: String,
    pub method: Option<String>,
    pub params: Option<String>,
    pub key_user_id: Option<i64>,
    pub approval_type: Option<ApprovalType>,
    pub created_at: DateTime<Utc>,
}

/// Aggregate counters for the dashboard.
#[derive(Debug, Clone, Serialize, Default)]
pub struct ActivityStats {
    pub approvals: i64,
    pub denials: i64,
    pub auto_approvals: i64,
}

impl Activity {
    /// Long params are truncated; the audit trail is not a payload store.
    const MAX_PARAMS: usize = 500;

    pub async fn record(
        pool: &SqlitePool,
        log_type: &str,
        method: Option<&str>,
        params: Option<&str>,
        key_user_id: Option<i64>,
        approval_type: Option<ApprovalType>,
    ) -> Result<(), ActivityError> {
        let truncated = params.map(|p| {
            if p.len() > Self::MAX_PARAMS {
                let mut end = Self::MAX_PARAMS;
                while !p.is_char_boundary(end) {
                    end -= 1;
                }
                format!("{}... (truncated)", &p[..end])
            } else {
                p.to_string()
            }
        });

        sqlx::query(
            "INSERT INTO activity (log_type, method, params, key_user_id, approval_type, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )
        .bind(log_type)
        .bind(method)
        .bind(truncated)
        .bind(key_user_id)
        .bind(approval_type)
        .bind(Utc::now())
        .execute(pool)
        .await?;
        Ok(())
    }

    pub async fn recent(pool: &SqlitePool, limit: i64) -> Result<Vec<Self>, ActivityError> {
        let rows = sqlx::query_as::<_, Activity>(
            "SELECT * FROM activity ORDER BY created_at DESC LIMIT ?1",
        )
        .bind(limit)
        .fetch_all(pool)
        .await?;
        Ok(rows)
    }

    pub async fn stats(pool: &SqlitePool) -> Result<ActivityStats, ActivityError> {
        let approvals = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM activity WHERE log_type = 'request_approved'",
        )
        .fetch_one(pool)
        .await?;
        let denials = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM activity WHERE log_type = 'request_denied'",
        )
        .fetch_one(pool)
        .await?;
        let auto_approvals = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM activity
             WHERE approval_type IN ('auto_trust', 'auto_permission')",
        )
        .fetch_one(pool)
        .await?;

        Ok(ActivityStats {
            approvals,
            denials,
            auto_approvals,
        })
    }

    /// 24 hourly buckets covering the last day, oldest first.
    pub async fn hourly_histogram(pool: &SqlitePool) -> Result<[i64; 24], ActivityError> {
        let since = Utc::now() - Duration::hours(24);
        let rows = sqlx::query_scalar::<_, DateTime<Utc>>(
            "SELECT created_at FROM activity WHERE created_at >= ?1",
        )
        .bind(since)
        .fetch_all(pool)
        .await?;

        let mut buckets = [0i64; 24];
        let now = Utc::now();
        for created_at in rows {
            let age_hours = (now - created_at).num_hours().clamp(0, 23) as usize;
            buckets[23 - age_hours] += 1;
        }
        Ok(buckets)
    }

    pub async fn count_since_for_key(
        pool: &SqlitePool,
        key_name: &str,
        since: DateTime<Utc>,
    ) -> Result<i64, ActivityError> {
        // Activity rows do not carry a key name; join through the app.
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM activity a
             JOIN key_users u ON u.id = a.key_user_id
             WHERE u.key_name = ?1 AND a.created_at >= ?2",
        )
        .bind(key_name)
        .bind(since)
        .fetch_one(pool)
        .await?;
        Ok(count)
    }
}
