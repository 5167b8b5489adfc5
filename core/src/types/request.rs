use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};
use thiserror::Error;
use uuid::Uuid;

/// How long an undecided request stays actionable.
pub const PENDING_TTL_SECS: i64 = 60;

#[derive(Error, Debug)]
pub enum RequestError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Request not found")]
    NotFound,

    #[error("Request already processed")]
    AlreadyProcessed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestStatus {
    Pending,
    Approved,
    Denied,
    Expired,
}

/// Record of one inbound NIP-46 call. `allowed` is NULL while pending;
/// a row past its TTL with `allowed` still NULL reads as expired but
/// remains inspectable.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Request {
    pub id: String,
    pub key_name: String,
    pub user_pubkey: String,
    pub method: String,
    pub params: String,
    pub allowed: Option<bool>,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

impl Request {
    pub fn status(&self, now: DateTime<Utc>) -> RequestStatus {
        match self.allowed {
            Some(true) => RequestStatus::Approved,
            Some(false) => RequestStatus::Denied,
            None => {
                if now - self.created_at >= Duration::seconds(PENDING_TTL_SECS) {
                    RequestStatus::Expired
                } else {
                    RequestStatus::Pending
                }
            }
        }
    }

    pub async fn insert(
        pool: &SqlitePool,
        key_name: &str,
        user_pubkey: &str,
        method: &str,
        params: &str,
    ) -> Result<Self, RequestError> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now();

        sqlx::query(
            "INSERT INTO requests (id, key_name, user_pubkey, method, params, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )
        .bind(&id)
        .bind(key_name)
        .bind(user_pubkey)
        .bind(method)
        .bind(params)
        .bind(now)
        .execute(pool)
        .await?;

        Self::find(pool, &id).await
    }

    pub async fn find(pool: &SqlitePool, id: &str) -> Result<Self, RequestError> {
        sqlx::query_as::<_, Request>("SELECT * FROM requests WHERE id = ?1")
            .bind(id)
            .fetch_optional(pool)
            .await?
            .ok_or(RequestError::NotFound)
    }

    /// Record a decision. The conditional update is the linearization
    /// point: of two concurrent calls only one sees `allowed IS NULL`,
    /// and a row past its TTL is no longer decidable.
    pub async fn decide(pool: &SqlitePool, id: &str, allow: bool) -> Result<Self, RequestError> {
        let now = Utc::now();
        let cutoff = now - Duration::seconds(PENDING_TTL_SECS);

        let result = sqlx::query(
            "UPDATE requests SET allowed = ?1, processed_at = ?2
             WHERE id = ?3 AND allowed IS NULL AND created_at > ?4",
        )
        .bind(allow)
        .bind(now)
        .bind(id)
        .bind(cutoff)
        .execute(pool)
        .await?;

        if result.rows_affected() == 0 {
            // Either missing, already decided, or expired.
            Self::find(pool, id).await?;
            return Err(RequestError::AlreadyProcessed);
        }

        Self::find(pool, id).await
    }

    pub async fn list(
        pool: &SqlitePool,
        status: Option<RequestStatus>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Self>, RequestError> {
        let cutoff = Utc::now() - Duration::seconds(PENDING_TTL_SECS);
        let rows = match status {
            Some(RequestStatus::Pending) => {
                sqlx::query_as::<_, Request>(
                    "SELECT * FROM requests
                     WHERE allowed IS NULL AND created_at > ?1
                     ORDER BY created_at DESC LIMIT ?2 OFFSET ?3",
                )
                .bind(cutoff)
                .bind(limit)
                .bind(offset)
                .fetch_all(pool)
                .await?
            }
            Some(RequestStatus::Approved) => {
                sqlx::query_as::<_, Request>(
                    "SELECT * FROM requests
                     WHERE allowed = 1
                     ORDER BY created_at DESC LIMIT ?1 OFFSET ?2",
                )
                .bind(limit)
                .bind(offset)
                .fetch_all(pool)
                .await?
            }
            Some(RequestStatus::Denied) => {
                sqlx::query_as::<_, Request>(
                    "SELECT * FROM requests
                     WHERE allowed = 0
                     ORDER BY created_at DESC LIMIT ?1 OFFSET ?2",
                )
                .bind(limit)
                .bind(offset)
                .fetch_all(pool)
                .await?
            }
            Some(RequestStatus::Expired) => {
                sqlx::query_as::<_, Request>(
                    "SELECT * FROM requests
                     WHERE allowed IS NULL AND created_at <= ?1
                     ORDER BY created_at DESC LIMIT ?2 OFFSET ?3",
                )
                .bind(cutoff)
                .bind(limit)
                .bind(offset)
                .fetch_all(pool)
                .await?
            }
            None => {
                sqlx::query_as::<_, Request>(
                    "SELECT * FROM requests ORDER BY created_at DESC LIMIT ?1 OFFSET ?2",
                )
                .bind(limit)
                .bind(offset)
                .fetch_all(pool)
                .await?
            }
        };
        Ok(rows)
    }

    pub async fn count_pending(pool: &SqlitePool) -> Result<i64, RequestError> {
        let cutoff = Utc::now() - Duration::seconds(PENDING_TTL_SECS);
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM requests WHERE allowed IS NULL AND created_at > ?1",
        )
        .bind(cutoff)
        .fetch_one(pool)
        .await?;
        Ok(count)
    }

    /// Bulk-delete expired pending rows older than the given cutoff.
    /// Audit survives in the activity table, written at decision time.
    pub async fn cleanup_expired(
        pool: &SqlitePool,
        older_than: DateTime<Utc>,
    ) -> Result<u64, RequestError> {
        let result =
            sqlx::query("DELETE FROM requests WHERE allowed IS NULL AND created_at < ?1")
                .bind(older_than)
                .execute(pool)
                .await?;
        Ok(result.rows_affected())
    }

    /// Rows that were still pending when the process died are expired on
    /// the next boot; no waker exists for them anymore.
    pub async fn expire_stale_on_boot(pool: &SqlitePool) -> Result<u64, RequestError> {
        let cutoff = Utc::now() - Duration::seconds(PENDING_TTL_SECS);
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM requests WHERE allowed IS NULL AND created_at <= ?1",
        )
        .bind(cutoff)
        .fetch_one(pool)
        .await?;
        Ok(count as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::Database;

    #[tokio::test]
    async fn test_decide_once() {
        let db = Database::connect_in_memory().await.unwrap();
        let req = Request::insert(&db.pool, "alice", "pk1", "sign_event", "[]")
            .await
            .unwrap();
        assert_eq!(req.status(Utc::now()), RequestStatus::Pending);

        let approved = Request::decide(&db.pool, &req.id, true).await.unwrap();
        assert_eq!(approved.allowed, Some(true));
        assert!(approved.processed_at.is_some());

        let err = Request::decide(&db.pool, &req.id, false).await.unwrap_err();
        assert!(matches!(err, RequestError::AlreadyProcessed));
    }

    #[tokio::test]
    async fn test_decide_missing_is_not_found() {
        let db = Database::connect_in_memory().await.unwrap();
        let err = Request::decide(&db.pool, "nope", true).await.unwrap_err();
        assert!(matches!(err, RequestError::NotFound));
    }

    #[tokio::test]
    async fn test_expired_rows_are_not_decidable() {
        let db = Database::connect_in_memory().await.unwrap();
        let req = Request::insert(&db.pool, "alice", "pk1", "ping", "[]")
            .await
            .unwrap();

        // Age the row past the TTL.
        sqlx::query("UPDATE requests SET created_at = ?1 WHERE id = ?2")
            .bind(Utc::now() - Duration::seconds(PENDING_TTL_SECS + 5))
            .bind(&req.id)
            .execute(&db.pool)
            .await
            .unwrap();

        let err = Request::decide(&db.pool, &req.id, true).await.unwrap_err();
        assert!(matches!(err, RequestError::AlreadyProcessed));

        let listed = Request::list(&db.pool, Some(RequestStatus::Expired), 10, 0)
            .await
            .unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].status(Utc::now()), RequestStatus::Expired);
    }

    #[tokio::test]
    async fn test_cleanup_preserves_decided_rows() {
        let db = Database::connect_in_memory().await.unwrap();
        let pending = Request::insert(&db.pool, "alice", "pk1", "ping", "[]")
            .await
            .unwrap();
        let decided = Request::insert(&db.pool, "alice", "pk1", "ping", "[]")
            .await
            .unwrap();
        Request::decide(&db.pool, &decided.id, true).await.unwrap();

        let old = Utc::now() - Duration::seconds(PENDING_TTL_SECS * 3);
        sqlx::query("UPDATE requests SET created_at = ?1")
            .bind(old)
            .execute(&db.pool)
            .await
            .unwrap();

        let removed = Request::cleanup_expired(&db.pool, Utc::now()).await.unwrap();
        assert_eq!(removed, 1);
        assert!(Request::find(&db.pool, &pending.id).await.is_err());
        assert!(Request::find(&db.pool, &decided.id).await.is_ok());
    }
}
