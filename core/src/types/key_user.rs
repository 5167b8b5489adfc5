use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum KeyUserError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("App not found")]
    NotFound,

    #[error("App is already revoked")]
    AlreadyRevoked,
}

/// Per-app policy tier governing automatic approval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum TrustLevel {
    /// Ask a human for every request.
    Paranoid,
    /// Auto-approve low-risk event kinds; ask for everything else.
    Reasonable,
    /// Auto-approve everything.
    Full,
}

/// A remote client (app) that has been introduced to a custodied key,
/// identified by its own pubkey. At most one non-revoked row exists per
/// (key_name, user_pubkey); revocation is permanent, suspension is
/// time-bounded or indefinite.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct KeyUser {
    pub id: i64,
    pub key_name: String,
    pub user_pubkey: String,
    pub description: Option<String>,
    pub trust_level: TrustLevel,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub revoked_at: Option<DateTime<Utc>>,
    pub suspended_at: Option<DateTime<Utc>>,
    pub suspend_until: Option<DateTime<Utc>>,
}

impl KeyUser {
    pub fn is_suspended(&self, now: DateTime<Utc>) -> bool {
        match (self.suspended_at, self.suspend_until) {
            (None, _) => false,
            (Some(_), None) => true,
            (Some(_), Some(until)) => until > now,
        }
    }

    pub async fn find(pool: &SqlitePool, id: i64) -> Result<Self, KeyUserError> {
        sqlx::query_as::<_, KeyUser>("SELECT * FROM key_users WHERE id = ?1")
            .bind(id)
            .fetch_optional(pool)
            .await?
            .ok_or(KeyUserError::NotFound)
    }

    /// The live (non-revoked) binding for a (key, remote pubkey) pair.
    pub async fn find_active(
        pool: &SqlitePool,
        key_name: &str,
        user_pubkey: &str,
    ) -> Result<Option<Self>, KeyUserError> {
        let user = sqlx::query_as::<_, KeyUser>(
            "SELECT * FROM key_users
             WHERE key_name = ?1 AND user_pubkey = ?2 AND revoked_at IS NULL",
        )
        .bind(key_name)
        .bind(user_pubkey)
        .fetch_optional(pool)
        .await?;
        Ok(user)
    }

    /// The most recent binding for the pair, live or revoked. The ACL
    /// evaluator uses this so a revoked app reads as denied rather than
    /// as first contact.
    pub async fn find_latest(
        pool: &SqlitePool,
        key_name: &str,
        user_pubkey: &str,
    ) -> Result<Option<Self>, KeyUserError> {
        let user = sqlx::query_as::<_, KeyUser>(
            "SELECT * FROM key_users
             WHERE key_name = ?1 AND user_pubkey = ?2
             ORDER BY (revoked_at IS NULL) DESC, created_at DESC
             LIMIT 1",
        )
        .bind(key_name)
        .bind(user_pubkey)
        .fetch_optional(pool)
        .await?;
        Ok(user)
    }

    pub async fn create(
        pool: &SqlitePool,
        key_name: &str,
        user_pubkey: &str,
        trust_level: TrustLevel,
        description: Option<&str>,
    ) -> Result<Self, KeyUserError> {
        let now = Utc::now();
        let id = sqlx::query_scalar::<_, i64>(
            "INSERT INTO key_users
             (key_name, user_pubkey, description, trust_level, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?5)
             RETURNING id",
        )
        .bind(key_name)
        .bind(user_pubkey)
        .bind(description)
        .bind(trust_level)
        .bind(now)
        .fetch_one(pool)
        .await?;

        Self::find(pool, id).await
    }

    /// Fetch the live binding or create one at the given trust level.
    pub async fn get_or_create(
        pool: &SqlitePool,
        key_name: &str,
        user_pubkey: &str,
        trust_level: TrustLevel,
    ) -> Result<Self, KeyUserError> {
        if let Some(existing) = Self::find_active(pool, key_name, user_pubkey).await? {
            return Ok(existing);
        }
        Self::create(pool, key_name, user_pubkey, trust_level, None).await
    }

    pub async fn list(
        pool: &SqlitePool,
        key_name: Option<&str>,
    ) -> Result<Vec<Self>, KeyUserError> {
        let users = match key_name {
            Some(name) => {
                sqlx::query_as::<_, KeyUser>(
                    "SELECT * FROM key_users WHERE key_name = ?1 ORDER BY created_at DESC",
                )
                .bind(name)
                .fetch_all(pool)
                .await?
            }
            None => {
                sqlx::query_as::<_, KeyUser>("SELECT * FROM key_users ORDER BY created_at DESC")
                    .fetch_all(pool)
                    .await?
            }
        };
        Ok(users)
    }

    pub async fn count_active_for_key(
        pool: &SqlitePool,
        key_name: &str,
    ) -> Result<i64, KeyUserError> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM key_users WHERE key_name = ?1 AND revoked_at IS NULL",
        )
        .bind(key_name)
        .fetch_one(pool)
        .await?;
        Ok(count)
    }

    pub async fn update(
        pool: &SqlitePool,
        id: i64,
        description: Option<&str>,
        trust_level: Option<TrustLevel>,
    ) -> Result<Self, KeyUserError> {
        let current = Self::find(pool, id).await?;
        let trust = trust_level.unwrap_or(current.trust_level);
        let desc = description.or(current.description.as_deref());

        sqlx::query(
            "UPDATE key_users SET description = ?1, trust_level = ?2, updated_at = ?3 WHERE id = ?4",
        )
        .bind(desc)
        .bind(trust)
        .bind(Utc::now())
        .bind(id)
        .execute(pool)
        .await?;

        Self::find(pool, id).await
    }

    /// Revocation is permanent; a second revoke is an error.
    pub async fn revoke(pool: &SqlitePool, id: i64) -> Result<(), KeyUserError> {
        let result = sqlx::query(
            "UPDATE key_users SET revoked_at = ?1, updated_at = ?1
             WHERE id = ?2 AND revoked_at IS NULL",
        )
        .bind(Utc::now())
        .bind(id)
        .execute(pool)
        .await?;

        if result.rows_affected() == 0 {
            // Distinguish a missing row from one already revoked.
            Self::find(pool, id).await?;
            return Err(KeyUserError::AlreadyRevoked);
        }
        Ok(())
    }

    /// Mass-revoke on key deletion. Returns the number of rows revoked.
    pub async fn revoke_all_for_key(
        pool: &SqlitePool,
        key_name: &str,
    ) -> Result<u64, KeyUserError> {
        let result = sqlx::query(
            "UPDATE key_users SET revoked_at = ?1, updated_at = ?1
             WHERE key_name = ?2 AND revoked_at IS NULL",
        )
        .bind(Utc::now())
        .bind(key_name)
        .execute(pool)
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn suspend(
        pool: &SqlitePool,
        id: i64,
        until: Option<DateTime<Utc>>,
    ) -> Result<(), KeyUserError> {
        let result = sqlx::query(
            "UPDATE key_users SET suspended_at = ?1, suspend_until = ?2, updated_at = ?1
             WHERE id = ?3 AND revoked_at IS NULL",
        )
        .bind(Utc::now())
        .bind(until)
        .bind(id)
        .execute(pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(KeyUserError::NotFound);
        }
        Ok(())
    }

    pub async fn unsuspend(pool: &SqlitePool, id: i64) -> Result<(), KeyUserError> {
        let result = sqlx::query(
            "UPDATE key_users SET suspended_at = NULL, suspend_until = NULL, updated_at = ?1
             WHERE id = ?2",
        )
        .bind(Utc::now())
        .bind(id)
        .execute(pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(KeyUserError::NotFound);
        }
        Ok(())
    }

    /// Best-effort bookkeeping on permitted requests; callers spawn this
    /// so a slow write never blocks the signing path.
    pub async fn touch_last_used(pool: &SqlitePool, id: i64) -> Result<(), KeyUserError> {
        sqlx::query("UPDATE key_users SET last_used_at = ?1 WHERE id = ?2")
            .bind(Utc::now())
            .bind(id)
            .execute(pool)
            .await?;
        Ok(())
    }
}
