use chrono::{DateTime, Duration, Utc};
use rand::RngCore;
use serde::Serialize;
use sqlx::{FromRow, SqlitePool};
use thiserror::Error;

/// Default token lifetime.
pub const TOKEN_TTL_SECS: i64 = 300;

#[derive(Error, Debug)]
pub enum TokenError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Token not found")]
    NotFound,
}

/// One-shot secret bound to a key. Redemption is atomic: the
/// conditional update claims the row, and `redeemed_at` is only ever
/// cleared by the rollback path of a failed materialization.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct ConnectionToken {
    pub id: i64,
    pub key_name: String,
    pub token: String,
    pub policy_id: Option<i64>,
    pub key_user_id: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub redeemed_at: Option<DateTime<Utc>>,
}

impl ConnectionToken {
    pub async fn mint(
        pool: &SqlitePool,
        key_name: &str,
        policy_id: Option<i64>,
        ttl_secs: Option<i64>,
    ) -> Result<Self, TokenError> {
        let mut secret = [0u8; 16];
        rand::rngs::OsRng.fill_bytes(&mut secret);
        let token = hex::encode(secret);

        let now = Utc::now();
        let expires_at = now + Duration::seconds(ttl_secs.unwrap_or(TOKEN_TTL_SECS));

        let id = sqlx::query_scalar::<_, i64>(
            "INSERT INTO connection_tokens (key_name, token, policy_id, created_at, expires_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             RETURNING id",
        )
        .bind(key_name)
        .bind(&token)
        .bind(policy_id)
        .bind(now)
        .bind(expires_at)
        .fetch_one(pool)
        .await?;

        Self::find(pool, id).await
    }

    pub async fn find(pool: &SqlitePool, id: i64) -> Result<Self, TokenError> {
        sqlx::query_as::<_, ConnectionToken>("SELECT * FROM connection_tokens WHERE id = ?1")
            .bind(id)
            .fetch_optional(pool)
            .await?
            .ok_or(TokenError::NotFound)
    }

    pub async fn list(pool: &SqlitePool) -> Result<Vec<Self>, TokenError> {
        let rows = sqlx::query_as::<_, ConnectionToken>(
            "SELECT * FROM connection_tokens ORDER BY created_at DESC",
        )
        .fetch_all(pool)
        .await?;
        Ok(rows)
    }

    pub async fn delete(pool: &SqlitePool, id: i64) -> Result<(), TokenError> {
        let result = sqlx::query("DELETE FROM connection_tokens WHERE id = ?1")
            .bind(id)
            .execute(pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(TokenError::NotFound);
        }
        Ok(())
    }

    /// Atomically claim an unredeemed, unexpired token for a key.
    /// Returns the claimed row, or None when the token is unknown,
    /// expired, or already redeemed. At most one concurrent caller wins.
    pub async fn redeem(
        pool: &SqlitePool,
        key_name: &str,
        token: &str,
    ) -> Result<Option<Self>, TokenError> {
        let now = Utc::now();
        let result = sqlx::query(
            "UPDATE connection_tokens SET redeemed_at = ?1
             WHERE key_name = ?2 AND token = ?3
               AND redeemed_at IS NULL AND expires_at > ?1",
        )
        .bind(now)
        .bind(key_name)
        .bind(token)
        .execute(pool)
        .await?;

        if result.rows_affected() != 1 {
            return Ok(None);
        }

        let row = sqlx::query_as::<_, ConnectionToken>(
            "SELECT * FROM connection_tokens WHERE key_name = ?1 AND token = ?2",
        )
        .bind(key_name)
        .bind(token)
        .fetch_one(pool)
        .await?;
        Ok(Some(row))
    }

    /// Tie a redeemed token to the app it created.
    pub async fn attach_user(
        pool: &SqlitePool,
        id: i64,
        key_user_id: i64,
    ) -> Result<(), TokenError> {
        sqlx::query("UPDATE connection_tokens SET key_user_id = ?1 WHERE id = ?2")
            .bind(key_user_id)
            .bind(id)
            .execute(pool)
            .await?;
        Ok(())
    }

    /// Roll back a claim after a failed materialization so the client
    /// may retry.
    pub async fn release(pool: &SqlitePool, id: i64) -> Result<(), TokenError> {
        sqlx::query(
            "UPDATE connection_tokens SET redeemed_at = NULL WHERE id = ?1 AND key_user_id IS NULL",
        )
        .bind(id)
        .execute(pool)
        .await?;
        Ok(())
    }

    pub async fn cleanup_expired(pool: &SqlitePool) -> Result<u64, TokenError> {
        let result = sqlx::query(
            "DELETE FROM connection_tokens WHERE redeemed_at IS NULL AND expires_at < ?1",
        )
        .bind(Utc::now())
        .execute(pool)
        .await?;
        Ok(result.rows_affected())
    }
}
