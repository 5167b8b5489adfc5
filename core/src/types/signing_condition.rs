use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{FromRow, SqlitePool};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConditionError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Explicit ACL rule attached to an app, overriding its trust-level
/// default for one `(method, kind?)`. `method = '*'` with `allow =
/// false` blocks everything; `kind = 'all'` matches any event kind.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct SigningCondition {
    pub id: i64,
    pub key_user_id: i64,
    pub method: String,
    pub kind: Option<String>,
    pub allow: bool,
    pub created_at: DateTime<Utc>,
}

impl SigningCondition {
    pub async fn list_for_user(
        pool: &SqlitePool,
        key_user_id: i64,
    ) -> Result<Vec<Self>, ConditionError> {
        let rows = sqlx::query_as::<_, SigningCondition>(
            "SELECT * FROM signing_conditions WHERE key_user_id = ?1 ORDER BY id",
        )
        .bind(key_user_id)
        .fetch_all(pool)
        .await?;
        Ok(rows)
    }

    pub async fn has_global_deny(
        pool: &SqlitePool,
        key_user_id: i64,
    ) -> Result<bool, ConditionError> {
        let exists = sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS(
                 SELECT 1 FROM signing_conditions
                 WHERE key_user_id = ?1 AND method = '*' AND allow = 0
             )",
        )
        .bind(key_user_id)
        .fetch_one(pool)
        .await?;
        Ok(exists)
    }

    /// Look up the explicit decision for one call. For `sign_event` the
    /// event kind participates ('all' matches any); other methods match
    /// on the method alone. An exact-kind row beats an 'all' row; a deny
    /// beats an allow of the same specificity.
    pub async fn match_decision(
        pool: &SqlitePool,
        key_user_id: i64,
        method: &str,
        kind: Option<u16>,
    ) -> Result<Option<bool>, ConditionError> {
        let decision = if method == "sign_event" {
            let kind_str = kind.map(|k| k.to_string()).unwrap_or_default();
            sqlx::query_scalar::<_, bool>(
                "SELECT allow FROM signing_conditions
                 WHERE key_user_id = ?1 AND method = ?2
                   AND (kind = ?3 OR kind = 'all')
                 ORDER BY CASE WHEN kind = ?3 THEN 0 ELSE 1 END, allow
                 LIMIT 1",
            )
            .bind(key_user_id)
            .bind(method)
            .bind(kind_str)
            .fetch_optional(pool)
            .await?
        } else {
            sqlx::query_scalar::<_, bool>(
                "SELECT allow FROM signing_conditions
                 WHERE key_user_id = ?1 AND method = ?2
                 ORDER BY allow
                 LIMIT 1",
            )
            .bind(key_user_id)
            .bind(method)
            .fetch_optional(pool)
            .await?
        };
        Ok(decision)
    }

    /// Insert an allow rule unless an identical one already exists.
    pub async fn ensure_allow(
        pool: &SqlitePool,
        key_user_id: i64,
        method: &str,
        kind: Option<&str>,
    ) -> Result<(), ConditionError> {
        let exists = sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS(
                 SELECT 1 FROM signing_conditions
                 WHERE key_user_id = ?1 AND method = ?2 AND kind IS ?3 AND allow = 1
             )",
        )
        .bind(key_user_id)
        .bind(method)
        .bind(kind)
        .fetch_one(pool)
        .await?;

        if !exists {
            sqlx::query(
                "INSERT INTO signing_conditions (key_user_id, method, kind, allow, created_at)
                 VALUES (?1, ?2, ?3, 1, ?4)",
            )
            .bind(key_user_id)
            .bind(method)
            .bind(kind)
            .bind(Utc::now())
            .execute(pool)
            .await?;
        }
        Ok(())
    }

    pub async fn insert(
        pool: &SqlitePool,
        key_user_id: i64,
        method: &str,
        kind: Option<&str>,
        allow: bool,
    ) -> Result<(), ConditionError> {
        sqlx::query(
            "INSERT INTO signing_conditions (key_user_id, method, kind, allow, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .bind(key_user_id)
        .bind(method)
        .bind(kind)
        .bind(allow)
        .bind(Utc::now())
        .execute(pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::Database;
    use crate::types::key_user::{KeyUser, TrustLevel};

    async fn setup() -> (Database, i64) {
        let db = Database::connect_in_memory().await.unwrap();
        let user = KeyUser::create(&db.pool, "alice", "pk1", TrustLevel::Reasonable, None)
            .await
            .unwrap();
        (db, user.id)
    }

    #[tokio::test]
    async fn test_exact_kind_beats_all() {
        let (db, uid) = setup().await;
        SigningCondition::insert(&db.pool, uid, "sign_event", Some("all"), true)
            .await
            .unwrap();
        SigningCondition::insert(&db.pool, uid, "sign_event", Some("4"), false)
            .await
            .unwrap();

        let kind4 = SigningCondition::match_decision(&db.pool, uid, "sign_event", Some(4))
            .await
            .unwrap();
        assert_eq!(kind4, Some(false));

        let kind1 = SigningCondition::match_decision(&db.pool, uid, "sign_event", Some(1))
            .await
            .unwrap();
        assert_eq!(kind1, Some(true));
    }

    #[tokio::test]
    async fn test_non_sign_methods_match_on_method_alone() {
        let (db, uid) = setup().await;
        SigningCondition::insert(&db.pool, uid, "nip44_decrypt", None, true)
            .await
            .unwrap();

        let hit = SigningCondition::match_decision(&db.pool, uid, "nip44_decrypt", None)
            .await
            .unwrap();
        assert_eq!(hit, Some(true));

        let miss = SigningCondition::match_decision(&db.pool, uid, "nip44_encrypt", None)
            .await
            .unwrap();
        assert_eq!(miss, None);
    }

    #[tokio::test]
    async fn test_global_deny() {
        let (db, uid) = setup().await;
        assert!(!SigningCondition::has_global_deny(&db.pool, uid).await.unwrap());

        SigningCondition::insert(&db.pool, uid, "*", None, false)
            .await
            .unwrap();
        assert!(SigningCondition::has_global_deny(&db.pool, uid).await.unwrap());
    }

    #[tokio::test]
    async fn test_ensure_allow_is_idempotent() {
        let (db, uid) = setup().await;
        SigningCondition::ensure_allow(&db.pool, uid, "sign_event", Some("1"))
            .await
            .unwrap();
        SigningCondition::ensure_allow(&db.pool, uid, "sign_event", Some("1"))
            .await
            .unwrap();

        let rows = SigningCondition::list_for_user(&db.pool, uid).await.unwrap();
        assert_eq!(rows.len(), 1);
    }
}
