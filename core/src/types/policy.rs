use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PolicyError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Policy not found")]
    NotFound,
}

/// A named bundle of permission rules. A connection token may reference
/// a policy; redeeming the token materializes the rules as signing
/// conditions on the new app.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Policy {
    pub id: i64,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

/// One rule of a policy: `(method, kind?, allow)`, the same shape as a
/// signing condition.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct PolicyRule {
    #[serde(default)]
    pub id: i64,
    #[serde(default)]
    pub policy_id: i64,
    pub method: String,
    pub kind: Option<String>,
    pub allow: bool,
}

impl Policy {
    pub async fn create(
        pool: &SqlitePool,
        name: &str,
        rules: &[PolicyRule],
    ) -> Result<Self, PolicyError> {
        let mut tx = pool.begin().await?;

        let id = sqlx::query_scalar::<_, i64>(
            "INSERT INTO policies (name, created_at) VALUES (?1, ?2) RETURNING id",
        )
        .bind(name)
        .bind(Utc::now())
        .fetch_one(&mut *tx)
        .await?;

        for rule in rules {
            sqlx::query(
                "INSERT INTO policy_rules (policy_id, method, kind, allow) VALUES (?1, ?2, ?3, ?4)",
            )
            .bind(id)
            .bind(&rule.method)
            .bind(&rule.kind)
            .bind(rule.allow)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Self::find(pool, id).await
    }

    pub async fn find(pool: &SqlitePool, id: i64) -> Result<Self, PolicyError> {
        sqlx::query_as::<_, Policy>("SELECT * FROM policies WHERE id = ?1")
            .bind(id)
            .fetch_optional(pool)
            .await?
            .ok_or(PolicyError::NotFound)
    }

    pub async fn rules(&self, pool: &SqlitePool) -> Result<Vec<PolicyRule>, PolicyError> {
        let rules = sqlx::query_as::<_, PolicyRule>(
            "SELECT * FROM policy_rules WHERE policy_id = ?1 ORDER BY id",
        )
        .bind(self.id)
        .fetch_all(pool)
        .await?;
        Ok(rules)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::Database;

    #[tokio::test]
    async fn test_create_with_rules() {
        let db = Database::connect_in_memory().await.unwrap();
        let rules = vec![
            PolicyRule {
                id: 0,
                policy_id: 0,
                method: "sign_event".to_string(),
                kind: Some("1".to_string()),
                allow: true,
            },
            PolicyRule {
                id: 0,
                policy_id: 0,
                method: "nip44_decrypt".to_string(),
                kind: None,
                allow: false,
            },
        ];

        let policy = Policy::create(&db.pool, "social", &rules).await.unwrap();
        let loaded = policy.rules(&db.pool).await.unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].method, "sign_event");
        assert!(!loaded[1].allow);
    }
}
