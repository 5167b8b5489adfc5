// ABOUTME: ACL evaluator deciding permit/deny/ask for each inbound NIP-46 call
// ABOUTME: Explicit conditions first, then trust-level defaults, with a TTL+LRU app cache

use crate::types::key_user::{KeyUser, KeyUserError, TrustLevel};
use crate::types::signing_condition::{ConditionError, SigningCondition};
use chrono::{DateTime, Utc};
use moka::future::Cache;
use sqlx::SqlitePool;
use std::time::Duration;
use thiserror::Error;

/// Event kinds the `reasonable` trust level auto-approves.
pub const SAFE_KINDS: &[u16] = &[
    1, 6, 7, 16, 1111, 30023, 30024, 1808, 9735, 10000, 10001, 30000, 30001, 24242,
];

/// Event kinds that always require a human even at `reasonable` trust.
/// Overrides SAFE on overlap.
pub const SENSITIVE_KINDS: &[u16] = &[0, 3, 4, 5, 10002, 22242, 24133, 13194, 23194, 23195];

const CACHE_CAPACITY: u64 = 1_000;
const CACHE_TTL: Duration = Duration::from_secs(30);

#[derive(Error, Debug)]
pub enum AclError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("App lookup error: {0}")]
    KeyUser(#[from] KeyUserError),

    #[error("Condition lookup error: {0}")]
    Condition(#[from] ConditionError),
}

/// Which rule produced a permit; drives the audit `approval_type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermitSource {
    Condition,
    Trust,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AclDecision {
    Permitted(PermitSource),
    Denied,
    Undecided,
}

impl AclDecision {
    pub fn is_permitted(&self) -> bool {
        matches!(self, AclDecision::Permitted(_))
    }
}

#[derive(Debug, Clone)]
pub struct Evaluation {
    pub decision: AclDecision,
    pub key_user_id: Option<i64>,
}

/// Cached app summary. Only coarse state lives here; the specific
/// method/kind condition rows are always fetched from the database so a
/// stale cache can never widen a permit.
#[derive(Debug, Clone)]
struct CachedUser {
    id: i64,
    trust_level: TrustLevel,
    revoked: bool,
    suspended_at: Option<DateTime<Utc>>,
    suspend_until: Option<DateTime<Utc>>,
    global_deny: bool,
}

impl CachedUser {
    fn is_suspended(&self, now: DateTime<Utc>) -> bool {
        match (self.suspended_at, self.suspend_until) {
            (None, _) => false,
            (Some(_), None) => true,
            (Some(_), Some(until)) => until > now,
        }
    }
}

pub struct AclEvaluator {
    pool: SqlitePool,
    cache: Cache<(String, String), CachedUser>,
}

impl AclEvaluator {
    pub fn new(pool: SqlitePool) -> Self {
        let cache = Cache::builder()
            .max_capacity(CACHE_CAPACITY)
            .time_to_live(CACHE_TTL)
            .support_invalidation_closures()
            .build();
        Self { pool, cache }
    }

    /// Decide one call. `kind` is only meaningful for `sign_event`.
    pub async fn evaluate(
        &self,
        key_name: &str,
        user_pubkey: &str,
        method: &str,
        kind: Option<u16>,
    ) -> Result<Evaluation, AclError> {
        let user = match self.lookup(key_name, user_pubkey).await? {
            // First contact: park and ask.
            None => {
                return Ok(Evaluation {
                    decision: AclDecision::Undecided,
                    key_user_id: None,
                })
            }
            Some(user) => user,
        };

        let outcome = |decision| Evaluation {
            decision,
            key_user_id: Some(user.id),
        };

        if user.revoked || user.is_suspended(Utc::now()) || user.global_deny {
            return Ok(outcome(AclDecision::Denied));
        }

        // Explicit rule lookup always goes to the database.
        if let Some(allow) =
            SigningCondition::match_decision(&self.pool, user.id, method, kind).await?
        {
            if allow {
                self.touch(user.id);
                return Ok(outcome(AclDecision::Permitted(PermitSource::Condition)));
            }
            return Ok(outcome(AclDecision::Denied));
        }

        let decision = trust_default(user.trust_level, method, kind);
        if decision.is_permitted() {
            self.touch(user.id);
        }
        Ok(outcome(decision))
    }

    /// Drop the cached summary for one app. Callers invoke this in the
    /// same call that mutates the app or its conditions, so the next
    /// request observes the new state.
    pub async fn invalidate(&self, key_name: &str, user_pubkey: &str) {
        self.cache
            .invalidate(&(key_name.to_string(), user_pubkey.to_string()))
            .await;
    }

    /// Drop every cached summary for a key (mass revoke, key delete).
    pub fn invalidate_key(&self, key_name: &str) {
        let key_name = key_name.to_string();
        if let Err(e) = self
            .cache
            .invalidate_entries_if(move |k, _| k.0 == key_name)
        {
            tracing::warn!("ACL cache key invalidation failed: {}", e);
        }
    }

    async fn lookup(
        &self,
        key_name: &str,
        user_pubkey: &str,
    ) -> Result<Option<CachedUser>, AclError> {
        let cache_key = (key_name.to_string(), user_pubkey.to_string());
        if let Some(hit) = self.cache.get(&cache_key).await {
            return Ok(Some(hit));
        }

        let user = match KeyUser::find_latest(&self.pool, key_name, user_pubkey).await? {
            Some(user) => user,
            None => return Ok(None),
        };
        let global_deny = SigningCondition::has_global_deny(&self.pool, user.id).await?;

        let cached = CachedUser {
            id: user.id,
            trust_level: user.trust_level,
            revoked: user.revoked_at.is_some(),
            suspended_at: user.suspended_at,
            suspend_until: user.suspend_until,
            global_deny,
        };
        self.cache.insert(cache_key, cached.clone()).await;
        Ok(Some(cached))
    }

    fn touch(&self, key_user_id: i64) {
        let pool = self.pool.clone();
        tokio::spawn(async move {
            if let Err(e) = KeyUser::touch_last_used(&pool, key_user_id).await {
                tracing::debug!("last_used_at update failed: {}", e);
            }
        });
    }
}

/// The trust-level default when no explicit condition matched.
pub fn trust_default(trust: TrustLevel, method: &str, kind: Option<u16>) -> AclDecision {
    match trust {
        TrustLevel::Paranoid => AclDecision::Undecided,
        TrustLevel::Full => AclDecision::Permitted(PermitSource::Trust),
        TrustLevel::Reasonable => match method {
            "ping" | "connect" => AclDecision::Permitted(PermitSource::Trust),
            "sign_event" => match kind {
                Some(k) if SAFE_KINDS.contains(&k) && !SENSITIVE_KINDS.contains(&k) => {
                    AclDecision::Permitted(PermitSource::Trust)
                }
                _ => AclDecision::Undecided,
            },
            _ => AclDecision::Undecided,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::Database;

    #[test]
    fn test_reasonable_trust_table() {
        use AclDecision::*;

        // Methods.
        assert!(trust_default(TrustLevel::Reasonable, "ping", None).is_permitted());
        assert!(trust_default(TrustLevel::Reasonable, "connect", None).is_permitted());
        assert_eq!(
            trust_default(TrustLevel::Reasonable, "nip44_encrypt", None),
            Undecided
        );
        assert_eq!(
            trust_default(TrustLevel::Reasonable, "nip44_decrypt", None),
            Undecided
        );
        assert_eq!(
            trust_default(TrustLevel::Reasonable, "get_public_key", None),
            Undecided
        );

        // Safe kinds pass, sensitive and unknown kinds ask.
        for k in SAFE_KINDS {
            let expected = !SENSITIVE_KINDS.contains(k);
            assert_eq!(
                trust_default(TrustLevel::Reasonable, "sign_event", Some(*k)).is_permitted(),
                expected,
                "kind {}",
                k
            );
        }
        for k in SENSITIVE_KINDS {
            assert_eq!(
                trust_default(TrustLevel::Reasonable, "sign_event", Some(*k)),
                Undecided,
                "kind {}",
                k
            );
        }
        assert_eq!(
            trust_default(TrustLevel::Reasonable, "sign_event", Some(4242)),
            Undecided
        );
        assert_eq!(
            trust_default(TrustLevel::Reasonable, "sign_event", None),
            Undecided
        );
    }

    #[test]
    fn test_paranoid_and_full_defaults() {
        assert_eq!(
            trust_default(TrustLevel::Paranoid, "ping", None),
            AclDecision::Undecided
        );
        assert!(trust_default(TrustLevel::Full, "nip44_decrypt", None).is_permitted());
        assert!(trust_default(TrustLevel::Full, "sign_event", Some(4)).is_permitted());
    }

    #[tokio::test]
    async fn test_first_contact_is_undecided() {
        let db = Database::connect_in_memory().await.unwrap();
        let acl = AclEvaluator::new(db.pool.clone());

        let eval = acl
            .evaluate("alice", "pk-unknown", "sign_event", Some(1))
            .await
            .unwrap();
        assert_eq!(eval.decision, AclDecision::Undecided);
        assert!(eval.key_user_id.is_none());
    }

    #[tokio::test]
    async fn test_explicit_condition_overrides_trust() {
        let db = Database::connect_in_memory().await.unwrap();
        let acl = AclEvaluator::new(db.pool.clone());
        let user = KeyUser::create(&db.pool, "alice", "pk1", TrustLevel::Paranoid, None)
            .await
            .unwrap();
        SigningCondition::ensure_allow(&db.pool, user.id, "sign_event", Some("1"))
            .await
            .unwrap();

        let eval = acl
            .evaluate("alice", "pk1", "sign_event", Some(1))
            .await
            .unwrap();
        assert_eq!(
            eval.decision,
            AclDecision::Permitted(PermitSource::Condition)
        );

        // Unlisted kind falls back to the paranoid default.
        let eval = acl
            .evaluate("alice", "pk1", "sign_event", Some(7))
            .await
            .unwrap();
        assert_eq!(eval.decision, AclDecision::Undecided);
    }

    #[tokio::test]
    async fn test_global_deny_blocks_everything() {
        let db = Database::connect_in_memory().await.unwrap();
        let acl = AclEvaluator::new(db.pool.clone());
        let user = KeyUser::create(&db.pool, "alice", "pk1", TrustLevel::Full, None)
            .await
            .unwrap();
        SigningCondition::insert(&db.pool, user.id, "*", None, false)
            .await
            .unwrap();

        let eval = acl.evaluate("alice", "pk1", "ping", None).await.unwrap();
        assert_eq!(eval.decision, AclDecision::Denied);
    }

    #[tokio::test]
    async fn test_revocation_observed_through_warm_cache() {
        let db = Database::connect_in_memory().await.unwrap();
        let acl = AclEvaluator::new(db.pool.clone());
        let user = KeyUser::create(&db.pool, "alice", "pk1", TrustLevel::Full, None)
            .await
            .unwrap();

        // Warm the cache.
        let eval = acl.evaluate("alice", "pk1", "ping", None).await.unwrap();
        assert!(eval.decision.is_permitted());

        // Revoke and invalidate in the same step, as the API layer does.
        KeyUser::revoke(&db.pool, user.id).await.unwrap();
        acl.invalidate("alice", "pk1").await;

        // The very next request is denied, not treated as first contact.
        let eval = acl.evaluate("alice", "pk1", "ping", None).await.unwrap();
        assert_eq!(eval.decision, AclDecision::Denied);
    }

    #[tokio::test]
    async fn test_suspended_user_denied() {
        let db = Database::connect_in_memory().await.unwrap();
        let acl = AclEvaluator::new(db.pool.clone());
        let user = KeyUser::create(&db.pool, "alice", "pk1", TrustLevel::Full, None)
            .await
            .unwrap();
        KeyUser::suspend(&db.pool, user.id, None).await.unwrap();

        let eval = acl.evaluate("alice", "pk1", "ping", None).await.unwrap();
        assert_eq!(eval.decision, AclDecision::Denied);
    }
}
