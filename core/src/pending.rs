// ABOUTME: Pending-request queue parking undecided NIP-46 calls for human review
// ABOUTME: Oneshot wakers race a 60 s TTL; decisions linearize at the database

use crate::acl::AclEvaluator;
use crate::bus::{EventBus, Topic};
use crate::types::activity::{Activity, ActivityError, ApprovalType};
use crate::types::key_user::{KeyUser, KeyUserError, TrustLevel};
use crate::types::request::{Request, RequestError, RequestStatus, PENDING_TTL_SECS};
use crate::types::signing_condition::{ConditionError, SigningCondition};
use serde::Deserialize;
use sqlx::SqlitePool;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::oneshot;

/// Long-poll fallback pacing for callers that cannot hold an SSE
/// stream: 100 ms start, 1.5x growth, 2 s cap, 65 s overall.
const POLL_INITIAL: Duration = Duration::from_millis(100);
const POLL_MULTIPLIER: f64 = 1.5;
const POLL_CAP: Duration = Duration::from_secs(2);
const POLL_DEADLINE: Duration = Duration::from_secs(65);

#[derive(Error, Debug)]
pub enum PendingError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Request error: {0}")]
    Request(#[from] RequestError),

    #[error("App error: {0}")]
    KeyUser(#[from] KeyUserError),

    #[error("Condition error: {0}")]
    Condition(#[from] ConditionError),

    #[error("Activity error: {0}")]
    Activity(#[from] ActivityError),
}

/// Terminal outcome of a parked request. Exactly one of these resolves
/// per request id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Approved,
    Denied,
    Expired,
}

/// Control-plane options accompanying an approval.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ApproveScope {
    /// Remember this decision as a signing condition.
    #[serde(default)]
    pub always_allow: bool,
    /// Trust level granted when approving a `connect`.
    #[serde(default)]
    pub trust_level: Option<TrustLevel>,
}

/// A parked request plus the receiving half of its waker.
pub struct Parked {
    pub request: Request,
    rx: oneshot::Receiver<Decision>,
}

pub struct PendingQueue {
    pool: SqlitePool,
    bus: EventBus,
    acl: Arc<AclEvaluator>,
    waiters: Mutex<HashMap<String, oneshot::Sender<Decision>>>,
}

impl PendingQueue {
    pub fn new(pool: SqlitePool, bus: EventBus, acl: Arc<AclEvaluator>) -> Self {
        Self {
            pool,
            bus,
            acl,
            waiters: Mutex::new(HashMap::new()),
        }
    }

    /// Persist an undecided request and register its waker. The caller
    /// awaits the decision with [`PendingQueue::wait`].
    pub async fn park(
        &self,
        key_name: &str,
        user_pubkey: &str,
        method: &str,
        params: &str,
    ) -> Result<Parked, PendingError> {
        let request = Request::insert(&self.pool, key_name, user_pubkey, method, params).await?;

        let (tx, rx) = oneshot::channel();
        self.waiters
            .lock()
            .expect("waiter map poisoned")
            .insert(request.id.clone(), tx);

        self.bus.publish(
            Topic::RequestCreated,
            serde_json::json!({
                "id": request.id,
                "key": key_name,
                "pubkey": user_pubkey,
                "method": method,
            }),
        );
        tracing::info!("Parked request {} ({} from {})", request.id, method, user_pubkey);

        Ok(Parked { request, rx })
    }

    /// Resolve a parked request: a control-plane decision wins over the
    /// TTL; the TTL yields `Expired` and no NIP-46 response is sent.
    pub async fn wait(&self, parked: Parked) -> Decision {
        let id = parked.request.id.clone();
        let ttl = Duration::from_secs(PENDING_TTL_SECS as u64);

        let decision = tokio::select! {
            outcome = parked.rx => outcome.unwrap_or(Decision::Expired),
            _ = tokio::time::sleep(ttl) => Decision::Expired,
        };

        if decision == Decision::Expired {
            self.waiters.lock().expect("waiter map poisoned").remove(&id);
            self.bus
                .publish(Topic::RequestExpired, serde_json::json!({ "id": id }));
            tracing::info!("Request {} expired undecided", id);
        }
        decision
    }

    /// Approve a pending request. Two concurrent calls race on the
    /// database row; the loser observes `AlreadyProcessed`.
    pub async fn approve(&self, id: &str, scope: ApproveScope) -> Result<Request, PendingError> {
        let request = Request::decide(&self.pool, id, true).await?;

        let user = self.grant(&request, &scope).await?;

        Activity::record(
            &self.pool,
            "request_approved",
            Some(&request.method),
            Some(&request.params),
            user.as_ref().map(|u| u.id),
            Some(ApprovalType::Manual),
        )
        .await?;

        self.acl
            .invalidate(&request.key_name, &request.user_pubkey)
            .await;

        self.bus.publish(
            Topic::RequestApproved,
            serde_json::json!({ "id": id, "method": request.method }),
        );
        self.bus.publish(Topic::StatsUpdated, serde_json::Value::Null);
        self.wake(id, Decision::Approved);

        Ok(request)
    }

    pub async fn deny(&self, id: &str) -> Result<Request, PendingError> {
        let request = Request::decide(&self.pool, id, false).await?;

        let user = KeyUser::find_active(&self.pool, &request.key_name, &request.user_pubkey).await?;
        Activity::record(
            &self.pool,
            "request_denied",
            Some(&request.method),
            Some(&request.params),
            user.map(|u| u.id),
            None,
        )
        .await?;

        self.bus.publish(
            Topic::RequestDenied,
            serde_json::json!({ "id": id, "method": request.method }),
        );
        self.bus.publish(Topic::StatsUpdated, serde_json::Value::Null);
        self.wake(id, Decision::Denied);

        Ok(request)
    }

    /// Materialize the side effects of an approval: the app binding,
    /// and any remembered conditions.
    async fn grant(
        &self,
        request: &Request,
        scope: &ApproveScope,
    ) -> Result<Option<KeyUser>, PendingError> {
        if request.method == "connect" {
            let trust = scope.trust_level.unwrap_or(TrustLevel::Reasonable);
            let user = KeyUser::get_or_create(
                &self.pool,
                &request.key_name,
                &request.user_pubkey,
                trust,
            )
            .await?;
            SigningCondition::ensure_allow(&self.pool, user.id, "connect", None).await?;

            // Full trust carries explicit encrypt/decrypt grants; the
            // bunker-secret auto path never does.
            if trust == TrustLevel::Full {
                SigningCondition::ensure_allow(&self.pool, user.id, "nip44_encrypt", None).await?;
                SigningCondition::ensure_allow(&self.pool, user.id, "nip44_decrypt", None).await?;
            }
            return Ok(Some(user));
        }

        let user = KeyUser::get_or_create(
            &self.pool,
            &request.key_name,
            &request.user_pubkey,
            TrustLevel::Reasonable,
        )
        .await?;

        if scope.always_allow {
            let kind = if request.method == "sign_event" {
                sign_event_kind(&request.params)
            } else {
                None
            };
            SigningCondition::ensure_allow(&self.pool, user.id, &request.method, kind.as_deref())
                .await?;
        }
        Ok(Some(user))
    }

    fn wake(&self, id: &str, decision: Decision) {
        let waiter = self.waiters.lock().expect("waiter map poisoned").remove(id);
        if let Some(tx) = waiter {
            // A dropped receiver means the backend gave up already.
            let _ = tx.send(decision);
        }
    }

    /// Polling fallback for long-poll callers: resolve as soon as the
    /// row is decided or expired, with exponential backoff.
    pub async fn wait_polling(&self, id: &str) -> Result<RequestStatus, PendingError> {
        let started = tokio::time::Instant::now();
        let mut delay = POLL_INITIAL;

        loop {
            let request = Request::find(&self.pool, id).await?;
            let status = request.status(chrono::Utc::now());
            if status != RequestStatus::Pending {
                return Ok(status);
            }
            if started.elapsed() >= POLL_DEADLINE {
                return Ok(RequestStatus::Expired);
            }
            tokio::time::sleep(delay).await;
            delay = delay.mul_f64(POLL_MULTIPLIER).min(POLL_CAP);
        }
    }

    /// Janitor entry point: drop expired pending rows older than an
    /// hour. The audit trail was written at decision/expiry time.
    pub async fn cleanup(&self) -> Result<u64, PendingError> {
        let cutoff = chrono::Utc::now() - chrono::Duration::hours(1);
        Ok(Request::cleanup_expired(&self.pool, cutoff).await?)
    }
}

/// Pull the event kind out of serialized `sign_event` params:
/// `["<json of unsigned event>"]`.
fn sign_event_kind(params: &str) -> Option<String> {
    let outer: serde_json::Value = serde_json::from_str(params).ok()?;
    let event_json = outer.get(0)?.as_str()?;
    let event: serde_json::Value = serde_json::from_str(event_json).ok()?;
    event.get("kind")?.as_u64().map(|k| k.to_string())
}
