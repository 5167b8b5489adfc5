// ABOUTME: NIP-46 backend: one instance per online key
// ABOUTME: Verify, decrypt, dispatch through the ACL, respond; silent drop on protocol errors

use crate::error::{SignerError, SignerResult};
use crate::method::Method;
use crate::relay_pool::{EventHandler, RelayPool};
use crate::subscriptions::SubscriptionManager;
use async_trait::async_trait;
use nostr_sdk::prelude::*;
use signet_core::acl::{AclDecision, AclEvaluator, PermitSource};
use signet_core::bus::{EventBus, Topic};
use signet_core::keyring;
use signet_core::pending::{Decision, PendingQueue};
use signet_core::types::activity::{Activity, ApprovalType};
use signet_core::types::connection_token::ConnectionToken;
use signet_core::types::key_user::{KeyUser, TrustLevel};
use signet_core::types::policy::Policy;
use signet_core::types::signing_condition::SigningCondition;
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// One retry after a failed publish, once the pool has had a chance to
/// reconnect.
const PUBLISH_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Deadline for draining in-flight handlers on shutdown.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Where responses go. The relay pool in production; a collector in
/// tests.
#[async_trait]
pub trait ResponsePublisher: Send + Sync {
    async fn publish(&self, event: Event) -> SignerResult<()>;
}

#[async_trait]
impl ResponsePublisher for RelayPool {
    async fn publish(&self, event: Event) -> SignerResult<()> {
        RelayPool::publish(self, &event).await
    }
}

/// Shared services threaded into every backend; one set per process.
#[derive(Clone)]
pub struct BackendContext {
    pub pool: SqlitePool,
    pub acl: Arc<AclEvaluator>,
    pub pending: Arc<PendingQueue>,
    pub bus: EventBus,
    pub admin_secret: Option<String>,
}

enum ConnectOutcome {
    Ack,
    SilentDrop,
    AskAcl,
}

pub struct Nip46Backend {
    key_name: String,
    keys: Keys,
    ctx: BackendContext,
    publisher: Arc<dyn ResponsePublisher>,
    tracker: TaskTracker,
    cancel: CancellationToken,
}

impl Nip46Backend {
    pub fn new(
        key_name: impl Into<String>,
        keys: Keys,
        ctx: BackendContext,
        publisher: Arc<dyn ResponsePublisher>,
    ) -> Arc<Self> {
        Arc::new(Self {
            key_name: key_name.into(),
            keys,
            ctx,
            publisher,
            tracker: TaskTracker::new(),
            cancel: CancellationToken::new(),
        })
    }

    pub fn key_name(&self) -> &str {
        &self.key_name
    }

    pub fn public_key(&self) -> PublicKey {
        self.keys.public_key()
    }

    fn subscription_id(&self) -> String {
        format!("nip46-{}", self.key_name)
    }

    /// Subscribe to kind 24133 addressed to this key. Each inbound
    /// event gets its own handler task so a parked request never stalls
    /// the others.
    pub async fn start(self: &Arc<Self>, manager: &SubscriptionManager) -> SignerResult<()> {
        let filter = Filter::new()
            .kind(Kind::NostrConnect)
            .pubkey(self.keys.public_key());

        let backend = self.clone();
        let handler: EventHandler = Arc::new(move |event| {
            let backend = backend.clone();
            Box::pin(async move {
                if backend.cancel.is_cancelled() || backend.tracker.is_closed() {
                    return;
                }
                let inner = backend.clone();
                backend.tracker.spawn(async move {
                    tokio::select! {
                        _ = inner.cancel.cancelled() => {}
                        result = inner.handle_event(event) => {
                            if let Err(e) = result {
                                tracing::error!("Error handling NIP-46 request: {}", e);
                            }
                        }
                    }
                });
            })
        });

        manager
            .register(&self.subscription_id(), filter, handler)
            .await?;
        tracing::info!(
            "NIP-46 backend for '{}' listening ({})",
            self.key_name,
            self.keys.public_key().to_hex()
        );
        Ok(())
    }

    /// Stop listening, drain in-flight handlers, then abort stragglers.
    pub async fn shutdown(&self, manager: &SubscriptionManager) {
        manager.close(&self.subscription_id()).await;
        self.tracker.close();
        if tokio::time::timeout(DRAIN_TIMEOUT, self.tracker.wait())
            .await
            .is_err()
        {
            tracing::warn!(
                "Backend '{}' handlers did not drain in {:?}; aborting",
                self.key_name,
                DRAIN_TIMEOUT
            );
        }
        self.cancel.cancel();
        tracing::info!("NIP-46 backend for '{}' stopped", self.key_name);
    }

    pub async fn handle_event(&self, event: Box<Event>) -> SignerResult<()> {
        let response = match self.process_event(event).await? {
            Some(response) => response,
            None => return Ok(()),
        };

        // One retry covers a transient full-pool outage; the health
        // loop reconnects in between.
        if let Err(first) = self.publisher.publish(response.clone()).await {
            tracing::warn!("Response publish failed ({}); retrying once", first);
            tokio::time::sleep(PUBLISH_RETRY_DELAY).await;
            self.publisher.publish(response).await?;
        }
        Ok(())
    }

    /// Run one inbound event through verify → decrypt → dispatch and
    /// build the encrypted response event. `None` means silent drop:
    /// bad signature, mismatched connect secret, or an expired park.
    pub async fn process_event(&self, event: Box<Event>) -> SignerResult<Option<Event>> {
        if event.kind != Kind::NostrConnect {
            return Ok(None);
        }
        if event.verify().is_err() {
            tracing::warn!(
                "Dropping NIP-46 event {} with bad signature from {}",
                event.id,
                event.pubkey.to_hex()
            );
            return Ok(None);
        }

        let sender = event.pubkey;

        // CPU-bound crypto runs off the async threads.
        let decrypted = {
            let secret = self.keys.secret_key().clone();
            let content = event.content.clone();
            let result = tokio::task::spawn_blocking(move || {
                nip44::decrypt(&secret, &sender, &content)
            })
            .await
            .map_err(|e| SignerError::internal(format!("spawn_blocking failed: {}", e)))?;
            match result {
                Ok(plaintext) => plaintext,
                Err(e) => {
                    // Without a plaintext there is no request id to
                    // correlate a reply to; treat as protocol noise.
                    tracing::warn!("Undecryptable NIP-46 content from {}: {}", sender, e);
                    return Ok(None);
                }
            }
        };

        let request: serde_json::Value = match serde_json::from_str(&decrypted) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!("Malformed NIP-46 frame from {}: {}", sender, e);
                return Ok(None);
            }
        };
        let request_id = request["id"].clone();
        let method_name = match request["method"].as_str() {
            Some(m) => m.to_string(),
            None => {
                return self
                    .respond(sender, request_id, Err("Missing method".to_string()))
                    .await
                    .map(Some)
            }
        };
        let params = request["params"].clone();

        tracing::debug!(
            "NIP-46 {} from {} for key '{}'",
            method_name,
            sender.to_hex(),
            self.key_name
        );

        let method = match Method::parse(&method_name, &params) {
            Ok(m) => m,
            Err(e) => {
                return self
                    .respond(sender, request_id, Err(e.to_string()))
                    .await
                    .map(Some)
            }
        };

        if let Method::Nip04 { verb } = &method {
            tracing::debug!("Rejecting deprecated method {}", verb);
            return self
                .respond(
                    sender,
                    request_id,
                    Err("NIP-04 is deprecated, use NIP-44".to_string()),
                )
                .await
                .map(Some);
        }

        // Connect has its own secret/token handling before the ACL.
        if let Method::Connect { secret, .. } = &method {
            match self.handle_connect(sender, secret.as_deref()).await? {
                ConnectOutcome::Ack => {
                    return self
                        .respond(sender, request_id, Ok(serde_json::json!("ack")))
                        .await
                        .map(Some);
                }
                ConnectOutcome::SilentDrop => return Ok(None),
                ConnectOutcome::AskAcl => {}
            }
        }

        let kind = match &method {
            Method::SignEvent { event_json } => match parse_event_kind(event_json) {
                Ok(kind) => Some(kind),
                Err(e) => {
                    return self
                        .respond(sender, request_id, Err(e.to_string()))
                        .await
                        .map(Some)
                }
            },
            _ => None,
        };

        let sender_hex = sender.to_hex();
        let evaluation = self
            .ctx
            .acl
            .evaluate(&self.key_name, &sender_hex, method.name(), kind)
            .await?;

        match evaluation.decision {
            AclDecision::Permitted(source) => {
                let approval = match source {
                    PermitSource::Trust => ApprovalType::AutoTrust,
                    PermitSource::Condition => ApprovalType::AutoPermission,
                };
                Activity::record(
                    &self.ctx.pool,
                    "request_approved",
                    Some(method.name()),
                    Some(&params.to_string()),
                    evaluation.key_user_id,
                    Some(approval),
                )
                .await
                .ok();
                self.ctx.bus.publish(
                    Topic::RequestAutoApproved,
                    serde_json::json!({
                        "key": self.key_name,
                        "pubkey": sender_hex,
                        "method": method.name(),
                    }),
                );

                let result = self.execute(&method).await;
                self.respond(sender, request_id, result.map_err(|e| e.to_string()))
                    .await
                    .map(Some)
            }
            AclDecision::Denied => self
                .respond(sender, request_id, Err("Not authorized".to_string()))
                .await
                .map(Some),
            AclDecision::Undecided => {
                let parked = self
                    .ctx
                    .pending
                    .park(&self.key_name, &sender_hex, method.name(), &params.to_string())
                    .await?;

                match self.ctx.pending.wait(parked).await {
                    Decision::Approved => {
                        let result = self.execute(&method).await;
                        self.respond(sender, request_id, result.map_err(|e| e.to_string()))
                            .await
                            .map(Some)
                    }
                    Decision::Denied => self
                        .respond(sender, request_id, Err("Not authorized".to_string()))
                        .await
                        .map(Some),
                    // The protocol reads no response as a timeout.
                    Decision::Expired => Ok(None),
                }
            }
        }
    }

    /// Connect-with-secret. The secret slot may carry the admin secret
    /// or a one-shot connection token; with neither configured nor
    /// supplied the call falls through to the ordinary ACL flow.
    async fn handle_connect(
        &self,
        sender: PublicKey,
        provided: Option<&str>,
    ) -> SignerResult<ConnectOutcome> {
        let provided = match provided {
            Some(p) if !p.is_empty() => p,
            _ => return Ok(ConnectOutcome::AskAcl),
        };

        // Token redemption first: atomic claim, then rule
        // materialization; the claim is rolled back if the latter fails.
        if let Some(token) =
            ConnectionToken::redeem(&self.ctx.pool, &self.key_name, provided).await.map_err(
                |e| SignerError::internal(format!("token redemption failed: {}", e)),
            )?
        {
            tracing::info!(
                "Connection token {} redeemed for key '{}' by {}",
                token.id,
                self.key_name,
                sender.to_hex()
            );
            return match self.materialize_token(&token, sender).await {
                Ok(key_user_id) => {
                    self.ctx.bus.publish(
                        Topic::AppConnected,
                        serde_json::json!({
                            "key": self.key_name,
                            "pubkey": sender.to_hex(),
                            "token": token.id,
                        }),
                    );
                    Ok(ConnectOutcome::Ack)
                }
                Err(e) => {
                    tracing::error!("Token materialization failed: {}", e);
                    ConnectionToken::release(&self.ctx.pool, token.id)
                        .await
                        .map_err(|e| SignerError::internal(e.to_string()))?;
                    Err(e)
                }
            };
        }

        let admin = match self.ctx.admin_secret.as_deref() {
            Some(admin) if !admin.is_empty() => admin,
            _ => return Ok(ConnectOutcome::AskAcl),
        };

        let provided_norm = provided.trim().to_lowercase();
        let admin_norm = admin.trim().to_lowercase();
        if !keyring::timing_safe_eq(provided_norm.as_bytes(), admin_norm.as_bytes()) {
            // A wrong secret gets nothing back, not even an error.
            tracing::warn!(
                "connect with bad secret for key '{}' from {}; dropping",
                self.key_name,
                sender.to_hex()
            );
            return Ok(ConnectOutcome::SilentDrop);
        }

        let user = KeyUser::get_or_create(
            &self.ctx.pool,
            &self.key_name,
            &sender.to_hex(),
            TrustLevel::Reasonable,
        )
        .await
        .map_err(|e| SignerError::internal(e.to_string()))?;
        SigningCondition::ensure_allow(&self.ctx.pool, user.id, "connect", None)
            .await
            .map_err(|e| SignerError::internal(e.to_string()))?;
        self.ctx.acl.invalidate(&self.key_name, &sender.to_hex()).await;

        self.ctx.bus.publish(
            Topic::AppConnected,
            serde_json::json!({
                "key": self.key_name,
                "pubkey": sender.to_hex(),
            }),
        );
        Activity::record(
            &self.ctx.pool,
            "app_connected",
            Some("connect"),
            None,
            Some(user.id),
            Some(ApprovalType::AutoTrust),
        )
        .await
        .ok();
        tracing::info!(
            "App {} connected to key '{}' via bunker secret",
            sender.to_hex(),
            self.key_name
        );

        Ok(ConnectOutcome::Ack)
    }

    /// Create the app for a redeemed token and copy the policy rules
    /// onto it, all in one transaction.
    async fn materialize_token(
        &self,
        token: &ConnectionToken,
        sender: PublicKey,
    ) -> SignerResult<i64> {
        let sender_hex = sender.to_hex();
        let now = chrono::Utc::now();

        let rules = match token.policy_id {
            Some(policy_id) => {
                let policy = Policy::find(&self.ctx.pool, policy_id)
                    .await
                    .map_err(|e| SignerError::internal(e.to_string()))?;
                policy
                    .rules(&self.ctx.pool)
                    .await
                    .map_err(|e| SignerError::internal(e.to_string()))?
            }
            None => Vec::new(),
        };

        let mut tx = self.ctx.pool.begin().await?;

        let existing: Option<i64> = sqlx::query_scalar(
            "SELECT id FROM key_users
             WHERE key_name = ?1 AND user_pubkey = ?2 AND revoked_at IS NULL",
        )
        .bind(&self.key_name)
        .bind(&sender_hex)
        .fetch_optional(&mut *tx)
        .await?;

        let key_user_id = match existing {
            Some(id) => id,
            None => {
                sqlx::query_scalar::<_, i64>(
                    "INSERT INTO key_users
                     (key_name, user_pubkey, trust_level, created_at, updated_at)
                     VALUES (?1, ?2, 'reasonable', ?3, ?3)
                     RETURNING id",
                )
                .bind(&self.key_name)
                .bind(&sender_hex)
                .bind(now)
                .fetch_one(&mut *tx)
                .await?
            }
        };

        sqlx::query(
            "INSERT INTO signing_conditions (key_user_id, method, kind, allow, created_at)
             VALUES (?1, 'connect', NULL, 1, ?2)",
        )
        .bind(key_user_id)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        for rule in &rules {
            sqlx::query(
                "INSERT INTO signing_conditions (key_user_id, method, kind, allow, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )
            .bind(key_user_id)
            .bind(&rule.method)
            .bind(&rule.kind)
            .bind(rule.allow)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query("UPDATE connection_tokens SET key_user_id = ?1 WHERE id = ?2")
            .bind(key_user_id)
            .bind(token.id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        self.ctx.acl.invalidate(&self.key_name, &sender_hex).await;
        Activity::record(
            &self.ctx.pool,
            "app_connected",
            Some("connect"),
            None,
            Some(key_user_id),
            Some(ApprovalType::AutoPermission),
        )
        .await
        .ok();

        Ok(key_user_id)
    }

    /// Perform a permitted method with this key's material.
    async fn execute(&self, method: &Method) -> SignerResult<serde_json::Value> {
        match method {
            Method::Connect { .. } => Ok(serde_json::json!("ack")),
            Method::Ping => Ok(serde_json::json!("pong")),
            Method::GetPublicKey => Ok(serde_json::json!(self.keys.public_key().to_hex())),
            Method::SignEvent { event_json } => {
                let signed = self.sign_event(event_json).await?;
                Ok(serde_json::json!(serde_json::to_string(&signed)?))
            }
            Method::Nip44Encrypt { peer, plaintext } => {
                let peer = PublicKey::from_hex(peer)?;
                let secret = self.keys.secret_key().clone();
                let text = plaintext.clone();
                let ciphertext = tokio::task::spawn_blocking(move || {
                    nip44::encrypt(&secret, &peer, &text, nip44::Version::V2)
                })
                .await
                .map_err(|e| SignerError::internal(format!("spawn_blocking failed: {}", e)))??;
                Ok(serde_json::json!(ciphertext))
            }
            Method::Nip44Decrypt { peer, payload } => {
                let peer = PublicKey::from_hex(peer)?;
                let secret = self.keys.secret_key().clone();
                let text = payload.clone();
                let plaintext =
                    tokio::task::spawn_blocking(move || nip44::decrypt(&secret, &peer, &text))
                        .await
                        .map_err(|e| {
                            SignerError::internal(format!("spawn_blocking failed: {}", e))
                        })?
                        .map_err(|e| {
                            tracing::debug!("nip44_decrypt failed: {}", e);
                            SignerError::invalid_request("Failed to decrypt payload")
                        })?;
                Ok(serde_json::json!(plaintext))
            }
            Method::Nip04 { .. } => {
                Err(SignerError::invalid_request("NIP-04 is deprecated, use NIP-44"))
            }
        }
    }

    async fn sign_event(&self, event_json: &str) -> SignerResult<Event> {
        let unsigned: serde_json::Value = serde_json::from_str(event_json)?;

        let kind = unsigned["kind"]
            .as_u64()
            .ok_or(SignerError::MissingParameter("kind"))? as u16;
        let content = unsigned["content"]
            .as_str()
            .ok_or(SignerError::MissingParameter("content"))?
            .to_string();
        let created_at = unsigned["created_at"]
            .as_u64()
            .ok_or(SignerError::MissingParameter("created_at"))?;
        let tags_json = unsigned["tags"]
            .as_array()
            .ok_or(SignerError::MissingParameter("tags"))?;

        let mut tags = Vec::new();
        for tag_arr in tags_json {
            if let Some(arr) = tag_arr.as_array() {
                let tag_strs: Vec<String> = arr
                    .iter()
                    .filter_map(|v| v.as_str().map(|s| s.to_string()))
                    .collect();
                if !tag_strs.is_empty() {
                    tags.push(Tag::parse(tag_strs)?);
                }
            }
        }

        tracing::info!("Signing event kind {} with key '{}'", kind, self.key_name);

        let keys = self.keys.clone();
        let signed = tokio::task::spawn_blocking(move || {
            EventBuilder::new(Kind::from(kind), content)
                .tags(tags)
                .custom_created_at(Timestamp::from(created_at))
                .sign_with_keys(&keys)
        })
        .await
        .map_err(|e| SignerError::internal(format!("spawn_blocking failed: {}", e)))??;

        Ok(signed)
    }

    /// Encrypt and sign the response event addressed back at the
    /// requester.
    async fn respond(
        &self,
        recipient: PublicKey,
        request_id: serde_json::Value,
        outcome: Result<serde_json::Value, String>,
    ) -> SignerResult<Event> {
        let body = match outcome {
            Ok(result) => serde_json::json!({ "id": request_id, "result": result }),
            Err(message) => serde_json::json!({
                "id": request_id,
                "result": "error",
                "error": message,
            }),
        };

        let keys = self.keys.clone();
        let plaintext = body.to_string();
        let response = tokio::task::spawn_blocking(move || -> SignerResult<Event> {
            let content = nip44::encrypt(
                keys.secret_key(),
                &recipient,
                &plaintext,
                nip44::Version::V2,
            )?;
            let event = EventBuilder::new(Kind::NostrConnect, content)
                .tags(vec![Tag::public_key(recipient)])
                .sign_with_keys(&keys)?;
            Ok(event)
        })
        .await
        .map_err(|e| SignerError::internal(format!("spawn_blocking failed: {}", e)))??;

        Ok(response)
    }
}

fn parse_event_kind(event_json: &str) -> SignerResult<u16> {
    let value: serde_json::Value = serde_json::from_str(event_json)?;
    value["kind"]
        .as_u64()
        .map(|k| k as u16)
        .ok_or(SignerError::MissingParameter("kind"))
}
