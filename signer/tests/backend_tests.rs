// ABOUTME: Black-box tests for the NIP-46 backend request pipeline
// ABOUTME: Drives process_event directly; responses come back as events, not publishes

use async_trait::async_trait;
use nostr_sdk::nips::nip44;
use nostr_sdk::prelude::*;
use signet_core::acl::AclEvaluator;
use signet_core::bus::EventBus;
use signet_core::database::Database;
use signet_core::pending::{ApproveScope, PendingQueue};
use signet_core::types::activity::Activity;
use signet_core::types::connection_token::ConnectionToken;
use signet_core::types::key_user::{KeyUser, TrustLevel};
use signet_core::types::policy::{Policy, PolicyRule};
use signet_core::types::request::Request;
use signet_core::types::signing_condition::SigningCondition;
use signet_signer::backend::{BackendContext, Nip46Backend, ResponsePublisher};
use signet_signer::error::SignerResult;
use std::sync::Arc;
use std::time::Duration;

const KEY_NAME: &str = "alice";
const ADMIN_SECRET: &str = "a1b2c3d4e5f6";

struct NullPublisher;

#[async_trait]
impl ResponsePublisher for NullPublisher {
    async fn publish(&self, _event: Event) -> SignerResult<()> {
        Ok(())
    }
}

struct Harness {
    db: Database,
    pending: Arc<PendingQueue>,
    backend: Arc<Nip46Backend>,
    signer_keys: Keys,
}

async fn harness(admin_secret: Option<&str>) -> Harness {
    let db = Database::connect_in_memory().await.unwrap();
    let bus = EventBus::new();
    let acl = Arc::new(AclEvaluator::new(db.pool.clone()));
    let pending = Arc::new(PendingQueue::new(db.pool.clone(), bus.clone(), acl.clone()));

    let signer_keys = Keys::generate();
    let ctx = BackendContext {
        pool: db.pool.clone(),
        acl,
        pending: pending.clone(),
        bus,
        admin_secret: admin_secret.map(str::to_string),
    };
    let backend = Nip46Backend::new(KEY_NAME, signer_keys.clone(), ctx, Arc::new(NullPublisher));

    Harness {
        db,
        pending,
        backend,
        signer_keys,
    }
}

fn request_event(
    client: &Keys,
    signer_pub: PublicKey,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> Box<Event> {
    let body = serde_json::json!({ "id": id, "method": method, "params": params }).to_string();
    let content = nip44::encrypt(
        client.secret_key(),
        &signer_pub,
        &body,
        nip44::Version::V2,
    )
    .unwrap();
    let event = EventBuilder::new(Kind::NostrConnect, content)
        .tags(vec![Tag::public_key(signer_pub)])
        .sign_with_keys(client)
        .unwrap();
    Box::new(event)
}

fn decrypt_response(client: &Keys, signer_pub: PublicKey, response: &Event) -> serde_json::Value {
    assert_eq!(response.kind, Kind::NostrConnect);
    assert!(response.verify().is_ok(), "response must verify");
    let plaintext = nip44::decrypt(
        client.secret_key(),
        &signer_pub,
        &response.content,
    )
    .unwrap();
    serde_json::from_str(&plaintext).unwrap()
}

#[tokio::test]
async fn test_connect_with_admin_secret_then_sign() {
    let h = harness(Some(ADMIN_SECRET)).await;
    let client = Keys::generate();
    let signer_pub = h.signer_keys.public_key();

    // Connect with the bunker secret auto-approves the app.
    let connect = request_event(
        &client,
        signer_pub,
        "c1",
        "connect",
        serde_json::json!([signer_pub.to_hex(), ADMIN_SECRET]),
    );
    let response = h.backend.process_event(connect).await.unwrap().unwrap();
    let body = decrypt_response(&client, signer_pub, &response);
    assert_eq!(body["id"], "c1");
    assert_eq!(body["result"], "ack");

    let user = KeyUser::find_active(&h.db.pool, KEY_NAME, &client.public_key().to_hex())
        .await
        .unwrap()
        .expect("app registered");
    assert_eq!(user.trust_level, TrustLevel::Reasonable);

    // A kind-1 note is auto-approved under reasonable trust: the
    // response arrives with no pending entry.
    let unsigned = serde_json::json!({
        "kind": 1,
        "content": "hello nostr",
        "tags": [],
        "created_at": Timestamp::now().as_u64(),
    });
    let sign = request_event(
        &client,
        signer_pub,
        "s1",
        "sign_event",
        serde_json::json!([unsigned.to_string()]),
    );
    let response = h.backend.process_event(sign).await.unwrap().unwrap();
    let body = decrypt_response(&client, signer_pub, &response);
    assert_eq!(body["id"], "s1");

    let signed: Event = serde_json::from_str(body["result"].as_str().unwrap()).unwrap();
    assert!(signed.verify().is_ok());
    assert_eq!(signed.pubkey, signer_pub);
    assert_eq!(signed.kind, Kind::from(1u16));
    assert_eq!(signed.content, "hello nostr");

    assert_eq!(Request::count_pending(&h.db.pool).await.unwrap(), 0);

    let rows = Activity::recent(&h.db.pool, 10).await.unwrap();
    assert!(rows.iter().any(|a| {
        a.log_type == "request_approved"
            && a.approval_type
                == Some(signet_core::types::activity::ApprovalType::AutoTrust)
    }));
}

#[tokio::test]
async fn test_connect_with_bad_secret_is_silent() {
    let h = harness(Some(ADMIN_SECRET)).await;
    let client = Keys::generate();
    let signer_pub = h.signer_keys.public_key();

    let connect = request_event(
        &client,
        signer_pub,
        "c1",
        "connect",
        serde_json::json!([signer_pub.to_hex(), "zzzz-not-the-secret"]),
    );

    let outcome = tokio::time::timeout(
        Duration::from_secs(2),
        h.backend.process_event(connect),
    )
    .await
    .expect("must resolve well within 2s")
    .unwrap();
    assert!(outcome.is_none(), "bad secret must produce no response");

    // And no pending record either.
    assert_eq!(Request::count_pending(&h.db.pool).await.unwrap(), 0);
    assert!(
        KeyUser::find_active(&h.db.pool, KEY_NAME, &client.public_key().to_hex())
            .await
            .unwrap()
            .is_none()
    );
}

#[tokio::test]
async fn test_paranoid_sign_parks_then_always_allow() {
    let h = harness(None).await;
    let client = Keys::generate();
    let signer_pub = h.signer_keys.public_key();
    let client_hex = client.public_key().to_hex();

    KeyUser::create(&h.db.pool, KEY_NAME, &client_hex, TrustLevel::Paranoid, None)
        .await
        .unwrap();

    let unsigned = serde_json::json!({
        "kind": 1,
        "content": "needs approval",
        "tags": [],
        "created_at": Timestamp::now().as_u64(),
    });
    let sign = request_event(
        &client,
        signer_pub,
        "p1",
        "sign_event",
        serde_json::json!([unsigned.to_string()]),
    );

    let backend = h.backend.clone();
    let in_flight = tokio::spawn(async move { backend.process_event(sign).await });

    // The request parks; find it and approve with always_allow.
    let parked = wait_for_pending(&h.db).await;
    assert_eq!(parked.method, "sign_event");
    h.pending
        .approve(
            &parked.id,
            ApproveScope {
                always_allow: true,
                trust_level: None,
            },
        )
        .await
        .unwrap();

    let response = in_flight.await.unwrap().unwrap().expect("response");
    let body = decrypt_response(&client, signer_pub, &response);
    assert_eq!(body["id"], "p1");
    let signed: Event = serde_json::from_str(body["result"].as_str().unwrap()).unwrap();
    assert!(signed.verify().is_ok());

    // The remembered condition auto-approves the next kind-1 request.
    let unsigned = serde_json::json!({
        "kind": 1,
        "content": "second note",
        "tags": [],
        "created_at": Timestamp::now().as_u64(),
    });
    let sign = request_event(
        &client,
        signer_pub,
        "p2",
        "sign_event",
        serde_json::json!([unsigned.to_string()]),
    );
    let response = h.backend.process_event(sign).await.unwrap().unwrap();
    let body = decrypt_response(&client, signer_pub, &response);
    assert_eq!(body["id"], "p2");
    assert_eq!(Request::count_pending(&h.db.pool).await.unwrap(), 0);

    let rows = Activity::recent(&h.db.pool, 10).await.unwrap();
    assert!(rows.iter().any(|a| {
        a.approval_type
            == Some(signet_core::types::activity::ApprovalType::AutoPermission)
    }));
}

#[tokio::test]
async fn test_concurrent_approvals_one_winner_one_response() {
    let h = harness(None).await;
    let client = Keys::generate();
    let signer_pub = h.signer_keys.public_key();
    let client_hex = client.public_key().to_hex();

    KeyUser::create(&h.db.pool, KEY_NAME, &client_hex, TrustLevel::Paranoid, None)
        .await
        .unwrap();

    let ping = request_event(&client, signer_pub, "r1", "ping", serde_json::json!([]));
    let backend = h.backend.clone();
    let in_flight = tokio::spawn(async move { backend.process_event(ping).await });

    let parked = wait_for_pending(&h.db).await;

    let a = {
        let pending = h.pending.clone();
        let id = parked.id.clone();
        tokio::spawn(async move { pending.approve(&id, ApproveScope::default()).await })
    };
    let b = {
        let pending = h.pending.clone();
        let id = parked.id.clone();
        tokio::spawn(async move { pending.approve(&id, ApproveScope::default()).await })
    };

    let outcomes = [a.await.unwrap(), b.await.unwrap()];
    assert_eq!(outcomes.iter().filter(|r| r.is_ok()).count(), 1);

    // Exactly one response event comes back to the client.
    let response = in_flight.await.unwrap().unwrap().expect("one response");
    let body = decrypt_response(&client, signer_pub, &response);
    assert_eq!(body["result"], "pong");
}

#[tokio::test]
async fn test_denied_park_yields_not_authorized() {
    let h = harness(None).await;
    let client = Keys::generate();
    let signer_pub = h.signer_keys.public_key();

    KeyUser::create(
        &h.db.pool,
        KEY_NAME,
        &client.public_key().to_hex(),
        TrustLevel::Paranoid,
        None,
    )
    .await
    .unwrap();

    let ping = request_event(&client, signer_pub, "d1", "ping", serde_json::json!([]));
    let backend = h.backend.clone();
    let in_flight = tokio::spawn(async move { backend.process_event(ping).await });

    let parked = wait_for_pending(&h.db).await;
    h.pending.deny(&parked.id).await.unwrap();

    let response = in_flight.await.unwrap().unwrap().expect("error response");
    let body = decrypt_response(&client, signer_pub, &response);
    assert_eq!(body["result"], "error");
    assert_eq!(body["error"], "Not authorized");
}

#[tokio::test(start_paused = true)]
async fn test_expired_park_sends_nothing() {
    let h = harness(None).await;
    let client = Keys::generate();
    let signer_pub = h.signer_keys.public_key();

    KeyUser::create(
        &h.db.pool,
        KEY_NAME,
        &client.public_key().to_hex(),
        TrustLevel::Paranoid,
        None,
    )
    .await
    .unwrap();

    let ping = request_event(&client, signer_pub, "e1", "ping", serde_json::json!([]));
    let outcome = h.backend.process_event(ping).await.unwrap();
    assert!(outcome.is_none(), "expired park produces no response");
}

#[tokio::test]
async fn test_nip44_methods_round_trip_for_trusted_app() {
    let h = harness(None).await;
    let client = Keys::generate();
    let peer = Keys::generate();
    let signer_pub = h.signer_keys.public_key();

    KeyUser::create(
        &h.db.pool,
        KEY_NAME,
        &client.public_key().to_hex(),
        TrustLevel::Full,
        None,
    )
    .await
    .unwrap();

    let encrypt = request_event(
        &client,
        signer_pub,
        "n1",
        "nip44_encrypt",
        serde_json::json!([peer.public_key().to_hex(), "for your eyes"]),
    );
    let response = h.backend.process_event(encrypt).await.unwrap().unwrap();
    let body = decrypt_response(&client, signer_pub, &response);
    let payload = body["result"].as_str().unwrap().to_string();

    // The peer can read it with the signer's public key.
    let plaintext = nip44::decrypt(peer.secret_key(), &signer_pub, &payload).unwrap();
    assert_eq!(plaintext, "for your eyes");

    let decrypt = request_event(
        &client,
        signer_pub,
        "n2",
        "nip44_decrypt",
        serde_json::json!([peer.public_key().to_hex(), payload]),
    );
    let response = h.backend.process_event(decrypt).await.unwrap().unwrap();
    let body = decrypt_response(&client, signer_pub, &response);
    assert_eq!(body["result"], "for your eyes");
}

#[tokio::test]
async fn test_suspended_app_is_denied() {
    let h = harness(None).await;
    let client = Keys::generate();
    let signer_pub = h.signer_keys.public_key();

    let user = KeyUser::create(
        &h.db.pool,
        KEY_NAME,
        &client.public_key().to_hex(),
        TrustLevel::Full,
        None,
    )
    .await
    .unwrap();
    KeyUser::suspend(&h.db.pool, user.id, None).await.unwrap();

    let ping = request_event(&client, signer_pub, "s1", "ping", serde_json::json!([]));
    let response = h.backend.process_event(ping).await.unwrap().unwrap();
    let body = decrypt_response(&client, signer_pub, &response);
    assert_eq!(body["result"], "error");
    assert_eq!(body["error"], "Not authorized");
}

#[tokio::test]
async fn test_nip04_is_rejected() {
    let h = harness(None).await;
    let client = Keys::generate();
    let signer_pub = h.signer_keys.public_key();

    let legacy = request_event(
        &client,
        signer_pub,
        "l1",
        "nip04_encrypt",
        serde_json::json!(["peer", "text"]),
    );
    let response = h.backend.process_event(legacy).await.unwrap().unwrap();
    let body = decrypt_response(&client, signer_pub, &response);
    assert_eq!(body["result"], "error");
    assert_eq!(body["error"], "NIP-04 is deprecated, use NIP-44");
}

#[tokio::test]
async fn test_bad_signature_is_dropped() {
    let h = harness(None).await;
    let client = Keys::generate();
    let signer_pub = h.signer_keys.public_key();

    let genuine = request_event(&client, signer_pub, "b1", "ping", serde_json::json!([]));
    // Re-assemble with altered content: id and sig no longer match.
    let forged = Event::new(
        genuine.id,
        genuine.pubkey,
        genuine.created_at,
        genuine.kind,
        genuine.tags.clone(),
        "tampered-content",
        genuine.sig,
    );

    let outcome = h.backend.process_event(Box::new(forged)).await.unwrap();
    assert!(outcome.is_none());
    assert_eq!(Request::count_pending(&h.db.pool).await.unwrap(), 0);
}

#[tokio::test]
async fn test_connection_token_materializes_policy() {
    let h = harness(None).await;
    let client = Keys::generate();
    let signer_pub = h.signer_keys.public_key();

    let rules = vec![PolicyRule {
        id: 0,
        policy_id: 0,
        method: "sign_event".to_string(),
        kind: Some("1".to_string()),
        allow: true,
    }];
    let policy = Policy::create(&h.db.pool, "notes-only", &rules).await.unwrap();
    let token = ConnectionToken::mint(&h.db.pool, KEY_NAME, Some(policy.id), None)
        .await
        .unwrap();

    let connect = request_event(
        &client,
        signer_pub,
        "t1",
        "connect",
        serde_json::json!([signer_pub.to_hex(), token.token]),
    );
    let response = h.backend.process_event(connect).await.unwrap().unwrap();
    let body = decrypt_response(&client, signer_pub, &response);
    assert_eq!(body["result"], "ack");

    let user = KeyUser::find_active(&h.db.pool, KEY_NAME, &client.public_key().to_hex())
        .await
        .unwrap()
        .expect("app created by token");
    let decision = SigningCondition::match_decision(&h.db.pool, user.id, "sign_event", Some(1))
        .await
        .unwrap();
    assert_eq!(decision, Some(true));

    let stored = ConnectionToken::find(&h.db.pool, token.id).await.unwrap();
    assert_eq!(stored.key_user_id, Some(user.id));
    assert!(stored.redeemed_at.is_some());

    // Second redemption of the same token falls through to the ACL and
    // gets an ack only because the app now exists with connect allowed.
    let connect = request_event(
        &client,
        signer_pub,
        "t2",
        "connect",
        serde_json::json!([signer_pub.to_hex(), token.token]),
    );
    let response = h.backend.process_event(connect).await.unwrap().unwrap();
    let body = decrypt_response(&client, signer_pub, &response);
    assert_eq!(body["result"], "ack");
}

struct FlakyPublisher {
    calls: std::sync::atomic::AtomicUsize,
    delivered: tokio::sync::Mutex<Vec<Event>>,
}

#[async_trait]
impl ResponsePublisher for FlakyPublisher {
    async fn publish(&self, event: Event) -> SignerResult<()> {
        let n = self
            .calls
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        if n == 0 {
            return Err(signet_signer::SignerError::relay(
                "no relay accepted the event",
            ));
        }
        self.delivered.lock().await.push(event);
        Ok(())
    }
}

/// A publish that fails while every relay is down is retried once after
/// the pool has had time to reconnect.
#[tokio::test(start_paused = true)]
async fn test_response_publish_retried_once() {
    let db = Database::connect_in_memory().await.unwrap();
    let bus = EventBus::new();
    let acl = Arc::new(AclEvaluator::new(db.pool.clone()));
    let pending = Arc::new(PendingQueue::new(db.pool.clone(), bus.clone(), acl.clone()));

    let signer_keys = Keys::generate();
    let publisher = Arc::new(FlakyPublisher {
        calls: std::sync::atomic::AtomicUsize::new(0),
        delivered: tokio::sync::Mutex::new(Vec::new()),
    });
    let ctx = BackendContext {
        pool: db.pool.clone(),
        acl,
        pending,
        bus,
        admin_secret: None,
    };
    let backend = Nip46Backend::new(
        KEY_NAME,
        signer_keys.clone(),
        ctx,
        publisher.clone(),
    );

    let client = Keys::generate();
    KeyUser::create(
        &db.pool,
        KEY_NAME,
        &client.public_key().to_hex(),
        TrustLevel::Full,
        None,
    )
    .await
    .unwrap();

    let ping = request_event(
        &client,
        signer_keys.public_key(),
        "f1",
        "ping",
        serde_json::json!([]),
    );
    backend.handle_event(ping).await.unwrap();

    assert_eq!(publisher.calls.load(std::sync::atomic::Ordering::SeqCst), 2);
    let delivered = publisher.delivered.lock().await;
    assert_eq!(delivered.len(), 1);
    let body = decrypt_response(&client, signer_keys.public_key(), &delivered[0]);
    assert_eq!(body["result"], "pong");
}

async fn wait_for_pending(db: &Database) -> Request {
    for _ in 0..100 {
        let rows = Request::list(
            &db.pool,
            Some(signet_core::types::request::RequestStatus::Pending),
            1,
            0,
        )
        .await
        .unwrap();
        if let Some(row) = rows.into_iter().next() {
            return row;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("request never parked");
}
