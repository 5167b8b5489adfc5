// ABOUTME: Outbound relay pool: publish fan-out and per-subscription multiplexing
// ABOUTME: Tracks per-relay health and forces reconnection with exponential backoff

use crate::error::{SignerError, SignerResult};
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use nostr_sdk::prelude::*;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, RwLock};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Cap on adding/connecting a relay before giving up on it for now.
const RELAY_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Background health pass cadence.
const HEALTH_INTERVAL: Duration = Duration::from_secs(30);

const BACKOFF_BASE: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(30);

/// Async callback invoked for each matching event of a subscription.
pub type EventHandler = Arc<dyn Fn(Box<Event>) -> BoxFuture<'static, ()> + Send + Sync>;

/// Per-relay publish outcome callback, feeding the audit log.
pub type PublishReport = Arc<dyn Fn(&str, bool, &str) + Send + Sync>;

/// Invoked whenever any relay changes connection state.
pub type StatusListener = Arc<dyn Fn() + Send + Sync>;

/// Connection health of one relay as exposed on the control plane.
#[derive(Debug, Clone, Serialize)]
pub struct RelayHealth {
    pub url: String,
    pub connected: bool,
    pub last_connected_at: Option<DateTime<Utc>>,
    pub last_disconnected_at: Option<DateTime<Utc>>,
    pub attempts: u32,
    #[serde(skip)]
    next_attempt_at: Option<Instant>,
}

impl RelayHealth {
    fn new(url: String) -> Self {
        Self {
            url,
            connected: false,
            last_connected_at: None,
            last_disconnected_at: None,
            attempts: 0,
            next_attempt_at: None,
        }
    }
}

struct SubEntry {
    filter: Filter,
    handler: EventHandler,
    eose_seen: bool,
    eose_waiters: Vec<oneshot::Sender<()>>,
}

/// N relays behind one client. Subscriptions are registered here so
/// they can be replayed onto relays that join or reconnect later, and
/// incoming messages are demultiplexed by subscription id.
pub struct RelayPool {
    client: Client,
    health: RwLock<HashMap<String, RelayHealth>>,
    subs: RwLock<HashMap<SubscriptionId, SubEntry>>,
    report: RwLock<Option<PublishReport>>,
    status_listener: RwLock<Option<StatusListener>>,
}

impl RelayPool {
    /// Add and connect the configured relays. Individual failures are
    /// logged and retried by the health loop instead of failing startup.
    pub async fn new(urls: &[String]) -> SignerResult<Arc<Self>> {
        let client = Client::default();
        let mut health = HashMap::new();

        for url in urls {
            match tokio::time::timeout(RELAY_CONNECT_TIMEOUT, client.add_relay(url.as_str())).await
            {
                Ok(Ok(_)) => {
                    tracing::debug!("Added relay: {}", url);
                    health.insert(url.clone(), RelayHealth::new(url.clone()));
                }
                Ok(Err(e)) => {
                    tracing::warn!("Failed to add relay {}: {}", url, e);
                }
                Err(_) => {
                    tracing::warn!("Timeout adding relay {}", url);
                }
            }
        }

        match tokio::time::timeout(RELAY_CONNECT_TIMEOUT, client.connect()).await {
            Ok(_) => tracing::info!("Connecting to {} relay(s)", health.len()),
            Err(_) => tracing::warn!(
                "Timeout connecting to relays ({}s); continuing in background",
                RELAY_CONNECT_TIMEOUT.as_secs()
            ),
        }

        Ok(Arc::new(Self {
            client,
            health: RwLock::new(health),
            subs: RwLock::new(HashMap::new()),
            report: RwLock::new(None),
            status_listener: RwLock::new(None),
        }))
    }

    pub fn client(&self) -> Client {
        self.client.clone()
    }

    pub async fn set_publish_report(&self, report: PublishReport) {
        *self.report.write().await = Some(report);
    }

    pub async fn set_status_listener(&self, listener: StatusListener) {
        *self.status_listener.write().await = Some(listener);
    }

    /// Fan the event out to every connected relay. Resolves once the
    /// send has been dispatched; per-relay OKs are not awaited. Fails
    /// only when no relay accepted the frame.
    pub async fn publish(&self, event: &Event) -> SignerResult<()> {
        let event_id = event.id.to_hex();
        let output = match self.client.send_event(event.clone()).await {
            Ok(output) => output,
            Err(e) => {
                tracing::warn!("Publish failed on all relays: {}", e);
                return Err(SignerError::relay(format!("publish failed: {}", e)));
            }
        };

        let report = self.report.read().await.clone();
        if let Some(report) = &report {
            for url in output.success.iter() {
                report(&url.to_string(), true, &event_id);
            }
            for (url, reason) in output.failed.iter() {
                tracing::warn!("Relay {} rejected event {}: {:?}", url, event_id, reason);
                report(&url.to_string(), false, &event_id);
            }
        }

        if output.success.is_empty() {
            return Err(SignerError::relay("no relay accepted the event"));
        }
        Ok(())
    }

    /// Register a subscription on every current and future relay.
    pub async fn subscribe(
        &self,
        id: &str,
        filter: Filter,
        handler: EventHandler,
    ) -> SignerResult<()> {
        let sid = SubscriptionId::new(id);
        self.subs.write().await.insert(
            sid.clone(),
            SubEntry {
                filter: filter.clone(),
                handler,
                eose_seen: false,
                eose_waiters: Vec::new(),
            },
        );
        self.client.subscribe_with_id(sid, filter, None).await?;
        tracing::debug!("Subscription '{}' registered", id);
        Ok(())
    }

    pub async fn unsubscribe(&self, id: &str) {
        let sid = SubscriptionId::new(id);
        self.subs.write().await.remove(&sid);
        self.client.unsubscribe(sid).await;
        tracing::debug!("Subscription '{}' closed", id);
    }

    /// Wait until any relay signals EOSE for the subscription. Returns
    /// false on timeout or when the subscription is gone.
    pub async fn wait_for_eose(&self, id: &str, timeout: Duration) -> bool {
        let sid = SubscriptionId::new(id);
        let rx = {
            let mut subs = self.subs.write().await;
            match subs.get_mut(&sid) {
                None => return false,
                Some(entry) if entry.eose_seen => return true,
                Some(entry) => {
                    let (tx, rx) = oneshot::channel();
                    entry.eose_waiters.push(tx);
                    rx
                }
            }
        };
        matches!(tokio::time::timeout(timeout, rx).await, Ok(Ok(())))
    }

    /// Ask every non-connected relay to come back now, regardless of
    /// its backoff slot.
    pub async fn reset_disconnected(&self) {
        let stale = {
            let health = self.health.read().await;
            health.values().filter(|h| !h.connected).count()
        };
        if stale > 0 {
            tracing::info!("Forcing reconnect of {} relay(s)", stale);
            self.client.connect().await;
        }
    }

    pub async fn health_snapshot(&self) -> Vec<RelayHealth> {
        let mut snapshot: Vec<RelayHealth> = self.health.read().await.values().cloned().collect();
        snapshot.sort_by(|a, b| a.url.cmp(&b.url));
        snapshot
    }

    /// Spawn the notification dispatcher and the health loop.
    pub fn spawn(self: &Arc<Self>, cancel: CancellationToken) {
        let pool = self.clone();
        let token = cancel.clone();
        tokio::spawn(async move { pool.notification_loop(token).await });

        let pool = self.clone();
        tokio::spawn(async move { pool.health_loop(cancel).await });
    }

    async fn notification_loop(self: Arc<Self>, cancel: CancellationToken) {
        let mut notifications = self.client.notifications();
        loop {
            let notification = tokio::select! {
                _ = cancel.cancelled() => break,
                n = notifications.recv() => match n {
                    Ok(n) => n,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!("Notification stream lagged, {} dropped", skipped);
                        continue;
                    }
                    Err(_) => break,
                },
            };

            match notification {
                RelayPoolNotification::Event {
                    subscription_id,
                    event,
                    ..
                } => {
                    let handler = {
                        let subs = self.subs.read().await;
                        subs.get(&subscription_id).map(|entry| entry.handler.clone())
                    };
                    match handler {
                        Some(handler) => {
                            tokio::spawn(handler(event));
                        }
                        None => {
                            tracing::trace!(
                                "Event for unknown subscription {}, dropping",
                                subscription_id
                            );
                        }
                    }
                }
                RelayPoolNotification::Message { message, .. } => {
                    if let RelayMessage::EndOfStoredEvents(subscription_id) = message {
                        self.mark_eose(&subscription_id).await;
                    }
                }
                RelayPoolNotification::Shutdown => break,
                _ => {}
            }
        }
        tracing::debug!("Relay notification loop exited");
    }

    async fn mark_eose(&self, sid: &SubscriptionId) {
        let mut subs = self.subs.write().await;
        if let Some(entry) = subs.get_mut(sid) {
            entry.eose_seen = true;
            for waiter in entry.eose_waiters.drain(..) {
                let _ = waiter.send(());
            }
        }
    }

    async fn health_loop(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(HEALTH_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            self.health_pass().await;
        }
        tracing::debug!("Relay health loop exited");
    }

    /// One pass: refresh statuses and reconnect relays whose backoff
    /// slot has arrived. Delay grows `min(1s * 2^attempts, 30s)` and
    /// resets on a successful connect.
    async fn health_pass(&self) {
        let relays = self.client.relays().await;
        let now = Instant::now();
        let mut want_reconnect = false;
        let mut status_changed = false;

        {
            let mut health = self.health.write().await;
            for (url, relay) in relays.iter() {
                let key = url.to_string();
                let entry = health
                    .entry(key.clone())
                    .or_insert_with(|| RelayHealth::new(key));
                let connected = matches!(relay.status(), RelayStatus::Connected);

                if connected && !entry.connected {
                    entry.last_connected_at = Some(Utc::now());
                    entry.attempts = 0;
                    entry.next_attempt_at = None;
                    status_changed = true;
                    tracing::info!("Relay {} connected", entry.url);
                } else if !connected && entry.connected {
                    entry.last_disconnected_at = Some(Utc::now());
                    status_changed = true;
                    tracing::warn!("Relay {} disconnected", entry.url);
                }
                entry.connected = connected;

                if !connected {
                    let due = entry.next_attempt_at.map_or(true, |at| now >= at);
                    if due {
                        let delay = BACKOFF_BASE
                            .saturating_mul(1u32 << entry.attempts.min(5))
                            .min(BACKOFF_CAP);
                        entry.attempts = entry.attempts.saturating_add(1);
                        entry.next_attempt_at = Some(now + delay);
                        want_reconnect = true;
                        tracing::debug!(
                            "Relay {} reconnect attempt {} (next slot in {:?})",
                            entry.url,
                            entry.attempts,
                            delay
                        );
                    }
                }
            }
        }

        if status_changed {
            let listener = self.status_listener.read().await.clone();
            if let Some(listener) = listener {
                listener();
            }
        }

        if want_reconnect {
            self.client.connect().await;
        }
    }
}
