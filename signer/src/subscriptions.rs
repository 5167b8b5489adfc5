// ABOUTME: Subscription manager keeping every registered subscription live
// ABOUTME: Heartbeat with ping probes, sleep/wake detection, and debounced restart

use crate::error::SignerResult;
use crate::relay_pool::{EventHandler, RelayPool};
use async_trait::async_trait;
use nostr_sdk::prelude::*;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Default heartbeat cadence.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(60);

/// An elapsed tick longer than this multiple of the interval means the
/// host slept.
const SLEEP_FACTOR: u32 = 3;

/// How long a ping probe waits for EOSE from any relay.
const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Restart coalescing window and the quiet gap between close and
/// recreate.
const RESTART_DEBOUNCE: Duration = Duration::from_secs(2);
const RESTART_QUIESCENCE: Duration = Duration::from_millis(500);

/// The relay-facing operations the manager needs. The pool implements
/// this; tests substitute a recording double.
#[async_trait]
pub trait SubscriptionTransport: Send + Sync {
    async fn open(&self, id: &str, filter: Filter, handler: EventHandler) -> SignerResult<()>;
    async fn close(&self, id: &str);
    /// Open a throwaway subscription guaranteed to return no events and
    /// report whether any relay answered with EOSE in time.
    async fn probe(&self, timeout: Duration) -> bool;
    async fn reset_disconnected(&self);
}

#[async_trait]
impl SubscriptionTransport for RelayPool {
    async fn open(&self, id: &str, filter: Filter, handler: EventHandler) -> SignerResult<()> {
        self.subscribe(id, filter, handler).await
    }

    async fn close(&self, id: &str) {
        self.unsubscribe(id).await;
    }

    async fn probe(&self, timeout: Duration) -> bool {
        let id = format!("probe-{}", Uuid::new_v4());
        // A future `since` filter matches nothing, so the only possible
        // answer is EOSE.
        let one_year_ahead = Timestamp::from(Timestamp::now().as_u64() + 31_536_000);
        let filter = Filter::new()
            .kind(Kind::Metadata)
            .since(one_year_ahead)
            .limit(1);
        let handler: EventHandler = Arc::new(|_event| Box::pin(async {}));

        if self.subscribe(&id, filter, handler).await.is_err() {
            return false;
        }
        let alive = self.wait_for_eose(&id, timeout).await;
        self.unsubscribe(&id).await;
        alive
    }

    async fn reset_disconnected(&self) {
        RelayPool::reset_disconnected(self).await;
    }
}

struct ManagedSub {
    filter: Filter,
    handler: EventHandler,
}

/// Invariant: every registered subscription is live on at least one
/// relay. The manager keeps each (id, filter, handler) triple so it can
/// recreate them wholesale after a connectivity gap or host sleep.
pub struct SubscriptionManager {
    transport: Arc<dyn SubscriptionTransport>,
    subs: Mutex<HashMap<String, ManagedSub>>,
    interval: Duration,
    restart_pending: AtomicBool,
    restarts: AtomicU64,
}

impl SubscriptionManager {
    pub fn new(transport: Arc<dyn SubscriptionTransport>) -> Self {
        Self::with_interval(transport, HEARTBEAT_INTERVAL)
    }

    pub fn with_interval(transport: Arc<dyn SubscriptionTransport>, interval: Duration) -> Self {
        Self {
            transport,
            subs: Mutex::new(HashMap::new()),
            interval,
            restart_pending: AtomicBool::new(false),
            restarts: AtomicU64::new(0),
        }
    }

    pub async fn register(
        &self,
        id: &str,
        filter: Filter,
        handler: EventHandler,
    ) -> SignerResult<()> {
        self.subs.lock().await.insert(
            id.to_string(),
            ManagedSub {
                filter: filter.clone(),
                handler: handler.clone(),
            },
        );
        self.transport.open(id, filter, handler).await
    }

    pub async fn close(&self, id: &str) {
        self.subs.lock().await.remove(id);
        self.transport.close(id).await;
    }

    /// How many full restarts have run. Diagnostics only.
    pub fn restart_count(&self) -> u64 {
        self.restarts.load(Ordering::SeqCst)
    }

    /// Coalesce restart requests: the first caller starts a timer and
    /// later callers within the window piggyback on it.
    pub fn schedule_restart(self: &Arc<Self>) {
        if self.restart_pending.swap(true, Ordering::SeqCst) {
            return;
        }
        let manager = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(RESTART_DEBOUNCE).await;
            manager.restart_all().await;
        });
    }

    async fn restart_all(self: Arc<Self>) {
        let ids: Vec<String> = { self.subs.lock().await.keys().cloned().collect() };
        tracing::info!("Restarting {} subscription(s)", ids.len());

        for id in &ids {
            self.transport.close(id).await;
        }
        tokio::time::sleep(RESTART_QUIESCENCE).await;

        // Clear the flag before recreating so a failure mid-recreate can
        // schedule another pass.
        self.restart_pending.store(false, Ordering::SeqCst);

        for id in &ids {
            let triple = {
                let subs = self.subs.lock().await;
                subs.get(id)
                    .map(|s| (s.filter.clone(), s.handler.clone()))
            };
            if let Some((filter, handler)) = triple {
                if let Err(e) = self.transport.open(id, filter, handler).await {
                    tracing::error!("Failed to recreate subscription '{}': {}", id, e);
                }
            }
        }
        self.restarts.fetch_add(1, Ordering::SeqCst);
    }

    /// Heartbeat loop. Detects host sleep by comparing wall progress
    /// against the expected tick, and otherwise ping-probes the relays.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut last_tick = tokio::time::Instant::now();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => {}
            }

            let now = tokio::time::Instant::now();
            let elapsed = now - last_tick;
            last_tick = now;

            if elapsed > self.interval * SLEEP_FACTOR {
                tracing::warn!(
                    "Clock jumped {:?} (interval {:?}); assuming wake from sleep",
                    elapsed,
                    self.interval
                );
                self.schedule_restart();
                continue;
            }

            if !self.transport.probe(PROBE_TIMEOUT).await {
                tracing::warn!("Relay ping probe failed; resetting connections");
                self.transport.reset_disconnected().await;
                self.schedule_restart();
            }
        }
        tracing::debug!("Subscription heartbeat exited");
    }
}
