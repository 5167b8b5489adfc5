// ABOUTME: Backend supervisor bridging the key vault's activation hook to NIP-46 backends
// ABOUTME: Idempotent start/stop of one backend per key

use crate::backend::{BackendContext, Nip46Backend, ResponsePublisher};
use crate::subscriptions::SubscriptionManager;
use async_trait::async_trait;
use nostr_sdk::Keys;
use signet_core::vault::KeyActivation;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Registered with the vault so key create/unlock/lock/delete start and
/// stop the matching backend. A second activation for a running key is
/// a no-op.
pub struct BackendSupervisor {
    manager: Arc<SubscriptionManager>,
    ctx: BackendContext,
    publisher: Arc<dyn ResponsePublisher>,
    backends: Mutex<HashMap<String, Arc<Nip46Backend>>>,
}

impl BackendSupervisor {
    pub fn new(
        manager: Arc<SubscriptionManager>,
        ctx: BackendContext,
        publisher: Arc<dyn ResponsePublisher>,
    ) -> Arc<Self> {
        Arc::new(Self {
            manager,
            ctx,
            publisher,
            backends: Mutex::new(HashMap::new()),
        })
    }

    pub async fn running(&self) -> Vec<String> {
        self.backends.lock().await.keys().cloned().collect()
    }

    /// Stop every backend, draining each in turn. Used on shutdown.
    pub async fn stop_all(&self) {
        let drained: Vec<Arc<Nip46Backend>> = {
            let mut backends = self.backends.lock().await;
            backends.drain().map(|(_, b)| b).collect()
        };
        for backend in drained {
            backend.shutdown(&self.manager).await;
        }
    }
}

#[async_trait]
impl KeyActivation for BackendSupervisor {
    async fn activate(&self, key_name: &str, keys: Keys) {
        let mut backends = self.backends.lock().await;
        if backends.contains_key(key_name) {
            tracing::debug!("Backend for '{}' already running", key_name);
            return;
        }

        let backend = Nip46Backend::new(
            key_name,
            keys,
            self.ctx.clone(),
            self.publisher.clone(),
        );
        match backend.start(&self.manager).await {
            Ok(()) => {
                backends.insert(key_name.to_string(), backend);
            }
            Err(e) => {
                tracing::error!("Failed to start backend for '{}': {}", key_name, e);
            }
        }
    }

    async fn deactivate(&self, key_name: &str) {
        let backend = self.backends.lock().await.remove(key_name);
        match backend {
            Some(backend) => backend.shutdown(&self.manager).await,
            None => tracing::debug!("No backend running for '{}'", key_name),
        }
    }
}
