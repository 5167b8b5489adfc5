use signet_core::acl::AclEvaluator;
use signet_core::bus::EventBus;
use signet_core::config::Config;
use signet_core::pending::PendingQueue;
use signet_core::vault::KeyVault;
use signet_signer::RelayPool;
use sqlx::SqlitePool;
use std::sync::Arc;

/// Read-only slice of the config the control plane needs. Taken at
/// startup; hot-reload would be a new snapshot and an atomic swap.
#[derive(Debug, Clone)]
pub struct ControlSettings {
    pub base_url: Option<String>,
    pub admin_secret: Option<String>,
    pub jwt_secret: Option<String>,
    pub relays: Vec<String>,
}

impl ControlSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            base_url: config.base_url.clone(),
            admin_secret: config.admin_secret.clone(),
            jwt_secret: config.jwt_secret.clone(),
            relays: config.relays.clone(),
        }
    }

    /// With neither an admin secret nor a JWT secret configured, the
    /// control plane is open; meant for local development only.
    pub fn auth_enabled(&self) -> bool {
        self.admin_secret.is_some() || self.jwt_secret.is_some()
    }
}

pub struct ApiState {
    pub pool: SqlitePool,
    pub vault: Arc<KeyVault>,
    pub acl: Arc<AclEvaluator>,
    pub pending: Arc<PendingQueue>,
    pub bus: EventBus,
    pub relays: Arc<RelayPool>,
    pub settings: ControlSettings,
}

pub type SharedState = Arc<ApiState>;
