// ABOUTME: Key vault owning custodied key material and its at-rest encryption
// ABOUTME: Config document and in-memory active-set mutate in the same logical step

use crate::bus::{EventBus, Topic};
use crate::config::{Config, ConfigError, KeyEntry};
use crate::keyring::{self, KeyringError, SecretBuf};
use crate::types::key_user::{KeyUser, KeyUserError};
use async_trait::async_trait;
use chrono::{Duration, Utc};
use nostr_sdk::prelude::*;
use serde::Serialize;
use sqlx::SqlitePool;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;

#[derive(Error, Debug)]
pub enum VaultError {
    #[error("Key not found")]
    NotFound,

    #[error("Key name is already in use")]
    NameInUse,

    #[error("Key name must not be empty")]
    EmptyName,

    #[error("Passphrase must not be empty")]
    EmptyPassphrase,

    #[error("Key is not encrypted")]
    NotEncrypted,

    #[error("Key is already encrypted")]
    AlreadyEncrypted,

    #[error("Key is not active")]
    NotActive,

    #[error("Passphrase required to delete an encrypted key")]
    PassphraseRequired,

    #[error("Invalid passphrase")]
    InvalidPassphrase,

    #[error("Invalid secret key encoding")]
    InvalidSecretEncoding,

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("App error: {0}")]
    KeyUser(#[from] KeyUserError),

    #[error("Nostr key error: {0}")]
    NostrKey(#[from] nostr_sdk::key::Error),

    #[error("NIP-19 error: {0}")]
    Nip19(#[from] nostr_sdk::nips::nip19::Error),
}

impl From<KeyringError> for VaultError {
    fn from(e: KeyringError) -> Self {
        match e {
            KeyringError::InvalidPassphrase => VaultError::InvalidPassphrase,
            KeyringError::InvalidEncoding(_) => VaultError::InvalidSecretEncoding,
            KeyringError::Crypto(msg) => {
                tracing::error!("Keyring failure: {}", msg);
                VaultError::InvalidPassphrase
            }
        }
    }
}

/// Started/stopped alongside key availability. The vault calls
/// `activate` when a key comes online and `deactivate` when it goes
/// away; both must be idempotent.
#[async_trait]
pub trait KeyActivation: Send + Sync {
    async fn activate(&self, key_name: &str, keys: Keys);
    async fn deactivate(&self, key_name: &str);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyStatus {
    /// Resident in memory with a running backend.
    Online,
    /// Encrypted at rest, not resident.
    Locked,
    /// Plain in the config but not activated.
    Offline,
}

#[derive(Debug, Clone, Serialize)]
pub struct KeyInfo {
    pub name: String,
    pub pubkey: Option<String>,
    pub npub: Option<String>,
    pub status: KeyStatus,
    pub apps: i64,
    pub requests_today: i64,
}

pub struct KeyVault {
    pool: SqlitePool,
    bus: EventBus,
    config_path: PathBuf,
    config: RwLock<Config>,
    active: RwLock<HashMap<String, Keys>>,
    activation: RwLock<Option<Arc<dyn KeyActivation>>>,
}

impl KeyVault {
    pub fn new(pool: SqlitePool, bus: EventBus, config_path: PathBuf, config: Config) -> Self {
        Self {
            pool,
            bus,
            config_path,
            config: RwLock::new(config),
            active: RwLock::new(HashMap::new()),
            activation: RwLock::new(None),
        }
    }

    pub async fn set_activation(&self, hook: Arc<dyn KeyActivation>) {
        *self.activation.write().await = Some(hook);
    }

    pub async fn config_snapshot(&self) -> Config {
        self.config.read().await.clone()
    }

    /// Bring every plain key in the config online. Encrypted keys stay
    /// locked until someone presents the passphrase.
    pub async fn start_configured(&self) -> Result<(), VaultError> {
        let entries: Vec<(String, KeyEntry)> = {
            let config = self.config.read().await;
            config
                .keys
                .iter()
                .map(|(name, entry)| (name.clone(), entry.clone()))
                .collect()
        };

        for (name, entry) in entries {
            match entry {
                KeyEntry::Plain { key } => match Keys::parse(&key) {
                    Ok(keys) => {
                        self.active.write().await.insert(name.clone(), keys.clone());
                        self.run_activation(&name, keys).await;
                        tracing::info!("Key '{}' online", name);
                    }
                    Err(e) => {
                        tracing::error!("Key '{}' has an unparseable secret: {}", name, e);
                    }
                },
                KeyEntry::Encrypted { .. } => {
                    tracing::info!("Key '{}' locked; unlock to activate", name);
                }
            }
        }
        Ok(())
    }

    pub async fn create(
        &self,
        name: &str,
        passphrase: Option<&str>,
        secret: Option<&str>,
    ) -> Result<KeyInfo, VaultError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(VaultError::EmptyName);
        }

        let keys = match secret {
            Some(raw) => Keys::parse(raw).map_err(|_| VaultError::InvalidSecretEncoding)?,
            None => Keys::generate(),
        };

        let mut config = self.config.write().await;
        if config.keys.contains_key(name) {
            return Err(VaultError::NameInUse);
        }

        let entry = match passphrase {
            Some(pass) if !pass.is_empty() => {
                config.ensure_salt();
                let salt = config.salt_bytes()?;
                let secret_buf = SecretBuf::new(keys.secret_key().to_secret_bytes());
                let wrapped = keyring::wrap(pass, &salt, &secret_buf)?;
                KeyEntry::Encrypted {
                    iv: wrapped.iv,
                    data: wrapped.data,
                    pubkey: Some(keys.public_key().to_hex()),
                }
            }
            Some(_) => return Err(VaultError::EmptyPassphrase),
            None => KeyEntry::Plain {
                key: keys.secret_key().to_bech32()?,
            },
        };

        config.keys.insert(name.to_string(), entry);
        config.save(&self.config_path)?;
        drop(config);

        self.active
            .write()
            .await
            .insert(name.to_string(), keys.clone());
        self.run_activation(name, keys.clone()).await;

        self.bus.publish(
            Topic::KeyCreated,
            serde_json::json!({ "name": name, "pubkey": keys.public_key().to_hex() }),
        );

        self.info(name).await
    }

    pub async fn unlock(&self, name: &str, passphrase: &str) -> Result<KeyInfo, VaultError> {
        let (wrapped, salt) = {
            let config = self.config.read().await;
            let entry = config.keys.get(name).ok_or(VaultError::NotFound)?;
            let wrapped = entry.as_encrypted().ok_or(VaultError::NotEncrypted)?;
            (wrapped, config.salt_bytes()?)
        };

        let secret = keyring::unwrap(passphrase, &salt, &wrapped)?;
        let secret_key = SecretKey::from_slice(secret.as_bytes())
            .map_err(|_| VaultError::InvalidSecretEncoding)?;
        let keys = Keys::new(secret_key);

        self.active
            .write()
            .await
            .insert(name.to_string(), keys.clone());
        self.run_activation(name, keys.clone()).await;

        self.bus.publish(
            Topic::KeyUnlocked,
            serde_json::json!({ "name": name, "pubkey": keys.public_key().to_hex() }),
        );
        tracing::info!("Key '{}' unlocked", name);

        self.info(name).await
    }

    pub async fn lock(&self, name: &str) -> Result<(), VaultError> {
        {
            let config = self.config.read().await;
            if !config.keys.contains_key(name) {
                return Err(VaultError::NotFound);
            }
        }

        if self.active.write().await.remove(name).is_none() {
            return Err(VaultError::NotActive);
        }
        self.run_deactivation(name).await;
        tracing::info!("Key '{}' locked", name);
        Ok(())
    }

    pub async fn list(&self) -> Result<Vec<KeyInfo>, VaultError> {
        let names: Vec<String> = {
            let config = self.config.read().await;
            config.keys.keys().cloned().collect()
        };

        let mut infos = Vec::with_capacity(names.len());
        for name in names {
            infos.push(self.info(&name).await?);
        }
        Ok(infos)
    }

    pub async fn rename(&self, old: &str, new: &str) -> Result<(), VaultError> {
        let new = new.trim();
        if new.is_empty() {
            return Err(VaultError::EmptyName);
        }

        let mut config = self.config.write().await;
        if !config.keys.contains_key(old) {
            return Err(VaultError::NotFound);
        }
        if config.keys.contains_key(new) {
            return Err(VaultError::NameInUse);
        }

        // All rows bearing the old name move in one transaction; the
        // config write follows before commit so a failure leaves both
        // sides untouched.
        let mut tx = self.pool.begin().await?;
        sqlx::query("UPDATE key_users SET key_name = ?1 WHERE key_name = ?2")
            .bind(new)
            .bind(old)
            .execute(&mut *tx)
            .await?;
        sqlx::query("UPDATE requests SET key_name = ?1 WHERE key_name = ?2")
            .bind(new)
            .bind(old)
            .execute(&mut *tx)
            .await?;
        sqlx::query("UPDATE connection_tokens SET key_name = ?1 WHERE key_name = ?2")
            .bind(new)
            .bind(old)
            .execute(&mut *tx)
            .await?;

        let entry = config.keys.remove(old).expect("checked above");
        config.keys.insert(new.to_string(), entry);
        if let Err(e) = config.save(&self.config_path) {
            // Roll the map back before surfacing the error.
            let entry = config.keys.remove(new).expect("just inserted");
            config.keys.insert(old.to_string(), entry);
            tx.rollback().await?;
            return Err(e.into());
        }
        tx.commit().await?;
        drop(config);

        let mut active = self.active.write().await;
        if let Some(keys) = active.remove(old) {
            active.insert(new.to_string(), keys.clone());
            drop(active);
            self.run_deactivation(old).await;
            self.run_activation(new, keys).await;
        }

        tracing::info!("Key '{}' renamed to '{}'", old, new);
        Ok(())
    }

    pub async fn set_passphrase(&self, name: &str, passphrase: &str) -> Result<(), VaultError> {
        if passphrase.is_empty() {
            return Err(VaultError::EmptyPassphrase);
        }

        let mut config = self.config.write().await;
        let entry = config.keys.get(name).ok_or(VaultError::NotFound)?;
        let plain = match entry {
            KeyEntry::Encrypted { .. } => return Err(VaultError::AlreadyEncrypted),
            KeyEntry::Plain { key } => key.clone(),
        };

        let keys = Keys::parse(&plain).map_err(|_| VaultError::InvalidSecretEncoding)?;
        config.ensure_salt();
        let salt = config.salt_bytes()?;
        let secret_buf = SecretBuf::new(keys.secret_key().to_secret_bytes());
        let wrapped = keyring::wrap(passphrase, &salt, &secret_buf)?;

        config.keys.insert(
            name.to_string(),
            KeyEntry::Encrypted {
                iv: wrapped.iv,
                data: wrapped.data,
                pubkey: Some(keys.public_key().to_hex()),
            },
        );
        config.save(&self.config_path)?;

        tracing::info!("Key '{}' is now encrypted at rest", name);
        Ok(())
    }

    /// Remove a key. An encrypted key demands passphrase proof. Returns
    /// the number of apps revoked alongside.
    pub async fn delete(&self, name: &str, passphrase: Option<&str>) -> Result<u64, VaultError> {
        let mut config = self.config.write().await;
        let entry = config.keys.get(name).ok_or(VaultError::NotFound)?;

        if let Some(wrapped) = entry.as_encrypted() {
            let pass = passphrase.ok_or(VaultError::PassphraseRequired)?;
            let salt = config.salt_bytes()?;
            keyring::unwrap(pass, &salt, &wrapped)?;
        }

        let revoked = KeyUser::revoke_all_for_key(&self.pool, name).await?;

        config.keys.remove(name);
        config.save(&self.config_path)?;
        drop(config);

        self.active.write().await.remove(name);
        self.run_deactivation(name).await;

        self.bus.publish(
            Topic::KeyDeleted,
            serde_json::json!({ "name": name, "revoked": revoked }),
        );
        tracing::info!("Key '{}' deleted ({} app(s) revoked)", name, revoked);

        Ok(revoked)
    }

    /// The resident keys for an online key, if any.
    pub async fn keys_for(&self, name: &str) -> Option<Keys> {
        self.active.read().await.get(name).cloned()
    }

    pub async fn online_keys(&self) -> Vec<(String, Keys)> {
        self.active
            .read()
            .await
            .iter()
            .map(|(name, keys)| (name.clone(), keys.clone()))
            .collect()
    }

    async fn info(&self, name: &str) -> Result<KeyInfo, VaultError> {
        let config = self.config.read().await;
        let entry = config.keys.get(name).ok_or(VaultError::NotFound)?;
        let active = self.active.read().await;

        let (status, pubkey) = match (active.get(name), entry) {
            (Some(keys), _) => (KeyStatus::Online, Some(keys.public_key())),
            (None, KeyEntry::Encrypted { pubkey, .. }) => (
                KeyStatus::Locked,
                pubkey.as_deref().and_then(|p| PublicKey::from_hex(p).ok()),
            ),
            (None, KeyEntry::Plain { key }) => (
                KeyStatus::Offline,
                Keys::parse(key).ok().map(|k| k.public_key()),
            ),
        };
        drop(active);
        drop(config);

        let apps = KeyUser::count_active_for_key(&self.pool, name).await?;
        let since = Utc::now() - Duration::hours(24);
        let requests_today = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM requests WHERE key_name = ?1 AND created_at >= ?2",
        )
        .bind(name)
        .bind(since)
        .fetch_one(&self.pool)
        .await?;

        Ok(KeyInfo {
            name: name.to_string(),
            pubkey: pubkey.map(|p| p.to_hex()),
            npub: pubkey.and_then(|p| p.to_bech32().ok()),
            status,
            apps,
            requests_today,
        })
    }

    async fn run_activation(&self, name: &str, keys: Keys) {
        let hook = self.activation.read().await.clone();
        if let Some(hook) = hook {
            hook.activate(name, keys).await;
        }
    }

    async fn run_deactivation(&self, name: &str) {
        let hook = self.activation.read().await.clone();
        if let Some(hook) = hook {
            hook.deactivate(name).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::Database;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingHook {
        activated: AtomicUsize,
        deactivated: AtomicUsize,
    }

    #[async_trait]
    impl KeyActivation for CountingHook {
        async fn activate(&self, _key_name: &str, _keys: Keys) {
            self.activated.fetch_add(1, Ordering::SeqCst);
        }
        async fn deactivate(&self, _key_name: &str) {
            self.deactivated.fetch_add(1, Ordering::SeqCst);
        }
    }

    async fn vault() -> (Database, tempfile::TempDir, Arc<KeyVault>) {
        let db = Database::connect_in_memory().await.unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let config = Config::load_or_default(&path).unwrap();
        let vault = Arc::new(KeyVault::new(
            db.pool.clone(),
            EventBus::new(),
            path,
            config,
        ));
        (db, dir, vault)
    }

    #[tokio::test]
    async fn test_lock_unlock_preserves_identity() {
        let (_db, _dir, vault) = vault().await;

        let created = vault.create("alice", Some("hunter2"), None).await.unwrap();
        assert_eq!(created.status, KeyStatus::Online);
        let npub = created.npub.clone().unwrap();

        vault.lock("alice").await.unwrap();
        let listed = vault.list().await.unwrap();
        assert_eq!(listed[0].status, KeyStatus::Locked);
        assert_eq!(listed[0].npub.as_deref(), Some(npub.as_str()));

        let unlocked = vault.unlock("alice", "hunter2").await.unwrap();
        assert_eq!(unlocked.status, KeyStatus::Online);
        assert_eq!(unlocked.npub.as_deref(), Some(npub.as_str()));
    }

    #[tokio::test]
    async fn test_unlock_wrong_passphrase() {
        let (_db, _dir, vault) = vault().await;
        vault.create("alice", Some("hunter2"), None).await.unwrap();
        vault.lock("alice").await.unwrap();

        let err = vault.unlock("alice", "wrong").await.unwrap_err();
        assert!(matches!(err, VaultError::InvalidPassphrase));
    }

    #[tokio::test]
    async fn test_create_duplicate_name() {
        let (_db, _dir, vault) = vault().await;
        vault.create("alice", None, None).await.unwrap();
        let err = vault.create("alice", None, None).await.unwrap_err();
        assert!(matches!(err, VaultError::NameInUse));
    }

    #[tokio::test]
    async fn test_create_with_existing_secret() {
        let (_db, _dir, vault) = vault().await;
        let keys = Keys::generate();
        let nsec = keys.secret_key().to_bech32().unwrap();

        let info = vault.create("alice", None, Some(&nsec)).await.unwrap();
        assert_eq!(info.pubkey.as_deref(), Some(keys.public_key().to_hex().as_str()));

        let err = vault
            .create("bob", None, Some("not-a-key"))
            .await
            .unwrap_err();
        assert!(matches!(err, VaultError::InvalidSecretEncoding));
    }

    #[tokio::test]
    async fn test_delete_requires_passphrase_proof() {
        let (db, _dir, vault) = vault().await;
        vault.create("alice", Some("hunter2"), None).await.unwrap();
        KeyUser::create(
            &db.pool,
            "alice",
            "pk1",
            crate::types::key_user::TrustLevel::Reasonable,
            None,
        )
        .await
        .unwrap();

        let err = vault.delete("alice", None).await.unwrap_err();
        assert!(matches!(err, VaultError::PassphraseRequired));

        let err = vault.delete("alice", Some("wrong")).await.unwrap_err();
        assert!(matches!(err, VaultError::InvalidPassphrase));

        let revoked = vault.delete("alice", Some("hunter2")).await.unwrap();
        assert_eq!(revoked, 1);
        assert!(vault.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rename_propagates_to_rows() {
        let (db, _dir, vault) = vault().await;
        vault.create("alice", None, None).await.unwrap();
        KeyUser::create(
            &db.pool,
            "alice",
            "pk1",
            crate::types::key_user::TrustLevel::Reasonable,
            None,
        )
        .await
        .unwrap();

        vault.rename("alice", "alicia").await.unwrap();

        let moved = KeyUser::find_active(&db.pool, "alicia", "pk1")
            .await
            .unwrap();
        assert!(moved.is_some());
        assert!(vault.keys_for("alicia").await.is_some());
        assert!(vault.keys_for("alice").await.is_none());

        let err = vault.rename("alicia", "").await.unwrap_err();
        assert!(matches!(err, VaultError::EmptyName));
    }

    #[tokio::test]
    async fn test_set_passphrase_once() {
        let (_db, _dir, vault) = vault().await;
        vault.create("alice", None, None).await.unwrap();

        vault.set_passphrase("alice", "hunter2").await.unwrap();
        let err = vault.set_passphrase("alice", "other").await.unwrap_err();
        assert!(matches!(err, VaultError::AlreadyEncrypted));

        // Still online; after lock the passphrase brings it back.
        vault.lock("alice").await.unwrap();
        vault.unlock("alice", "hunter2").await.unwrap();
    }

    #[tokio::test]
    async fn test_lock_error_set() {
        let (_db, _dir, vault) = vault().await;

        let err = vault.lock("ghost").await.unwrap_err();
        assert!(matches!(err, VaultError::NotFound));

        // A plain key locks too; it just goes offline instead of locked.
        vault.create("alice", None, None).await.unwrap();
        vault.lock("alice").await.unwrap();
        let listed = vault.list().await.unwrap();
        assert_eq!(listed[0].status, KeyStatus::Offline);

        let err = vault.lock("alice").await.unwrap_err();
        assert!(matches!(err, VaultError::NotActive));
    }

    #[tokio::test]
    async fn test_activation_hook_fires() {
        let (_db, _dir, vault) = vault().await;
        let hook = Arc::new(CountingHook {
            activated: AtomicUsize::new(0),
            deactivated: AtomicUsize::new(0),
        });
        vault.set_activation(hook.clone()).await;

        vault.create("alice", Some("hunter2"), None).await.unwrap();
        assert_eq!(hook.activated.load(Ordering::SeqCst), 1);

        vault.lock("alice").await.unwrap();
        assert_eq!(hook.deactivated.load(Ordering::SeqCst), 1);

        vault.unlock("alice", "hunter2").await.unwrap();
        assert_eq!(hook.activated.load(Ordering::SeqCst), 2);
    }
}
