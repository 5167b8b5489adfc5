// ABOUTME: JSON config document holding relays, key material, and control-plane settings
// ABOUTME: Persisted atomically; the key vault is the only writer after startup

use crate::keyring::{self, EncryptedKey, SALT_LEN};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::env;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config parse error: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid kdf_salt: {0}")]
    InvalidSalt(String),
}

/// One entry in the `keys` map: either a plain bech32/hex secret key or
/// an AES-256-GCM envelope produced by the keyring.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum KeyEntry {
    Plain {
        key: String,
    },
    Encrypted {
        iv: String,
        data: String,
        /// Derived public key, kept so locked keys can still be listed.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pubkey: Option<String>,
    },
}

impl KeyEntry {
    pub fn is_encrypted(&self) -> bool {
        matches!(self, KeyEntry::Encrypted { .. })
    }

    pub fn as_encrypted(&self) -> Option<EncryptedKey> {
        match self {
            KeyEntry::Encrypted { iv, data, .. } => Some(EncryptedKey {
                iv: iv.clone(),
                data: data.clone(),
            }),
            KeyEntry::Plain { .. } => None,
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8984
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub relays: Vec<String>,
    #[serde(default)]
    pub keys: BTreeMap<String, KeyEntry>,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub admin_secret: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jwt_secret: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kdf_salt: Option<String>,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Load the config, or start from defaults when the file does not
    /// exist yet (first run).
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self {
                host: default_host(),
                port: default_port(),
                ..Default::default()
            })
        }
    }

    /// Write the document atomically: serialize into a temp file in the
    /// same directory, then rename over the original.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let raw = serde_json::to_string_pretty(self)?;
        let tmp = path.with_extension("json.tmp");
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(&tmp, raw)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    /// Ensure a KDF salt exists, generating one on first use. Returns
    /// true when the config was modified.
    pub fn ensure_salt(&mut self) -> bool {
        if self.kdf_salt.is_none() {
            self.kdf_salt = Some(hex::encode(keyring::generate_salt()));
            return true;
        }
        false
    }

    pub fn salt_bytes(&self) -> Result<[u8; SALT_LEN], ConfigError> {
        let raw = self
            .kdf_salt
            .as_deref()
            .ok_or_else(|| ConfigError::InvalidSalt("kdf_salt not set".to_string()))?;
        let decoded = hex::decode(raw).map_err(|e| ConfigError::InvalidSalt(e.to_string()))?;
        decoded
            .try_into()
            .map_err(|_| ConfigError::InvalidSalt(format!("expected {} bytes", SALT_LEN)))
    }

    /// Default config location: `SIGNET_CONFIG`, or `./data/config.json`
    /// in dev mode (`SIGNET_LOCAL`), or `config.json` in the working
    /// directory.
    pub fn default_path() -> PathBuf {
        if let Ok(path) = env::var("SIGNET_CONFIG") {
            return PathBuf::from(path);
        }
        if env::var("SIGNET_LOCAL").is_ok() {
            return PathBuf::from("data/config.json");
        }
        PathBuf::from("config.json")
    }

    /// Database location: `DATABASE_URL` (a file path), otherwise
    /// `signet.db` next to the config file.
    pub fn database_path(config_path: &Path) -> PathBuf {
        if let Ok(url) = env::var("DATABASE_URL") {
            let trimmed = url.strip_prefix("sqlite://").unwrap_or(&url);
            return PathBuf::from(trimmed);
        }
        match config_path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir.join("signet.db"),
            _ => PathBuf::from("signet.db"),
        }
    }
}
