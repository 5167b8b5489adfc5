// ABOUTME: Typed error handling for the signer side
// ABOUTME: Structured variants instead of Box<dyn Error> so callers can branch on failure class

use nostr_sdk::prelude::*;
use signet_core::acl::AclError;
use signet_core::pending::PendingError;
use thiserror::Error;

/// Errors that can occur while serving NIP-46 requests.
#[derive(Debug, Error)]
pub enum SignerError {
    /// Database operation failed
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// ACL evaluation failed
    #[error("ACL error: {0}")]
    Acl(#[from] AclError),

    /// Pending-queue operation failed
    #[error("Pending queue error: {0}")]
    Pending(#[from] PendingError),

    /// NIP-44 encryption/decryption failed
    #[error("NIP-44 error: {0}")]
    Nip44(#[from] nip44::Error),

    /// Event building failed
    #[error("Event builder error: {0}")]
    EventBuilder(#[from] nostr_sdk::event::builder::Error),

    /// Relay client operation failed
    #[error("Client error: {0}")]
    Client(#[from] nostr_sdk::client::Error),

    /// JSON parsing failed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Tag parsing failed
    #[error("Tag parse error: {0}")]
    TagParse(#[from] nostr_sdk::event::tag::Error),

    /// Invalid cryptographic key format
    #[error("Invalid key: {0}")]
    InvalidKey(#[from] nostr_sdk::key::Error),

    /// Missing required request parameter
    #[error("Missing parameter: {0}")]
    MissingParameter(&'static str),

    /// Invalid request format or data
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Request not allowed by policy
    #[error("Not authorized")]
    Unauthorized,

    /// Relay connection or publish failed; retried by the caller where
    /// the operation is idempotent
    #[error("Relay error: {0}")]
    Relay(String),

    /// Internal logic error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl SignerError {
    pub fn invalid_request(msg: impl Into<String>) -> Self {
        Self::InvalidRequest(msg.into())
    }

    pub fn relay(msg: impl Into<String>) -> Self {
        Self::Relay(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}

/// Result type for signer operations
pub type SignerResult<T> = Result<T, SignerError>;
