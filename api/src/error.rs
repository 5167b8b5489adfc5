use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use signet_core::acl::AclError;
use signet_core::pending::PendingError;
use signet_core::types::activity::ActivityError;
use signet_core::types::connection_token::TokenError;
use signet_core::types::key_user::KeyUserError;
use signet_core::types::policy::PolicyError;
use signet_core::types::request::RequestError;
use signet_core::types::signing_condition::ConditionError;
use signet_core::vault::VaultError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    Unauthorized(String),

    #[error("{0}")]
    Forbidden(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::BadRequest(msg.into())
    }

    pub fn unauthorized(msg: impl Into<String>) -> Self {
        Self::Unauthorized(msg.into())
    }

    pub fn forbidden(msg: impl Into<String>) -> Self {
        Self::Forbidden(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}

impl From<VaultError> for ApiError {
    fn from(e: VaultError) -> Self {
        match e {
            VaultError::NotFound => Self::NotFound(e.to_string()),
            VaultError::NameInUse | VaultError::AlreadyEncrypted => Self::Conflict(e.to_string()),
            VaultError::EmptyName
            | VaultError::EmptyPassphrase
            | VaultError::NotEncrypted
            | VaultError::NotActive
            | VaultError::PassphraseRequired
            | VaultError::InvalidPassphrase
            | VaultError::InvalidSecretEncoding => Self::BadRequest(e.to_string()),
            other => Self::Internal(other.to_string()),
        }
    }
}

impl From<RequestError> for ApiError {
    fn from(e: RequestError) -> Self {
        match e {
            RequestError::NotFound => Self::NotFound(e.to_string()),
            RequestError::AlreadyProcessed => Self::Conflict(e.to_string()),
            RequestError::Database(err) => Self::Database(err),
        }
    }
}

impl From<PendingError> for ApiError {
    fn from(e: PendingError) -> Self {
        match e {
            PendingError::Request(inner) => inner.into(),
            PendingError::Database(err) => Self::Database(err),
            other => Self::Internal(other.to_string()),
        }
    }
}

impl From<KeyUserError> for ApiError {
    fn from(e: KeyUserError) -> Self {
        match e {
            KeyUserError::NotFound => Self::NotFound(e.to_string()),
            KeyUserError::AlreadyRevoked => Self::Conflict(e.to_string()),
            KeyUserError::Database(err) => Self::Database(err),
        }
    }
}

impl From<TokenError> for ApiError {
    fn from(e: TokenError) -> Self {
        match e {
            TokenError::NotFound => Self::NotFound(e.to_string()),
            TokenError::Database(err) => Self::Database(err),
        }
    }
}

impl From<PolicyError> for ApiError {
    fn from(e: PolicyError) -> Self {
        match e {
            PolicyError::NotFound => Self::NotFound(e.to_string()),
            PolicyError::Database(err) => Self::Database(err),
        }
    }
}

impl From<ActivityError> for ApiError {
    fn from(e: ActivityError) -> Self {
        match e {
            ActivityError::Database(err) => Self::Database(err),
        }
    }
}

impl From<ConditionError> for ApiError {
    fn from(e: ConditionError) -> Self {
        match e {
            ConditionError::Database(err) => Self::Database(err),
        }
    }
}

impl From<AclError> for ApiError {
    fn from(e: AclError) -> Self {
        Self::Internal(e.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ApiError::Database(e) => {
                tracing::error!("Database error: {}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Something went wrong. Please try again.".to_string(),
                )
            }
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            ApiError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg.clone()),
            ApiError::Forbidden(msg) => (StatusCode::FORBIDDEN, msg.clone()),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg.clone()),
            ApiError::Internal(msg) => {
                tracing::error!("Internal error: {}", msg);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Something went wrong. Please try again.".to_string(),
                )
            }
        };

        let body = Json(json!({ "error": message }));
        (status, body).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
