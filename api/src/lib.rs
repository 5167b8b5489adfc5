// ABOUTME: HTTP control plane for Signet
// ABOUTME: JSON endpoints plus an SSE stream, authenticated by bearer token and CSRF pair

pub mod auth;
pub mod error;
pub mod http;
pub mod state;

pub use error::{ApiError, ApiResult};
pub use state::{ApiState, ControlSettings, SharedState};
