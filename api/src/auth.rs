// ABOUTME: Control-plane authentication: bearer secret or JWT, plus double-submit CSRF
// ABOUTME: With no secrets configured the plane is open (local development)

use crate::error::ApiError;
use crate::state::SharedState;
use axum::{
    extract::{Request, State},
    http::{header, HeaderMap, Method},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use signet_core::keyring::timing_safe_eq;

pub const CSRF_COOKIE: &str = "signet_csrf";
pub const CSRF_HEADER: &str = "x-csrf-token";

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    #[serde(default)]
    sub: Option<String>,
    exp: usize,
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
}

fn cookie_value<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    let cookies = headers.get(header::COOKIE)?.to_str().ok()?;
    cookies.split(';').find_map(|pair| {
        let (key, value) = pair.trim().split_once('=')?;
        (key == name).then_some(value)
    })
}

fn token_is_valid(state: &SharedState, token: &str) -> bool {
    if let Some(admin) = state.settings.admin_secret.as_deref() {
        if timing_safe_eq(token.as_bytes(), admin.as_bytes()) {
            return true;
        }
    }
    if let Some(jwt_secret) = state.settings.jwt_secret.as_deref() {
        let validation = Validation::new(Algorithm::HS256);
        if decode::<Claims>(
            token,
            &DecodingKey::from_secret(jwt_secret.as_bytes()),
            &validation,
        )
        .is_ok()
        {
            return true;
        }
    }
    false
}

/// Bearer auth for every route. Accepts the admin secret verbatim or,
/// when configured, an HS256 JWT signed with the JWT secret.
pub async fn require_bearer(
    State(state): State<SharedState>,
    request: Request,
    next: Next,
) -> Response {
    if !state.settings.auth_enabled() {
        return next.run(request).await;
    }

    match bearer_token(request.headers()) {
        Some(token) if token_is_valid(&state, token) => next.run(request).await,
        Some(_) => ApiError::unauthorized("Invalid bearer token").into_response(),
        None => ApiError::unauthorized("Missing bearer token").into_response(),
    }
}

/// Double-submit CSRF on mutating verbs: the `signet_csrf` cookie must
/// match the `x-csrf-token` header. Skipped while auth is disabled.
pub async fn require_csrf(
    State(state): State<SharedState>,
    request: Request,
    next: Next,
) -> Response {
    if !state.settings.auth_enabled() {
        return next.run(request).await;
    }
    if matches!(
        *request.method(),
        Method::GET | Method::HEAD | Method::OPTIONS
    ) {
        return next.run(request).await;
    }

    let headers = request.headers();
    let cookie = cookie_value(headers, CSRF_COOKIE);
    let header = headers.get(CSRF_HEADER).and_then(|v| v.to_str().ok());

    match (cookie, header) {
        (Some(cookie), Some(header))
            if timing_safe_eq(cookie.as_bytes(), header.as_bytes()) =>
        {
            next.run(request).await
        }
        _ => ApiError::forbidden("CSRF token missing or mismatched").into_response(),
    }
}

/// GET /csrf-token: issue the cookie half of the pair and return the
/// token for the header half. The cookie is intentionally readable by
/// scripts; double-submit only needs same-origin, not secrecy.
pub async fn issue_csrf_token() -> Response {
    let mut raw = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut raw);
    let token = hex::encode(raw);

    let cookie = format!("{}={}; Path=/; SameSite=Strict", CSRF_COOKIE, token);
    (
        [(header::SET_COOKIE, cookie)],
        Json(serde_json::json!({ "token": token })),
    )
        .into_response()
}
