use crate::auth;
use crate::http::{apps, connection, dashboard, events, keys, relays, requests, tokens};
use crate::state::SharedState;
use axum::{
    middleware,
    routing::{delete, get, patch, post},
    Router,
};
use tower_http::cors::{Any, CorsLayer};

/// Build the control-plane router. Read-only discovery endpoints get
/// permissive CORS; everything mutating sits behind the restricted
/// layer plus bearer auth and the CSRF pair.
pub fn api_routes(state: SharedState) -> Router {
    let public_cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let auth_cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any)
        .expose_headers(Any);

    let read_routes = Router::new()
        .route("/connection", get(connection::get_connection))
        .route("/relays", get(relays::get_relays))
        .route("/dashboard", get(dashboard::get_dashboard))
        .route("/events", get(events::stream_events))
        .route("/csrf-token", get(auth::issue_csrf_token))
        .layer(public_cors);

    let key_routes = Router::new()
        .route("/keys", get(keys::list_keys).post(keys::create_key))
        .route(
            "/keys/:name",
            patch(keys::rename_key).delete(keys::delete_key),
        )
        .route("/keys/:name/unlock", post(keys::unlock_key))
        .route("/keys/:name/set-passphrase", post(keys::set_passphrase));

    let app_routes = Router::new()
        .route("/apps", get(apps::list_apps))
        .route("/apps/:id", patch(apps::update_app))
        .route("/apps/:id/revoke", post(apps::revoke_app))
        .route("/apps/:id/suspend", post(apps::suspend_app))
        .route("/apps/:id/unsuspend", post(apps::unsuspend_app));

    let request_routes = Router::new()
        .route("/requests", get(requests::list_requests))
        .route(
            "/requests/:id",
            get(requests::get_request).post(requests::decide_request),
        )
        .route("/requests/batch", post(requests::decide_batch));

    let token_routes = Router::new()
        .route("/tokens", get(tokens::list_tokens).post(tokens::mint_token))
        .route("/tokens/:id", delete(tokens::delete_token));

    Router::new()
        .merge(read_routes)
        .merge(key_routes)
        .merge(app_routes)
        .merge(request_routes)
        .merge(token_routes)
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_csrf,
        ))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_bearer,
        ))
        .layer(auth_cors)
        .with_state(state)
}
