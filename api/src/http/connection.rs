use crate::error::ApiResult;
use crate::state::SharedState;
use axum::{extract::State, Json};
use serde::Serialize;

#[derive(Debug, Serialize)]
pub struct KeyConnection {
    pub name: String,
    pub pubkey: String,
    pub npub: Option<String>,
    pub bunker_uri: String,
}

#[derive(Debug, Serialize)]
pub struct ConnectionResponse {
    pub relays: Vec<String>,
    pub keys: Vec<KeyConnection>,
}

/// GET /connection: one bunker URI per online key, plus the relay list.
pub async fn get_connection(
    State(state): State<SharedState>,
) -> ApiResult<Json<ConnectionResponse>> {
    let mut keys = Vec::new();
    for (name, key_pair) in state.vault.online_keys().await {
        let pubkey = key_pair.public_key();
        keys.push(KeyConnection {
            name,
            pubkey: pubkey.to_hex(),
            npub: nostr_sdk::prelude::ToBech32::to_bech32(&pubkey).ok(),
            bunker_uri: bunker_uri(
                &pubkey.to_hex(),
                &state.settings.relays,
                state.settings.admin_secret.as_deref(),
            ),
        });
    }
    keys.sort_by(|a, b| a.name.cmp(&b.name));

    Ok(Json(ConnectionResponse {
        relays: state.settings.relays.clone(),
        keys,
    }))
}

/// `bunker://<pubkey>?relay=<url>[&relay=<url>…][&secret=<hex>]`
pub fn bunker_uri(pubkey_hex: &str, relays: &[String], secret: Option<&str>) -> String {
    let mut params: Vec<String> = relays
        .iter()
        .map(|r| format!("relay={}", urlencoding::encode(r)))
        .collect();
    if let Some(secret) = secret {
        params.push(format!("secret={}", urlencoding::encode(secret)));
    }
    if params.is_empty() {
        format!("bunker://{}", pubkey_hex)
    } else {
        format!("bunker://{}?{}", pubkey_hex, params.join("&"))
    }
}
