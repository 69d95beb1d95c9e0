// Copyright (c) 2024-2025 The TezSign Foundation

//! Signer HTTP surface
//!
//! A thin adapter between the block producer's remote-signer protocol and
//! the broker link. Three routes matter: `GET /authorized_keys` (fixed
//! empty object), `GET /keys/:addr` (public key lookup) and
//! `POST /keys/:addr` (sign). `POST /sign` exists but is disabled.
//!
//! Remote error codes from the gadget map onto HTTP statuses:
//! key-not-found → 404, locked → 403, stale watermark → 409, bad
//! payload → 400, everything else → 500.

use std::{collections::HashSet, sync::Arc, time::Duration};

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use log::debug;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use tezsign_broker::Broker;
use tezsign_core::{b58, bls};
use tezsign_wire::{rpc::KeyStatus, rpc_code};

use crate::client::{self, ClientError};

/// Per-request budget; covers the USB round trip with margin.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Swappable broker slot: the supervisor replaces the broker when the
/// gadget link is rebuilt, HTTP handlers use whatever is current.
pub type BrokerSlot = Arc<tokio::sync::RwLock<Option<Arc<Broker>>>>;

#[derive(Clone)]
pub struct AppState {
    pub broker: BrokerSlot,
    /// tz4 addresses the host is willing to serve.
    pub allowed: Arc<HashSet<String>>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/authorized_keys", get(authorized_keys))
        .route("/keys/:addr", get(get_key).post(sign_key))
        .route("/sign", post(sign_disabled))
        .with_state(state)
}

/// Map a remote error code to its HTTP status.
fn remote_status(code: u32) -> StatusCode {
    match code {
        rpc_code::KEY_NOT_FOUND => StatusCode::NOT_FOUND,
        rpc_code::KEY_LOCKED => StatusCode::FORBIDDEN,
        rpc_code::STALE_WATERMARK => StatusCode::CONFLICT,
        rpc_code::BAD_PAYLOAD => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "error": message.into() }))).into_response()
}

fn client_error_response(err: ClientError) -> Response {
    match err {
        ClientError::Remote(re) => error_response(remote_status(re.code), re.message),
        other => error_response(StatusCode::INTERNAL_SERVER_ERROR, other.to_string()),
    }
}

async fn current_broker(state: &AppState) -> Result<Arc<Broker>, Response> {
    state.broker.read().await.clone().ok_or_else(|| {
        error_response(StatusCode::INTERNAL_SERVER_ERROR, "gadget unavailable")
    })
}

/// The baker's consensus key configuration lives on its side; an empty
/// object tells it to use whatever it asks us to sign with.
async fn authorized_keys() -> Json<serde_json::Value> {
    Json(json!({}))
}

fn find_status_by_tz4(keys: &[KeyStatus], tz4: &str) -> Option<KeyStatus> {
    keys.iter()
        .find(|k| b58::check_encode(b58::PFX_TZ4, &k.address) == tz4)
        .cloned()
}

async fn get_key(State(state): State<AppState>, Path(addr): Path<String>) -> Response {
    if !state.allowed.contains(&addr) {
        return error_response(StatusCode::NOT_FOUND, "key not found");
    }

    let broker = match current_broker(&state).await {
        Ok(b) => b,
        Err(resp) => return resp,
    };

    let ct = CancellationToken::new();
    let status =
        match tokio::time::timeout(REQUEST_TIMEOUT, client::req_status(&broker, &ct)).await {
            Ok(Ok(status)) => status,
            Ok(Err(err)) => return client_error_response(err),
            Err(_) => return error_response(StatusCode::INTERNAL_SERVER_ERROR, "gadget timeout"),
        };

    match find_status_by_tz4(&status, &addr) {
        Some(key) => {
            let blpk = bls::encode_public_key(&key.public_key);
            Json(json!({ "public_key": blpk })).into_response()
        }
        None => error_response(StatusCode::NOT_FOUND, "key not found"),
    }
}

async fn sign_key(
    State(state): State<AppState>,
    Path(addr): Path<String>,
    Json(payload_hex): Json<String>,
) -> Response {
    if !state.allowed.contains(&addr) {
        return error_response(StatusCode::NOT_FOUND, "key not found");
    }

    let raw = match hex::decode(payload_hex.trim_start_matches("0x")) {
        Ok(raw) => raw,
        Err(err) => {
            return error_response(StatusCode::BAD_REQUEST, format!("bad payload hex: {err}"))
        }
    };

    let address = match decode_tz4(&addr) {
        Ok(address) => address,
        Err(err) => return error_response(StatusCode::BAD_REQUEST, err),
    };

    let broker = match current_broker(&state).await {
        Ok(b) => b,
        Err(resp) => return resp,
    };

    debug!("sign request addr={addr} payload_len={}", raw.len());

    let ct = CancellationToken::new();
    let sig = match tokio::time::timeout(
        REQUEST_TIMEOUT,
        client::req_sign(&broker, &ct, address, &raw),
    )
    .await
    {
        Ok(Ok(sig)) => sig,
        Ok(Err(err)) => return client_error_response(err),
        Err(_) => return error_response(StatusCode::INTERNAL_SERVER_ERROR, "gadget timeout"),
    };

    Json(json!({ "signature": bls::encode_signature(&sig) })).into_response()
}

/// Present but disabled; the address-based route is the supported path.
async fn sign_disabled() -> Response {
    error_response(StatusCode::NOT_IMPLEMENTED, "not implemented")
}

/// Decode a tz4 string to its 20-byte address payload.
pub fn decode_tz4(addr: &str) -> Result<[u8; 20], String> {
    let payload = b58::check_decode_len(b58::PFX_TZ4, addr, 20)
        .map_err(|err| format!("bad tz4 address: {err}"))?;
    let mut out = [0u8; 20];
    out.copy_from_slice(&payload);
    Ok(out)
}

#[cfg(test)]
mod test {
    use super::*;
    use tezsign_wire::rpc::{LockState, Watermark};

    #[test]
    fn remote_codes_map_to_statuses() {
        assert_eq!(remote_status(rpc_code::KEY_NOT_FOUND), StatusCode::NOT_FOUND);
        assert_eq!(remote_status(rpc_code::KEY_LOCKED), StatusCode::FORBIDDEN);
        assert_eq!(remote_status(rpc_code::STALE_WATERMARK), StatusCode::CONFLICT);
        assert_eq!(remote_status(rpc_code::BAD_PAYLOAD), StatusCode::BAD_REQUEST);
        assert_eq!(remote_status(0), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(remote_status(99), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn tz4_roundtrip() {
        let address = [5u8; 20];
        let tz4 = b58::check_encode(b58::PFX_TZ4, &address);
        assert_eq!(decode_tz4(&tz4).unwrap(), address);

        assert!(decode_tz4("tz4garbage").is_err());
        assert!(decode_tz4("").is_err());
    }

    #[test]
    fn finds_status_by_tz4() {
        let mk = |fill: u8| KeyStatus {
            address: [fill; 20],
            public_key: [fill; 48],
            lock_state: LockState::Unlocked,
            watermarks: [Watermark::default(); 3],
        };
        let keys = vec![mk(1), mk(2)];

        let tz4 = b58::check_encode(b58::PFX_TZ4, &[2u8; 20]);
        let found = find_status_by_tz4(&keys, &tz4).unwrap();
        assert_eq!(found.address, [2u8; 20]);

        assert!(find_status_by_tz4(&keys, "tz4missing").is_none());
    }
}
