// Copyright (c) 2024-2025 The TezSign Foundation

//! RPC dispatch: broker payloads in, keychain operations out
//!
//! Every inbound request decodes to a [Message], runs against the
//! keychain, and produces a response message. Keychain failures become
//! [Message::Error] frames with the shared remote error codes; the HTTP
//! adapter on the host translates those into status codes.

use std::sync::Arc;

use log::{debug, warn};

use tezsign_core::{health::Monitor, Keychain, KeychainError};
use tezsign_wire::{rpc::Message, rpc_code};

fn remote_code(err: &KeychainError) -> u32 {
    match err {
        KeychainError::KeyNotFound => rpc_code::KEY_NOT_FOUND,
        KeychainError::KeyLocked => rpc_code::KEY_LOCKED,
        KeychainError::StaleWatermark { .. } => rpc_code::STALE_WATERMARK,
        KeychainError::BadPayload(_) => rpc_code::BAD_PAYLOAD,
        // Corruption is not retryable by the caller; report it as a lock.
        KeychainError::Corrupted => rpc_code::KEY_LOCKED,
    }
}

fn error_response(err: KeychainError) -> Message {
    Message::error(remote_code(&err), err.to_string())
}

/// Handle one decoded request message.
fn dispatch(keychain: &Keychain, monitor: &Arc<Monitor>, msg: Message) -> Message {
    match msg {
        Message::SignRequest { address, payload } => {
            let Some(alias) = keychain.alias_for_address(&address) else {
                return error_response(KeychainError::KeyNotFound);
            };
            match keychain.sign(&alias, &payload) {
                Ok(signature) => {
                    monitor.record_activity();
                    Message::SignResponse { signature }
                }
                Err(err) => {
                    debug!("sign refused alias={alias} err={err}");
                    error_response(err)
                }
            }
        }

        Message::StatusRequest => Message::StatusResponse {
            keys: keychain.status(),
        },

        Message::UnlockRequest {
            address,
            passphrase,
        } => {
            let Some(alias) = keychain.alias_for_address(&address) else {
                return error_response(KeychainError::KeyNotFound);
            };
            match keychain.unlock(&alias, &passphrase) {
                Ok(lock_state) => Message::UnlockResponse { lock_state },
                Err(err) => error_response(err),
            }
        }

        // Responses and errors are not requests; ignore politely.
        other => {
            warn!("unexpected rpc request {other:?}");
            Message::error(rpc_code::BAD_PAYLOAD, "not a request")
        }
    }
}

/// Build the broker [Handler][tezsign_broker::Handler] for this gadget.
pub fn rpc_handler(
    keychain: Arc<Keychain>,
    monitor: Arc<Monitor>,
) -> tezsign_broker::Handler {
    tezsign_broker::handler(move |_ct, payload: Vec<u8>| {
        let keychain = keychain.clone();
        let monitor = monitor.clone();
        async move {
            let _guard = monitor.task_guard();
            let resp = match Message::decode(&payload) {
                Ok(msg) => dispatch(&keychain, &monitor, msg),
                Err(err) => {
                    warn!("undecodable rpc request err={err}");
                    Message::error(rpc_code::BAD_PAYLOAD, err.to_string())
                }
            };
            Ok(resp.encode())
        }
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use std::collections::HashMap;
    use std::io;
    use std::sync::Mutex;

    use tezsign_core::{bls, Watermarks, WatermarkStore};
    use tezsign_wire::rpc::LockState;

    struct MemStore(Mutex<HashMap<String, Watermarks>>);

    impl WatermarkStore for MemStore {
        fn load_all(&self) -> io::Result<HashMap<String, Watermarks>> {
            Ok(self.0.lock().unwrap().clone())
        }
        fn store(&self, alias: &str, wm: &Watermarks) -> io::Result<()> {
            self.0.lock().unwrap().insert(alias.to_string(), *wm);
            Ok(())
        }
    }

    fn setup() -> (Arc<Keychain>, Arc<Monitor>, [u8; 20], [u8; 48]) {
        let store = Arc::new(MemStore(Mutex::new(HashMap::new())));
        let kc = Arc::new(Keychain::new(store).unwrap());
        let (sk, pk, _) = bls::generate().unwrap();
        let address = bls::address(&pk);
        kc.add_key(sk, None, [0u8; 16]);
        (kc, Monitor::new(0), address, pk)
    }

    fn block_payload(level: i32, round: i32) -> Vec<u8> {
        let mut raw = vec![0u8; 91];
        raw[0] = 0x11;
        raw[5..9].copy_from_slice(&level.to_be_bytes());
        raw[83..87].copy_from_slice(&4i32.to_be_bytes());
        raw[87..91].copy_from_slice(&round.to_be_bytes());
        raw
    }

    #[test]
    fn sign_request_produces_verifiable_signature() {
        let (kc, monitor, address, pk) = setup();

        let payload = block_payload(10, 0);
        let resp = dispatch(
            &kc,
            &monitor,
            Message::SignRequest {
                address,
                payload: payload.clone(),
            },
        );

        match resp {
            Message::SignResponse { signature } => {
                assert!(bls::verify(&pk, &signature, &payload));
            }
            other => panic!("expected signature, got {other:?}"),
        }
        assert_eq!(monitor.request_count(), 1);
    }

    #[test]
    fn errors_map_to_remote_codes() {
        let (kc, monitor, address, _) = setup();

        // Unknown address.
        let resp = dispatch(
            &kc,
            &monitor,
            Message::SignRequest {
                address: [0xAA; 20],
                payload: block_payload(1, 0),
            },
        );
        assert!(matches!(resp, Message::Error { code, .. } if code == rpc_code::KEY_NOT_FOUND));

        // Bad payload.
        let resp = dispatch(
            &kc,
            &monitor,
            Message::SignRequest {
                address,
                payload: vec![0xFF, 1, 2],
            },
        );
        assert!(matches!(resp, Message::Error { code, .. } if code == rpc_code::BAD_PAYLOAD));

        // Stale watermark.
        let payload = block_payload(5, 0);
        dispatch(
            &kc,
            &monitor,
            Message::SignRequest {
                address,
                payload: payload.clone(),
            },
        );
        let resp = dispatch(&kc, &monitor, Message::SignRequest { address, payload });
        assert!(
            matches!(resp, Message::Error { code, .. } if code == rpc_code::STALE_WATERMARK)
        );

        // Activity recorded only for the successful sign.
        assert_eq!(monitor.request_count(), 1);
    }

    #[test]
    fn status_request_lists_keys() {
        let (kc, monitor, address, pk) = setup();

        let resp = dispatch(&kc, &monitor, Message::StatusRequest);
        match resp {
            Message::StatusResponse { keys } => {
                assert_eq!(keys.len(), 1);
                assert_eq!(keys[0].address, address);
                assert_eq!(keys[0].public_key, pk);
                assert_eq!(keys[0].lock_state, LockState::Unlocked);
            }
            other => panic!("expected status, got {other:?}"),
        }
    }

    #[test]
    fn unlock_unknown_key_reports_not_found() {
        let (kc, monitor, _, _) = setup();
        let resp = dispatch(
            &kc,
            &monitor,
            Message::UnlockRequest {
                address: [0xBB; 20],
                passphrase: b"pass".to_vec(),
            },
        );
        assert!(matches!(resp, Message::Error { code, .. } if code == rpc_code::KEY_NOT_FOUND));
    }
}
