// Copyright (c) 2024-2025 The TezSign Foundation

//! Typed RPC calls over the broker

use tokio_util::sync::CancellationToken;

use tezsign_broker::Broker;
use tezsign_wire::rpc::{KeyStatus, LockState, Message, RemoteError, RpcError};

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// Failure reported by the gadget (carries a remote error code)
    #[error(transparent)]
    Remote(#[from] RemoteError),

    /// Transport-level failure
    #[error(transparent)]
    Broker(#[from] tezsign_broker::Error),

    /// Response did not decode
    #[error("bad response encoding: {0}")]
    Rpc(#[from] RpcError),

    /// Response decoded to the wrong message kind
    #[error("unexpected response message")]
    Unexpected,
}

async fn roundtrip(
    broker: &Broker,
    ct: &CancellationToken,
    req: Message,
) -> Result<Message, ClientError> {
    let (resp, _id) = broker.request(ct, &req.encode()).await?;
    match Message::decode(&resp)? {
        Message::Error { code, message } => Err(RemoteError { code, message }.into()),
        msg => Ok(msg),
    }
}

/// Sign `payload` with the key addressed by the 20-byte tz4 payload.
pub async fn req_sign(
    broker: &Broker,
    ct: &CancellationToken,
    address: [u8; 20],
    payload: &[u8],
) -> Result<[u8; 96], ClientError> {
    let req = Message::SignRequest {
        address,
        payload: payload.to_vec(),
    };
    match roundtrip(broker, ct, req).await? {
        Message::SignResponse { signature } => Ok(signature),
        _ => Err(ClientError::Unexpected),
    }
}

/// Fetch the status of every key on the gadget.
pub async fn req_status(
    broker: &Broker,
    ct: &CancellationToken,
) -> Result<Vec<KeyStatus>, ClientError> {
    match roundtrip(broker, ct, Message::StatusRequest).await? {
        Message::StatusResponse { keys } => Ok(keys),
        _ => Err(ClientError::Unexpected),
    }
}

/// Unlock a key with its passphrase.
pub async fn req_unlock(
    broker: &Broker,
    ct: &CancellationToken,
    address: [u8; 20],
    passphrase: &[u8],
) -> Result<LockState, ClientError> {
    let req = Message::UnlockRequest {
        address,
        passphrase: passphrase.to_vec(),
    };
    match roundtrip(broker, ct, req).await? {
        Message::UnlockResponse { lock_state } => Ok(lock_state),
        _ => Err(ClientError::Unexpected),
    }
}
