// Copyright (c) 2024-2025 The TezSign Foundation

//! RPC messages carried inside `request` / `response` frame payloads
//!
//! The host drives the gadget with a tiny operation set: sign a consensus
//! payload, report key status, unlock a key. Each message is a 1-byte
//! opcode followed by an encdec-encoded body; responses set the top opcode
//! bit, and failures come back as an [Message::Error] with one of the
//! [crate::rpc_code] codes.
//!
//! Fixed-layout bodies derive their codecs; the variable-length ones
//! (sign, unlock, error) implement [Encode]/[Decode] by hand with explicit
//! length checks. Integers are little-endian throughout.

use core::fmt;

use encdec::{Decode, DecodeOwned, Encode};

use crate::helpers::{arr, lock_state, wm_arr};
use crate::rpc_code;

/// Compressed G1 public key length.
pub const PUBLIC_KEY_LEN: usize = 48;

/// Compressed G2 signature length.
pub const SIGNATURE_LEN: usize = 96;

/// BLAKE2b-160 public key hash (tz4 payload) length.
pub const ADDRESS_LEN: usize = 20;

/// RPC opcodes. Responses are `request | 0x80`.
pub const OP_SIGN: u8 = 0x01;
pub const OP_STATUS: u8 = 0x02;
pub const OP_UNLOCK: u8 = 0x03;
pub const OP_SIGN_RESP: u8 = 0x81;
pub const OP_STATUS_RESP: u8 = 0x82;
pub const OP_UNLOCK_RESP: u8 = 0x83;
pub const OP_ERROR: u8 = 0xEE;

/// RPC codec errors
#[derive(Clone, PartialEq, Debug, thiserror::Error)]
pub enum RpcError {
    #[error("empty rpc payload")]
    Empty,

    #[error("rpc message truncated")]
    Truncated,

    #[error("unknown rpc opcode 0x{0:02x}")]
    UnknownOp(u8),

    #[error("invalid lock state {0}")]
    BadLockState(u8),

    #[error("error message is not utf-8")]
    BadMessage,
}

impl From<encdec::Error> for RpcError {
    fn from(_: encdec::Error) -> Self {
        RpcError::Truncated
    }
}

/// Key lock state as carried on the wire.
#[derive(Copy, Clone, PartialEq, Eq, Debug, strum::Display)]
#[repr(u8)]
pub enum LockState {
    Unlocked = 0,
    Locked = 1,
    Corrupted = 2,
}

impl LockState {
    pub fn from_wire(b: u8) -> Result<Self, RpcError> {
        match b {
            0 => Ok(LockState::Unlocked),
            1 => Ok(LockState::Locked),
            2 => Ok(LockState::Corrupted),
            other => Err(RpcError::BadLockState(other)),
        }
    }
}

/// Per-kind watermark pair as reported by the gadget.
#[derive(Copy, Clone, PartialEq, Eq, Default, Debug, Encode, Decode)]
#[encdec(error = "RpcError")]
pub struct Watermark {
    pub level: u32,
    pub round: u32,
}

/// Status record for one key.
///
/// ## Encoding (93 bytes):
/// ```text
/// | ADDRESS (20) | PUBLIC_KEY (48) | LOCK (1) |
/// | BLOCK level u32 LE, round u32 LE          |
/// | PREATTESTATION level, round               |
/// | ATTESTATION level, round                  |
/// ```
#[derive(Clone, PartialEq, Debug, Encode, Decode)]
#[encdec(error = "RpcError")]
pub struct KeyStatus {
    #[encdec(with = "arr")]
    pub address: [u8; ADDRESS_LEN],
    #[encdec(with = "arr")]
    pub public_key: [u8; PUBLIC_KEY_LEN],
    #[encdec(with = "lock_state")]
    pub lock_state: LockState,
    /// block / preattestation / attestation, in tag order
    #[encdec(with = "wm_arr")]
    pub watermarks: [Watermark; 3],
}

/// Sign request body.
///
/// ## Encoding:
/// ```text
/// | ADDRESS (20) | LEN (u32 LE) | PAYLOAD (LEN) |
/// ```
#[derive(Clone, PartialEq, Debug)]
pub struct SignRequest<'a> {
    pub address: [u8; ADDRESS_LEN],
    pub payload: &'a [u8],
}

impl<'a> Encode for SignRequest<'a> {
    type Error = RpcError;

    fn encode_len(&self) -> Result<usize, RpcError> {
        Ok(ADDRESS_LEN + 4 + self.payload.len())
    }

    fn encode(&self, buff: &mut [u8]) -> Result<usize, RpcError> {
        if buff.len() < ADDRESS_LEN + 4 + self.payload.len() {
            return Err(RpcError::Truncated);
        }

        let mut index = 0;
        index += arr::enc(&self.address, &mut buff[index..])?;
        index += (self.payload.len() as u32).encode(&mut buff[index..])?;

        buff[index..][..self.payload.len()].copy_from_slice(self.payload);
        index += self.payload.len();

        Ok(index)
    }
}

impl<'a> Decode<'a> for SignRequest<'a> {
    type Output = Self;
    type Error = RpcError;

    fn decode(buff: &'a [u8]) -> Result<(Self, usize), RpcError> {
        let mut index = 0;

        let (address, n): ([u8; ADDRESS_LEN], usize) = arr::dec(buff)?;
        index += n;

        let (len, n) = u32::decode(&buff[index..])?;
        index += n;
        let len = len as usize;

        if buff.len() < index + len {
            return Err(RpcError::Truncated);
        }
        let payload = &buff[index..][..len];
        index += len;

        Ok((Self { address, payload }, index))
    }
}

/// ## Encoding: `| SIGNATURE (96) |`
#[derive(Copy, Clone, PartialEq, Debug, Encode, Decode)]
#[encdec(error = "RpcError")]
pub struct SignResponse {
    #[encdec(with = "arr")]
    pub signature: [u8; SIGNATURE_LEN],
}

/// Empty status request body.
#[derive(Copy, Clone, PartialEq, Debug, Encode, Decode)]
#[encdec(error = "RpcError")]
pub struct StatusRequest;

/// ## Encoding: `| COUNT (u16 LE) | COUNT x KeyStatus |`
#[derive(Clone, PartialEq, Debug)]
pub struct StatusResponse {
    pub keys: Vec<KeyStatus>,
}

impl Encode for StatusResponse {
    type Error = RpcError;

    fn encode_len(&self) -> Result<usize, RpcError> {
        let mut len = 2;
        for k in &self.keys {
            len += k.encode_len()?;
        }
        Ok(len)
    }

    fn encode(&self, buff: &mut [u8]) -> Result<usize, RpcError> {
        let mut index = 0;
        index += (self.keys.len() as u16).encode(buff)?;

        for k in &self.keys {
            index += k.encode(&mut buff[index..])?;
        }

        Ok(index)
    }
}

impl DecodeOwned for StatusResponse {
    type Output = Self;
    type Error = RpcError;

    fn decode_owned(buff: &[u8]) -> Result<(Self, usize), RpcError> {
        let mut index = 0;

        let (count, n) = u16::decode(buff)?;
        index += n;

        let mut keys = Vec::with_capacity((count as usize).min(64));
        for _ in 0..count {
            let (k, n) = KeyStatus::decode(&buff[index..])?;
            keys.push(k);
            index += n;
        }

        Ok((Self { keys }, index))
    }
}

/// Unlock request body.
///
/// ## Encoding:
/// ```text
/// | ADDRESS (20) | LEN (u16 LE) | PASSPHRASE (LEN) |
/// ```
#[derive(Clone, PartialEq, Debug)]
pub struct UnlockRequest<'a> {
    pub address: [u8; ADDRESS_LEN],
    pub passphrase: &'a [u8],
}

impl<'a> Encode for UnlockRequest<'a> {
    type Error = RpcError;

    fn encode_len(&self) -> Result<usize, RpcError> {
        Ok(ADDRESS_LEN + 2 + self.passphrase.len())
    }

    fn encode(&self, buff: &mut [u8]) -> Result<usize, RpcError> {
        if buff.len() < ADDRESS_LEN + 2 + self.passphrase.len() {
            return Err(RpcError::Truncated);
        }

        let mut index = 0;
        index += arr::enc(&self.address, &mut buff[index..])?;
        index += (self.passphrase.len() as u16).encode(&mut buff[index..])?;

        buff[index..][..self.passphrase.len()].copy_from_slice(self.passphrase);
        index += self.passphrase.len();

        Ok(index)
    }
}

impl<'a> Decode<'a> for UnlockRequest<'a> {
    type Output = Self;
    type Error = RpcError;

    fn decode(buff: &'a [u8]) -> Result<(Self, usize), RpcError> {
        let mut index = 0;

        let (address, n): ([u8; ADDRESS_LEN], usize) = arr::dec(buff)?;
        index += n;

        let (len, n) = u16::decode(&buff[index..])?;
        index += n;
        let len = len as usize;

        if buff.len() < index + len {
            return Err(RpcError::Truncated);
        }
        let passphrase = &buff[index..][..len];
        index += len;

        Ok((Self { address, passphrase }, index))
    }
}

/// ## Encoding: `| LOCK (1) |`
#[derive(Copy, Clone, PartialEq, Debug, Encode, Decode)]
#[encdec(error = "RpcError")]
pub struct UnlockResponse {
    #[encdec(with = "lock_state")]
    pub lock_state: LockState,
}

/// Error response body.
///
/// ## Encoding: `| CODE (u32 LE) | MESSAGE (utf-8, rest) |`
#[derive(Clone, PartialEq, Debug)]
pub struct ErrorResponse<'a> {
    pub code: u32,
    pub message: &'a str,
}

impl<'a> Encode for ErrorResponse<'a> {
    type Error = RpcError;

    fn encode_len(&self) -> Result<usize, RpcError> {
        Ok(4 + self.message.len())
    }

    fn encode(&self, buff: &mut [u8]) -> Result<usize, RpcError> {
        let d = self.message.as_bytes();
        if buff.len() < 4 + d.len() {
            return Err(RpcError::Truncated);
        }

        let mut index = 0;
        index += self.code.encode(&mut buff[index..])?;

        buff[index..][..d.len()].copy_from_slice(d);
        index += d.len();

        Ok(index)
    }
}

impl<'a> Decode<'a> for ErrorResponse<'a> {
    type Output = Self;
    type Error = RpcError;

    fn decode(buff: &'a [u8]) -> Result<(Self, usize), RpcError> {
        let mut index = 0;

        let (code, n) = u32::decode(buff)?;
        index += n;

        let message =
            core::str::from_utf8(&buff[index..]).map_err(|_| RpcError::BadMessage)?;
        index += message.len();

        Ok((Self { code, message }, index))
    }
}

/// Decoded RPC message, owned for crossing task boundaries.
#[derive(Clone, PartialEq)]
pub enum Message {
    /// Sign `payload` with the key addressed by `address` (see
    /// [SignRequest]).
    SignRequest {
        address: [u8; ADDRESS_LEN],
        payload: Vec<u8>,
    },

    /// A 96-byte compressed signature (see [SignResponse]).
    SignResponse { signature: [u8; SIGNATURE_LEN] },

    /// Status of every key (see [StatusRequest]).
    StatusRequest,

    /// Key status list (see [StatusResponse]).
    StatusResponse { keys: Vec<KeyStatus> },

    /// Unlock a key with a passphrase (see [UnlockRequest]).
    UnlockRequest {
        address: [u8; ADDRESS_LEN],
        passphrase: Vec<u8>,
    },

    /// Lock state after an unlock attempt (see [UnlockResponse]).
    UnlockResponse { lock_state: LockState },

    /// Remote failure with a [crate::rpc_code] code (see [ErrorResponse]).
    Error { code: u32, message: String },
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Avoid dumping consensus payloads / passphrases into logs.
        match self {
            Message::SignRequest { address, payload } => f
                .debug_struct("SignRequest")
                .field("address", &hex::encode(address))
                .field("payload_len", &payload.len())
                .finish(),
            Message::SignResponse { .. } => f.debug_struct("SignResponse").finish(),
            Message::StatusRequest => f.debug_struct("StatusRequest").finish(),
            Message::StatusResponse { keys } => f
                .debug_struct("StatusResponse")
                .field("keys", &keys.len())
                .finish(),
            Message::UnlockRequest { address, .. } => f
                .debug_struct("UnlockRequest")
                .field("address", &hex::encode(address))
                .finish(),
            Message::UnlockResponse { lock_state } => f
                .debug_struct("UnlockResponse")
                .field("lock_state", lock_state)
                .finish(),
            Message::Error { code, message } => f
                .debug_struct("Error")
                .field("code", code)
                .field("message", message)
                .finish(),
        }
    }
}

/// Encode an opcode-tagged message into a fresh buffer.
fn encode_message<E: Encode<Error = RpcError>>(op: u8, body: &E) -> Vec<u8> {
    // Infallible for our bodies: the buffer is sized from encode_len.
    let len = body.encode_len().expect("rpc body lengths are computable");
    let mut dst = vec![0u8; 1 + len];
    dst[0] = op;
    body.encode(&mut dst[1..])
        .expect("buffer sized from encode_len");
    dst
}

impl Message {
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Message::SignRequest { address, payload } => encode_message(
                OP_SIGN,
                &SignRequest {
                    address: *address,
                    payload,
                },
            ),
            Message::SignResponse { signature } => encode_message(
                OP_SIGN_RESP,
                &SignResponse {
                    signature: *signature,
                },
            ),
            Message::StatusRequest => encode_message(OP_STATUS, &StatusRequest),
            Message::StatusResponse { keys } => encode_message(
                OP_STATUS_RESP,
                &StatusResponse { keys: keys.clone() },
            ),
            Message::UnlockRequest {
                address,
                passphrase,
            } => encode_message(
                OP_UNLOCK,
                &UnlockRequest {
                    address: *address,
                    passphrase,
                },
            ),
            Message::UnlockResponse { lock_state } => encode_message(
                OP_UNLOCK_RESP,
                &UnlockResponse {
                    lock_state: *lock_state,
                },
            ),
            Message::Error { code, message } => encode_message(
                OP_ERROR,
                &ErrorResponse {
                    code: *code,
                    message,
                },
            ),
        }
    }

    pub fn decode(src: &[u8]) -> Result<Message, RpcError> {
        let (&op, body) = src.split_first().ok_or(RpcError::Empty)?;
        match op {
            OP_SIGN => {
                let (req, _) = SignRequest::decode(body)?;
                Ok(Message::SignRequest {
                    address: req.address,
                    payload: req.payload.to_vec(),
                })
            }
            OP_SIGN_RESP => {
                let (resp, _) = SignResponse::decode(body)?;
                Ok(Message::SignResponse {
                    signature: resp.signature,
                })
            }
            OP_STATUS => Ok(Message::StatusRequest),
            OP_STATUS_RESP => {
                let (resp, _) = StatusResponse::decode_owned(body)?;
                Ok(Message::StatusResponse { keys: resp.keys })
            }
            OP_UNLOCK => {
                let (req, _) = UnlockRequest::decode(body)?;
                Ok(Message::UnlockRequest {
                    address: req.address,
                    passphrase: req.passphrase.to_vec(),
                })
            }
            OP_UNLOCK_RESP => {
                let (resp, _) = UnlockResponse::decode(body)?;
                Ok(Message::UnlockResponse {
                    lock_state: resp.lock_state,
                })
            }
            OP_ERROR => {
                let (resp, _) = ErrorResponse::decode(body)?;
                Ok(Message::Error {
                    code: resp.code,
                    message: resp.message.to_string(),
                })
            }
            other => Err(RpcError::UnknownOp(other)),
        }
    }

    /// Build the error response for a remote error code.
    pub fn error(code: u32, message: impl Into<String>) -> Message {
        Message::Error {
            code,
            message: message.into(),
        }
    }
}

/// Remote failure reported by the peer, decoded from an [Message::Error].
#[derive(Clone, PartialEq, Debug, thiserror::Error)]
#[error("remote error {code}: {message}")]
pub struct RemoteError {
    pub code: u32,
    pub message: String,
}

impl RemoteError {
    pub fn is_key_not_found(&self) -> bool {
        self.code == rpc_code::KEY_NOT_FOUND
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn roundtrip(msg: Message) {
        let bytes = msg.encode();
        let decoded = Message::decode(&bytes).expect("decode failed");
        assert_eq!(msg, decoded);
    }

    #[test]
    fn sign_request_roundtrip() {
        roundtrip(Message::SignRequest {
            address: [7u8; ADDRESS_LEN],
            payload: vec![0x11, 0x22, 0x33],
        });
    }

    #[test]
    fn sign_response_roundtrip() {
        roundtrip(Message::SignResponse {
            signature: [0xAB; SIGNATURE_LEN],
        });
    }

    #[test]
    fn status_roundtrip() {
        roundtrip(Message::StatusRequest);
        roundtrip(Message::StatusResponse {
            keys: vec![KeyStatus {
                address: [1u8; ADDRESS_LEN],
                public_key: [2u8; PUBLIC_KEY_LEN],
                lock_state: LockState::Locked,
                watermarks: [
                    Watermark { level: 100, round: 2 },
                    Watermark::default(),
                    Watermark { level: 7, round: 0 },
                ],
            }],
        });
    }

    #[test]
    fn key_status_body_is_fixed_width() {
        let k = KeyStatus {
            address: [3u8; ADDRESS_LEN],
            public_key: [4u8; PUBLIC_KEY_LEN],
            lock_state: LockState::Unlocked,
            watermarks: [Watermark { level: 9, round: 1 }; 3],
        };

        let mut buff = [0u8; 128];
        let n = k.encode(&mut buff).expect("encode failed");
        assert_eq!(n, k.encode_len().unwrap());
        assert_eq!(n, ADDRESS_LEN + PUBLIC_KEY_LEN + 1 + 24);

        let (decoded, m) = KeyStatus::decode(&buff[..n]).expect("decode failed");
        assert_eq!(decoded, k);
        assert_eq!(m, n);
    }

    #[test]
    fn unlock_roundtrip() {
        roundtrip(Message::UnlockRequest {
            address: [9u8; ADDRESS_LEN],
            passphrase: b"hunter2".to_vec(),
        });
        roundtrip(Message::UnlockResponse {
            lock_state: LockState::Unlocked,
        });
    }

    #[test]
    fn error_roundtrip() {
        roundtrip(Message::error(
            crate::rpc_code::STALE_WATERMARK,
            "stale level/round",
        ));
    }

    #[test]
    fn truncated_sign_request_rejected() {
        let mut bytes = Message::SignRequest {
            address: [0u8; ADDRESS_LEN],
            payload: vec![1, 2, 3, 4],
        }
        .encode();
        bytes.truncate(bytes.len() - 1);
        assert_eq!(Message::decode(&bytes), Err(RpcError::Truncated));
    }

    #[test]
    fn bad_lock_state_rejected() {
        let mut bytes = Message::UnlockResponse {
            lock_state: LockState::Locked,
        }
        .encode();
        bytes[1] = 9;
        assert_eq!(Message::decode(&bytes), Err(RpcError::BadLockState(9)));
    }

    #[test]
    fn unknown_opcode_rejected() {
        assert_eq!(Message::decode(&[0x55]), Err(RpcError::UnknownOp(0x55)));
        assert_eq!(Message::decode(&[]), Err(RpcError::Empty));
    }
}
