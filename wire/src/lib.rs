// Copyright (c) 2024-2025 The TezSign Foundation

//! Wire protocol definitions for tezsign host/gadget communication
//!
//! This crate is shared by both endpoints of the USB link. It defines the
//! framed byte-stream protocol (fixed 23-byte header + payload, see
//! [frame]) and the RPC message encodings carried inside `request` /
//! `response` frames (see [rpc]).
//!
//! Encodings are primitive length-checked binary, kept deliberately close
//! to packed C structures so the gadget side stays trivial to audit.
//! Frame header integers are little-endian; RPC bodies use little-endian
//! for lengths and codes (consensus payloads inside a [rpc::SignRequest]
//! are opaque bytes and keep whatever endianness the chain gives them).

pub mod frame;
pub mod rpc;

mod helpers;

pub use frame::{FrameError, FrameType, Header, MessageId};

const KB: usize = 1 << 10;
const MB: usize = 1 << 20;

/// First byte of every frame header, used for stream resynchronisation.
pub const MAGIC: u8 = 0x56;

/// Header length: magic(1) + type(1) + id(16) + size(4) + parity(1).
pub const HEADER_LEN: usize = 23;

/// Maximum bytes buffered in a broker stash before dropping oldest.
pub const DEFAULT_BROKER_CAPACITY: usize = 50 * MB;

/// Largest allowed frame payload (excluding header), half the stash
/// capacity so one frame can never monopolise the buffer.
pub const MAX_MESSAGE_PAYLOAD: usize = DEFAULT_BROKER_CAPACITY / 2;

/// Scratch buffer size for a single transport read.
pub const DEFAULT_READ_BUFFER: usize = 256 * KB;

/// USB vendor / product identity advertised by the gadget.
pub const USB_VID: u16 = 0x9997;
pub const USB_PID: u16 = 0x0001;

/// Vendor-specific control request returning the gadget status record.
pub const VENDOR_REQ_READY: u8 = 0x5A;

/// bmRequestType for the vendor-IN status request.
pub const BM_REQ_TYPE_VENDOR_IN: u8 = 0x81;

/// Magic prefix of the 8-byte status record returned on the control
/// endpoint: `"TZSG"` | version u16 LE | ready u8 | reserved u8.
pub const STATUS_MAGIC: [u8; 4] = *b"TZSG";

/// Status record protocol version.
pub const STATUS_VERSION: u16 = 1;

/// Build the vendor status record.
pub fn status_record(ready: bool) -> [u8; 8] {
    let mut rec = [0u8; 8];
    rec[..4].copy_from_slice(&STATUS_MAGIC);
    rec[4..6].copy_from_slice(&STATUS_VERSION.to_le_bytes());
    rec[6] = ready as u8;
    rec
}

/// Remote error codes carried in [rpc::ErrorResponse] frames.
pub mod rpc_code {
    pub const KEY_NOT_FOUND: u32 = 31;
    pub const KEY_LOCKED: u32 = 32;
    pub const STALE_WATERMARK: u32 = 33;
    pub const BAD_PAYLOAD: u32 = 34;
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn status_record_layout() {
        let rec = status_record(true);
        assert_eq!(&rec[..4], b"TZSG");
        assert_eq!(u16::from_le_bytes([rec[4], rec[5]]), STATUS_VERSION);
        assert_eq!(rec[6], 1);
        assert_eq!(rec[7], 0);

        assert_eq!(status_record(false)[6], 0);
    }

    #[test]
    fn payload_limit_is_half_capacity() {
        assert_eq!(MAX_MESSAGE_PAYLOAD, DEFAULT_BROKER_CAPACITY / 2);
    }
}
