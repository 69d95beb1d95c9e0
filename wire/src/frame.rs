// Copyright (c) 2024-2025 The TezSign Foundation

//! Frame header codec for the USB byte stream
//!
//! Every message on the wire is a fixed header followed by an opaque
//! payload:
//!
//! ```text
//!  0                   1                   2
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |M|T|          MESSAGE ID (16 bytes)          |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |  SIZE (u32 LE)  |P|
//! +-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! `M` is the magic byte `0x56`, `T` the frame type, `SIZE` the payload
//! length and `P` an XOR parity over the preceding 22 bytes. The stream is
//! unordered and lossy, so the receiver resynchronises on magic + parity.
//!
//! The field layout is an encdec struct; parity is derived over the
//! encoded bytes rather than stored as state.

use core::fmt;

use encdec::{Decode, Encode};
use rand::{rngs::OsRng, RngCore};

use crate::{helpers::arr, HEADER_LEN, MAGIC, MAX_MESSAGE_PAYLOAD};

/// Frame codec errors
#[derive(Clone, Copy, PartialEq, Debug, thiserror::Error)]
pub enum FrameError {
    /// Fewer bytes than a full header
    #[error("short header")]
    InvalidLength,

    /// Magic byte or parity mismatch
    #[error("bad magic or parity")]
    BadMagic,

    /// Payload larger than the protocol allows
    #[error("payload too large ({0} bytes)")]
    PayloadTooLarge(usize),
}

impl From<encdec::Error> for FrameError {
    fn from(_: encdec::Error) -> Self {
        FrameError::InvalidLength
    }
}

/// Frame type discriminator.
///
/// `Accept` and `Retry` are control frames: `Accept` confirms receipt of a
/// `Request` before the handler runs, `Retry` asks the peer to retransmit
/// everything it has not seen an `Accept` for. Their values are outside
/// {0x01, 0x02} and both endpoints must agree on them.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum FrameType {
    Request = 0x01,
    Response = 0x02,
    Accept = 0x03,
    Retry = 0x04,
}

impl FrameType {
    /// Decode a wire byte; unknown values are kept for logging.
    pub fn from_wire(b: u8) -> Result<Self, u8> {
        match b {
            0x01 => Ok(FrameType::Request),
            0x02 => Ok(FrameType::Response),
            0x03 => Ok(FrameType::Accept),
            0x04 => Ok(FrameType::Retry),
            other => Err(other),
        }
    }
}

/// 16-byte message correlation ID.
///
/// IDs are drawn from the OS entropy source at request creation; uniqueness
/// is probabilistic within the waiter TTL window.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Default)]
pub struct MessageId(pub [u8; 16]);

impl MessageId {
    pub fn random() -> Self {
        let mut id = [0u8; 16];
        OsRng.fill_bytes(&mut id);
        MessageId(id)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MessageId({})", hex::encode(self.0))
    }
}

/// Raw wire layout of the 23-byte header.
#[derive(Copy, Clone, PartialEq, Debug, Encode, Decode)]
#[encdec(error = "FrameError")]
struct RawHeader {
    magic: u8,
    frame_type: u8,
    #[encdec(with = "arr")]
    id: [u8; 16],
    size: u32,
    parity: u8,
}

/// Parsed and validated frame header. Parity is checked on decode and
/// derived on encode, never carried here.
#[derive(Copy, Clone, PartialEq, Debug)]
pub struct Header {
    pub frame_type: u8,
    pub id: MessageId,
    pub size: u32,
}

/// XOR of the first 22 header bytes.
fn parity(bytes22: &[u8]) -> u8 {
    bytes22.iter().fold(0, |x, b| x ^ b)
}

impl Header {
    /// Validate magic and parity and parse the header fields.
    pub fn decode(src: &[u8]) -> Result<Header, FrameError> {
        let (h, _) = RawHeader::decode(src)?;

        if h.magic != MAGIC {
            return Err(FrameError::BadMagic);
        }
        if h.parity != parity(&src[..HEADER_LEN - 1]) {
            return Err(FrameError::BadMagic);
        }

        Ok(Header {
            frame_type: h.frame_type,
            id: MessageId(h.id),
            size: h.size,
        })
    }
}

/// Encode a complete frame (header + payload) into a fresh buffer.
///
/// Refuses payloads above [MAX_MESSAGE_PAYLOAD]; the u32 size field bounds
/// the rest.
pub fn encode(frame_type: FrameType, id: MessageId, payload: &[u8]) -> Result<Vec<u8>, FrameError> {
    if payload.len() > MAX_MESSAGE_PAYLOAD || payload.len() > u32::MAX as usize {
        return Err(FrameError::PayloadTooLarge(payload.len()));
    }

    let header = RawHeader {
        magic: MAGIC,
        frame_type: frame_type as u8,
        id: id.0,
        size: payload.len() as u32,
        parity: 0,
    };

    let mut dst = vec![0u8; HEADER_LEN + payload.len()];
    header.encode(&mut dst)?;
    dst[HEADER_LEN - 1] = parity(&dst[..HEADER_LEN - 1]);
    dst[HEADER_LEN..].copy_from_slice(payload);

    Ok(dst)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn header_roundtrip() {
        let id = MessageId::random();
        let payload = b"hello gadget";

        let frame = encode(FrameType::Request, id, payload).unwrap();
        assert_eq!(frame.len(), HEADER_LEN + payload.len());

        let h = Header::decode(&frame).unwrap();
        assert_eq!(h.frame_type, FrameType::Request as u8);
        assert_eq!(h.id, id);
        assert_eq!(h.size as usize, payload.len());
        assert_eq!(&frame[HEADER_LEN..], payload);
    }

    #[test]
    fn raw_header_is_exactly_header_len() {
        let header = RawHeader {
            magic: MAGIC,
            frame_type: FrameType::Request as u8,
            id: [7u8; 16],
            size: 0x11223344,
            parity: 0,
        };
        assert_eq!(header.encode_len().unwrap(), HEADER_LEN);

        // Size is little-endian on the wire.
        let frame = encode(FrameType::Request, MessageId([7u8; 16]), &[]).unwrap();
        assert_eq!(&frame[18..22], &0u32.to_le_bytes());
    }

    #[test]
    fn empty_payload_roundtrip() {
        let id = MessageId::random();
        let frame = encode(FrameType::Accept, id, &[]).unwrap();
        let h = Header::decode(&frame).unwrap();
        assert_eq!(h.size, 0);
        assert_eq!(h.id, id);
    }

    #[test]
    fn short_header_rejected() {
        let frame = encode(FrameType::Request, MessageId::random(), b"x").unwrap();
        assert_eq!(
            Header::decode(&frame[..HEADER_LEN - 1]),
            Err(FrameError::InvalidLength)
        );
        assert_eq!(Header::decode(&[]), Err(FrameError::InvalidLength));
    }

    #[test]
    fn bad_magic_rejected() {
        let mut frame = encode(FrameType::Request, MessageId::random(), &[]).unwrap();
        frame[0] = 0x57;
        assert_eq!(Header::decode(&frame), Err(FrameError::BadMagic));
    }

    #[test]
    fn single_bit_parity_flip_rejected() {
        let frame = encode(FrameType::Response, MessageId::random(), b"payload").unwrap();

        // Flip each bit of each header byte in turn; every variant must fail
        // (a magic flip fails the magic check, anything else fails parity).
        for byte in 0..HEADER_LEN {
            for bit in 0..8 {
                let mut corrupt = frame.clone();
                corrupt[byte] ^= 1 << bit;
                assert!(
                    Header::decode(&corrupt).is_err(),
                    "bit {bit} of byte {byte} slipped through"
                );
            }
        }
    }

    #[test]
    fn oversize_payload_refused() {
        let huge = vec![0u8; MAX_MESSAGE_PAYLOAD + 1];
        assert_eq!(
            encode(FrameType::Request, MessageId::random(), &huge),
            Err(FrameError::PayloadTooLarge(MAX_MESSAGE_PAYLOAD + 1))
        );
    }

    #[test]
    fn frame_type_wire_mapping() {
        assert_eq!(FrameType::from_wire(0x01), Ok(FrameType::Request));
        assert_eq!(FrameType::from_wire(0x02), Ok(FrameType::Response));
        assert_eq!(FrameType::from_wire(0x03), Ok(FrameType::Accept));
        assert_eq!(FrameType::from_wire(0x04), Ok(FrameType::Retry));
        assert_eq!(FrameType::from_wire(0x7f), Err(0x7f));
    }
}
