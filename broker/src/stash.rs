// Copyright (c) 2024-2025 The TezSign Foundation

//! Streaming re-sync buffer between the raw byte stream and the framer
//!
//! The stash accumulates whatever the transport delivers and extracts
//! well-formed frames on a best-effort basis. It never trusts a header
//! further than its parity: a bad header costs the stream exactly one byte
//! of progress, and an oversized-but-valid header costs only the header
//! itself, so a run of plausible garbage can never swallow real frames
//! queued behind it.

use log::{debug, warn};
use zeroize::Zeroize;

use tezsign_wire::{Header, MessageId, HEADER_LEN, MAGIC, MAX_MESSAGE_PAYLOAD};

/// Outcome of one [Stash::read_payload] attempt. Only `Frame` consumes a
/// complete message; the error variants tell the drain loop whether to
/// keep going or wait for more bytes.
#[derive(Debug, PartialEq)]
pub enum Extract {
    /// A complete frame: (id, wire frame type byte, payload)
    Frame(MessageId, u8, Vec<u8>),

    /// No magic byte in the buffer
    NoPayload,

    /// Complete header, but the payload has not fully arrived; nothing
    /// consumed, come back after the next write
    Incomplete,

    /// Header failed to decode (short, or bad magic/parity); one byte
    /// consumed
    InvalidPayload,

    /// Valid header with an oversized length; header consumed
    InvalidPayloadSize,
}

/// Bounded receive buffer with drop-from-head overflow.
pub struct Stash {
    buf: Vec<u8>,
    capacity: usize,
}

impl Stash {
    pub fn new(capacity: usize) -> Self {
        Stash {
            buf: Vec::new(),
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Append incoming bytes, discarding the oldest on overflow.
    pub fn write(&mut self, data: &[u8]) {
        if self.buf.len() + data.len() > self.capacity {
            let drop = self.buf.len() + data.len() - self.capacity;
            self.consume(drop.min(self.buf.len()));
            warn!(
                "stash overflow: dropped oldest drop={} stash_len={} capacity={}",
                drop,
                self.buf.len(),
                self.capacity
            );
        }
        self.buf.extend_from_slice(data);
    }

    /// Extract the next well-formed frame, resynchronising as needed.
    pub fn read_payload(&mut self) -> Extract {
        let idx = match self.buf.iter().position(|&b| b == MAGIC) {
            Some(idx) => idx,
            None => {
                // No magic at all: drop everything except a small tail so a
                // split header can complete on the next write.
                if self.buf.len() > HEADER_LEN - 1 {
                    let drop = self.buf.len() - (HEADER_LEN - 1);
                    self.consume(drop);
                }
                return Extract::NoPayload;
            }
        };
        self.consume(idx); // drop bytes in front of magic

        let h = match Header::decode(&self.buf) {
            Ok(h) => h,
            Err(_) => {
                debug!("bad header decode; resync");
                self.consume(1);
                return Extract::InvalidPayload;
            }
        };

        if h.size as usize > MAX_MESSAGE_PAYLOAD {
            warn!(
                "drop oversized frame type={:02x} id={} size={} limit={}",
                h.frame_type, h.id, h.size, MAX_MESSAGE_PAYLOAD
            );
            // Dropping header+size here would let a stream of plausible
            // headers discard arbitrary downstream bytes; drop the header
            // only and resync.
            self.consume(HEADER_LEN);
            return Extract::InvalidPayloadSize;
        }

        let total = HEADER_LEN + h.size as usize;
        if self.buf.len() < total {
            return Extract::Incomplete;
        }

        debug!("rx hdr type={:02x} id={} size={}", h.frame_type, h.id, h.size);

        let payload = self.buf[HEADER_LEN..total].to_vec();
        // Sensitive bytes may sit in the stash region; scrub before the
        // space is reused.
        self.buf[HEADER_LEN..total].zeroize();
        self.consume(total);

        Extract::Frame(h.id, h.frame_type, payload)
    }

    fn consume(&mut self, n: usize) {
        self.buf.drain(..n);
    }
}
