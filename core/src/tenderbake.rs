// Copyright (c) 2024-2025 The TezSign Foundation

//! Strict decoder for Tenderbake consensus sign payloads
//!
//! A sign payload is an opaque byte string whose first byte is a watermark
//! tag: `0x11` block, `0x12` preattestation, `0x13` attestation. The
//! decoder extracts `(kind, level, round)` for the watermark check and
//! nothing else; signers hash the entire payload exactly as received.
//!
//! Offsets are bit-exact with the Tenderbake consensus framing for tz4
//! (BLS) signers:
//!
//! * blocks carry the level at byte 5 and the round in the tail of the
//!   length-prefixed fitness blob starting at byte 83,
//! * pre/attestations carry level at byte 38 and round at byte 42; the
//!   slot field is not part of the signed bytes for BLS keys.
//!
//! All level/round/fitness-length fields are big-endian `int32` and must
//! be non-negative.

pub const TAG_BLOCK: u8 = 0x11;
pub const TAG_PREATTESTATION: u8 = 0x12;
pub const TAG_ATTESTATION: u8 = 0x13;

/// Validation errors
#[derive(Clone, Copy, PartialEq, Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("empty payload")]
    Empty,

    #[error("payload out of bounds")]
    OutOfBounds,

    #[error("negative level")]
    NegativeLevel,

    #[error("negative round")]
    NegativeRound,

    #[error("negative fitness length")]
    NegativeFitnessLen,

    #[error("unsupported operation 0x{0:02x}")]
    UnsupportedTag(u8),
}

/// The three signed consensus operation kinds.
#[derive(Copy, Clone, PartialEq, Eq, Debug, strum::Display)]
pub enum SignKind {
    Block,
    Preattestation,
    Attestation,
}

impl SignKind {
    /// Stable index used for per-kind watermark storage.
    pub fn index(self) -> usize {
        match self {
            SignKind::Block => 0,
            SignKind::Preattestation => 1,
            SignKind::Attestation => 2,
        }
    }
}

/// Decoded watermark coordinates of a sign payload.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct SignInfo {
    pub kind: SignKind,
    pub level: u32,
    pub round: u32,
}

fn read_i32_be(raw: &[u8], off: usize) -> Result<i32, DecodeError> {
    let b = raw.get(off..off + 4).ok_or(DecodeError::OutOfBounds)?;
    Ok(i32::from_be_bytes([b[0], b[1], b[2], b[3]]))
}

/// Parse and bounds-check a sign payload, returning its watermark
/// coordinates. The caller signs the input slice unchanged.
pub fn decode_sign_payload(raw: &[u8]) -> Result<SignInfo, DecodeError> {
    let tag = *raw.first().ok_or(DecodeError::Empty)?;

    match tag {
        TAG_BLOCK => {
            // chain_id(4) after the tag, then level.
            const LEVEL_OFF: usize = 1 + 4;
            // level(4) proto(1) predecessor(32) timestamp(8)
            // validation_pass(1) operations_hash(32)
            const FITNESS_OFF: usize = 1 + 4 + 4 + 1 + 32 + 8 + 1 + 32;

            if raw.len() < FITNESS_OFF + 4 {
                return Err(DecodeError::OutOfBounds);
            }

            let level = read_i32_be(raw, LEVEL_OFF)?;
            if level < 0 {
                return Err(DecodeError::NegativeLevel);
            }

            let fitness_len = read_i32_be(raw, FITNESS_OFF)?;
            if fitness_len < 0 {
                return Err(DecodeError::NegativeFitnessLen);
            }

            // The round sits in the last four bytes of the fitness blob.
            let round_off = FITNESS_OFF + fitness_len as usize;
            let round = read_i32_be(raw, round_off)?;
            if round < 0 {
                return Err(DecodeError::NegativeRound);
            }

            Ok(SignInfo {
                kind: SignKind::Block,
                level: level as u32,
                round: round as u32,
            })
        }

        TAG_PREATTESTATION | TAG_ATTESTATION => {
            // chain_id(4) branch(32) op_tag(1), then level and round.
            const LEVEL_OFF: usize = 1 + 4 + 32 + 1;
            const ROUND_OFF: usize = LEVEL_OFF + 4;

            if raw.len() < ROUND_OFF + 4 {
                return Err(DecodeError::OutOfBounds);
            }

            let level = read_i32_be(raw, LEVEL_OFF)?;
            if level < 0 {
                return Err(DecodeError::NegativeLevel);
            }
            let round = read_i32_be(raw, ROUND_OFF)?;
            if round < 0 {
                return Err(DecodeError::NegativeRound);
            }

            let kind = if tag == TAG_PREATTESTATION {
                SignKind::Preattestation
            } else {
                SignKind::Attestation
            };
            Ok(SignInfo {
                kind,
                level: level as u32,
                round: round as u32,
            })
        }

        other => Err(DecodeError::UnsupportedTag(other)),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const FITNESS_OFF: usize = 83;

    /// Build a block payload with the given level, fitness length and a
    /// round in the fitness tail.
    fn block_payload(level: i32, fitness_len: i32, round: i32) -> Vec<u8> {
        let total = FITNESS_OFF + 4 + fitness_len.max(0) as usize;
        let mut raw = vec![0u8; total.max(FITNESS_OFF + 4)];
        raw[0] = TAG_BLOCK;
        raw[1..5].copy_from_slice(&[0x7a, 0x06, 0xa7, 0x70]); // chain id
        raw[5..9].copy_from_slice(&level.to_be_bytes());
        raw[FITNESS_OFF..FITNESS_OFF + 4].copy_from_slice(&fitness_len.to_be_bytes());
        if fitness_len >= 4 {
            let round_off = FITNESS_OFF + fitness_len as usize;
            raw[round_off..round_off + 4].copy_from_slice(&round.to_be_bytes());
        }
        raw
    }

    fn attestation_payload(tag: u8, level: i32, round: i32) -> Vec<u8> {
        let mut raw = vec![0u8; 46];
        raw[0] = tag;
        raw[1..5].copy_from_slice(&[0x7a, 0x06, 0xa7, 0x70]);
        raw[38..42].copy_from_slice(&level.to_be_bytes());
        raw[42..46].copy_from_slice(&round.to_be_bytes());
        raw
    }

    #[test]
    fn block_golden() {
        // Mirrors the observed mainnet framing: level 10_513_876
        // (0x00a06dd4) at offset 5, round 4 in the fitness tail.
        let raw = block_payload(10_513_876, 4, 4);
        assert_eq!(raw[0], 0x11);
        assert_eq!(&raw[1..9], &[0x7a, 0x06, 0xa7, 0x70, 0x00, 0xa0, 0x6d, 0xd4]);

        let info = decode_sign_payload(&raw).unwrap();
        assert_eq!(info.kind, SignKind::Block);
        assert_eq!(info.level, 10_513_876);
        assert_eq!(info.round, 4);
    }

    #[test]
    fn preattestation_golden() {
        let raw = attestation_payload(TAG_PREATTESTATION, 10_513_876, 2);
        assert_eq!(&raw[..5], &[0x12, 0x7a, 0x06, 0xa7, 0x70]);

        let info = decode_sign_payload(&raw).unwrap();
        assert_eq!(info.kind, SignKind::Preattestation);
        assert_eq!(info.level, 10_513_876);
        assert_eq!(info.round, 2);
    }

    #[test]
    fn attestation_decodes() {
        let info = decode_sign_payload(&attestation_payload(TAG_ATTESTATION, 7, 0)).unwrap();
        assert_eq!(info.kind, SignKind::Attestation);
        assert_eq!(info.level, 7);
        assert_eq!(info.round, 0);
    }

    #[test]
    fn empty_and_unknown_rejected() {
        assert_eq!(decode_sign_payload(&[]), Err(DecodeError::Empty));
        assert_eq!(
            decode_sign_payload(&[0x03, 0, 0, 0]),
            Err(DecodeError::UnsupportedTag(0x03))
        );
    }

    #[test]
    fn truncated_payloads_rejected() {
        let raw = block_payload(5, 4, 1);
        assert_eq!(
            decode_sign_payload(&raw[..FITNESS_OFF + 3]),
            Err(DecodeError::OutOfBounds)
        );

        let raw = attestation_payload(TAG_ATTESTATION, 5, 1);
        assert_eq!(
            decode_sign_payload(&raw[..45]),
            Err(DecodeError::OutOfBounds)
        );
    }

    #[test]
    fn fitness_tail_beyond_payload_rejected() {
        // fitness_len points past the end of the buffer.
        let mut raw = block_payload(5, 4, 1);
        raw[FITNESS_OFF..FITNESS_OFF + 4].copy_from_slice(&100i32.to_be_bytes());
        assert_eq!(decode_sign_payload(&raw), Err(DecodeError::OutOfBounds));
    }

    #[test]
    fn negative_fields_rejected() {
        assert_eq!(
            decode_sign_payload(&block_payload(-1, 4, 1)),
            Err(DecodeError::NegativeLevel)
        );

        let mut raw = block_payload(5, 4, 1);
        raw[FITNESS_OFF..FITNESS_OFF + 4].copy_from_slice(&(-4i32).to_be_bytes());
        assert_eq!(
            decode_sign_payload(&raw),
            Err(DecodeError::NegativeFitnessLen)
        );

        assert_eq!(
            decode_sign_payload(&block_payload(5, 4, -1)),
            Err(DecodeError::NegativeRound)
        );
        assert_eq!(
            decode_sign_payload(&attestation_payload(TAG_PREATTESTATION, -2, 0)),
            Err(DecodeError::NegativeLevel)
        );
        assert_eq!(
            decode_sign_payload(&attestation_payload(TAG_ATTESTATION, 2, -1)),
            Err(DecodeError::NegativeRound)
        );
    }

    #[test]
    fn longer_fitness_blob_shifts_round() {
        // A 12-byte fitness ends with the round at offset 83 + 12.
        let raw = block_payload(42, 12, 9);
        let info = decode_sign_payload(&raw).unwrap();
        assert_eq!(info.level, 42);
        assert_eq!(info.round, 9);
    }
}
