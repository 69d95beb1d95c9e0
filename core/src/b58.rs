// Copyright (c) 2024-2025 The TezSign Foundation

//! Base58Check encoding with Tezos BLS prefixes
//!
//! `encode(prefix, payload) = base58(prefix || payload ||
//! sha256(sha256(prefix || payload))[0..4])`. Decode enforces prefix,
//! checksum and payload length.

use sha2::{Digest, Sha256};

/// "BLpk" BLS12-381 public key (48 bytes)
pub const PFX_BL_PUBKEY: &[u8] = &[6, 149, 135, 204];
/// "BLsig" BLS12-381 signature (96 bytes)
pub const PFX_BL_SIGNATURE: &[u8] = &[40, 171, 64, 207];
/// "tz4" BLS12-381 public key hash (20 bytes)
pub const PFX_TZ4: &[u8] = &[6, 161, 166];
/// "BLsk" BLS12-381 secret key (32 bytes, little-endian scalar)
pub const PFX_BL_SECRET_KEY: &[u8] = &[3, 150, 192, 40];

#[derive(Clone, PartialEq, Debug, thiserror::Error)]
pub enum B58Error {
    #[error("invalid base58: {0}")]
    InvalidBase58(String),

    #[error("encoding too short")]
    TooShort,

    #[error("checksum mismatch")]
    BadChecksum,

    #[error("prefix mismatch")]
    BadPrefix,

    #[error("payload must be {expected} bytes, got {actual}")]
    BadLength { expected: usize, actual: usize },
}

fn checksum(body: &[u8]) -> [u8; 4] {
    let sum = Sha256::digest(Sha256::digest(body));
    [sum[0], sum[1], sum[2], sum[3]]
}

/// Base58Check-encode `payload` under `prefix`.
pub fn check_encode(prefix: &[u8], payload: &[u8]) -> String {
    let mut buf = Vec::with_capacity(prefix.len() + payload.len() + 4);
    buf.extend_from_slice(prefix);
    buf.extend_from_slice(payload);
    let sum = checksum(&buf);
    buf.extend_from_slice(&sum);
    bs58::encode(buf).into_string()
}

/// Decode a Base58Check string, enforcing `prefix` and the checksum.
pub fn check_decode(prefix: &[u8], s: &str) -> Result<Vec<u8>, B58Error> {
    let raw = bs58::decode(s)
        .into_vec()
        .map_err(|e| B58Error::InvalidBase58(e.to_string()))?;
    if raw.len() < prefix.len() + 4 {
        return Err(B58Error::TooShort);
    }

    let (body, sum) = raw.split_at(raw.len() - 4);
    if sum != checksum(body) {
        return Err(B58Error::BadChecksum);
    }
    if !body.starts_with(prefix) {
        return Err(B58Error::BadPrefix);
    }

    Ok(body[prefix.len()..].to_vec())
}

/// Decode with an exact payload length requirement.
pub fn check_decode_len(prefix: &[u8], s: &str, len: usize) -> Result<Vec<u8>, B58Error> {
    let payload = check_decode(prefix, s)?;
    if payload.len() != len {
        return Err(B58Error::BadLength {
            expected: len,
            actual: payload.len(),
        });
    }
    Ok(payload)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn roundtrip_all_prefixes() {
        for (prefix, len) in [
            (PFX_BL_PUBKEY, 48),
            (PFX_BL_SIGNATURE, 96),
            (PFX_TZ4, 20),
            (PFX_BL_SECRET_KEY, 32),
        ] {
            let payload: Vec<u8> = (0..len).map(|i| (i * 3 + 1) as u8).collect();
            let s = check_encode(prefix, &payload);
            assert_eq!(check_decode(prefix, &s).unwrap(), payload);
            assert_eq!(check_decode_len(prefix, &s, len).unwrap(), payload);
        }
    }

    #[test]
    fn known_prefixes_render() {
        // The whole point of the prefix tables is human-recognisable
        // strings.
        assert!(check_encode(PFX_BL_PUBKEY, &[0u8; 48]).starts_with("BLpk"));
        assert!(check_encode(PFX_BL_SIGNATURE, &[0u8; 96]).starts_with("BLsig"));
        assert!(check_encode(PFX_TZ4, &[0u8; 20]).starts_with("tz4"));
        assert!(check_encode(PFX_BL_SECRET_KEY, &[0u8; 32]).starts_with("BLsk"));
    }

    #[test]
    fn corrupted_checksum_rejected() {
        let s = check_encode(PFX_TZ4, &[7u8; 20]);
        let mut chars: Vec<char> = s.chars().collect();
        let last = *chars.last().unwrap();
        *chars.last_mut().unwrap() = if last == '1' { '2' } else { '1' };
        let corrupt: String = chars.into_iter().collect();

        assert!(matches!(
            check_decode(PFX_TZ4, &corrupt),
            Err(B58Error::BadChecksum) | Err(B58Error::InvalidBase58(_))
        ));
    }

    #[test]
    fn wrong_prefix_rejected() {
        let s = check_encode(PFX_TZ4, &[7u8; 20]);
        assert_eq!(
            check_decode(PFX_BL_PUBKEY, &s),
            Err(B58Error::BadPrefix)
        );
    }

    #[test]
    fn wrong_length_rejected() {
        let s = check_encode(PFX_TZ4, &[7u8; 21]);
        assert_eq!(
            check_decode_len(PFX_TZ4, &s, 20),
            Err(B58Error::BadLength {
                expected: 20,
                actual: 21
            })
        );
    }

    #[test]
    fn garbage_rejected() {
        assert!(check_decode(PFX_TZ4, "not-base58-0OIl").is_err());
        assert_eq!(check_decode(PFX_TZ4, "1"), Err(B58Error::TooShort));
    }
}
