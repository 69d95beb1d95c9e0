// Copyright (c) 2024-2025 The TezSign Foundation

//! Deterministic hierarchical key derivation (EIP-2333 HKDF_mod_r)
//!
//! Keys are derived from a seed with `HKDF_mod_r` over the BLS12-381
//! scalar field, using a salt bound to this application:
//! `SHA256("TEZSIGN-HD-V1|" || master_salt)`. If the candidate scalar
//! reduces to zero the salt is rehashed and the loop repeats, exactly as
//! EIP-2333 prescribes. Child keys mix the parent scalar (32 bytes
//! big-endian) with the child index (4 bytes big-endian).
//!
//! The HKDF extract/expand steps are spelled out with `hmac`/`sha2`
//! rather than delegated, because the 48-byte expand and the zero-retry
//! are load-bearing for cross-implementation determinism.

use blst::min_pk::SecretKey;
use hmac::{Hmac, Mac};
use num_bigint::BigUint;
use once_cell::sync::Lazy;
use sha2::{Digest, Sha256};
use zeroize::Zeroize;

use crate::bls;

type HmacSha256 = Hmac<Sha256>;

/// Salt label mixed with the operator's master salt.
const SALT_LABEL: &[u8] = b"TEZSIGN-HD-V1|";

/// Derivation path prefix for addressing: `m / 12381 / 1729 / 0 / 0 / index`.
const PATH_PREFIX: [u32; 4] = [12381, 1729, 0, 0];

/// BLS12-381 scalar field order r (Fr).
static FIELD_ORDER: Lazy<BigUint> = Lazy::new(|| {
    BigUint::parse_bytes(
        b"73EDA753299D7D483339D80809A1D80553BDA402FFFE5BFEFFFFFFFF00000001",
        16,
    )
    .expect("well-formed field order constant")
});

#[derive(Clone, Copy, PartialEq, Debug, thiserror::Error)]
pub enum HdError {
    #[error("ikm must be >= 32 bytes")]
    ShortIkm,

    #[error("failed to load scalar")]
    LoadScalar,
}

/// Effective HKDF salt for a master salt.
pub fn hd_salt(master_salt: &[u8]) -> [u8; 32] {
    let mut h = Sha256::new();
    h.update(SALT_LABEL);
    h.update(master_salt);
    h.finalize().into()
}

/// HKDF-Extract(SHA-256, salt, ikm).
fn hkdf_extract(salt: &[u8], ikm: &[u8]) -> [u8; 32] {
    let mut mac = HmacSha256::new_from_slice(salt).expect("hmac accepts any key length");
    mac.update(ikm);
    mac.finalize().into_bytes().into()
}

/// HKDF-Expand(SHA-256, prk, info, l).
fn hkdf_expand(prk: &[u8], info: &[u8], l: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(l + 31);
    let mut t: Vec<u8> = Vec::new();
    let mut ctr = 1u8;

    while out.len() < l {
        let mut mac = HmacSha256::new_from_slice(prk).expect("hmac accepts any key length");
        mac.update(&t);
        mac.update(info);
        mac.update(&[ctr]);
        t = mac.finalize().into_bytes().to_vec();
        out.extend_from_slice(&t);
        ctr += 1;
    }

    out.truncate(l);
    out
}

/// EIP-2333 HKDF_mod_r: derive a scalar from `ikm`, retrying with a
/// rehashed salt while the candidate reduces to zero.
fn hkdf_mod_r(ikm: &[u8], salt: [u8; 32]) -> Result<SecretKey, HdError> {
    if ikm.len() < 32 {
        return Err(HdError::ShortIkm);
    }

    let mut salt = salt.to_vec();
    loop {
        let prk = hkdf_extract(&salt, ikm);
        let mut okm = hkdf_expand(&prk, &[], 48);

        let k = BigUint::from_bytes_be(&okm) % &*FIELD_ORDER;
        okm.zeroize();

        if k.bits() != 0 {
            let be = k.to_bytes_be();
            let mut be32 = [0u8; 32];
            be32[32 - be.len()..].copy_from_slice(&be);
            let sk = SecretKey::from_bytes(&be32).map_err(|_| HdError::LoadScalar);
            be32.zeroize();
            return sk;
        }

        // Candidate reduced to zero: salt = H(salt), try again.
        salt = Sha256::digest(&salt).to_vec();
    }
}

/// Derive the master key from a seed.
pub fn derive_master(seed: &[u8], salt: [u8; 32]) -> Result<SecretKey, HdError> {
    hkdf_mod_r(seed, salt)
}

/// Derive a hardened child: IKM = parent scalar (32 BE) || index (4 BE).
pub fn derive_child(parent: &SecretKey, index: u32, salt: [u8; 32]) -> Result<SecretKey, HdError> {
    let mut ikm = [0u8; 36];
    ikm[..32].copy_from_slice(&parent.to_bytes());
    ikm[32..].copy_from_slice(&index.to_be_bytes());

    let sk = hkdf_mod_r(&ikm, salt);
    ikm.zeroize();
    sk
}

/// Apply [derive_child] over a sequence of indices.
pub fn derive_path(
    master: &SecretKey,
    path: &[u32],
    salt: [u8; 32],
) -> Result<SecretKey, HdError> {
    let mut sk = master.clone();
    for &index in path {
        sk = derive_child(&sk, index, salt)?;
    }
    Ok(sk)
}

/// Derive the addressed key `m / 12381 / 1729 / 0 / 0 / index` from a
/// master salt and seed: `(sk, compressed pk, BLpk string)`.
pub fn generate_hd_key(
    master_salt: &[u8],
    seed: &[u8],
    index: u32,
) -> Result<(SecretKey, [u8; bls::PUBLIC_KEY_LEN], String), HdError> {
    let salt = hd_salt(master_salt);
    let master = derive_master(seed, salt)?;

    let mut path = Vec::with_capacity(PATH_PREFIX.len() + 1);
    path.extend_from_slice(&PATH_PREFIX);
    path.push(index);

    let sk = derive_path(&master, &path, salt)?;
    let pk = bls::compressed_public_key(&sk);
    let blpk = bls::encode_public_key(&pk);
    Ok((sk, pk, blpk))
}

#[cfg(test)]
mod test {
    use super::*;

    const SEED: &[u8] = b"an example seed of sufficient length for derivation";

    #[test]
    fn derivation_is_deterministic() {
        let (sk1, pk1, blpk1) = generate_hd_key(b"master-salt", SEED, 0).unwrap();
        let (sk2, pk2, blpk2) = generate_hd_key(b"master-salt", SEED, 0).unwrap();

        assert_eq!(sk1.to_bytes(), sk2.to_bytes());
        assert_eq!(pk1, pk2);
        assert_eq!(blpk1, blpk2);
        assert!(blpk1.starts_with("BLpk"));
    }

    #[test]
    fn distinct_indices_give_distinct_keys() {
        let (_, pk0, _) = generate_hd_key(b"salt", SEED, 0).unwrap();
        let (_, pk1, _) = generate_hd_key(b"salt", SEED, 1).unwrap();
        assert_ne!(pk0, pk1);
    }

    #[test]
    fn distinct_salts_give_distinct_keys() {
        let (_, pk_a, _) = generate_hd_key(b"salt-a", SEED, 0).unwrap();
        let (_, pk_b, _) = generate_hd_key(b"salt-b", SEED, 0).unwrap();
        assert_ne!(pk_a, pk_b);
    }

    #[test]
    fn derived_keys_sign_and_verify() {
        let (sk, pk, _) = generate_hd_key(b"salt", SEED, 3).unwrap();
        let sig = crate::bls::sign(&sk, b"derived-key message");
        assert!(crate::bls::verify(&pk, &sig, b"derived-key message"));
    }

    #[test]
    fn short_seed_rejected() {
        let salt = hd_salt(b"salt");
        assert!(matches!(
            derive_master(b"too short", salt),
            Err(HdError::ShortIkm)
        ));
    }

    #[test]
    fn child_differs_from_parent() {
        let salt = hd_salt(b"salt");
        let master = derive_master(SEED, salt).unwrap();
        let child = derive_child(&master, 0, salt).unwrap();
        assert_ne!(master.to_bytes(), child.to_bytes());
    }

    #[test]
    fn expand_produces_requested_length() {
        let prk = hkdf_extract(b"salt", b"input keying material 32 bytes..");
        assert_eq!(hkdf_expand(&prk, &[], 48).len(), 48);
        assert_eq!(hkdf_expand(&prk, &[], 32).len(), 32);
        assert_eq!(hkdf_expand(&prk, &[], 1).len(), 1);
    }
}
