// Copyright (c) 2024-2025 The TezSign Foundation

//! BLS12-381 MinPk signing primitives
//!
//! MinPk keeps public keys in G1 (48 bytes compressed) and signatures in
//! G2 (96 bytes compressed), matching the chain's tz4 signer scheme.
//! Signatures use the CFRG POP ciphersuite DST; proofs of possession use
//! the dedicated POP DST over the signer's own compressed public key.

use blst::min_pk::{AggregateSignature, PublicKey, SecretKey, Signature};
use blst::BLST_ERROR;
use rand::{rngs::OsRng, RngCore};
use zeroize::Zeroize;

use crate::b58;

/// CFRG MinPk ciphersuite (signature-in-G2, pubkey-in-G1).
pub const DST_SIG: &[u8] = b"BLS_SIG_BLS12381G2_XMD:SHA-256_SSWU_RO_POP_";
/// DST for proofs of possession.
pub const DST_POP: &[u8] = b"BLS_POP_BLS12381G2_XMD:SHA-256_SSWU_RO_POP_";

pub const PUBLIC_KEY_LEN: usize = 48;
pub const SIGNATURE_LEN: usize = 96;
pub const SECRET_KEY_LEN: usize = 32;
pub const ADDRESS_LEN: usize = 20;

#[derive(Clone, Copy, PartialEq, Debug, thiserror::Error)]
pub enum BlsError {
    #[error("pubkey must be 48-byte G1 compressed")]
    InvalidPublicKey,

    #[error("signature must be 96-byte G2 compressed")]
    InvalidSignature,

    #[error("invalid scalar")]
    InvalidSecretKey,

    #[error("key generation failed")]
    KeyGen,

    #[error("nothing to aggregate")]
    EmptyAggregate,
}

/// Generate a fresh random key: `(sk, compressed pk, tz4 address bytes)`.
pub fn generate() -> Result<(SecretKey, [u8; PUBLIC_KEY_LEN], [u8; ADDRESS_LEN]), BlsError> {
    let mut ikm = [0u8; 32];
    OsRng.fill_bytes(&mut ikm);
    let sk = SecretKey::key_gen(&ikm, &[]).map_err(|_| BlsError::KeyGen);
    ikm.zeroize();
    let sk = sk?;

    let pk = compressed_public_key(&sk);
    let addr = address(&pk);
    Ok((sk, pk, addr))
}

/// Compressed G1 public key for a secret key.
pub fn compressed_public_key(sk: &SecretKey) -> [u8; PUBLIC_KEY_LEN] {
    sk.sk_to_pk().compress()
}

/// BLAKE2b-160 hash of the compressed public key (the tz4 payload).
pub fn address(pk: &[u8; PUBLIC_KEY_LEN]) -> [u8; ADDRESS_LEN] {
    use blake2::digest::{Update, VariableOutput};
    use blake2::Blake2bVar;

    let mut h = Blake2bVar::new(ADDRESS_LEN).expect("valid blake2b output length");
    h.update(pk);
    let mut out = [0u8; ADDRESS_LEN];
    h.finalize_variable(&mut out)
        .expect("output length matches");
    out
}

/// tz4 Base58Check address for a compressed public key.
pub fn tz4_address(pk: &[u8; PUBLIC_KEY_LEN]) -> String {
    b58::check_encode(b58::PFX_TZ4, &address(pk))
}

/// BLpk Base58Check rendering of a compressed public key.
pub fn encode_public_key(pk: &[u8; PUBLIC_KEY_LEN]) -> String {
    b58::check_encode(b58::PFX_BL_PUBKEY, pk)
}

/// BLsig Base58Check rendering of a compressed signature.
pub fn encode_signature(sig: &[u8; SIGNATURE_LEN]) -> String {
    b58::check_encode(b58::PFX_BL_SIGNATURE, sig)
}

/// Sign `msg` under the MinPk signature DST.
pub fn sign(sk: &SecretKey, msg: &[u8]) -> [u8; SIGNATURE_LEN] {
    sk.sign(msg, DST_SIG, &[]).compress()
}

/// Sign the signer's own compressed public key under the POP DST.
pub fn sign_pop(sk: &SecretKey, pk: &[u8; PUBLIC_KEY_LEN]) -> [u8; SIGNATURE_LEN] {
    sk.sign(pk, DST_POP, &[]).compress()
}

fn uncompress_pk(pk: &[u8]) -> Result<PublicKey, BlsError> {
    if pk.len() != PUBLIC_KEY_LEN {
        return Err(BlsError::InvalidPublicKey);
    }
    PublicKey::uncompress(pk).map_err(|_| BlsError::InvalidPublicKey)
}

fn uncompress_sig(sig: &[u8]) -> Result<Signature, BlsError> {
    if sig.len() != SIGNATURE_LEN {
        return Err(BlsError::InvalidSignature);
    }
    Signature::uncompress(sig).map_err(|_| BlsError::InvalidSignature)
}

/// Verify a single `(pk, sig, msg)` triple.
pub fn verify(pk: &[u8], sig: &[u8], msg: &[u8]) -> bool {
    let (pk, sig) = match (uncompress_pk(pk), uncompress_sig(sig)) {
        (Ok(pk), Ok(sig)) => (pk, sig),
        _ => return false,
    };
    sig.verify(true, msg, DST_SIG, &[], &pk, true) == BLST_ERROR::BLST_SUCCESS
}

/// Verify a proof of possession over `pk`.
pub fn verify_pop(pk: &[u8], pop: &[u8]) -> bool {
    let (pk_point, sig) = match (uncompress_pk(pk), uncompress_sig(pop)) {
        (Ok(p), Ok(s)) => (p, s),
        _ => return false,
    };
    sig.verify(true, pk, DST_POP, &[], &pk_point, true) == BLST_ERROR::BLST_SUCCESS
}

/// Aggregate signatures over a common message.
pub fn aggregate(sigs: &[[u8; SIGNATURE_LEN]]) -> Result<[u8; SIGNATURE_LEN], BlsError> {
    if sigs.is_empty() {
        return Err(BlsError::EmptyAggregate);
    }

    let mut points = Vec::with_capacity(sigs.len());
    for s in sigs {
        points.push(uncompress_sig(s)?);
    }
    let refs: Vec<&Signature> = points.iter().collect();

    let agg =
        AggregateSignature::aggregate(&refs, true).map_err(|_| BlsError::InvalidSignature)?;
    Ok(agg.to_signature().compress())
}

/// Verify an aggregate of signatures by `pks` over the same `msg`.
pub fn fast_aggregate_verify(pks: &[&[u8]], agg: &[u8], msg: &[u8]) -> bool {
    let mut points = Vec::with_capacity(pks.len());
    for pk in pks {
        match uncompress_pk(pk) {
            Ok(p) => points.push(p),
            Err(_) => return false,
        }
    }
    let refs: Vec<&PublicKey> = points.iter().collect();

    let sig = match uncompress_sig(agg) {
        Ok(s) => s,
        Err(_) => return false,
    };
    sig.fast_aggregate_verify(true, msg, DST_SIG, &refs) == BLST_ERROR::BLST_SUCCESS
}

/// Export a secret key as a BLsk string (little-endian scalar payload).
pub fn encode_secret_key(sk: &SecretKey) -> String {
    let mut le = sk.to_bytes();
    le.reverse();
    let s = b58::check_encode(b58::PFX_BL_SECRET_KEY, &le);
    le.zeroize();
    s
}

/// Import a BLsk string back into a secret key.
pub fn import_secret_key(blsk: &str) -> Result<SecretKey, BlsError> {
    let mut le = b58::check_decode_len(b58::PFX_BL_SECRET_KEY, blsk, SECRET_KEY_LEN)
        .map_err(|_| BlsError::InvalidSecretKey)?;
    le.reverse(); // wire is little-endian, blst wants big-endian
    let sk = SecretKey::from_bytes(&le).map_err(|_| BlsError::InvalidSecretKey);
    le.zeroize();
    sk
}
