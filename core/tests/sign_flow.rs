// Copyright (c) 2024-2025 The TezSign Foundation

//! End-to-end signing flow over the public API: HD-derived key, file-backed
//! watermark store, consensus payload in, verifiable signature out.

use std::sync::Arc;

use tezsign_core::{bls, hd, tenderbake, FileStore, Keychain, KeychainError};

fn block_payload(level: i32, round: i32) -> Vec<u8> {
    let mut raw = vec![0u8; 91];
    raw[0] = 0x11;
    raw[1..5].copy_from_slice(&[0x7a, 0x06, 0xa7, 0x70]);
    raw[5..9].copy_from_slice(&level.to_be_bytes());
    raw[83..87].copy_from_slice(&4i32.to_be_bytes());
    raw[87..91].copy_from_slice(&round.to_be_bytes());
    raw
}

#[test]
fn hd_key_signs_blocks_under_watermark_discipline() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(FileStore::new(dir.path()).unwrap());
    let kc = Keychain::new(store).unwrap();

    let seed = b"integration test seed, thirty-two plus bytes long";
    let (sk, pk, blpk) = hd::generate_hd_key(b"bench-salt", seed, 0).unwrap();
    assert!(blpk.starts_with("BLpk"));

    let alias = kc.add_key(sk, None, [0u8; 16]);
    assert!(alias.starts_with("tz4"));

    // Validator agrees with what we built.
    let payload = block_payload(10_513_876, 4);
    let info = tenderbake::decode_sign_payload(&payload).unwrap();
    assert_eq!(
        (info.kind, info.level, info.round),
        (tenderbake::SignKind::Block, 10_513_876, 4)
    );

    // Sign, verify under the MinPk DST, and confirm the watermark holds.
    let sig = kc.sign(&alias, &payload).unwrap();
    assert!(bls::verify(&pk, &sig, &payload));
    assert!(bls::encode_signature(&sig).starts_with("BLsig"));

    assert!(matches!(
        kc.sign(&alias, &payload).unwrap_err(),
        KeychainError::StaleWatermark { .. }
    ));
    kc.sign(&alias, &block_payload(10_513_876, 5)).unwrap();

    // Proof of possession for the same key.
    let sk2 = bls::import_secret_key(&{
        let (sk, _, _) = hd::generate_hd_key(b"bench-salt", seed, 0).unwrap();
        bls::encode_secret_key(&sk)
    })
    .unwrap();
    let pop = bls::sign_pop(&sk2, &pk);
    assert!(bls::verify_pop(&pk, &pop));
}
