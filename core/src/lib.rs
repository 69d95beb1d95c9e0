// Copyright (c) 2024-2025 The TezSign Foundation

//! TezSign signing core
//!
//! This crate is the gadget-side signing engine: strict decoding of the
//! three Tenderbake consensus payload kinds, BLS12-381 MinPk primitives,
//! deterministic hierarchical key derivation, Base58Check addressing and
//! the keychain that enforces the per-key watermark discipline.
//!
//! The watermark rule is the safety property of the whole appliance: for
//! every (key, operation kind) the `(level, round)` pair of successful
//! signs is strictly increasing, and the new watermark is persisted
//! *before* the signature is produced so a crash can never re-sign at the
//! same height.
//!
//! Transport and process wiring live elsewhere (the broker crate and the
//! binaries); nothing in this crate does I/O except the watermark store.

pub mod b58;
pub mod bls;
pub mod hd;
pub mod health;
pub mod keychain;
pub mod tenderbake;

pub use keychain::{FileStore, Keychain, KeychainError, WatermarkStore, Watermarks};
pub use tenderbake::{decode_sign_payload, SignInfo, SignKind};
