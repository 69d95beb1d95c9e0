// Copyright (c) 2024-2025 The TezSign Foundation

//! Key record loading
//!
//! The encrypted at-rest format is the provisioning tool's concern; the
//! gadget consumes a directory of records prepared on the state
//! partition:
//!
//! * `<name>.blsk`: the BLsk Base58Check secret key string,
//! * `<name>.pass`: optional `salt_hex:digest_hex` pair; when present
//!   the key starts `LOCKED` and unlocks only with a passphrase whose
//!   salted SHA-256 matches the digest.

use std::{fs, path::Path, sync::Arc};

use anyhow::{bail, Context};
use log::{info, warn};
use zeroize::Zeroize;

use tezsign_core::{bls, Keychain};

/// Parse a `salt_hex:digest_hex` record.
fn parse_pass_record(raw: &str) -> anyhow::Result<([u8; 16], [u8; 32])> {
    let (salt_hex, digest_hex) = raw
        .trim()
        .split_once(':')
        .context("pass record must be salt_hex:digest_hex")?;

    let salt_bytes = hex::decode(salt_hex).context("bad salt hex")?;
    let digest_bytes = hex::decode(digest_hex).context("bad digest hex")?;
    if salt_bytes.len() != 16 || digest_bytes.len() != 32 {
        bail!("pass record must carry a 16-byte salt and 32-byte digest");
    }

    let mut salt = [0u8; 16];
    salt.copy_from_slice(&salt_bytes);
    let mut digest = [0u8; 32];
    digest.copy_from_slice(&digest_bytes);
    Ok((salt, digest))
}

/// Load every key record under `dir` into the keychain. Returns the
/// registered tz4 aliases.
pub fn load_keys(dir: &Path, keychain: &Arc<Keychain>) -> anyhow::Result<Vec<String>> {
    let mut aliases = Vec::new();

    for dirent in fs::read_dir(dir).with_context(|| format!("reading key dir {dir:?}"))? {
        let path = dirent?.path();
        if path.extension().and_then(|e| e.to_str()) != Some("blsk") {
            continue;
        }

        let mut blsk = fs::read_to_string(&path)
            .with_context(|| format!("reading key record {path:?}"))?;
        let secret = match bls::import_secret_key(blsk.trim()) {
            Ok(secret) => secret,
            Err(err) => {
                warn!("skipping malformed key record path={path:?} err={err}");
                blsk.zeroize();
                continue;
            }
        };
        blsk.zeroize();

        let pass_path = path.with_extension("pass");
        let (pass_salt, pass_digest) = if pass_path.exists() {
            let record = fs::read_to_string(&pass_path)
                .with_context(|| format!("reading pass record {pass_path:?}"))?;
            let (salt, digest) = parse_pass_record(&record)?;
            (salt, Some(digest))
        } else {
            ([0u8; 16], None)
        };

        let alias = keychain.add_key(secret, pass_digest, pass_salt);
        info!(
            "loaded key alias={alias} locked={}",
            pass_digest.is_some()
        );
        aliases.push(alias);
    }

    if aliases.is_empty() {
        bail!("no key records found in {dir:?}");
    }
    Ok(aliases)
}

#[cfg(test)]
mod test {
    use super::*;
    use sha2::{Digest, Sha256};
    use std::collections::HashMap;
    use std::io;
    use std::sync::Mutex;

    use tezsign_core::{Watermarks, WatermarkStore};

    struct MemStore(Mutex<HashMap<String, Watermarks>>);

    impl WatermarkStore for MemStore {
        fn load_all(&self) -> io::Result<HashMap<String, Watermarks>> {
            Ok(self.0.lock().unwrap().clone())
        }
        fn store(&self, alias: &str, wm: &Watermarks) -> io::Result<()> {
            self.0.lock().unwrap().insert(alias.to_string(), *wm);
            Ok(())
        }
    }

    fn new_keychain() -> Arc<Keychain> {
        let store = Arc::new(MemStore(Mutex::new(HashMap::new())));
        Arc::new(Keychain::new(store).unwrap())
    }

    #[test]
    fn loads_plain_and_locked_keys() {
        let dir = tempfile::tempdir().unwrap();

        let (sk1, _, _) = bls::generate().unwrap();
        fs::write(dir.path().join("baker.blsk"), bls::encode_secret_key(&sk1)).unwrap();

        let (sk2, _, _) = bls::generate().unwrap();
        fs::write(dir.path().join("backup.blsk"), bls::encode_secret_key(&sk2)).unwrap();
        let salt = [9u8; 16];
        let mut h = Sha256::new();
        h.update(salt);
        h.update(b"secret pass");
        let digest: [u8; 32] = h.finalize().into();
        fs::write(
            dir.path().join("backup.pass"),
            format!("{}:{}", hex::encode(salt), hex::encode(digest)),
        )
        .unwrap();

        let kc = new_keychain();
        let aliases = load_keys(dir.path(), &kc).unwrap();
        assert_eq!(aliases.len(), 2);

        let status = kc.status();
        let locked = status
            .iter()
            .filter(|k| k.lock_state == tezsign_wire::rpc::LockState::Locked)
            .count();
        assert_eq!(locked, 1);
    }

    #[test]
    fn empty_dir_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_keys(dir.path(), &new_keychain()).is_err());
    }

    #[test]
    fn malformed_records_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("bad.blsk"), "not a key").unwrap();

        let (sk, _, _) = bls::generate().unwrap();
        fs::write(dir.path().join("good.blsk"), bls::encode_secret_key(&sk)).unwrap();

        let aliases = load_keys(dir.path(), &new_keychain()).unwrap();
        assert_eq!(aliases.len(), 1);
    }

    #[test]
    fn pass_record_validation() {
        assert!(parse_pass_record("nocolon").is_err());
        assert!(parse_pass_record("aabb:ccdd").is_err()); // wrong lengths

        let salt = hex::encode([1u8; 16]);
        let digest = hex::encode([2u8; 32]);
        let (s, d) = parse_pass_record(&format!("{salt}:{digest}")).unwrap();
        assert_eq!(s, [1u8; 16]);
        assert_eq!(d, [2u8; 32]);
    }
}
