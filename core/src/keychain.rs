// Copyright (c) 2024-2025 The TezSign Foundation

//! Keychain: per-key lock state and the monotonic watermark discipline
//!
//! Every sign request passes through one gate, in order:
//!
//! 1. the payload decodes as one of the three consensus kinds,
//! 2. the key is `UNLOCKED`,
//! 3. the `(level, round)` pair is strictly above the stored watermark
//!    for that kind (lexicographic),
//! 4. the new watermark is persisted *before* signing, so a crash between
//!    commit and signature costs one missed sign, never a double sign,
//! 5. the BLS signature is produced over the exact payload bytes.
//!
//! A failed watermark commit marks the key `CORRUPTED` for the rest of
//! the process lifetime; a corrupted key refuses to sign.

use std::{
    collections::HashMap,
    fs, io,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use blst::min_pk::SecretKey;
use log::{error, warn};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use tezsign_wire::rpc::{KeyStatus, LockState, Watermark};

use crate::{
    bls,
    tenderbake::{self, SignKind},
};

/// Per-kind watermarks in [SignKind::index] order.
pub type Watermarks = [Watermark; 3];

/// Keychain failures, mapped onto the remote error codes by the gadget
/// handler.
#[derive(Clone, PartialEq, Debug, thiserror::Error)]
pub enum KeychainError {
    #[error("key not found")]
    KeyNotFound,

    #[error("key locked")]
    KeyLocked,

    #[error("stale level/round: {kind} ({level}, {round}) <= ({last_level}, {last_round})")]
    StaleWatermark {
        kind: SignKind,
        level: u32,
        round: u32,
        last_level: u32,
        last_round: u32,
    },

    #[error("key state corrupted")]
    Corrupted,

    #[error("bad sign payload: {0}")]
    BadPayload(#[from] tenderbake::DecodeError),
}

/// Watermark persistence collaborator. `store` must be atomic with
/// respect to crashes (write-rename or equivalent).
pub trait WatermarkStore: Send + Sync {
    fn load_all(&self) -> io::Result<HashMap<String, Watermarks>>;
    fn store(&self, alias: &str, watermarks: &Watermarks) -> io::Result<()>;
}

struct KeyEntry {
    address: [u8; bls::ADDRESS_LEN],
    public_key: [u8; bls::PUBLIC_KEY_LEN],
    secret: SecretKey,
    lock_state: LockState,
    /// SHA-256 of (salt || passphrase); None means no passphrase was set
    /// and the key cannot be unlocked over the wire once locked.
    pass_digest: Option<[u8; 32]>,
    pass_salt: [u8; 16],
    watermarks: Watermarks,
}

impl KeyEntry {
    fn status(&self) -> KeyStatus {
        KeyStatus {
            address: self.address,
            public_key: self.public_key,
            lock_state: self.lock_state,
            watermarks: self.watermarks,
        }
    }
}

/// In-memory key table keyed by tz4 address string.
///
/// The outer map is fixed after startup; each entry carries its own lock
/// so signs on one key serialise without ordering signs across keys.
pub struct Keychain {
    store: Arc<dyn WatermarkStore>,
    keys: Mutex<HashMap<String, Arc<Mutex<KeyEntry>>>>,
    /// Watermarks recovered from the store at startup, applied as keys
    /// are registered.
    recovered: Mutex<HashMap<String, Watermarks>>,
}

impl Keychain {
    /// Build a keychain over a watermark store, recovering persisted
    /// watermarks.
    pub fn new(store: Arc<dyn WatermarkStore>) -> io::Result<Self> {
        let recovered = store.load_all()?;
        Ok(Keychain {
            store,
            keys: Mutex::new(HashMap::new()),
            recovered: Mutex::new(recovered),
        })
    }

    /// Register a key. Returns its tz4 alias. A key with a passphrase
    /// digest starts `LOCKED`; one without starts `UNLOCKED`.
    pub fn add_key(
        &self,
        secret: SecretKey,
        pass_digest: Option<[u8; 32]>,
        pass_salt: [u8; 16],
    ) -> String {
        let public_key = bls::compressed_public_key(&secret);
        let address = bls::address(&public_key);
        let alias = bls::tz4_address(&public_key);

        let watermarks = self
            .recovered
            .lock()
            .unwrap()
            .remove(&alias)
            .unwrap_or_default();

        let lock_state = if pass_digest.is_some() {
            LockState::Locked
        } else {
            LockState::Unlocked
        };

        let entry = KeyEntry {
            address,
            public_key,
            secret,
            lock_state,
            pass_digest,
            pass_salt,
            watermarks,
        };
        self.keys
            .lock()
            .unwrap()
            .insert(alias.clone(), Arc::new(Mutex::new(entry)));
        alias
    }

    fn entry(&self, alias: &str) -> Result<Arc<Mutex<KeyEntry>>, KeychainError> {
        self.keys
            .lock()
            .unwrap()
            .get(alias)
            .cloned()
            .ok_or(KeychainError::KeyNotFound)
    }

    /// Look up a key by its 20-byte address payload.
    pub fn alias_for_address(&self, address: &[u8; bls::ADDRESS_LEN]) -> Option<String> {
        let keys = self.keys.lock().unwrap();
        keys.iter()
            .find(|(_, e)| &e.lock().unwrap().address == address)
            .map(|(alias, _)| alias.clone())
    }

    /// Sign a consensus payload under the watermark discipline.
    pub fn sign(&self, alias: &str, payload: &[u8]) -> Result<[u8; bls::SIGNATURE_LEN], KeychainError> {
        let info = tenderbake::decode_sign_payload(payload)?;

        let entry = self.entry(alias)?;
        let mut entry = entry.lock().unwrap();

        match entry.lock_state {
            LockState::Unlocked => {}
            LockState::Locked => return Err(KeychainError::KeyLocked),
            LockState::Corrupted => return Err(KeychainError::Corrupted),
        }

        let last = entry.watermarks[info.kind.index()];
        if (info.level, info.round) <= (last.level, last.round) {
            warn!(
                "stale watermark alias={} kind={} level={} round={} last_level={} last_round={}",
                alias, info.kind, info.level, info.round, last.level, last.round
            );
            return Err(KeychainError::StaleWatermark {
                kind: info.kind,
                level: info.level,
                round: info.round,
                last_level: last.level,
                last_round: last.round,
            });
        }

        // Commit before signing. A crash after this point skips one sign;
        // a crash before it changes nothing.
        entry.watermarks[info.kind.index()] = Watermark {
            level: info.level,
            round: info.round,
        };
        if let Err(err) = self.store.store(alias, &entry.watermarks) {
            error!("watermark store failed, marking key corrupted alias={alias} err={err}");
            entry.lock_state = LockState::Corrupted;
            return Err(KeychainError::Corrupted);
        }

        Ok(bls::sign(&entry.secret, payload))
    }

    /// Unlock a key with its passphrase. A wrong passphrase (or a key
    /// with no passphrase set) reports `KeyLocked`.
    pub fn unlock(&self, alias: &str, passphrase: &[u8]) -> Result<LockState, KeychainError> {
        let entry = self.entry(alias)?;
        let mut entry = entry.lock().unwrap();

        match entry.lock_state {
            LockState::Corrupted => return Err(KeychainError::Corrupted),
            LockState::Unlocked => return Ok(LockState::Unlocked),
            LockState::Locked => {}
        }

        let expected = entry.pass_digest.ok_or(KeychainError::KeyLocked)?;
        let mut h = Sha256::new();
        h.update(entry.pass_salt);
        h.update(passphrase);
        let digest: [u8; 32] = h.finalize().into();

        if bool::from(digest[..].ct_eq(&expected[..])) {
            entry.lock_state = LockState::Unlocked;
            Ok(LockState::Unlocked)
        } else {
            Err(KeychainError::KeyLocked)
        }
    }

    /// Explicitly lock a key.
    pub fn lock(&self, alias: &str) -> Result<(), KeychainError> {
        let entry = self.entry(alias)?;
        let mut entry = entry.lock().unwrap();
        if entry.lock_state == LockState::Unlocked {
            entry.lock_state = LockState::Locked;
        }
        Ok(())
    }

    /// Status snapshot for every registered key.
    pub fn status(&self) -> Vec<KeyStatus> {
        let keys = self.keys.lock().unwrap();
        let mut out: Vec<KeyStatus> = keys
            .values()
            .map(|e| e.lock().unwrap().status())
            .collect();
        out.sort_by(|a, b| a.address.cmp(&b.address));
        out
    }
}

/// One-file-per-key watermark store using write-rename for crash
/// atomicity. Record layout: 3 x (level u32 LE, round u32 LE).
pub struct FileStore {
    dir: PathBuf,
}

const RECORD_LEN: usize = 24;
const RECORD_EXT: &str = "wm";

impl FileStore {
    pub fn new(dir: impl Into<PathBuf>) -> io::Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(FileStore { dir })
    }

    fn record_path(&self, alias: &str) -> PathBuf {
        self.dir.join(format!("{alias}.{RECORD_EXT}"))
    }

    fn decode_record(data: &[u8]) -> Option<Watermarks> {
        if data.len() != RECORD_LEN {
            return None;
        }
        let mut wm = Watermarks::default();
        for (i, slot) in wm.iter_mut().enumerate() {
            let off = i * 8;
            slot.level = u32::from_le_bytes(data[off..off + 4].try_into().unwrap());
            slot.round = u32::from_le_bytes(data[off + 4..off + 8].try_into().unwrap());
        }
        Some(wm)
    }

    fn encode_record(watermarks: &Watermarks) -> [u8; RECORD_LEN] {
        let mut out = [0u8; RECORD_LEN];
        for (i, slot) in watermarks.iter().enumerate() {
            let off = i * 8;
            out[off..off + 4].copy_from_slice(&slot.level.to_le_bytes());
            out[off + 4..off + 8].copy_from_slice(&slot.round.to_le_bytes());
        }
        out
    }
}

impl WatermarkStore for FileStore {
    fn load_all(&self) -> io::Result<HashMap<String, Watermarks>> {
        let mut out = HashMap::new();
        for dirent in fs::read_dir(&self.dir)? {
            let path = dirent?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(RECORD_EXT) {
                continue;
            }
            let Some(alias) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            match fs::read(&path).map(|d| Self::decode_record(&d)) {
                Ok(Some(wm)) => {
                    out.insert(alias.to_string(), wm);
                }
                Ok(None) => warn!("malformed watermark record, ignoring path={path:?}"),
                Err(err) => return Err(err),
            }
        }
        Ok(out)
    }

    fn store(&self, alias: &str, watermarks: &Watermarks) -> io::Result<()> {
        let path = self.record_path(alias);
        let tmp = path.with_extension("wm.tmp");

        write_sync(&tmp, &Self::encode_record(watermarks))?;
        fs::rename(&tmp, &path)
    }
}

fn write_sync(path: &Path, data: &[u8]) -> io::Result<()> {
    use std::io::Write;
    let mut f = fs::File::create(path)?;
    f.write_all(data)?;
    f.sync_all()
}
