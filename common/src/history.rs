//! Append-only manifest history.
//!
//! Layout in the backing store:
//! - `manifests/<sha256>`: canonical manifest bytes
//! - `transitions/<sha256>`: `manifest_hash || previous_transition_hash`
//! - `transitions/latest`: `transition_hash || ed25519 signature`
//!
//! Content-addressed entries are written once and never replaced. The
//! `latest` pointer only moves through compare-and-swap, and its signature
//! can only be produced with the key derived from the secret seed.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};

use crate::crypto::sha256;
use crate::error::{ContrastError, Result};

const LATEST_KEY: &str = "transitions/latest";
pub const LATEST_DOMAIN: &[u8] = b"contrast-history-latest-v1";

/// Key-value backend for the history.
pub trait Store: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
    /// Write `value` under `key`. Fails if a different value is already stored.
    fn put_once(&self, key: &str, value: &[u8]) -> Result<()>;
    /// Replace `key` only if its current value is `expected`.
    fn compare_and_swap(&self, key: &str, expected: Option<&[u8]>, value: &[u8]) -> Result<()>;
}

fn existing_conflict(key: &str) -> ContrastError {
    ContrastError::StorageError(format!("refusing to overwrite {}", key))
}

#[derive(Default)]
pub struct MemStore {
    entries: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn lock_err<T>(_: T) -> ContrastError {
    ContrastError::Internal("store lock poisoned".to_string())
}

impl Store for MemStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.entries.lock().map_err(lock_err)?.get(key).cloned())
    }

    fn put_once(&self, key: &str, value: &[u8]) -> Result<()> {
        let mut entries = self.entries.lock().map_err(lock_err)?;
        match entries.get(key) {
            Some(v) if v == value => Ok(()),
            Some(_) => Err(existing_conflict(key)),
            None => {
                entries.insert(key.to_string(), value.to_vec());
                Ok(())
            }
        }
    }

    fn compare_and_swap(&self, key: &str, expected: Option<&[u8]>, value: &[u8]) -> Result<()> {
        let mut entries = self.entries.lock().map_err(lock_err)?;
        if entries.get(key).map(|v| v.as_slice()) != expected {
            return Err(ContrastError::ManifestConflict(format!(
                "{} changed concurrently",
                key
            )));
        }
        entries.insert(key.to_string(), value.to_vec());
        Ok(())
    }
}

/// Files under a directory; keys map to relative paths.
pub struct FsStore {
    root: PathBuf,
    cas_lock: Mutex<()>,
}

impl FsStore {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root).map_err(|e| {
            ContrastError::StorageError(format!("create {}: {}", root.display(), e))
        })?;
        Ok(Self {
            root,
            cas_lock: Mutex::new(()),
        })
    }

    fn path(&self, key: &str) -> Result<PathBuf> {
        if key.split('/').any(|c| c.is_empty() || c == "." || c == "..") {
            return Err(ContrastError::StorageError(format!("invalid key {}", key)));
        }
        Ok(self.root.join(key))
    }

    fn write_atomic(path: &Path, value: &[u8]) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, value)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }
}

impl Store for FsStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        match std::fs::read(self.path(key)?) {
            Ok(v) => Ok(Some(v)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(ContrastError::StorageError(format!("read {}: {}", key, e))),
        }
    }

    fn put_once(&self, key: &str, value: &[u8]) -> Result<()> {
        let _guard = self.cas_lock.lock().map_err(lock_err)?;
        match self.get(key)? {
            Some(v) if v == value => Ok(()),
            Some(_) => Err(existing_conflict(key)),
            None => Self::write_atomic(&self.path(key)?, value),
        }
    }

    fn compare_and_swap(&self, key: &str, expected: Option<&[u8]>, value: &[u8]) -> Result<()> {
        let _guard = self.cas_lock.lock().map_err(lock_err)?;
        if self.get(key)?.as_deref() != expected {
            return Err(ContrastError::ManifestConflict(format!(
                "{} changed concurrently",
                key
            )));
        }
        Self::write_atomic(&self.path(key)?, value)
    }
}

/// A step in the history: which manifest became active after which transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub manifest_hash: [u8; 32],
    /// All zeroes for the first transition.
    pub previous_transition_hash: [u8; 32],
}

impl Transition {
    /// The transition that makes `manifest_bytes` active after `previous`.
    pub fn after(previous: Option<&LatestTransition>, manifest_bytes: &[u8]) -> Self {
        Self {
            manifest_hash: sha256(manifest_bytes),
            previous_transition_hash: previous.map(|l| l.transition_hash).unwrap_or([0u8; 32]),
        }
    }

    fn to_bytes(self) -> [u8; 64] {
        let mut out = [0u8; 64];
        out[..32].copy_from_slice(&self.manifest_hash);
        out[32..].copy_from_slice(&self.previous_transition_hash);
        out
    }

    fn from_bytes(raw: &[u8]) -> Result<Self> {
        if raw.len() != 64 {
            return Err(ContrastError::StorageError(format!(
                "transition must be 64 bytes, got {}",
                raw.len()
            )));
        }
        let mut t = Transition {
            manifest_hash: [0; 32],
            previous_transition_hash: [0; 32],
        };
        t.manifest_hash.copy_from_slice(&raw[..32]);
        t.previous_transition_hash.copy_from_slice(&raw[32..]);
        Ok(t)
    }

    pub fn hash(&self) -> [u8; 32] {
        sha256(&self.to_bytes())
    }

    pub fn is_first(&self) -> bool {
        self.previous_transition_hash == [0u8; 32]
    }
}

/// The signed pointer to the current transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LatestTransition {
    pub transition_hash: [u8; 32],
    pub signature: [u8; 64],
}

impl LatestTransition {
    pub fn sign(transition_hash: [u8; 32], key: &SigningKey) -> Self {
        Self {
            transition_hash,
            signature: key.sign(&latest_message(&transition_hash)).to_bytes(),
        }
    }

    fn to_bytes(&self) -> Vec<u8> {
        let mut out = self.transition_hash.to_vec();
        out.extend_from_slice(&self.signature);
        out
    }

    fn from_bytes(raw: &[u8]) -> Result<Self> {
        if raw.len() != 96 {
            return Err(ContrastError::StorageError(format!(
                "latest transition must be 96 bytes, got {}",
                raw.len()
            )));
        }
        let mut transition_hash = [0u8; 32];
        let mut signature = [0u8; 64];
        transition_hash.copy_from_slice(&raw[..32]);
        signature.copy_from_slice(&raw[32..]);
        Ok(Self {
            transition_hash,
            signature,
        })
    }

    pub fn verify(&self, key: &VerifyingKey) -> Result<()> {
        key.verify(
            &latest_message(&self.transition_hash),
            &Signature::from_bytes(&self.signature),
        )
        .map_err(|_| {
            ContrastError::RecoveryFailed("latest transition signature does not verify".to_string())
        })
    }
}

fn latest_message(transition_hash: &[u8; 32]) -> Vec<u8> {
    let mut m = LATEST_DOMAIN.to_vec();
    m.extend_from_slice(transition_hash);
    m
}

fn hash_key(prefix: &str, hash: &[u8; 32]) -> String {
    format!("{}/{}", prefix, hex::encode(hash))
}

/// Typed view over a `Store`.
pub struct History {
    store: Box<dyn Store>,
}

impl History {
    pub fn new(store: Box<dyn Store>) -> Self {
        Self { store }
    }

    pub fn in_memory() -> Self {
        Self::new(Box::new(MemStore::new()))
    }

    pub fn has_latest(&self) -> Result<bool> {
        Ok(self.store.get(LATEST_KEY)?.is_some())
    }

    /// Store manifest bytes, returning their hash.
    pub fn set_manifest(&self, bytes: &[u8]) -> Result<[u8; 32]> {
        let hash = sha256(bytes);
        self.store.put_once(&hash_key("manifests", &hash), bytes)?;
        Ok(hash)
    }

    pub fn get_manifest(&self, hash: &[u8; 32]) -> Result<Vec<u8>> {
        let bytes = self
            .store
            .get(&hash_key("manifests", hash))?
            .ok_or_else(|| {
                ContrastError::StorageError(format!("manifest {} missing", hex::encode(hash)))
            })?;
        if sha256(&bytes) != *hash {
            return Err(ContrastError::StorageError(format!(
                "manifest {} does not match its hash",
                hex::encode(hash)
            )));
        }
        Ok(bytes)
    }

    pub fn set_transition(&self, transition: &Transition) -> Result<[u8; 32]> {
        let hash = transition.hash();
        self.store
            .put_once(&hash_key("transitions", &hash), &transition.to_bytes())?;
        Ok(hash)
    }

    pub fn get_transition(&self, hash: &[u8; 32]) -> Result<Transition> {
        let raw = self
            .store
            .get(&hash_key("transitions", hash))?
            .ok_or_else(|| {
                ContrastError::StorageError(format!("transition {} missing", hex::encode(hash)))
            })?;
        let t = Transition::from_bytes(&raw)?;
        if t.hash() != *hash {
            return Err(ContrastError::StorageError(format!(
                "transition {} does not match its hash",
                hex::encode(hash)
            )));
        }
        Ok(t)
    }

    /// Latest pointer with its signature checked.
    pub fn get_latest(&self, key: &VerifyingKey) -> Result<LatestTransition> {
        let latest = self.get_latest_unverified()?;
        latest.verify(key)?;
        Ok(latest)
    }

    /// Latest pointer without a signature check. Only for reading data whose
    /// authenticity is established later, such as owner keys during recovery.
    pub fn get_latest_unverified(&self) -> Result<LatestTransition> {
        let raw = self
            .store
            .get(LATEST_KEY)?
            .ok_or_else(|| ContrastError::StorageError("no latest transition".to_string()))?;
        LatestTransition::from_bytes(&raw)
    }

    /// Move `latest` from `expected` (None for the first transition) to `latest`.
    fn swap_latest(
        &self,
        expected: Option<&LatestTransition>,
        latest: &LatestTransition,
    ) -> Result<()> {
        let expected_bytes = expected.map(|l| l.to_bytes());
        self.store
            .compare_and_swap(LATEST_KEY, expected_bytes.as_deref(), &latest.to_bytes())
    }

    /// Append `manifest_bytes` as the new active manifest.
    pub fn append(
        &self,
        previous: Option<&LatestTransition>,
        manifest_bytes: &[u8],
        key: &SigningKey,
    ) -> Result<LatestTransition> {
        let transition = Transition::after(previous, manifest_bytes);
        let latest = LatestTransition::sign(transition.hash(), key);
        self.commit(previous, manifest_bytes, &latest)?;
        Ok(latest)
    }

    /// Store `manifest_bytes` and move `latest` from `previous` to an
    /// already signed pointer, which must name `Transition::after(previous,
    /// manifest_bytes)`. Nothing is written if it does not.
    pub fn commit(
        &self,
        previous: Option<&LatestTransition>,
        manifest_bytes: &[u8],
        latest: &LatestTransition,
    ) -> Result<()> {
        let transition = Transition::after(previous, manifest_bytes);
        if transition.hash() != latest.transition_hash {
            return Err(ContrastError::Internal(
                "signed pointer does not name the appended transition".to_string(),
            ));
        }
        let manifest_hash = self.set_manifest(manifest_bytes)?;
        debug_assert_eq!(manifest_hash, transition.manifest_hash);
        self.set_transition(&transition)?;
        self.swap_latest(previous, latest)
    }

    /// Transitions from `head` back to the first, newest first.
    pub fn walk(&self, head: &[u8; 32]) -> Result<Vec<Transition>> {
        let mut out = Vec::new();
        let mut current = *head;
        loop {
            let t = self.get_transition(&current)?;
            out.push(t);
            if t.is_first() {
                return Ok(out);
            }
            current = t.previous_transition_hash;
        }
    }

    /// Manifest bytes from oldest to newest.
    pub fn manifests(&self, head: &[u8; 32]) -> Result<Vec<Vec<u8>>> {
        let mut manifests = self
            .walk(head)?
            .iter()
            .map(|t| self.get_manifest(&t.manifest_hash))
            .collect::<Result<Vec<_>>>()?;
        manifests.reverse();
        Ok(manifests)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;

    fn exercise(history: History) {
        let key = SigningKey::generate(&mut OsRng);
        assert!(!history.has_latest().unwrap());

        let l1 = history.append(None, b"manifest one", &key).unwrap();
        let l2 = history.append(Some(&l1), b"manifest two", &key).unwrap();
        assert!(history.has_latest().unwrap());

        let latest = history.get_latest(&key.verifying_key()).unwrap();
        assert_eq!(latest, l2);
        assert_eq!(
            history.manifests(&latest.transition_hash).unwrap(),
            vec![b"manifest one".to_vec(), b"manifest two".to_vec()]
        );
        assert_eq!(history.walk(&latest.transition_hash).unwrap().len(), 2);

        // Stale predecessor loses the race.
        let err = history.append(Some(&l1), b"manifest three", &key).unwrap_err();
        assert!(matches!(err, ContrastError::ManifestConflict(_)));

        // A different key cannot vouch for the pointer.
        let other = SigningKey::generate(&mut OsRng);
        assert!(history.get_latest(&other.verifying_key()).is_err());
    }

    #[test]
    fn test_mem_store_history() {
        exercise(History::in_memory());
    }

    #[test]
    fn test_fs_store_history() {
        let dir = tempfile::tempdir().unwrap();
        exercise(History::new(Box::new(FsStore::new(dir.path()).unwrap())));
    }

    #[test]
    fn test_fs_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let key = SigningKey::generate(&mut OsRng);
        let l1 = {
            let h = History::new(Box::new(FsStore::new(dir.path()).unwrap()));
            h.append(None, b"persisted", &key).unwrap()
        };
        let h = History::new(Box::new(FsStore::new(dir.path()).unwrap()));
        assert_eq!(h.get_latest(&key.verifying_key()).unwrap(), l1);
        let t = h.get_transition(&l1.transition_hash).unwrap();
        assert_eq!(h.get_manifest(&t.manifest_hash).unwrap(), b"persisted");
    }

    #[test]
    fn test_signed_transition_is_stored_only_on_commit() {
        let h = History::in_memory();
        let key = SigningKey::generate(&mut OsRng);
        let first = LatestTransition::sign(Transition::after(None, b"m1").hash(), &key);
        assert!(!h.has_latest().unwrap());

        // A pointer for other bytes is refused before anything is written.
        assert!(h.commit(None, b"other", &first).is_err());
        assert!(!h.has_latest().unwrap());
        assert!(h.get_transition(&first.transition_hash).is_err());

        h.commit(None, b"m1", &first).unwrap();
        assert_eq!(h.get_latest(&key.verifying_key()).unwrap(), first);

        // Prepared ahead of time, the next step matches what append stores.
        let second = Transition::after(Some(&first), b"m2");
        let appended = h.append(Some(&first), b"m2", &key).unwrap();
        assert_eq!(appended.transition_hash, second.hash());
        assert_eq!(h.get_transition(&second.hash()).unwrap(), second);

        // A stale previous pointer loses the compare-and-swap.
        let stale = LatestTransition::sign(Transition::after(Some(&first), b"m3").hash(), &key);
        assert!(h.commit(Some(&first), b"m3", &stale).is_err());
        assert_eq!(h.get_latest(&key.verifying_key()).unwrap(), appended);
    }

    #[test]
    fn test_content_addressed_entries_never_overwritten() {
        let store = MemStore::new();
        store.put_once("manifests/x", b"a").unwrap();
        store.put_once("manifests/x", b"a").unwrap();
        assert!(store.put_once("manifests/x", b"b").is_err());
        assert_eq!(store.get("manifests/x").unwrap().unwrap(), b"a");
    }

    #[test]
    fn test_fs_store_rejects_path_escape() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsStore::new(dir.path()).unwrap();
        assert!(store.get("../etc/passwd").is_err());
        assert!(store.put_once("manifests//x", b"a").is_err());
    }
}
