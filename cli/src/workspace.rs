//! Files the CLI keeps between invocations.
//!
//! ```text
//! <workspace>/
//!   manifest.json          last generated manifest
//!   workload-owner.pem     Ed25519 key authorizing manifest updates
//!   seedshare-owner.pem    RSA-3072 key the seed share is encrypted to
//!   seed-shares.json       returned by the first `set`
//!   verify/                CA certificates and history from `verify`
//! ```

use std::path::{Path, PathBuf};

use contrast_common::seedshare::SeedShareDocument;
use contrast_common::Manifest;
use ed25519_dalek::pkcs8::spki::der::pem::LineEnding;
use ed25519_dalek::pkcs8::{DecodePrivateKey, EncodePrivateKey};
use ed25519_dalek::SigningKey;
use rand::rngs::OsRng;
use rsa::RsaPrivateKey;

use crate::error::{CliError, Result};

pub const MANIFEST_FILE: &str = "manifest.json";
pub const WORKLOAD_OWNER_KEY_FILE: &str = "workload-owner.pem";
pub const SEEDSHARE_OWNER_KEY_FILE: &str = "seedshare-owner.pem";
pub const SEED_SHARES_FILE: &str = "seed-shares.json";
pub const VERIFY_DIR: &str = "verify";

const SEEDSHARE_KEY_BITS: usize = 3072;

#[derive(Debug, Clone)]
pub struct Workspace {
    root: PathBuf,
}

impl Workspace {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path(&self, file: &str) -> PathBuf {
        self.root.join(file)
    }

    pub fn create(&self) -> Result<()> {
        std::fs::create_dir_all(&self.root).map_err(|e| CliError::io(&self.root, e))
    }

    pub fn load_manifest(&self) -> Result<Manifest> {
        load_manifest(&self.path(MANIFEST_FILE))
    }

    pub fn save_manifest(&self, manifest: &Manifest) -> Result<()> {
        let path = self.path(MANIFEST_FILE);
        let json = serde_json::to_vec_pretty(manifest).map_err(|e| CliError::parse(&path, e))?;
        write_file(&path, &json)
    }

    pub fn workload_owner_key(&self) -> Result<SigningKey> {
        let path = self.path(WORKLOAD_OWNER_KEY_FILE);
        let pem = read_string(&path)?;
        SigningKey::from_pkcs8_pem(&pem).map_err(|e| CliError::parse(&path, e))
    }

    /// Load the workload owner key, creating it if the file does not exist.
    pub fn workload_owner_key_or_create(&self) -> Result<SigningKey> {
        let path = self.path(WORKLOAD_OWNER_KEY_FILE);
        if path.exists() {
            return self.workload_owner_key();
        }
        let key = SigningKey::generate(&mut OsRng);
        let pem = key
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(|e| CliError::parse(&path, e))?;
        write_secret(&path, pem.as_bytes())?;
        tracing::info!(path = %path.display(), "created workload owner key");
        Ok(key)
    }

    pub fn seedshare_owner_key(&self) -> Result<RsaPrivateKey> {
        let path = self.path(SEEDSHARE_OWNER_KEY_FILE);
        let pem = read_string(&path)?;
        RsaPrivateKey::from_pkcs8_pem(&pem).map_err(|e| CliError::parse(&path, e))
    }

    /// Load the seed-share owner key, creating it if the file does not exist.
    pub fn seedshare_owner_key_or_create(&self) -> Result<RsaPrivateKey> {
        let path = self.path(SEEDSHARE_OWNER_KEY_FILE);
        if path.exists() {
            return self.seedshare_owner_key();
        }
        let key = RsaPrivateKey::new(&mut OsRng, SEEDSHARE_KEY_BITS)
            .map_err(|e| CliError::parse(&path, e))?;
        let pem = key
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(|e| CliError::parse(&path, e))?;
        write_secret(&path, pem.as_bytes())?;
        tracing::info!(path = %path.display(), "created seed-share owner key");
        Ok(key)
    }

    pub fn save_seed_shares(&self, doc: &SeedShareDocument) -> Result<()> {
        let path = self.path(SEED_SHARES_FILE);
        let json = serde_json::to_vec_pretty(doc).map_err(|e| CliError::parse(&path, e))?;
        write_secret(&path, &json)
    }

    pub fn load_seed_shares(&self) -> Result<SeedShareDocument> {
        let path = self.path(SEED_SHARES_FILE);
        let text = read_string(&path)?;
        serde_json::from_str(&text).map_err(|e| CliError::parse(&path, e))
    }
}

pub fn load_manifest(path: &Path) -> Result<Manifest> {
    let bytes = std::fs::read(path).map_err(|e| CliError::io(path, e))?;
    Ok(Manifest::from_json(&bytes)?)
}

pub(crate) fn read_string(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).map_err(|e| CliError::io(path, e))
}

pub(crate) fn write_file(path: &Path, contents: &[u8]) -> Result<()> {
    std::fs::write(path, contents).map_err(|e| CliError::io(path, e))
}

/// Write a file readable only by the owner.
fn write_secret(path: &Path, contents: &[u8]) -> Result<()> {
    write_file(path, contents)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
            .map_err(|e| CliError::io(path, e))?;
    }
    Ok(())
}
