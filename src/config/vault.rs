//! Token Vault - Per-Identity Encrypted Token Files
//!
//! Platform access tokens are stored one file per identity in
//! `{secrets_dir}/{alias}.token` (directory 0700, files 0600).
//!
//! File format: `nonce (12 bytes) || AES-256-GCM ciphertext+tag`.
//!
//! The key is `SHA-256("ghswitch-token-vault-v1" || alias || hostname || home dir name)`.
//! Because the alias is part of the key, a blob copied from another identity's
//! file fails authentication instead of decrypting.
//!
//! ⚠️ The machine inputs are not secret: anyone who can read the vault directory
//! can usually learn the host name and home directory name too. This protects
//! against casual copying of the files to another machine or account, not
//! against a co-resident attacker.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use zeroize::{Zeroize, Zeroizing};

use super::types::validate_alias;

/// Nonce length in bytes (96 bits for AES-GCM)
const NONCE_LEN: usize = 12;

/// AES-GCM authentication tag length
const TAG_LEN: usize = 16;

/// Domain separator mixed into every derived key
const KEY_CONTEXT: &[u8] = b"ghswitch-token-vault-v1";

/// Vault file extension
const TOKEN_EXT: &str = "token";

/// Vault errors
#[derive(Debug, thiserror::Error)]
pub enum VaultError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("No token stored for identity '{0}'")]
    NotFound(String),

    #[error("Token for identity '{0}' failed authentication (tampered, corrupted or not ours)")]
    DecryptFailed(String),

    #[error("Invalid identity alias '{0}'")]
    InvalidAlias(String),

    #[error("Encryption failed")]
    EncryptionFailed,
}

/// A decrypted access token; wiped from memory on drop and never printed
#[derive(Clone, PartialEq, Eq)]
pub struct SecretToken(Zeroizing<String>);

impl SecretToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(Zeroizing::new(token.into()))
    }

    pub fn expose(&self) -> &str {
        self.0.as_str()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for SecretToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecretToken(<{} bytes redacted>)", self.0.len())
    }
}

/// Machine-local inputs to the vault key derivation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MachineContext {
    pub hostname: String,
    pub home_leaf: String,
}

impl MachineContext {
    /// Read host name and home directory leaf name from this machine
    pub fn detect() -> Self {
        let hostname = hostname::get()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|_| "unknown-host".to_string());
        let home_leaf = dirs::home_dir()
            .and_then(|home| home.file_name().map(|n| n.to_string_lossy().to_string()))
            .unwrap_or_else(|| "unknown-home".to_string());

        Self {
            hostname,
            home_leaf,
        }
    }
}

/// Derive the per-identity AES-256 key
fn derive_key(alias: &str, machine: &MachineContext) -> Zeroizing<[u8; 32]> {
    let mut hasher = Sha256::new();
    // Length-prefix each field so ("ab","c") and ("a","bc") differ
    for part in [
        KEY_CONTEXT,
        alias.as_bytes(),
        machine.hostname.as_bytes(),
        machine.home_leaf.as_bytes(),
    ] {
        hasher.update((part.len() as u32).to_be_bytes());
        hasher.update(part);
    }

    let mut digest = hasher.finalize();
    let mut key = Zeroizing::new([0u8; 32]);
    key.copy_from_slice(&digest);
    digest.as_mut_slice().zeroize();
    key
}

/// Encrypt a token for one identity: `nonce || ciphertext`
fn seal(alias: &str, machine: &MachineContext, token: &str) -> Result<Vec<u8>, VaultError> {
    let key = derive_key(alias, machine);
    let cipher = Aes256Gcm::new_from_slice(&*key).map_err(|_| VaultError::EncryptionFailed)?;

    let mut nonce_bytes = [0u8; NONCE_LEN];
    rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);

    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce_bytes), token.as_bytes())
        .map_err(|_| VaultError::EncryptionFailed)?;

    let mut blob = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    blob.extend_from_slice(&nonce_bytes);
    blob.extend_from_slice(&ciphertext);
    Ok(blob)
}

/// Decrypt a blob for one identity
fn open(alias: &str, machine: &MachineContext, blob: &[u8]) -> Result<SecretToken, VaultError> {
    if blob.len() < NONCE_LEN + TAG_LEN {
        return Err(VaultError::DecryptFailed(alias.to_string()));
    }

    let key = derive_key(alias, machine);
    let cipher = Aes256Gcm::new_from_slice(&*key).map_err(|_| VaultError::EncryptionFailed)?;
    let (nonce_bytes, ciphertext) = blob.split_at(NONCE_LEN);

    let plaintext = Zeroizing::new(
        cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|_| VaultError::DecryptFailed(alias.to_string()))?,
    );

    let token = std::str::from_utf8(&plaintext)
        .map_err(|_| VaultError::DecryptFailed(alias.to_string()))?;
    Ok(SecretToken::new(token))
}

/// Token vault manager
pub struct TokenVault {
    dir: PathBuf,
    machine: MachineContext,
}

impl TokenVault {
    /// Create a vault rooted at `dir`, keyed to this machine
    pub fn new(dir: PathBuf) -> Self {
        Self::with_machine(dir, MachineContext::detect())
    }

    /// Create a vault with explicit key-derivation inputs
    pub fn with_machine(dir: PathBuf, machine: MachineContext) -> Self {
        tracing::debug!("TokenVault initialized: dir={:?}", dir);
        Self { dir, machine }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Get the vault file path for an identity
    pub fn entry_path(&self, alias: &str) -> Result<PathBuf, VaultError> {
        validate_alias(alias).map_err(|_| VaultError::InvalidAlias(alias.to_string()))?;
        Ok(self.dir.join(format!("{}.{}", alias, TOKEN_EXT)))
    }

    /// Check if a token exists for an identity
    pub fn exists(&self, alias: &str) -> bool {
        self.entry_path(alias).map(|p| p.exists()).unwrap_or(false)
    }

    /// Encrypt and store a token, replacing any previous one
    pub fn store(&self, alias: &str, token: &str) -> Result<(), VaultError> {
        let path = self.entry_path(alias)?;
        tracing::info!(alias, len = token.len(), "Storing token in vault");

        self.ensure_dir()?;
        let blob = seal(alias, &self.machine, token)?;

        // Write atomically: write to temp file then rename
        let temp_path = path.with_extension(format!("{}.tmp", TOKEN_EXT));
        write_private(&temp_path, &blob)?;
        fs::rename(&temp_path, &path)?;

        tracing::info!(alias, "Token stored");
        Ok(())
    }

    /// Load and decrypt the token for an identity
    pub fn retrieve(&self, alias: &str) -> Result<SecretToken, VaultError> {
        let path = self.entry_path(alias)?;
        tracing::debug!(alias, "Loading token from vault");

        let blob = match fs::read(&path) {
            Ok(blob) => blob,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(alias, "No vault entry");
                return Err(VaultError::NotFound(alias.to_string()));
            }
            Err(e) => return Err(VaultError::Io(e)),
        };

        match open(alias, &self.machine, &blob) {
            Ok(token) => {
                tracing::debug!(alias, len = token.len(), "Token decrypted");
                Ok(token)
            }
            Err(e) => {
                tracing::error!(alias, "Vault entry failed authentication");
                Err(e)
            }
        }
    }

    /// Delete the token for an identity
    pub fn delete(&self, alias: &str) -> Result<(), VaultError> {
        let path = self.entry_path(alias)?;
        match fs::remove_file(&path) {
            Ok(()) => {
                tracing::info!(alias, "Vault entry deleted");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(VaultError::Io(e)),
        }
    }

    /// List all aliases that have stored tokens
    pub fn list(&self) -> Result<Vec<String>, VaultError> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }

        let mut aliases = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().map_or(false, |ext| ext == TOKEN_EXT) {
                if let Some(stem) = path.file_stem() {
                    aliases.push(stem.to_string_lossy().to_string());
                }
            }
        }
        aliases.sort();
        Ok(aliases)
    }

    fn ensure_dir(&self) -> Result<(), VaultError> {
        fs::create_dir_all(&self.dir)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&self.dir, fs::Permissions::from_mode(0o700))?;
        }
        Ok(())
    }
}

/// Write a file that is owner read/write only from the moment it exists
fn write_private(path: &Path, data: &[u8]) -> Result<(), std::io::Error> {
    let mut options = fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(path)?;
    file.write_all(data)?;
    file.sync_all()?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        // mode() only applies on creation; a leftover temp file keeps its old bits
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    }
    Ok(())
}
