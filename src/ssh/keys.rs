//! SSH Key Store
//!
//! Creates, inspects and lists the key pairs identities authenticate with:
//! - Ed25519 keys (default)
//! - RSA keys of at least 3072 bits
//! - Passphrase-protected keys (inspected through their public half)
//!
//! Key material is parsed in-process with russh's `ssh_key` types; generation
//! and the independent fingerprint cross-check go through `ssh-keygen`.

use chrono::NaiveDate;
use russh::keys::ssh_key::{Algorithm, HashAlg, PrivateKey, PublicKey};
use serde::{Deserialize, Serialize};
use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::ssh_config::expand_tilde;
use crate::process::{ToolError, ToolRunner};

/// Smallest RSA modulus accepted for new and existing keys
pub const MIN_RSA_BITS: u32 = 3072;

/// RSA size used when none is requested
pub const DEFAULT_RSA_BITS: u32 = 4096;

/// Errors that can occur while generating or inspecting keys
#[derive(Debug, Error)]
pub enum KeyError {
    #[error("Key file not found: {0}")]
    NotFound(PathBuf),

    #[error("Failed to read key file {path}: {source}")]
    Unreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Corrupt key {path}: {message}")]
    Corrupt { path: PathBuf, message: String },

    #[error("Key already exists: {0}")]
    AlreadyExists(PathBuf),

    #[error("RSA key of {bits} bits is below the {min}-bit minimum")]
    WeakKey { bits: u32, min: u32 },

    #[error("Fingerprint mismatch for {path}: parsed {parsed}, ssh-keygen reported {reported}")]
    FingerprintMismatch {
        path: PathBuf,
        parsed: String,
        reported: String,
    },

    #[error(transparent)]
    Tool(#[from] ToolError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Key algorithm for generation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyAlgorithm {
    #[default]
    Ed25519,
    /// RSA with the given modulus size
    Rsa(u32),
}

impl KeyAlgorithm {
    /// `ssh-keygen -t` value, also used in default file names
    pub fn name(&self) -> &'static str {
        match self {
            KeyAlgorithm::Ed25519 => "ed25519",
            KeyAlgorithm::Rsa(_) => "rsa",
        }
    }

    pub fn rsa() -> Self {
        KeyAlgorithm::Rsa(DEFAULT_RSA_BITS)
    }
}

/// Everything known about a key pair on disk
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyPairRecord {
    pub private_path: PathBuf,
    pub public_path: PathBuf,
    /// `ed25519`, `rsa`, or the OpenSSH name of any other algorithm
    pub algorithm: String,
    pub bits: u32,
    /// `SHA256:<base64>`
    pub fingerprint: String,
    /// Public key comment, normally the owner's email
    pub comment: String,
    /// Private key needs a passphrase
    pub encrypted: bool,
    /// Permission bits of the private key (unix only)
    pub private_mode: Option<u32>,
    pub public_mode: Option<u32>,
    /// Permission bits of the containing directory
    pub dir_mode: Option<u32>,
}

impl KeyPairRecord {
    /// Private key readable by the owner only
    pub fn private_key_secure(&self) -> bool {
        self.private_mode.map(is_owner_only).unwrap_or(true)
    }

    /// Containing directory accessible by the owner only
    pub fn dir_secure(&self) -> bool {
        self.dir_mode.map(is_owner_only).unwrap_or(true)
    }
}

/// No group or other permission bits set
pub fn is_owner_only(mode: u32) -> bool {
    mode & 0o077 == 0
}

/// Permission bits of a path, `None` where the platform has no POSIX modes
pub fn file_mode(path: &Path) -> Option<u32> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::metadata(path)
            .ok()
            .map(|m| m.permissions().mode() & 0o777)
    }

    #[cfg(not(unix))]
    {
        let _ = path;
        None
    }
}

/// chmod a path (no-op where the platform has no POSIX modes)
pub fn set_mode(path: &Path, mode: u32) -> Result<(), std::io::Error> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(mode))
    }

    #[cfg(not(unix))]
    {
        let _ = (path, mode);
        Ok(())
    }
}

/// `<private>.pub`
pub fn public_key_path(private_path: &Path) -> PathBuf {
    let mut name = private_path.as_os_str().to_os_string();
    name.push(".pub");
    PathBuf::from(name)
}

/// Parse a public key file line (`<alg> <base64> [comment]`)
pub fn parse_public_key(text: &str) -> Result<PublicKey, String> {
    PublicKey::from_openssh(text.trim()).map_err(|e| e.to_string())
}

/// `SHA256:` fingerprint of a public key
pub fn fingerprint(key: &PublicKey) -> String {
    key.fingerprint(HashAlg::Sha256).to_string()
}

fn algorithm_name(key: &PublicKey) -> String {
    match key.algorithm() {
        Algorithm::Ed25519 => "ed25519".to_string(),
        Algorithm::Rsa { .. } => "rsa".to_string(),
        other => other.as_str().to_string(),
    }
}

fn key_bits(key: &PublicKey) -> u32 {
    if let Some(rsa) = key.key_data().rsa() {
        return rsa
            .n
            .as_positive_bytes()
            .and_then(|bytes| {
                bytes
                    .first()
                    .map(|first| bytes.len() as u32 * 8 - first.leading_zeros())
            })
            .unwrap_or(0);
    }
    match key.algorithm() {
        Algorithm::Ed25519 => 256,
        Algorithm::Ecdsa { curve } => match curve.as_str() {
            "nistp384" => 384,
            "nistp521" => 521,
            _ => 256,
        },
        _ => 0,
    }
}

/// Public half derived from the private key file, plus whether it is encrypted
fn parse_private(content: &str, path: &Path) -> Result<(Option<PublicKey>, bool), KeyError> {
    if let Ok(key) = PrivateKey::from_openssh(content) {
        // OpenSSH keys carry the public half in clear even when encrypted
        return Ok((Some(key.public_key().clone()), key.is_encrypted()));
    }

    if content.contains("ENCRYPTED") {
        return Ok((None, true));
    }

    russh::keys::decode_secret_key(content, None)
        .map(|key| (Some(key.public_key().clone()), false))
        .map_err(|e| KeyError::Corrupt {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
}

/// Inspect a key pair without applying the RSA size policy
pub fn inspect_key(path: &Path) -> Result<KeyPairRecord, KeyError> {
    let private_path = expand_tilde(&path.to_string_lossy());
    if !private_path.exists() {
        return Err(KeyError::NotFound(private_path));
    }
    let public_path = public_key_path(&private_path);

    let private_content =
        fs::read_to_string(&private_path).map_err(|source| KeyError::Unreadable {
            path: private_path.clone(),
            source,
        })?;
    let (derived, encrypted) = parse_private(&private_content, &private_path)?;

    let stored = if public_path.exists() {
        let text = fs::read_to_string(&public_path).map_err(|source| KeyError::Unreadable {
            path: public_path.clone(),
            source,
        })?;
        let key = parse_public_key(&text).map_err(|message| KeyError::Corrupt {
            path: public_path.clone(),
            message,
        })?;
        Some(key)
    } else {
        None
    };

    let public = match (stored, derived) {
        (Some(stored), Some(derived)) => {
            if fingerprint(&stored) != fingerprint(&derived) {
                return Err(KeyError::Corrupt {
                    path: public_path,
                    message: "public key does not match the private key".to_string(),
                });
            }
            stored
        }
        (Some(stored), None) => stored,
        (None, Some(derived)) => derived,
        (None, None) => {
            return Err(KeyError::Corrupt {
                path: private_path,
                message: "encrypted key has no public half to inspect".to_string(),
            })
        }
    };

    let dir_mode = private_path.parent().and_then(file_mode);

    Ok(KeyPairRecord {
        algorithm: algorithm_name(&public),
        bits: key_bits(&public),
        fingerprint: fingerprint(&public),
        comment: public.comment().to_string(),
        encrypted,
        private_mode: file_mode(&private_path),
        public_mode: file_mode(&public_path),
        dir_mode,
        private_path,
        public_path,
    })
}

/// Inspect a key pair and enforce the RSA size policy
pub fn validate_key(path: &Path) -> Result<KeyPairRecord, KeyError> {
    let record = inspect_key(path)?;
    if record.algorithm == "rsa" && record.bits < MIN_RSA_BITS {
        return Err(KeyError::WeakKey {
            bits: record.bits,
            min: MIN_RSA_BITS,
        });
    }
    debug!(
        path = %record.private_path.display(),
        algorithm = %record.algorithm,
        fingerprint = %record.fingerprint,
        "Key validated"
    );
    Ok(record)
}

/// Key pairs under one SSH directory
#[derive(Debug, Clone)]
pub struct KeyStore {
    dir: PathBuf,
    runner: ToolRunner,
}

impl KeyStore {
    pub fn new(dir: PathBuf, runner: ToolRunner) -> Self {
        Self { dir, runner }
    }

    /// Key store over `~/.ssh`
    pub fn default_dir() -> Option<PathBuf> {
        dirs::home_dir().map(|home| home.join(".ssh"))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// `<dir>/id_<alg>_<alias>`, with `_<YYYYMMDD>` appended for rotated keys
    pub fn default_key_path(
        &self,
        algorithm: KeyAlgorithm,
        alias: &str,
        rotated_on: Option<NaiveDate>,
    ) -> PathBuf {
        let mut name = format!("id_{}_{}", algorithm.name(), alias);
        if let Some(date) = rotated_on {
            name.push_str(&date.format("_%Y%m%d").to_string());
        }
        self.dir.join(name)
    }

    /// Generate a passphrase-less key pair at `path`
    pub async fn generate(
        &self,
        algorithm: KeyAlgorithm,
        email: &str,
        path: &Path,
        overwrite: bool,
    ) -> Result<KeyPairRecord, KeyError> {
        if let KeyAlgorithm::Rsa(bits) = algorithm {
            if bits < MIN_RSA_BITS {
                return Err(KeyError::WeakKey {
                    bits,
                    min: MIN_RSA_BITS,
                });
            }
        }

        let private_path = expand_tilde(&path.to_string_lossy());
        let public_path = public_key_path(&private_path);

        if private_path.exists() || public_path.exists() {
            if !overwrite {
                return Err(KeyError::AlreadyExists(private_path));
            }
            warn!(path = %private_path.display(), "Overwriting existing key pair");
            for existing in [&private_path, &public_path] {
                if existing.exists() {
                    fs::remove_file(existing)?;
                }
            }
        }

        if let Some(parent) = private_path.parent() {
            fs::create_dir_all(parent)?;
            set_mode(parent, 0o700)?;
        }

        let path_arg = private_path.to_string_lossy().to_string();
        let mut args: Vec<String> = vec!["-q".into(), "-t".into(), algorithm.name().into()];
        if let KeyAlgorithm::Rsa(bits) = algorithm {
            args.push("-b".into());
            args.push(bits.to_string());
        }
        args.extend([
            "-C".to_string(),
            email.to_string(),
            "-N".to_string(),
            String::new(),
            "-f".to_string(),
            path_arg,
        ]);
        self.runner.run_checked("ssh-keygen", &args).await?;

        set_mode(&private_path, 0o600)?;
        set_mode(&public_path, 0o644)?;

        let record = inspect_key(&private_path)?;
        let reported = self.tool_fingerprint(&public_path).await?;
        if reported != record.fingerprint {
            return Err(KeyError::FingerprintMismatch {
                path: public_path,
                parsed: record.fingerprint,
                reported,
            });
        }

        info!(
            path = %record.private_path.display(),
            algorithm = %record.algorithm,
            fingerprint = %record.fingerprint,
            "Key pair generated"
        );
        Ok(record)
    }

    /// Validate one key pair
    pub fn validate(&self, path: &Path) -> Result<KeyPairRecord, KeyError> {
        validate_key(path)
    }

    /// Every readable key pair in the directory (weak keys included), sorted by path
    pub fn list(&self) -> Result<Vec<KeyPairRecord>, KeyError> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(KeyError::Io(e)),
        };

        let mut records = Vec::new();
        for entry in entries.filter_map(|e| e.ok()) {
            let path = entry.path();
            if path.extension().map(|e| e == "pub").unwrap_or(false) {
                continue;
            }
            if !public_key_path(&path).exists() {
                continue;
            }
            match inspect_key(&path) {
                Ok(record) => records.push(record),
                Err(e) => debug!(path = %path.display(), "Skipping key file: {}", e),
            }
        }
        records.sort_by(|a, b| a.private_path.cmp(&b.private_path));
        Ok(records)
    }

    /// Fingerprint as `ssh-keygen -l -E sha256` reports it
    pub async fn tool_fingerprint(&self, public_path: &Path) -> Result<String, KeyError> {
        let output = self
            .runner
            .run_checked(
                "ssh-keygen",
                [
                    OsStr::new("-l"),
                    OsStr::new("-E"),
                    OsStr::new("sha256"),
                    OsStr::new("-f"),
                    public_path.as_os_str(),
                ],
            )
            .await?;
        output
            .stdout
            .split_whitespace()
            .nth(1)
            .map(|s| s.to_string())
            .ok_or_else(|| KeyError::Corrupt {
                path: public_path.to_path_buf(),
                message: format!("unexpected ssh-keygen output: {}", output.stdout.trim()),
            })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::process::tool_available;
    use tempfile::tempdir;

    pub const WORK_FINGERPRINT: &str = "SHA256:iZJ08tCjnUpiopZRqs4My89SrFPLqZf035iN8q9+QD0";

    pub fn fixture_dir() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures/keys")
    }

    /// Copy a fixture pair into `dir` with the modes git does not preserve
    pub fn install_fixture(name: &str, dir: &Path) -> PathBuf {
        let private = dir.join(name);
        fs::copy(fixture_dir().join(name), &private).unwrap();
        fs::copy(
            fixture_dir().join(format!("{}.pub", name)),
            public_key_path(&private),
        )
        .unwrap();
        set_mode(dir, 0o700).unwrap();
        set_mode(&private, 0o600).unwrap();
        private
    }

    #[test]
    fn test_validate_ed25519() {
        let temp = tempdir().unwrap();
        let path = install_fixture("id_ed25519_work", temp.path());

        let record = validate_key(&path).unwrap();
        assert_eq!(record.algorithm, "ed25519");
        assert_eq!(record.bits, 256);
        assert_eq!(record.fingerprint, WORK_FINGERPRINT);
        assert_eq!(record.comment, "w@co.com");
        assert!(!record.encrypted);
        assert!(record.private_key_secure());
    }

    #[test]
    fn test_weak_rsa_rejected() {
        let temp = tempdir().unwrap();
        let path = install_fixture("id_rsa_weak", temp.path());

        let record = inspect_key(&path).unwrap();
        assert_eq!(record.algorithm, "rsa");
        assert_eq!(record.bits, 2048);

        assert!(matches!(
            validate_key(&path),
            Err(KeyError::WeakKey { bits: 2048, min: MIN_RSA_BITS })
        ));
    }

    #[test]
    fn test_encrypted_key_inspected_from_public_half() {
        let temp = tempdir().unwrap();
        let path = install_fixture("id_ed25519_locked", temp.path());

        let record = validate_key(&path).unwrap();
        assert!(record.encrypted);
        assert_eq!(
            record.fingerprint,
            "SHA256:t936tnhcxIdVW2Vh5V5llfg2ITqBhgV0ubvXp9JDrmo"
        );
    }

    #[test]
    fn test_missing_and_corrupt() {
        let temp = tempdir().unwrap();
        assert!(matches!(
            validate_key(&temp.path().join("nope")),
            Err(KeyError::NotFound(_))
        ));

        let garbage = temp.path().join("id_garbage");
        fs::write(&garbage, "not a key").unwrap();
        assert!(matches!(
            validate_key(&garbage),
            Err(KeyError::Corrupt { .. })
        ));
    }

    #[test]
    fn test_mismatched_public_half_is_corrupt() {
        let temp = tempdir().unwrap();
        let path = install_fixture("id_ed25519_work", temp.path());
        fs::copy(
            fixture_dir().join("id_ed25519_personal.pub"),
            public_key_path(&path),
        )
        .unwrap();

        assert!(matches!(
            validate_key(&path),
            Err(KeyError::Corrupt { .. })
        ));
    }

    #[cfg(unix)]
    #[test]
    fn test_loose_permissions_reported() {
        let temp = tempdir().unwrap();
        let path = install_fixture("id_ed25519_work", temp.path());
        set_mode(&path, 0o644).unwrap();

        let record = validate_key(&path).unwrap();
        assert_eq!(record.private_mode, Some(0o644));
        assert!(!record.private_key_secure());
    }

    #[test]
    fn test_list_includes_every_pair() {
        let temp = tempdir().unwrap();
        install_fixture("id_ed25519_work", temp.path());
        install_fixture("id_rsa_weak", temp.path());
        fs::write(temp.path().join("config"), "Host x\n").unwrap();
        fs::write(temp.path().join("known_hosts"), "").unwrap();

        let store = KeyStore::new(temp.path().to_path_buf(), ToolRunner::default());
        let records = store.list().unwrap();
        let names: Vec<_> = records
            .iter()
            .map(|r| r.private_path.file_name().unwrap().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["id_ed25519_work", "id_rsa_weak"]);
    }

    #[test]
    fn test_default_key_path() {
        let store = KeyStore::new(PathBuf::from("/home/me/.ssh"), ToolRunner::default());
        assert_eq!(
            store.default_key_path(KeyAlgorithm::Ed25519, "work", None),
            PathBuf::from("/home/me/.ssh/id_ed25519_work")
        );
        let date = NaiveDate::from_ymd_opt(2026, 3, 1).unwrap();
        assert_eq!(
            store.default_key_path(KeyAlgorithm::rsa(), "work", Some(date)),
            PathBuf::from("/home/me/.ssh/id_rsa_work_20260301")
        );
    }

    #[tokio::test]
    async fn test_generate_rejects_weak_rsa_before_running_tool() {
        let temp = tempdir().unwrap();
        let store = KeyStore::new(temp.path().to_path_buf(), ToolRunner::default());
        let result = store
            .generate(KeyAlgorithm::Rsa(2048), "a@b.c", &temp.path().join("k"), false)
            .await;
        assert!(matches!(result, Err(KeyError::WeakKey { bits: 2048, .. })));
        assert!(!temp.path().join("k").exists());
    }

    #[tokio::test]
    async fn test_generate_sets_permissions() {
        if !tool_available("ssh-keygen") {
            println!("ssh-keygen not installed, skipping");
            return;
        }
        let temp = tempdir().unwrap();
        let ssh_dir = temp.path().join("ssh");
        // Pre-existing world-readable directory gets tightened
        fs::create_dir(&ssh_dir).unwrap();
        set_mode(&ssh_dir, 0o755).unwrap();
        let store = KeyStore::new(ssh_dir.clone(), ToolRunner::default());
        let path = store.default_key_path(KeyAlgorithm::Ed25519, "work", None);

        let record = store
            .generate(KeyAlgorithm::Ed25519, "w@co.com", &path, false)
            .await
            .unwrap();
        assert_eq!(record.algorithm, "ed25519");
        assert_eq!(record.comment, "w@co.com");
        assert!(record.fingerprint.starts_with("SHA256:"));

        #[cfg(unix)]
        {
            assert_eq!(record.private_mode, Some(0o600));
            assert_eq!(record.public_mode, Some(0o644));
            assert_eq!(record.dir_mode, Some(0o700));
        }

        let again = store
            .generate(KeyAlgorithm::Ed25519, "w@co.com", &path, false)
            .await;
        assert!(matches!(again, Err(KeyError::AlreadyExists(_))));

        let replaced = store
            .generate(KeyAlgorithm::Ed25519, "w@co.com", &path, true)
            .await
            .unwrap();
        assert_ne!(replaced.fingerprint, record.fingerprint);
    }
}
