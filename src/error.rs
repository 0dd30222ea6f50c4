//! Engine error types
//!
//! Every component has its own error enum; [`EngineError`] flattens them into
//! the kinds callers act on.

use std::path::PathBuf;
use thiserror::Error;

use crate::config::ssh_config::SshConfigError;
use crate::config::storage::StorageError;
use crate::config::types::IdentityError;
use crate::config::vault::VaultError;
use crate::git::GitError;
use crate::platform::PlatformError;
use crate::process::ToolError;
use crate::ssh::agent::AgentError;
use crate::ssh::keys::KeyError;
use crate::switch::SwitchStep;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Unknown identity '{0}'")]
    UnknownIdentity(String),

    #[error("Invalid identity: {0}")]
    InvalidIdentity(String),

    #[error("Key unavailable: {0}")]
    KeyUnavailable(String),

    #[error("Insecure permissions on {path}: mode {mode:o}, expected {expected:o}")]
    InsecurePermissions {
        path: PathBuf,
        mode: u32,
        expected: u32,
    },

    #[error("Weak key: RSA key of {bits} bits is below the {min}-bit minimum")]
    WeakKey { bits: u32, min: u32 },

    #[error("Key already exists: {0}")]
    KeyExists(PathBuf),

    #[error("Vault entry for '{0}' failed to decrypt")]
    VaultDecryptFailed(String),

    #[error("No vault entry for '{0}'")]
    VaultEntryNotFound(String),

    #[error("Token storage is disabled for identity '{0}'")]
    TokenStorageDisabled(String),

    #[error("Token for '{alias}' belongs to '{actual}', expected '{expected}'")]
    TokenAccountMismatch {
        alias: String,
        expected: String,
        actual: String,
    },

    #[error("SSH agent unreachable: {0}")]
    AgentUnreachable(String),

    #[error("SSH agent holds {actual:?}, expected {expected:?}")]
    AgentMismatch {
        expected: Vec<String>,
        actual: Vec<String>,
    },

    #[error("{tool} timed out after {secs}s")]
    ExternalToolTimeout { tool: String, secs: u64 },

    #[error("{tool} failed: {message}")]
    ExternalToolFailed { tool: String, message: String },

    #[error("Cannot merge SSH config (line {line}): {message}")]
    ConfigMergeConflict { line: usize, message: String },

    #[error("Platform error: {0}")]
    Platform(String),

    #[error("Config storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    /// Whether `auto_fix` can repair this condition in place
    pub fn is_auto_fixable(&self) -> bool {
        matches!(self, EngineError::InsecurePermissions { .. })
    }
}

impl From<ToolError> for EngineError {
    fn from(err: ToolError) -> Self {
        match err {
            ToolError::Timeout { tool, secs } => EngineError::ExternalToolTimeout { tool, secs },
            other => EngineError::ExternalToolFailed {
                tool: other.tool().to_string(),
                message: other.to_string(),
            },
        }
    }
}

impl From<KeyError> for EngineError {
    fn from(err: KeyError) -> Self {
        match err {
            KeyError::WeakKey { bits, min } => EngineError::WeakKey { bits, min },
            KeyError::AlreadyExists(path) => EngineError::KeyExists(path),
            KeyError::Tool(e) => e.into(),
            KeyError::Io(e) => EngineError::Io(e),
            other @ (KeyError::NotFound(_)
            | KeyError::Unreadable { .. }
            | KeyError::Corrupt { .. }
            | KeyError::FingerprintMismatch { .. }) => EngineError::KeyUnavailable(other.to_string()),
        }
    }
}

impl From<VaultError> for EngineError {
    fn from(err: VaultError) -> Self {
        match err {
            VaultError::NotFound(alias) => EngineError::VaultEntryNotFound(alias),
            VaultError::DecryptFailed(alias) => EngineError::VaultDecryptFailed(alias),
            VaultError::InvalidAlias(alias) => {
                EngineError::InvalidIdentity(format!("invalid alias '{}'", alias))
            }
            VaultError::Io(e) => EngineError::Io(e),
            VaultError::EncryptionFailed => {
                EngineError::Io(std::io::Error::other("token encryption failed"))
            }
        }
    }
}

impl From<SshConfigError> for EngineError {
    fn from(err: SshConfigError) -> Self {
        match err {
            SshConfigError::Parse { line, message } => {
                EngineError::ConfigMergeConflict { line, message }
            }
            SshConfigError::Io(e) => EngineError::Io(e),
            SshConfigError::NoHomeDir => EngineError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "failed to determine home directory",
            )),
        }
    }
}

impl From<AgentError> for EngineError {
    fn from(err: AgentError) -> Self {
        match err {
            AgentError::Unreachable(message) => EngineError::AgentUnreachable(message),
            AgentError::LoadFailed { path, message } => EngineError::ExternalToolFailed {
                tool: "ssh-add".to_string(),
                message: format!("{}: {}", path.display(), message),
            },
            AgentError::Unexpected { expected, actual } => {
                EngineError::AgentMismatch { expected, actual }
            }
            AgentError::Tool(e) => e.into(),
        }
    }
}

impl From<GitError> for EngineError {
    fn from(err: GitError) -> Self {
        match err {
            GitError::NotARepository(path) => EngineError::ExternalToolFailed {
                tool: "git".to_string(),
                message: format!("not a git repository: {}", path.display()),
            },
            GitError::Tool(e) => e.into(),
        }
    }
}

impl From<IdentityError> for EngineError {
    fn from(err: IdentityError) -> Self {
        match err {
            IdentityError::Unknown(alias) => EngineError::UnknownIdentity(alias),
            other => EngineError::InvalidIdentity(other.to_string()),
        }
    }
}

impl From<PlatformError> for EngineError {
    fn from(err: PlatformError) -> Self {
        EngineError::Platform(err.to_string())
    }
}

/// A switch that stopped at `failed_step`; `completed` lists what already ran
#[derive(Debug, Error)]
#[error("Switch to '{alias}' failed at {failed_step}: {source}")]
pub struct SwitchError {
    pub alias: String,
    pub failed_step: SwitchStep,
    pub completed: Vec<SwitchStep>,
    #[source]
    pub source: EngineError,
}
