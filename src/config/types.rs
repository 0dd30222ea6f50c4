//! Configuration Types
//!
//! Identity records, their typed isolation settings, and the persisted
//! configuration file that owns the "current identity" pointer.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::platform::PlatformHost;

/// Current config file format version
pub const CONFIG_VERSION: u32 = 1;

/// Longest accepted alias
const MAX_ALIAS_LEN: usize = 64;

/// Identity validation errors
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum IdentityError {
    #[error("Invalid alias '{0}': use 1-64 letters, digits, '-' or '_'")]
    InvalidAlias(String),

    #[error("Invalid email '{0}'")]
    InvalidEmail(String),

    #[error("Identity '{0}' already exists")]
    Duplicate(String),

    #[error("Unknown identity '{0}'")]
    Unknown(String),
}

/// Check an alias is safe to use as a file name component.
///
/// Aliases name vault files and key files; rejecting instead of sanitizing
/// keeps two aliases from ever mapping to the same file.
pub fn validate_alias(alias: &str) -> Result<(), IdentityError> {
    let valid = !alias.is_empty()
        && alias.len() <= MAX_ALIAS_LEN
        && alias
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(IdentityError::InvalidAlias(alias.to_string()))
    }
}

/// How the SSH agent is reconciled on switch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentMode {
    /// Flush every held key, then load only this identity's key
    #[default]
    Exclusive,
    /// Add this identity's key next to whatever the agent already holds
    Shared,
}

/// SSH isolation dimension
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SshIsolation {
    #[serde(default)]
    pub agent: AgentMode,
    /// Emit `IdentitiesOnly yes` in the managed host block
    #[serde(default = "default_true")]
    pub identities_only: bool,
}

impl Default for SshIsolation {
    fn default() -> Self {
        Self {
            agent: AgentMode::Exclusive,
            identities_only: true,
        }
    }
}

/// Where Git identity settings are written
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GitScope {
    #[default]
    Global,
    /// Local config of one repository
    Repository { path: PathBuf },
}

/// Git isolation dimension
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GitIsolation {
    #[serde(default)]
    pub scope: GitScope,
    /// Pin `core.sshCommand` to this identity's key (repository scope only)
    #[serde(default)]
    pub pin_ssh_command: bool,
}

/// Token storage policy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenPolicy {
    #[default]
    Vault,
    /// Never store a token for this identity
    Disabled,
}

/// Token isolation dimension
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenIsolation {
    #[serde(default)]
    pub policy: TokenPolicy,
}

/// Child-process environment policy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvMode {
    #[default]
    Inherit,
    /// Strip credential-carrying variables before running tools for this identity
    Scrubbed,
}

/// Environment isolation dimension
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentIsolation {
    #[serde(default)]
    pub mode: EnvMode,
}

/// All isolation dimensions of one identity
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IsolationSettings {
    #[serde(default)]
    pub ssh: SshIsolation,
    #[serde(default)]
    pub git: GitIsolation,
    #[serde(default)]
    pub token: TokenIsolation,
    #[serde(default)]
    pub environment: EnvironmentIsolation,
}

/// Commit signing format (`gpg.format`)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SigningFormat {
    #[default]
    Ssh,
    OpenPgp,
}

impl SigningFormat {
    pub fn as_git_value(&self) -> &'static str {
        match self {
            SigningFormat::Ssh => "ssh",
            SigningFormat::OpenPgp => "openpgp",
        }
    }
}

/// Commit/tag signing settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signing {
    /// `user.signingkey` value (key path for SSH, key id for OpenPGP)
    pub key: String,
    #[serde(default)]
    pub format: SigningFormat,
}

/// A named persona: Git user info, SSH key, platform account
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub alias: String,
    /// Git `user.name`
    pub name: String,
    /// Git `user.email`
    pub email: String,
    /// Account name on the hosting platform
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    /// Private key path; the public key is `<path>.pub`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signing: Option<Signing>,
    #[serde(default)]
    pub isolation: IsolationSettings,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl Identity {
    pub fn new(alias: impl Into<String>, name: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            alias: alias.into(),
            name: name.into(),
            email: email.into(),
            username: None,
            key_path: None,
            signing: None,
            isolation: IsolationSettings::default(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_key(mut self, key_path: impl Into<PathBuf>) -> Self {
        self.key_path = Some(key_path.into());
        self
    }

    pub fn with_username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    pub fn key_path(&self) -> Option<&Path> {
        self.key_path.as_deref()
    }

    /// Validate the fields that are used as file names or written verbatim
    pub fn validate(&self) -> Result<(), IdentityError> {
        validate_alias(&self.alias)?;
        let email = self.email.trim();
        let valid_email = email
            .split_once('@')
            .map(|(user, domain)| !user.is_empty() && !domain.is_empty())
            .unwrap_or(false)
            && !email.contains(char::is_whitespace);
        if !valid_email {
            return Err(IdentityError::InvalidEmail(self.email.clone()));
        }
        Ok(())
    }
}

/// Engine-wide settings stored next to the identities
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineSettings {
    #[serde(default)]
    pub platform: PlatformHost,
    /// SSH directory (default: ~/.ssh)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh_dir: Option<PathBuf>,
    /// Token vault directory (default: <config dir>/secrets)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secrets_dir: Option<PathBuf>,
    /// Timeout for each external tool invocation
    #[serde(default = "default_tool_timeout_secs")]
    pub tool_timeout_secs: u64,
    /// Number of SSH config backups kept
    #[serde(default = "default_backup_retention")]
    pub backup_retention: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            platform: PlatformHost::default(),
            ssh_dir: None,
            secrets_dir: None,
            tool_timeout_secs: default_tool_timeout_secs(),
            backup_retention: default_backup_retention(),
        }
    }
}

/// Root config file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigFile {
    pub version: u32,
    #[serde(default)]
    pub identities: Vec<Identity>,
    /// Alias of the identity the last completed switch activated
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_identity: Option<String>,
    /// Alias of a switch that started touching shared state but did not finish
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_switch: Option<String>,
    #[serde(default)]
    pub settings: EngineSettings,
}

impl Default for ConfigFile {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION,
            identities: Vec::new(),
            current_identity: None,
            pending_switch: None,
            settings: EngineSettings::default(),
        }
    }
}

impl ConfigFile {
    pub fn get_identity(&self, alias: &str) -> Option<&Identity> {
        self.identities.iter().find(|i| i.alias == alias)
    }

    pub fn list_identities(&self) -> &[Identity] {
        &self.identities
    }

    pub fn current(&self) -> Option<&Identity> {
        self.current_identity
            .as_deref()
            .and_then(|alias| self.get_identity(alias))
    }

    pub fn add_identity(&mut self, identity: Identity) -> Result<(), IdentityError> {
        identity.validate()?;
        if self.get_identity(&identity.alias).is_some() {
            return Err(IdentityError::Duplicate(identity.alias));
        }
        self.identities.push(identity);
        Ok(())
    }

    /// Replace an existing identity with the same alias
    pub fn update_identity(&mut self, identity: Identity) -> Result<(), IdentityError> {
        identity.validate()?;
        match self.identities.iter_mut().find(|i| i.alias == identity.alias) {
            Some(slot) => {
                *slot = identity;
                Ok(())
            }
            None => Err(IdentityError::Unknown(identity.alias)),
        }
    }

    /// Remove an identity and clear any pointer naming it
    pub fn remove_identity(&mut self, alias: &str) -> Result<Identity, IdentityError> {
        let index = self
            .identities
            .iter()
            .position(|i| i.alias == alias)
            .ok_or_else(|| IdentityError::Unknown(alias.to_string()))?;

        if self.current_identity.as_deref() == Some(alias) {
            self.current_identity = None;
        }
        if self.pending_switch.as_deref() == Some(alias) {
            self.pending_switch = None;
        }
        Ok(self.identities.remove(index))
    }
}

fn default_true() -> bool {
    true
}

fn default_tool_timeout_secs() -> u64 {
    30
}

fn default_backup_retention() -> usize {
    5
}
