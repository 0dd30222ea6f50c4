//! Identity Switch Orchestrator
//!
//! Composes the key store, SSH config merger, agent controller, Git writer and
//! token vault into one strictly sequential switch:
//!
//! ```text
//!   1. LoadIdentity      config store lookup          UnknownIdentity
//!   2. ValidateKey       parse + permission check     KeyUnavailable / InsecurePermissions
//!      (pending_switch = alias persisted here)
//!   3. InstallSshConfig  merge + atomic write         ConfigMergeConflict
//!   4. ReloadAgent       reset + load + verify        AgentUnreachable / AgentMismatch
//!   5. ApplyGitConfig    git config                   ExternalToolFailed
//!   6. PersistCurrent    current_identity = alias, pending cleared
//! ```
//!
//! A failed step stops the switch. Earlier steps are not rolled back; the
//! pending marker lets [`IdentitySwitcher::diagnose`] compare the machine against the
//! identity the user asked for.

pub mod diagnostics;

use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::ssh_config::{InstallOutcome, ManagedHostBlock, SshConfigInstaller};
use crate::config::storage::{self, ConfigStore};
use crate::config::types::{
    AgentMode, ConfigFile, EngineSettings, EnvMode, GitScope, Identity, TokenPolicy,
};
use crate::config::vault::{SecretToken, TokenVault};
use crate::error::{EngineError, SwitchError};
use crate::git::{GitCli, GitConfigurator};
use crate::platform::{PlatformApi, PlatformHost};
use crate::process::ToolRunner;
use crate::ssh::agent::{AgentControl, AgentError, SshAgentController};
use crate::ssh::keys::{self, KeyAlgorithm, KeyPairRecord, KeyStore};
use crate::ssh::probe::{self, ProbeResult};

pub use diagnostics::{DiagnosticReport, FixOutcome, FixReport, Issue, IssueKind, Severity};

/// Mode required on private keys
pub const PRIVATE_KEY_MODE: u32 = 0o600;

/// Mode required on the SSH directory
pub const SSH_DIR_MODE: u32 = 0o700;

/// Mode required on the SSH config file
pub const SSH_CONFIG_MODE: u32 = 0o600;

/// One step of a switch, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SwitchStep {
    LoadIdentity,
    ValidateKey,
    InstallSshConfig,
    ReloadAgent,
    ApplyGitConfig,
    PersistCurrent,
}

impl fmt::Display for SwitchStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SwitchStep::LoadIdentity => "load identity",
            SwitchStep::ValidateKey => "validate key",
            SwitchStep::InstallSshConfig => "install SSH config",
            SwitchStep::ReloadAgent => "reload SSH agent",
            SwitchStep::ApplyGitConfig => "apply git config",
            SwitchStep::PersistCurrent => "persist current identity",
        };
        f.write_str(name)
    }
}

/// What a completed switch did
#[derive(Debug, Clone)]
pub struct SwitchReport {
    pub alias: String,
    pub completed: Vec<SwitchStep>,
    /// `None` for identities without a key
    pub key: Option<KeyPairRecord>,
    pub ssh_config: InstallOutcome,
    /// Agent contents after step 4
    pub agent_fingerprints: Vec<String>,
}

/// Resolved locations and limits the switcher works with
#[derive(Debug, Clone)]
pub struct SwitcherOptions {
    pub ssh_dir: PathBuf,
    pub ssh_config_path: PathBuf,
    pub secrets_dir: PathBuf,
    pub tool_timeout: Duration,
    pub backup_retention: usize,
}

impl SwitcherOptions {
    /// Resolve settings against the home directory
    pub fn from_settings(settings: &EngineSettings) -> Result<Self, EngineError> {
        let ssh_dir = match &settings.ssh_dir {
            Some(dir) => dir.clone(),
            None => KeyStore::default_dir().ok_or_else(|| {
                EngineError::Io(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "failed to determine home directory",
                ))
            })?,
        };
        let secrets_dir = match &settings.secrets_dir {
            Some(dir) => dir.clone(),
            None => storage::secrets_dir()?,
        };
        Ok(Self::for_dirs(ssh_dir, secrets_dir, settings))
    }

    /// Options rooted at explicit directories
    pub fn for_dirs(ssh_dir: PathBuf, secrets_dir: PathBuf, settings: &EngineSettings) -> Self {
        Self {
            ssh_config_path: ssh_dir.join("config"),
            ssh_dir,
            secrets_dir,
            tool_timeout: Duration::from_secs(settings.tool_timeout_secs),
            backup_retention: settings.backup_retention,
        }
    }
}

/// Switches identities and answers questions about the active one
pub struct IdentitySwitcher {
    store: Arc<dyn ConfigStore>,
    agent: Arc<dyn AgentControl>,
    git: Arc<dyn GitConfigurator>,
    ssh_config: SshConfigInstaller,
    vault: TokenVault,
    runner: ToolRunner,
    options: SwitcherOptions,
}

fn fail(
    alias: &str,
    failed_step: SwitchStep,
    completed: &[SwitchStep],
    source: impl Into<EngineError>,
) -> SwitchError {
    let source = source.into();
    warn!(alias, step = %failed_step, "Switch failed: {}", source);
    SwitchError {
        alias: alias.to_string(),
        failed_step,
        completed: completed.to_vec(),
        source,
    }
}

impl IdentitySwitcher {
    pub fn new(
        store: Arc<dyn ConfigStore>,
        agent: Arc<dyn AgentControl>,
        git: Arc<dyn GitConfigurator>,
        options: SwitcherOptions,
    ) -> Self {
        Self {
            ssh_config: SshConfigInstaller::new(
                options.ssh_config_path.clone(),
                options.backup_retention,
            ),
            vault: TokenVault::new(options.secrets_dir.clone()),
            runner: ToolRunner::new(options.tool_timeout),
            store,
            agent,
            git,
            options,
        }
    }

    /// Switcher over the real `ssh-agent` and `git`, configured from the store
    pub async fn open(store: Arc<dyn ConfigStore>) -> Result<Self, EngineError> {
        let config = store.load().await?;
        let options = SwitcherOptions::from_settings(&config.settings)?;
        let runner = ToolRunner::new(options.tool_timeout);
        let agent = Arc::new(SshAgentController::new(runner.clone()));
        let git = Arc::new(GitCli::new(runner));
        Ok(Self::new(store, agent, git, options))
    }

    /// Replace the token vault (alternate directory or key-derivation inputs)
    pub fn with_vault(mut self, vault: TokenVault) -> Self {
        self.vault = vault;
        self
    }

    pub fn options(&self) -> &SwitcherOptions {
        &self.options
    }

    pub fn vault(&self) -> &TokenVault {
        &self.vault
    }

    pub fn ssh_config(&self) -> &SshConfigInstaller {
        &self.ssh_config
    }

    /// Tool runner for work done on behalf of `identity`
    fn runner_for(&self, identity: &Identity) -> ToolRunner {
        match identity.isolation.environment.mode {
            EnvMode::Inherit => self.runner.clone(),
            EnvMode::Scrubbed => self.runner.clone().scrubbed(),
        }
    }

    fn key_store_for(&self, identity: &Identity) -> KeyStore {
        KeyStore::new(self.options.ssh_dir.clone(), self.runner_for(identity))
    }

    async fn load_identity(&self, alias: &str) -> Result<(ConfigFile, Identity), EngineError> {
        let config = self.store.load().await?;
        let identity = config
            .get_identity(alias)
            .cloned()
            .ok_or_else(|| EngineError::UnknownIdentity(alias.to_string()))?;
        Ok((config, identity))
    }

    // Registry

    pub async fn list_identities(&self) -> Result<Vec<Identity>, EngineError> {
        Ok(self.store.load().await?.identities)
    }

    pub async fn current_identity(&self) -> Result<Option<Identity>, EngineError> {
        Ok(self.store.load().await?.current().cloned())
    }

    pub async fn add_identity(&self, identity: Identity) -> Result<(), EngineError> {
        let mut config = self.store.load().await?;
        let alias = identity.alias.clone();
        config.add_identity(identity)?;
        self.store.save(&config).await?;
        info!(alias = %alias, "Identity added");
        Ok(())
    }

    pub async fn update_identity(&self, identity: Identity) -> Result<(), EngineError> {
        let mut config = self.store.load().await?;
        let alias = identity.alias.clone();
        config.update_identity(identity)?;
        self.store.save(&config).await?;
        info!(alias = %alias, "Identity updated");
        Ok(())
    }

    /// Remove an identity and its vault entry; key files are left on disk
    pub async fn remove_identity(&self, alias: &str) -> Result<Identity, EngineError> {
        let mut config = self.store.load().await?;
        let removed = config.remove_identity(alias)?;
        self.vault.delete(alias)?;
        self.store.save(&config).await?;
        info!(alias, "Identity removed");
        Ok(removed)
    }

    // Keys

    /// Generate a key for an identity and point the identity at it
    ///
    /// With `rotate`, the new file name carries today's date so the old key
    /// stays in place until it is revoked on the platform.
    pub async fn generate_key(
        &self,
        alias: &str,
        algorithm: KeyAlgorithm,
        rotate: bool,
        overwrite: bool,
    ) -> Result<KeyPairRecord, EngineError> {
        let (mut config, mut identity) = self.load_identity(alias).await?;
        let key_store = self.key_store_for(&identity);
        let rotated_on = rotate.then(|| chrono::Local::now().date_naive());
        let path = key_store.default_key_path(algorithm, alias, rotated_on);

        let record = key_store
            .generate(algorithm, &identity.email, &path, overwrite)
            .await?;

        identity.key_path = Some(record.private_path.clone());
        config.update_identity(identity)?;
        self.store.save(&config).await?;
        Ok(record)
    }

    /// Every key pair in the SSH directory
    pub fn list_keys(&self) -> Result<Vec<KeyPairRecord>, EngineError> {
        let key_store = KeyStore::new(self.options.ssh_dir.clone(), self.runner.clone());
        Ok(key_store.list()?)
    }

    /// Validate a key and enforce owner-only permissions on it
    fn check_key(path: &Path) -> Result<KeyPairRecord, EngineError> {
        let record = keys::validate_key(path)?;
        if let Some(mode) = record.private_mode {
            if !keys::is_owner_only(mode) {
                return Err(EngineError::InsecurePermissions {
                    path: record.private_path.clone(),
                    mode,
                    expected: PRIVATE_KEY_MODE,
                });
            }
        }
        Ok(record)
    }

    // Switch steps

    async fn install_ssh_config(
        &self,
        identity: &Identity,
        record: Option<&KeyPairRecord>,
        platform: &PlatformHost,
    ) -> Result<InstallOutcome, EngineError> {
        let managed: Vec<ManagedHostBlock> = record
            .map(|r| {
                ManagedHostBlock::new(
                    platform,
                    &r.private_path,
                    identity.isolation.ssh.identities_only,
                )
            })
            .into_iter()
            .collect();
        let hosts = vec![platform.ssh_host.clone()];
        let installer = self.ssh_config.clone();

        let outcome = tokio::task::spawn_blocking(move || installer.install(&managed, &hosts))
            .await
            .map_err(|e| EngineError::Io(std::io::Error::other(e.to_string())))??;
        Ok(outcome)
    }

    async fn reload_agent(
        &self,
        identity: &Identity,
        record: Option<&KeyPairRecord>,
    ) -> Result<Vec<String>, EngineError> {
        let mode = identity.isolation.ssh.agent;
        if mode == AgentMode::Exclusive {
            self.agent.reset().await?;
        }

        let Some(record) = record else {
            return match mode {
                AgentMode::Exclusive => Ok(Vec::new()),
                AgentMode::Shared => Ok(self.agent.list_fingerprints().await?),
            };
        };

        self.agent.load_only(&record.private_path).await?;
        let held = self.agent.list_fingerprints().await?;
        let expected = vec![record.fingerprint.clone()];
        let satisfied = match mode {
            AgentMode::Exclusive => held == expected,
            AgentMode::Shared => held.contains(&record.fingerprint),
        };
        if !satisfied {
            return Err(AgentError::Unexpected {
                expected,
                actual: held,
            }
            .into());
        }
        Ok(held)
    }

    async fn apply_git(&self, identity: &Identity) -> Result<(), EngineError> {
        match &identity.isolation.git.scope {
            GitScope::Global => self.git.apply_global(identity).await?,
            GitScope::Repository { path } => self.git.apply_local(identity, path).await?,
        }
        Ok(())
    }

    /// Make `alias` the active identity
    pub async fn switch(&self, alias: &str) -> Result<SwitchReport, SwitchError> {
        let mut completed = Vec::with_capacity(6);
        info!(alias, "Switching identity");

        // 1. Load identity
        let (mut config, identity) = self
            .load_identity(alias)
            .await
            .map_err(|e| fail(alias, SwitchStep::LoadIdentity, &completed, e))?;
        identity
            .validate()
            .map_err(|e| fail(alias, SwitchStep::LoadIdentity, &completed, e))?;
        completed.push(SwitchStep::LoadIdentity);

        // 2. Validate key
        let record = match identity.key_path() {
            Some(path) => Some(
                Self::check_key(path)
                    .map_err(|e| fail(alias, SwitchStep::ValidateKey, &completed, e))?,
            ),
            None => {
                debug!(alias, "Identity has no key; SSH config and agent will be cleared");
                None
            }
        };
        completed.push(SwitchStep::ValidateKey);

        config.pending_switch = Some(alias.to_string());
        self.store
            .save(&config)
            .await
            .map_err(|e| fail(alias, SwitchStep::InstallSshConfig, &completed, e))?;

        // 3. Install SSH config
        let platform = config.settings.platform.clone();
        let ssh_config = self
            .install_ssh_config(&identity, record.as_ref(), &platform)
            .await
            .map_err(|e| fail(alias, SwitchStep::InstallSshConfig, &completed, e))?;
        completed.push(SwitchStep::InstallSshConfig);

        // 4. Reload agent
        let agent_fingerprints = self
            .reload_agent(&identity, record.as_ref())
            .await
            .map_err(|e| fail(alias, SwitchStep::ReloadAgent, &completed, e))?;
        completed.push(SwitchStep::ReloadAgent);

        // 5. Apply git config
        self.apply_git(&identity)
            .await
            .map_err(|e| fail(alias, SwitchStep::ApplyGitConfig, &completed, e))?;
        completed.push(SwitchStep::ApplyGitConfig);

        // 6. Persist current identity
        config.current_identity = Some(alias.to_string());
        config.pending_switch = None;
        self.store
            .save(&config)
            .await
            .map_err(|e| fail(alias, SwitchStep::PersistCurrent, &completed, e))?;
        completed.push(SwitchStep::PersistCurrent);

        info!(
            alias,
            fingerprint = ?record.as_ref().map(|r| r.fingerprint.as_str()),
            "Identity switched"
        );
        Ok(SwitchReport {
            alias: alias.to_string(),
            completed,
            key: record,
            ssh_config,
            agent_fingerprints,
        })
    }

    // Tokens

    fn ensure_token_policy(identity: &Identity) -> Result<(), EngineError> {
        match identity.isolation.token.policy {
            TokenPolicy::Vault => Ok(()),
            TokenPolicy::Disabled => Err(EngineError::TokenStorageDisabled(
                identity.alias.clone(),
            )),
        }
    }

    /// Encrypt and store an identity's platform token
    pub async fn store_token(&self, alias: &str, token: &str) -> Result<(), EngineError> {
        let (_, identity) = self.load_identity(alias).await?;
        Self::ensure_token_policy(&identity)?;
        self.vault.store(alias, token)?;
        Ok(())
    }

    /// Decrypt an identity's platform token
    pub async fn retrieve_token(&self, alias: &str) -> Result<SecretToken, EngineError> {
        let (_, identity) = self.load_identity(alias).await?;
        Self::ensure_token_policy(&identity)?;
        Ok(self.vault.retrieve(alias)?)
    }

    /// Check the stored token belongs to the identity's platform account
    pub async fn verify_token(
        &self,
        alias: &str,
        api: &dyn PlatformApi,
    ) -> Result<String, EngineError> {
        let (_, identity) = self.load_identity(alias).await?;
        Self::ensure_token_policy(&identity)?;
        let token = self.vault.retrieve(alias)?;
        let account = api.whoami(token.expose()).await?;

        if let Some(expected) = &identity.username {
            if !expected.eq_ignore_ascii_case(&account) {
                return Err(EngineError::TokenAccountMismatch {
                    alias: alias.to_string(),
                    expected: expected.clone(),
                    actual: account,
                });
            }
        }
        info!(alias, account = %account, "Token verified");
        Ok(account)
    }

    /// Register the identity's public key with its platform account
    ///
    /// Returns the key title used (`ghswitch-<alias>@<host name>`).
    pub async fn upload_public_key(
        &self,
        alias: &str,
        api: &dyn PlatformApi,
    ) -> Result<String, EngineError> {
        let (_, identity) = self.load_identity(alias).await?;
        Self::ensure_token_policy(&identity)?;
        let key_path = identity
            .key_path()
            .ok_or_else(|| EngineError::KeyUnavailable(format!("identity '{}' has no key", alias)))?;
        let record = keys::validate_key(key_path)?;
        let public_key = std::fs::read_to_string(&record.public_path)?;

        let token = self.vault.retrieve(alias)?;
        let host = hostname::get()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|_| "unknown-host".to_string());
        let title = format!("ghswitch-{}@{}", alias, host);

        api.upload_public_key(token.expose(), &title, public_key.trim())
            .await?;
        info!(alias, title = %title, fingerprint = %record.fingerprint, "Public key uploaded");
        Ok(title)
    }

    /// Repositories visible to the identity's platform account
    pub async fn list_repos(
        &self,
        alias: &str,
        api: &dyn PlatformApi,
    ) -> Result<Vec<String>, EngineError> {
        let token = self.retrieve_token(alias).await?;
        Ok(api.list_repos(token.expose()).await?)
    }

    // Connectivity

    /// `ssh -T` against the platform with only this identity's key
    pub async fn test_connection(&self, alias: &str) -> Result<ProbeResult, EngineError> {
        let (config, identity) = self.load_identity(alias).await?;
        let key_path = identity
            .key_path()
            .ok_or_else(|| EngineError::KeyUnavailable(format!("identity '{}' has no key", alias)))?;
        let record = keys::validate_key(key_path)?;
        let result = probe::probe(
            &self.runner_for(&identity),
            &config.settings.platform,
            &record.private_path,
        )
        .await?;

        if let (Some(expected), Some(actual)) = (&identity.username, &result.account) {
            if !expected.eq_ignore_ascii_case(actual) {
                warn!(alias, expected = %expected, actual = %actual, "Key authenticates a different account");
            }
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_order_and_names() {
        let steps = [
            SwitchStep::LoadIdentity,
            SwitchStep::ValidateKey,
            SwitchStep::InstallSshConfig,
            SwitchStep::ReloadAgent,
            SwitchStep::ApplyGitConfig,
            SwitchStep::PersistCurrent,
        ];
        let names: Vec<String> = steps.iter().map(|s| s.to_string()).collect();
        assert_eq!(names[3], "reload SSH agent");
        assert_eq!(
            serde_json::to_string(&SwitchStep::InstallSshConfig).unwrap(),
            "\"install_ssh_config\""
        );
    }

    #[test]
    fn test_options_for_dirs() {
        let settings = EngineSettings::default();
        let options =
            SwitcherOptions::for_dirs(PathBuf::from("/h/.ssh"), PathBuf::from("/h/s"), &settings);
        assert_eq!(options.ssh_config_path, PathBuf::from("/h/.ssh/config"));
        assert_eq!(options.tool_timeout, Duration::from_secs(30));
        assert_eq!(options.backup_retention, 5);
    }
}
