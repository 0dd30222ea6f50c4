//! Configuration Management Module
//!
//! Handles persistent storage of identities and engine settings, the SSH
//! client config merger, and the encrypted per-identity token vault.

pub mod ssh_config;
pub mod storage;
pub mod types;
pub mod vault;

pub use ssh_config::{
    default_ssh_config_path, merge, InstallOutcome, ManagedHostBlock, SshConfigDocument,
    SshConfigError, SshConfigInstaller,
};
pub use storage::{config_dir, config_file, ConfigStorage, ConfigStore, MemoryConfigStore, StorageError};
pub use types::{
    AgentMode, ConfigFile, EngineSettings, EnvMode, EnvironmentIsolation, GitIsolation, GitScope,
    Identity, IdentityError, IsolationSettings, Signing, SigningFormat, SshIsolation,
    TokenIsolation, TokenPolicy, CONFIG_VERSION,
};
pub use vault::{MachineContext, SecretToken, TokenVault, VaultError};
