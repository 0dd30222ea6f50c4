//! Shared harness: fake agent, fake git, fake platform, fixture keys in a temp SSH dir

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tempfile::TempDir;

use ghswitch::config::{
    ConfigFile, EngineSettings, GitScope, Identity, MachineContext, MemoryConfigStore, TokenVault,
};
use ghswitch::git::{GitConfigSnapshot, GitConfigurator, GitError};
use ghswitch::platform::{PlatformApi, PlatformError};
use ghswitch::ssh::agent::{AgentControl, AgentError};
use ghswitch::ssh::keys::validate_key;
use ghswitch::switch::{IdentitySwitcher, SwitcherOptions};

pub const WORK_FP: &str = "SHA256:iZJ08tCjnUpiopZRqs4My89SrFPLqZf035iN8q9+QD0";
pub const PERSONAL_FP: &str = "SHA256:TTex25lZWjP5WSTmcHQD5BbSIVlyfT/LwEWV1lqSAoc";

pub const FOREIGN_CONFIG: &str = "\
ServerAliveInterval 60

# jump host
Host bastion
    HostName jump.example.com
    User admin

Host *.internal
    ProxyJump bastion
";

/// In-memory agent holding fingerprints of loaded keys
#[derive(Default)]
pub struct FakeAgent {
    held: Mutex<Vec<String>>,
    pub fail_load: AtomicBool,
    pub unreachable: AtomicBool,
}

impl FakeAgent {
    pub fn held(&self) -> Vec<String> {
        self.held.lock().clone()
    }

    pub fn set_fail_load(&self, fail: bool) {
        self.fail_load.store(fail, Ordering::SeqCst);
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    fn check_reachable(&self) -> Result<(), AgentError> {
        if self.unreachable.load(Ordering::SeqCst) {
            Err(AgentError::Unreachable("fake agent is down".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl AgentControl for FakeAgent {
    async fn reset(&self) -> Result<(), AgentError> {
        self.check_reachable()?;
        self.held.lock().clear();
        Ok(())
    }

    async fn load_only(&self, key_path: &Path) -> Result<(), AgentError> {
        self.check_reachable()?;
        if self.fail_load.load(Ordering::SeqCst) {
            return Err(AgentError::LoadFailed {
                path: key_path.to_path_buf(),
                message: "agent refused key".to_string(),
            });
        }
        let record = validate_key(key_path).map_err(|e| AgentError::LoadFailed {
            path: key_path.to_path_buf(),
            message: e.to_string(),
        })?;
        let mut held = self.held.lock();
        if !held.contains(&record.fingerprint) {
            held.push(record.fingerprint);
        }
        Ok(())
    }

    async fn list_fingerprints(&self) -> Result<Vec<String>, AgentError> {
        self.check_reachable()?;
        Ok(self.held())
    }
}

/// Git writer that records what it was told
#[derive(Default)]
pub struct FakeGit {
    scopes: Mutex<HashMap<Option<PathBuf>, (String, String)>>,
}

impl FakeGit {
    pub fn global_email(&self) -> Option<String> {
        self.scopes.lock().get(&None).map(|(_, email)| email.clone())
    }

    pub fn local_email(&self, repo: &Path) -> Option<String> {
        self.scopes
            .lock()
            .get(&Some(repo.to_path_buf()))
            .map(|(_, email)| email.clone())
    }

    fn key(scope: &GitScope) -> Option<PathBuf> {
        match scope {
            GitScope::Global => None,
            GitScope::Repository { path } => Some(path.clone()),
        }
    }
}

#[async_trait]
impl GitConfigurator for FakeGit {
    async fn apply_global(&self, identity: &Identity) -> Result<(), GitError> {
        self.scopes
            .lock()
            .insert(None, (identity.name.clone(), identity.email.clone()));
        Ok(())
    }

    async fn apply_local(&self, identity: &Identity, repo: &Path) -> Result<(), GitError> {
        self.scopes.lock().insert(
            Some(repo.to_path_buf()),
            (identity.name.clone(), identity.email.clone()),
        );
        Ok(())
    }

    async fn current_config(&self, scope: &GitScope) -> Result<GitConfigSnapshot, GitError> {
        let entry = self.scopes.lock().get(&Self::key(scope)).cloned();
        Ok(GitConfigSnapshot {
            name: entry.as_ref().map(|(name, _)| name.clone()),
            email: entry.map(|(_, email)| email),
            signing_key: None,
            ssh_command: None,
            scope: scope.clone(),
        })
    }
}

/// Platform API keyed by token value
#[derive(Default)]
pub struct FakePlatform {
    pub accounts: HashMap<String, String>,
    pub uploads: Mutex<Vec<(String, String)>>,
}

impl FakePlatform {
    pub fn with_account(mut self, token: &str, account: &str) -> Self {
        self.accounts.insert(token.to_string(), account.to_string());
        self
    }
}

#[async_trait]
impl PlatformApi for FakePlatform {
    async fn whoami(&self, token: &str) -> Result<String, PlatformError> {
        self.accounts
            .get(token)
            .cloned()
            .ok_or_else(|| PlatformError::Unauthorized("bad credentials".to_string()))
    }

    async fn upload_public_key(
        &self,
        token: &str,
        title: &str,
        public_key: &str,
    ) -> Result<(), PlatformError> {
        self.whoami(token).await?;
        self.uploads
            .lock()
            .push((title.to_string(), public_key.to_string()));
        Ok(())
    }

    async fn list_repos(&self, token: &str) -> Result<Vec<String>, PlatformError> {
        let account = self.whoami(token).await?;
        Ok(vec![format!("{}/dotfiles", account)])
    }
}

pub fn fixture_dir() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures/keys")
}

pub fn chmod(path: &Path, mode: u32) {
    fs::set_permissions(path, fs::Permissions::from_mode(mode)).unwrap();
}

pub fn mode_of(path: &Path) -> u32 {
    fs::metadata(path).unwrap().permissions().mode() & 0o777
}

/// Copy a fixture pair into `dir` with owner-only modes
pub fn install_fixture(name: &str, dir: &Path) -> PathBuf {
    let private = dir.join(name);
    fs::copy(fixture_dir().join(name), &private).unwrap();
    fs::copy(
        fixture_dir().join(format!("{}.pub", name)),
        dir.join(format!("{}.pub", name)),
    )
    .unwrap();
    chmod(&private, 0o600);
    private
}

pub struct Harness {
    pub temp: TempDir,
    pub ssh_dir: PathBuf,
    pub secrets_dir: PathBuf,
    pub store: Arc<MemoryConfigStore>,
    pub agent: Arc<FakeAgent>,
    pub git: Arc<FakeGit>,
    pub switcher: IdentitySwitcher,
}

impl Harness {
    pub fn work_key(&self) -> PathBuf {
        self.ssh_dir.join("id_ed25519_work")
    }

    pub fn personal_key(&self) -> PathBuf {
        self.ssh_dir.join("id_ed25519_personal")
    }

    pub fn ssh_config_path(&self) -> PathBuf {
        self.ssh_dir.join("config")
    }

    pub fn ssh_config(&self) -> String {
        fs::read_to_string(self.ssh_config_path()).unwrap_or_default()
    }

    pub fn managed_identity_file(&self) -> Option<PathBuf> {
        self.switcher
            .ssh_config()
            .managed_identity_file("github.com")
            .unwrap()
    }

    pub fn config(&self) -> ConfigFile {
        self.store.snapshot()
    }
}

/// Two identities (`work`, `personal`) with fixture keys and a hand-written SSH config
pub fn harness() -> Harness {
    harness_with(|_| {})
}

pub fn harness_with(customize: impl FnOnce(&mut ConfigFile)) -> Harness {
    let temp = tempfile::tempdir().unwrap();
    let ssh_dir = temp.path().join("ssh");
    let secrets_dir = temp.path().join("secrets");
    fs::create_dir(&ssh_dir).unwrap();
    chmod(&ssh_dir, 0o700);

    let work_key = install_fixture("id_ed25519_work", &ssh_dir);
    let personal_key = install_fixture("id_ed25519_personal", &ssh_dir);
    fs::write(ssh_dir.join("config"), FOREIGN_CONFIG).unwrap();
    chmod(&ssh_dir.join("config"), 0o600);

    let mut config = ConfigFile::default();
    config
        .add_identity(
            Identity::new("work", "W Co", "w@co.com")
                .with_key(&work_key)
                .with_username("octo-work"),
        )
        .unwrap();
    config
        .add_identity(
            Identity::new("personal", "P Me", "p@me.com")
                .with_key(&personal_key)
                .with_username("p-me"),
        )
        .unwrap();
    customize(&mut config);

    let store = Arc::new(MemoryConfigStore::new(config));
    let agent = Arc::new(FakeAgent::default());
    let git = Arc::new(FakeGit::default());
    let options = SwitcherOptions::for_dirs(
        ssh_dir.clone(),
        secrets_dir.clone(),
        &EngineSettings::default(),
    );
    let vault = TokenVault::with_machine(
        secrets_dir.clone(),
        MachineContext {
            hostname: "test-host".to_string(),
            home_leaf: "tester".to_string(),
        },
    );
    let switcher =
        IdentitySwitcher::new(store.clone(), agent.clone(), git.clone(), options).with_vault(vault);

    Harness {
        temp,
        ssh_dir,
        secrets_dir,
        store,
        agent,
        git,
        switcher,
    }
}
