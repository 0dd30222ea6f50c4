//! Git Config Writer
//!
//! Applies an identity's `user.*`, signing and per-repository SSH settings
//! through `git config`, globally or in one repository's local config.

use async_trait::async_trait;
use serde::Serialize;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

use crate::config::types::{GitScope, Identity};
use crate::process::{failed, ToolError, ToolRunner};

/// `git config` exit code for "key not set" on `--unset`
const EXIT_UNSET_MISSING: i32 = 5;

/// Git writer errors
#[derive(Debug, Error)]
pub enum GitError {
    #[error("Not a git repository: {0}")]
    NotARepository(PathBuf),

    #[error(transparent)]
    Tool(#[from] ToolError),
}

/// Identity-relevant values read back from one config scope
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GitConfigSnapshot {
    pub name: Option<String>,
    pub email: Option<String>,
    pub signing_key: Option<String>,
    pub ssh_command: Option<String>,
    pub scope: GitScope,
}

/// Git configuration surface the switch orchestrator depends on
#[async_trait]
pub trait GitConfigurator: Send + Sync {
    async fn apply_global(&self, identity: &Identity) -> Result<(), GitError>;

    async fn apply_local(&self, identity: &Identity, repo: &Path) -> Result<(), GitError>;

    async fn current_config(&self, scope: &GitScope) -> Result<GitConfigSnapshot, GitError>;
}

/// `core.sshCommand` value pinning one key
pub fn ssh_command_for(key_path: &Path) -> String {
    let quoted = key_path.to_string_lossy().replace('\'', r"'\''");
    format!("ssh -i '{}' -o IdentitiesOnly=yes", quoted)
}

/// [`GitConfigurator`] backed by the `git` binary
#[derive(Debug, Clone, Default)]
pub struct GitCli {
    runner: ToolRunner,
}

impl GitCli {
    pub fn new(runner: ToolRunner) -> Self {
        Self { runner }
    }

    fn config_args(scope: &GitScope) -> Vec<OsString> {
        match scope {
            GitScope::Global => vec!["config".into(), "--global".into()],
            GitScope::Repository { path } => vec![
                "-C".into(),
                path.as_os_str().to_os_string(),
                "config".into(),
                "--local".into(),
            ],
        }
    }

    async fn set(&self, scope: &GitScope, key: &str, value: &str) -> Result<(), GitError> {
        let mut args = Self::config_args(scope);
        args.push(key.into());
        args.push(value.into());
        self.runner.run_checked("git", &args).await?;
        Ok(())
    }

    async fn unset(&self, scope: &GitScope, key: &str) -> Result<(), GitError> {
        let mut args = Self::config_args(scope);
        args.push("--unset".into());
        args.push(key.into());
        let output = self.runner.run("git", &args).await?;
        if output.success() || output.code == Some(EXIT_UNSET_MISSING) {
            Ok(())
        } else {
            Err(failed("git", &output).into())
        }
    }

    async fn get(&self, scope: &GitScope, key: &str) -> Result<Option<String>, GitError> {
        let mut args = Self::config_args(scope);
        args.push("--get".into());
        args.push(key.into());
        let output = self.runner.run("git", &args).await?;
        match output.code {
            Some(0) => Ok(Some(output.stdout.trim().to_string())),
            Some(1) => Ok(None),
            _ => Err(failed("git", &output).into()),
        }
    }

    async fn ensure_repository(&self, repo: &Path) -> Result<(), GitError> {
        if !repo.is_dir() {
            return Err(GitError::NotARepository(repo.to_path_buf()));
        }
        let output = self
            .runner
            .run_in("git", ["rev-parse", "--git-dir"], Some(repo))
            .await?;
        if output.success() {
            Ok(())
        } else {
            Err(GitError::NotARepository(repo.to_path_buf()))
        }
    }

    async fn apply(&self, identity: &Identity, scope: &GitScope) -> Result<(), GitError> {
        self.set(scope, "user.name", &identity.name).await?;
        self.set(scope, "user.email", &identity.email).await?;

        match &identity.signing {
            Some(signing) => {
                self.set(scope, "user.signingkey", &signing.key).await?;
                self.set(scope, "gpg.format", signing.format.as_git_value())
                    .await?;
                self.set(scope, "commit.gpgsign", "true").await?;
                self.set(scope, "tag.gpgsign", "true").await?;
            }
            None => {
                self.set(scope, "commit.gpgsign", "false").await?;
                self.set(scope, "tag.gpgsign", "false").await?;
                self.unset(scope, "user.signingkey").await?;
                self.unset(scope, "gpg.format").await?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl GitConfigurator for GitCli {
    async fn apply_global(&self, identity: &Identity) -> Result<(), GitError> {
        self.apply(identity, &GitScope::Global).await?;
        info!(alias = %identity.alias, "Global git identity applied");
        Ok(())
    }

    async fn apply_local(&self, identity: &Identity, repo: &Path) -> Result<(), GitError> {
        self.ensure_repository(repo).await?;
        let scope = GitScope::Repository {
            path: repo.to_path_buf(),
        };
        self.apply(identity, &scope).await?;

        match identity.key_path() {
            Some(key) if identity.isolation.git.pin_ssh_command => {
                self.set(&scope, "core.sshCommand", &ssh_command_for(key))
                    .await?;
            }
            _ => self.unset(&scope, "core.sshCommand").await?,
        }

        info!(
            alias = %identity.alias,
            repo = %repo.display(),
            "Repository git identity applied"
        );
        Ok(())
    }

    async fn current_config(&self, scope: &GitScope) -> Result<GitConfigSnapshot, GitError> {
        let snapshot = GitConfigSnapshot {
            name: self.get(scope, "user.name").await?,
            email: self.get(scope, "user.email").await?,
            signing_key: self.get(scope, "user.signingkey").await?,
            ssh_command: self.get(scope, "core.sshCommand").await?,
            scope: scope.clone(),
        };
        debug!(email = ?snapshot.email, "Read git identity");
        Ok(snapshot)
    }
}
