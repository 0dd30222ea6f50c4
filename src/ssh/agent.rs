//! SSH Agent Controller
//!
//! Drives the system SSH agent so that it holds exactly the keys the active
//! identity is allowed to offer.
//!
//! # Architecture
//!
//! ```text
//!   ┌──────────────────────────────────────────────────────────┐
//!   │  AgentControl (trait, faked in tests)                    │
//!   │  └── SshAgentController                                  │
//!   │       ├── reset()             ssh-add -D                 │
//!   │       ├── load_only(key)      ssh-add <key>              │
//!   │       ├── list_fingerprints() AgentClient (unix)         │
//!   │       │                       ssh-add -l -E sha256       │
//!   │       └── ensure_agent()      ssh-agent -s when missing  │
//!   └──────────────────────────────────────────────────────────┘
//! ```
//!
//! # Limitation
//!
//! An agent started here exports `SSH_AUTH_SOCK`/`SSH_AGENT_PID` into this
//! process only. The parent shell must `eval "$(ssh-agent -s)"` itself to see it.

use async_trait::async_trait;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::process::{failed, ToolError, ToolOutput, ToolRunner};

/// Agent controller errors
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("SSH agent not reachable: {0}")]
    Unreachable(String),

    #[error("Failed to load key {path}: {message}")]
    LoadFailed { path: PathBuf, message: String },

    #[error("Agent holds {actual:?}, expected {expected:?}")]
    Unexpected {
        expected: Vec<String>,
        actual: Vec<String>,
    },

    #[error(transparent)]
    Tool(#[from] ToolError),
}

/// The narrow agent surface the switch orchestrator depends on
#[async_trait]
pub trait AgentControl: Send + Sync {
    /// Discard every identity the agent holds; an already-empty agent is fine
    async fn reset(&self) -> Result<(), AgentError>;

    /// Add exactly the key at `key_path`
    async fn load_only(&self, key_path: &Path) -> Result<(), AgentError>;

    /// `SHA256:` fingerprints of every held key, in agent order
    async fn list_fingerprints(&self) -> Result<Vec<String>, AgentError>;
}

/// Check if an SSH agent socket is configured for this process
///
/// A quick pre-check; the agent may still refuse connections.
pub fn is_agent_available() -> bool {
    #[cfg(unix)]
    {
        std::env::var_os("SSH_AUTH_SOCK")
            .map(|sock| Path::new(&sock).exists())
            .unwrap_or(false)
    }

    #[cfg(windows)]
    {
        // The OpenSSH service pipe is always present once installed
        true
    }

    #[cfg(not(any(unix, windows)))]
    {
        false
    }
}

/// Socket and PID printed by `ssh-agent -s`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentEnv {
    pub auth_sock: String,
    pub pid: Option<u32>,
}

/// Parse Bourne-shell output of `ssh-agent -s`
pub fn parse_agent_env(output: &str) -> Option<AgentEnv> {
    let mut auth_sock = None;
    let mut pid = None;
    for statement in output.split([';', '\n']) {
        let statement = statement.trim();
        if let Some(value) = statement.strip_prefix("SSH_AUTH_SOCK=") {
            auth_sock = Some(value.to_string());
        } else if let Some(value) = statement.strip_prefix("SSH_AGENT_PID=") {
            pid = value.parse().ok();
        }
    }
    auth_sock.map(|auth_sock| AgentEnv { auth_sock, pid })
}

fn is_unreachable(output: &ToolOutput) -> bool {
    let text = output.combined();
    output.code == Some(2)
        || text.contains("Could not open a connection")
        || text.contains("Error connecting to agent")
}

fn has_no_identities(output: &ToolOutput) -> bool {
    output.combined().to_lowercase().contains("no identities")
}

/// Interpret `ssh-add -D`
fn classify_reset(output: &ToolOutput) -> Result<(), AgentError> {
    if output.success() {
        return Ok(());
    }
    if is_unreachable(output) {
        return Err(AgentError::Unreachable(output.combined()));
    }
    if output.code == Some(1) && has_no_identities(output) {
        return Ok(());
    }
    Err(failed("ssh-add", output).into())
}

/// Interpret `ssh-add -l -E sha256`
fn parse_listing(output: &ToolOutput) -> Result<Vec<String>, AgentError> {
    if output.success() {
        return Ok(output
            .stdout
            .lines()
            .filter_map(|line| line.split_whitespace().nth(1))
            .filter(|fp| fp.starts_with("SHA256:"))
            .map(|fp| fp.to_string())
            .collect());
    }
    if is_unreachable(output) {
        return Err(AgentError::Unreachable(output.combined()));
    }
    if output.code == Some(1) && has_no_identities(output) {
        return Ok(Vec::new());
    }
    Err(failed("ssh-add", output).into())
}

/// [`AgentControl`] backed by `ssh-add`/`ssh-agent` and russh's agent client
pub struct SshAgentController {
    runner: ToolRunner,
    socket: Option<PathBuf>,
    start_lock: tokio::sync::Mutex<()>,
}

impl SshAgentController {
    /// Controller for the agent named by `SSH_AUTH_SOCK`, starting one when absent
    pub fn new(runner: ToolRunner) -> Self {
        Self {
            runner,
            socket: None,
            start_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Controller pinned to one agent socket
    pub fn with_socket(runner: ToolRunner, socket: PathBuf) -> Self {
        let runner = runner.with_env("SSH_AUTH_SOCK", socket.to_string_lossy());
        Self {
            runner,
            socket: Some(socket),
            start_lock: tokio::sync::Mutex::new(()),
        }
    }

    fn reachable(&self) -> bool {
        match &self.socket {
            Some(socket) => socket.exists(),
            None => is_agent_available(),
        }
    }

    /// Start an agent when none is reachable
    ///
    /// The new agent's variables are exported into this process only.
    pub async fn ensure_agent(&self) -> Result<(), AgentError> {
        let _guard = self.start_lock.lock().await;
        if self.reachable() {
            return Ok(());
        }
        if let Some(socket) = &self.socket {
            return Err(AgentError::Unreachable(format!(
                "agent socket {} does not exist",
                socket.display()
            )));
        }

        info!("No SSH agent reachable, starting one");
        let output = self.runner.run_checked("ssh-agent", ["-s"]).await?;
        let env = parse_agent_env(&output.stdout).ok_or_else(|| {
            AgentError::Unreachable(format!(
                "could not parse ssh-agent output: {}",
                output.combined()
            ))
        })?;

        std::env::set_var("SSH_AUTH_SOCK", &env.auth_sock);
        if let Some(pid) = env.pid {
            std::env::set_var("SSH_AGENT_PID", pid.to_string());
        }
        warn!(
            sock = %env.auth_sock,
            pid = ?env.pid,
            "Started ssh-agent for this process; run `eval \"$(ssh-agent -s)\"` in your shell to share it"
        );
        Ok(())
    }

    #[cfg(unix)]
    async fn list_via_client(&self) -> Result<Vec<String>, AgentError> {
        use russh::keys::agent::client::AgentClient;

        let mut client = match &self.socket {
            Some(socket) => AgentClient::connect_uds(socket).await,
            None => AgentClient::connect_env().await,
        }
        .map_err(|e| AgentError::Unreachable(e.to_string()))?;

        let keys = client
            .request_identities()
            .await
            .map_err(|e| AgentError::Unreachable(format!("Failed to list agent keys: {}", e)))?;
        Ok(keys.iter().map(super::keys::fingerprint).collect())
    }
}

#[async_trait]
impl AgentControl for SshAgentController {
    async fn reset(&self) -> Result<(), AgentError> {
        self.ensure_agent().await?;
        let output = self.runner.run("ssh-add", ["-D"]).await?;
        classify_reset(&output)?;
        info!("SSH agent identities cleared");
        Ok(())
    }

    async fn load_only(&self, key_path: &Path) -> Result<(), AgentError> {
        self.ensure_agent().await?;
        let output = self
            .runner
            .run("ssh-add", [key_path.as_os_str()])
            .await?;
        if output.success() {
            info!(path = %key_path.display(), "Key loaded into SSH agent");
            return Ok(());
        }
        if is_unreachable(&output) {
            return Err(AgentError::Unreachable(output.combined()));
        }
        Err(AgentError::LoadFailed {
            path: key_path.to_path_buf(),
            message: output.combined(),
        })
    }

    async fn list_fingerprints(&self) -> Result<Vec<String>, AgentError> {
        if !self.reachable() {
            return Err(AgentError::Unreachable(
                "SSH_AUTH_SOCK is not set or points nowhere".to_string(),
            ));
        }

        #[cfg(unix)]
        {
            let fingerprints = self.list_via_client().await?;
            debug!(count = fingerprints.len(), "Listed agent identities");
            Ok(fingerprints)
        }

        #[cfg(not(unix))]
        {
            let output = self
                .runner
                .run(
                    "ssh-add",
                    [OsStr::new("-l"), OsStr::new("-E"), OsStr::new("sha256")],
                )
                .await?;
            let fingerprints = parse_listing(&output)?;
            debug!(count = fingerprints.len(), "Listed agent identities");
            Ok(fingerprints)
        }
    }
}

/// Listing through `ssh-add`, independent of the in-process client
pub async fn list_with_ssh_add(runner: &ToolRunner) -> Result<Vec<String>, AgentError> {
    let output = runner
        .run(
            "ssh-add",
            [OsStr::new("-l"), OsStr::new("-E"), OsStr::new("sha256")],
        )
        .await?;
    parse_listing(&output)
}
