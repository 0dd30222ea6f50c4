//! External Tool Runner
//!
//! Every process this crate spawns (`ssh-keygen`, `ssh-add`, `ssh-agent`, `ssh`,
//! `git`) goes through [`ToolRunner`], which enforces a bounded timeout and
//! captures combined output for error messages.
//!
//! A timed-out child is killed (`kill_on_drop`) so a hung tool never leaves a
//! half-finished operation running behind the caller's back.

use std::ffi::OsStr;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tracing::debug;

/// Default timeout for a single external tool invocation
pub const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(30);

/// Variables removed from child processes when an identity asks for a scrubbed environment
pub const SCRUBBED_ENV_VARS: &[&str] = &[
    "GH_TOKEN",
    "GITHUB_TOKEN",
    "GIT_SSH_COMMAND",
    "GIT_AUTHOR_NAME",
    "GIT_AUTHOR_EMAIL",
    "GIT_COMMITTER_NAME",
    "GIT_COMMITTER_EMAIL",
];

/// External tool errors
#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("{tool} is not installed or not on PATH")]
    NotFound { tool: String },

    #[error("{tool} timed out after {secs}s")]
    Timeout { tool: String, secs: u64 },

    #[error("{tool} exited with {}: {output}", exit_label(.code))]
    Failed {
        tool: String,
        code: Option<i32>,
        output: String,
    },

    #[error("Failed to run {tool}: {source}")]
    Io {
        tool: String,
        #[source]
        source: std::io::Error,
    },
}

impl ToolError {
    /// Name of the tool the error came from
    pub fn tool(&self) -> &str {
        match self {
            ToolError::NotFound { tool }
            | ToolError::Timeout { tool, .. }
            | ToolError::Failed { tool, .. }
            | ToolError::Io { tool, .. } => tool,
        }
    }
}

/// Captured result of a finished tool
#[derive(Debug, Clone)]
pub struct ToolOutput {
    /// Exit code (`None` when killed by a signal)
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ToolOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// stdout and stderr joined, trimmed; used for error reporting and greeting checks
    pub fn combined(&self) -> String {
        let stdout = self.stdout.trim();
        let stderr = self.stderr.trim();
        match (stdout.is_empty(), stderr.is_empty()) {
            (true, _) => stderr.to_string(),
            (_, true) => stdout.to_string(),
            _ => format!("{}\n{}", stdout, stderr),
        }
    }
}

/// Runs external tools with a timeout and a controlled environment
#[derive(Debug, Clone)]
pub struct ToolRunner {
    timeout: Duration,
    envs: Vec<(String, String)>,
    removed_envs: Vec<String>,
}

impl Default for ToolRunner {
    fn default() -> Self {
        Self::new(DEFAULT_TOOL_TIMEOUT)
    }
}

impl ToolRunner {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            envs: Vec::new(),
            removed_envs: Vec::new(),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Set an environment variable on every spawned child
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    /// Remove the credential-carrying variables in [`SCRUBBED_ENV_VARS`] from children
    pub fn scrubbed(mut self) -> Self {
        for var in SCRUBBED_ENV_VARS {
            if !self.removed_envs.iter().any(|v| v == var) {
                self.removed_envs.push((*var).to_string());
            }
        }
        self
    }

    /// Run a tool and return its output whatever the exit code
    pub async fn run<I, S>(&self, program: &str, args: I) -> Result<ToolOutput, ToolError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.run_in(program, args, None).await
    }

    /// Run a tool in a specific working directory
    pub async fn run_in<I, S>(
        &self,
        program: &str,
        args: I,
        cwd: Option<&Path>,
    ) -> Result<ToolOutput, ToolError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(dir) = cwd {
            cmd.current_dir(dir);
        }
        for var in &self.removed_envs {
            cmd.env_remove(var);
        }
        for (key, value) in &self.envs {
            cmd.env(key, value);
        }

        debug!(tool = program, "Running external tool");

        let child = cmd.spawn().map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => ToolError::NotFound {
                tool: program.to_string(),
            },
            _ => ToolError::Io {
                tool: program.to_string(),
                source: e,
            },
        })?;

        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(ToolError::Io {
                    tool: program.to_string(),
                    source: e,
                })
            }
            Err(_) => {
                return Err(ToolError::Timeout {
                    tool: program.to_string(),
                    secs: self.timeout.as_secs(),
                })
            }
        };

        Ok(ToolOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    /// Run a tool and fail with [`ToolError::Failed`] on a non-zero exit
    pub async fn run_checked<I, S>(&self, program: &str, args: I) -> Result<ToolOutput, ToolError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let output = self.run(program, args).await?;
        if output.success() {
            Ok(output)
        } else {
            Err(failed(program, &output))
        }
    }
}

fn exit_label(code: &Option<i32>) -> String {
    match code {
        Some(c) => format!("status {}", c),
        None => "signal".to_string(),
    }
}

/// Build a [`ToolError::Failed`] from a finished tool's output
pub fn failed(program: &str, output: &ToolOutput) -> ToolError {
    ToolError::Failed {
        tool: program.to_string(),
        code: output.code,
        output: output.combined(),
    }
}

/// Check whether a tool can be found on PATH
pub fn tool_available(program: &str) -> bool {
    std::env::var_os("PATH")
        .map(|paths| std::env::split_paths(&paths).any(|dir| dir.join(program).is_file()))
        .unwrap_or(false)
}
