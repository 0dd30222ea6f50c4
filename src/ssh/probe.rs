//! Connectivity probe
//!
//! `ssh -T git@<host>` with one pinned key. Git hosting endpoints refuse a
//! shell, so the exit code is non-zero even on success; the greeting in the
//! output decides.

use regex::Regex;
use std::ffi::OsString;
use std::path::Path;
use std::sync::LazyLock;
use tracing::info;

use crate::platform::PlatformHost;
use crate::process::{ToolError, ToolOutput, ToolRunner};

static ACCOUNT_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:Hi |Welcome to GitLab, @)([^\s!]+)!")
        .expect("Failed to compile ACCOUNT_PATTERN")
});

/// Outcome of a connectivity probe
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeResult {
    pub authenticated: bool,
    /// Account name from the greeting
    pub account: Option<String>,
    pub exit_code: Option<i32>,
    pub output: String,
}

/// Decide whether a finished `ssh -T` authenticated
pub fn interpret(output: &ToolOutput, platform: &PlatformHost) -> ProbeResult {
    let text = output.combined();
    let greeted = text.contains(&platform.greeting);
    let authenticated = greeted && matches!(output.code, Some(0) | Some(1));
    let account = ACCOUNT_PATTERN
        .captures(&text)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string());

    ProbeResult {
        authenticated,
        account,
        exit_code: output.code,
        output: text,
    }
}

/// Authenticate against the platform with exactly `key_path`
pub async fn probe(
    runner: &ToolRunner,
    platform: &PlatformHost,
    key_path: &Path,
) -> Result<ProbeResult, ToolError> {
    let args: Vec<OsString> = vec![
        "-T".into(),
        "-o".into(),
        "BatchMode=yes".into(),
        "-o".into(),
        "IdentitiesOnly=yes".into(),
        "-o".into(),
        "ConnectTimeout=10".into(),
        "-i".into(),
        key_path.as_os_str().to_os_string(),
        format!("{}@{}", platform.ssh_user, platform.ssh_host).into(),
    ];
    let output = runner.run("ssh", &args).await?;
    let result = interpret(&output, platform);
    info!(
        host = %platform.ssh_host,
        authenticated = result.authenticated,
        account = ?result.account,
        "Connectivity probe finished"
    );
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn output(code: i32, stderr: &str) -> ToolOutput {
        ToolOutput {
            code: Some(code),
            stdout: String::new(),
            stderr: stderr.to_string(),
        }
    }

    #[test]
    fn test_github_greeting_with_exit_one() {
        let result = interpret(
            &output(
                1,
                "Hi octo-work! You've successfully authenticated, but GitHub does not provide shell access.",
            ),
            &PlatformHost::github(),
        );
        assert!(result.authenticated);
        assert_eq!(result.account.as_deref(), Some("octo-work"));
    }

    #[test]
    fn test_gitlab_greeting() {
        let result = interpret(
            &output(0, "Welcome to GitLab, @p-me!"),
            &PlatformHost::gitlab(),
        );
        assert!(result.authenticated);
        assert_eq!(result.account.as_deref(), Some("p-me"));
    }

    #[test]
    fn test_account_pattern() {
        let caps = ACCOUNT_PATTERN.captures("Hi octo_work-2! You've").unwrap();
        assert_eq!(&caps[1], "octo_work-2");
        assert!(ACCOUNT_PATTERN.captures("Permission denied").is_none());
    }

    #[test]
    fn test_denied() {
        let result = interpret(
            &output(255, "git@github.com: Permission denied (publickey)."),
            &PlatformHost::github(),
        );
        assert!(!result.authenticated);
        assert_eq!(result.account, None);
        assert_eq!(result.exit_code, Some(255));
    }
}
