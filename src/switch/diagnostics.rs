//! Diagnostics and Auto-Fix
//!
//! Re-derives what the machine should look like for the target identity
//! (the pending switch if one was interrupted, else the current identity) and
//! reports one [`Issue`] per divergence. [`IdentitySwitcher::auto_fix`] replays only
//! the narrow step that repairs each fixable issue.

use serde::Serialize;
use std::path::PathBuf;
use tracing::{info, warn};

use super::{IdentitySwitcher, PRIVATE_KEY_MODE, SSH_CONFIG_MODE, SSH_DIR_MODE};
use crate::config::ssh_config::expand_tilde;
use crate::config::types::{AgentMode, GitScope, Identity};
use crate::error::EngineError;
use crate::ssh::agent::AgentError;
use crate::ssh::keys::{self, KeyPairRecord};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

/// What diverged
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IssueKind {
    /// The pointer names an identity that no longer exists
    UnknownIdentity { alias: String },
    KeyUnavailable { path: PathBuf, reason: String },
    InsecurePermissions {
        path: PathBuf,
        mode: u32,
        expected: u32,
    },
    /// Managed `IdentityFile` differs from the identity's key
    SshConfigMismatch {
        expected: Option<PathBuf>,
        actual: Option<PathBuf>,
    },
    SshConfigUnreadable { reason: String },
    AgentUnreachable { reason: String },
    AgentMismatch {
        expected: Vec<String>,
        actual: Vec<String>,
    },
    GitIdentityMismatch {
        scope: GitScope,
        expected_email: String,
        actual_email: Option<String>,
    },
    GitUnreadable { reason: String },
}

impl IssueKind {
    /// Order fixes are applied in: files before processes
    fn fix_rank(&self) -> u8 {
        match self {
            IssueKind::InsecurePermissions { .. } => 0,
            IssueKind::SshConfigMismatch { .. } => 1,
            IssueKind::AgentMismatch { .. } => 2,
            IssueKind::GitIdentityMismatch { .. } => 3,
            _ => 4,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Issue {
    pub kind: IssueKind,
    pub severity: Severity,
    pub auto_fixable: bool,
    pub message: String,
}

impl Issue {
    fn new(kind: IssueKind, severity: Severity, auto_fixable: bool, message: String) -> Self {
        Self {
            kind,
            severity,
            auto_fixable,
            message,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DiagnosticReport {
    /// Identity the machine state was compared against
    pub target: Option<String>,
    /// `target` comes from an unfinished switch
    pub pending: bool,
    pub issues: Vec<Issue>,
}

impl DiagnosticReport {
    pub fn is_clean(&self) -> bool {
        self.issues.is_empty()
    }

    pub fn fixable(&self) -> impl Iterator<Item = &Issue> {
        self.issues.iter().filter(|i| i.auto_fixable)
    }
}

/// Result of one attempted fix
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FixOutcome {
    pub issue: IssueKind,
    /// `None` on success
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FixReport {
    pub outcomes: Vec<FixOutcome>,
    /// Diagnosis after the fixes
    pub remaining: DiagnosticReport,
    /// A pending switch became the current identity
    pub promoted: Option<String>,
}

impl IdentitySwitcher {
    /// Compare machine state with the target identity
    pub async fn diagnose(&self) -> Result<DiagnosticReport, EngineError> {
        let config = self.store.load().await?;
        let pending = config.pending_switch.is_some();
        let Some(target) = config
            .pending_switch
            .clone()
            .or_else(|| config.current_identity.clone())
        else {
            return Ok(DiagnosticReport::default());
        };

        let mut report = DiagnosticReport {
            target: Some(target.clone()),
            pending,
            issues: Vec::new(),
        };

        let Some(identity) = config.get_identity(&target).cloned() else {
            report.issues.push(Issue::new(
                IssueKind::UnknownIdentity {
                    alias: target.clone(),
                },
                Severity::Error,
                false,
                format!("Active identity '{}' is not configured", target),
            ));
            return Ok(report);
        };

        let platform = &config.settings.platform;
        let record = self.diagnose_key(&identity, &mut report.issues);
        let key_usable = identity.key_path().is_none() || record.is_some();

        // SSH config
        let expected_file = identity
            .key_path()
            .map(|p| expand_tilde(&p.to_string_lossy()));
        let config_path = self.ssh_config.path();
        if let Some(mode) = keys::file_mode(config_path).filter(|m| !keys::is_owner_only(*m)) {
            report.issues.push(Issue::new(
                IssueKind::InsecurePermissions {
                    path: config_path.to_path_buf(),
                    mode,
                    expected: SSH_CONFIG_MODE,
                },
                Severity::Error,
                true,
                format!("SSH config {} has mode {:o}", config_path.display(), mode),
            ));
        }
        match self.ssh_config.managed_identity_file(&platform.ssh_host) {
            Ok(actual) if actual != expected_file => report.issues.push(Issue::new(
                IssueKind::SshConfigMismatch {
                    expected: expected_file.clone(),
                    actual: actual.clone(),
                },
                Severity::Error,
                key_usable,
                format!(
                    "SSH config for {} uses {}, expected {}",
                    platform.ssh_host,
                    display_path(&actual),
                    display_path(&expected_file)
                ),
            )),
            Ok(_) => {}
            Err(e) => report.issues.push(Issue::new(
                IssueKind::SshConfigUnreadable {
                    reason: e.to_string(),
                },
                Severity::Error,
                false,
                format!("SSH config cannot be parsed: {}", e),
            )),
        }

        // Agent
        if key_usable {
            self.diagnose_agent(&identity, record.as_ref(), &mut report.issues)
                .await;
        }

        // Git
        self.diagnose_git(&identity, &mut report.issues).await;

        info!(
            target = %target,
            pending,
            issues = report.issues.len(),
            "Diagnosis finished"
        );
        Ok(report)
    }

    fn diagnose_key(&self, identity: &Identity, issues: &mut Vec<Issue>) -> Option<KeyPairRecord> {
        let path = identity.key_path()?;
        match keys::validate_key(path) {
            Ok(record) => {
                if let Some(mode) = record.private_mode.filter(|m| !keys::is_owner_only(*m)) {
                    issues.push(Issue::new(
                        IssueKind::InsecurePermissions {
                            path: record.private_path.clone(),
                            mode,
                            expected: PRIVATE_KEY_MODE,
                        },
                        Severity::Error,
                        true,
                        format!(
                            "Private key {} has mode {:o}",
                            record.private_path.display(),
                            mode
                        ),
                    ));
                }
                if let Some(mode) = record.dir_mode.filter(|m| !keys::is_owner_only(*m)) {
                    if let Some(dir) = record.private_path.parent() {
                        issues.push(Issue::new(
                            IssueKind::InsecurePermissions {
                                path: dir.to_path_buf(),
                                mode,
                                expected: SSH_DIR_MODE,
                            },
                            Severity::Warning,
                            true,
                            format!("Key directory {} has mode {:o}", dir.display(), mode),
                        ));
                    }
                }
                Some(record)
            }
            Err(e) => {
                issues.push(Issue::new(
                    IssueKind::KeyUnavailable {
                        path: path.to_path_buf(),
                        reason: e.to_string(),
                    },
                    Severity::Error,
                    false,
                    format!("Key for '{}' is unusable: {}", identity.alias, e),
                ));
                None
            }
        }
    }

    async fn diagnose_agent(
        &self,
        identity: &Identity,
        record: Option<&KeyPairRecord>,
        issues: &mut Vec<Issue>,
    ) {
        let held = match self.agent.list_fingerprints().await {
            Ok(held) => held,
            Err(AgentError::Unreachable(reason)) => {
                issues.push(Issue::new(
                    IssueKind::AgentUnreachable {
                        reason: reason.clone(),
                    },
                    Severity::Warning,
                    false,
                    format!("SSH agent unreachable: {}", reason),
                ));
                return;
            }
            Err(e) => {
                issues.push(Issue::new(
                    IssueKind::AgentUnreachable {
                        reason: e.to_string(),
                    },
                    Severity::Warning,
                    false,
                    format!("SSH agent could not be queried: {}", e),
                ));
                return;
            }
        };

        let expected: Vec<String> = record.map(|r| r.fingerprint.clone()).into_iter().collect();
        let matches = match identity.isolation.ssh.agent {
            AgentMode::Exclusive => held == expected,
            AgentMode::Shared => expected.iter().all(|fp| held.contains(fp)),
        };
        if !matches {
            issues.push(Issue::new(
                IssueKind::AgentMismatch {
                    expected: expected.clone(),
                    actual: held.clone(),
                },
                Severity::Error,
                true,
                format!(
                    "SSH agent holds {} key(s), expected {}",
                    held.len(),
                    if expected.is_empty() {
                        "none".to_string()
                    } else {
                        expected.join(", ")
                    }
                ),
            ));
        }
    }

    async fn diagnose_git(&self, identity: &Identity, issues: &mut Vec<Issue>) {
        let scope = identity.isolation.git.scope.clone();
        match self.git.current_config(&scope).await {
            Ok(snapshot) => {
                let email_ok = snapshot.email.as_deref() == Some(identity.email.as_str());
                let name_ok = snapshot.name.as_deref() == Some(identity.name.as_str());
                if !(email_ok && name_ok) {
                    issues.push(Issue::new(
                        IssueKind::GitIdentityMismatch {
                            scope,
                            expected_email: identity.email.clone(),
                            actual_email: snapshot.email.clone(),
                        },
                        Severity::Error,
                        true,
                        format!(
                            "Git user is {} <{}>, expected {} <{}>",
                            snapshot.name.as_deref().unwrap_or("unset"),
                            snapshot.email.as_deref().unwrap_or("unset"),
                            identity.name,
                            identity.email
                        ),
                    ));
                }
            }
            Err(e) => issues.push(Issue::new(
                IssueKind::GitUnreadable {
                    reason: e.to_string(),
                },
                Severity::Warning,
                false,
                format!("Git config could not be read: {}", e),
            )),
        }
    }

    /// Apply the narrow fix for every fixable issue, then re-diagnose
    ///
    /// When the re-diagnosis is clean and a switch was pending, the pending
    /// identity becomes current.
    pub async fn auto_fix(&self, issues: &[Issue]) -> Result<FixReport, EngineError> {
        let config = self.store.load().await?;
        let target = config
            .pending_switch
            .clone()
            .or_else(|| config.current_identity.clone());
        let identity = target
            .as_deref()
            .and_then(|alias| config.get_identity(alias))
            .cloned();
        let platform = config.settings.platform.clone();

        let mut fixable: Vec<&Issue> = issues.iter().filter(|i| i.auto_fixable).collect();
        fixable.sort_by_key(|i| i.kind.fix_rank());

        let mut outcomes = Vec::new();
        for issue in fixable {
            let result = match (&issue.kind, &identity) {
                (IssueKind::InsecurePermissions { path, expected, .. }, _) => {
                    keys::set_mode(path, *expected).map_err(EngineError::from)
                }
                (IssueKind::SshConfigMismatch { .. }, Some(identity)) => {
                    match identity.key_path().map(Self::check_key).transpose() {
                        Ok(record) => self
                            .install_ssh_config(identity, record.as_ref(), &platform)
                            .await
                            .map(|_| ()),
                        Err(e) => Err(e),
                    }
                }
                (IssueKind::AgentMismatch { .. }, Some(identity)) => {
                    match identity.key_path().map(Self::check_key).transpose() {
                        Ok(record) => self.reload_agent(identity, record.as_ref()).await.map(|_| ()),
                        Err(e) => Err(e),
                    }
                }
                (IssueKind::GitIdentityMismatch { .. }, Some(identity)) => {
                    self.apply_git(identity).await
                }
                (_, None) => Err(EngineError::UnknownIdentity(
                    target.clone().unwrap_or_default(),
                )),
                _ => continue,
            };

            if let Err(e) = &result {
                warn!("Auto-fix failed for {:?}: {}", issue.kind, e);
            }
            outcomes.push(FixOutcome {
                issue: issue.kind.clone(),
                error: result.err().map(|e| e.to_string()),
            });
        }

        let remaining = self.diagnose().await?;
        let mut promoted = None;
        if remaining.is_clean() {
            let mut latest = self.store.load().await?;
            if let Some(alias) = latest.pending_switch.take() {
                latest.current_identity = Some(alias.clone());
                self.store.save(&latest).await?;
                info!(alias = %alias, "Pending switch completed by auto-fix");
                promoted = Some(alias);
            }
        }

        Ok(FixReport {
            outcomes,
            remaining,
            promoted,
        })
    }
}

fn display_path(path: &Option<PathBuf>) -> String {
    path.as_ref()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "no key".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn issue(kind: IssueKind, fixable: bool) -> Issue {
        Issue::new(kind, Severity::Error, fixable, String::new())
    }

    #[test]
    fn test_fix_order() {
        let mut kinds = vec![
            IssueKind::GitIdentityMismatch {
                scope: GitScope::Global,
                expected_email: "a@b.c".into(),
                actual_email: None,
            },
            IssueKind::AgentMismatch {
                expected: vec![],
                actual: vec!["SHA256:x".into()],
            },
            IssueKind::InsecurePermissions {
                path: PathBuf::from("/k"),
                mode: 0o644,
                expected: 0o600,
            },
        ];
        kinds.sort_by_key(|k| k.fix_rank());
        assert!(matches!(kinds[0], IssueKind::InsecurePermissions { .. }));
        assert!(matches!(kinds[2], IssueKind::GitIdentityMismatch { .. }));
    }

    #[test]
    fn test_report_helpers() {
        let report = DiagnosticReport {
            target: Some("work".into()),
            pending: false,
            issues: vec![
                issue(IssueKind::AgentUnreachable { reason: "x".into() }, false),
                issue(
                    IssueKind::AgentMismatch {
                        expected: vec![],
                        actual: vec![],
                    },
                    true,
                ),
            ],
        };
        assert!(!report.is_clean());
        assert_eq!(report.fixable().count(), 1);
        assert!(DiagnosticReport::default().is_clean());
    }

    #[test]
    fn test_issue_serializes_with_type_tag() {
        let json = serde_json::to_value(issue(
            IssueKind::SshConfigMismatch {
                expected: Some(PathBuf::from("/k")),
                actual: None,
            },
            true,
        ))
        .unwrap();
        assert_eq!(json["kind"]["type"], "ssh_config_mismatch");
        assert_eq!(json["auto_fixable"], true);
    }
}
