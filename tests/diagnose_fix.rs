#![cfg(unix)]

mod common;

use common::*;
use ghswitch::ssh::AgentControl;
use ghswitch::switch::{IssueKind, SwitchStep};
use ghswitch::EngineError;

#[tokio::test]
async fn test_clean_after_switch() {
    let h = harness();
    h.switcher.switch("personal").await.unwrap();

    let report = h.switcher.diagnose().await.unwrap();
    assert_eq!(report.target.as_deref(), Some("personal"));
    assert!(!report.pending);
    assert!(report.is_clean(), "unexpected issues: {:?}", report.issues);
}

#[tokio::test]
async fn test_nothing_to_diagnose_without_identity() {
    let h = harness();
    let report = h.switcher.diagnose().await.unwrap();
    assert_eq!(report.target, None);
    assert!(report.is_clean());
}

#[tokio::test]
async fn test_agent_failure_reports_single_issue() {
    let h = harness();
    h.switcher.switch("work").await.unwrap();
    let config_after_success = h.ssh_config();

    h.agent.set_fail_load(true);
    let err = h.switcher.switch("work").await.unwrap_err();
    assert_eq!(err.failed_step, SwitchStep::ReloadAgent);
    assert_eq!(
        err.completed,
        vec![
            SwitchStep::LoadIdentity,
            SwitchStep::ValidateKey,
            SwitchStep::InstallSshConfig
        ]
    );
    assert!(matches!(err.source, EngineError::ExternalToolFailed { .. }));

    // SSH config is exactly what a full success writes
    assert_eq!(h.ssh_config(), config_after_success);

    let report = h.switcher.diagnose().await.unwrap();
    assert_eq!(report.target.as_deref(), Some("work"));
    assert!(report.pending);
    assert_eq!(report.issues.len(), 1, "issues: {:?}", report.issues);
    assert!(matches!(
        report.issues[0].kind,
        IssueKind::AgentMismatch { ref expected, ref actual }
            if expected == &vec![WORK_FP.to_string()] && actual.is_empty()
    ));
    assert!(report.issues[0].auto_fixable);
}

#[tokio::test]
async fn test_interrupted_switch_is_finished_by_auto_fix() {
    let h = harness();
    h.switcher.switch("work").await.unwrap();

    h.agent.set_fail_load(true);
    let err = h.switcher.switch("personal").await.unwrap_err();
    assert_eq!(err.failed_step, SwitchStep::ReloadAgent);
    assert_eq!(h.managed_identity_file(), Some(h.personal_key()));

    let config = h.config();
    assert_eq!(config.current_identity.as_deref(), Some("work"));
    assert_eq!(config.pending_switch.as_deref(), Some("personal"));

    // Git never ran, so it still carries the work identity
    let report = h.switcher.diagnose().await.unwrap();
    assert_eq!(report.target.as_deref(), Some("personal"));
    let kinds: Vec<_> = report.issues.iter().map(|i| &i.kind).collect();
    assert_eq!(kinds.len(), 2, "issues: {:?}", kinds);
    assert!(matches!(kinds[0], IssueKind::AgentMismatch { .. }));
    assert!(matches!(kinds[1], IssueKind::GitIdentityMismatch { .. }));

    h.agent.set_fail_load(false);
    let fixed = h.switcher.auto_fix(&report.issues).await.unwrap();
    assert!(fixed.outcomes.iter().all(|o| o.error.is_none()));
    assert!(fixed.remaining.is_clean(), "left: {:?}", fixed.remaining.issues);
    assert_eq!(fixed.promoted.as_deref(), Some("personal"));

    assert_eq!(h.agent.held(), vec![PERSONAL_FP]);
    assert_eq!(h.git.global_email().as_deref(), Some("p@me.com"));
    let config = h.config();
    assert_eq!(config.current_identity.as_deref(), Some("personal"));
    assert_eq!(config.pending_switch, None);
}

#[tokio::test]
async fn test_permission_drift_fixed_by_chmod() {
    let h = harness();
    h.switcher.switch("work").await.unwrap();
    chmod(&h.work_key(), 0o640);

    let report = h.switcher.diagnose().await.unwrap();
    assert_eq!(report.issues.len(), 1);
    assert!(matches!(
        report.issues[0].kind,
        IssueKind::InsecurePermissions { mode: 0o640, expected: 0o600, .. }
    ));

    let fixed = h.switcher.auto_fix(&report.issues).await.unwrap();
    assert!(fixed.remaining.is_clean());
    assert_eq!(fixed.promoted, None);
    assert_eq!(mode_of(&h.work_key()), 0o600);
}

#[tokio::test]
async fn test_world_readable_ssh_config_is_reported() {
    let h = harness();
    h.switcher.switch("work").await.unwrap();
    chmod(&h.ssh_config_path(), 0o644);

    let report = h.switcher.diagnose().await.unwrap();
    assert_eq!(report.issues.len(), 1, "issues: {:?}", report.issues);
    assert!(matches!(
        report.issues[0].kind,
        IssueKind::InsecurePermissions { ref path, mode: 0o644, expected: 0o600 }
            if path == &h.ssh_config_path()
    ));
    assert!(report.issues[0].auto_fixable);

    let fixed = h.switcher.auto_fix(&report.issues).await.unwrap();
    assert!(fixed.remaining.is_clean(), "left: {:?}", fixed.remaining.issues);
    assert_eq!(mode_of(&h.ssh_config_path()), 0o600);
}

#[tokio::test]
async fn test_repeat_switch_tightens_ssh_config() {
    let h = harness();
    h.switcher.switch("work").await.unwrap();
    let before = h.ssh_config();
    chmod(&h.ssh_config_path(), 0o644);

    h.switcher.switch("work").await.unwrap();
    assert_eq!(h.ssh_config(), before);
    assert_eq!(mode_of(&h.ssh_config_path()), 0o600);
}

#[tokio::test]
async fn test_ssh_config_drift_is_repaired() {
    let h = harness();
    h.switcher.switch("work").await.unwrap();
    std::fs::write(
        h.ssh_config_path(),
        "Host github.com\n    IdentityFile ~/.ssh/id_rsa\n",
    )
    .unwrap();

    let report = h.switcher.diagnose().await.unwrap();
    assert_eq!(report.issues.len(), 1);
    assert!(matches!(
        report.issues[0].kind,
        IssueKind::SshConfigMismatch { .. }
    ));

    let fixed = h.switcher.auto_fix(&report.issues).await.unwrap();
    assert!(fixed.remaining.is_clean());
    assert_eq!(h.managed_identity_file(), Some(h.work_key()));
}

#[tokio::test]
async fn test_extra_agent_keys_are_flushed() {
    let h = harness();
    h.switcher.switch("work").await.unwrap();
    h.agent.load_only(&h.personal_key()).await.unwrap();

    let report = h.switcher.diagnose().await.unwrap();
    assert!(matches!(
        report.issues[0].kind,
        IssueKind::AgentMismatch { .. }
    ));

    h.switcher.auto_fix(&report.issues).await.unwrap();
    assert_eq!(h.agent.held(), vec![WORK_FP]);
}

#[tokio::test]
async fn test_unreachable_agent_is_not_auto_fixable() {
    let h = harness();
    h.switcher.switch("work").await.unwrap();
    h.agent.set_unreachable(true);

    let report = h.switcher.diagnose().await.unwrap();
    assert_eq!(report.issues.len(), 1);
    assert!(matches!(
        report.issues[0].kind,
        IssueKind::AgentUnreachable { .. }
    ));
    assert!(!report.issues[0].auto_fixable);
}

#[tokio::test]
async fn test_unreachable_agent_fails_switch_at_agent_step() {
    let h = harness();
    h.agent.set_unreachable(true);

    let err = h.switcher.switch("work").await.unwrap_err();
    assert_eq!(err.failed_step, SwitchStep::ReloadAgent);
    assert!(matches!(err.source, EngineError::AgentUnreachable(_)));
    assert_eq!(h.managed_identity_file(), Some(h.work_key()));
}

#[tokio::test]
async fn test_pointer_to_removed_identity() {
    let h = harness_with(|config| config.current_identity = Some("ghost".to_string()));

    let report = h.switcher.diagnose().await.unwrap();
    assert_eq!(report.issues.len(), 1);
    assert!(matches!(
        report.issues[0].kind,
        IssueKind::UnknownIdentity { ref alias } if alias == "ghost"
    ));
}
