//! Startup recovery: stale live agents are failed, and registry state is
//! rebuilt from labeled issues and open PRs on managed branches.

mod fixtures;

use fixtures::MockGitHub;
use squadron::{recover_on_startup, AgentRecord, AgentRegistry, AgentStatus, GitHubOps};
use std::sync::Arc;

#[tokio::test]
async fn crash_recovery_rebuilds_registry_from_github() {
    let dir = tempfile::tempdir().unwrap();
    let config = fixtures::test_config(dir.path());
    let registry = Arc::new(AgentRegistry::open_in_memory().await.unwrap());
    let github = MockGitHub::new();

    // Records left behind by the crashed process.
    let mut was_active = AgentRecord::new("feat-dev", 5);
    was_active.mark_active();
    registry.create(&was_active).await.unwrap();

    let was_created = AgentRecord::new("bug-fix", 6);
    registry.create(&was_created).await.unwrap();

    // GitHub truth: #5 is still labeled in-progress (and feature, so its
    // role is inferable); #7 is blocked and unknown to the registry; one
    // open PR sits on a managed branch for issue #9.
    github.put_issue(5, "open", &["in-progress", "feature"], "");
    github.put_issue(7, "open", &["blocked", "bug"], "Blocked by #99");
    github.put_pull(70, "fix/issue-9", "");

    let summary = recover_on_startup(&config, &registry, github.as_ref() as &dyn GitHubOps)
        .await
        .unwrap();

    // Both stale live agents lost their subprocesses: FAILED, not guessed.
    let a5 = registry.get("feat-dev-issue-5").await.unwrap().unwrap();
    assert_eq!(a5.status, AgentStatus::Failed);
    assert!(a5.active_since.is_none());
    let a6 = registry.get("bug-fix-issue-6").await.unwrap().unwrap();
    assert_eq!(a6.status, AgentStatus::Failed);
    assert_eq!(summary.failed, 2);

    // Best-effort restart comments on the linked issues.
    assert!(!github.comments_for(5).is_empty());
    assert!(!github.comments_for(6).is_empty());

    // #7: blocked label → SLEEPING record with blockers from the body.
    let a7 = registry.get("bug-fix-issue-7").await.unwrap().unwrap();
    assert_eq!(a7.status, AgentStatus::Sleeping);
    assert!(a7.sleeping_since.is_some());
    assert_eq!(a7.blocked_by, vec![99]);

    // PR on fix/issue-9 → SLEEPING record with the PR recorded.
    let a9 = registry.get("bug-fix-issue-9").await.unwrap().unwrap();
    assert_eq!(a9.status, AgentStatus::Sleeping);
    assert_eq!(a9.pr_number, Some(70));
    assert_eq!(a9.branch.as_deref(), Some("fix/issue-9"));

    // #5 is already tracked by a feat-dev record (the failed one): no
    // duplicate reconstruction.
    assert_eq!(registry.all_by_issue(5).await.unwrap().len(), 1);
}

#[tokio::test]
async fn needs_human_label_reconstructs_escalated_record() {
    let dir = tempfile::tempdir().unwrap();
    let config = fixtures::test_config(dir.path());
    let registry = Arc::new(AgentRegistry::open_in_memory().await.unwrap());
    let github = MockGitHub::new();

    github.put_issue(12, "open", &["needs-human", "feature"], "");

    recover_on_startup(&config, &registry, github.as_ref() as &dyn GitHubOps)
        .await
        .unwrap();

    let record = registry.get("feat-dev-issue-12").await.unwrap().unwrap();
    assert_eq!(record.status, AgentStatus::Escalated);
}

#[tokio::test]
async fn unknown_labels_are_skipped_not_guessed() {
    let dir = tempfile::tempdir().unwrap();
    let config = fixtures::test_config(dir.path());
    let registry = Arc::new(AgentRegistry::open_in_memory().await.unwrap());
    let github = MockGitHub::new();

    // Managed state label but nothing to infer a role from.
    github.put_issue(14, "open", &["blocked"], "");

    let summary = recover_on_startup(&config, &registry, github.as_ref() as &dyn GitHubOps)
        .await
        .unwrap();

    assert!(registry.all_by_issue(14).await.unwrap().is_empty());
    assert_eq!(summary.skipped, 1);
}

#[tokio::test]
async fn pr_body_closing_ref_overrides_branch_number() {
    let dir = tempfile::tempdir().unwrap();
    let config = fixtures::test_config(dir.path());
    let registry = Arc::new(AgentRegistry::open_in_memory().await.unwrap());
    let github = MockGitHub::new();

    github.put_pull(80, "feat/issue-15", "Closes #16");

    recover_on_startup(&config, &registry, github.as_ref() as &dyn GitHubOps)
        .await
        .unwrap();

    let record = registry.get("feat-dev-issue-16").await.unwrap().unwrap();
    assert_eq!(record.pr_number, Some(80));
}

#[tokio::test]
async fn tracked_pr_backfills_missing_pr_number() {
    let dir = tempfile::tempdir().unwrap();
    let config = fixtures::test_config(dir.path());
    let registry = Arc::new(AgentRegistry::open_in_memory().await.unwrap());
    let github = MockGitHub::new();

    let mut record = AgentRecord::new("feat-dev", 17);
    record.mark_sleeping();
    registry.create(&record).await.unwrap();
    github.put_pull(81, "feat/issue-17", "");

    let summary = recover_on_startup(&config, &registry, github.as_ref() as &dyn GitHubOps)
        .await
        .unwrap();

    let after = registry.get("feat-dev-issue-17").await.unwrap().unwrap();
    assert_eq!(after.pr_number, Some(81));
    assert_eq!(summary.skipped, 1);
    // Still exactly one record for the issue.
    assert_eq!(registry.all_by_issue(17).await.unwrap().len(), 1);
}
