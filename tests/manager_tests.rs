//! Agent manager scenarios: trigger-driven spawning, idempotent re-entry,
//! the duplicate-PR guard, sleep/wake timestamp discipline, and synthetic
//! completion on PR merge.

mod fixtures;

use fixtures::{labeled_event, pr_closed_event, MockBackend, MockGitHub, NoopWorktrees};
use squadron::tools::{ToolCall, ToolExecutor, ToolOutcome};
use squadron::{
    AgentManager, AgentRecord, AgentRegistry, AgentStatus, EventRouter, GitHubOps, SquadronConfig,
    SquadronEvent, SquadronEventType,
};
use std::sync::Arc;

struct Setup {
    config: Arc<SquadronConfig>,
    registry: Arc<AgentRegistry>,
    github: Arc<MockGitHub>,
    backend: Arc<MockBackend>,
    manager: Arc<AgentManager>,
    _dir: tempfile::TempDir,
}

async fn setup() -> Setup {
    let dir = tempfile::tempdir().unwrap();
    let config = Arc::new(fixtures::test_config(dir.path()));
    let registry = Arc::new(AgentRegistry::open_in_memory().await.unwrap());
    let github = MockGitHub::new();
    let backend = MockBackend::new();
    let manager = AgentManager::new(
        Arc::clone(&config),
        Arc::clone(&registry),
        Arc::clone(&github) as Arc<dyn GitHubOps>,
        Arc::clone(&backend) as Arc<dyn squadron::SessionBackend>,
        Arc::new(NoopWorktrees),
        dir.path().to_path_buf(),
    );
    Setup {
        config,
        registry,
        github,
        backend,
        manager,
        _dir: dir,
    }
}

#[tokio::test]
async fn label_trigger_spawns_active_agent() {
    let setup = setup().await;
    let (mut router, _pm_rx) = EventRouter::new(
        Arc::clone(&setup.registry),
        Arc::clone(&setup.config),
        Arc::clone(&setup.github) as Arc<dyn GitHubOps>,
    );
    setup.manager.register_handlers(&mut router);

    router
        .route(&labeled_event("d-s1", 10, "feature", "alice"))
        .await
        .unwrap();

    let record = setup.registry.get("feat-dev-issue-10").await.unwrap().unwrap();
    assert_eq!(record.role, "feat-dev");
    assert_eq!(record.issue_number, Some(10));
    assert_eq!(record.status, AgentStatus::Active);
    assert!(record.active_since.is_some());
    assert_eq!(record.branch.as_deref(), Some("feat/issue-10"));

    let created = setup.backend.created.lock().unwrap().clone();
    assert_eq!(created, vec!["squadron-feat-dev-issue-10".to_string()]);
}

#[tokio::test]
async fn repeated_trigger_is_idempotent() {
    let setup = setup().await;
    let (mut router, _pm_rx) = EventRouter::new(
        Arc::clone(&setup.registry),
        Arc::clone(&setup.config),
        Arc::clone(&setup.github) as Arc<dyn GitHubOps>,
    );
    setup.manager.register_handlers(&mut router);

    router
        .route(&labeled_event("d-i1", 11, "feature", "alice"))
        .await
        .unwrap();
    router
        .route(&labeled_event("d-i2", 11, "feature", "alice"))
        .await
        .unwrap();

    let live = setup.registry.all_active().await.unwrap();
    assert_eq!(live.len(), 1);
    // Only one session was ever started.
    assert_eq!(setup.backend.created.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn spawn_adopts_existing_open_pr() {
    let setup = setup().await;
    setup.github.put_pull(42, "feat/issue-13", "Fixes #13");

    let event = SquadronEvent::from_github(
        &labeled_event("d-adopt", 13, "feature", "alice"),
        SquadronEventType::IssueLabeled,
    );
    setup.manager.spawn_agent("feat-dev", &event).await.unwrap();

    let record = setup.registry.get("feat-dev-issue-13").await.unwrap().unwrap();
    assert_eq!(record.pr_number, Some(42));
    assert_eq!(record.branch.as_deref(), Some("feat/issue-13"));

    // The first prompt warns about the adopted PR up front, so the agent
    // never has to discover the duplicate guard reactively.
    let prompt = setup
        .backend
        .wait_for_prompt("do not open a new PR")
        .await
        .expect("spawn prompt should carry the existing-PR warning");
    assert!(prompt.contains("#42"), "got: {prompt}");
}

#[tokio::test]
async fn open_pr_is_refused_when_agent_already_owns_one() {
    let setup = setup().await;
    let mut record = AgentRecord::new("bug-fix", 86);
    record.pr_number = Some(42);
    record.mark_active();
    setup.registry.create(&record).await.unwrap();

    let tools = ToolExecutor::new(
        Arc::clone(&setup.registry),
        Arc::clone(&setup.github) as Arc<dyn GitHubOps>,
        Arc::clone(&setup.config),
    );

    let outcome = tools
        .dispatch(
            &record.agent_id,
            ToolCall::OpenPr {
                title: "fix".to_string(),
                body: "Fixes #86".to_string(),
                head: "fix/issue-86".to_string(),
                base: "main".to_string(),
            },
        )
        .await;

    match outcome {
        ToolOutcome::Reply(message) => assert!(message.contains("42"), "got: {message}"),
        other => panic!("expected Reply, got {other:?}"),
    }
    // No create-PR call reached GitHub.
    assert!(setup.github.created_prs.lock().unwrap().is_empty());
}

#[tokio::test]
async fn report_blocked_cycle_is_surfaced_to_the_agent() {
    let setup = setup().await;

    let mut a = AgentRecord::new("feat-dev", 1);
    a.mark_active();
    setup.registry.create(&a).await.unwrap();
    let mut b = AgentRecord::new("bug-fix", 2);
    b.mark_active();
    setup.registry.create(&b).await.unwrap();
    assert!(setup.registry.add_blocker(&a.agent_id, 2).await.unwrap());

    let tools = ToolExecutor::new(
        Arc::clone(&setup.registry),
        Arc::clone(&setup.github) as Arc<dyn GitHubOps>,
        Arc::clone(&setup.config),
    );
    let outcome = tools
        .dispatch(
            &b.agent_id,
            ToolCall::ReportBlocked {
                issues: vec![1],
                reason: "waiting on schema".to_string(),
            },
        )
        .await;

    match outcome {
        ToolOutcome::Reply(message) => assert!(message.contains("cycle"), "got: {message}"),
        other => panic!("expected Reply, got {other:?}"),
    }
    let b_after = setup.registry.get(&b.agent_id).await.unwrap().unwrap();
    assert!(b_after.blocked_by.is_empty());
}

#[tokio::test]
async fn sleep_and_wake_keep_timestamps_consistent() {
    let setup = setup().await;
    let mut record = AgentRecord::new("feat-dev", 21);
    record.mark_active();
    setup.registry.create(&record).await.unwrap();

    setup
        .manager
        .sleep_agent(&record.agent_id, &[99], "waiting on #99", false)
        .await;

    let sleeping = setup.registry.get(&record.agent_id).await.unwrap().unwrap();
    assert_eq!(sleeping.status, AgentStatus::Sleeping);
    assert!(sleeping.sleeping_since.is_some());
    assert!(sleeping.active_since.is_none());
    assert!(setup.github.labels_for(21).contains(&"blocked".to_string()));

    setup
        .manager
        .wake_agent(&record.agent_id, "blocker resolved".to_string())
        .await;

    let awake = setup.registry.get(&record.agent_id).await.unwrap().unwrap();
    assert_eq!(awake.status, AgentStatus::Active);
    assert!(awake.active_since.is_some());
    assert!(awake.sleeping_since.is_none());
    assert_eq!(
        setup.backend.resumed.lock().unwrap().clone(),
        vec!["squadron-feat-dev-issue-21".to_string()]
    );
}

#[tokio::test]
async fn merged_pr_synthesizes_completion_with_cleanup_comment() {
    let setup = setup().await;
    let mut record = AgentRecord::new("feat-dev", 30);
    record.pr_number = Some(55);
    record.mark_active();
    setup.registry.create(&record).await.unwrap();

    let event = SquadronEvent::from_github(
        &pr_closed_event("d-merge", 55, true, "alice"),
        SquadronEventType::PrClosed,
    );
    Arc::clone(&setup.manager)
        .handle_pr_closed(event)
        .await
        .unwrap();

    let completed = setup.registry.get(&record.agent_id).await.unwrap().unwrap();
    assert_eq!(completed.status, AgentStatus::Completed);
    assert!(completed.active_since.is_none());

    // The cleanup workflow ran: a completion comment with the PM mention,
    // not a silent status flip.
    let comments = setup.github.comments_for(30);
    assert_eq!(comments.len(), 1);
    assert!(comments[0].contains("✅"));
    assert!(comments[0].contains("pm"));
}

#[tokio::test]
async fn unmerged_pr_close_wakes_sleeping_owner() {
    let setup = setup().await;
    let mut record = AgentRecord::new("feat-dev", 31);
    record.pr_number = Some(56);
    record.mark_sleeping();
    setup.registry.create(&record).await.unwrap();

    let event = SquadronEvent::from_github(
        &pr_closed_event("d-unmerged", 56, false, "alice"),
        SquadronEventType::PrClosed,
    );
    Arc::clone(&setup.manager)
        .handle_pr_closed(event)
        .await
        .unwrap();

    let awake = setup.registry.get(&record.agent_id).await.unwrap().unwrap();
    assert_eq!(awake.status, AgentStatus::Active);
    assert!(!setup.backend.resumed.lock().unwrap().is_empty());
}

#[tokio::test]
async fn wake_label_on_pr_wakes_owning_agent() {
    let setup = setup().await;
    let mut record = AgentRecord::new("feat-dev", 32);
    record.pr_number = Some(61);
    record.mark_sleeping();
    setup.registry.create(&record).await.unwrap();

    let raw = squadron::GitHubEvent {
        delivery_id: "d-wakelabel".to_string(),
        event_type: "pull_request".to_string(),
        action: Some("labeled".to_string()),
        payload: serde_json::json!({
            "pull_request": {"number": 61},
            "label": {"name": "needs-changes"},
            "sender": {"login": "alice"},
        }),
    };
    let event = SquadronEvent::from_github(&raw, SquadronEventType::PrLabeled);
    Arc::clone(&setup.manager)
        .handle_pr_labeled(event)
        .await
        .unwrap();

    let awake = setup.registry.get(&record.agent_id).await.unwrap().unwrap();
    assert_eq!(awake.status, AgentStatus::Active);
}

#[tokio::test]
async fn closing_a_blocker_issue_wakes_the_blocked_agent() {
    let setup = setup().await;
    let mut record = AgentRecord::new("feat-dev", 33);
    record.blocked_by = vec![70];
    record.mark_sleeping();
    setup.registry.create(&record).await.unwrap();

    let raw = squadron::GitHubEvent {
        delivery_id: "d-closed".to_string(),
        event_type: "issues".to_string(),
        action: Some("closed".to_string()),
        payload: serde_json::json!({
            "issue": {"number": 70},
            "sender": {"login": "alice"},
        }),
    };
    let event = SquadronEvent::from_github(&raw, SquadronEventType::IssueClosed);
    Arc::clone(&setup.manager)
        .handle_issue_closed(event)
        .await
        .unwrap();

    let awake = setup.registry.get(&record.agent_id).await.unwrap().unwrap();
    assert_eq!(awake.status, AgentStatus::Active);
    assert!(awake.blocked_by.is_empty());
}
