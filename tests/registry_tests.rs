//! Registry behavior: record CRUD, the blocker graph's cycle and
//! self-block rejection, and webhook dedup persistence.

mod fixtures;

use chrono::{Duration, Utc};
use squadron::{AgentRecord, AgentRegistry, AgentStatus};

async fn registry() -> AgentRegistry {
    AgentRegistry::open_in_memory().await.expect("in-memory registry")
}

#[tokio::test]
async fn create_get_roundtrip_and_duplicate_rejection() {
    let registry = registry().await;
    let record = AgentRecord::new("feat-dev", 10);
    registry.create(&record).await.unwrap();

    let loaded = registry.get("feat-dev-issue-10").await.unwrap().unwrap();
    assert_eq!(loaded.role, "feat-dev");
    assert_eq!(loaded.issue_number, Some(10));
    assert_eq!(loaded.status, AgentStatus::Created);
    assert!(loaded.blocked_by.is_empty());

    // agent_id is the primary key.
    assert!(registry.create(&record).await.is_err());
}

#[tokio::test]
async fn get_by_issue_skips_terminal_records() {
    let registry = registry().await;

    let mut done = AgentRecord::new("feat-dev", 5);
    done.agent_id = "feat-dev-issue-5-old".to_string();
    done.mark_terminal(AgentStatus::Completed);
    registry.create(&done).await.unwrap();

    assert!(registry.get_by_issue(5).await.unwrap().is_none());

    let live = AgentRecord::new("feat-dev", 5);
    registry.create(&live).await.unwrap();
    let found = registry.get_by_issue(5).await.unwrap().unwrap();
    assert_eq!(found.agent_id, "feat-dev-issue-5");
}

#[tokio::test]
async fn update_stamps_updated_at() {
    let registry = registry().await;
    let mut record = AgentRecord::new("bug-fix", 3);
    registry.create(&record).await.unwrap();

    let before = registry.get(&record.agent_id).await.unwrap().unwrap().updated_at;
    tokio::time::sleep(std::time::Duration::from_millis(5)).await;

    record.turn_count = 4;
    registry.update(&mut record).await.unwrap();

    let after = registry.get(&record.agent_id).await.unwrap().unwrap();
    assert_eq!(after.turn_count, 4);
    assert!(after.updated_at > before);
}

#[tokio::test]
async fn self_block_is_rejected_without_mutation() {
    let registry = registry().await;
    let record = AgentRecord::new("feat-dev", 7);
    registry.create(&record).await.unwrap();

    assert!(!registry.add_blocker(&record.agent_id, 7).await.unwrap());
    let loaded = registry.get(&record.agent_id).await.unwrap().unwrap();
    assert!(loaded.blocked_by.is_empty());
}

#[tokio::test]
async fn two_node_cycle_is_rejected() {
    let registry = registry().await;

    // A works #1 and is blocked by #2; B works #2.
    let a = AgentRecord::new("feat-dev", 1);
    registry.create(&a).await.unwrap();
    let b = AgentRecord::new("bug-fix", 2);
    registry.create(&b).await.unwrap();
    assert!(registry.add_blocker(&a.agent_id, 2).await.unwrap());

    // B blocking on #1 closes the loop.
    assert!(!registry.add_blocker(&b.agent_id, 1).await.unwrap());
    let loaded = registry.get(&b.agent_id).await.unwrap().unwrap();
    assert!(loaded.blocked_by.is_empty());
}

#[tokio::test]
async fn transitive_cycle_is_rejected_but_chains_are_fine() {
    let registry = registry().await;
    for (role, issue) in [("feat-dev", 1), ("bug-fix", 2), ("docs-dev", 3)] {
        registry.create(&AgentRecord::new(role, issue)).await.unwrap();
    }

    assert!(registry.add_blocker("feat-dev-issue-1", 2).await.unwrap());
    assert!(registry.add_blocker("bug-fix-issue-2", 3).await.unwrap());

    // 3 → 1 would complete the 1 → 2 → 3 chain into a ring.
    assert!(!registry.add_blocker("docs-dev-issue-3", 1).await.unwrap());

    // An edge to an issue nobody works on is always safe.
    assert!(registry.add_blocker("docs-dev-issue-3", 99).await.unwrap());
}

#[tokio::test]
async fn blocker_add_remove_and_blocked_by_query() {
    let registry = registry().await;
    let mut record = AgentRecord::new("feat-dev", 20);
    record.mark_sleeping();
    registry.create(&record).await.unwrap();

    assert!(registry.add_blocker(&record.agent_id, 99).await.unwrap());
    // Re-adding is a no-op, not an error.
    assert!(registry.add_blocker(&record.agent_id, 99).await.unwrap());

    let blocked = registry.agents_blocked_by(99).await.unwrap();
    assert_eq!(blocked.len(), 1);
    assert_eq!(blocked[0].agent_id, record.agent_id);

    registry.remove_blocker(&record.agent_id, 99).await.unwrap();
    assert!(registry.agents_blocked_by(99).await.unwrap().is_empty());
}

#[tokio::test]
async fn agents_blocked_by_only_sees_sleeping_agents() {
    let registry = registry().await;

    let mut active = AgentRecord::new("feat-dev", 1);
    active.blocked_by = vec![50];
    active.mark_active();
    registry.create(&active).await.unwrap();

    let mut sleeping = AgentRecord::new("bug-fix", 2);
    sleeping.blocked_by = vec![50];
    sleeping.mark_sleeping();
    registry.create(&sleeping).await.unwrap();

    let blocked = registry.agents_blocked_by(50).await.unwrap();
    assert_eq!(blocked.len(), 1);
    assert_eq!(blocked[0].agent_id, "bug-fix-issue-2");
}

#[tokio::test]
async fn seen_events_are_idempotent_and_prunable() {
    let registry = registry().await;

    assert!(!registry.has_seen_event("d-1").await.unwrap());
    registry.mark_event_seen("d-1", "issues.opened").await.unwrap();
    assert!(registry.has_seen_event("d-1").await.unwrap());

    // Duplicate mark is a no-op.
    registry.mark_event_seen("d-1", "issues.opened").await.unwrap();
    assert!(registry.has_seen_event("d-1").await.unwrap());

    registry.mark_event_seen("d-2", "push").await.unwrap();
    registry
        .backdate_event("d-1", Utc::now() - Duration::hours(100))
        .await
        .unwrap();

    let pruned = registry.prune_old_events(Duration::hours(72)).await.unwrap();
    assert_eq!(pruned, 1);
    assert!(!registry.has_seen_event("d-1").await.unwrap());
    assert!(registry.has_seen_event("d-2").await.unwrap());
}

#[tokio::test]
async fn dedup_and_records_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("registry.db");

    {
        let registry = AgentRegistry::open(&db_path).await.unwrap();
        registry.mark_event_seen("persist-1", "issues.labeled").await.unwrap();
        let mut record = AgentRecord::new("feat-dev", 42);
        record.mark_sleeping();
        record.blocked_by = vec![7];
        registry.create(&record).await.unwrap();
        registry.close().await;
    }

    let registry = AgentRegistry::open(&db_path).await.unwrap();
    assert!(registry.has_seen_event("persist-1").await.unwrap());

    let record = registry.get("feat-dev-issue-42").await.unwrap().unwrap();
    assert_eq!(record.status, AgentStatus::Sleeping);
    assert_eq!(record.blocked_by, vec![7]);
    assert!(record.sleeping_since.is_some());
    registry.close().await;
}
