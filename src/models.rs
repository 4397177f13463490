//! Core data model: agent records, lifecycle statuses, and the two event
//! shapes that flow through the system (raw GitHub webhooks and normalized
//! internal events).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle status of an agent record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Created,
    Active,
    Sleeping,
    Completed,
    Escalated,
    Failed,
}

impl AgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentStatus::Created => "created",
            AgentStatus::Active => "active",
            AgentStatus::Sleeping => "sleeping",
            AgentStatus::Completed => "completed",
            AgentStatus::Escalated => "escalated",
            AgentStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "created" => Some(AgentStatus::Created),
            "active" => Some(AgentStatus::Active),
            "sleeping" => Some(AgentStatus::Sleeping),
            "completed" => Some(AgentStatus::Completed),
            "escalated" => Some(AgentStatus::Escalated),
            "failed" => Some(AgentStatus::Failed),
            _ => None,
        }
    }

    /// Terminal states are reached once and persist for audit.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AgentStatus::Completed | AgentStatus::Escalated | AgentStatus::Failed
        )
    }

    pub fn is_live(&self) -> bool {
        !self.is_terminal()
    }
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Authoritative per-agent state, persisted in the registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRecord {
    pub agent_id: String,
    pub role: String,
    pub issue_number: Option<u64>,
    pub pr_number: Option<u64>,
    pub session_id: Option<String>,
    pub status: AgentStatus,
    pub branch: Option<String>,
    pub worktree_path: Option<String>,
    /// Issue numbers this agent is waiting on, insertion-ordered.
    pub blocked_by: Vec<u64>,
    pub iteration_count: u32,
    pub tool_call_count: u32,
    pub turn_count: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub active_since: Option<DateTime<Utc>>,
    pub sleeping_since: Option<DateTime<Utc>>,
}

impl AgentRecord {
    /// New record for a role working an issue. `agent_id` follows the
    /// `{role}-issue-{n}` convention.
    pub fn new(role: &str, issue_number: u64) -> Self {
        let now = Utc::now();
        Self {
            agent_id: format!("{role}-issue-{issue_number}"),
            role: role.to_string(),
            issue_number: Some(issue_number),
            pr_number: None,
            session_id: None,
            status: AgentStatus::Created,
            branch: None,
            worktree_path: None,
            blocked_by: Vec::new(),
            iteration_count: 0,
            tool_call_count: 0,
            turn_count: 0,
            created_at: now,
            updated_at: now,
            active_since: None,
            sleeping_since: None,
        }
    }

    /// New record for a role scoped to a PR (review agents).
    pub fn new_for_pr(role: &str, pr_number: u64) -> Self {
        let now = Utc::now();
        Self {
            agent_id: format!("{role}-pr-{pr_number}"),
            role: role.to_string(),
            issue_number: None,
            pr_number: Some(pr_number),
            session_id: None,
            status: AgentStatus::Created,
            branch: None,
            worktree_path: None,
            blocked_by: Vec::new(),
            iteration_count: 0,
            tool_call_count: 0,
            turn_count: 0,
            created_at: now,
            updated_at: now,
            active_since: None,
            sleeping_since: None,
        }
    }

    /// Transition into ACTIVE. Sets `active_since`, clears `sleeping_since`
    /// (the timestamps mirror the status exactly).
    pub fn mark_active(&mut self) {
        self.status = AgentStatus::Active;
        self.active_since = Some(Utc::now());
        self.sleeping_since = None;
    }

    /// Transition into SLEEPING. Sets `sleeping_since`, clears `active_since`.
    pub fn mark_sleeping(&mut self) {
        self.status = AgentStatus::Sleeping;
        self.sleeping_since = Some(Utc::now());
        self.active_since = None;
    }

    /// Transition into a terminal state; both phase timestamps are cleared.
    pub fn mark_terminal(&mut self, status: AgentStatus) {
        debug_assert!(status.is_terminal());
        self.status = status;
        self.active_since = None;
        self.sleeping_since = None;
    }
}

/// Raw webhook event as delivered by GitHub, before classification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitHubEvent {
    pub delivery_id: String,
    pub event_type: String,
    pub action: Option<String>,
    pub payload: serde_json::Value,
}

impl GitHubEvent {
    /// `event_type.action`, e.g. `issues.labeled`; bare event type when the
    /// payload carries no action (`push`).
    pub fn full_type(&self) -> String {
        match &self.action {
            Some(action) => format!("{}.{action}", self.event_type),
            None => self.event_type.clone(),
        }
    }

    pub fn sender(&self) -> Option<&str> {
        self.payload.pointer("/sender/login")?.as_str()
    }

    pub fn repo_full_name(&self) -> Option<&str> {
        self.payload.pointer("/repository/full_name")?.as_str()
    }

    pub fn installation_id(&self) -> Option<u64> {
        self.payload.pointer("/installation/id")?.as_u64()
    }

    pub fn issue_number(&self) -> Option<u64> {
        self.payload.pointer("/issue/number")?.as_u64()
    }

    /// PR number: from the `pull_request` object, or from the issue when
    /// this is a comment on a PR (those payloads carry both).
    pub fn pr_number(&self) -> Option<u64> {
        if let Some(n) = self
            .payload
            .pointer("/pull_request/number")
            .and_then(|v| v.as_u64())
        {
            return Some(n);
        }
        if self.payload.pointer("/issue/pull_request").is_some() {
            return self.issue_number();
        }
        None
    }

    pub fn comment_body(&self) -> Option<&str> {
        self.payload.pointer("/comment/body")?.as_str()
    }
}

/// Normalized internal event type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SquadronEventType {
    IssueOpened,
    IssueClosed,
    IssueAssigned,
    IssueLabeled,
    IssueComment,
    PrOpened,
    PrClosed,
    PrSynchronized,
    PrLabeled,
    PrReviewSubmitted,
    PrReviewCommentCreated,
    PrReviewCommentEdited,
    PrReviewCommentDeleted,
    Push,
    // Internal-only types, never produced by classification.
    BlockerResolved,
    WakeAgent,
    AgentBlocked,
    AgentCompleted,
    AgentEscalated,
}

/// Map an `event_type.action` string to the internal type. Unknown types
/// yield `None` and are dropped by the router.
pub fn classify(full_type: &str) -> Option<SquadronEventType> {
    use SquadronEventType::*;
    match full_type {
        "issues.opened" => Some(IssueOpened),
        "issues.closed" => Some(IssueClosed),
        "issues.assigned" => Some(IssueAssigned),
        "issues.labeled" => Some(IssueLabeled),
        "issue_comment.created" => Some(IssueComment),
        "pull_request.opened" => Some(PrOpened),
        "pull_request.closed" => Some(PrClosed),
        "pull_request.synchronize" => Some(PrSynchronized),
        "pull_request.labeled" => Some(PrLabeled),
        "pull_request_review.submitted" => Some(PrReviewSubmitted),
        "pull_request_review_comment.created" => Some(PrReviewCommentCreated),
        "pull_request_review_comment.edited" => Some(PrReviewCommentEdited),
        "pull_request_review_comment.deleted" => Some(PrReviewCommentDeleted),
        "push" => Some(Push),
        _ => None,
    }
}

/// Normalized routing object handed to handlers, the PM queue, and agent
/// inboxes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SquadronEvent {
    pub event_type: SquadronEventType,
    pub source_delivery_id: Option<String>,
    pub agent_id: Option<String>,
    pub issue_number: Option<u64>,
    pub pr_number: Option<u64>,
    pub data: serde_json::Value,
}

impl SquadronEvent {
    pub fn internal(event_type: SquadronEventType, agent_id: &str) -> Self {
        Self {
            event_type,
            source_delivery_id: None,
            agent_id: Some(agent_id.to_string()),
            issue_number: None,
            pr_number: None,
            data: serde_json::Value::Null,
        }
    }

    /// Build from a classified GitHub event; derives issue/PR numbers
    /// (PR comments carry both).
    pub fn from_github(event: &GitHubEvent, event_type: SquadronEventType) -> Self {
        Self {
            event_type,
            source_delivery_id: Some(event.delivery_id.clone()),
            agent_id: None,
            issue_number: event.issue_number(),
            pr_number: event.pr_number(),
            data: serde_json::json!({
                "action": event.action,
                "sender": event.sender(),
                "payload": event.payload,
            }),
        }
    }

    pub fn sender(&self) -> Option<&str> {
        self.data.pointer("/sender")?.as_str()
    }

    // Typed views over the carried payload, so consumers never reach into
    // the JSON themselves.

    pub fn label_name(&self) -> Option<&str> {
        self.data.pointer("/payload/label/name")?.as_str()
    }

    pub fn comment_body(&self) -> Option<&str> {
        self.data.pointer("/payload/comment/body")?.as_str()
    }

    pub fn pr_merged(&self) -> bool {
        self.data
            .pointer("/payload/pull_request/merged")
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    }

    pub fn pr_head_ref(&self) -> Option<&str> {
        self.data.pointer("/payload/pull_request/head/ref")?.as_str()
    }

    pub fn issue_title(&self) -> Option<&str> {
        self.data.pointer("/payload/issue/title")?.as_str()
    }

    pub fn issue_body(&self) -> Option<&str> {
        self.data.pointer("/payload/issue/body")?.as_str()
    }

    pub fn pr_title(&self) -> Option<&str> {
        self.data.pointer("/payload/pull_request/title")?.as_str()
    }

    pub fn pr_body(&self) -> Option<&str> {
        self.data.pointer("/payload/pull_request/body")?.as_str()
    }
}
