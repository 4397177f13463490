//! Shared test doubles: a recording GitHub mock, a scripted session
//! backend, and a no-op worktree manager.
#![allow(dead_code)]

use async_trait::async_trait;
use squadron::config::{RoleConfig, SquadronConfig, TriggerConfig};
use squadron::github::{GhIssue, GhPullRequest, GitHubError, GitHubOps, ReviewVerdict};
use squadron::session::{AgentSession, SessionBackend, SessionConfig, SessionError};
use squadron::worktree::{WorktreeError, WorktreeOps};
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

// ── GitHub mock ──────────────────────────────────────────────────────────

#[derive(Default)]
pub struct MockGitHub {
    pub issues: Mutex<HashMap<u64, GhIssue>>,
    pub pulls: Mutex<Vec<GhPullRequest>>,
    pub created_issues: Mutex<Vec<(String, String, Vec<String>)>>,
    pub created_prs: Mutex<Vec<(String, String, String, String)>>,
    pub comments: Mutex<Vec<(u64, String)>>,
    pub labels_added: Mutex<Vec<(u64, Vec<String>)>>,
    pub assignments: Mutex<Vec<(u64, Vec<String>)>>,
    next_number: AtomicU64,
}

impl MockGitHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            next_number: AtomicU64::new(1000),
            ..Default::default()
        })
    }

    pub fn put_issue(&self, number: u64, state: &str, labels: &[&str], body: &str) {
        self.issues.lock().unwrap().insert(
            number,
            GhIssue {
                number,
                title: format!("issue {number}"),
                body: Some(body.to_string()),
                state: state.to_string(),
                labels: labels.iter().map(|s| s.to_string()).collect(),
                assignees: vec![],
            },
        );
    }

    pub fn put_pull(&self, number: u64, head_ref: &str, body: &str) {
        self.pulls.lock().unwrap().push(GhPullRequest {
            number,
            title: Some(format!("pr {number}")),
            body: Some(body.to_string()),
            state: "open".to_string(),
            merged: false,
            head_ref: head_ref.to_string(),
            base_ref: "main".to_string(),
            author: Some("squadron[bot]".to_string()),
        });
    }

    pub fn comments_for(&self, number: u64) -> Vec<String> {
        self.comments
            .lock()
            .unwrap()
            .iter()
            .filter(|(n, _)| *n == number)
            .map(|(_, body)| body.clone())
            .collect()
    }

    pub fn labels_for(&self, number: u64) -> Vec<String> {
        self.labels_added
            .lock()
            .unwrap()
            .iter()
            .filter(|(n, _)| *n == number)
            .flat_map(|(_, labels)| labels.clone())
            .collect()
    }
}

#[async_trait]
impl GitHubOps for MockGitHub {
    async fn get_issue(&self, number: u64) -> Result<GhIssue, GitHubError> {
        self.issues
            .lock()
            .unwrap()
            .get(&number)
            .cloned()
            .ok_or_else(|| GitHubError::Transport(format!("issue #{number} not found")))
    }

    async fn list_issues(&self, label: Option<&str>) -> Result<Vec<GhIssue>, GitHubError> {
        Ok(self
            .issues
            .lock()
            .unwrap()
            .values()
            .filter(|i| i.state == "open")
            .filter(|i| label.map_or(true, |l| i.has_label(l)))
            .cloned()
            .collect())
    }

    async fn list_pull_requests(&self) -> Result<Vec<GhPullRequest>, GitHubError> {
        Ok(self.pulls.lock().unwrap().clone())
    }

    async fn create_issue(
        &self,
        title: &str,
        body: &str,
        labels: &[String],
    ) -> Result<GhIssue, GitHubError> {
        let number = self.next_number.fetch_add(1, Ordering::SeqCst);
        self.created_issues.lock().unwrap().push((
            title.to_string(),
            body.to_string(),
            labels.to_vec(),
        ));
        Ok(GhIssue {
            number,
            title: title.to_string(),
            body: Some(body.to_string()),
            state: "open".to_string(),
            labels: labels.to_vec(),
            assignees: vec![],
        })
    }

    async fn add_labels(&self, number: u64, labels: &[String]) -> Result<(), GitHubError> {
        self.labels_added
            .lock()
            .unwrap()
            .push((number, labels.to_vec()));
        Ok(())
    }

    async fn assign_issue(&self, number: u64, assignees: &[String]) -> Result<(), GitHubError> {
        self.assignments
            .lock()
            .unwrap()
            .push((number, assignees.to_vec()));
        Ok(())
    }

    async fn comment_on_issue(&self, number: u64, body: &str) -> Result<(), GitHubError> {
        self.comments
            .lock()
            .unwrap()
            .push((number, body.to_string()));
        Ok(())
    }

    async fn comment_on_pr(&self, number: u64, body: &str) -> Result<(), GitHubError> {
        self.comment_on_issue(number, body).await
    }

    async fn create_pull_request(
        &self,
        title: &str,
        body: &str,
        head: &str,
        base: &str,
    ) -> Result<GhPullRequest, GitHubError> {
        let number = self.next_number.fetch_add(1, Ordering::SeqCst);
        self.created_prs.lock().unwrap().push((
            title.to_string(),
            body.to_string(),
            head.to_string(),
            base.to_string(),
        ));
        Ok(GhPullRequest {
            number,
            title: Some(title.to_string()),
            body: Some(body.to_string()),
            state: "open".to_string(),
            merged: false,
            head_ref: head.to_string(),
            base_ref: base.to_string(),
            author: None,
        })
    }

    async fn submit_review(
        &self,
        _pr_number: u64,
        _verdict: ReviewVerdict,
        _body: &str,
    ) -> Result<(), GitHubError> {
        Ok(())
    }

    async fn add_pr_line_comment(
        &self,
        _pr_number: u64,
        _commit_sha: &str,
        _path: &str,
        _line: u64,
        _body: &str,
    ) -> Result<(), GitHubError> {
        Ok(())
    }
}

// ── Session backend mock ─────────────────────────────────────────────────

/// Scripted backend: sessions pop replies off a shared queue; an empty
/// queue yields an empty reply (a plain turn-yield for the agent loop).
/// Every prompt a session receives is recorded for assertions.
#[derive(Default)]
pub struct MockBackend {
    pub replies: Arc<Mutex<VecDeque<String>>>,
    pub prompts: Arc<Mutex<Vec<String>>>,
    pub created: Mutex<Vec<String>>,
    pub resumed: Mutex<Vec<String>>,
    pub deleted: Mutex<Vec<String>>,
}

impl MockBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn script_reply(&self, reply: &str) {
        self.replies.lock().unwrap().push_back(reply.to_string());
    }

    /// Wait briefly for a recorded prompt matching `needle` (prompts are
    /// sent from the spawned turn task, not the caller's task).
    pub async fn wait_for_prompt(&self, needle: &str) -> Option<String> {
        for _ in 0..100 {
            if let Some(found) = self
                .prompts
                .lock()
                .unwrap()
                .iter()
                .find(|p| p.contains(needle))
                .cloned()
            {
                return Some(found);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        None
    }
}

#[async_trait]
impl SessionBackend for MockBackend {
    async fn create_session(
        &self,
        config: SessionConfig,
    ) -> Result<Box<dyn AgentSession>, SessionError> {
        self.created.lock().unwrap().push(config.session_id.clone());
        Ok(Box::new(MockSession {
            session_id: config.session_id,
            replies: Arc::clone(&self.replies),
            prompts: Arc::clone(&self.prompts),
        }))
    }

    async fn resume_session(
        &self,
        session_id: &str,
        _config: SessionConfig,
    ) -> Result<Box<dyn AgentSession>, SessionError> {
        self.resumed.lock().unwrap().push(session_id.to_string());
        Ok(Box::new(MockSession {
            session_id: session_id.to_string(),
            replies: Arc::clone(&self.replies),
            prompts: Arc::clone(&self.prompts),
        }))
    }

    async fn delete_session(&self, session_id: &str) -> Result<(), SessionError> {
        self.deleted.lock().unwrap().push(session_id.to_string());
        Ok(())
    }
}

pub struct MockSession {
    session_id: String,
    replies: Arc<Mutex<VecDeque<String>>>,
    prompts: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl AgentSession for MockSession {
    fn session_id(&self) -> &str {
        &self.session_id
    }

    async fn send_and_wait(
        &mut self,
        prompt: &str,
        _timeout: Duration,
    ) -> Result<String, SessionError> {
        self.prompts.lock().unwrap().push(prompt.to_string());
        Ok(self.replies.lock().unwrap().pop_front().unwrap_or_default())
    }

    async fn destroy(&mut self) -> Result<(), SessionError> {
        Ok(())
    }
}

// ── Worktree mock ────────────────────────────────────────────────────────

pub struct NoopWorktrees;

#[async_trait]
impl WorktreeOps for NoopWorktrees {
    async fn create(&self, agent_id: &str, _branch: &str) -> Result<PathBuf, WorktreeError> {
        Ok(std::env::temp_dir().join("squadron-test").join(agent_id))
    }

    async fn ensure(&self, agent_id: &str, branch: &str) -> Result<PathBuf, WorktreeError> {
        self.create(agent_id, branch).await
    }

    async fn remove(&self, _agent_id: &str) -> Result<(), WorktreeError> {
        Ok(())
    }
}

// ── Config helper ────────────────────────────────────────────────────────

/// A workable config rooted at `repo_root`: role templates are written to
/// disk so prompt assembly has something to read.
pub fn test_config(repo_root: &Path) -> SquadronConfig {
    let agents_dir = repo_root.join(".squadron").join("agents");
    std::fs::create_dir_all(&agents_dir).unwrap();

    let mut cfg = SquadronConfig::default();
    cfg.project.name = "squadron".to_string();
    cfg.project.owner = "acme".to_string();
    cfg.project.repo = "widgets".to_string();
    cfg.human_groups.maintainers = vec!["alice".to_string(), "bob".to_string()];

    let roles: &[(&str, bool, Vec<TriggerConfig>)] = &[
        (
            "pm",
            true,
            vec![],
        ),
        (
            "feat-dev",
            false,
            vec![TriggerConfig {
                event: "issues.labeled".to_string(),
                label: Some("feature".to_string()),
                action: squadron::TriggerAction::Spawn,
                condition: None,
            }],
        ),
        (
            "bug-fix",
            false,
            vec![TriggerConfig {
                event: "issues.labeled".to_string(),
                label: Some("bug".to_string()),
                action: squadron::TriggerAction::Spawn,
                condition: None,
            }],
        ),
        (
            "pr-review",
            false,
            vec![TriggerConfig {
                event: "pull_request.opened".to_string(),
                label: None,
                action: squadron::TriggerAction::Spawn,
                condition: None,
            }],
        ),
    ];

    for (name, singleton, triggers) in roles {
        let definition = format!(".squadron/agents/{name}.md");
        std::fs::write(
            repo_root.join(&definition),
            format!("# {name} agent for {{project_name}}\n\nIssue: #{{issue_number}}\nBranch: {{branch_name}}\nPR: {{pr_number}}\n"),
        )
        .unwrap();
        cfg.agent_roles.insert(
            name.to_string(),
            RoleConfig {
                agent_definition: definition,
                triggers: triggers.clone(),
                singleton: *singleton,
                assignable_labels: vec![],
            },
        );
    }

    cfg
}

// ── Event helpers ────────────────────────────────────────────────────────

pub fn labeled_event(delivery: &str, issue: u64, label: &str, sender: &str) -> squadron::GitHubEvent {
    squadron::GitHubEvent {
        delivery_id: delivery.to_string(),
        event_type: "issues".to_string(),
        action: Some("labeled".to_string()),
        payload: serde_json::json!({
            "issue": {
                "number": issue,
                "title": format!("issue {issue}"),
                "body": "do the thing",
                "labels": [{"name": label}],
            },
            "label": {"name": label},
            "sender": {"login": sender},
            "repository": {"full_name": "acme/widgets"},
        }),
    }
}

pub fn comment_event(delivery: &str, issue: u64, body: &str, sender: &str) -> squadron::GitHubEvent {
    squadron::GitHubEvent {
        delivery_id: delivery.to_string(),
        event_type: "issue_comment".to_string(),
        action: Some("created".to_string()),
        payload: serde_json::json!({
            "issue": {"number": issue},
            "comment": {"body": body},
            "sender": {"login": sender},
            "repository": {"full_name": "acme/widgets"},
        }),
    }
}

pub fn pr_closed_event(delivery: &str, pr: u64, merged: bool, sender: &str) -> squadron::GitHubEvent {
    squadron::GitHubEvent {
        delivery_id: delivery.to_string(),
        event_type: "pull_request".to_string(),
        action: Some("closed".to_string()),
        payload: serde_json::json!({
            "pull_request": {
                "number": pr,
                "merged": merged,
                "head": {"ref": format!("feat/issue-{pr}")},
            },
            "sender": {"login": sender},
            "repository": {"full_name": "acme/widgets"},
        }),
    }
}
