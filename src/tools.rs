//! The agent→framework contract: tools an agent session can call back into
//! the core with.
//!
//! Each tool is a sum-type variant carrying its parameters; dispatch is a
//! match. Tools are capabilities held per role: lifecycle tools for
//! dev/review agents, issue-management tools for the PM. A tool failure is
//! returned to the agent as a string so it can choose another path; it
//! never aborts the agent loop.

use crate::config::{RoleConfig, SquadronConfig};
use crate::github::GitHubOps;
use crate::registry::AgentRegistry;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

/// A parsed tool invocation from an agent reply.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "tool", content = "args", rename_all = "snake_case")]
pub enum ToolCall {
    ReportBlocked {
        issues: Vec<u64>,
        reason: String,
    },
    ReportComplete {
        summary: String,
    },
    EscalateToHuman {
        reason: String,
        category: String,
    },
    OpenPr {
        title: String,
        body: String,
        head: String,
        base: String,
    },
    CreateIssue {
        title: String,
        body: String,
        #[serde(default)]
        labels: Vec<String>,
    },
    AssignIssue {
        issue_number: u64,
        assignees: Vec<String>,
    },
    LabelIssue {
        issue_number: u64,
        labels: Vec<String>,
    },
    CommentOnIssue {
        issue_number: u64,
        body: String,
    },
    CheckRegistry {},
    ReadIssue {
        issue_number: u64,
    },
}

impl ToolCall {
    pub fn name(&self) -> &'static str {
        match self {
            ToolCall::ReportBlocked { .. } => "report_blocked",
            ToolCall::ReportComplete { .. } => "report_complete",
            ToolCall::EscalateToHuman { .. } => "escalate_to_human",
            ToolCall::OpenPr { .. } => "open_pr",
            ToolCall::CreateIssue { .. } => "create_issue",
            ToolCall::AssignIssue { .. } => "assign_issue",
            ToolCall::LabelIssue { .. } => "label_issue",
            ToolCall::CommentOnIssue { .. } => "comment_on_issue",
            ToolCall::CheckRegistry {} => "check_registry",
            ToolCall::ReadIssue { .. } => "read_issue",
        }
    }
}

/// Lifecycle tools held by dev and review roles.
pub const LIFECYCLE_TOOLS: &[&str] = &[
    "report_blocked",
    "report_complete",
    "escalate_to_human",
    "open_pr",
];

/// Issue-management tools held by the PM.
pub const PM_TOOLS: &[&str] = &[
    "create_issue",
    "assign_issue",
    "label_issue",
    "comment_on_issue",
    "check_registry",
    "read_issue",
];

/// The tool-id set a role holds. Singleton roles are PM-shaped.
pub fn toolset_for(role: &RoleConfig) -> &'static [&'static str] {
    if role.singleton {
        PM_TOOLS
    } else {
        LIFECYCLE_TOOLS
    }
}

/// Try to read a tool call out of an agent reply. The reply may be the
/// bare JSON object or surround it with prose.
pub fn parse_tool_call(reply: &str) -> Option<ToolCall> {
    let trimmed = reply.trim();
    if let Ok(call) = serde_json::from_str::<ToolCall>(trimmed) {
        return Some(call);
    }
    // Prose-wrapped: take the outermost brace span.
    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    if end <= start {
        return None;
    }
    serde_json::from_str::<ToolCall>(&trimmed[start..=end]).ok()
}

/// What the manager should do after a tool dispatch.
#[derive(Debug)]
pub enum ToolOutcome {
    /// Feed this string back to the session as the tool result.
    Reply(String),
    /// Agent is done; run the completion workflow.
    Completed { summary: String },
    /// Agent recorded blockers; put it to sleep.
    Blocked { issues: Vec<u64>, reason: String },
    /// Agent gave up; run the escalation workflow.
    Escalated { reason: String, category: String },
}

/// Executes tool calls against the registry and GitHub.
pub struct ToolExecutor {
    registry: Arc<AgentRegistry>,
    github: Arc<dyn GitHubOps>,
    config: Arc<SquadronConfig>,
}

impl ToolExecutor {
    pub fn new(
        registry: Arc<AgentRegistry>,
        github: Arc<dyn GitHubOps>,
        config: Arc<SquadronConfig>,
    ) -> Self {
        Self {
            registry,
            github,
            config,
        }
    }

    /// Dispatch a tool call for an agent. Infrastructure failures come back
    /// as `Reply` strings: one bad call must not kill the agent.
    pub async fn dispatch(&self, agent_id: &str, call: ToolCall) -> ToolOutcome {
        let record = match self.registry.get(agent_id).await {
            Ok(Some(record)) => record,
            Ok(None) => return ToolOutcome::Reply(format!("unknown agent: {agent_id}")),
            Err(e) => return ToolOutcome::Reply(format!("registry error: {e}")),
        };

        let allowed = self
            .config
            .role(&record.role)
            .map(toolset_for)
            .unwrap_or(LIFECYCLE_TOOLS);
        if !allowed.contains(&call.name()) {
            warn!(agent_id, tool = call.name(), role = %record.role, "Tool not held by role");
            return ToolOutcome::Reply(format!(
                "tool `{}` is not available to role `{}`",
                call.name(),
                record.role
            ));
        }

        info!(agent_id, tool = call.name(), "Dispatching tool call");
        match call {
            ToolCall::ReportBlocked { issues, reason } => {
                self.report_blocked(agent_id, issues, reason).await
            }
            ToolCall::ReportComplete { summary } => ToolOutcome::Completed { summary },
            ToolCall::EscalateToHuman { reason, category } => {
                ToolOutcome::Escalated { reason, category }
            }
            ToolCall::OpenPr {
                title,
                body,
                head,
                base,
            } => {
                self.open_pr(agent_id, &record.pr_number, title, body, head, base)
                    .await
            }
            other => self.execute_pm_tool(other).await,
        }
    }

    /// Dispatch for the PM's one-shot sessions, which have no registry
    /// record. Only PM tools are held.
    pub async fn dispatch_pm(&self, call: ToolCall) -> ToolOutcome {
        if !PM_TOOLS.contains(&call.name()) {
            return ToolOutcome::Reply(format!(
                "tool `{}` is not available to the pm role",
                call.name()
            ));
        }
        info!(tool = call.name(), "Dispatching PM tool call");
        self.execute_pm_tool(call).await
    }

    async fn execute_pm_tool(&self, call: ToolCall) -> ToolOutcome {
        match call {
            ToolCall::CreateIssue {
                title,
                body,
                labels,
            } => match self.github.create_issue(&title, &body, &labels).await {
                Ok(issue) => ToolOutcome::Reply(format!("Created issue #{}: {title}", issue.number)),
                Err(e) => ToolOutcome::Reply(format!("create_issue failed: {e}")),
            },
            ToolCall::AssignIssue {
                issue_number,
                assignees,
            } => match self.github.assign_issue(issue_number, &assignees).await {
                Ok(()) => ToolOutcome::Reply(format!(
                    "Assigned #{issue_number} to {}",
                    assignees.join(", ")
                )),
                Err(e) => ToolOutcome::Reply(format!("assign_issue failed: {e}")),
            },
            ToolCall::LabelIssue {
                issue_number,
                labels,
            } => match self.github.add_labels(issue_number, &labels).await {
                Ok(()) => {
                    ToolOutcome::Reply(format!("Applied labels {labels:?} to #{issue_number}"))
                }
                Err(e) => ToolOutcome::Reply(format!("label_issue failed: {e}")),
            },
            ToolCall::CommentOnIssue { issue_number, body } => {
                match self.github.comment_on_issue(issue_number, &body).await {
                    Ok(()) => ToolOutcome::Reply(format!("Posted comment on #{issue_number}")),
                    Err(e) => ToolOutcome::Reply(format!("comment_on_issue failed: {e}")),
                }
            }
            ToolCall::CheckRegistry {} => self.check_registry().await,
            ToolCall::ReadIssue { issue_number } => match self.github.get_issue(issue_number).await
            {
                Ok(issue) => ToolOutcome::Reply(format!(
                    "**#{}:** {}\n**State:** {}\n**Labels:** {}\n**Assignees:** {}\n**Body:**\n{}",
                    issue.number,
                    issue.title,
                    issue.state,
                    if issue.labels.is_empty() {
                        "none".to_string()
                    } else {
                        issue.labels.join(", ")
                    },
                    if issue.assignees.is_empty() {
                        "none".to_string()
                    } else {
                        issue.assignees.join(", ")
                    },
                    issue.body.as_deref().unwrap_or("(empty)"),
                )),
                Err(e) => ToolOutcome::Reply(format!("read_issue failed: {e}")),
            },
            lifecycle => ToolOutcome::Reply(format!(
                "tool `{}` requires an agent record",
                lifecycle.name()
            )),
        }
    }

    /// Add blocker edges. A self-block or cycle rejects the whole call so
    /// the agent hears about it and picks another path.
    async fn report_blocked(&self, agent_id: &str, issues: Vec<u64>, reason: String) -> ToolOutcome {
        if issues.is_empty() {
            return ToolOutcome::Reply("report_blocked requires at least one issue".to_string());
        }

        let mut added = Vec::new();
        for issue in &issues {
            match self.registry.add_blocker(agent_id, *issue).await {
                Ok(true) => added.push(*issue),
                Ok(false) => {
                    // Roll back edges added so far; the call failed as a unit.
                    for undo in &added {
                        let _ = self.registry.remove_blocker(agent_id, *undo).await;
                    }
                    return ToolOutcome::Reply(format!(
                        "cannot block on issue #{issue}: it would self-block or create a \
                         dependency cycle; choose a different approach"
                    ));
                }
                Err(e) => {
                    for undo in &added {
                        let _ = self.registry.remove_blocker(agent_id, *undo).await;
                    }
                    return ToolOutcome::Reply(format!("report_blocked failed: {e}"));
                }
            }
        }

        ToolOutcome::Blocked { issues, reason }
    }

    /// Duplicate-PR guard: an agent with a recorded PR pushes to the
    /// existing branch instead of opening another PR.
    async fn open_pr(
        &self,
        agent_id: &str,
        existing_pr: &Option<u64>,
        title: String,
        body: String,
        head: String,
        base: String,
    ) -> ToolOutcome {
        if let Some(pr) = existing_pr {
            warn!(agent_id, pr, "open_pr refused: agent already owns a PR");
            return ToolOutcome::Reply(format!(
                "refusing to open a duplicate PR: this agent already owns PR #{pr}. \
                 Push to the existing branch and request re-review instead."
            ));
        }

        match self
            .github
            .create_pull_request(&title, &body, &head, &base)
            .await
        {
            Ok(pr) => {
                match self.registry.get(agent_id).await {
                    Ok(Some(mut record)) => {
                        record.pr_number = Some(pr.number);
                        if let Err(e) = self.registry.update(&mut record).await {
                            return ToolOutcome::Reply(format!(
                                "PR #{} created but registry update failed: {e}",
                                pr.number
                            ));
                        }
                    }
                    Ok(None) => {}
                    Err(e) => {
                        return ToolOutcome::Reply(format!(
                            "PR #{} created but registry read failed: {e}",
                            pr.number
                        ))
                    }
                }
                ToolOutcome::Reply(format!("Opened PR #{}: {title}", pr.number))
            }
            Err(e) => ToolOutcome::Reply(format!("open_pr failed: {e}")),
        }
    }

    async fn check_registry(&self) -> ToolOutcome {
        match self.registry.all_active().await {
            Ok(agents) if agents.is_empty() => {
                ToolOutcome::Reply("No active agents in the registry.".to_string())
            }
            Ok(agents) => {
                let mut lines = vec![format!("**Active agents:** {}", agents.len())];
                for agent in agents {
                    let blockers = if agent.blocked_by.is_empty() {
                        String::new()
                    } else {
                        format!(" (blocked by: {:?})", agent.blocked_by)
                    };
                    lines.push(format!(
                        "- `{}` [{}] status={} issue={}{}",
                        agent.agent_id,
                        agent.role,
                        agent.status,
                        agent
                            .issue_number
                            .map(|n| format!("#{n}"))
                            .unwrap_or_else(|| "-".to_string()),
                        blockers,
                    ));
                }
                ToolOutcome::Reply(lines.join("\n"))
            }
            Err(e) => ToolOutcome::Reply(format!("check_registry failed: {e}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bare_tool_call() {
        let call = parse_tool_call(
            r#"{"tool": "report_blocked", "args": {"issues": [7, 9], "reason": "needs schema"}}"#,
        );
        assert_eq!(
            call,
            Some(ToolCall::ReportBlocked {
                issues: vec![7, 9],
                reason: "needs schema".to_string()
            })
        );
    }

    #[test]
    fn parses_prose_wrapped_tool_call() {
        let reply = r#"I'm done here.

{"tool": "report_complete", "args": {"summary": "implemented and tested"}}"#;
        assert_eq!(
            parse_tool_call(reply),
            Some(ToolCall::ReportComplete {
                summary: "implemented and tested".to_string()
            })
        );
    }

    #[test]
    fn plain_text_is_not_a_tool_call() {
        assert_eq!(parse_tool_call("Still investigating the failure."), None);
        assert_eq!(parse_tool_call(r#"{"tool": "no_such_tool", "args": {}}"#), None);
    }

    #[test]
    fn toolsets_split_by_singleton() {
        let pm = RoleConfig {
            singleton: true,
            ..Default::default()
        };
        let dev = RoleConfig::default();
        assert!(toolset_for(&pm).contains(&"create_issue"));
        assert!(!toolset_for(&pm).contains(&"open_pr"));
        assert!(toolset_for(&dev).contains(&"open_pr"));
        assert!(!toolset_for(&dev).contains(&"assign_issue"));
    }
}
