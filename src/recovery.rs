//! Startup recovery: reconstruct the registry from GitHub truth.
//!
//! After a crash or restart, container-local state (sessions, worktrees,
//! tasks) is gone. This runs once before the event router accepts traffic:
//! stale live agents are failed, and open issues/PRs carrying managed
//! labels or branch conventions are turned back into records. Ambiguous
//! reconstructions (unknown labels, unknown branch prefixes) become FAILED
//! or are skipped: recovery never guesses.

use crate::config::SquadronConfig;
use crate::github::GitHubOps;
use crate::models::{AgentRecord, AgentStatus};
use crate::registry::AgentRegistry;
use anyhow::Result;
use regex::Regex;
use std::sync::OnceLock;
use tracing::{debug, info, warn};

fn branch_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(?:feat|fix|security|docs|infra|hotfix)/issue-(\d+)$").expect("static regex")
    })
}

fn issue_ref_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)(?:fixes|closes|resolves)\s+#(\d+)").expect("static regex"))
}

fn blocker_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)block(?:ing|ed\s+by)\s+#(\d+)").expect("static regex"))
}

/// First closing-keyword issue reference in a PR body.
pub fn extract_issue_ref(body: &str) -> Option<u64> {
    issue_ref_re()
        .captures(body)
        .and_then(|cap| cap[1].parse().ok())
}

/// Issue number from a `{prefix}/issue-{N}` branch name.
pub fn branch_issue_number(branch: &str) -> Option<u64> {
    branch_re()
        .captures(branch)
        .and_then(|cap| cap[1].parse().ok())
}

/// Blocker references (`blocked by #N`, `blocking #N`) in an issue body.
pub fn extract_blocker_refs(body: &str) -> Vec<u64> {
    blocker_re()
        .captures_iter(body)
        .filter_map(|cap| cap[1].parse().ok())
        .collect()
}

/// Counts of actions taken by one recovery run.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct RecoverySummary {
    pub failed: usize,
    pub reconstructed: usize,
    pub sleeping: usize,
    pub skipped: usize,
}

/// Full recovery sequence, called once at server start.
pub async fn recover_on_startup(
    config: &SquadronConfig,
    registry: &AgentRegistry,
    github: &dyn GitHubOps,
) -> Result<RecoverySummary> {
    let mut summary = RecoverySummary::default();

    fail_stale_agents(registry, github, &mut summary).await?;

    if let Err(e) = reconstruct_from_issues(config, registry, github, &mut summary).await {
        warn!(error = %e, "Failed to reconstruct from GitHub issues");
    }
    if let Err(e) = reconstruct_from_prs(config, registry, github, &mut summary).await {
        warn!(error = %e, "Failed to reconstruct from GitHub PRs");
    }

    info!(
        failed = summary.failed,
        reconstructed = summary.reconstructed,
        sleeping = summary.sleeping,
        skipped = summary.skipped,
        "Recovery complete"
    );
    Ok(summary)
}

/// Every CREATED or ACTIVE record at boot has lost its subprocess and is
/// unrecoverable.
async fn fail_stale_agents(
    registry: &AgentRegistry,
    github: &dyn GitHubOps,
    summary: &mut RecoverySummary,
) -> Result<()> {
    for status in [AgentStatus::Active, AgentStatus::Created] {
        let stale = registry.by_status(status).await?;
        for mut agent in stale {
            agent.mark_terminal(AgentStatus::Failed);
            registry.update(&mut agent).await?;
            summary.failed += 1;
            warn!(
                agent_id = %agent.agent_id,
                was = %status,
                "Marked stale agent as failed after restart"
            );

            if let Some(issue) = agent.issue_number {
                let body = format!(
                    "**[squadron:{}]** ⚠️ Agent lost due to server restart. \
                     Status changed from {} → failed. \
                     A human may need to re-trigger this work.",
                    agent.role, status
                );
                if let Err(e) = github.comment_on_issue(issue, &body).await {
                    debug!(agent_id = %agent.agent_id, error = %e, "Could not post restart comment");
                }
            }
        }
    }
    Ok(())
}

/// Open issues with managed labels that we have no record for.
async fn reconstruct_from_issues(
    config: &SquadronConfig,
    registry: &AgentRegistry,
    github: &dyn GitHubOps,
    summary: &mut RecoverySummary,
) -> Result<()> {
    let managed = [
        config.labels.in_progress.clone(),
        config.labels.blocked.clone(),
        config.labels.needs_human.clone(),
    ];

    for label in &managed {
        let issues = match github.list_issues(Some(label)).await {
            Ok(issues) => issues,
            Err(e) => {
                warn!(label = %label, error = %e, "Failed to list issues");
                continue;
            }
        };

        for issue in issues {
            let Some(role) = infer_role_from_labels(&issue.labels, config) else {
                debug!(issue = issue.number, labels = ?issue.labels, "Cannot determine role; skipping");
                summary.skipped += 1;
                continue;
            };

            let existing = registry.all_by_issue(issue.number).await?;
            if existing.iter().any(|a| a.role == role) {
                summary.skipped += 1;
                continue;
            }

            let mut record = AgentRecord::new(&role, issue.number);
            record.branch = Some(config.branch_naming.branch_for(&role, issue.number));
            record.blocked_by = extract_blocker_refs(issue.body.as_deref().unwrap_or(""));

            if issue.has_label(&config.labels.blocked) {
                record.mark_sleeping();
                summary.sleeping += 1;
            } else if issue.has_label(&config.labels.needs_human) {
                record.mark_terminal(AgentStatus::Escalated);
                summary.reconstructed += 1;
            } else {
                // in-progress, but there is no session to reattach.
                record.mark_terminal(AgentStatus::Failed);
                summary.reconstructed += 1;
            }

            let status = record.status;
            registry.create(&record).await?;
            info!(
                agent_id = %record.agent_id,
                status = %status,
                issue = issue.number,
                "Reconstructed agent from issue"
            );
        }
    }
    Ok(())
}

/// Open PRs on managed branches without a tracked agent. The agent opened a
/// PR and we lost state: it is waiting on review, so SLEEPING.
async fn reconstruct_from_prs(
    config: &SquadronConfig,
    registry: &AgentRegistry,
    github: &dyn GitHubOps,
    summary: &mut RecoverySummary,
) -> Result<()> {
    let prs = github.list_pull_requests().await?;

    for pr in prs {
        let Some(branch_issue) = branch_issue_number(&pr.head_ref) else {
            continue; // Not a managed branch.
        };

        // An explicit closing reference in the body wins over the branch.
        let issue_number = pr
            .body
            .as_deref()
            .and_then(extract_issue_ref)
            .unwrap_or(branch_issue);

        let Some(role) = infer_role_from_branch(&pr.head_ref, config) else {
            summary.skipped += 1;
            continue;
        };

        let existing = registry.all_by_issue(issue_number).await?;
        if let Some(tracked) = existing.into_iter().find(|a| a.role == role) {
            let mut tracked = tracked;
            if tracked.pr_number.is_none() {
                tracked.pr_number = Some(pr.number);
                registry.update(&mut tracked).await?;
            }
            summary.skipped += 1;
            continue;
        }

        let mut record = AgentRecord::new(&role, issue_number);
        record.pr_number = Some(pr.number);
        record.branch = Some(pr.head_ref.clone());
        record.mark_sleeping();
        registry.create(&record).await?;
        summary.sleeping += 1;
        info!(
            agent_id = %record.agent_id,
            pr = pr.number,
            "Reconstructed sleeping agent from PR"
        );
    }
    Ok(())
}

/// Match issue labels to a configured role: trigger labels first, then a
/// conventional fallback map.
fn infer_role_from_labels(labels: &[String], config: &SquadronConfig) -> Option<String> {
    for (role_name, role) in &config.agent_roles {
        for trigger in &role.triggers {
            if let Some(label) = &trigger.label {
                if labels.iter().any(|l| l == label) {
                    return Some(role_name.clone());
                }
            }
        }
    }

    const LABEL_ROLE_MAP: &[(&str, &str)] = &[
        ("feature", "feat-dev"),
        ("bug", "bug-fix"),
        ("security", "security-review"),
        ("docs", "docs-dev"),
        ("infra", "infra-dev"),
    ];
    for (label, role) in LABEL_ROLE_MAP {
        if labels.iter().any(|l| l == label) && config.agent_roles.contains_key(*role) {
            return Some((*role).to_string());
        }
    }
    None
}

fn infer_role_from_branch(branch: &str, config: &SquadronConfig) -> Option<String> {
    const PREFIX_ROLE_MAP: &[(&str, &str)] = &[
        ("feat/", "feat-dev"),
        ("fix/", "bug-fix"),
        ("security/", "security-review"),
        ("docs/", "docs-dev"),
        ("infra/", "infra-dev"),
        ("hotfix/", "bug-fix"),
    ];
    for (prefix, role) in PREFIX_ROLE_MAP {
        if branch.starts_with(prefix) && config.agent_roles.contains_key(*role) {
            return Some((*role).to_string());
        }
    }
    None
}
