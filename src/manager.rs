//! Agent manager: the lifecycle state machine.
//!
//! CREATED → ACTIVE ↔ SLEEPING → COMPLETED | ESCALATED | FAILED
//!
//! Owns the per-agent runtime (session handle, watchdog timer, turn task),
//! the spawn policy, and the three-layer circuit-breaker enforcement:
//!
//! * layer 1, the in-session hook: counters checked before every turn and
//!   tool call inside the agent loop;
//! * layer 2, the watchdog: a timer armed on every ACTIVE transition for
//!   exactly `max_active_duration`, cancelling the turn without shielding
//!   and running a time-bounded cleanup;
//! * layer 3, the reconciliation sweep, which calls back in through
//!   [`AgentManager::escalate_agent`].
//!
//! Each layer records itself in the escalation it produces so failures of
//! the inner layers are observable.

use crate::config::{SquadronConfig, TriggerAction};
use crate::env_scrub;
use crate::github::GitHubOps;
use crate::models::{AgentRecord, AgentStatus, SquadronEvent, SquadronEventType};
use crate::prompt;
use crate::recovery::{branch_issue_number, extract_issue_ref};
use crate::registry::AgentRegistry;
use crate::router::EventRouter;
use crate::session::{session_id_for, session_id_for_pr, AgentSession, SessionBackend, SessionConfig, SessionError};
use crate::tools::{parse_tool_call, ToolExecutor, ToolOutcome};
use crate::worktree::WorktreeOps;
use anyhow::Result;
use chrono::Utc;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Which enforcement layer tripped a circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnforcementLayer {
    /// Layer 1: the in-session pre-turn/pre-tool hook.
    Session,
    /// Layer 2: the in-process watchdog timer.
    Watchdog,
    /// Layer 3: the reconciliation sweep (also recorded when a cleanup
    /// overruns its budget and is hard-terminated).
    Reconciliation,
}

impl std::fmt::Display for EnforcementLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            EnforcementLayer::Session => "session",
            EnforcementLayer::Watchdog => "watchdog",
            EnforcementLayer::Reconciliation => "reconciliation",
        })
    }
}

/// Canonical per-role cleanup budgets for the cancellation path. This table
/// is the single source; nothing else defines cleanup timeouts.
pub fn cleanup_timeout(role: &str) -> Duration {
    let secs = match role {
        "pr-review" | "security-review" => 60,
        "infra-dev" => 90,
        "feat-dev" => 45,
        _ => 30,
    };
    Duration::from_secs(secs)
}

/// Per-agent in-process runtime. The registry record is the durable state;
/// this is what dies with the process.
struct AgentRuntime {
    session: Arc<Mutex<Box<dyn AgentSession>>>,
    watchdog: Option<JoinHandle<()>>,
    turn_task: Option<JoinHandle<()>>,
}

pub struct AgentManager {
    config: Arc<SquadronConfig>,
    registry: Arc<AgentRegistry>,
    github: Arc<dyn GitHubOps>,
    backend: Arc<dyn SessionBackend>,
    worktrees: Arc<dyn WorktreeOps>,
    tools: ToolExecutor,
    repo_root: PathBuf,
    runtimes: Mutex<HashMap<String, AgentRuntime>>,
    /// Self-handle for spawning watchdog and turn tasks from `&self`.
    me: Weak<AgentManager>,
}

impl AgentManager {
    pub fn new(
        config: Arc<SquadronConfig>,
        registry: Arc<AgentRegistry>,
        github: Arc<dyn GitHubOps>,
        backend: Arc<dyn SessionBackend>,
        worktrees: Arc<dyn WorktreeOps>,
        repo_root: PathBuf,
    ) -> Arc<Self> {
        let tools = ToolExecutor::new(
            Arc::clone(&registry),
            Arc::clone(&github),
            Arc::clone(&config),
        );
        Arc::new_cyclic(|me| Self {
            config,
            registry,
            github,
            backend,
            worktrees,
            tools,
            repo_root,
            runtimes: Mutex::new(HashMap::new()),
            me: me.clone(),
        })
    }

    fn arc(&self) -> Option<Arc<Self>> {
        self.me.upgrade()
    }

    // ── Router wiring ────────────────────────────────────────────────────

    /// Attach lifecycle handlers to the event router.
    pub fn register_handlers(&self, router: &mut EventRouter) {
        let Some(this) = self.arc() else {
            return;
        };
        macro_rules! handler {
            ($event_type:expr, $method:ident) => {{
                let mgr = Arc::clone(&this);
                router.on(
                    $event_type,
                    Arc::new(move |event| -> crate::router::HandlerFuture {
                        let mgr = Arc::clone(&mgr);
                        Box::pin(async move { mgr.$method(event).await })
                    }),
                );
            }};
        }

        handler!(SquadronEventType::IssueLabeled, handle_issue_labeled);
        handler!(SquadronEventType::IssueAssigned, handle_issue_assigned);
        handler!(SquadronEventType::IssueClosed, handle_issue_closed);
        handler!(SquadronEventType::IssueComment, handle_issue_comment);
        handler!(SquadronEventType::PrOpened, handle_pr_opened);
        handler!(SquadronEventType::PrClosed, handle_pr_closed);
        handler!(SquadronEventType::PrLabeled, handle_pr_labeled);
    }

    pub async fn handle_issue_labeled(self: Arc<Self>, event: SquadronEvent) -> Result<()> {
        self.run_triggers("issues.labeled", &event).await
    }

    pub async fn handle_issue_assigned(self: Arc<Self>, event: SquadronEvent) -> Result<()> {
        self.run_triggers("issues.assigned", &event).await
    }

    pub async fn handle_pr_opened(self: Arc<Self>, event: SquadronEvent) -> Result<()> {
        self.run_triggers("pull_request.opened", &event).await
    }

    async fn run_triggers(&self, full_type: &str, event: &SquadronEvent) -> Result<()> {
        let label = event.label_name();
        for (role, action) in self.config.matching_triggers(full_type, label) {
            match action {
                TriggerAction::Spawn => {
                    if let Err(e) = self.spawn_agent(&role, event).await {
                        error!(role = %role, error = %e, "Spawn trigger failed");
                    }
                }
                TriggerAction::Wake => {
                    if let Some(record) = self.record_for_event(event).await {
                        self.wake_agent(&record.agent_id, format!("Woken by `{full_type}` event."))
                            .await;
                    }
                }
                TriggerAction::Sleep => {
                    if let Some(record) = self.record_for_event(event).await {
                        self.sleep_agent(&record.agent_id, &[], "Put to sleep by trigger", false)
                            .await;
                    }
                }
                TriggerAction::Complete => {
                    if let Some(record) = self.record_for_event(event).await {
                        self.complete_agent(&record.agent_id, "Completed by trigger", true)
                            .await;
                    }
                }
            }
        }
        Ok(())
    }

    async fn record_for_event(&self, event: &SquadronEvent) -> Option<AgentRecord> {
        if let Some(issue) = event.issue_number {
            if let Ok(Some(record)) = self.registry.get_by_issue(issue).await {
                return Some(record);
            }
        }
        if let Some(pr) = event.pr_number {
            if let Ok(Some(record)) = self.registry.get_by_pr(pr).await {
                return Some(record);
            }
        }
        None
    }

    /// Issue closed: resolve blocker edges and wake agents whose last
    /// blocker this was. The reconciliation loop is the backstop for
    /// deliveries we miss.
    pub async fn handle_issue_closed(self: Arc<Self>, event: SquadronEvent) -> Result<()> {
        let Some(issue) = event.issue_number else {
            return Ok(());
        };
        let blocked = self.registry.agents_blocked_by(issue).await?;
        for agent in blocked {
            self.registry.remove_blocker(&agent.agent_id, issue).await?;
            let updated = self.registry.get(&agent.agent_id).await?;
            if let Some(updated) = updated {
                if updated.blocked_by.is_empty() {
                    info!(agent_id = %updated.agent_id, issue, "Last blocker resolved; waking");
                    self.wake_agent(
                        &updated.agent_id,
                        format!("Blocker issue #{issue} has been closed. Continue your work."),
                    )
                    .await;
                }
            }
        }
        Ok(())
    }

    /// A comment on a tracked issue is delivered to its agent: wake it if
    /// sleeping, or queue a turn if it is idle-active.
    pub async fn handle_issue_comment(self: Arc<Self>, event: SquadronEvent) -> Result<()> {
        let Some(issue) = event.issue_number else {
            return Ok(());
        };
        let Some(record) = self.registry.get_by_issue(issue).await? else {
            return Ok(());
        };

        let sender = event.sender().unwrap_or("unknown");
        let body = event.comment_body().unwrap_or("");
        let prompt = format!("New comment from {sender} on issue #{issue}:\n\n{body}");

        match record.status {
            AgentStatus::Sleeping => self.wake_agent(&record.agent_id, prompt).await,
            AgentStatus::Active => self.start_turn(&record.agent_id, prompt).await,
            _ => {}
        }
        Ok(())
    }

    /// PR closed. Merged → synthesize completion, which still runs the
    /// agent's cleanup workflow. Closed-unmerged → wake the owner so it can
    /// react.
    pub async fn handle_pr_closed(self: Arc<Self>, event: SquadronEvent) -> Result<()> {
        let Some(pr) = event.pr_number else {
            return Ok(());
        };
        let Some(record) = self.registry.get_by_pr(pr).await? else {
            return Ok(());
        };

        if event.pr_merged() {
            info!(agent_id = %record.agent_id, pr, "PR merged: completing agent");
            self.complete_agent(&record.agent_id, &format!("PR #{pr} was merged."), true)
                .await;
        } else {
            let prompt = format!(
                "PR #{pr} was closed without being merged. Review the feedback and decide \
                 whether to revise or escalate."
            );
            match record.status {
                AgentStatus::Sleeping => self.wake_agent(&record.agent_id, prompt).await,
                AgentStatus::Active => self.start_turn(&record.agent_id, prompt).await,
                _ => {}
            }
        }
        Ok(())
    }

    /// The review fallback path: a reviewer that cannot REQUEST_CHANGES on
    /// a same-bot PR applies the wake label instead, which must wake the
    /// PR's owning agent.
    pub async fn handle_pr_labeled(self: Arc<Self>, event: SquadronEvent) -> Result<()> {
        if event.label_name() != Some(self.config.labels.wake.as_str()) {
            return Ok(());
        }
        let Some(pr) = event.pr_number else {
            return Ok(());
        };
        let Some(record) = self.registry.get_by_pr(pr).await? else {
            debug!(pr, "Wake label on untracked PR");
            return Ok(());
        };

        let prompt = format!(
            "PR #{pr} was labeled `{}`: review feedback requires changes. \
             Push fixes to the existing branch and request re-review: do not open a new PR.",
            self.config.labels.wake
        );
        match record.status {
            AgentStatus::Sleeping => self.wake_agent(&record.agent_id, prompt).await,
            AgentStatus::Active => self.start_turn(&record.agent_id, prompt).await,
            _ => {}
        }
        Ok(())
    }

    // ── Spawn policy ─────────────────────────────────────────────────────

    /// Spawn (or idempotently re-enter) an agent for a trigger event.
    pub async fn spawn_agent(&self, role: &str, event: &SquadronEvent) -> Result<()> {
        if self.config.role(role).is_none() {
            anyhow::bail!("unknown role `{role}`");
        }

        if let Some(issue) = event.issue_number {
            self.spawn_for_issue(role, issue, event).await
        } else if let Some(pr) = event.pr_number {
            self.spawn_for_pr(role, pr, event).await
        } else {
            anyhow::bail!("trigger event carries neither issue nor PR number");
        }
    }

    async fn spawn_for_issue(
        &self,
        role: &str,
        issue: u64,
        event: &SquadronEvent,
    ) -> Result<()> {
        // Idempotent re-entry: one non-terminal record per (role, issue).
        if let Some(existing) = self.registry.get_by_issue(issue).await? {
            if existing.role == role {
                info!(agent_id = %existing.agent_id, "Spawn trigger for already-tracked issue; reusing");
                return Ok(());
            }
        }

        let mut record = AgentRecord::new(role, issue);

        // Adopt an existing open PR for this issue so the agent pushes to
        // its branch instead of opening a duplicate.
        match self.find_existing_pr(issue).await {
            Some(pr) => {
                info!(agent_id = %record.agent_id, pr = pr.0, branch = %pr.1, "Adopting existing PR");
                record.pr_number = Some(pr.0);
                record.branch = Some(pr.1);
            }
            None => {
                record.branch = Some(self.config.branch_naming.branch_for(role, issue));
            }
        }

        self.launch(record, event).await
    }

    async fn spawn_for_pr(
        &self,
        role: &str,
        pr: u64,
        event: &SquadronEvent,
    ) -> Result<()> {
        if let Some(existing) = self.registry.get_by_pr(pr).await? {
            if existing.role == role {
                info!(agent_id = %existing.agent_id, "Spawn trigger for already-tracked PR; reusing");
                return Ok(());
            }
        }

        let mut record = AgentRecord::new_for_pr(role, pr);
        record.branch = event.pr_head_ref().map(String::from);
        self.launch(record, event).await
    }

    /// Scan open PRs for one addressing `issue` via closing keywords or the
    /// `{prefix}/issue-{N}` branch convention.
    async fn find_existing_pr(&self, issue: u64) -> Option<(u64, String)> {
        let prs = match self.github.list_pull_requests().await {
            Ok(prs) => prs,
            Err(e) => {
                warn!(error = %e, "Could not scan open PRs for adoption");
                return None;
            }
        };
        for pr in prs {
            let by_body = pr
                .body
                .as_deref()
                .and_then(extract_issue_ref)
                .is_some_and(|n| n == issue);
            let by_branch = branch_issue_number(&pr.head_ref).is_some_and(|n| n == issue);
            if by_body || by_branch {
                return Some((pr.number, pr.head_ref));
            }
        }
        None
    }

    /// Allocate the workspace, create the record, start the session, and
    /// go ACTIVE with the trigger prompt.
    async fn launch(&self, mut record: AgentRecord, event: &SquadronEvent) -> Result<()> {
        let branch = record
            .branch
            .clone()
            .unwrap_or_else(|| self.config.project.default_branch.clone());

        let worktree = self.worktrees.create(&record.agent_id, &branch).await?;
        record.worktree_path = Some(worktree.to_string_lossy().into_owned());

        let session_id = match record.issue_number {
            Some(issue) => session_id_for(&record.role, issue),
            None => session_id_for_pr(&record.role, record.pr_number.unwrap_or(0)),
        };
        record.session_id = Some(session_id.clone());

        self.registry.create(&record).await?;

        let session_config = self.session_config(&record, &session_id, event)?;
        let session = match self.backend.create_session(session_config).await {
            Ok(session) => session,
            Err(e) => {
                self.fail_agent(&record.agent_id, &format!("session startup failed: {e}"), true)
                    .await;
                return Ok(());
            }
        };

        record.mark_active();
        self.registry.update(&mut record).await?;

        self.install_runtime(&record.agent_id, session).await;
        self.arm_watchdog(&record.agent_id, &record.role).await;

        let prompt = describe_trigger(event, &record);
        self.start_turn(&record.agent_id, prompt).await;
        info!(agent_id = %record.agent_id, role = %record.role, "Agent spawned");
        Ok(())
    }

    fn session_config(
        &self,
        record: &AgentRecord,
        session_id: &str,
        event: &SquadronEvent,
    ) -> Result<SessionConfig> {
        let role_cfg = self
            .config
            .role(&record.role)
            .ok_or_else(|| anyhow::anyhow!("unknown role `{}`", record.role))?;
        let template_path = self.repo_root.join(&role_cfg.agent_definition);
        let template = std::fs::read_to_string(&template_path)?;

        let limits = self.config.circuit_breakers.for_role(&record.role);
        let mut vars: HashMap<&str, String> = HashMap::new();
        vars.insert("project_name", self.config.project.name.clone());
        vars.insert("role", record.role.clone());
        vars.insert("agent_id", record.agent_id.clone());
        vars.insert("base_branch", self.config.project.default_branch.clone());
        vars.insert("max_iterations", limits.max_iterations.to_string());
        vars.insert("max_tool_calls", limits.max_tool_calls.to_string());
        vars.insert("max_turns", limits.max_turns.to_string());
        if let Some(issue) = record.issue_number {
            vars.insert("issue_number", issue.to_string());
        }
        if let Some(branch) = &record.branch {
            vars.insert("branch_name", branch.clone());
        }
        // A trigger-carried PR number must reach the prompt; without it the
        // agent addresses a PR that does not exist.
        if let Some(pr) = record.pr_number.or(event.pr_number) {
            vars.insert("pr_number", pr.to_string());
        }
        if let Some(title) = event.issue_title() {
            vars.insert("issue_title", title.to_string());
        }
        if let Some(body) = event.issue_body() {
            vars.insert("issue_body", body.to_string());
        }

        let system_message = prompt::render(&template, &vars);
        let extra_strip =
            env_scrub::dynamic_strip_vars(self.config.runtime.provider.api_key_env.as_deref());

        Ok(SessionConfig {
            session_id: session_id.to_string(),
            model: self.config.runtime.default_model.clone(),
            system_message,
            working_directory: record
                .worktree_path
                .as_ref()
                .map(PathBuf::from)
                .unwrap_or_else(|| self.repo_root.clone()),
            env: env_scrub::build_agent_env(&extra_strip),
        })
    }

    // ── Runtime plumbing ─────────────────────────────────────────────────

    async fn install_runtime(&self, agent_id: &str, session: Box<dyn AgentSession>) {
        let mut runtimes = self.runtimes.lock().await;
        runtimes.insert(
            agent_id.to_string(),
            AgentRuntime {
                session: Arc::new(Mutex::new(session)),
                watchdog: None,
                turn_task: None,
            },
        );
    }

    /// Arm the layer-2 watchdog for exactly `max_active_duration`.
    async fn arm_watchdog(&self, agent_id: &str, role: &str) {
        let max_active =
            Duration::from_secs(self.config.circuit_breakers.for_role(role).max_active_duration);
        let Some(mgr) = self.arc() else {
            return;
        };
        let id = agent_id.to_string();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(max_active).await;
            mgr.watchdog_fire(&id).await;
        });

        let mut runtimes = self.runtimes.lock().await;
        if let Some(rt) = runtimes.get_mut(agent_id) {
            if let Some(old) = rt.watchdog.replace(handle) {
                old.abort();
            }
        } else {
            handle.abort();
        }
    }

    async fn watchdog_fire(&self, agent_id: &str) {
        let Ok(Some(record)) = self.registry.get(agent_id).await else {
            return;
        };
        if record.status != AgentStatus::Active {
            return;
        }
        warn!(agent_id, role = %record.role, "Watchdog fired: max active duration reached");

        // Detach our own handle so teardown does not abort the running
        // watchdog task mid-cleanup, then cancel the turn without shielding.
        let turn = {
            let mut runtimes = self.runtimes.lock().await;
            runtimes.get_mut(agent_id).and_then(|rt| {
                rt.watchdog = None;
                rt.turn_task.take()
            })
        };
        if let Some(handle) = turn {
            handle.abort();
            let _ = handle.await;
        }

        // Bounded cleanup; overrun is hard-terminated and recorded as a
        // reconciliation-layer enforcement.
        let budget = cleanup_timeout(&record.role);
        let layer = match tokio::time::timeout(budget, self.teardown(agent_id, false)).await {
            Ok(()) => EnforcementLayer::Watchdog,
            Err(_) => {
                warn!(agent_id, "Cleanup overran its budget; hard terminating");
                self.hard_kill(agent_id).await;
                EnforcementLayer::Reconciliation
            }
        };

        self.escalate_agent(
            agent_id,
            "exceeded max active duration",
            "timeout",
            Some(layer),
            false,
        )
        .await;
    }

    /// Start a serial turn. A turn already in flight wins; the new prompt
    /// is dropped with a log (turns never overlap).
    pub async fn start_turn(&self, agent_id: &str, prompt: String) {
        let mut runtimes = self.runtimes.lock().await;
        let Some(rt) = runtimes.get_mut(agent_id) else {
            warn!(agent_id, "No runtime for turn; agent not live in this process");
            return;
        };
        if rt.turn_task.as_ref().is_some_and(|h| !h.is_finished()) {
            warn!(agent_id, "Turn already in flight; dropping prompt");
            return;
        }
        let Some(mgr) = self.arc() else {
            return;
        };
        let id = agent_id.to_string();
        rt.turn_task = Some(tokio::spawn(async move {
            mgr.agent_loop(id, prompt).await;
        }));
    }

    /// The agent conversation loop: send a prompt, dispatch any tool call,
    /// feed the result back, until the agent yields or transitions.
    async fn agent_loop(self: Arc<Self>, agent_id: String, mut next_prompt: String) {
        loop {
            let record = match self.registry.get(&agent_id).await {
                Ok(Some(record)) => record,
                Ok(None) => return,
                Err(e) => {
                    error!(agent_id = %agent_id, error = %e, "Registry read failed in agent loop");
                    return;
                }
            };
            if record.status != AgentStatus::Active {
                return;
            }

            let limits = self.config.circuit_breakers.for_role(&record.role);

            // Layer 1: pre-turn hook.
            if let Some(breach) = limit_breach(&record, &limits) {
                self.escalate_agent(
                    &agent_id,
                    &breach,
                    "circuit-breaker",
                    Some(EnforcementLayer::Session),
                    false,
                )
                .await;
                return;
            }

            // The turn may use at most the remaining active budget.
            let elapsed = record
                .active_since
                .map(|t| (Utc::now() - t).num_seconds().max(0) as u64)
                .unwrap_or(0);
            let turn_timeout =
                Duration::from_secs(limits.max_active_duration.saturating_sub(elapsed).max(1));

            let session = {
                let runtimes = self.runtimes.lock().await;
                runtimes.get(&agent_id).map(|rt| Arc::clone(&rt.session))
            };
            let Some(session) = session else {
                return;
            };

            let reply = {
                let mut guard = session.lock().await;
                guard.send_and_wait(&next_prompt, turn_timeout).await
            };

            let reply = match reply {
                Ok(reply) => reply,
                Err(SessionError::ProcessDied { exit_code, stderr }) => {
                    self.fail_agent(
                        &agent_id,
                        &format!("agent subprocess died (exit code {exit_code:?}): {stderr}"),
                        false,
                    )
                    .await;
                    return;
                }
                Err(SessionError::TurnTimeout(t)) => {
                    self.escalate_agent(
                        &agent_id,
                        &format!("turn exceeded remaining active budget ({t:?})"),
                        "timeout",
                        Some(EnforcementLayer::Session),
                        false,
                    )
                    .await;
                    return;
                }
                Err(e) => {
                    self.fail_agent(&agent_id, &format!("session error: {e}"), false)
                        .await;
                    return;
                }
            };

            if let Ok(Some(mut rec)) = self.registry.get(&agent_id).await {
                rec.turn_count += 1;
                let _ = self.registry.update(&mut rec).await;
            }

            let Some(call) = parse_tool_call(&reply) else {
                // Plain yield: the iteration ends, the agent stays ACTIVE
                // and waits for its next event.
                if let Ok(Some(mut rec)) = self.registry.get(&agent_id).await {
                    rec.iteration_count += 1;
                    let _ = self.registry.update(&mut rec).await;
                }
                debug!(agent_id = %agent_id, "Agent yielded without a tool call");
                return;
            };

            // Layer 1: pre-tool-call hook.
            match self.registry.get(&agent_id).await {
                Ok(Some(mut rec)) => {
                    if rec.tool_call_count >= limits.max_tool_calls {
                        self.escalate_agent(
                            &agent_id,
                            &format!("tool call limit reached ({})", limits.max_tool_calls),
                            "circuit-breaker",
                            Some(EnforcementLayer::Session),
                            false,
                        )
                        .await;
                        return;
                    }
                    rec.tool_call_count += 1;
                    let _ = self.registry.update(&mut rec).await;
                }
                _ => return,
            }

            match self.tools.dispatch(&agent_id, call).await {
                ToolOutcome::Reply(result) => next_prompt = result,
                ToolOutcome::Completed { summary } => {
                    self.complete_agent(&agent_id, &summary, false).await;
                    return;
                }
                ToolOutcome::Blocked { issues, reason } => {
                    self.sleep_agent(&agent_id, &issues, &reason, false).await;
                    return;
                }
                ToolOutcome::Escalated { reason, category } => {
                    self.escalate_agent(&agent_id, &reason, &category, None, false)
                        .await;
                    return;
                }
            }
        }
    }

    // ── Transitions ──────────────────────────────────────────────────────

    /// ACTIVE → SLEEPING. Blocker edges were already recorded by the tool
    /// dispatch; this handles the record, labels, and session handle.
    pub async fn sleep_agent(
        &self,
        agent_id: &str,
        issues: &[u64],
        reason: &str,
        abort_turn: bool,
    ) {
        let Ok(Some(mut record)) = self.registry.get(agent_id).await else {
            return;
        };
        if record.status.is_terminal() {
            return;
        }

        record.mark_sleeping();
        if let Err(e) = self.registry.update(&mut record).await {
            error!(agent_id, error = %e, "Failed to persist sleep transition");
            return;
        }

        if let Some(issue) = record.issue_number {
            let label = self.config.labels.blocked.clone();
            if let Err(e) = self.github.add_labels(issue, &[label]).await {
                warn!(agent_id, error = %e, "Could not apply blocked label");
            }
            let blockers = issues
                .iter()
                .map(|n| format!("#{n}"))
                .collect::<Vec<_>>()
                .join(", ");
            let body = format!(
                "**[squadron:{}]** 💤 Sleeping until {} resolved: {}",
                record.role,
                if blockers.is_empty() { "externally".to_string() } else { blockers },
                reason
            );
            if let Err(e) = self.github.comment_on_issue(issue, &body).await {
                warn!(agent_id, error = %e, "Could not post sleep comment");
            }
        }

        self.teardown(agent_id, abort_turn).await;
        info!(agent_id, blockers = ?issues, "Agent sleeping");
    }

    /// SLEEPING → ACTIVE. The worktree is recreated if it went missing; a
    /// reclaimable filesystem error never fails the wake.
    pub async fn wake_agent(&self, agent_id: &str, wake_prompt: String) {
        let Ok(Some(mut record)) = self.registry.get(agent_id).await else {
            return;
        };
        if record.status != AgentStatus::Sleeping {
            debug!(agent_id, status = %record.status, "Wake requested for non-sleeping agent");
            return;
        }

        let branch = record
            .branch
            .clone()
            .unwrap_or_else(|| self.config.project.default_branch.clone());
        let workdir = match self.worktrees.ensure(agent_id, &branch).await {
            Ok(path) => path,
            Err(e) => {
                warn!(agent_id, error = %e, "Worktree recovery failed; waking in repo root");
                self.repo_root.clone()
            }
        };
        record.worktree_path = Some(workdir.to_string_lossy().into_owned());

        let session_id = record.session_id.clone().unwrap_or_else(|| {
            record
                .issue_number
                .map(|n| session_id_for(&record.role, n))
                .unwrap_or_else(|| session_id_for_pr(&record.role, record.pr_number.unwrap_or(0)))
        });

        let wake_event = SquadronEvent::internal(SquadronEventType::WakeAgent, agent_id);
        let session_config = match self.session_config(&record, &session_id, &wake_event) {
            Ok(cfg) => cfg,
            Err(e) => {
                self.fail_agent(agent_id, &format!("wake failed building session: {e}"), true)
                    .await;
                return;
            }
        };

        let session = match self.backend.resume_session(&session_id, session_config).await {
            Ok(session) => session,
            Err(e) => {
                self.fail_agent(agent_id, &format!("session resume failed: {e}"), true)
                    .await;
                return;
            }
        };

        record.mark_active();
        if let Err(e) = self.registry.update(&mut record).await {
            error!(agent_id, error = %e, "Failed to persist wake transition");
            return;
        }

        self.install_runtime(agent_id, session).await;
        self.arm_watchdog(agent_id, &record.role).await;
        self.start_turn(agent_id, wake_prompt).await;
        info!(agent_id, "Agent woken");
    }

    /// Terminal COMPLETED. Synthesized completions (PR merged) still run
    /// the role's cleanup workflow: the completion comment with the PM
    /// mention is posted before the status flips.
    pub async fn complete_agent(&self, agent_id: &str, summary: &str, abort_turn: bool) {
        let Ok(Some(mut record)) = self.registry.get(agent_id).await else {
            return;
        };
        if record.status.is_terminal() {
            return;
        }

        let body = format!(
            "**[squadron:{role}]** ✅ Work complete: {summary}\n\ncc {mention} pm, please verify and close.",
            role = record.role,
            mention = self.config.bot_mention(),
        );
        let target = record.issue_number.or(record.pr_number);
        if let Some(number) = target {
            if let Err(e) = self.github.comment_on_issue(number, &body).await {
                warn!(agent_id, error = %e, "Could not post completion comment");
            }
        }

        record.mark_terminal(AgentStatus::Completed);
        if let Err(e) = self.registry.update(&mut record).await {
            error!(agent_id, error = %e, "Failed to persist completion");
        }

        self.teardown(agent_id, abort_turn).await;
        if let Some(session_id) = &record.session_id {
            let _ = self.backend.delete_session(session_id).await;
        }
        if let Err(e) = self.worktrees.remove(agent_id).await {
            warn!(agent_id, error = %e, "Worktree removal failed");
        }
        info!(agent_id, "Agent completed");
    }

    /// Terminal ESCALATED: `needs-human` label, an identifying comment, and
    /// (for synthetic escalations) an escalation issue.
    pub async fn escalate_agent(
        &self,
        agent_id: &str,
        reason: &str,
        category: &str,
        layer: Option<EnforcementLayer>,
        abort_turn: bool,
    ) {
        let Ok(Some(mut record)) = self.registry.get(agent_id).await else {
            return;
        };
        if record.status.is_terminal() {
            return;
        }

        let enforced = layer
            .map(|l| format!(" (enforced by: {l})"))
            .unwrap_or_default();
        warn!(agent_id, reason, category, layer = ?layer, "Escalating agent");

        if let Some(issue) = record.issue_number {
            let label = self.config.labels.needs_human.clone();
            if let Err(e) = self.github.add_labels(issue, &[label]).await {
                warn!(agent_id, error = %e, "Could not apply needs-human label");
            }
            let body = format!(
                "**[squadron:{}]** 🚨 Escalated to human ({category}): {reason}{enforced}",
                record.role
            );
            if let Err(e) = self.github.comment_on_issue(issue, &body).await {
                warn!(agent_id, error = %e, "Could not post escalation comment");
            }
        }

        // Synthetic escalations (watchdog, reconciliation) raise a
        // dedicated issue for human attention.
        if layer.is_some() {
            let title = format!("[squadron] Agent {agent_id} {reason}");
            let body = format!(
                "Agent `{agent_id}` (role: {role}) has been escalated.\n\n\
                 **Reason:** {reason}\n\
                 **Category:** {category}\n\
                 **Enforced by:** {layer_name}\n\
                 **Issue:** {issue}\n\
                 **Branch:** {branch}\n\n\
                 The agent has been stopped. Please investigate and take manual action.",
                role = record.role,
                layer_name = layer.map(|l| l.to_string()).unwrap_or_default(),
                issue = record
                    .issue_number
                    .map(|n| format!("#{n}"))
                    .unwrap_or_else(|| "-".to_string()),
                branch = record.branch.as_deref().unwrap_or("-"),
            );
            let labels = vec![self.config.labels.needs_human.clone(), "escalation".to_string()];
            if let Err(e) = self.github.create_issue(&title, &body, &labels).await {
                warn!(agent_id, error = %e, "Could not create escalation issue");
            }
        }

        record.mark_terminal(AgentStatus::Escalated);
        if let Err(e) = self.registry.update(&mut record).await {
            error!(agent_id, error = %e, "Failed to persist escalation");
        }

        self.teardown(agent_id, abort_turn).await;
    }

    /// Terminal FAILED (subprocess death and other unrecoverable errors).
    pub async fn fail_agent(&self, agent_id: &str, cause: &str, abort_turn: bool) {
        let Ok(Some(mut record)) = self.registry.get(agent_id).await else {
            return;
        };
        if record.status.is_terminal() {
            return;
        }
        error!(agent_id, cause, "Agent failed");

        if let Some(issue) = record.issue_number {
            let body = format!(
                "**[squadron:{}]** ⚠️ Agent failed: {cause}\n\nA human may need to re-trigger this work.",
                record.role
            );
            if let Err(e) = self.github.comment_on_issue(issue, &body).await {
                warn!(agent_id, error = %e, "Could not post failure comment");
            }
        }

        record.mark_terminal(AgentStatus::Failed);
        if let Err(e) = self.registry.update(&mut record).await {
            error!(agent_id, error = %e, "Failed to persist failure");
        }
        self.teardown(agent_id, abort_turn).await;
    }

    /// Remove the runtime and destroy the session. `abort_turn` must be
    /// false when called from inside the agent's own turn task.
    async fn teardown(&self, agent_id: &str, abort_turn: bool) {
        let rt = {
            let mut runtimes = self.runtimes.lock().await;
            runtimes.remove(agent_id)
        };
        let Some(mut rt) = rt else {
            return;
        };

        if let Some(watchdog) = rt.watchdog.take() {
            watchdog.abort();
        }
        if abort_turn {
            if let Some(turn) = rt.turn_task.take() {
                turn.abort();
                let _ = turn.await;
            }
        }

        let mut session = rt.session.lock().await;
        if let Err(e) = session.destroy().await {
            warn!(agent_id, error = %e, "Session destroy failed");
        }
    }

    /// Drop the runtime without a polite destroy; `kill_on_drop` reaps the
    /// subprocess.
    async fn hard_kill(&self, agent_id: &str) {
        let mut runtimes = self.runtimes.lock().await;
        if let Some(mut rt) = runtimes.remove(agent_id) {
            if let Some(watchdog) = rt.watchdog.take() {
                watchdog.abort();
            }
            if let Some(turn) = rt.turn_task.take() {
                turn.abort();
            }
        }
    }

    /// Shutdown path: cancel everything, destroy sessions best-effort.
    pub async fn shutdown_all(&self) {
        let ids: Vec<String> = {
            let runtimes = self.runtimes.lock().await;
            runtimes.keys().cloned().collect()
        };
        for id in ids {
            self.teardown(&id, true).await;
        }
        info!("All agent runtimes torn down");
    }

    // ── PM queue consumer ────────────────────────────────────────────────

    /// Drain the PM queue. PM sessions are one-shot per event: created,
    /// prompted, destroyed: the PM carries no conversation state between
    /// triage decisions.
    pub async fn run_pm_consumer(
        self: Arc<Self>,
        mut rx: mpsc::UnboundedReceiver<SquadronEvent>,
        shutdown: watch::Receiver<bool>,
    ) {
        info!("PM queue consumer started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            match tokio::time::timeout(Duration::from_secs(1), rx.recv()).await {
                Err(_) => continue,
                Ok(None) => break,
                Ok(Some(event)) => {
                    if let Err(e) = self.process_pm_event(&event).await {
                        error!(event_type = ?event.event_type, error = %e, "PM event processing failed");
                    }
                }
            }
        }
        info!("PM queue consumer stopped");
    }

    async fn process_pm_event(&self, event: &SquadronEvent) -> Result<()> {
        let Some(pm_role) = self.config.role("pm") else {
            return Ok(());
        };

        let template = std::fs::read_to_string(self.repo_root.join(&pm_role.agent_definition))?;
        let mut vars: HashMap<&str, String> = HashMap::new();
        vars.insert("project_name", self.config.project.name.clone());
        vars.insert("role", "pm".to_string());
        let system_message = prompt::render(&template, &vars);

        let extra_strip =
            env_scrub::dynamic_strip_vars(self.config.runtime.provider.api_key_env.as_deref());
        let session_id = format!("squadron-pm-{}", uuid::Uuid::new_v4());
        let config = SessionConfig {
            session_id: session_id.clone(),
            model: self.config.runtime.default_model.clone(),
            system_message,
            working_directory: self.repo_root.clone(),
            env: env_scrub::build_agent_env(&extra_strip),
        };

        let mut session = self.backend.create_session(config).await?;
        let limits = self.config.circuit_breakers.for_role("pm");
        let turn_timeout = Duration::from_secs(limits.max_active_duration);

        let mut prompt_text = format!(
            "Triage this event.\n\nType: {:?}\nIssue: {}\nPR: {}\nSender: {}\n\nPayload excerpt:\n{}",
            event.event_type,
            event
                .issue_number
                .map(|n| format!("#{n}"))
                .unwrap_or_else(|| "-".to_string()),
            event
                .pr_number
                .map(|n| format!("#{n}"))
                .unwrap_or_else(|| "-".to_string()),
            event.sender().unwrap_or("unknown"),
            pm_payload_excerpt(event),
        );

        let mut result = Ok(());
        for _ in 0..limits.max_turns {
            let reply = match session.send_and_wait(&prompt_text, turn_timeout).await {
                Ok(reply) => reply,
                Err(e) => {
                    result = Err(e.into());
                    break;
                }
            };
            let Some(call) = parse_tool_call(&reply) else {
                break;
            };
            match self.tools.dispatch_pm(call).await {
                ToolOutcome::Reply(text) => prompt_text = text,
                _ => break,
            }
        }

        let _ = session.destroy().await;
        let _ = self.backend.delete_session(&session_id).await;
        result
    }
}

/// Layer-1 counter check run before every turn.
fn limit_breach(record: &AgentRecord, limits: &crate::config::BreakerLimits) -> Option<String> {
    if record.turn_count >= limits.max_turns {
        return Some(format!("turn limit reached ({})", limits.max_turns));
    }
    if record.tool_call_count >= limits.max_tool_calls {
        return Some(format!("tool call limit reached ({})", limits.max_tool_calls));
    }
    if record.iteration_count >= limits.max_iterations {
        return Some(format!("iteration limit reached ({})", limits.max_iterations));
    }
    None
}

/// The first user prompt for a freshly spawned agent.
fn describe_trigger(event: &SquadronEvent, record: &AgentRecord) -> String {
    let mut lines = Vec::new();
    match record.issue_number {
        Some(issue) => {
            lines.push(format!("You have been assigned issue #{issue}."));
            // A pr_number set at creation means an open PR was adopted: the
            // agent must learn up front not to open a duplicate.
            if let Some(pr) = record.pr_number {
                lines.push(format!(
                    "An open pull request for this issue already exists: #{pr}. \
                     Push your commits to its branch and request re-review; \
                     do not open a new PR."
                ));
            }
        }
        None => {
            if let Some(pr) = record.pr_number {
                lines.push(format!("You have been assigned pull request #{pr}."));
            }
        }
    }
    if let Some(branch) = &record.branch {
        lines.push(format!("Branch: `{branch}`"));
    }
    if let Some(title) = event.issue_title().or_else(|| event.pr_title()) {
        lines.push(format!("\nTitle: {title}"));
    }
    if let Some(body) = event.issue_body().or_else(|| event.pr_body()) {
        lines.push(format!("\n{body}"));
    }
    lines.push(
        "\nWhen you are done, call report_complete; if blocked, call report_blocked; \
         if you cannot proceed, call escalate_to_human."
            .to_string(),
    );
    lines.join("\n")
}

fn pm_payload_excerpt(event: &SquadronEvent) -> String {
    let title = event.issue_title().or_else(|| event.pr_title()).unwrap_or("");
    let body = event
        .issue_body()
        .or_else(|| event.pr_body())
        .or_else(|| event.comment_body())
        .unwrap_or("");
    let mut excerpt = format!("{title}\n{body}");
    if excerpt.len() > 2000 {
        excerpt.truncate(2000);
    }
    excerpt
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cleanup_timeouts_are_role_specific() {
        assert_eq!(cleanup_timeout("pr-review"), Duration::from_secs(60));
        assert_eq!(cleanup_timeout("security-review"), Duration::from_secs(60));
        assert_eq!(cleanup_timeout("infra-dev"), Duration::from_secs(90));
        assert_eq!(cleanup_timeout("feat-dev"), Duration::from_secs(45));
        assert_eq!(cleanup_timeout("pm"), Duration::from_secs(30));
    }

    #[test]
    fn limit_breach_checks_all_counters() {
        let limits = crate::config::BreakerLimits {
            max_turns: 2,
            max_tool_calls: 3,
            max_iterations: 1,
            ..Default::default()
        };
        let mut record = AgentRecord::new("feat-dev", 1);
        assert!(limit_breach(&record, &limits).is_none());

        record.turn_count = 2;
        assert!(limit_breach(&record, &limits).unwrap().contains("turn limit"));

        record.turn_count = 0;
        record.tool_call_count = 3;
        assert!(limit_breach(&record, &limits).unwrap().contains("tool call limit"));

        record.tool_call_count = 0;
        record.iteration_count = 1;
        assert!(limit_breach(&record, &limits).unwrap().contains("iteration limit"));
    }
}
