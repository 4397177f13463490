//! Reconciliation loop: periodic drift check between the registry and
//! GitHub's durable state.
//!
//! Catches webhooks missed while the server was down (closed blockers) and
//! is circuit-breaker enforcement layer 3: agents whose in-session hook and
//! watchdog both failed are escalated here. Every step is best-effort per
//! agent: one bad agent never aborts the pass.

use crate::config::SquadronConfig;
use crate::github::GitHubOps;
use crate::manager::{AgentManager, EnforcementLayer};
use crate::models::AgentStatus;
use crate::registry::AgentRegistry;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

pub struct ReconciliationLoop {
    config: Arc<SquadronConfig>,
    registry: Arc<AgentRegistry>,
    github: Arc<dyn GitHubOps>,
    manager: Arc<AgentManager>,
    interval: Duration,
}

impl ReconciliationLoop {
    pub fn new(
        config: Arc<SquadronConfig>,
        registry: Arc<AgentRegistry>,
        github: Arc<dyn GitHubOps>,
        manager: Arc<AgentManager>,
    ) -> Self {
        let interval = Duration::from_secs(config.runtime.reconciliation_interval);
        Self {
            config,
            registry,
            github,
            manager,
            interval,
        }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(interval_secs = self.interval.as_secs(), "Reconciliation loop started");
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {
                    self.reconcile().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("Reconciliation loop stopped");
    }

    /// One reconciliation pass.
    pub async fn reconcile(&self) {
        debug!("Reconciliation pass starting");

        self.check_sleeping_agents().await;
        self.check_stale_active_agents().await;

        let retention = chrono::Duration::hours(self.config.runtime.dedup_retention_hours as i64);
        match self.registry.prune_old_events(retention).await {
            Ok(0) => {}
            Ok(pruned) => info!(pruned, "Pruned old seen_events entries"),
            Err(e) => debug!(error = %e, "Failed to prune seen_events"),
        }

        debug!("Reconciliation pass complete");
    }

    /// SLEEPING agents: escalate oversleepers, clear externally-resolved
    /// blockers, wake agents whose last blocker is gone.
    async fn check_sleeping_agents(&self) {
        let sleeping = match self.registry.by_status(AgentStatus::Sleeping).await {
            Ok(agents) => agents,
            Err(e) => {
                error!(error = %e, "Could not list sleeping agents");
                return;
            }
        };

        for agent in sleeping {
            let limits = self.config.circuit_breakers.for_role(&agent.role);

            if let Some(since) = agent.sleeping_since {
                let slept = (Utc::now() - since).num_seconds().max(0) as u64;
                if slept > limits.max_sleep_duration {
                    warn!(
                        agent_id = %agent.agent_id,
                        slept_secs = slept,
                        limit_secs = limits.max_sleep_duration,
                        "Agent exceeded max sleep duration; escalating"
                    );
                    self.manager
                        .escalate_agent(
                            &agent.agent_id,
                            "exceeded max sleep duration",
                            "timeout",
                            Some(EnforcementLayer::Reconciliation),
                            true,
                        )
                        .await;
                    continue;
                }
            }

            if agent.blocked_by.is_empty() {
                // Sleeping with no blockers: waiting on review or an
                // inconsistency; the wake triggers own this case.
                debug!(agent_id = %agent.agent_id, "Sleeping with no blockers");
                continue;
            }

            // Query GitHub per blocker: this is what catches webhooks
            // missed while the server was down.
            for blocker in agent.blocked_by.clone() {
                match self.github.get_issue(blocker).await {
                    Ok(issue) if issue.is_closed() => {
                        info!(
                            agent_id = %agent.agent_id,
                            blocker,
                            "Reconciliation found closed blocker"
                        );
                        if let Err(e) =
                            self.registry.remove_blocker(&agent.agent_id, blocker).await
                        {
                            warn!(agent_id = %agent.agent_id, error = %e, "Could not remove blocker");
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        debug!(
                            agent_id = %agent.agent_id,
                            blocker,
                            error = %e,
                            "Could not check blocker"
                        );
                    }
                }
            }

            match self.registry.get(&agent.agent_id).await {
                Ok(Some(updated)) if updated.blocked_by.is_empty() => {
                    info!(agent_id = %updated.agent_id, "All blockers resolved; waking");
                    self.manager
                        .wake_agent(
                            &updated.agent_id,
                            "All blocking issues have been resolved. Continue your work."
                                .to_string(),
                        )
                        .await;
                }
                Ok(_) => {}
                Err(e) => warn!(agent_id = %agent.agent_id, error = %e, "Registry re-read failed"),
            }
        }
    }

    /// ACTIVE agents past their budget: layer-3 enforcement.
    async fn check_stale_active_agents(&self) {
        let active = match self.registry.by_status(AgentStatus::Active).await {
            Ok(agents) => agents,
            Err(e) => {
                error!(error = %e, "Could not list active agents");
                return;
            }
        };

        for agent in active {
            let Some(since) = agent.active_since else {
                continue;
            };
            let limits = self.config.circuit_breakers.for_role(&agent.role);
            let active_secs = (Utc::now() - since).num_seconds().max(0) as u64;

            let warning_at =
                (limits.max_active_duration as f64 * limits.warning_threshold) as u64;
            if active_secs > warning_at && active_secs < limits.max_active_duration {
                warn!(
                    agent_id = %agent.agent_id,
                    active_secs,
                    limit_secs = limits.max_active_duration,
                    "Agent approaching max active duration"
                );
            }

            if active_secs > limits.max_active_duration {
                error!(
                    agent_id = %agent.agent_id,
                    active_secs,
                    limit_secs = limits.max_active_duration,
                    "Agent exceeded max active duration; escalating"
                );
                self.manager
                    .escalate_agent(
                        &agent.agent_id,
                        "exceeded max active duration",
                        "timeout",
                        Some(EnforcementLayer::Reconciliation),
                        true,
                    )
                    .await;
            }
        }
    }
}
