//! Event router: the single consumer between the raw webhook queue and the
//! rest of the engine.
//!
//! Single-consumer on purpose: arrival order is preserved so the bot
//! self-event filter and registry writes stay deterministic. Everything
//! here is sequential; fan-out targets (PM queue, typed handlers) do their
//! own work on their own tasks.

use crate::config::SquadronConfig;
use crate::github::GitHubOps;
use crate::models::{classify, GitHubEvent, SquadronEvent, SquadronEventType};
use crate::registry::AgentRegistry;
use anyhow::Result;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<()>> + Send>>;
pub type EventHandler = Arc<dyn Fn(SquadronEvent) -> HandlerFuture + Send + Sync>;

/// Events the PM sees for triage and awareness.
const PM_EVENTS: &[SquadronEventType] = &[
    SquadronEventType::IssueOpened,
    SquadronEventType::IssueClosed,
    SquadronEventType::IssueComment,
    SquadronEventType::IssueLabeled,
    SquadronEventType::PrOpened,
    SquadronEventType::PrSynchronized,
    SquadronEventType::PrReviewSubmitted,
];

pub struct EventRouter {
    registry: Arc<AgentRegistry>,
    config: Arc<SquadronConfig>,
    github: Arc<dyn GitHubOps>,
    bot_username: String,
    handlers: HashMap<SquadronEventType, Vec<EventHandler>>,
    pm_tx: mpsc::UnboundedSender<SquadronEvent>,
}

impl EventRouter {
    /// Returns the router and the PM queue receiver.
    pub fn new(
        registry: Arc<AgentRegistry>,
        config: Arc<SquadronConfig>,
        github: Arc<dyn GitHubOps>,
    ) -> (Self, mpsc::UnboundedReceiver<SquadronEvent>) {
        let (pm_tx, pm_rx) = mpsc::unbounded_channel();
        let bot_username = config.bot_username();
        (
            Self {
                registry,
                config,
                github,
                bot_username,
                handlers: HashMap::new(),
                pm_tx,
            },
            pm_rx,
        )
    }

    /// Register a typed handler. All registration happens during wiring,
    /// before the consumer loop starts.
    pub fn on(&mut self, event_type: SquadronEventType, handler: EventHandler) {
        self.handlers.entry(event_type).or_default().push(handler);
    }

    /// Consumer loop. The queue wait uses a short periodic timeout so the
    /// task stays cancellable via the shutdown signal.
    pub async fn run(
        self,
        mut rx: mpsc::Receiver<GitHubEvent>,
        shutdown: watch::Receiver<bool>,
    ) {
        info!("Event router started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            match tokio::time::timeout(Duration::from_secs(1), rx.recv()).await {
                Err(_) => continue,
                Ok(None) => break,
                Ok(Some(event)) => {
                    let delivery_id = event.delivery_id.clone();
                    if let Err(e) = self.route(&event).await {
                        error!(delivery_id = %delivery_id, error = %e, "Error routing event");
                    }
                }
            }
        }
        info!("Event router stopped");
    }

    /// Route one raw event: self-filter, dedup, allowlist, classify,
    /// command detection, fan-out.
    pub async fn route(&self, event: &GitHubEvent) -> Result<()> {
        let full_type = event.full_type();

        // 1. Bot self-event filter: the bot reacting to its own comments,
        //    labels, and PRs would storm.
        if event.sender() == Some(self.bot_username.as_str()) {
            debug!(full_type = %full_type, "Filtered bot self-event");
            return Ok(());
        }

        // 2. Deduplication by delivery ID, persisted before any dispatch.
        if self.registry.has_seen_event(&event.delivery_id).await? {
            debug!(delivery_id = %event.delivery_id, "Duplicate delivery filtered");
            return Ok(());
        }
        self.registry
            .mark_event_seen(&event.delivery_id, &full_type)
            .await?;

        // 3. Maintainer allowlist. An empty list locks the instance down.
        if let Some(sender) = event.sender() {
            if !self.config.is_maintainer(sender) {
                debug!(sender = %sender, full_type = %full_type, "Sender not in maintainers; dropped");
                return Ok(());
            }
        }

        // 4. Classification.
        let Some(internal_type) = classify(&full_type) else {
            debug!(full_type = %full_type, "Unhandled event type");
            return Ok(());
        };

        // 5. Command detection on issue comments: `@bot <word>`.
        if internal_type == SquadronEventType::IssueComment
            && self.answer_static_command(event).await
        {
            return Ok(());
        }

        // 6. Normalize and fan out.
        let squadron_event = SquadronEvent::from_github(event, internal_type);
        self.dispatch(squadron_event).await;
        Ok(())
    }

    /// Answer a disabled/static-response command directly. Returns true if
    /// the event was consumed and must not be routed further.
    async fn answer_static_command(&self, event: &GitHubEvent) -> bool {
        let Some(body) = event.comment_body() else {
            return false;
        };
        let mention = self.config.bot_mention();
        let Some(rest) = body.trim_start().strip_prefix(mention.as_str()) else {
            return false;
        };
        let Some(command) = rest.split_whitespace().next() else {
            return false;
        };
        let Some(cmd) = self.config.commands.get(command) else {
            return false;
        };

        if cmd.enabled && cmd.response.is_none() {
            // An agent-invoking command; routed like any comment.
            return false;
        }

        let response = cmd
            .response
            .clone()
            .unwrap_or_else(|| format!("Command `{command}` is disabled."));
        if let Some(issue) = event.issue_number() {
            if let Err(e) = self.github.comment_on_issue(issue, &response).await {
                warn!(issue, command, error = %e, "Failed to answer command");
            } else {
                info!(issue, command, "Answered static command");
            }
        }
        true
    }

    /// Deterministic fan-out order: PM queue first, then typed handlers in
    /// registration order.
    async fn dispatch(&self, event: SquadronEvent) {
        info!(
            event_type = ?event.event_type,
            issue = ?event.issue_number,
            pr = ?event.pr_number,
            "Dispatching event"
        );

        if PM_EVENTS.contains(&event.event_type) {
            if self.pm_tx.send(event.clone()).is_err() {
                warn!("PM queue receiver dropped");
            }
        }

        if let Some(handlers) = self.handlers.get(&event.event_type) {
            for handler in handlers {
                if let Err(e) = handler(event.clone()).await {
                    error!(event_type = ?event.event_type, error = %e, "Handler error");
                }
            }
        }
    }
}
