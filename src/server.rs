//! Composition root.
//!
//! Builds the explicit context (no global mutable registries) and wires
//! the startup order: config, telemetry, data-dir lock, registry, GitHub
//! client, recovery, manager and router, reconciliation, then HTTP.
//! Recovery runs to completion before the router accepts any traffic.

use crate::config::SquadronConfig;
use crate::github::{GitHubClient, GitHubOps};
use crate::manager::AgentManager;
use crate::models::GitHubEvent;
use crate::reconciliation::ReconciliationLoop;
use crate::recovery;
use crate::registry::AgentRegistry;
use crate::router::EventRouter;
use crate::session::CliBackend;
use crate::shutdown::ShutdownCoordinator;
use crate::webhook::{self, WebhookState};
use crate::worktree::GitWorktrees;
use anyhow::{Context, Result};
use std::future::IntoFuture;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};

pub async fn run(repo_root: &Path, host: Option<String>, port: Option<u16>) -> Result<()> {
    SquadronConfig::load_env_file();
    let config = Arc::new(SquadronConfig::load(repo_root)?);

    let data_dir = config.data_dir(repo_root);
    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("cannot create data dir {}", data_dir.display()))?;

    // One instance per data dir; a second `squadron serve` must refuse to
    // start rather than fight over the registry and worktrees.
    let lock_file = std::fs::OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(data_dir.join(".lock"))?;
    let mut instance_lock = fd_lock::RwLock::new(lock_file);
    let _lock_guard = instance_lock
        .try_write()
        .context("another squadron instance already holds this data directory")?;

    let registry = Arc::new(AgentRegistry::open(&data_dir.join("registry.db")).await?);

    let token = SquadronConfig::github_token()?;
    let github: Arc<dyn GitHubOps> = Arc::new(GitHubClient::new(
        token,
        config.project.owner.clone(),
        config.project.repo.clone(),
    )?);

    // Reconstruct from GitHub truth before any event is consumed.
    let summary = recovery::recover_on_startup(&config, &registry, github.as_ref()).await?;
    info!(
        failed = summary.failed,
        reconstructed = summary.reconstructed,
        sleeping = summary.sleeping,
        "Startup recovery finished"
    );

    let backend = Arc::new(CliBackend::new(&config.runtime.cli_path));
    let worktrees = Arc::new(GitWorktrees::new(repo_root, &data_dir));
    let manager = AgentManager::new(
        Arc::clone(&config),
        Arc::clone(&registry),
        Arc::clone(&github),
        backend,
        worktrees,
        repo_root.to_path_buf(),
    );

    let (mut router, pm_rx) = EventRouter::new(
        Arc::clone(&registry),
        Arc::clone(&config),
        Arc::clone(&github),
    );
    manager.register_handlers(&mut router);

    let shutdown = ShutdownCoordinator::new();

    let (event_tx, event_rx) = mpsc::channel::<GitHubEvent>(config.server.queue_capacity);
    let router_task = tokio::spawn(router.run(event_rx, shutdown.subscribe()));
    let pm_task = tokio::spawn(Arc::clone(&manager).run_pm_consumer(pm_rx, shutdown.subscribe()));

    let reconciliation = ReconciliationLoop::new(
        Arc::clone(&config),
        Arc::clone(&registry),
        Arc::clone(&github),
        Arc::clone(&manager),
    );
    let reconciliation_task = tokio::spawn(reconciliation.run(shutdown.subscribe()));

    let secret = config
        .server
        .webhook_secret
        .clone()
        .context("server.webhook_secret (or GITHUB_WEBHOOK_SECRET) must be set")?;
    let state = Arc::new(WebhookState::new(
        event_tx,
        secret,
        config.server.installation_id,
        Some(config.repo_full_name()),
        config.server.rate_limit_per_minute,
    ));
    let app = webhook::router(state);

    let bind_host = host.unwrap_or_else(|| config.server.host.clone());
    let bind_port = port.unwrap_or(config.server.port);
    let listener = tokio::net::TcpListener::bind((bind_host.as_str(), bind_port))
        .await
        .with_context(|| format!("cannot bind {bind_host}:{bind_port}"))?;
    info!(host = %bind_host, port = bind_port, "Webhook server listening");

    let mut server_shutdown = shutdown.subscribe();
    let serve = tokio::spawn(
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = server_shutdown.changed().await;
            })
            .into_future(),
    );

    tokio::select! {
        result = serve => {
            if let Ok(Err(e)) = result {
                warn!(error = %e, "HTTP server error");
            }
        }
        _ = shutdown.wait_for_signal() => {}
    }

    info!("Shutting down");
    shutdown.trigger();
    manager.shutdown_all().await;

    for (name, task) in [
        ("router", router_task),
        ("pm-consumer", pm_task),
        ("reconciliation", reconciliation_task),
    ] {
        if tokio::time::timeout(std::time::Duration::from_secs(5), task)
            .await
            .is_err()
        {
            warn!(task = name, "Task did not stop in time");
        }
    }

    registry.close().await;
    info!("Shutdown complete");
    Ok(())
}
