use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

/// Initialize structured JSON logging. `RUST_LOG` overrides the default
/// `info` level.
pub fn init_telemetry() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(true)
                .with_span_list(true),
        )
        .with(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    tracing::info!("Squadron telemetry initialized with structured logging");
    Ok(())
}

/// Correlation ID for linking related operations across components.
pub fn generate_correlation_id() -> String {
    Uuid::new_v4().to_string()
}

/// Span carrying the common agent-orchestration attributes.
pub fn create_agent_span(
    operation: &str,
    agent_id: Option<&str>,
    issue_number: Option<u64>,
) -> tracing::Span {
    tracing::info_span!(
        "agent_lifecycle",
        operation = operation,
        agent.id = agent_id,
        issue.number = issue_number,
    )
}
