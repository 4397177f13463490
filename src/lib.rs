// Squadron: GitHub-native orchestration of LLM-backed agent fleets.
// This exposes the core components for testing and integration.

pub mod config;
pub mod env_scrub;
pub mod github;
pub mod manager;
pub mod models;
pub mod prompt;
pub mod reconciliation;
pub mod recovery;
pub mod registry;
pub mod router;
pub mod server;
pub mod session;
pub mod shutdown;
pub mod telemetry;
pub mod tools;
pub mod webhook;
pub mod worktree;

// Re-export key types for easy access
pub use config::{BreakerLimits, SquadronConfig, TriggerAction};
pub use github::{GhIssue, GhPullRequest, GitHubClient, GitHubError, GitHubOps, ReviewVerdict};
pub use manager::{cleanup_timeout, AgentManager, EnforcementLayer};
pub use models::{
    classify, AgentRecord, AgentStatus, GitHubEvent, SquadronEvent, SquadronEventType,
};
pub use reconciliation::ReconciliationLoop;
pub use recovery::{recover_on_startup, RecoverySummary};
pub use registry::{AgentRegistry, RegistryError};
pub use router::EventRouter;
pub use session::{AgentSession, CliBackend, SessionBackend, SessionConfig, SessionError};
pub use shutdown::ShutdownCoordinator;
pub use telemetry::init_telemetry;
pub use tools::{parse_tool_call, ToolCall, ToolExecutor, ToolOutcome};
pub use webhook::WebhookState;
pub use worktree::{GitWorktrees, WorktreeOps};
