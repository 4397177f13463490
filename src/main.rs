use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "squadron", about = "GitHub-native orchestrator for LLM-backed agents")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Scaffold a .squadron/ directory with default configuration
    Init {
        /// Path to the repository root
        #[arg(long, default_value = ".")]
        repo_root: PathBuf,
    },
    /// Start the webhook server
    Serve {
        /// Path to the repository root
        #[arg(long, default_value = ".")]
        repo_root: PathBuf,
        /// Host to bind (overrides config)
        #[arg(long)]
        host: Option<String>,
        /// Port to bind (overrides config)
        #[arg(long)]
        port: Option<u16>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Init { repo_root } => init_project(&repo_root),
        Commands::Serve {
            repo_root,
            host,
            port,
        } => {
            squadron::init_telemetry()?;
            squadron::server::run(&repo_root, host, port).await
        }
    }
}

const DEFAULT_CONFIG: &str = r#"# .squadron/squadron.toml: Squadron project configuration

[project]
name = "squadron"
owner = ""
repo = ""
default_branch = "main"

[server]
host = "0.0.0.0"
port = 8000
rate_limit_per_minute = 120
queue_capacity = 1024

[branch_naming]
feature = "feat/issue-{issue_number}"
bugfix = "fix/issue-{issue_number}"
security = "security/issue-{issue_number}"
docs = "docs/issue-{issue_number}"
infra = "infra/issue-{issue_number}"

[circuit_breakers.defaults]
max_iterations = 5
max_tool_calls = 200
max_turns = 50
max_active_duration = 7200
max_sleep_duration = 86400
warning_threshold = 0.8

[runtime]
default_model = "claude-sonnet-4"
reconciliation_interval = 300
dedup_retention_hours = 72
cli_path = "copilot"
data_dir = ".squadron-data"

[runtime.provider]
type = "anthropic"
api_key_env = "ANTHROPIC_API_KEY"

[agent_roles.pm]
agent_definition = ".squadron/agents/pm.md"
singleton = true

[agent_roles.feat-dev]
agent_definition = ".squadron/agents/feat-dev.md"
assignable_labels = ["feature"]
triggers = [{ event = "issues.labeled", label = "feature" }]

[agent_roles.bug-fix]
agent_definition = ".squadron/agents/bug-fix.md"
assignable_labels = ["bug"]
triggers = [{ event = "issues.labeled", label = "bug" }]

[agent_roles.pr-review]
agent_definition = ".squadron/agents/pr-review.md"
triggers = [{ event = "pull_request.opened" }]

[agent_roles.security-review]
agent_definition = ".squadron/agents/security-review.md"
triggers = [{ event = "issues.labeled", label = "security" }]

[commands.help]
enabled = true
response = "Available commands: help, status. Label an issue to dispatch an agent."

[human_groups]
maintainers = []
"#;

const PM_TEMPLATE: &str = r#"# PM Agent: {project_name}

You are the Project Manager agent for {project_name}. Triage incoming
issues, classify them by type and priority, assign them to the appropriate
agent roles, and monitor overall project health.

Tools: create_issue, assign_issue, label_issue, comment_on_issue,
check_registry, read_issue.

Constraints:
- Never modify code directly.
- Always label issues before assigning.
- Escalate ambiguous requirements to humans.
"#;

const FEAT_DEV_TEMPLATE: &str = r#"# Feature Development Agent: {project_name}

You implement the feature described in issue #{issue_number}: {issue_title}

Work on branch `{branch_name}` (base: `{base_branch}`).
You have at most {max_iterations} iterations and {max_tool_calls} tool calls.

Constraints:
- Open a PR when the implementation is complete, then call report_complete.
- If blocked on other work, call report_blocked.
- Run tests before submitting the PR.
- Follow the existing code style.
"#;

const BUG_FIX_TEMPLATE: &str = r#"# Bug Fix Agent: {project_name}

You fix the bug described in issue #{issue_number}: {issue_title}

Work on branch `{branch_name}` (base: `{base_branch}`).

Constraints:
- Write a regression test before fixing.
- Open a PR when the fix is complete, then call report_complete.
- At most {max_iterations} iterations.
"#;

const PR_REVIEW_TEMPLATE: &str = r#"# PR Review Agent: {project_name}

Review pull request #{pr_number} for correctness, style, test coverage,
and potential issues.

Constraints:
- Approve, request changes, or comment.
- If the host refuses a self-review, apply the `needs-changes` label instead.
- Do not push commits to the PR branch.
"#;

const SECURITY_REVIEW_TEMPLATE: &str = r#"# Security Review Agent: {project_name}

Review the change for issue #{issue_number} for security vulnerabilities,
dependency issues, and unsafe patterns.

Constraints:
- Focus only on security concerns.
- Escalate critical findings immediately via escalate_to_human.
- Do not push commits to the PR branch.
"#;

fn init_project(repo_root: &PathBuf) -> Result<()> {
    let squadron_dir = repo_root.join(".squadron");
    if squadron_dir.exists() {
        anyhow::bail!(
            "{} already exists; remove it first to re-initialize",
            squadron_dir.display()
        );
    }

    let agents_dir = squadron_dir.join("agents");
    std::fs::create_dir_all(&agents_dir)?;
    std::fs::write(squadron_dir.join("squadron.toml"), DEFAULT_CONFIG)?;

    for (name, template) in [
        ("pm.md", PM_TEMPLATE),
        ("feat-dev.md", FEAT_DEV_TEMPLATE),
        ("bug-fix.md", BUG_FIX_TEMPLATE),
        ("pr-review.md", PR_REVIEW_TEMPLATE),
        ("security-review.md", SECURITY_REVIEW_TEMPLATE),
    ] {
        std::fs::write(agents_dir.join(name), template)?;
    }

    println!("Initialized Squadron project at {}", squadron_dir.display());
    println!();
    println!("Next steps:");
    println!("  1. Fill in project.owner and project.repo in .squadron/squadron.toml");
    println!("  2. Add maintainer logins to human_groups.maintainers");
    println!("  3. Export GITHUB_TOKEN and GITHUB_WEBHOOK_SECRET");
    println!("  4. Run: squadron serve --repo-root {}", repo_root.display());
    Ok(())
}
