//! Squadron configuration, loaded from `.squadron/squadron.toml` with
//! environment overrides (prefix `SQUADRON`).
//!
//! Config or schema failures at load are fatal: the server refuses to start
//! rather than run with guessed settings.

use anyhow::{bail, Context, Result};
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct SquadronConfig {
    #[serde(default)]
    pub project: ProjectConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub agent_roles: HashMap<String, RoleConfig>,
    #[serde(default)]
    pub branch_naming: BranchNamingConfig,
    #[serde(default)]
    pub circuit_breakers: CircuitBreakerConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub labels: LabelsConfig,
    #[serde(default)]
    pub commands: HashMap<String, CommandConfig>,
    #[serde(default)]
    pub human_groups: HumanGroupsConfig,
}

/// GitHub target repository.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProjectConfig {
    pub name: String,
    pub owner: String,
    pub repo: String,
    pub default_branch: String,
}

impl Default for ProjectConfig {
    fn default() -> Self {
        Self {
            name: "squadron".to_string(),
            owner: String::new(),
            repo: String::new(),
            default_branch: "main".to_string(),
        }
    }
}

/// Webhook server settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// HMAC secret; falls back to `GITHUB_WEBHOOK_SECRET` at load.
    pub webhook_secret: Option<String>,
    /// When set, payloads from other installations are rejected (403).
    pub installation_id: Option<u64>,
    /// Per-sender webhook rate limit. 0 disables.
    pub rate_limit_per_minute: u32,
    /// Bound of the raw-event queue between receiver and router.
    pub queue_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
            webhook_secret: None,
            installation_id: None,
            rate_limit_per_minute: 120,
            queue_capacity: 1024,
        }
    }
}

/// What an agent role is wired to.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RoleConfig {
    /// Path to the role's prompt template, relative to the repo root.
    pub agent_definition: String,
    #[serde(default)]
    pub triggers: Vec<TriggerConfig>,
    /// Singleton roles (the PM) never get per-issue instances.
    #[serde(default)]
    pub singleton: bool,
    #[serde(default)]
    pub assignable_labels: Vec<String>,
}

/// A `(event, filters, action)` tuple that spawns, wakes, sleeps, or
/// completes an agent.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TriggerConfig {
    /// Full event type, e.g. `issues.labeled` or `pull_request.opened`.
    pub event: String,
    pub label: Option<String>,
    #[serde(default)]
    pub action: TriggerAction,
    pub condition: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerAction {
    #[default]
    Spawn,
    Wake,
    Sleep,
    Complete,
}

/// Branch name templates; each must contain `{issue_number}`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BranchNamingConfig {
    pub feature: String,
    pub bugfix: String,
    pub security: String,
    pub docs: String,
    pub infra: String,
}

impl Default for BranchNamingConfig {
    fn default() -> Self {
        Self {
            feature: "feat/issue-{issue_number}".to_string(),
            bugfix: "fix/issue-{issue_number}".to_string(),
            security: "security/issue-{issue_number}".to_string(),
            docs: "docs/issue-{issue_number}".to_string(),
            infra: "infra/issue-{issue_number}".to_string(),
        }
    }
}

impl BranchNamingConfig {
    /// Template for a role; unknown roles fall back to `{role}/issue-{n}`.
    pub fn template_for_role(&self, role: &str) -> String {
        match role {
            "feat-dev" => self.feature.clone(),
            "bug-fix" => self.bugfix.clone(),
            "security-review" => self.security.clone(),
            "docs-dev" => self.docs.clone(),
            "infra-dev" => self.infra.clone(),
            other => format!("{other}/issue-{{issue_number}}"),
        }
    }

    pub fn branch_for(&self, role: &str, issue_number: u64) -> String {
        self.template_for_role(role)
            .replace("{issue_number}", &issue_number.to_string())
    }
}

/// Hard bounds on a single agent. Violations force a state transition.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BreakerLimits {
    /// Seconds an agent may stay ACTIVE.
    pub max_active_duration: u64,
    /// Seconds an agent may stay SLEEPING.
    pub max_sleep_duration: u64,
    pub max_iterations: u32,
    pub max_tool_calls: u32,
    pub max_turns: u32,
    /// Fraction of `max_active_duration` at which a warning is logged.
    pub warning_threshold: f64,
}

impl Default for BreakerLimits {
    fn default() -> Self {
        Self {
            max_active_duration: 7200,
            max_sleep_duration: 86_400,
            max_iterations: 5,
            max_tool_calls: 200,
            max_turns: 50,
            warning_threshold: 0.8,
        }
    }
}

/// Per-role overrides; unset fields merge onto the defaults.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct BreakerOverrides {
    pub max_active_duration: Option<u64>,
    pub max_sleep_duration: Option<u64>,
    pub max_iterations: Option<u32>,
    pub max_tool_calls: Option<u32>,
    pub max_turns: Option<u32>,
    pub warning_threshold: Option<f64>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct CircuitBreakerConfig {
    #[serde(default)]
    pub defaults: BreakerLimits,
    #[serde(default)]
    pub roles: HashMap<String, BreakerOverrides>,
}

impl CircuitBreakerConfig {
    pub fn for_role(&self, role: &str) -> BreakerLimits {
        let mut limits = self.defaults.clone();
        if let Some(ov) = self.roles.get(role) {
            if let Some(v) = ov.max_active_duration {
                limits.max_active_duration = v;
            }
            if let Some(v) = ov.max_sleep_duration {
                limits.max_sleep_duration = v;
            }
            if let Some(v) = ov.max_iterations {
                limits.max_iterations = v;
            }
            if let Some(v) = ov.max_tool_calls {
                limits.max_tool_calls = v;
            }
            if let Some(v) = ov.max_turns {
                limits.max_turns = v;
            }
            if let Some(v) = ov.warning_threshold {
                limits.warning_threshold = v;
            }
        }
        limits
    }
}

/// Model provider wiring for the session CLI (BYOK).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProviderConfig {
    #[serde(rename = "type")]
    pub kind: String,
    pub api_key_env: Option<String>,
    pub base_url: Option<String>,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            kind: "anthropic".to_string(),
            api_key_env: Some("ANTHROPIC_API_KEY".to_string()),
            base_url: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RuntimeConfig {
    pub default_model: String,
    /// Seconds between reconciliation passes.
    pub reconciliation_interval: u64,
    /// Hours to keep webhook dedup entries before pruning.
    pub dedup_retention_hours: u64,
    #[serde(default)]
    pub provider: ProviderConfig,
    /// Path to the session CLI binary that agent subprocesses run.
    pub cli_path: String,
    /// Directory for the registry database and worktrees.
    pub data_dir: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            default_model: "claude-sonnet-4".to_string(),
            reconciliation_interval: 300,
            dedup_retention_hours: 72,
            provider: ProviderConfig::default(),
            cli_path: "copilot".to_string(),
            data_dir: ".squadron-data".to_string(),
        }
    }
}

/// Labels the orchestrator reads and writes.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LabelsConfig {
    /// PR label that wakes the owning agent (review fallback path).
    pub wake: String,
    pub needs_human: String,
    pub in_progress: String,
    pub blocked: String,
}

impl Default for LabelsConfig {
    fn default() -> Self {
        Self {
            wake: "needs-changes".to_string(),
            needs_human: "needs-human".to_string(),
            in_progress: "in-progress".to_string(),
            blocked: "blocked".to_string(),
        }
    }
}

/// `@bot <command>` registry entry. A disabled command or one carrying a
/// static `response` is answered directly and never routed to an agent.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CommandConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub invoke_agent: Option<String>,
    pub response: Option<String>,
}

fn default_true() -> bool {
    true
}

/// Sender allowlist. An empty maintainer list locks the instance down: no
/// human-originated event is processed.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct HumanGroupsConfig {
    #[serde(default)]
    pub maintainers: Vec<String>,
}

impl SquadronConfig {
    /// Load from `{repo_root}/.squadron/squadron.toml` plus `SQUADRON_*`
    /// environment overrides, then validate.
    pub fn load(repo_root: &Path) -> Result<Self> {
        let config_path = repo_root.join(".squadron").join("squadron.toml");
        if !config_path.exists() {
            bail!(
                "configuration not found at {}; run `squadron init`",
                config_path.display()
            );
        }

        let builder = Config::builder()
            .add_source(File::from(config_path.clone()))
            .add_source(
                Environment::with_prefix("SQUADRON")
                    .separator("__")
                    .try_parsing(true),
            );

        let mut cfg: SquadronConfig = builder
            .build()
            .and_then(|c| c.try_deserialize())
            .with_context(|| format!("failed to load {}", config_path.display()))?;

        if cfg.server.webhook_secret.is_none() {
            if let Ok(secret) = std::env::var("GITHUB_WEBHOOK_SECRET") {
                cfg.server.webhook_secret = Some(secret);
            }
        }

        cfg.validate(repo_root)?;
        Ok(cfg)
    }

    /// Load `.env` if present (development convenience).
    pub fn load_env_file() {
        if Path::new(".env").exists() && dotenvy::dotenv().is_ok() {
            tracing::info!("Loaded environment variables from .env file");
        }
    }

    /// Structural validation beyond what deserialization gives us.
    /// Includes the load-time placeholder lint for role templates.
    pub fn validate(&self, repo_root: &Path) -> Result<()> {
        if self.project.owner.is_empty() || self.project.repo.is_empty() {
            bail!("project.owner and project.repo must be set");
        }

        let wt = self.circuit_breakers.defaults.warning_threshold;
        if !(0.0..=1.0).contains(&wt) {
            bail!("circuit_breakers.defaults.warning_threshold must be in (0, 1]");
        }

        for template in [
            &self.branch_naming.feature,
            &self.branch_naming.bugfix,
            &self.branch_naming.security,
            &self.branch_naming.docs,
            &self.branch_naming.infra,
        ] {
            if !template.contains("{issue_number}") {
                bail!("branch template `{template}` is missing {{issue_number}}");
            }
        }

        for (name, role) in &self.agent_roles {
            if role.agent_definition.is_empty() {
                bail!("agent_roles.{name}.agent_definition must be set");
            }
            let path = repo_root.join(&role.agent_definition);
            let template = std::fs::read_to_string(&path)
                .with_context(|| format!("agent_roles.{name}: cannot read {}", path.display()))?;
            crate::prompt::lint_template(&template)
                .with_context(|| format!("agent_roles.{name}: invalid template"))?;
        }

        Ok(())
    }

    /// The identity the bot's own events arrive under; used by the router's
    /// self-event filter.
    pub fn bot_username(&self) -> String {
        format!("{}[bot]", self.project.name)
    }

    /// The `@name` humans use to address the bot in comments.
    pub fn bot_mention(&self) -> String {
        format!("@{}", self.project.name)
    }

    pub fn repo_full_name(&self) -> String {
        format!("{}/{}", self.project.owner, self.project.repo)
    }

    pub fn data_dir(&self, repo_root: &Path) -> PathBuf {
        repo_root.join(&self.runtime.data_dir)
    }

    /// GitHub API token from the environment (never stored in config files).
    pub fn github_token() -> Result<String> {
        std::env::var("SQUADRON_GITHUB_TOKEN")
            .or_else(|_| std::env::var("GITHUB_TOKEN"))
            .context("set SQUADRON_GITHUB_TOKEN or GITHUB_TOKEN")
    }

    pub fn role(&self, name: &str) -> Option<&RoleConfig> {
        self.agent_roles.get(name)
    }

    /// Roles whose triggers match `(event, label)`, with the trigger action.
    pub fn matching_triggers(
        &self,
        full_type: &str,
        label: Option<&str>,
    ) -> Vec<(String, TriggerAction)> {
        let mut out = Vec::new();
        for (name, role) in &self.agent_roles {
            for trigger in &role.triggers {
                if trigger.event != full_type {
                    continue;
                }
                if let Some(required) = &trigger.label {
                    if label != Some(required.as_str()) {
                        continue;
                    }
                }
                out.push((name.clone(), trigger.action));
            }
        }
        // Deterministic dispatch order regardless of map iteration.
        out.sort();
        out
    }

    pub fn is_maintainer(&self, sender: &str) -> bool {
        self.human_groups.maintainers.iter().any(|m| m == sender)
    }
}
