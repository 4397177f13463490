//! Environment scrubbing for agent subprocesses.
//!
//! Agent sessions run arbitrary model-driven tool calls; secrets must never
//! enter their namespace. The scrub strips a published list of known secret
//! variables plus anything matching common secret name patterns, keeping an
//! explicit allowlist of operational names that merely look secret.

use tracing::info;

/// Names that are always stripped, regardless of pattern matching.
pub const ALWAYS_STRIPPED: &[&str] = &[
    "GITHUB_APP_ID",
    "GITHUB_PRIVATE_KEY",
    "GITHUB_WEBHOOK_SECRET",
    "GITHUB_INSTALLATION_ID",
    "COPILOT_GITHUB_TOKEN",
    "GITHUB_TOKEN",
    "GH_TOKEN",
    "SQUADRON_GITHUB_TOKEN",
    "SQUADRON_DASHBOARD_API_KEY",
];

/// Substrings that mark a variable name as secret-bearing.
const SECRET_PATTERNS: &[&str] = &[
    "API_KEY",
    "SECRET_KEY",
    "PRIVATE_KEY",
    "ACCESS_TOKEN",
    "AUTH_TOKEN",
];

/// Operational names kept even though they match a pattern.
const PATTERN_ALLOWLIST: &[&str] = &["SSH_AUTH_SOCK"];

fn is_stripped(name: &str, extra_strip: &[String]) -> bool {
    if ALWAYS_STRIPPED.contains(&name) {
        return true;
    }
    if extra_strip.iter().any(|s| s == name) {
        return true;
    }
    if PATTERN_ALLOWLIST.contains(&name) {
        return false;
    }
    let upper = name.to_uppercase();
    SECRET_PATTERNS.iter().any(|p| upper.contains(p))
}

/// Scrub an arbitrary set of variables. Pure, so tests never have to touch
/// the process environment.
pub fn scrub<I>(vars: I, extra_strip: &[String]) -> Vec<(String, String)>
where
    I: IntoIterator<Item = (String, String)>,
{
    let mut kept = Vec::new();
    let mut stripped = Vec::new();
    for (name, value) in vars {
        if is_stripped(&name, extra_strip) {
            stripped.push(name);
        } else {
            kept.push((name, value));
        }
    }

    if !stripped.is_empty() {
        stripped.sort();
        info!(count = stripped.len(), vars = ?stripped, "Env scrub stripped secret vars");
    }
    kept
}

/// Sanitized copy of the current process environment for an agent
/// subprocess. `extra_strip` carries dynamically-named BYOK key vars from
/// the provider config.
pub fn build_agent_env(extra_strip: &[String]) -> Vec<(String, String)> {
    scrub(std::env::vars(), extra_strip)
}

/// Extra names to strip based on the configured provider: the BYOK key
/// env var is user-chosen and cannot be in the static list.
pub fn dynamic_strip_vars(api_key_env: Option<&str>) -> Vec<String> {
    let mut extra: Vec<String> = Vec::new();
    if let Some(name) = api_key_env {
        extra.push(name.to_string());
    }
    for var in ["ANTHROPIC_API_KEY", "OPENAI_API_KEY"] {
        if !extra.iter().any(|v| v == var) {
            extra.push(var.to_string());
        }
    }
    extra
}
