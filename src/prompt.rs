//! Agent definition templates.
//!
//! Templates use `{placeholder}` tokens. Rendering is forgiving: a missing
//! key interpolates to the empty string so a template never fails because a
//! trigger event lacked a field. The flip side is a load-time lint: only
//! placeholders from the declared set are accepted, so typos are caught at
//! config load instead of silently rendering as "".

use anyhow::{bail, Result};
use regex::Regex;
use std::collections::HashMap;
use std::sync::OnceLock;

/// Placeholders a role template may reference.
pub const RECOGNIZED_PLACEHOLDERS: &[&str] = &[
    "project_name",
    "role",
    "agent_id",
    "issue_number",
    "issue_title",
    "issue_body",
    "branch_name",
    "base_branch",
    "pr_number",
    "max_iterations",
    "max_tool_calls",
    "max_turns",
];

fn placeholder_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{([a-z][a-z0-9_]*)\}").expect("static regex"))
}

/// Reject templates referencing unknown placeholders.
pub fn lint_template(template: &str) -> Result<()> {
    for cap in placeholder_re().captures_iter(template) {
        let name = &cap[1];
        if !RECOGNIZED_PLACEHOLDERS.contains(&name) {
            bail!("unknown placeholder {{{name}}}");
        }
    }
    Ok(())
}

/// Interpolate `{key}` tokens. Recognized keys missing from `vars` render
/// as the empty string.
pub fn render(template: &str, vars: &HashMap<&str, String>) -> String {
    placeholder_re()
        .replace_all(template, |cap: &regex::Captures<'_>| {
            vars.get(&cap[1]).cloned().unwrap_or_default()
        })
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_known_placeholders() {
        let mut vars = HashMap::new();
        vars.insert("issue_number", "10".to_string());
        vars.insert("branch_name", "feat/issue-10".to_string());
        let out = render("Work issue #{issue_number} on `{branch_name}`.", &vars);
        assert_eq!(out, "Work issue #10 on `feat/issue-10`.");
    }

    #[test]
    fn missing_keys_render_empty_never_fail() {
        let vars = HashMap::new();
        let out = render("PR: {pr_number}, issue: {issue_number}.", &vars);
        assert_eq!(out, "PR: , issue: .");
    }

    #[test]
    fn lint_accepts_declared_rejects_unknown() {
        assert!(lint_template("issue #{issue_number} as {role}").is_ok());
        assert!(lint_template("oops {isue_number}").is_err());
    }

    #[test]
    fn lint_ignores_non_placeholder_braces() {
        // JSON snippets and shell expansions in templates must not trip the lint.
        assert!(lint_template("run `${HOME}/bin` and emit {\"a\": 1}").is_ok());
    }
}
