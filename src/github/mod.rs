//! Consumed GitHub interface.
//!
//! The rest of the engine sees only [`GitHubOps`] and the plain data
//! structs below; the octocrab-backed implementation lives in
//! [`client`]. Tests substitute mock implementations.

pub mod client;

pub use client::GitHubClient;

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GitHubError {
    #[error("GitHub API error: {0}")]
    Api(#[from] octocrab::Error),
    #[error("GitHub transport error: {0}")]
    Transport(String),
}

/// Issue view decoupled from the API client's model types.
#[derive(Debug, Clone, PartialEq)]
pub struct GhIssue {
    pub number: u64,
    pub title: String,
    pub body: Option<String>,
    /// `open` or `closed`.
    pub state: String,
    pub labels: Vec<String>,
    pub assignees: Vec<String>,
}

impl GhIssue {
    pub fn is_closed(&self) -> bool {
        self.state == "closed"
    }

    pub fn has_label(&self, label: &str) -> bool {
        self.labels.iter().any(|l| l == label)
    }
}

/// Pull request view decoupled from the API client's model types.
#[derive(Debug, Clone, PartialEq)]
pub struct GhPullRequest {
    pub number: u64,
    pub title: Option<String>,
    pub body: Option<String>,
    /// `open` or `closed`.
    pub state: String,
    pub merged: bool,
    pub head_ref: String,
    pub base_ref: String,
    pub author: Option<String>,
}

/// Review verdicts accepted by the PR review endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReviewVerdict {
    Approve,
    RequestChanges,
    Comment,
}

impl ReviewVerdict {
    pub fn api_value(&self) -> &'static str {
        match self {
            ReviewVerdict::Approve => "APPROVE",
            ReviewVerdict::RequestChanges => "REQUEST_CHANGES",
            ReviewVerdict::Comment => "COMMENT",
        }
    }
}

/// Operations the engine needs from GitHub. All methods target the single
/// configured repository.
#[async_trait]
pub trait GitHubOps: Send + Sync {
    async fn get_issue(&self, number: u64) -> Result<GhIssue, GitHubError>;

    /// Open issues, optionally restricted to those carrying `label`.
    async fn list_issues(&self, label: Option<&str>) -> Result<Vec<GhIssue>, GitHubError>;

    /// Open pull requests.
    async fn list_pull_requests(&self) -> Result<Vec<GhPullRequest>, GitHubError>;

    async fn create_issue(
        &self,
        title: &str,
        body: &str,
        labels: &[String],
    ) -> Result<GhIssue, GitHubError>;

    async fn add_labels(&self, number: u64, labels: &[String]) -> Result<(), GitHubError>;

    async fn assign_issue(&self, number: u64, assignees: &[String]) -> Result<(), GitHubError>;

    async fn comment_on_issue(&self, number: u64, body: &str) -> Result<(), GitHubError>;

    /// PR-level conversation comment (same endpoint family as issues).
    async fn comment_on_pr(&self, number: u64, body: &str) -> Result<(), GitHubError>;

    async fn create_pull_request(
        &self,
        title: &str,
        body: &str,
        head: &str,
        base: &str,
    ) -> Result<GhPullRequest, GitHubError>;

    async fn submit_review(
        &self,
        pr_number: u64,
        verdict: ReviewVerdict,
        body: &str,
    ) -> Result<(), GitHubError>;

    async fn add_pr_line_comment(
        &self,
        pr_number: u64,
        commit_sha: &str,
        path: &str,
        line: u64,
        body: &str,
    ) -> Result<(), GitHubError>;
}
