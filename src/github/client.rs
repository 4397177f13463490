//! Octocrab-backed [`GitHubOps`] implementation.
//!
//! Reads retry with a short linear backoff (GitHub hiccups are common and
//! cheap to ride out); writes are single-shot: their callers decide
//! whether a retry is safe.

use super::{GhIssue, GhPullRequest, GitHubError, GitHubOps, ReviewVerdict};
use async_trait::async_trait;
use octocrab::Octocrab;
use std::time::Duration;
use tracing::warn;

const MAX_READ_ATTEMPTS: u32 = 3;

#[derive(Clone)]
pub struct GitHubClient {
    octocrab: Octocrab,
    owner: String,
    repo: String,
}

impl GitHubClient {
    pub fn new(token: String, owner: String, repo: String) -> Result<Self, GitHubError> {
        let octocrab = Octocrab::builder().personal_token(token).build()?;
        Ok(Self {
            octocrab,
            owner,
            repo,
        })
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn repo(&self) -> &str {
        &self.repo
    }

    fn convert_issue(issue: octocrab::models::issues::Issue) -> GhIssue {
        let state = match issue.state {
            octocrab::models::IssueState::Closed => "closed",
            _ => "open",
        };
        GhIssue {
            number: issue.number,
            title: issue.title,
            body: issue.body,
            state: state.to_string(),
            labels: issue.labels.into_iter().map(|l| l.name).collect(),
            assignees: issue.assignees.into_iter().map(|u| u.login).collect(),
        }
    }

    fn convert_pull(pr: octocrab::models::pulls::PullRequest) -> GhPullRequest {
        let state = match pr.state {
            Some(octocrab::models::IssueState::Closed) => "closed",
            _ => "open",
        };
        GhPullRequest {
            number: pr.number,
            title: pr.title,
            body: pr.body,
            state: state.to_string(),
            merged: pr.merged.unwrap_or(false),
            head_ref: pr.head.ref_field,
            base_ref: pr.base.ref_field,
            author: pr.user.map(|u| u.login),
        }
    }
}

#[async_trait]
impl GitHubOps for GitHubClient {
    async fn get_issue(&self, number: u64) -> Result<GhIssue, GitHubError> {
        let mut attempts = 0;
        loop {
            attempts += 1;
            match self.octocrab.issues(&self.owner, &self.repo).get(number).await {
                Ok(issue) => return Ok(Self::convert_issue(issue)),
                Err(e) if attempts < MAX_READ_ATTEMPTS => {
                    warn!(issue = number, attempt = attempts, error = %e, "get_issue failed, retrying");
                    tokio::time::sleep(Duration::from_millis(500 * u64::from(attempts))).await;
                }
                Err(e) => return Err(GitHubError::from(e)),
            }
        }
    }

    async fn list_issues(&self, label: Option<&str>) -> Result<Vec<GhIssue>, GitHubError> {
        let mut attempts = 0;
        let page = loop {
            attempts += 1;
            match self
                .octocrab
                .issues(&self.owner, &self.repo)
                .list()
                .state(octocrab::params::State::Open)
                .per_page(100)
                .send()
                .await
            {
                Ok(page) => break page,
                Err(e) if attempts < MAX_READ_ATTEMPTS => {
                    warn!(attempt = attempts, error = %e, "list_issues failed, retrying");
                    tokio::time::sleep(Duration::from_millis(500 * u64::from(attempts))).await;
                }
                Err(e) => return Err(GitHubError::from(e)),
            }
        };

        let issues = page
            .items
            .into_iter()
            // The issues endpoint also returns PRs; drop them.
            .filter(|issue| issue.pull_request.is_none())
            .map(Self::convert_issue)
            .filter(|issue| label.map_or(true, |l| issue.has_label(l)))
            .collect();
        Ok(issues)
    }

    async fn list_pull_requests(&self) -> Result<Vec<GhPullRequest>, GitHubError> {
        let mut attempts = 0;
        let page = loop {
            attempts += 1;
            match self
                .octocrab
                .pulls(&self.owner, &self.repo)
                .list()
                .state(octocrab::params::State::Open)
                .per_page(100)
                .send()
                .await
            {
                Ok(page) => break page,
                Err(e) if attempts < MAX_READ_ATTEMPTS => {
                    warn!(attempt = attempts, error = %e, "list_pull_requests failed, retrying");
                    tokio::time::sleep(Duration::from_millis(500 * u64::from(attempts))).await;
                }
                Err(e) => return Err(GitHubError::from(e)),
            }
        };

        Ok(page.items.into_iter().map(Self::convert_pull).collect())
    }

    async fn create_issue(
        &self,
        title: &str,
        body: &str,
        labels: &[String],
    ) -> Result<GhIssue, GitHubError> {
        let issue = self
            .octocrab
            .issues(&self.owner, &self.repo)
            .create(title)
            .body(body)
            .labels(labels.to_vec())
            .send()
            .await?;
        Ok(Self::convert_issue(issue))
    }

    async fn add_labels(&self, number: u64, labels: &[String]) -> Result<(), GitHubError> {
        self.octocrab
            .issues(&self.owner, &self.repo)
            .add_labels(number, labels)
            .await?;
        Ok(())
    }

    async fn assign_issue(&self, number: u64, assignees: &[String]) -> Result<(), GitHubError> {
        self.octocrab
            .issues(&self.owner, &self.repo)
            .update(number)
            .assignees(assignees)
            .send()
            .await?;
        Ok(())
    }

    async fn comment_on_issue(&self, number: u64, body: &str) -> Result<(), GitHubError> {
        self.octocrab
            .issues(&self.owner, &self.repo)
            .create_comment(number, body)
            .await?;
        Ok(())
    }

    async fn comment_on_pr(&self, number: u64, body: &str) -> Result<(), GitHubError> {
        // PR conversation comments go through the issues endpoint.
        self.comment_on_issue(number, body).await
    }

    async fn create_pull_request(
        &self,
        title: &str,
        body: &str,
        head: &str,
        base: &str,
    ) -> Result<GhPullRequest, GitHubError> {
        let pr = self
            .octocrab
            .pulls(&self.owner, &self.repo)
            .create(title, head, base)
            .body(body)
            .send()
            .await?;
        Ok(Self::convert_pull(pr))
    }

    async fn submit_review(
        &self,
        pr_number: u64,
        verdict: ReviewVerdict,
        body: &str,
    ) -> Result<(), GitHubError> {
        let route = format!(
            "/repos/{}/{}/pulls/{}/reviews",
            self.owner, self.repo, pr_number
        );
        let payload = serde_json::json!({
            "event": verdict.api_value(),
            "body": body,
        });
        let _: serde_json::Value = self.octocrab.post(route, Some(&payload)).await?;
        Ok(())
    }

    async fn add_pr_line_comment(
        &self,
        pr_number: u64,
        commit_sha: &str,
        path: &str,
        line: u64,
        body: &str,
    ) -> Result<(), GitHubError> {
        let route = format!(
            "/repos/{}/{}/pulls/{}/comments",
            self.owner, self.repo, pr_number
        );
        let payload = serde_json::json!({
            "body": body,
            "commit_id": commit_sha,
            "path": path,
            "line": line,
            "side": "RIGHT",
        });
        let _: serde_json::Value = self.octocrab.post(route, Some(&payload)).await?;
        Ok(())
    }
}
