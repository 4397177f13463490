//! Agent registry: SQLite-backed store for agent records, the blocker
//! graph, and seen webhook delivery IDs.
//!
//! The registry is the only shared-mutable store in the system. Writes are
//! serialised at the storage layer (single-connection pool + WAL), so
//! callers on different tasks can write without extra coordination. I/O
//! errors surface to the caller; the registry never retries internally.

use crate::models::{AgentRecord, AgentStatus};
use chrono::{DateTime, Duration, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use std::collections::{HashSet, VecDeque};
use std::path::Path;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("registry I/O error: {0}")]
    Db(#[from] sqlx::Error),
    #[error("registry migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("corrupt registry row: {0}")]
    Corrupt(String),
    #[error("agent not found: {0}")]
    NotFound(String),
}

pub struct AgentRegistry {
    pool: SqlitePool,
}

impl AgentRegistry {
    /// Open (creating if needed) the registry database and run migrations.
    pub async fn open(db_path: &Path) -> Result<Self, RegistryError> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| RegistryError::Corrupt(format!("cannot create data dir: {e}")))?;
        }

        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);

        // Single connection: all writes serialise at the storage layer.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;
        info!(path = %db_path.display(), "Agent registry initialized");
        Ok(Self { pool })
    }

    /// In-memory registry for tests.
    pub async fn open_in_memory() -> Result<Self, RegistryError> {
        let options = SqliteConnectOptions::new()
            .filename(":memory:")
            .create_if_missing(true);
        // The single connection must stay open or the in-memory DB vanishes.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .connect_with(options)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    // ── CRUD ─────────────────────────────────────────────────────────────

    /// Insert a new agent record. Fails on duplicate `agent_id`.
    pub async fn create(&self, record: &AgentRecord) -> Result<(), RegistryError> {
        let now = Utc::now();
        sqlx::query(
            r#"
            INSERT INTO agents
                (agent_id, role, issue_number, pr_number, session_id, status,
                 branch, worktree_path, blocked_by,
                 iteration_count, tool_call_count, turn_count,
                 created_at, updated_at, active_since, sleeping_since)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)
            "#,
        )
        .bind(&record.agent_id)
        .bind(&record.role)
        .bind(record.issue_number.map(|n| n as i64))
        .bind(record.pr_number.map(|n| n as i64))
        .bind(&record.session_id)
        .bind(record.status.as_str())
        .bind(&record.branch)
        .bind(&record.worktree_path)
        .bind(serde_json::to_string(&record.blocked_by).unwrap_or_else(|_| "[]".into()))
        .bind(record.iteration_count as i64)
        .bind(record.tool_call_count as i64)
        .bind(record.turn_count as i64)
        .bind(now.to_rfc3339())
        .bind(now.to_rfc3339())
        .bind(record.active_since.map(|t| t.to_rfc3339()))
        .bind(record.sleeping_since.map(|t| t.to_rfc3339()))
        .execute(&self.pool)
        .await?;

        info!(
            agent_id = %record.agent_id,
            role = %record.role,
            issue = ?record.issue_number,
            "Created agent record"
        );
        Ok(())
    }

    pub async fn get(&self, agent_id: &str) -> Result<Option<AgentRecord>, RegistryError> {
        let row = sqlx::query("SELECT * FROM agents WHERE agent_id = ?1")
            .bind(agent_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| row_to_record(&r)).transpose()
    }

    /// The non-terminal record working an issue, newest first.
    pub async fn get_by_issue(&self, issue_number: u64) -> Result<Option<AgentRecord>, RegistryError> {
        let row = sqlx::query(
            r#"
            SELECT * FROM agents
            WHERE issue_number = ?1 AND status IN ('created', 'active', 'sleeping')
            ORDER BY created_at DESC LIMIT 1
            "#,
        )
        .bind(issue_number as i64)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| row_to_record(&r)).transpose()
    }

    /// Every record for an issue, terminal ones included. Recovery uses
    /// this to avoid re-creating agents it just failed.
    pub async fn all_by_issue(&self, issue_number: u64) -> Result<Vec<AgentRecord>, RegistryError> {
        let rows = sqlx::query("SELECT * FROM agents WHERE issue_number = ?1")
            .bind(issue_number as i64)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_record).collect()
    }

    /// The non-terminal record that owns a PR.
    pub async fn get_by_pr(&self, pr_number: u64) -> Result<Option<AgentRecord>, RegistryError> {
        let row = sqlx::query(
            r#"
            SELECT * FROM agents
            WHERE pr_number = ?1 AND status IN ('created', 'active', 'sleeping')
            ORDER BY created_at DESC LIMIT 1
            "#,
        )
        .bind(pr_number as i64)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| row_to_record(&r)).transpose()
    }

    pub async fn by_status(&self, status: AgentStatus) -> Result<Vec<AgentRecord>, RegistryError> {
        let rows = sqlx::query("SELECT * FROM agents WHERE status = ?1")
            .bind(status.as_str())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_record).collect()
    }

    /// All records in CREATED, ACTIVE, or SLEEPING.
    pub async fn all_active(&self) -> Result<Vec<AgentRecord>, RegistryError> {
        let rows =
            sqlx::query("SELECT * FROM agents WHERE status IN ('created', 'active', 'sleeping')")
                .fetch_all(&self.pool)
                .await?;
        rows.iter().map(row_to_record).collect()
    }

    /// Full-row replacement; always stamps `updated_at`.
    pub async fn update(&self, record: &mut AgentRecord) -> Result<(), RegistryError> {
        record.updated_at = Utc::now();
        let result = sqlx::query(
            r#"
            UPDATE agents SET
                role = ?1, issue_number = ?2, pr_number = ?3, session_id = ?4,
                status = ?5, branch = ?6, worktree_path = ?7, blocked_by = ?8,
                iteration_count = ?9, tool_call_count = ?10, turn_count = ?11,
                updated_at = ?12, active_since = ?13, sleeping_since = ?14
            WHERE agent_id = ?15
            "#,
        )
        .bind(&record.role)
        .bind(record.issue_number.map(|n| n as i64))
        .bind(record.pr_number.map(|n| n as i64))
        .bind(&record.session_id)
        .bind(record.status.as_str())
        .bind(&record.branch)
        .bind(&record.worktree_path)
        .bind(serde_json::to_string(&record.blocked_by).unwrap_or_else(|_| "[]".into()))
        .bind(record.iteration_count as i64)
        .bind(record.tool_call_count as i64)
        .bind(record.turn_count as i64)
        .bind(record.updated_at.to_rfc3339())
        .bind(record.active_since.map(|t| t.to_rfc3339()))
        .bind(record.sleeping_since.map(|t| t.to_rfc3339()))
        .bind(&record.agent_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(RegistryError::NotFound(record.agent_id.clone()));
        }
        Ok(())
    }

    // ── Blocker graph ────────────────────────────────────────────────────

    /// Add a blocker edge. Returns `false` without mutating when the edge
    /// is a self-block or would close a cycle.
    pub async fn add_blocker(
        &self,
        agent_id: &str,
        blocker_issue: u64,
    ) -> Result<bool, RegistryError> {
        let mut agent = self
            .get(agent_id)
            .await?
            .ok_or_else(|| RegistryError::NotFound(agent_id.to_string()))?;

        if agent.issue_number == Some(blocker_issue) {
            warn!(
                agent_id = %agent_id,
                issue = blocker_issue,
                "Rejected self-block"
            );
            return Ok(false);
        }

        if self.would_create_cycle(&agent, blocker_issue).await? {
            warn!(
                agent_id = %agent_id,
                issue = blocker_issue,
                "Rejected blocker: would create a dependency cycle"
            );
            return Ok(false);
        }

        if !agent.blocked_by.contains(&blocker_issue) {
            agent.blocked_by.push(blocker_issue);
            self.update(&mut agent).await?;
            info!(agent_id = %agent_id, issue = blocker_issue, "Agent blocked on issue");
        }
        Ok(true)
    }

    pub async fn remove_blocker(
        &self,
        agent_id: &str,
        blocker_issue: u64,
    ) -> Result<(), RegistryError> {
        if let Some(mut agent) = self.get(agent_id).await? {
            if agent.blocked_by.contains(&blocker_issue) {
                agent.blocked_by.retain(|&n| n != blocker_issue);
                self.update(&mut agent).await?;
                info!(agent_id = %agent_id, issue = blocker_issue, "Removed resolved blocker");
            }
        }
        Ok(())
    }

    /// All SLEEPING agents blocked by a given issue.
    pub async fn agents_blocked_by(
        &self,
        issue_number: u64,
    ) -> Result<Vec<AgentRecord>, RegistryError> {
        let sleeping = self.by_status(AgentStatus::Sleeping).await?;
        Ok(sleeping
            .into_iter()
            .filter(|a| a.blocked_by.contains(&issue_number))
            .collect())
    }

    /// BFS over the blocker graph: would adding `new_blocker` to `agent`
    /// let a chain of blockers reach back to `agent`'s own issue?
    async fn would_create_cycle(
        &self,
        agent: &AgentRecord,
        new_blocker: u64,
    ) -> Result<bool, RegistryError> {
        // No agent working the blocker issue → no edge to follow.
        let Some(blocker_agent) = self.get_by_issue(new_blocker).await? else {
            return Ok(false);
        };

        let mut visited: HashSet<u64> = HashSet::new();
        let mut queue: VecDeque<u64> = blocker_agent.blocked_by.iter().copied().collect();

        while let Some(current) = queue.pop_front() {
            if !visited.insert(current) {
                continue;
            }
            if agent.issue_number == Some(current) {
                return Ok(true);
            }
            if let Some(next) = self.get_by_issue(current).await? {
                for &issue in &next.blocked_by {
                    if !visited.contains(&issue) {
                        queue.push_back(issue);
                    }
                }
            }
        }
        Ok(false)
    }

    // ── Webhook deduplication ────────────────────────────────────────────

    pub async fn has_seen_event(&self, delivery_id: &str) -> Result<bool, RegistryError> {
        let row = sqlx::query("SELECT 1 FROM seen_events WHERE delivery_id = ?1")
            .bind(delivery_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    /// Idempotent: re-marking a seen delivery is a no-op.
    pub async fn mark_event_seen(
        &self,
        delivery_id: &str,
        event_type: &str,
    ) -> Result<(), RegistryError> {
        sqlx::query(
            "INSERT OR IGNORE INTO seen_events (delivery_id, event_type, received_at) VALUES (?1, ?2, ?3)",
        )
        .bind(delivery_id)
        .bind(event_type)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Delete seen_events older than `max_age`. Returns rows deleted.
    pub async fn prune_old_events(&self, max_age: Duration) -> Result<u64, RegistryError> {
        let cutoff = (Utc::now() - max_age).to_rfc3339();
        let result = sqlx::query("DELETE FROM seen_events WHERE received_at < ?1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// Test hook: backdate a seen event so prune paths can be exercised.
    #[doc(hidden)]
    pub async fn backdate_event(
        &self,
        delivery_id: &str,
        received_at: DateTime<Utc>,
    ) -> Result<(), RegistryError> {
        sqlx::query("UPDATE seen_events SET received_at = ?1 WHERE delivery_id = ?2")
            .bind(received_at.to_rfc3339())
            .bind(delivery_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

fn row_to_record(row: &sqlx::sqlite::SqliteRow) -> Result<AgentRecord, RegistryError> {
    let status_str: String = row.get("status");
    let status = AgentStatus::parse(&status_str)
        .ok_or_else(|| RegistryError::Corrupt(format!("unknown status `{status_str}`")))?;

    let blocked_by_json: String = row.get("blocked_by");
    let blocked_by: Vec<u64> = serde_json::from_str(&blocked_by_json)
        .map_err(|e| RegistryError::Corrupt(format!("bad blocked_by: {e}")))?;

    Ok(AgentRecord {
        agent_id: row.get("agent_id"),
        role: row.get("role"),
        issue_number: row.get::<Option<i64>, _>("issue_number").map(|n| n as u64),
        pr_number: row.get::<Option<i64>, _>("pr_number").map(|n| n as u64),
        session_id: row.get("session_id"),
        status,
        branch: row.get("branch"),
        worktree_path: row.get("worktree_path"),
        blocked_by,
        iteration_count: row.get::<i64, _>("iteration_count") as u32,
        tool_call_count: row.get::<i64, _>("tool_call_count") as u32,
        turn_count: row.get::<i64, _>("turn_count") as u32,
        created_at: parse_timestamp(row, "created_at")?,
        updated_at: parse_timestamp(row, "updated_at")?,
        active_since: parse_optional_timestamp(row, "active_since")?,
        sleeping_since: parse_optional_timestamp(row, "sleeping_since")?,
    })
}

fn parse_timestamp(
    row: &sqlx::sqlite::SqliteRow,
    column: &str,
) -> Result<DateTime<Utc>, RegistryError> {
    let raw: String = row.get(column);
    DateTime::parse_from_rfc3339(&raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| RegistryError::Corrupt(format!("bad {column}: {e}")))
}

fn parse_optional_timestamp(
    row: &sqlx::sqlite::SqliteRow,
    column: &str,
) -> Result<Option<DateTime<Utc>>, RegistryError> {
    let raw: Option<String> = row.get(column);
    raw.map(|s| {
        DateTime::parse_from_rfc3339(&s)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| RegistryError::Corrupt(format!("bad {column}: {e}")))
    })
    .transpose()
}
