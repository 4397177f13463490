//! Session supervisor: one external LLM CLI subprocess per live agent.
//!
//! The CLI speaks a JSON-lines protocol on stdio: one request object per
//! line in, event objects per line out, with a turn terminated by an
//! `idle` event. Those details stay inside this module; the rest of the
//! engine sees only [`AgentSession`] and [`SessionBackend`].
//!
//! `send_and_wait` is hardened: it never relies solely on the peer
//! signalling idle. A poller watches the OS process handle and raises a
//! distinct "subprocess died" error (with captured stderr) the moment the
//! child exits, instead of blocking until the turn timeout.

use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tracing::{debug, info, warn};

/// Startup retry schedule: initial try plus three retries at 2s/4s/8s.
const STARTUP_RETRIES: u32 = 3;
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("subprocess died (exit code {exit_code:?}): {stderr}")]
    ProcessDied {
        exit_code: Option<i32>,
        stderr: String,
    },
    #[error("turn timed out after {0:?}")]
    TurnTimeout(Duration),
    #[error("session startup failed after retries: {0}")]
    StartupFailed(String),
}

/// Session identifier convention: `squadron-{role}-issue-{n}`.
pub fn session_id_for(role: &str, issue_number: u64) -> String {
    format!("squadron-{role}-issue-{issue_number}")
}

pub fn session_id_for_pr(role: &str, pr_number: u64) -> String {
    format!("squadron-{role}-pr-{pr_number}")
}

/// Everything needed to start or resume a session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub session_id: String,
    pub model: String,
    pub system_message: String,
    pub working_directory: PathBuf,
    /// Scrubbed environment for the subprocess.
    pub env: Vec<(String, String)>,
}

/// A live conversational session. Turns are strictly serial: callers hold
/// exclusive access for the duration of `send_and_wait`.
#[async_trait]
pub trait AgentSession: Send {
    fn session_id(&self) -> &str;

    /// Submit a user turn and block until the model yields.
    async fn send_and_wait(
        &mut self,
        prompt: &str,
        timeout: Duration,
    ) -> Result<String, SessionError>;

    /// Destroy the session and terminate the subprocess. Both steps are
    /// best-effort but always attempted.
    async fn destroy(&mut self) -> Result<(), SessionError>;
}

/// Creates, resumes, and deletes sessions.
#[async_trait]
pub trait SessionBackend: Send + Sync {
    async fn create_session(
        &self,
        config: SessionConfig,
    ) -> Result<Box<dyn AgentSession>, SessionError>;

    /// Resume a previously persisted session (sleep → wake).
    async fn resume_session(
        &self,
        session_id: &str,
        config: SessionConfig,
    ) -> Result<Box<dyn AgentSession>, SessionError>;

    /// Delete a session's persisted state.
    async fn delete_session(&self, session_id: &str) -> Result<(), SessionError>;
}

/// Backend that spawns the configured CLI binary per session.
pub struct CliBackend {
    cli_path: String,
    poll_interval: Duration,
}

impl CliBackend {
    pub fn new(cli_path: &str) -> Self {
        Self {
            cli_path: cli_path.to_string(),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    async fn start_with_retries(
        &self,
        config: &SessionConfig,
        resume: bool,
    ) -> Result<Box<dyn AgentSession>, SessionError> {
        let mut last_error = String::new();
        for attempt in 0..=STARTUP_RETRIES {
            if attempt > 0 {
                let delay = Duration::from_secs(1 << attempt); // 2s, 4s, 8s
                warn!(
                    session_id = %config.session_id,
                    attempt,
                    delay_secs = delay.as_secs(),
                    "Session startup retry"
                );
                tokio::time::sleep(delay).await;
            }

            match CliSession::spawn(&self.cli_path, config, resume, self.poll_interval).await {
                Ok(mut session) => match session.startup_health_check().await {
                    Ok(()) => {
                        info!(session_id = %config.session_id, resume, "Session started");
                        return Ok(Box::new(session));
                    }
                    Err(e) => {
                        // Tear down the failed instance before retrying.
                        let _ = session.destroy().await;
                        last_error = e.to_string();
                    }
                },
                Err(e) => last_error = e.to_string(),
            }
        }
        Err(SessionError::StartupFailed(last_error))
    }
}

#[async_trait]
impl SessionBackend for CliBackend {
    async fn create_session(
        &self,
        config: SessionConfig,
    ) -> Result<Box<dyn AgentSession>, SessionError> {
        self.start_with_retries(&config, false).await
    }

    async fn resume_session(
        &self,
        session_id: &str,
        mut config: SessionConfig,
    ) -> Result<Box<dyn AgentSession>, SessionError> {
        config.session_id = session_id.to_string();
        self.start_with_retries(&config, true).await
    }

    async fn delete_session(&self, session_id: &str) -> Result<(), SessionError> {
        let output = Command::new(&self.cli_path)
            .args(["session", "delete", session_id])
            .output()
            .await?;
        if !output.status.success() {
            warn!(
                session_id,
                stderr = %String::from_utf8_lossy(&output.stderr),
                "session delete failed"
            );
        }
        Ok(())
    }
}

/// A single CLI subprocess session.
pub struct CliSession {
    session_id: String,
    child: Child,
    stdin: ChildStdin,
    stdout: tokio::io::Lines<BufReader<ChildStdout>>,
    stderr_buf: Arc<Mutex<String>>,
    poll_interval: Duration,
}

impl CliSession {
    async fn spawn(
        cli_path: &str,
        config: &SessionConfig,
        resume: bool,
        poll_interval: Duration,
    ) -> Result<Self, SessionError> {
        let mut cmd = Command::new(cli_path);
        cmd.arg("--session-id")
            .arg(&config.session_id)
            .arg("--model")
            .arg(&config.model);
        if resume {
            cmd.arg("--resume");
        }
        cmd.current_dir(&config.working_directory)
            .env_clear()
            .envs(config.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn()?;
        let mut stdin = child.stdin.take().expect("stdin piped");
        let stdout = BufReader::new(child.stdout.take().expect("stdout piped")).lines();
        let stderr = child.stderr.take().expect("stderr piped");

        // Drain stderr continuously so the pipe never fills and the last
        // output is available when the process dies.
        let stderr_buf = Arc::new(Mutex::new(String::new()));
        let buf = Arc::clone(&stderr_buf);
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let mut guard = buf.lock().expect("stderr buffer lock");
                guard.push_str(&line);
                guard.push('\n');
            }
        });

        let init = serde_json::json!({
            "type": "init",
            "system_message": config.system_message,
        });
        stdin.write_all(init.to_string().as_bytes()).await?;
        stdin.write_all(b"\n").await?;
        stdin.flush().await?;

        Ok(Self {
            session_id: config.session_id.clone(),
            child,
            stdin,
            stdout,
            stderr_buf,
            poll_interval,
        })
    }

    /// A freshly spawned child that exits within the grace window counts as
    /// a failed start.
    async fn startup_health_check(&mut self) -> Result<(), SessionError> {
        tokio::time::sleep(Duration::from_millis(200)).await;
        if let Some(status) = self.child.try_wait()? {
            return Err(SessionError::ProcessDied {
                exit_code: status.code(),
                stderr: self.stderr_snapshot(),
            });
        }
        Ok(())
    }

    fn stderr_snapshot(&self) -> String {
        self.stderr_buf
            .lock()
            .map(|g| g.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl AgentSession for CliSession {
    fn session_id(&self) -> &str {
        &self.session_id
    }

    async fn send_and_wait(
        &mut self,
        prompt: &str,
        timeout: Duration,
    ) -> Result<String, SessionError> {
        let request = serde_json::json!({"type": "user", "content": prompt});
        self.stdin.write_all(request.to_string().as_bytes()).await?;
        self.stdin.write_all(b"\n").await?;
        self.stdin.flush().await?;

        let deadline = tokio::time::Instant::now() + timeout;
        let mut poll = tokio::time::interval(self.poll_interval);
        poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut reply = String::new();

        // Split field borrows up front: the stdout reader future and the
        // process poller must coexist inside the select.
        let session_id = self.session_id.clone();
        let child = &mut self.child;
        let stdout = &mut self.stdout;
        let stderr_buf = Arc::clone(&self.stderr_buf);
        let stderr_snapshot =
            move || -> String { stderr_buf.lock().map(|g| g.clone()).unwrap_or_default() };

        loop {
            tokio::select! {
                line = stdout.next_line() => match line? {
                    Some(raw) => {
                        let event: serde_json::Value = match serde_json::from_str(&raw) {
                            Ok(v) => v,
                            Err(_) => {
                                debug!(session_id = %session_id, "Ignoring non-JSON output line");
                                continue;
                            }
                        };
                        match event.get("type").and_then(|v| v.as_str()) {
                            Some("assistant") => {
                                if let Some(content) = event.get("content").and_then(|v| v.as_str()) {
                                    reply.push_str(content);
                                }
                            }
                            Some("idle") => return Ok(reply),
                            _ => {}
                        }
                    }
                    None => {
                        // stdout closed; treat as death even if the exit
                        // status has not landed yet.
                        let exit_code = child.try_wait().ok().flatten().and_then(|s| s.code());
                        return Err(SessionError::ProcessDied {
                            exit_code,
                            stderr: stderr_snapshot(),
                        });
                    }
                },
                _ = poll.tick() => {
                    if let Some(status) = child.try_wait()? {
                        return Err(SessionError::ProcessDied {
                            exit_code: status.code(),
                            stderr: stderr_snapshot(),
                        });
                    }
                }
                _ = tokio::time::sleep_until(deadline) => {
                    return Err(SessionError::TurnTimeout(timeout));
                }
            }
        }
    }

    async fn destroy(&mut self) -> Result<(), SessionError> {
        // Polite shutdown request first, hard kill on overrun.
        let _ = self.stdin.write_all(b"{\"type\":\"shutdown\"}\n").await;
        let _ = self.stdin.flush().await;

        match tokio::time::timeout(Duration::from_secs(5), self.child.wait()).await {
            Ok(_) => {}
            Err(_) => {
                warn!(session_id = %self.session_id, "Session did not exit on request; killing");
                let _ = self.child.start_kill();
                let _ = self.child.wait().await;
            }
        }
        Ok(())
    }
}
