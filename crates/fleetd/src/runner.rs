//! One-shot commands and interactive I/O against pooled sessions.

use std::time::Duration;

use async_trait::async_trait;
use log::warn;

use crate::config::{CommandConfig, clamp_f64, secs};
use crate::definitions::CommandExec;
use crate::error::{FleetError, FleetResult};
use crate::guard::{ActivityGuard, ActivitySource};
use crate::sessions::SessionStore;

/// Default number of queued chunks drained per `read_output` call.
pub const DEFAULT_READ_CHUNKS: usize = 100;

#[derive(Clone)]
pub struct CommandRunner {
    sessions: SessionStore,
    guard: ActivityGuard,
    config: CommandConfig,
}

impl CommandRunner {
    pub fn new(sessions: SessionStore, guard: ActivityGuard, config: CommandConfig) -> Self {
        Self {
            sessions,
            guard,
            config,
        }
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    /// Effective timeout for a requested value.
    pub fn clamp_timeout(&self, timeout_sec: Option<f64>) -> Duration {
        let requested = timeout_sec.unwrap_or(self.config.default_timeout_secs);
        secs(clamp_f64(
            requested,
            self.config.min_timeout_secs,
            self.config.max_timeout_secs,
        ))
    }

    /// Run `command` and return whatever it printed.
    ///
    /// A failure closes the session so the next call starts from a clean
    /// shell.
    pub async fn run_command(
        &self,
        client_session_id: &str,
        robot_id: &str,
        command: &str,
        timeout_sec: Option<f64>,
        source: ActivitySource,
    ) -> FleetResult<String> {
        self.guard
            .mark_manual_activity(robot_id, Some(client_session_id), source);
        let shell = self
            .sessions
            .get_or_connect(client_session_id, robot_id)
            .await?;
        let timeout = self.clamp_timeout(timeout_sec);

        match shell.run_command(command, timeout).await {
            Ok(output) => {
                self.sessions.touch(client_session_id, robot_id);
                Ok(output)
            }
            Err(err) => {
                warn!("Command on {robot_id} failed: {err}");
                self.sessions.close(client_session_id, robot_id).await;
                Err(FleetError::execution(format!("SSH command failed: {err}")))
            }
        }
    }

    /// Forward raw keystrokes.
    pub async fn send_input(
        &self,
        client_session_id: &str,
        robot_id: &str,
        text: &str,
    ) -> FleetResult<()> {
        let shell = self
            .sessions
            .get_or_connect(client_session_id, robot_id)
            .await?;
        shell.send(text).await?;
        self.sessions.touch(client_session_id, robot_id);
        Ok(())
    }

    /// Drain decoded output queued since the last read.
    pub async fn read_output(
        &self,
        client_session_id: &str,
        robot_id: &str,
        max_chunks: usize,
    ) -> FleetResult<String> {
        let shell = self
            .sessions
            .get_or_connect(client_session_id, robot_id)
            .await?;
        let output = shell.read(max_chunks).await;
        self.sessions.touch(client_session_id, robot_id);
        Ok(output)
    }

    pub async fn resize(
        &self,
        client_session_id: &str,
        robot_id: &str,
        width: u32,
        height: u32,
    ) -> FleetResult<()> {
        let shell = self
            .sessions
            .get_or_connect(client_session_id, robot_id)
            .await?;
        shell.resize(width, height).await?;
        self.sessions.touch(client_session_id, robot_id);
        Ok(())
    }

    /// Command executor pinned to one session, for definition runs.
    pub fn bind(
        &self,
        client_session_id: impl Into<String>,
        robot_id: impl Into<String>,
        source: ActivitySource,
    ) -> SessionCommands {
        SessionCommands {
            runner: self.clone(),
            client_session_id: client_session_id.into(),
            robot_id: robot_id.into(),
            source,
        }
    }
}

/// [`CommandExec`] over one `(session, robot)` pair.
pub struct SessionCommands {
    runner: CommandRunner,
    client_session_id: String,
    robot_id: String,
    source: ActivitySource,
}

#[async_trait]
impl CommandExec for SessionCommands {
    async fn run(&self, command: &str, timeout_sec: Option<f64>) -> FleetResult<String> {
        self.runner
            .run_command(
                &self.client_session_id,
                &self.robot_id,
                command,
                timeout_sec,
                self.source,
            )
            .await
    }
}
