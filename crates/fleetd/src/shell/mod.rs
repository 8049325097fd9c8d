//! Persistent interactive remote shells.
//!
//! A [`ShellSession`] owns one transport (an SSH channel in production) and a
//! background task that keeps decoding whatever the remote side prints. The
//! [`Connector`] trait is the seam between the session layer and the network.

mod prompt;
mod session;
pub mod ssh;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

pub use prompt::{DEFAULT_PROMPT_PATTERN, PromptDetector, strip_ansi};
pub use session::{ShellOptions, ShellSession};

/// Result type for shell operations.
pub type ShellResult<T> = Result<T, ShellError>;

/// Errors raised by shell transports and sessions.
#[derive(Debug, Error)]
pub enum ShellError {
    /// Could not establish the connection or authenticate.
    #[error("{message}")]
    Connect { target: String, message: String },

    /// I/O failure on an established connection.
    #[error("Shell transport error: {0}")]
    Transport(String),

    /// The session was closed or the remote side hung up.
    #[error("Shell session is closed")]
    Closed,
}

/// Everything needed to open a shell on one robot.
#[derive(Debug, Clone)]
pub struct ConnectTarget {
    pub robot_id: String,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub term: String,
    pub width: u32,
    pub height: u32,
    pub connect_timeout: Duration,
}

impl ConnectTarget {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Bidirectional byte stream of an interactive shell.
#[async_trait]
pub trait ShellTransport: Send {
    /// Write raw bytes to the shell's stdin.
    async fn send(&mut self, data: &[u8]) -> ShellResult<()>;

    /// Wait for the next chunk of output. `Ok(None)` means the remote side
    /// closed the stream. Must be cancel safe.
    async fn recv(&mut self) -> ShellResult<Option<Vec<u8>>>;

    /// Propagate terminal geometry.
    async fn resize(&mut self, width: u32, height: u32) -> ShellResult<()>;

    /// Release the underlying connection.
    async fn close(&mut self);
}

/// Opens transports. Implemented over SSH in [`ssh::SshConnector`].
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, target: &ConnectTarget) -> ShellResult<Box<dyn ShellTransport>>;
}
