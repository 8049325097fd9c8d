//! SSH transport built on russh.

use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, warn};
use russh::client::{self, Handle, Msg};
use russh::{Channel, ChannelMsg, Disconnect};

use super::{ConnectTarget, Connector, ShellError, ShellResult, ShellTransport};

/// Accepts any host key.
struct AcceptingHandler;

impl client::Handler for AcceptingHandler {
    type Error = russh::Error;

    /// Host keys are never pinned, so every presented key is trusted.
    async fn check_server_key(
        &mut self,
        _server_public_key: &russh::keys::PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

/// Opens password-authenticated interactive shells.
#[derive(Clone)]
pub struct SshConnector {
    config: Arc<client::Config>,
}

impl SshConnector {
    pub fn new() -> Self {
        Self {
            config: Arc::new(client::Config::default()),
        }
    }
}

impl Default for SshConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Connector for SshConnector {
    async fn connect(&self, target: &ConnectTarget) -> ShellResult<Box<dyn ShellTransport>> {
        let connect_err = |message: String| ShellError::Connect {
            target: target.robot_id.clone(),
            message,
        };

        let addr = (target.host.as_str(), target.port);
        let mut handle = tokio::time::timeout(
            target.connect_timeout,
            client::connect(Arc::clone(&self.config), addr, AcceptingHandler),
        )
        .await
        .map_err(|_| connect_err(format!("timed out after {:?}", target.connect_timeout)))?
        .map_err(|e| connect_err(e.to_string()))?;

        let auth = handle
            .authenticate_password(target.username.as_str(), target.password.as_str())
            .await
            .map_err(|e| connect_err(e.to_string()))?;
        if !auth.success() {
            return Err(connect_err(format!(
                "authentication failed for user {}",
                target.username
            )));
        }

        let channel = handle
            .channel_open_session()
            .await
            .map_err(|e| connect_err(format!("opening session channel: {e}")))?;
        channel
            .request_pty(false, &target.term, target.width, target.height, 0, 0, &[])
            .await
            .map_err(|e| connect_err(format!("requesting pty: {e}")))?;
        channel
            .request_shell(false)
            .await
            .map_err(|e| connect_err(format!("requesting shell: {e}")))?;

        debug!("SSH shell open on {} ({})", target.robot_id, target.address());
        Ok(Box::new(SshTransport {
            handle,
            channel,
            closed: false,
        }))
    }
}

struct SshTransport {
    handle: Handle<AcceptingHandler>,
    channel: Channel<Msg>,
    closed: bool,
}

#[async_trait]
impl ShellTransport for SshTransport {
    async fn send(&mut self, data: &[u8]) -> ShellResult<()> {
        if self.closed {
            return Err(ShellError::Closed);
        }
        self.channel
            .data(data)
            .await
            .map_err(|e| ShellError::Transport(e.to_string()))
    }

    async fn recv(&mut self) -> ShellResult<Option<Vec<u8>>> {
        loop {
            match self.channel.wait().await {
                Some(ChannelMsg::Data { data }) => return Ok(Some(data.to_vec())),
                Some(ChannelMsg::ExtendedData { data, .. }) => return Ok(Some(data.to_vec())),
                Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) | None => {
                    self.closed = true;
                    return Ok(None);
                }
                Some(_) => continue,
            }
        }
    }

    async fn resize(&mut self, width: u32, height: u32) -> ShellResult<()> {
        self.channel
            .window_change(width, height, 0, 0)
            .await
            .map_err(|e| ShellError::Transport(e.to_string()))
    }

    async fn close(&mut self) {
        self.closed = true;
        if let Err(e) = self.channel.close().await {
            debug!("Error closing SSH channel: {}", e);
        }
        if let Err(e) = self
            .handle
            .disconnect(Disconnect::ByApplication, "", "English")
            .await
        {
            warn!("Error disconnecting SSH session: {}", e);
        }
    }
}
