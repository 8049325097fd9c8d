//! In-memory shell transport for tests.
//!
//! [`ScriptedFleet`] plays the remote side of every robot: it echoes each
//! submitted line, prints the scripted response and a `robot$ ` prompt, and
//! records what was sent so tests can count remote round trips.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::shell::{ConnectTarget, Connector, ShellError, ShellResult, ShellTransport};

const PROMPT: &str = "robot$ ";

#[derive(Debug, Clone)]
enum Reply {
    Output(String),
    /// Print output but never return to the prompt.
    Hang(String),
    /// The write itself fails.
    Fail,
}

#[derive(Debug, Default)]
struct Script {
    replies: Vec<(String, Reply)>,
    unreachable: HashSet<String>,
    commands: Vec<(String, String)>,
    connects: HashMap<String, usize>,
    connect_delay: Duration,
    last_resize: Option<(u32, u32)>,
}

/// Scripted stand-in for a fleet of SSH hosts.
#[derive(Debug, Clone, Default)]
pub struct ScriptedFleet {
    script: Arc<Mutex<Script>>,
}

impl ScriptedFleet {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_script<T>(&self, f: impl FnOnce(&mut Script) -> T) -> T {
        let mut guard = match self.script.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut guard)
    }

    fn set_reply(&self, pattern: &str, reply: Reply) {
        self.with_script(|s| {
            s.replies.retain(|(p, _)| p != pattern);
            s.replies.push((pattern.to_string(), reply));
        });
    }

    /// Answer commands containing `pattern` with `output`.
    pub fn respond(&self, pattern: &str, output: &str) {
        self.set_reply(pattern, Reply::Output(output.to_string()));
    }

    /// Print `output` for matching commands without a trailing prompt.
    pub fn hang(&self, pattern: &str, output: &str) {
        self.set_reply(pattern, Reply::Hang(output.to_string()));
    }

    /// Make writes of matching commands fail.
    pub fn fail_command(&self, pattern: &str) {
        self.set_reply(pattern, Reply::Fail);
    }

    pub fn set_unreachable(&self, host: &str, unreachable: bool) {
        self.with_script(|s| {
            if unreachable {
                s.unreachable.insert(host.to_string());
            } else {
                s.unreachable.remove(host);
            }
        });
    }

    /// Hold every connection attempt for `delay` before answering.
    pub fn set_connect_delay(&self, delay: Duration) {
        self.with_script(|s| s.connect_delay = delay);
    }

    /// Every command line received, as `(host, line)`.
    pub fn commands(&self) -> Vec<(String, String)> {
        self.with_script(|s| s.commands.clone())
    }

    /// Number of received lines containing `pattern`.
    pub fn command_count(&self, pattern: &str) -> usize {
        self.with_script(|s| {
            s.commands
                .iter()
                .filter(|(_, line)| line.contains(pattern))
                .count()
        })
    }

    /// Successful connections made to `host`.
    pub fn connect_count(&self, host: &str) -> usize {
        self.with_script(|s| s.connects.get(host).copied().unwrap_or(0))
    }

    pub fn last_resize(&self) -> Option<(u32, u32)> {
        self.with_script(|s| s.last_resize)
    }

    /// Connection target with test credentials.
    pub fn target(&self, robot_id: &str, host: &str) -> ConnectTarget {
        ConnectTarget {
            robot_id: robot_id.to_string(),
            host: host.to_string(),
            port: 22,
            username: "robot".to_string(),
            password: "secret".to_string(),
            term: "xterm-256color".to_string(),
            width: 160,
            height: 48,
            connect_timeout: Duration::from_secs(1),
        }
    }

    fn reply_for(&self, line: &str) -> Reply {
        self.with_script(|s| {
            s.replies
                .iter()
                .find(|(pattern, _)| line.contains(pattern.as_str()))
                .map(|(_, reply)| reply.clone())
                .unwrap_or_else(|| Reply::Output(String::new()))
        })
    }
}

#[async_trait]
impl Connector for ScriptedFleet {
    async fn connect(&self, target: &ConnectTarget) -> ShellResult<Box<dyn ShellTransport>> {
        let delay = self.with_script(|s| s.connect_delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let refused = self.with_script(|s| {
            if s.unreachable.contains(&target.host) {
                return true;
            }
            *s.connects.entry(target.host.clone()).or_insert(0) += 1;
            false
        });
        if refused {
            return Err(ShellError::Connect {
                target: target.robot_id.clone(),
                message: format!("connection refused by {}", target.address()),
            });
        }

        let (tx, rx) = mpsc::unbounded_channel();
        Ok(Box::new(ScriptedTransport {
            fleet: self.clone(),
            host: target.host.clone(),
            line: String::new(),
            tx,
            rx,
        }))
    }
}

struct ScriptedTransport {
    fleet: ScriptedFleet,
    host: String,
    line: String,
    tx: mpsc::UnboundedSender<Vec<u8>>,
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
}

#[async_trait]
impl ShellTransport for ScriptedTransport {
    async fn send(&mut self, data: &[u8]) -> ShellResult<()> {
        self.line.push_str(&String::from_utf8_lossy(data));
        while let Some(pos) = self.line.find('\n') {
            let line: String = self.line.drain(..=pos).collect();
            let line = line.trim_end().to_string();
            let reply = self.fleet.reply_for(&line);
            self.fleet
                .with_script(|s| s.commands.push((self.host.clone(), line.clone())));

            let text = match reply {
                Reply::Fail => {
                    return Err(ShellError::Transport(format!(
                        "write failed for '{line}'"
                    )));
                }
                Reply::Output(output) if output.is_empty() => format!("{line}\r\n{PROMPT}"),
                Reply::Output(output) => format!("{line}\r\n{output}\r\n{PROMPT}"),
                Reply::Hang(output) => format!("{line}\r\n{output}\r\n"),
            };
            let _ = self.tx.send(text.into_bytes());
        }
        Ok(())
    }

    async fn recv(&mut self) -> ShellResult<Option<Vec<u8>>> {
        Ok(self.rx.recv().await)
    }

    async fn resize(&mut self, width: u32, height: u32) -> ShellResult<()> {
        self.fleet.with_script(|s| s.last_resize = Some((width, height)));
        Ok(())
    }

    async fn close(&mut self) {}
}
