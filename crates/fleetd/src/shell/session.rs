//! Interactive shell session backed by a background reader task.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use log::{debug, warn};
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;

use super::prompt::PromptDetector;
use super::{ConnectTarget, Connector, ShellError, ShellResult, ShellTransport};

/// Pending output kept by the reader while the queue is full.
const MAX_PENDING_BYTES: usize = 1024 * 1024;

/// How long `close()` waits for the reader task before aborting it.
const CLOSE_WAIT: Duration = Duration::from_secs(1);

/// Timing and matching knobs for a shell session.
#[derive(Debug, Clone)]
pub struct ShellOptions {
    pub prompt: PromptDetector,
    /// Pause after connecting so the banner and first prompt are printed.
    pub banner_settle: Duration,
    /// Reader wait when the transport has nothing to offer.
    pub idle_backoff: Duration,
    /// Reader pause after a transport read error.
    pub error_backoff: Duration,
    /// Interval at which `run_command` re-checks for the prompt.
    pub poll_interval: Duration,
    /// Capacity of the decoded output queue, in chunks.
    pub queue_capacity: usize,
}

impl Default for ShellOptions {
    fn default() -> Self {
        Self {
            prompt: PromptDetector::default(),
            banner_settle: Duration::from_millis(200),
            idle_backoff: Duration::from_millis(20),
            error_backoff: Duration::from_millis(50),
            poll_interval: Duration::from_millis(50),
            queue_capacity: 1024,
        }
    }
}

enum Input {
    Data(Vec<u8>, oneshot::Sender<ShellResult<()>>),
    Resize(u32, u32, oneshot::Sender<ShellResult<()>>),
    Close,
}

/// One live remote shell.
///
/// All transport I/O happens on the reader task; callers talk to it through
/// channels, so a session can be shared behind an `Arc` without extra locks.
pub struct ShellSession {
    label: String,
    input: mpsc::UnboundedSender<Input>,
    output: Mutex<mpsc::Receiver<String>>,
    reader: std::sync::Mutex<Option<JoinHandle<()>>>,
    closed: Arc<AtomicBool>,
    options: ShellOptions,
}

impl ShellSession {
    /// Open a transport through `connector` and start reading from it.
    pub async fn connect(
        connector: &dyn Connector,
        target: &ConnectTarget,
        options: ShellOptions,
    ) -> ShellResult<Self> {
        let transport = connector.connect(target).await?;
        let settle = options.banner_settle;
        let session = Self::start(target.robot_id.clone(), transport, options);
        if !settle.is_zero() {
            tokio::time::sleep(settle).await;
        }
        Ok(session)
    }

    /// Wrap an already open transport.
    pub fn start(
        label: impl Into<String>,
        transport: Box<dyn ShellTransport>,
        options: ShellOptions,
    ) -> Self {
        let label = label.into();
        let (input_tx, input_rx) = mpsc::unbounded_channel();
        let (output_tx, output_rx) = mpsc::channel(options.queue_capacity.max(1));
        let closed = Arc::new(AtomicBool::new(false));

        let reader = tokio::spawn(reader_loop(
            label.clone(),
            transport,
            input_rx,
            output_tx,
            Arc::clone(&closed),
            options.idle_backoff,
            options.error_backoff,
        ));

        Self {
            label,
            input: input_tx,
            output: Mutex::new(output_rx),
            reader: std::sync::Mutex::new(Some(reader)),
            closed,
            options,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Send raw text (keystrokes). No newline is appended.
    pub async fn send(&self, text: &str) -> ShellResult<()> {
        if self.is_closed() {
            return Err(ShellError::Closed);
        }
        let (ack_tx, ack_rx) = oneshot::channel();
        self.input
            .send(Input::Data(text.as_bytes().to_vec(), ack_tx))
            .map_err(|_| ShellError::Closed)?;
        ack_rx.await.map_err(|_| ShellError::Closed)?
    }

    /// Propagate terminal geometry to the remote pty.
    pub async fn resize(&self, width: u32, height: u32) -> ShellResult<()> {
        if self.is_closed() {
            return Err(ShellError::Closed);
        }
        let (ack_tx, ack_rx) = oneshot::channel();
        self.input
            .send(Input::Resize(width, height, ack_tx))
            .map_err(|_| ShellError::Closed)?;
        ack_rx.await.map_err(|_| ShellError::Closed)?
    }

    /// Drain up to `max_chunks` decoded chunks without waiting.
    pub async fn read(&self, max_chunks: usize) -> String {
        let mut output = self.output.lock().await;
        let mut text = String::new();
        for _ in 0..max_chunks {
            match output.try_recv() {
                Ok(chunk) => text.push_str(&chunk),
                Err(_) => break,
            }
        }
        text
    }

    /// Send `command` and wait until the output tail looks like a prompt.
    ///
    /// On timeout the output captured so far is returned. Holding the output
    /// queue for the whole call keeps concurrent commands on one session from
    /// interleaving their output.
    pub async fn run_command(&self, command: &str, timeout: Duration) -> ShellResult<String> {
        let mut output = self.output.lock().await;
        while output.try_recv().is_ok() {}

        self.send(&format!("{command}\n")).await?;

        let started = Instant::now();
        let mut buffer = String::new();
        loop {
            while let Ok(chunk) = output.try_recv() {
                buffer.push_str(&chunk);
            }
            if self.options.prompt.is_complete(&buffer) {
                return Ok(buffer);
            }
            if self.is_closed() {
                debug!(
                    "Shell on {} closed while running command, returning {} bytes",
                    self.label,
                    buffer.len()
                );
                return Ok(buffer);
            }

            let elapsed = started.elapsed();
            if elapsed >= timeout {
                debug!(
                    "Command on {} timed out after {:?}, returning partial output",
                    self.label, timeout
                );
                return Ok(buffer);
            }
            tokio::time::sleep(self.options.poll_interval.min(timeout - elapsed)).await;
        }
    }

    /// Stop the reader and release the transport. Safe to call repeatedly.
    pub async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let _ = self.input.send(Input::Close);

        let handle = match self.reader.lock() {
            Ok(mut guard) => guard.take(),
            Err(_) => None,
        };
        let Some(handle) = handle else {
            return;
        };

        let abort = handle.abort_handle();
        if tokio::time::timeout(CLOSE_WAIT, handle).await.is_err() {
            warn!("Shell reader for {} did not stop in time, aborting", self.label);
            abort.abort();
        }
    }
}

impl Drop for ShellSession {
    fn drop(&mut self) {
        if let Ok(guard) = self.reader.get_mut() {
            if let Some(handle) = guard.take() {
                handle.abort();
            }
        }
    }
}

async fn reader_loop(
    label: String,
    mut transport: Box<dyn ShellTransport>,
    mut input: mpsc::UnboundedReceiver<Input>,
    output: mpsc::Sender<String>,
    closed: Arc<AtomicBool>,
    idle_backoff: Duration,
    error_backoff: Duration,
) {
    let mut decoder = Utf8Decoder::default();
    let mut pending = String::new();

    'outer: loop {
        loop {
            match input.try_recv() {
                Ok(Input::Data(bytes, ack)) => {
                    let _ = ack.send(transport.send(&bytes).await);
                }
                Ok(Input::Resize(width, height, ack)) => {
                    let _ = ack.send(transport.resize(width, height).await);
                }
                Ok(Input::Close) | Err(mpsc::error::TryRecvError::Disconnected) => break 'outer,
                Err(mpsc::error::TryRecvError::Empty) => break,
            }
        }

        if !flush(&output, &mut pending) {
            break;
        }

        match tokio::time::timeout(idle_backoff, transport.recv()).await {
            Ok(Ok(Some(bytes))) => {
                pending.push_str(&decoder.decode(&bytes));
                if pending.len() > MAX_PENDING_BYTES {
                    let cut = pending.len() - MAX_PENDING_BYTES;
                    let boundary = (cut..pending.len())
                        .find(|i| pending.is_char_boundary(*i))
                        .unwrap_or(pending.len());
                    pending.drain(..boundary);
                }
                if !flush(&output, &mut pending) {
                    break;
                }
            }
            Ok(Ok(None)) => {
                debug!("Shell stream for {} ended", label);
                break;
            }
            Ok(Err(err)) => {
                debug!("Shell read error on {}: {}", label, err);
                tokio::time::sleep(error_backoff).await;
            }
            Err(_) => {}
        }
    }

    closed.store(true, Ordering::SeqCst);
    let _ = flush(&output, &mut pending);
    transport.close().await;
    debug!("Shell reader for {} stopped", label);
}

/// Push pending text into the queue. Returns false once the consumer is gone.
fn flush(output: &mpsc::Sender<String>, pending: &mut String) -> bool {
    if pending.is_empty() {
        return true;
    }
    match output.try_send(std::mem::take(pending)) {
        Ok(()) => true,
        Err(mpsc::error::TrySendError::Full(text)) => {
            *pending = text;
            true
        }
        Err(mpsc::error::TrySendError::Closed(_)) => false,
    }
}

/// Incremental UTF-8 decoder that keeps split code points between chunks.
#[derive(Debug, Default)]
struct Utf8Decoder {
    carry: Vec<u8>,
}

impl Utf8Decoder {
    fn decode(&mut self, bytes: &[u8]) -> String {
        self.carry.extend_from_slice(bytes);
        let mut out = String::new();
        loop {
            match std::str::from_utf8(&self.carry) {
                Ok(text) => {
                    out.push_str(text);
                    self.carry.clear();
                    return out;
                }
                Err(err) => {
                    let valid = err.valid_up_to();
                    out.push_str(&String::from_utf8_lossy(&self.carry[..valid]));
                    match err.error_len() {
                        Some(len) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            self.carry.drain(..valid + len);
                        }
                        None => {
                            self.carry.drain(..valid);
                            return out;
                        }
                    }
                }
            }
        }
    }
}
