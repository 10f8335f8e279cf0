//! Child process ↔ message queue bridge.
//!
//! Data flow:
//! ```text
//! submit() → InputQueue → stdin writer task → child stdin
//! child stdout → stdout reader task ─┐
//! child stderr → stderr reader task ─┴→ output mpsc → OutputHub → subscribers
//! ```
//!
//! Every stream is owned by exactly one long-lived task, so no read is ever
//! abandoned halfway through a line. A supervisor task owns the `Child`,
//! notices when both output streams have closed, reaps the process and
//! publishes the terminal state.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{Notify, mpsc, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use pipebridge_core::message::{OutputStream, trim_line_ending};
use pipebridge_core::{Config, FanoutPolicy, Message, OverflowPolicy};

use super::output::{OutputHub, OutputSubscription};
use super::queue::{InputQueue, Pushed, QueueError};

/// How long the readers get to drain the pipes after a forced kill.
const KILL_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Configuration for the bridged process.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Executable to spawn.
    pub program: PathBuf,
    /// Arguments passed to the executable.
    pub args: Vec<String>,
    /// Maximum lines waiting to be written to stdin.
    pub input_capacity: usize,
    /// Maximum messages waiting to be consumed.
    pub output_capacity: usize,
    /// Applied when the input queue is full.
    pub overflow: OverflowPolicy,
    /// Distribution of output among subscribers.
    pub fanout: FanoutPolicy,
    /// Grace period before escalating shutdown.
    pub terminate_timeout: Duration,
    /// Longest single output message; longer lines are split.
    pub max_line_bytes: usize,
}

impl BridgeConfig {
    /// Bridge `program` with default queue settings.
    pub fn new(program: impl Into<PathBuf>) -> Self {
        let defaults = Config::default();
        Self::from_config(program, &defaults)
    }

    /// Bridge `program` using the queue and process settings of `config`.
    pub fn from_config(program: impl Into<PathBuf>, config: &Config) -> Self {
        Self {
            program: program.into(),
            args: config.process.args.clone(),
            input_capacity: config.queues.input_capacity,
            output_capacity: config.queues.output_capacity,
            overflow: config.queues.overflow,
            fanout: config.fanout,
            terminate_timeout: Duration::from_secs(config.process.terminate_timeout_secs),
            max_line_bytes: config.process.max_line_bytes,
        }
    }

    #[must_use]
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub const fn with_input_capacity(mut self, capacity: usize, overflow: OverflowPolicy) -> Self {
        self.input_capacity = capacity;
        self.overflow = overflow;
        self
    }

    #[must_use]
    pub const fn with_fanout(mut self, fanout: FanoutPolicy) -> Self {
        self.fanout = fanout;
        self
    }

    #[must_use]
    pub const fn with_terminate_timeout(mut self, timeout: Duration) -> Self {
        self.terminate_timeout = timeout;
        self
    }

    #[must_use]
    pub const fn with_max_line_bytes(mut self, max: usize) -> Self {
        self.max_line_bytes = max;
        self
    }
}

/// Lifecycle of the bridged process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    Running,
    /// Both output streams closed and the child was reaped.
    /// `exit_code` is `None` when the child was killed by a signal.
    Terminated { exit_code: Option<i32> },
}

impl BridgeState {
    pub const fn is_terminated(self) -> bool {
        matches!(self, Self::Terminated { .. })
    }
}

/// Errors from bridge operations.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("Failed to spawn {program}: {reason}")]
    SpawnFailed { program: String, reason: String },

    #[error("Process unavailable: it has exited or stdin is closed")]
    ProcessUnavailable,

    #[error("Input queue full (capacity {capacity})")]
    QueueFull { capacity: usize },
}

/// Bridge between one child process and any number of queue consumers.
pub struct ProcessBridge {
    program: String,
    pid: Option<u32>,
    input: Arc<InputQueue<Vec<u8>>>,
    output: OutputHub,
    state_rx: watch::Receiver<BridgeState>,
    kill: Arc<Notify>,
    terminate_timeout: Duration,
}

impl ProcessBridge {
    /// Spawn the process with all three streams piped and start its tasks.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(config: BridgeConfig) -> Result<Self, BridgeError> {
        let program = config.program.display().to_string();
        let spawn_failed = |reason: String| BridgeError::SpawnFailed {
            program: program.clone(),
            reason,
        };

        let mut child = Command::new(&config.program)
            .args(&config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| spawn_failed(e.to_string()))?;

        let pid = child.id();
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| spawn_failed("Failed to capture stdin".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| spawn_failed("Failed to capture stdout".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| spawn_failed("Failed to capture stderr".to_string()))?;

        info!(program = %program, ?pid, args = ?config.args, "Spawned bridged process");

        let input = Arc::new(InputQueue::new(config.input_capacity, config.overflow));
        let (out_tx, out_rx) = mpsc::channel(config.output_capacity.max(1));
        let (state_tx, state_rx) = watch::channel(BridgeState::Running);
        let kill = Arc::new(Notify::new());

        tokio::spawn(write_stdin(stdin, Arc::clone(&input)));
        let mut readers = JoinSet::new();
        readers.spawn(read_stream(
            OutputStream::Stdout,
            stdout,
            out_tx.clone(),
            config.max_line_bytes,
        ));
        readers.spawn(read_stream(
            OutputStream::Stderr,
            stderr,
            out_tx.clone(),
            config.max_line_bytes,
        ));
        tokio::spawn(supervise(Supervisor {
            child,
            readers,
            input: Arc::clone(&input),
            out_tx,
            state_tx,
            kill: Arc::clone(&kill),
            terminate_timeout: config.terminate_timeout,
        }));

        Ok(Self {
            program,
            pid,
            input,
            output: OutputHub::new(config.fanout, out_rx, config.output_capacity),
            state_rx,
            kill,
            terminate_timeout: config.terminate_timeout,
        })
    }

    /// Queue one line for the child's stdin. A newline is appended on write.
    ///
    /// Suspends only under the `block` overflow policy.
    pub async fn submit(&self, line: impl Into<Vec<u8>>) -> Result<Pushed, BridgeError> {
        match self.input.push(line.into()).await {
            Ok(Pushed::DroppedOldest) => {
                warn!(
                    capacity = self.input.capacity(),
                    "Input queue full, dropped oldest line"
                );
                Ok(Pushed::DroppedOldest)
            }
            Ok(pushed) => Ok(pushed),
            Err(QueueError::Full) => Err(BridgeError::QueueFull {
                capacity: self.input.capacity(),
            }),
            Err(QueueError::Closed) => Err(BridgeError::ProcessUnavailable),
        }
    }

    /// A new consumer handle on the output, following the fan-out policy.
    pub fn subscribe(&self) -> OutputSubscription {
        self.output.subscribe()
    }

    /// Wait for the next output message.
    ///
    /// Returns `None` once the bridge has terminated and its output is drained.
    pub async fn next_output(&self) -> Option<Message> {
        self.subscribe().recv().await
    }

    pub fn state(&self) -> BridgeState {
        *self.state_rx.borrow()
    }

    pub fn is_terminated(&self) -> bool {
        self.state().is_terminated()
    }

    /// Wait until the process has been reaped.
    pub async fn wait_terminated(&self) -> BridgeState {
        let mut rx = self.state_rx.clone();
        let waited = rx.wait_for(|state| state.is_terminated()).await.map(|state| *state);
        match waited {
            Ok(state) => state,
            // The supervisor publishes before it exits, so this is the final value.
            Err(_) => *rx.borrow(),
        }
    }

    pub const fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// Lines queued but not yet written to stdin.
    pub fn pending_input(&self) -> usize {
        self.input.len()
    }

    /// Stop the process gracefully.
    ///
    /// Queued input is still written, then stdin is closed. If the child has
    /// not exited after the terminate timeout it gets `SIGINT`, and after
    /// another timeout it is killed.
    pub async fn stop(&self) -> BridgeState {
        info!(program = %self.program, pid = ?self.pid, "Stopping bridged process");
        self.input.close();

        if let Ok(state) = tokio::time::timeout(self.terminate_timeout, self.wait_terminated()).await
        {
            return state;
        }

        #[cfg(unix)]
        {
            if let Some(pid) = self.pid {
                send_interrupt(pid);
                if let Ok(state) =
                    tokio::time::timeout(self.terminate_timeout, self.wait_terminated()).await
                {
                    return state;
                }
            }
        }

        warn!(pid = ?self.pid, "Timeout waiting for graceful shutdown, killing");
        self.kill.notify_one();
        self.wait_terminated().await
    }
}

impl Drop for ProcessBridge {
    fn drop(&mut self) {
        if !self.is_terminated() {
            self.input.close();
            self.kill.notify_one();
        }
    }
}

#[cfg(unix)]
fn send_interrupt(pid: u32) {
    let Ok(raw_pid) = i32::try_from(pid) else {
        return;
    };
    // SAFETY: pid comes from our own Child handle and kill(2) has no memory
    // safety requirements.
    #[allow(unsafe_code)]
    let ret = unsafe { libc::kill(raw_pid, libc::SIGINT) };
    if ret != 0 {
        let err = std::io::Error::last_os_error();
        warn!(pid, error = %err, "Failed to send SIGINT");
    }
}

async fn write_stdin(mut stdin: ChildStdin, input: Arc<InputQueue<Vec<u8>>>) {
    while let Some(mut line) = input.pop().await {
        line.push(b'\n');
        if let Err(e) = stdin.write_all(&line).await {
            error!(error = %e, "Failed to write to stdin");
            let discarded = input.close_and_clear();
            debug!(discarded, "Input queue closed after stdin failure");
            return;
        }
        if let Err(e) = stdin.flush().await {
            error!(error = %e, "Failed to flush stdin");
            input.close_and_clear();
            return;
        }
    }
    // Dropping stdin here delivers EOF to the child.
    debug!("stdin writer finished");
}

async fn read_stream<R>(
    stream: OutputStream,
    pipe: R,
    out_tx: mpsc::Sender<Message>,
    max_line_bytes: usize,
) where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(pipe);
    let limit = u64::try_from(max_line_bytes.max(1)).unwrap_or(u64::MAX);
    loop {
        let mut line = Vec::new();
        match (&mut reader).take(limit).read_until(b'\n', &mut line).await {
            Ok(0) => {
                debug!(%stream, "EOF");
                break;
            }
            Ok(_) => {
                trim_line_ending(&mut line);
                if out_tx.send(stream.tag(line)).await.is_err() {
                    debug!(%stream, "Output channel closed");
                    break;
                }
            }
            Err(e) => {
                warn!(%stream, error = %e, "Read failed, closing stream");
                break;
            }
        }
    }
    debug!(%stream, "Reader finished");
}

struct Supervisor {
    child: Child,
    readers: JoinSet<()>,
    input: Arc<InputQueue<Vec<u8>>>,
    out_tx: mpsc::Sender<Message>,
    state_tx: watch::Sender<BridgeState>,
    kill: Arc<Notify>,
    terminate_timeout: Duration,
}

async fn supervise(sup: Supervisor) {
    let Supervisor {
        mut child,
        mut readers,
        input,
        out_tx,
        state_tx,
        kill,
        terminate_timeout,
    } = sup;
    let pid = child.id();

    let killed = tokio::select! {
        () = join_all(&mut readers) => false,
        () = kill.notified() => true,
    };

    if killed {
        warn!(?pid, "Killing bridged process");
        if let Err(e) = child.start_kill() {
            warn!(?pid, error = %e, "Failed to kill process");
        }
        if tokio::time::timeout(KILL_DRAIN_TIMEOUT, join_all(&mut readers))
            .await
            .is_err()
        {
            readers.abort_all();
        }
    } else {
        debug!(?pid, "Both output streams closed");
    }

    let discarded = input.close_and_clear();
    if discarded > 0 {
        warn!(?pid, discarded, "Discarded input queued for exited process");
    }

    let exit_code = match tokio::time::timeout(terminate_timeout, child.wait()).await {
        Ok(Ok(status)) => {
            info!(?pid, %status, "Bridged process exited");
            status.code()
        }
        Ok(Err(e)) => {
            warn!(?pid, error = %e, "Error waiting for process");
            None
        }
        Err(_) => {
            warn!(?pid, "Process closed its output but did not exit, killing");
            child.kill().await.ok();
            child.wait().await.ok().and_then(|status| status.code())
        }
    };

    state_tx.send_replace(BridgeState::Terminated { exit_code });

    let notice = Message::Raw(exit_notice(exit_code));
    if out_tx.send_timeout(notice, terminate_timeout).await.is_err() {
        debug!(?pid, "Exit notice not delivered");
    }
}

/// Wait for every reader. Cancel-safe.
async fn join_all(readers: &mut JoinSet<()>) {
    while let Some(joined) = readers.join_next().await {
        if let Err(e) = joined {
            error!(error = %e, "Reader task panicked");
        }
    }
}

/// Text of the pass-through message announcing process exit.
pub fn exit_notice(exit_code: Option<i32>) -> String {
    exit_code.map_or_else(|| "EXIT: signal".to_string(), |code| format!("EXIT: {code}"))
}
