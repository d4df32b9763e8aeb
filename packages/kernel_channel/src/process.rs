use serde::{Deserialize, Serialize};
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::error::KernelError;

const OUTPUT_CAPACITY: usize = 1024;
const COMMAND_CAPACITY: usize = 64;

/// How to launch a local kernel process.
///
/// The process must speak newline-delimited JSON envelopes on stdin/stdout.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelSpec {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub working_dir: Option<String>,
    #[serde(default)]
    pub env: Vec<(String, String)>,
}

/// State of a kernel channel
#[derive(Clone, Debug, Serialize)]
pub struct KernelState {
    pub running: bool,
    pub pid: Option<u32>,
    pub command: Option<String>,
    pub frames_sent: u64,
    pub frames_received: u64,
}

/// Everything a kernel channel emits
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum KernelOutput {
    /// One raw protocol frame (a serialized envelope)
    Frame { data: String, timestamp: i64 },
    /// The kernel is gone; no more frames will follow
    Exited { exit_code: Option<i32> },
}

pub(crate) enum KernelCommand {
    SendFrame {
        frame: String,
        respond_to: oneshot::Sender<Result<(), KernelError>>,
    },
    GetState {
        respond_to: oneshot::Sender<KernelState>,
    },
    Kill {
        signal: Option<String>,
        respond_to: oneshot::Sender<Result<(), KernelError>>,
    },
}

/// Handle to one kernel's raw message channel.
///
/// Cloning is cheap. Dropping handles never stops the kernel; only `kill` does.
#[derive(Clone)]
pub struct KernelHandle {
    sender: mpsc::Sender<KernelCommand>,
    output_tx: broadcast::Sender<KernelOutput>,
}

impl std::fmt::Debug for KernelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KernelHandle")
            .field("subscribers", &self.output_tx.receiver_count())
            .finish()
    }
}

impl KernelHandle {
    /// Launch a kernel process and return a handle to its channel.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(spec: &KernelSpec) -> Result<Self, KernelError> {
        KernelActor::spawn_process(spec)
    }

    /// Create a channel whose far end lives in this process.
    pub fn in_memory() -> (Self, KernelPeer) {
        KernelActor::spawn_in_memory()
    }

    /// Write one frame to the kernel
    pub async fn send_frame(&self, frame: impl Into<String>) -> Result<(), KernelError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(KernelCommand::SendFrame {
                frame: frame.into(),
                respond_to: tx,
            })
            .await
            .map_err(|_| KernelError::ChannelError("Failed to send frame message".into()))?;
        rx.await
            .map_err(|_| KernelError::ChannelError("Failed to receive frame response".into()))?
    }

    /// Get the current state of the channel
    pub async fn state(&self) -> Result<KernelState, KernelError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(KernelCommand::GetState { respond_to: tx })
            .await
            .map_err(|_| KernelError::ChannelError("Failed to send state message".into()))?;
        rx.await
            .map_err(|_| KernelError::ChannelError("Failed to receive state response".into()))
    }

    /// Signal the kernel process (`SIGTERM` when `None`, `SIGINT` interrupts)
    pub async fn kill(&self, signal: Option<&str>) -> Result<(), KernelError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(KernelCommand::Kill {
                signal: signal.map(|s| s.to_string()),
                respond_to: tx,
            })
            .await
            .map_err(|_| KernelError::ChannelError("Failed to send kill message".into()))?;
        rx.await
            .map_err(|_| KernelError::ChannelError("Failed to receive kill response".into()))?
    }

    /// Subscribe to frames emitted by the kernel
    pub fn subscribe(&self) -> broadcast::Receiver<KernelOutput> {
        self.output_tx.subscribe()
    }

    /// Whether both handles drive the same kernel
    pub fn same_channel(&self, other: &KernelHandle) -> bool {
        self.sender.same_channel(&other.sender)
    }
}

/// The far end of an in-memory kernel channel.
pub struct KernelPeer {
    inbound: mpsc::Receiver<String>,
    output_tx: broadcast::Sender<KernelOutput>,
}

impl KernelPeer {
    /// Next frame written by the handle side
    pub async fn recv(&mut self) -> Option<String> {
        self.inbound.recv().await
    }

    pub fn try_recv(&mut self) -> Option<String> {
        self.inbound.try_recv().ok()
    }

    /// Emit a frame as if the kernel had produced it. Returns the subscriber count.
    pub fn emit(&self, frame: impl Into<String>) -> usize {
        self.output_tx
            .send(KernelOutput::Frame {
                data: frame.into(),
                timestamp: chrono::Utc::now().timestamp_millis(),
            })
            .unwrap_or(0)
    }

    /// Announce that the kernel exited
    pub fn exit(&self, exit_code: Option<i32>) {
        let _ = self.output_tx.send(KernelOutput::Exited { exit_code });
    }

    pub fn subscriber_count(&self) -> usize {
        self.output_tx.receiver_count()
    }
}

enum Backend {
    Process {
        child: Child,
        stdin: Option<ChildStdin>,
    },
    InMemory {
        peer_tx: mpsc::Sender<String>,
    },
}

/// Actor that owns the kernel end of one channel
struct KernelActor {
    backend: Backend,
    state: KernelState,
    receiver: mpsc::Receiver<KernelCommand>,
    output_tx: broadcast::Sender<KernelOutput>,
    stdout_eof: Option<oneshot::Receiver<()>>,
    frame_count: broadcast::Receiver<KernelOutput>,
}

impl KernelActor {
    fn spawn_process(spec: &KernelSpec) -> Result<KernelHandle, KernelError> {
        let mut cmd = Command::new(&spec.command);
        cmd.args(&spec.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        if let Some(dir) = &spec.working_dir {
            info!("Setting kernel working directory: {}", dir);
            cmd.current_dir(dir);
        }
        for (key, value) in &spec.env {
            cmd.env(key, value);
        }

        info!(
            "Spawning kernel command: {} with args: {:?}",
            spec.command, spec.args
        );

        let mut child = cmd.spawn().map_err(|e| {
            error!("Failed to spawn kernel '{}': {}", spec.command, e);
            KernelError::SpawnFailed(e.to_string())
        })?;

        let stdin = child.stdin.take();
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| KernelError::SpawnFailed("kernel stdout unavailable".into()))?;
        let stderr = child.stderr.take();

        let pid = child.id();
        info!("Kernel process started with PID: {:?}", pid);

        let (output_tx, frame_count) = broadcast::channel(OUTPUT_CAPACITY);
        let (msg_tx, msg_rx) = mpsc::channel(COMMAND_CAPACITY);
        let (eof_tx, eof_rx) = oneshot::channel();

        // One frame per line on stdout
        let output_tx_reader = output_tx.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        if line.trim().is_empty() {
                            continue;
                        }
                        let _ = output_tx_reader.send(KernelOutput::Frame {
                            data: line,
                            timestamp: chrono::Utc::now().timestamp_millis(),
                        });
                    }
                    Ok(None) => {
                        info!("Kernel stdout EOF - process has exited");
                        break;
                    }
                    Err(e) => {
                        warn!("Error reading kernel output: {}", e);
                        break;
                    }
                }
            }
            let _ = eof_tx.send(());
        });

        if let Some(stderr) = stderr {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(pid = ?pid, "kernel stderr: {}", line);
                }
            });
        }

        let actor = Self {
            backend: Backend::Process { child, stdin },
            state: KernelState {
                running: true,
                pid,
                command: Some(spec.command.clone()),
                frames_sent: 0,
                frames_received: 0,
            },
            receiver: msg_rx,
            output_tx: output_tx.clone(),
            stdout_eof: Some(eof_rx),
            frame_count,
        };

        tokio::spawn(actor.run());

        Ok(KernelHandle {
            sender: msg_tx,
            output_tx,
        })
    }

    fn spawn_in_memory() -> (KernelHandle, KernelPeer) {
        let (output_tx, frame_count) = broadcast::channel(OUTPUT_CAPACITY);
        let (msg_tx, msg_rx) = mpsc::channel(COMMAND_CAPACITY);
        let (peer_tx, peer_rx) = mpsc::channel(COMMAND_CAPACITY);

        let actor = Self {
            backend: Backend::InMemory { peer_tx },
            state: KernelState {
                running: true,
                pid: None,
                command: None,
                frames_sent: 0,
                frames_received: 0,
            },
            receiver: msg_rx,
            output_tx: output_tx.clone(),
            stdout_eof: None,
            frame_count,
        };

        tokio::spawn(actor.run());

        (
            KernelHandle {
                sender: msg_tx,
                output_tx: output_tx.clone(),
            },
            KernelPeer {
                inbound: peer_rx,
                output_tx,
            },
        )
    }

    async fn run(mut self) {
        debug!(pid = ?self.state.pid, "Kernel actor started");

        loop {
            tokio::select! {
                cmd = self.receiver.recv() => {
                    let Some(cmd) = cmd else { break };
                    self.handle_command(cmd).await;
                }
                _ = wait_for_eof(&mut self.stdout_eof), if self.stdout_eof.is_some() => {
                    self.stdout_eof = None;
                    self.handle_process_exit().await;
                }
                output = self.frame_count.recv() => {
                    match output {
                        Ok(KernelOutput::Frame { .. }) => self.state.frames_received += 1,
                        Ok(KernelOutput::Exited { .. }) => self.state.running = false,
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            self.state.frames_received += n;
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        }

        debug!(pid = ?self.state.pid, "Kernel actor shutting down");
    }

    async fn handle_command(&mut self, cmd: KernelCommand) {
        match cmd {
            KernelCommand::SendFrame { frame, respond_to } => {
                let result = self.handle_send_frame(frame).await;
                if result.is_ok() {
                    self.state.frames_sent += 1;
                }
                let _ = respond_to.send(result);
            }
            KernelCommand::GetState { respond_to } => {
                let _ = respond_to.send(self.state.clone());
            }
            KernelCommand::Kill { signal, respond_to } => {
                let result = self.handle_kill(signal.as_deref());
                let _ = respond_to.send(result);
            }
        }
    }

    async fn handle_send_frame(&mut self, frame: String) -> Result<(), KernelError> {
        if !self.state.running {
            return Err(KernelError::ProcessExited);
        }
        if frame.contains('\n') {
            return Err(KernelError::WriteFailed(
                "frame must not contain a newline".into(),
            ));
        }

        match &mut self.backend {
            Backend::Process { stdin, .. } => {
                let stdin = stdin
                    .as_mut()
                    .ok_or_else(|| KernelError::WriteFailed("kernel stdin unavailable".into()))?;
                stdin
                    .write_all(frame.as_bytes())
                    .await
                    .map_err(|e| KernelError::WriteFailed(e.to_string()))?;
                stdin
                    .write_all(b"\n")
                    .await
                    .map_err(|e| KernelError::WriteFailed(e.to_string()))?;
                stdin
                    .flush()
                    .await
                    .map_err(|e| KernelError::WriteFailed(e.to_string()))
            }
            Backend::InMemory { peer_tx } => peer_tx
                .send(frame)
                .await
                .map_err(|_| KernelError::ProcessExited),
        }
    }

    fn handle_kill(&mut self, signal: Option<&str>) -> Result<(), KernelError> {
        match &mut self.backend {
            Backend::InMemory { .. } => {
                self.state.running = false;
                let _ = self.output_tx.send(KernelOutput::Exited { exit_code: None });
                Ok(())
            }
            Backend::Process { child, .. } => match signal {
                Some("SIGTERM") | Some("SIGINT") | None => {
                    #[cfg(unix)]
                    {
                        use nix::sys::signal::{Signal, kill};
                        use nix::unistd::Pid;

                        let sig = if signal == Some("SIGINT") {
                            Signal::SIGINT
                        } else {
                            Signal::SIGTERM
                        };
                        if let Some(pid) = self.state.pid {
                            kill(Pid::from_raw(pid as i32), sig)
                                .map_err(|e| KernelError::KillFailed(e.to_string()))?;
                        }
                        Ok(())
                    }
                    #[cfg(not(unix))]
                    {
                        if signal == Some("SIGINT") {
                            return Err(KernelError::KillFailed(
                                "SIGINT is not supported on this platform".into(),
                            ));
                        }
                        child
                            .start_kill()
                            .map_err(|e| KernelError::KillFailed(e.to_string()))
                    }
                }
                Some("SIGKILL") => child
                    .start_kill()
                    .map_err(|e| KernelError::KillFailed(e.to_string())),
                Some(sig) => Err(KernelError::KillFailed(format!(
                    "Unsupported signal: {}",
                    sig
                ))),
            },
        }
    }

    async fn handle_process_exit(&mut self) {
        let exit_code = match &mut self.backend {
            Backend::Process { child, stdin } => {
                stdin.take();
                match child.wait().await {
                    Ok(status) => status.code(),
                    Err(e) => {
                        warn!("Failed to reap kernel process: {}", e);
                        None
                    }
                }
            }
            Backend::InMemory { .. } => None,
        };

        info!(pid = ?self.state.pid, "Kernel process exited with code {:?}", exit_code);
        self.state.running = false;
        self.state.pid = None;
        let _ = self.output_tx.send(KernelOutput::Exited { exit_code });
    }
}

async fn wait_for_eof(eof: &mut Option<oneshot::Receiver<()>>) {
    match eof {
        Some(rx) => {
            let _ = rx.await;
        }
        None => std::future::pending().await,
    }
}
