//! Gateway process supervision.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use kernel_ipc::{KernelProcessMessage, MainToKernel};
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader, Lines};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};

/// How long to keep reading pipes after the gateway exits, so lines it wrote
/// just before exiting still go out ahead of `end`.
const DRAIN_AFTER_EXIT: Duration = Duration::from_millis(200);

/// How long after `request-close` the host waits for the killed gateway to
/// be reaped before reporting `end` anyway.
const CLOSE_REAP_TIMEOUT: Duration = Duration::from_secs(2);

/// What to spawn and how.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    /// Gateway executable.
    pub command: String,
    /// Arguments passed to the gateway.
    pub args: Vec<String>,
    /// Working directory; inherits the host's when unset.
    pub cwd: Option<PathBuf>,
    /// Forward stderr lines as well as stdout. The Jupyter kernel gateway
    /// logs its listening address on stderr.
    pub forward_stderr: bool,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            command: "jupyter".to_string(),
            args: vec![
                "kernelgateway".to_string(),
                "--KernelGatewayApp.ip=127.0.0.1".to_string(),
                "--KernelGatewayApp.port=0".to_string(),
            ],
            cwd: None,
            forward_stderr: true,
        }
    }
}

/// Fires once. The exit watcher and the close deadline both report `end`
/// through it, so a gateway gets a single `end` however it goes away.
#[derive(Debug, Default)]
pub struct ExitLatch {
    fired: bool,
}

impl ExitLatch {
    /// Returns `true` the first time only.
    pub fn fire(&mut self) -> bool {
        !std::mem::replace(&mut self.fired, true)
    }

    pub fn has_fired(&self) -> bool {
        self.fired
    }
}

/// The orchestrator's side of a running host.
pub struct HostHandle {
    events: mpsc::UnboundedReceiver<KernelProcessMessage>,
    commands: mpsc::UnboundedSender<MainToKernel>,
    task: JoinHandle<()>,
}

impl HostHandle {
    /// Next lifecycle/stdout event. `None` once the host loop has finished
    /// and every event has been received.
    pub async fn next_event(&mut self) -> Option<KernelProcessMessage> {
        self.events.recv().await
    }

    /// Send a `main-to-kernel` command. Returns `false` if the host is gone.
    pub fn send(&self, command: MainToKernel) -> bool {
        self.commands.send(command).is_ok()
    }

    /// Ask the host to close and wait for its loop to finish, returning the
    /// events it emitted in the meantime (typically the final `end`).
    pub async fn close(self, timeout: Duration) -> Vec<KernelProcessMessage> {
        let HostHandle {
            mut events,
            commands,
            task,
        } = self;
        let _ = commands.send(MainToKernel::RequestClose);
        drop(commands);

        let mut remaining = Vec::new();
        let drain = async {
            while let Some(event) = events.recv().await {
                remaining.push(event);
            }
            let _ = task.await;
        };
        if tokio::time::timeout(timeout, drain).await.is_err() {
            warn!("[kernel-host] Host did not close within {:?}", timeout);
        }
        remaining
    }

    /// Whether the host loop has finished.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

/// Spawns the host task.
pub struct KernelHost;

impl KernelHost {
    /// Start a host task that spawns the gateway described by `config`.
    pub fn spawn(config: HostConfig) -> HostHandle {
        let (events_tx, events) = mpsc::unbounded_channel();
        let (commands, commands_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run_host(config, events_tx, commands_rx));
        HostHandle {
            events,
            commands,
            task,
        }
    }
}

fn start(config: &HostConfig) -> std::io::Result<Child> {
    let mut cmd = Command::new(&config.command);
    cmd.args(&config.args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .env("PYTHONUNBUFFERED", "1");
    if let Some(ref cwd) = config.cwd {
        cmd.current_dir(cwd);
    }

    // Own process group so the whole tree can be signalled at once.
    #[cfg(unix)]
    cmd.process_group(0);

    cmd.kill_on_drop(true).spawn()
}

type LineReader = Lines<BufReader<Box<dyn AsyncRead + Send + Unpin>>>;

fn line_reader<R: AsyncRead + Send + Unpin + 'static>(pipe: Option<R>) -> Option<LineReader> {
    pipe.map(|p| BufReader::new(Box::new(p) as Box<dyn AsyncRead + Send + Unpin>).lines())
}

/// Read the next line, closing the reader on EOF or error.
async fn next_line(reader: &mut Option<LineReader>, stream: &str) -> Option<String> {
    let lines = reader.as_mut()?;
    match lines.next_line().await {
        Ok(Some(line)) => Some(line),
        Ok(None) => {
            debug!("[kernel-host] {} closed", stream);
            *reader = None;
            None
        }
        Err(e) => {
            warn!("[kernel-host] Failed to read {}: {}", stream, e);
            *reader = None;
            None
        }
    }
}

async fn run_host(
    config: HostConfig,
    events: mpsc::UnboundedSender<KernelProcessMessage>,
    mut commands: mpsc::UnboundedReceiver<MainToKernel>,
) {
    let mut child = match start(&config) {
        Ok(child) => child,
        Err(e) => {
            let message = format!("Failed to start {}: {}", config.command, e);
            error!("[kernel-host] {}", message);
            let _ = events.send(KernelProcessMessage::Error { message });
            return;
        }
    };

    let mut exit = ExitLatch::default();
    let report_end = |exit: &mut ExitLatch| {
        if exit.fire() {
            let _ = events.send(KernelProcessMessage::End);
        }
    };

    let Some(pid) = child.id() else {
        // Already reaped; nothing to supervise.
        report_end(&mut exit);
        return;
    };
    info!("[kernel-host] Gateway started: pid={} command={}", pid, config.command);
    let _ = events.send(KernelProcessMessage::Start { pid });

    let mut stdout = line_reader(child.stdout.take());
    let mut stderr = line_reader(child.stderr.take());
    let forward_stderr = config.forward_stderr;
    // Set once close is requested; the exit watcher still reaps the gateway.
    let mut close_deadline: Option<Instant> = None;

    let forward = |line: String, from_stderr: bool| {
        if from_stderr && !forward_stderr {
            debug!("[kernel-host] stderr: {}", line);
            return;
        }
        let _ = events.send(KernelProcessMessage::Stdout { message: line });
    };

    loop {
        tokio::select! {
            biased;

            Some(line) = next_line(&mut stdout, "stdout"), if stdout.is_some() => {
                forward(line, false);
            }
            Some(line) = next_line(&mut stderr, "stderr"), if stderr.is_some() => {
                forward(line, true);
            }
            status = child.wait() => {
                match status {
                    Ok(status) => info!("[kernel-host] Gateway {} exited: {}", pid, status),
                    Err(e) => error!("[kernel-host] Failed waiting for gateway {}: {}", pid, e),
                }
                // Flush what the gateway wrote right before exiting.
                let drain = async {
                    while stdout.is_some() || stderr.is_some() {
                        tokio::select! {
                            biased;
                            Some(line) = next_line(&mut stdout, "stdout"), if stdout.is_some() => {
                                forward(line, false)
                            }
                            Some(line) = next_line(&mut stderr, "stderr"), if stderr.is_some() => {
                                forward(line, true)
                            }
                            else => break,
                        }
                    }
                };
                let _ = tokio::time::timeout(DRAIN_AFTER_EXIT, drain).await;
                report_end(&mut exit);
                break;
            }
            command = commands.recv(), if close_deadline.is_none() => match command {
                Some(MainToKernel::RequestClose) | None => {
                    info!("[kernel-host] Close requested; stopping gateway {}", pid);
                    if let Err(e) = child.start_kill() {
                        debug!("[kernel-host] Kill for gateway {} failed: {}", pid, e);
                    }
                    close_deadline = Some(Instant::now() + CLOSE_REAP_TIMEOUT);
                }
                Some(MainToKernel::Unknown) => {
                    warn!("[kernel-host] Ignoring unknown main-to-kernel command");
                }
            },
            _ = sleep_until(close_deadline.unwrap_or_else(Instant::now)),
                if close_deadline.is_some() =>
            {
                warn!(
                    "[kernel-host] Gateway {} not reaped within {:?} of close",
                    pid, CLOSE_REAP_TIMEOUT
                );
                report_end(&mut exit);
                break;
            }
        }
    }

    debug!(
        "[kernel-host] Host loop finished for gateway {} (end reported: {})",
        pid,
        exit.has_fired()
    );
}
