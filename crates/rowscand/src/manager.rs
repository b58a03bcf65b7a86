//! Parent side of the fleet: spawns the worker, forwards capture commands
//! to it and bounds its shutdown.

use crate::config::{Config, WORKER_CONFIG_ENV};
use crate::fleet::FleetError;
use crate::ipc::{CaptureRequest, WorkerEvent};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;

const QUEUE_DEPTH: usize = 64;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FleetState {
    #[default]
    Uninitialized,
    Discovering,
    Running,
    ShuttingDown,
    Stopped,
}

/// How the worker went away during shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    /// There was no worker to stop.
    NotRunning,
    /// Exited by itself or on SIGTERM.
    Exited,
    /// Outlived the shutdown bound and was killed.
    Killed,
}

#[derive(Clone, Default)]
struct SharedState(Arc<Mutex<FleetState>>);

impl SharedState {
    fn get(&self) -> FleetState {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set(&self, state: FleetState) {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }
}

/// Clone-safe handle for enqueueing capture commands.
#[derive(Clone)]
pub struct CommandQueue {
    tx: mpsc::Sender<CaptureRequest>,
}

impl CommandQueue {
    /// Enqueue a command. Returns once the command is queued, not when
    /// the capture is done.
    pub async fn submit(&self, request: CaptureRequest) -> Result<(), FleetError> {
        self.tx
            .send(request)
            .await
            .map_err(|_| FleetError::QueueClosed)
    }
}

pub struct FleetManager {
    config: Config,
    program: PathBuf,
    args: Vec<String>,
    state: SharedState,
    cameras: Vec<String>,
    queue: Option<CommandQueue>,
    stop_writer: Option<oneshot::Sender<()>>,
    writer: Option<JoinHandle<()>>,
    drain: Option<JoinHandle<()>>,
    child: Option<Child>,
}

impl FleetManager {
    /// A manager that runs this executable's `worker` subcommand.
    pub fn new(config: Config) -> Self {
        let program = std::env::current_exe().unwrap_or_else(|err| {
            tracing::warn!(error = %err, "cannot resolve own executable; using PATH lookup");
            PathBuf::from("rowscand")
        });
        Self {
            config,
            program,
            args: vec!["worker".to_string()],
            state: SharedState::default(),
            cameras: Vec::new(),
            queue: None,
            stop_writer: None,
            writer: None,
            drain: None,
            child: None,
        }
    }

    /// Replace the worker command line.
    pub fn with_worker_command(mut self, program: impl Into<PathBuf>, args: &[&str]) -> Self {
        self.program = program.into();
        self.args = args.iter().map(|a| a.to_string()).collect();
        self
    }

    /// Spawn the worker and wait for it to finish discovery.
    ///
    /// Returns the identities of the cameras that came up, in capture
    /// index order. An empty fleet is not an error.
    pub async fn start(&mut self) -> Result<Vec<String>, FleetError> {
        let state = self.state.get();
        if state != FleetState::Uninitialized {
            return Err(FleetError::AlreadyStarted(state));
        }
        self.state.set(FleetState::Discovering);

        match self.spawn_worker().await {
            Ok(cameras) => {
                tracing::info!(cameras = ?cameras, "fleet running");
                self.cameras.clone_from(&cameras);
                self.state.set(FleetState::Running);
                Ok(cameras)
            }
            Err(err) => {
                if let Some(mut child) = self.child.take() {
                    let _ = child.start_kill();
                    let _ = tokio::time::timeout(self.config.worker_shutdown(), child.wait()).await;
                }
                self.state.set(FleetState::Stopped);
                Err(err)
            }
        }
    }

    async fn spawn_worker(&mut self) -> Result<Vec<String>, FleetError> {
        let config_json = self.config.to_json().map_err(FleetError::Config)?;
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .env(WORKER_CONFIG_ENV, config_json)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(FleetError::Spawn)?;
        tracing::info!(pid = ?child.id(), program = %self.program.display(), "worker spawned");

        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        self.child = Some(child);
        let (Some(stdin), Some(stdout)) = (stdin, stdout) else {
            return Err(FleetError::Spawn(std::io::Error::other("worker stdio not captured")));
        };

        let mut events = BufReader::new(stdout).lines();
        let cameras = loop {
            let line = events.next_line().await.map_err(FleetError::Events)?;
            let Some(line) = line else {
                return Err(FleetError::WorkerExited);
            };
            match serde_json::from_str::<WorkerEvent>(&line).map_err(FleetError::BadEvent)? {
                WorkerEvent::Ready { cameras } => break cameras,
                WorkerEvent::Stopped => return Err(FleetError::WorkerExited),
            }
        };

        let (tx, rx) = mpsc::channel(QUEUE_DEPTH);
        let (stop_tx, stop_rx) = oneshot::channel();
        self.queue = Some(CommandQueue { tx });
        self.stop_writer = Some(stop_tx);
        self.writer = Some(tokio::spawn(forward_commands(rx, stop_rx, stdin)));
        self.drain = Some(tokio::spawn(drain_events(events, self.state.clone())));
        Ok(cameras)
    }

    /// Enqueue a capture command for the worker.
    pub async fn submit(&self, request: CaptureRequest) -> Result<(), FleetError> {
        self.queue()?.submit(request).await
    }

    /// A handle for enqueueing from other tasks while the fleet runs.
    pub fn queue(&self) -> Result<CommandQueue, FleetError> {
        let state = self.state.get();
        match (&self.queue, state) {
            (Some(queue), FleetState::Running) => Ok(queue.clone()),
            _ => Err(FleetError::NotRunning(state)),
        }
    }

    pub fn state(&self) -> FleetState {
        self.state.get()
    }

    /// Identities reported by the worker at startup.
    pub fn cameras(&self) -> &[String] {
        &self.cameras
    }

    /// Stop accepting commands, ask the worker to terminate between
    /// commands and wait for it. Returns within the configured shutdown
    /// bound; a worker that outlives it is killed. Never fails.
    pub async fn shutdown(&mut self) -> WorkerExit {
        self.stop(false).await
    }

    /// Like [`FleetManager::shutdown`], but first lets the worker run the
    /// commands already queued, for up to one extra shutdown bound.
    pub async fn finish(&mut self) -> WorkerExit {
        self.stop(true).await
    }

    async fn stop(&mut self, run_pending: bool) -> WorkerExit {
        match self.state.get() {
            FleetState::Uninitialized | FleetState::Stopped if self.child.is_none() => {
                self.state.set(FleetState::Stopped);
                return WorkerExit::NotRunning;
            }
            _ => {}
        }
        self.state.set(FleetState::ShuttingDown);
        let bound = self.config.worker_shutdown();
        self.queue = None;

        let mut exit = WorkerExit::NotRunning;
        if run_pending {
            exit = self.run_pending(Instant::now() + bound).await;
        }

        // Everything below shares one deadline. The last fifth of it is
        // reserved for reaping after SIGKILL.
        let deadline = Instant::now() + bound;
        let kill_at = deadline - bound / 5;

        self.stop_writer = None;
        if let Some(writer) = self.writer.take() {
            writer.abort();
            let _ = tokio::time::timeout_at(deadline, writer).await;
        }
        if let Some(mut child) = self.child.take() {
            if exit != WorkerExit::Exited {
                exit = terminate(&mut child, bound, kill_at, deadline).await;
            }
        }
        if let Some(drain) = self.drain.take() {
            let abort = drain.abort_handle();
            if tokio::time::timeout_at(deadline, drain).await.is_err() {
                abort.abort();
            }
        }
        self.state.set(FleetState::Stopped);
        tracing::info!(?exit, "fleet stopped");
        exit
    }

    /// Flush queued commands, close the worker's stdin and wait for it to
    /// exit on its own.
    async fn run_pending(&mut self, deadline: Instant) -> WorkerExit {
        if let Some(stop) = self.stop_writer.take() {
            let _ = stop.send(());
        }
        if let Some(writer) = self.writer.take() {
            let abort = writer.abort_handle();
            if tokio::time::timeout_at(deadline, writer).await.is_err() {
                tracing::warn!("command writer did not drain; aborting");
                abort.abort();
            }
        }
        let Some(child) = self.child.as_mut() else {
            return WorkerExit::NotRunning;
        };
        match tokio::time::timeout_at(deadline, child.wait()).await {
            Ok(Ok(status)) => {
                tracing::info!(%status, "worker finished pending commands");
                WorkerExit::Exited
            }
            Ok(Err(err)) => {
                tracing::warn!(error = %err, "failed to wait for worker");
                WorkerExit::NotRunning
            }
            Err(_) => {
                tracing::warn!("worker still busy; terminating");
                WorkerExit::NotRunning
            }
        }
    }
}

/// SIGTERM, then SIGKILL at `kill_at`, reaping until `deadline`.
async fn terminate(child: &mut Child, bound: Duration, kill_at: Instant, deadline: Instant) -> WorkerExit {
    match child.id() {
        Some(pid) => {
            if let Err(err) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                tracing::warn!(pid, error = %err, "failed to signal worker");
            }
        }
        None => tracing::debug!("worker already reaped"),
    }

    match tokio::time::timeout_at(kill_at, child.wait()).await {
        Ok(Ok(status)) => {
            tracing::info!(%status, "worker exited");
            WorkerExit::Exited
        }
        Ok(Err(err)) => {
            tracing::warn!(error = %err, "failed to wait for worker");
            WorkerExit::Exited
        }
        Err(_) => {
            tracing::error!(error = %FleetError::ShutdownTimeout(bound), "killing worker");
            if let Err(err) = child.start_kill() {
                tracing::warn!(error = %err, "failed to kill worker");
            }
            if tokio::time::timeout_at(deadline, child.wait()).await.is_err() {
                tracing::error!("worker not reaped after kill");
            }
            WorkerExit::Killed
        }
    }
}

/// Owns the worker's stdin. Dropping it on exit closes the worker's
/// command stream.
async fn forward_commands(
    mut rx: mpsc::Receiver<CaptureRequest>,
    mut stop: oneshot::Receiver<()>,
    mut stdin: ChildStdin,
) {
    let mut closing = false;
    loop {
        let request = tokio::select! {
            request = rx.recv() => request,
            _ = &mut stop, if !closing => {
                // Refuse new commands but still forward the buffered ones.
                rx.close();
                closing = true;
                continue;
            }
        };
        let Some(request) = request else {
            break;
        };
        let line = match serde_json::to_string(&request) {
            Ok(json) => json + "\n",
            Err(err) => {
                tracing::error!(error = %err, "failed to serialize command");
                continue;
            }
        };
        if let Err(err) = write_line(&mut stdin, &line).await {
            tracing::error!(error = %err, command = %request, "failed to forward command");
            break;
        }
        tracing::debug!(command = %request, "command forwarded");
    }
}

async fn write_line(stdin: &mut ChildStdin, line: &str) -> std::io::Result<()> {
    stdin.write_all(line.as_bytes()).await?;
    stdin.flush().await
}

async fn drain_events(mut events: Lines<BufReader<ChildStdout>>, state: SharedState) {
    loop {
        match events.next_line().await {
            Ok(Some(line)) => match serde_json::from_str::<WorkerEvent>(&line) {
                Ok(WorkerEvent::Stopped) => tracing::info!("worker reported stopped"),
                Ok(event) => tracing::debug!(?event, "worker event"),
                Err(err) => tracing::warn!(error = %err, "malformed worker event"),
            },
            Ok(None) => break,
            Err(err) => {
                tracing::warn!(error = %err, "worker event stream failed");
                break;
            }
        }
    }
    if state.get() == FleetState::Running {
        tracing::error!("worker exited unexpectedly");
        state.set(FleetState::Stopped);
    }
}
