//! Launcher that runs the backend as a child process.
//!
//! All launcher state (the process handle and the generation counter) lives on
//! a single actor task. Public methods send an [`Action`] to that task and wait
//! for the reply, so `launch`, `shutdown` and exit handling never interleave.

use crate::config::ExecutableConfig;
use crate::error::{LaunchError, ShutdownError};
use crate::launcher::Launcher;
use crate::proxy::TargetProvider;
use std::process::{ExitStatus, Stdio};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

/// Depth of the launcher's action queue
const ACTION_QUEUE_DEPTH: usize = 1;

type KillReply = oneshot::Sender<std::io::Result<()>>;

enum Action {
    IsRunning {
        reply: oneshot::Sender<bool>,
    },
    Generation {
        reply: oneshot::Sender<u64>,
    },
    Launch {
        reply: oneshot::Sender<Result<(), LaunchError>>,
    },
    Shutdown {
        generation: u64,
        reply: oneshot::Sender<Result<(), ShutdownError>>,
    },
}

/// Reported by the watcher task once the child has been reaped
struct ProcessExit {
    generation: u64,
    status: std::io::Result<ExitStatus>,
}

/// Handle to the running child. The child itself is owned by its watcher
/// task; kill requests are forwarded there.
struct RunningProcess {
    generation: u64,
    pid: Option<u32>,
    kill_tx: mpsc::Sender<KillReply>,
}

/// Process-lifecycle launcher.
///
/// Cloning is cheap; every clone talks to the same actor task.
#[derive(Clone)]
pub struct ExecutableLauncher {
    address: String,
    actions: mpsc::Sender<Action>,
}

impl ExecutableLauncher {
    /// Spawn the launcher actor. Must be called inside a Tokio runtime.
    ///
    /// When `shutdown_rx` flips to `true` the actor stops and a still-running
    /// backend is killed.
    pub fn new(config: ExecutableConfig, shutdown_rx: watch::Receiver<bool>) -> Self {
        let (actions_tx, actions_rx) = mpsc::channel(ACTION_QUEUE_DEPTH);
        let (exits_tx, exits_rx) = mpsc::unbounded_channel();

        let task = LauncherTask {
            config: config.clone(),
            process: None,
            generation: 0,
            exits_tx,
            shutdown_rx: shutdown_rx.clone(),
        };
        tokio::spawn(task.run(actions_rx, exits_rx, shutdown_rx));

        Self {
            address: config.address,
            actions: actions_tx,
        }
    }

    /// Generation of the most recent launch (0 before the first launch)
    pub async fn generation(&self) -> u64 {
        self.request(|reply| Action::Generation { reply })
            .await
            .unwrap_or(0)
    }

    /// Shut down the backend only if it still belongs to `generation`.
    /// Requests from an older generation are ignored.
    pub async fn shutdown_generation(&self, generation: u64) -> Result<(), ShutdownError> {
        self.request(|reply| Action::Shutdown { generation, reply })
            .await
            .unwrap_or(Err(ShutdownError::Unavailable))
    }

    async fn request<T>(&self, action: impl FnOnce(oneshot::Sender<T>) -> Action) -> Option<T> {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.actions.send(action(reply_tx)).await.is_err() {
            warn!("Executable launcher task has stopped, dropping request");
            return None;
        }
        reply_rx.await.ok()
    }
}

impl Launcher for ExecutableLauncher {
    async fn is_running(&self) -> bool {
        self.request(|reply| Action::IsRunning { reply })
            .await
            .unwrap_or(false)
    }

    fn server_address(&self) -> String {
        self.address.clone()
    }

    async fn launch(&self) -> Result<(), LaunchError> {
        self.request(|reply| Action::Launch { reply })
            .await
            .unwrap_or(Err(LaunchError::Unavailable))
    }

    async fn shutdown(&self) -> Result<(), ShutdownError> {
        let generation = self.generation().await;
        self.shutdown_generation(generation).await
    }
}

impl TargetProvider for ExecutableLauncher {
    fn server_address(&self) -> String {
        self.address.clone()
    }
}

struct LauncherTask {
    config: ExecutableConfig,
    process: Option<RunningProcess>,
    generation: u64,
    exits_tx: mpsc::UnboundedSender<ProcessExit>,
    shutdown_rx: watch::Receiver<bool>,
}

impl LauncherTask {
    async fn run(
        mut self,
        mut actions: mpsc::Receiver<Action>,
        mut exits: mpsc::UnboundedReceiver<ProcessExit>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        info!("Executable launcher task running");

        loop {
            tokio::select! {
                action = actions.recv() => {
                    match action {
                        Some(action) => self.handle(action).await,
                        None => break,
                    }
                }
                Some(exit) = exits.recv() => {
                    self.process_completed(exit);
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!("Executable launcher received shutdown signal");
                        break;
                    }
                }
            }
        }

        info!("Executable launcher task exiting");
    }

    async fn handle(&mut self, action: Action) {
        match action {
            Action::IsRunning { reply } => {
                let _ = reply.send(self.process.is_some());
            }
            Action::Generation { reply } => {
                let _ = reply.send(self.generation);
            }
            Action::Launch { reply } => {
                let _ = reply.send(self.launch());
            }
            Action::Shutdown { generation, reply } => {
                let result = self.shutdown(generation).await;
                let _ = reply.send(result);
            }
        }
    }

    fn launch(&mut self) -> Result<(), LaunchError> {
        if self.process.is_some() {
            return Err(LaunchError::AlreadyRunning);
        }

        self.generation += 1;
        let generation = self.generation;
        info!(path = %self.config.path, generation, "Launching server process");

        let mut cmd = Command::new(&self.config.path);
        cmd.args(&self.config.args);
        cmd.envs(&self.config.env);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);
        if let Some(ref cwd) = self.config.cwd {
            cmd.current_dir(cwd);
        }

        let mut child = cmd.spawn().map_err(|e| {
            error!(path = %self.config.path, generation, error = %e, "Failed to spawn server process");
            LaunchError::Failed(e)
        })?;

        let pid = child.id();
        info!(pid, generation, "Server process spawned");

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_output(stdout, "stdout", generation));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_output(stderr, "stderr", generation));
        }

        let (kill_tx, kill_rx) = mpsc::channel(1);
        tokio::spawn(watch_process(
            child,
            generation,
            kill_rx,
            self.exits_tx.clone(),
            self.shutdown_rx.clone(),
        ));

        self.process = Some(RunningProcess {
            generation,
            pid,
            kill_tx,
        });
        Ok(())
    }

    async fn shutdown(&mut self, generation: u64) -> Result<(), ShutdownError> {
        if self.generation > generation {
            debug!(
                request_generation = generation,
                current_generation = self.generation,
                "Shutdown request from previous generation, ignoring"
            );
            return Ok(());
        }

        let Some(process) = self.process.as_ref() else {
            debug!(generation, "Shutdown requested but no server process is running");
            return Ok(());
        };

        info!(pid = process.pid, generation = process.generation, "Killing server process");

        let (reply_tx, reply_rx) = oneshot::channel();
        if process.kill_tx.send(reply_tx).await.is_err() {
            // Watcher already reaped the child; its exit report is queued.
            return Ok(());
        }
        match reply_rx.await {
            Ok(result) => result.map_err(ShutdownError::Failed),
            Err(_) => Ok(()),
        }
    }

    fn process_completed(&mut self, exit: ProcessExit) {
        match &exit.status {
            Ok(status) if status.success() => {
                info!(generation = exit.generation, %status, "Finished running server process");
            }
            Ok(status) => {
                warn!(generation = exit.generation, %status, "Server process exited with failure");
            }
            Err(e) => {
                error!(generation = exit.generation, error = %e, "Error waiting on launched server process");
            }
        }

        if self
            .process
            .as_ref()
            .is_some_and(|p| p.generation == exit.generation)
        {
            self.process = None;
        }
    }
}

/// Own the child until it exits, serving kill requests in the meantime.
/// The child is also killed when the program-wide shutdown signal fires.
async fn watch_process(
    mut child: Child,
    generation: u64,
    mut kill_rx: mpsc::Receiver<KillReply>,
    exits: mpsc::UnboundedSender<ProcessExit>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut watching_shutdown = true;

    let status = loop {
        tokio::select! {
            status = child.wait() => break status,
            Some(reply) = kill_rx.recv() => {
                let _ = reply.send(child.start_kill());
            }
            changed = shutdown_rx.changed(), if watching_shutdown => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    watching_shutdown = false;
                    if changed.is_ok() {
                        info!(generation, "Stopping server process for program shutdown");
                        if let Err(e) = child.start_kill() {
                            warn!(generation, error = %e, "Failed to kill server process on shutdown");
                        }
                    }
                }
            }
        }
    };

    let _ = exits.send(ProcessExit { generation, status });
}

/// Forward a child output stream into the log, one event per line
async fn forward_output<R>(reader: R, stream: &'static str, generation: u64)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                info!(target: "idlegate::backend", generation, stream, "{}", line);
            }
            Ok(None) => break,
            Err(e) => {
                debug!(generation, stream, error = %e, "Stopped reading server output");
                break;
            }
        }
    }
}
