//! Connection tracking and idle shutdown.
//!
//! The controller owns the set of live proxied connections and the pending
//! idle-shutdown instant. Both live on one actor task; the proxy reports
//! connects and disconnects by queueing actions, and only the actor ever calls
//! into the [`Launcher`].
//!
//! Idle shutdown does not cancel timers. Each timer re-enters the actor when
//! it fires and checks the *current* schedule: if a connection arrived in the
//! meantime the schedule is gone, and if the set emptied again later the
//! schedule has moved forward. Either way the stale timer does nothing.

use crate::config::ControllerConfig;
use crate::launcher::Launcher;
use crate::proxy::{ConnInfo, SessionHooks};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Depth of the controller's action queue
const ACTION_QUEUE_DEPTH: usize = 1;

/// Coarse controller state, derived from the connection set and schedule
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    /// No connections and no shutdown pending
    Idle,
    /// At least one live connection
    Active,
    /// No connections, shutdown scheduled
    Draining,
}

/// Snapshot of the controller's bookkeeping
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControllerStatus {
    pub connections: usize,
    pub scheduled_shutdown: Option<Instant>,
}

impl ControllerStatus {
    pub fn state(&self) -> ControllerState {
        if self.connections > 0 {
            ControllerState::Active
        } else if self.scheduled_shutdown.is_some() {
            ControllerState::Draining
        } else {
            ControllerState::Idle
        }
    }
}

enum Action {
    Register { uid: String, at: Instant },
    Unregister { uid: String, at: Instant },
    IdleCheck,
    Status { reply: oneshot::Sender<ControllerStatus> },
}

struct Connection {
    start_time: Instant,
}

/// Handle to the controller actor. Cloning is cheap.
#[derive(Clone)]
pub struct Controller {
    actions: mpsc::Sender<Action>,
}

impl Controller {
    /// Spawn the controller actor. Must be called inside a Tokio runtime.
    pub fn new<L: Launcher>(
        launcher: Arc<L>,
        config: &ControllerConfig,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        let (actions_tx, actions_rx) = mpsc::channel(ACTION_QUEUE_DEPTH);

        let task = ControllerTask {
            launcher,
            connections: HashMap::new(),
            scheduled_shutdown: None,
            idle_period: config.idle_period(),
            actions: actions_tx.downgrade(),
        };
        tokio::spawn(task.run(actions_rx, shutdown_rx));

        Self {
            actions: actions_tx,
        }
    }

    /// Record a new connection, launching the backend if it is not running.
    /// Returns once the action is queued.
    pub async fn register_connection(&self, uid: &str) {
        self.send(Action::Register {
            uid: uid.to_string(),
            at: Instant::now(),
        })
        .await;
    }

    /// Forget a connection, scheduling a shutdown if it was the last one.
    /// Unknown uids are ignored. Returns once the action is queued.
    pub async fn unregister_connection(&self, uid: &str) {
        self.send(Action::Unregister {
            uid: uid.to_string(),
            at: Instant::now(),
        })
        .await;
    }

    /// Current connection count and schedule
    pub async fn status(&self) -> Option<ControllerStatus> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(Action::Status { reply: reply_tx }).await;
        reply_rx.await.ok()
    }

    /// Number of live connections (0 if the controller has stopped)
    pub async fn connection_count(&self) -> usize {
        self.status().await.map(|s| s.connections).unwrap_or(0)
    }

    pub async fn state(&self) -> ControllerState {
        self.status()
            .await
            .map(|s| s.state())
            .unwrap_or(ControllerState::Idle)
    }

    async fn send(&self, action: Action) {
        if self.actions.send(action).await.is_err() {
            warn!("Controller task has stopped, dropping action");
        }
    }
}

impl SessionHooks for Controller {
    async fn on_connect(&self, info: &ConnInfo) {
        self.register_connection(info.uid()).await;
    }

    async fn on_disconnect(&self, info: &ConnInfo) {
        self.unregister_connection(info.uid()).await;
    }
}

struct ControllerTask<L> {
    launcher: Arc<L>,
    connections: HashMap<String, Connection>,
    scheduled_shutdown: Option<Instant>,
    idle_period: Duration,
    /// Used by idle timers to re-enter the actor; weak so the actor still
    /// stops once every `Controller` handle is gone.
    actions: mpsc::WeakSender<Action>,
}

impl<L: Launcher> ControllerTask<L> {
    async fn run(
        mut self,
        mut actions: mpsc::Receiver<Action>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        info!(
            idle_period_ms = self.idle_period.as_millis() as u64,
            "Controller task running"
        );

        loop {
            tokio::select! {
                action = actions.recv() => {
                    match action {
                        Some(action) => self.handle(action).await,
                        None => break,
                    }
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!("Controller received shutdown signal");
                        break;
                    }
                }
            }
        }

        info!(count = self.connections.len(), "Controller task exiting");
    }

    async fn handle(&mut self, action: Action) {
        match action {
            Action::Register { uid, at } => self.register(uid, at).await,
            Action::Unregister { uid, at } => self.unregister(uid, at),
            Action::IdleCheck => self.idle_check().await,
            Action::Status { reply } => {
                let _ = reply.send(ControllerStatus {
                    connections: self.connections.len(),
                    scheduled_shutdown: self.scheduled_shutdown,
                });
            }
        }
    }

    async fn register(&mut self, uid: String, at: Instant) {
        self.connections
            .insert(uid.clone(), Connection { start_time: at });
        info!(uid = %uid, count = self.connections.len(), "Registered connection");

        if self.scheduled_shutdown.take().is_some() {
            info!(uid = %uid, "Scheduled shutdown cancelled due to new connection");
        }

        if !self.launcher.is_running().await {
            info!(uid = %uid, "Server not currently running, launching server");
            match self.launcher.launch().await {
                Ok(()) => {}
                Err(e) if e.is_already_running() => {
                    debug!(uid = %uid, "Server already running");
                }
                Err(e) => {
                    error!(uid = %uid, error = %e, "Failed to launch server");
                }
            }
        }
    }

    fn unregister(&mut self, uid: String, at: Instant) {
        let Some(connection) = self.connections.remove(&uid) else {
            info!(uid = %uid, count = self.connections.len(), "Unknown unregistration attempt");
            return;
        };

        let duration = at.saturating_duration_since(connection.start_time);
        info!(
            uid = %uid,
            duration_ms = duration.as_millis() as u64,
            count = self.connections.len(),
            "Unregistered connection"
        );

        if self.connections.is_empty() {
            self.schedule_shutdown();
        }
    }

    fn schedule_shutdown(&mut self) {
        let fire_at = Instant::now() + self.idle_period;
        self.scheduled_shutdown = Some(fire_at);
        info!(
            idle_period_ms = self.idle_period.as_millis() as u64,
            "Server empty, scheduling shutdown"
        );

        let actions = self.actions.clone();
        tokio::spawn(async move {
            tokio::time::sleep_until(fire_at).await;
            if let Some(actions) = actions.upgrade() {
                let _ = actions.send(Action::IdleCheck).await;
            }
        });
    }

    async fn idle_check(&mut self) {
        let Some(scheduled) = self.scheduled_shutdown else {
            debug!("Scheduled shutdown did nothing: aborted");
            return;
        };

        let now = Instant::now();
        if scheduled > now {
            debug!(
                remaining_ms = (scheduled - now).as_millis() as u64,
                "Scheduled shutdown did nothing: pushed back"
            );
            return;
        }

        self.scheduled_shutdown = None;
        info!(
            idle_period_ms = self.idle_period.as_millis() as u64,
            "Server empty for idle period, performing shutdown"
        );
        if let Err(e) = self.launcher.shutdown().await {
            error!(error = %e, "Error shutting down server");
        }
    }
}
