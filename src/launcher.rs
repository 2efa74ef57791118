//! Backend launcher capability and its configuration-selected variants

use crate::config::{LauncherConfig, LauncherKind, SimpleProxyConfig};
use crate::error::{LaunchError, ShutdownError};
use crate::process::ExecutableLauncher;
use crate::proxy::TargetProvider;
use std::future::Future;
use tokio::sync::watch;

/// Lifecycle control over the backend the proxy forwards to.
///
/// `launch` must never start a second instance while one is running, and
/// `shutdown` only ever affects the instance that was current when it was
/// called.
pub trait Launcher: Send + Sync + 'static {
    /// Whether a backend instance is currently up
    fn is_running(&self) -> impl Future<Output = bool> + Send;

    /// Address the next proxied connection should dial
    fn server_address(&self) -> String;

    /// Start the backend, failing with `AlreadyRunning` if it is up
    fn launch(&self) -> impl Future<Output = Result<(), LaunchError>> + Send;

    /// Stop the current backend instance, if any
    fn shutdown(&self) -> impl Future<Output = Result<(), ShutdownError>> + Send;
}

/// Launcher for an externally managed backend at a fixed address.
/// It is always considered running and never starts or stops anything.
#[derive(Debug, Clone)]
pub struct StaticLauncher {
    target_address: String,
}

impl StaticLauncher {
    pub fn new(config: SimpleProxyConfig) -> Self {
        Self {
            target_address: config.target_address,
        }
    }
}

impl Launcher for StaticLauncher {
    async fn is_running(&self) -> bool {
        true
    }

    fn server_address(&self) -> String {
        self.target_address.clone()
    }

    async fn launch(&self) -> Result<(), LaunchError> {
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), ShutdownError> {
        Ok(())
    }
}

impl TargetProvider for StaticLauncher {
    fn server_address(&self) -> String {
        self.target_address.clone()
    }
}

/// The launcher chosen by `[launcher] selected`
pub enum AnyLauncher {
    Static(StaticLauncher),
    Executable(ExecutableLauncher),
}

impl AnyLauncher {
    /// Build the selected launcher. The executable launcher spawns its actor
    /// task, so this must be called inside a Tokio runtime.
    pub fn from_config(
        config: &LauncherConfig,
        shutdown_rx: watch::Receiver<bool>,
    ) -> anyhow::Result<Self> {
        match config.selected {
            LauncherKind::SimpleProxy => {
                let cfg = config.simple_proxy.clone().ok_or_else(|| {
                    anyhow::anyhow!("launcher 'simple-proxy' requires [launcher.simple_proxy]")
                })?;
                Ok(AnyLauncher::Static(StaticLauncher::new(cfg)))
            }
            LauncherKind::Executable => {
                let cfg = config.executable.clone().ok_or_else(|| {
                    anyhow::anyhow!("launcher 'executable' requires [launcher.executable]")
                })?;
                Ok(AnyLauncher::Executable(ExecutableLauncher::new(cfg, shutdown_rx)))
            }
        }
    }

    pub fn kind(&self) -> LauncherKind {
        match self {
            AnyLauncher::Static(_) => LauncherKind::SimpleProxy,
            AnyLauncher::Executable(_) => LauncherKind::Executable,
        }
    }
}

impl Launcher for AnyLauncher {
    async fn is_running(&self) -> bool {
        match self {
            AnyLauncher::Static(l) => l.is_running().await,
            AnyLauncher::Executable(l) => l.is_running().await,
        }
    }

    fn server_address(&self) -> String {
        match self {
            AnyLauncher::Static(l) => Launcher::server_address(l),
            AnyLauncher::Executable(l) => Launcher::server_address(l),
        }
    }

    async fn launch(&self) -> Result<(), LaunchError> {
        match self {
            AnyLauncher::Static(l) => l.launch().await,
            AnyLauncher::Executable(l) => l.launch().await,
        }
    }

    async fn shutdown(&self) -> Result<(), ShutdownError> {
        match self {
            AnyLauncher::Static(l) => l.shutdown().await,
            AnyLauncher::Executable(l) => l.shutdown().await,
        }
    }
}

impl TargetProvider for AnyLauncher {
    fn server_address(&self) -> String {
        Launcher::server_address(self)
    }
}
