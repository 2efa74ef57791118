use clap::Parser;
use idlegate::config::{Config, LauncherKind};
use idlegate::controller::Controller;
use idlegate::launcher::AnyLauncher;
use idlegate::proxy::{ProxyServer, TargetProvider};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info};

const PKG_NAME: &str = env!("CARGO_PKG_NAME");
const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser, Debug)]
#[command(version, about = "TCP proxy that starts its backend on demand and stops it when idle")]
struct Cli {
    /// Path to the configuration file to load
    #[arg(default_value = "config.toml")]
    config: PathBuf,

    /// Enable verbose logs
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let directive = if cli.verbose {
        "idlegate=debug"
    } else {
        "idlegate=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(directive.parse().expect("valid log directive")),
        )
        .init();

    let config = Config::load(&cli.config).map_err(|e| {
        error!(path = %cli.config.display(), error = %e, "Failed to load configuration");
        e
    })?;
    info!(path = %cli.config.display(), "Configuration loaded");

    print_startup_banner(&config);

    let bind_addr = config.bind_addr()?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let launcher = Arc::new(AnyLauncher::from_config(&config.launcher, shutdown_rx.clone())?);
    let controller = Controller::new(Arc::clone(&launcher), &config.controller, shutdown_rx.clone());

    let target: Arc<dyn TargetProvider> = launcher;
    let proxy = ProxyServer::new(bind_addr, controller, target, shutdown_rx.clone())
        .with_connect_timeout(config.proxy.connect_timeout);
    let mut proxy_handle = tokio::spawn(proxy.run());

    tokio::select! {
        result = &mut proxy_handle => {
            // The accept loop only returns early on a listener failure
            let result = result.map_err(|e| anyhow::anyhow!("proxy task failed: {}", e))?;
            if let Err(ref e) = result {
                error!(error = %e, "Proxy server error");
            }
            let _ = shutdown_tx.send(true);
            return result;
        }
        _ = wait_for_signal() => {}
    }

    // Signal shutdown
    let _ = shutdown_tx.send(true);

    // In-flight sessions are not drained; only wait for the listener to close
    if let Ok(Ok(Err(e))) = tokio::time::timeout(Duration::from_secs(5), proxy_handle).await {
        error!(error = %e, "Proxy server error during shutdown");
    }

    info!("Shutdown complete");
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM
async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
                info!("Received SIGINT (Ctrl+C), shutting down...");
                return;
            }
        };

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT (Ctrl+C), shutting down...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("Received Ctrl+C, shutting down...");
    }
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting proxy server");
    info!(
        bind = %config.bind_address,
        idle_period_secs = config.controller.idle_period().as_secs(),
        connect_timeout_ms = config.proxy.connect_timeout.as_millis() as u64,
        "Server configuration"
    );
    match config.launcher.selected {
        LauncherKind::SimpleProxy => {
            if let Some(ref cfg) = config.launcher.simple_proxy {
                info!(target_address = %cfg.target_address, "Using simple-proxy launcher");
            }
        }
        LauncherKind::Executable => {
            if let Some(ref cfg) = config.launcher.executable {
                info!(
                    path = %cfg.path,
                    args = ?cfg.args,
                    cwd = ?cfg.cwd,
                    address = %cfg.address,
                    "Using executable launcher"
                );
            }
        }
    }
}
