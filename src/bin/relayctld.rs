//! Relay Control Daemon (relayctld)
//!
//! Owns the relay node's control plane and exposes it on D-Bus as
//! `org.relayctl.Agent`. Runs the proxy health monitor and a periodic
//! certificate renewal sweep.
//!
//! # Usage
//!
//! ```bash
//! # Start the daemon (requires root/sudo)
//! sudo relayctld
//!
//! # Custom configuration and verbose logging
//! sudo relayctld --config /etc/relayctl/relayctl.toml --verbose
//! ```

use clap::Parser;
use librelayctl::config::{AgentConfig, DEFAULT_CONFIG_PATH};
use librelayctl::dbus::certificates::signals::emit_certificate_changed;
use librelayctl::error::{RelayError, RelayResult};
use librelayctl::{RelayAgent, RelayDbusService};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt};

const RENEWAL_INTERVAL: Duration = Duration::from_secs(12 * 60 * 60);

/// Relay Control Daemon
#[derive(Parser, Debug)]
#[command(name = "relayctld")]
#[command(author = "relayctl contributors")]
#[command(version)]
#[command(about = "Relay Control Daemon - D-Bus control plane for a relay node", long_about = None)]
struct Args {
    /// Configuration file
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Do not start the proxy health monitor
    #[arg(long)]
    no_health: bool,

    /// Do not run the periodic certificate renewal sweep
    #[arg(long)]
    no_renew: bool,
}

/// Shared state for signal handling
struct DaemonState {
    running: Arc<RwLock<bool>>,
}

impl DaemonState {
    fn new() -> Self {
        Self {
            running: Arc::new(RwLock::new(true)),
        }
    }

    async fn is_running(&self) -> bool {
        *self.running.read().await
    }

    async fn stop(&self) {
        let mut running = self.running.write().await;
        *running = false;
        info!("Daemon stop requested");
    }
}

#[tokio::main]
async fn main() -> RelayResult<()> {
    let args = Args::parse();

    init_logging(&args);

    info!("Starting Relay Control Daemon (relayctld)");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    #[cfg(target_os = "linux")]
    {
        let uid = unsafe { libc::getuid() };
        if uid != 0 {
            warn!("Not running as root - routing and certificate writes will likely fail");
        }
    }

    let config = AgentConfig::load_or_default(&args.config)?;
    config.ensure_directories()?;
    info!("Configuration loaded from {:?}", args.config);

    let state = Arc::new(DaemonState::new());
    let state_clone = state.clone();
    tokio::spawn(async move {
        if let Err(e) = handle_signals(state_clone).await {
            error!("Signal handler error: {}", e);
        }
    });

    let agent = Arc::new(RelayAgent::from_config(config).await?);

    // Bring the relay config in line with the persisted SNI registry
    if let Err(e) = agent.write_relay_config().await {
        warn!("Initial relay config not written: {}", e);
    }

    info!("Initializing D-Bus service...");
    let service = match RelayDbusService::start(agent.clone()).await {
        Ok(svc) => {
            info!("D-Bus service started");
            svc
        }
        Err(e) => {
            error!("Failed to start D-Bus service: {}", e);
            error!("  Another instance may be running, or the system bus is unavailable");
            return Err(e);
        }
    };
    service.forward_health(&agent).await;

    if args.no_health {
        info!("Health monitor disabled (--no-health)");
    } else if let Err(e) = agent.health().start().await {
        warn!("Failed to start health monitor: {}", e);
    }

    let renewal = if args.no_renew {
        info!("Certificate renewal disabled (--no-renew)");
        None
    } else {
        let agent = agent.clone();
        let connection = service.connection().clone();
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(RENEWAL_INTERVAL);
            loop {
                ticker.tick().await;
                let report = agent.renew_certificates().await;
                for domain in &report.renewed {
                    if let Err(e) = emit_certificate_changed(&connection, domain, false).await {
                        warn!("Failed to emit CertificateChanged signal: {}", e);
                    }
                }
                for (domain, reason) in &report.failed {
                    warn!("Renewal of {} failed: {}", domain, reason);
                }
            }
        }))
    };

    info!("Relay Control Daemon is ready");
    info!("  D-Bus service: {}", librelayctl::RELAY_DBUS_SERVICE);

    while state.is_running().await {
        tokio::time::sleep(Duration::from_secs(1)).await;
    }

    info!("Shutting down Relay Control Daemon...");
    if let Some(task) = renewal {
        task.abort();
    }
    if agent.health().is_running().await {
        if let Err(e) = agent.health().stop().await {
            error!("Error stopping health monitor: {}", e);
        }
    }
    if let Err(e) = service.stop().await {
        error!("Error during shutdown: {}", e);
    }

    info!("Relay Control Daemon stopped");
    Ok(())
}

/// Initialize logging based on command-line arguments
fn init_logging(args: &Args) {
    let log_level = if args.verbose {
        "debug"
    } else {
        &args.log_level
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| {
            EnvFilter::new(format!("relayctl={},relayctld={},librelayctl={}", log_level, log_level, log_level))
        });

    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_ansi(atty::is(atty::Stream::Stdout))
        .init();
}

/// Handle Unix signals (SIGTERM, SIGINT, SIGHUP)
async fn handle_signals(state: Arc<DaemonState>) -> RelayResult<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())
        .map_err(|e| RelayError::Service(format!("Failed to register SIGTERM handler: {}", e)))?;
    let mut sigint = signal(SignalKind::interrupt())
        .map_err(|e| RelayError::Service(format!("Failed to register SIGINT handler: {}", e)))?;
    let mut sighup = signal(SignalKind::hangup())
        .map_err(|e| RelayError::Service(format!("Failed to register SIGHUP handler: {}", e)))?;

    loop {
        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM, initiating graceful shutdown");
                state.stop().await;
                return Ok(());
            }
            _ = sigint.recv() => {
                info!("Received SIGINT (Ctrl+C), initiating graceful shutdown");
                state.stop().await;
                return Ok(());
            }
            _ = sighup.recv() => {
                // Component configuration is fixed at construction; a restart picks up changes
                info!("Received SIGHUP; restart relayctld to apply configuration changes");
            }
        }
    }
}
