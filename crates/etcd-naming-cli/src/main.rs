//! etcd-naming
//!
//! Register a service instance under a lease until a signal arrives, or watch
//! a service's membership and print every change.

mod signals;
mod telemetry;

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use etcd_naming::{
    register, AddressSet, KeepAliveExit, MembershipUpdate, NamingConfig, RegistrationConfig,
    Resolver,
};
use std::time::Duration;
use tracing::{error, info, warn};

/// Pause before retrying a failed watch read
const WATCH_RETRY_DELAY: Duration = Duration::from_secs(1);

#[derive(Parser)]
#[command(name = "etcd-naming")]
#[command(about = "Service registration and discovery over etcd")]
struct Cli {
    /// etcd endpoints (comma-separated)
    #[arg(
        long,
        global = true,
        env = "ETCD_ENDPOINTS",
        default_value = "127.0.0.1:2379"
    )]
    endpoints: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Register an instance and keep it alive until SIGINT/SIGTERM/SIGHUP/SIGQUIT
    Register {
        /// Service name
        #[arg(long)]
        service: String,
        /// Advertised host
        #[arg(long)]
        host: String,
        /// Advertised port
        #[arg(long)]
        port: u16,
        /// Lease TTL in seconds (defaults to NAMING_LEASE_TTL or 10)
        #[arg(long)]
        ttl: Option<i64>,
    },
    /// Print a service's members, then every add/remove
    Watch {
        /// Service name
        #[arg(long)]
        service: String,
        /// One JSON object per update instead of text
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    telemetry::init_tracing(&telemetry::TracingConfig::from_env())?;
    etcd_naming::metrics::describe_metrics();

    let naming = NamingConfig::from_env().with_target(&cli.endpoints);

    match cli.command {
        Commands::Register {
            service,
            host,
            port,
            ttl,
        } => {
            let mut config = RegistrationConfig::new(service, host, port)
                .with_ttl(ttl.unwrap_or(naming.lease_ttl));
            if let Some(interval) = naming.keepalive_interval {
                config = config.with_keepalive_interval(interval);
            }
            run_register(&naming, config).await
        }
        Commands::Watch { service, json } => run_watch(naming, service, json).await,
    }
}

async fn run_register(naming: &NamingConfig, config: RegistrationConfig) -> anyhow::Result<()> {
    info!(service = %config.service, endpoints = ?naming.endpoints, "Starting registration");

    let registration = register(naming, config)
        .await
        .context("failed to register service")?;

    let shutdown = registration.shutdown_token();
    let signal_task = tokio::spawn(async move {
        match signals::wait_for_shutdown().await {
            Ok(signal) => {
                shutdown.cancel();
                Some(signal)
            }
            Err(e) => {
                error!(error = %e, "Signal handling unavailable");
                None
            }
        }
    });

    let exit = registration.wait().await;
    match exit {
        KeepAliveExit::Shutdown { revoked } => {
            let signal = signal_task.await?;
            info!(revoked = revoked, "Registration removed");
            // Only the signal listener fires the shutdown token
            let code = signal.map(|s| s.exit_code()).unwrap_or(0);
            std::process::exit(code);
        }
        KeepAliveExit::ConnectionClosed | KeepAliveExit::LeaseLost => {
            signal_task.abort();
            anyhow::bail!("registration ended unexpectedly: {:?}", exit)
        }
    }
}

async fn run_watch(naming: NamingConfig, service: String, json: bool) -> anyhow::Result<()> {
    let endpoints = naming.endpoints.join(",");
    let mut watcher = Resolver::with_config(service, naming)
        .resolve(&endpoints)
        .await
        .context("failed to resolve service")?;
    info!(service = %watcher.service(), "Watching membership");

    let closer = watcher.close_token();
    tokio::spawn(async move {
        if signals::wait_for_shutdown().await.is_ok() {
            closer.cancel();
        }
    });

    let mut members = AddressSet::new();
    loop {
        match watcher.next().await {
            Ok(updates) => {
                members.apply(&updates);
                print_updates(&updates, json)?;
            }
            Err(e) if e.is_closed() => break,
            Err(e) => {
                // Keep the last known members; the next call reopens the watch
                warn!(error = %e, members = members.len(), "Watch failed, retrying");
                tokio::time::sleep(WATCH_RETRY_DELAY).await;
            }
        }
    }

    info!(members = ?members.snapshot(), "Watch stopped");
    Ok(())
}

fn print_updates(updates: &[MembershipUpdate], json: bool) -> anyhow::Result<()> {
    for update in updates {
        if json {
            println!("{}", serde_json::to_string(update)?);
        } else {
            println!("{} {}", update.op.as_str(), update.address);
        }
    }
    Ok(())
}
