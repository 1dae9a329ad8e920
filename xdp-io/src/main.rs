//! xdp-recover: inspect and remove XDP programs.
//!
//! Out-of-band recovery for hosts running xdp-io:
//!   - list:     loaded BPF programs and XDP links
//!   - detach:   remove every XDP program from an interface
//!   - watchdog: probe an off-host address and detach when it goes dark

use std::net::{SocketAddr, ToSocketAddrs};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::signal;
use tracing::{error, info, warn};

use xdp_io::bpf_sys::BPF_PROG_TYPE_XDP;
use xdp_io::ops;
use xdp_io::watchdog::{self, WatchdogConfig, WatchdogExit};

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser)]
#[command(
    name = "xdp-recover",
    about = "Inspect and remove XDP programs left behind by xdp-io",
    version
)]
struct Cli {
    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List XDP programs and links.
    List {
        /// Include non-XDP programs.
        #[arg(long)]
        all: bool,
    },
    /// Detach every XDP program from an interface.
    Detach {
        #[arg(short, long)]
        interface: String,
    },
    /// Detach from an interface once an off-host probe stops answering.
    Watchdog {
        #[arg(short, long)]
        interface: String,

        /// TCP endpoint to probe, as host:port.
        #[arg(long)]
        probe: String,

        #[arg(long, default_value_t = 5)]
        interval_secs: u64,

        /// Consecutive failed probes before detaching.
        #[arg(long, default_value_t = 3)]
        failures: u32,
    },
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize tracing/logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cli.log_level)),
        )
        .with_target(false)
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .init();

    match cli.command {
        Command::List { all } => list(all),
        Command::Detach { interface } => {
            let ifindex = resolve(&interface)?;
            let links = ops::force_detach(ifindex)
                .with_context(|| format!("detaching XDP from {}", interface))?;
            info!(interface = %interface, links, "XDP detached");
            Ok(())
        }
        Command::Watchdog {
            interface,
            probe,
            interval_secs,
            failures,
        } => run_watchdog(interface, &probe, interval_secs, failures).await,
    }
}

fn resolve(interface: &str) -> Result<u32> {
    nix::net::if_::if_nametoindex(interface)
        .with_context(|| format!("resolving interface '{}'", interface))
}

fn list(all: bool) -> Result<()> {
    let programs = ops::list_programs().context("listing BPF programs")?;
    for prog in programs
        .iter()
        .filter(|p| all || p.prog_type == BPF_PROG_TYPE_XDP)
    {
        println!(
            "prog {:>6}  type {:>2}  tag {}  {}",
            prog.id, prog.prog_type, prog.tag, prog.name
        );
    }

    let links = ops::list_xdp_links().context("listing XDP links")?;
    for link in &links {
        println!(
            "link {:>6}  prog {:>6}  ifindex {}",
            link.id, link.prog_id, link.ifindex
        );
    }
    if links.is_empty() {
        println!("no XDP links");
    }
    Ok(())
}

async fn run_watchdog(
    interface: String,
    probe: &str,
    interval_secs: u64,
    failures: u32,
) -> Result<()> {
    let ifindex = resolve(&interface)?;
    let probe: SocketAddr = probe
        .to_socket_addrs()
        .with_context(|| format!("resolving probe address '{}'", probe))?
        .next()
        .with_context(|| format!("probe address '{}' resolved to nothing", probe))?;

    let interval = Duration::from_secs(interval_secs.max(1));
    let config = WatchdogConfig {
        probe,
        interval,
        connect_timeout: interval.min(Duration::from_secs(2)),
        failures,
    };

    info!(interface = %interface, ifindex, "xdp-recover watchdog is running. Press Ctrl+C to stop.");

    let exit = watchdog::run(config, || ops::force_detach(ifindex), shutdown_signal())
        .await
        .with_context(|| format!("recovering {}", interface))?;

    match exit {
        WatchdogExit::Shutdown => info!("watchdog stopped"),
        WatchdogExit::Recovered { links } => {
            warn!(interface = %interface, links, "XDP removed after connectivity loss")
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Signal Handling
// ---------------------------------------------------------------------------

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received Ctrl+C"),
        _ = terminate => info!("received SIGTERM"),
    }
}
