//! Connectivity watchdog.
//!
//! A bad XDP filter can black-hole a remote host's only management path. The
//! watchdog probes an off-host TCP endpoint on a fixed interval and, after
//! `failures` consecutive misses, runs a recovery action (normally
//! [`ops::force_detach`](crate::ops::force_detach)) and stops.

use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use crate::error::Result;

#[derive(Debug, Clone)]
pub struct WatchdogConfig {
    pub probe: SocketAddr,
    pub interval: Duration,
    pub connect_timeout: Duration,
    /// Consecutive failed probes before recovery runs.
    pub failures: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogExit {
    Shutdown,
    /// Recovery ran; carries the number of links it detached.
    Recovered { links: usize },
}

/// One TCP connect to `addr`, bounded by `timeout`.
pub async fn probe(addr: SocketAddr, timeout: Duration) -> bool {
    matches!(
        tokio::time::timeout(timeout, TcpStream::connect(addr)).await,
        Ok(Ok(_))
    )
}

/// Probe until `shutdown` resolves or the failure threshold is reached.
pub async fn run<F, S>(config: WatchdogConfig, mut recover: F, shutdown: S) -> Result<WatchdogExit>
where
    F: FnMut() -> Result<usize>,
    S: Future<Output = ()>,
{
    tokio::pin!(shutdown);
    let mut ticker = tokio::time::interval(config.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let threshold = config.failures.max(1);
    let mut consecutive = 0u32;

    info!(
        probe = %config.probe,
        interval_ms = config.interval.as_millis() as u64,
        threshold,
        "watchdog started"
    );

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("watchdog stopping");
                return Ok(WatchdogExit::Shutdown);
            }
            _ = ticker.tick() => {}
        }

        if probe(config.probe, config.connect_timeout).await {
            if consecutive > 0 {
                info!(after = consecutive, "connectivity probe recovered");
            }
            consecutive = 0;
            continue;
        }

        consecutive += 1;
        warn!(
            probe = %config.probe,
            consecutive,
            threshold,
            "connectivity probe failed"
        );
        if consecutive >= threshold {
            error!(probe = %config.probe, "connectivity lost, removing XDP");
            let links = recover()?;
            return Ok(WatchdogExit::Recovered { links });
        }
    }
}
