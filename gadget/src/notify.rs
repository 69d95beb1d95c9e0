// Copyright (c) 2024-2025 The TezSign Foundation

//! systemd sd_notify integration
//!
//! Sends `READY=1` after initialisation, periodic `WATCHDOG=1` pings at
//! half the advertised interval, and `STOPPING=1` during shutdown. All
//! operations are no-ops when `NOTIFY_SOCKET` is not set (running outside
//! systemd, or without `Type=notify`).

use std::{io, os::unix::net::UnixDatagram, time::Duration};

use log::{debug, warn};
use tokio_util::sync::CancellationToken;

/// systemd notification sender. `None` when `NOTIFY_SOCKET` is unset.
pub struct Notifier {
    sock: UnixDatagram,
    addr: String,
}

impl Notifier {
    /// Build from the environment. Returns `None` outside systemd.
    pub fn from_env() -> Option<Notifier> {
        let addr = std::env::var("NOTIFY_SOCKET").ok()?;
        if addr.is_empty() {
            return None;
        }
        let sock = UnixDatagram::unbound().ok()?;
        Some(Notifier { sock, addr })
    }

    fn send(&self, msg: &str) -> io::Result<()> {
        self.sock.send_to(msg.as_bytes(), &self.addr).map(|_| ())
    }

    /// Signal that initialisation is complete.
    pub fn ready(&self) {
        if let Err(err) = self.send("READY=1") {
            warn!("sd_notify READY failed err={err}");
        }
    }

    /// Signal the start of graceful shutdown.
    pub fn stopping(&self) {
        if let Err(err) = self.send("STOPPING=1") {
            warn!("sd_notify STOPPING failed err={err}");
        }
    }

    /// One watchdog ping.
    pub fn ping(&self) {
        if let Err(err) = self.send("WATCHDOG=1") {
            warn!("sd_notify WATCHDOG failed err={err}");
        }
    }
}

/// Recommended ping interval: half of `WATCHDOG_USEC`. Zero when the
/// watchdog is not configured.
pub fn watchdog_interval() -> Duration {
    let usec: u64 = std::env::var("WATCHDOG_USEC")
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(0);
    Duration::from_micros(usec / 2)
}

/// Spawn the periodic pinger. Does nothing when the watchdog is not
/// configured.
pub fn start_pinger(
    notifier: std::sync::Arc<Notifier>,
    ct: CancellationToken,
) -> Option<tokio::task::JoinHandle<()>> {
    let interval = watchdog_interval();
    if interval.is_zero() {
        return None;
    }

    debug!("watchdog pinger started interval={interval:?}");
    Some(tokio::spawn(async move {
        let mut tick = tokio::time::interval(interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = tick.tick() => notifier.ping(),
                _ = ct.cancelled() => return,
            }
        }
    }))
}
