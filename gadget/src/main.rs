// Copyright (c) 2024-2025 The TezSign Foundation

//! TezSign gadget daemon
//!
//! Runs on the embedded board behind a FunctionFS USB function. Loads the
//! key records, recovers watermarks, then serves sign/status/unlock RPCs
//! arriving over the bulk endpoints through a [tezsign_broker::Broker].
//! The broker is rebuilt whenever it reports itself unhealthy or the host
//! detaches; the signing state survives because watermarks are committed
//! to disk before every signature.

use std::{
    fs::OpenOptions,
    os::fd::AsRawFd,
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::Context;
use clap::Parser;
use log::{debug, info, warn, LevelFilter};
use tokio_util::sync::CancellationToken;

use tezsign_broker::{Broker, FdReader, FdWriter};
use tezsign_core::{health::Monitor, FileStore, Keychain};

mod ctrl;
mod handler;
mod keys;
mod liveness;
mod notify;

/// TezSign USB gadget signing daemon
#[derive(Clone, Debug, Parser)]
struct Options {
    /// FunctionFS mount directory (ep0 control, ep1 IN, ep2 OUT)
    #[clap(long, default_value = "/dev/ffs-tezsign")]
    ffs_dir: PathBuf,

    /// Runtime directory for the liveness sockets
    #[clap(long, default_value = "/run/tezsign")]
    run_dir: PathBuf,

    /// Directory holding key records
    #[clap(long, default_value = "/var/lib/tezsign/keys")]
    keys_dir: PathBuf,

    /// Directory holding watermark state
    #[clap(long, default_value = "/var/lib/tezsign/state")]
    state_dir: PathBuf,

    /// Worker tasks handling inbound frames
    #[clap(long, default_value = "8")]
    workers: usize,

    /// Live task budget for the health monitor (0 = unlimited)
    #[clap(long, default_value = "0")]
    task_limit: usize,

    /// Log verbosity
    #[clap(long, default_value = "info")]
    log_level: LevelFilter,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Options::parse();
    simplelog::SimpleLogger::init(args.log_level, simplelog::Config::default()).unwrap();

    let root_ct = CancellationToken::new();
    spawn_signal_handler(root_ct.clone());

    // Signing state: keychain over the crash-atomic watermark store.
    let store = Arc::new(FileStore::new(&args.state_dir).context("opening watermark store")?);
    let keychain = Arc::new(Keychain::new(store).context("loading watermarks")?);
    let aliases = keys::load_keys(&args.keys_dir, &keychain)?;
    info!("keychain ready keys={}", aliases.len());

    let monitor = Monitor::new(args.task_limit);

    // Control endpoint: status record + stall policy.
    let ready = Arc::new(AtomicBool::new(false));
    let ep0 = OpenOptions::new()
        .read(true)
        .write(true)
        .open(args.ffs_dir.join("ep0"))
        .with_context(|| format!("opening ep0 under {:?}", args.ffs_dir))?;
    let ep0_task = ctrl::serve_ep0(ep0.as_raw_fd(), ready.clone(), root_ct.clone());

    // Liveness towards the registrar.
    let ready_sock = args.run_dir.join("ready.sock");
    let enabled_sock = args.run_dir.join("enabled.sock");
    std::fs::create_dir_all(&args.run_dir).ok();
    let ready_task = liveness::serve_ready_socket(ready_sock, root_ct.clone())
        .context("binding ready socket")?;

    // systemd plumbing.
    let notifier = notify::Notifier::from_env().map(Arc::new);
    let pinger = notifier
        .as_ref()
        .and_then(|n| notify::start_pinger(n.clone(), root_ct.clone()));
    if let Some(n) = &notifier {
        n.ready();
    }

    spawn_health_reporter(monitor.clone(), root_ct.clone());

    // Broker lifecycle: one broker per host attachment, rebuilt on
    // failure.
    while !root_ct.is_cancelled() {
        let Some(enabled) = liveness::await_enabled(&enabled_sock, &root_ct).await else {
            break;
        };

        let ep_out = match OpenOptions::new().read(true).open(args.ffs_dir.join("ep2")) {
            Ok(f) => f,
            Err(err) => {
                warn!("opening ep2 failed err={err}");
                backoff_or_exit(&root_ct).await;
                continue;
            }
        };
        let ep_in = match OpenOptions::new().write(true).open(args.ffs_dir.join("ep1")) {
            Ok(f) => f,
            Err(err) => {
                warn!("opening ep1 failed err={err}");
                backoff_or_exit(&root_ct).await;
                continue;
            }
        };

        let broker = Broker::new(
            FdReader::new(ep_out.as_raw_fd()),
            FdWriter::new(ep_in.as_raw_fd()),
            handler::rpc_handler(keychain.clone(), monitor.clone()),
            tezsign_broker::Options {
                worker_count: args.workers,
                ..Default::default()
            },
        );
        ready.store(true, Ordering::SeqCst);
        info!("broker up");

        let done = broker.done();
        tokio::select! {
            _ = done.cancelled() => {
                warn!("broker unhealthy; restarting");
            }
            _ = liveness::watch_enabled(enabled, &root_ct) => {
                info!("host detached; stopping broker");
            }
            _ = root_ct.cancelled() => {}
        }

        ready.store(false, Ordering::SeqCst);
        broker.stop().await;
        drop((ep_in, ep_out));

        if !root_ct.is_cancelled() {
            backoff_or_exit(&root_ct).await;
        }
    }

    info!("shutting down");
    if let Some(n) = &notifier {
        n.stopping();
    }
    root_ct.cancel();
    if let Some(p) = pinger {
        let _ = p.await;
    }
    let _ = ready_task.await;
    let _ = ep0_task.await;

    Ok(())
}

fn spawn_signal_handler(ct: CancellationToken) {
    tokio::spawn(async move {
        let mut term = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("installing SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
        info!("signal received, stopping");
        ct.cancel();
    });
}

fn spawn_health_reporter(monitor: Arc<Monitor>, ct: CancellationToken) {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(Duration::from_secs(30));
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    if !monitor.is_healthy() {
                        warn!(
                            "task budget exceeded tasks={}",
                            monitor.task_count()
                        );
                    }
                    debug!(
                        "health requests={} idle_s={} leaked_readers={} leaked_writers={}",
                        monitor.request_count(),
                        monitor.seconds_since_activity(),
                        tezsign_broker::leaked_readers(),
                        tezsign_broker::leaked_writers(),
                    );
                }
                _ = ct.cancelled() => return,
            }
        }
    });
}

async fn backoff_or_exit(ct: &CancellationToken) {
    tokio::select! {
        _ = tokio::time::sleep(Duration::from_millis(500)) => {}
        _ = ct.cancelled() => {}
    }
}
