// Copyright (c) 2024-2025 The TezSign Foundation

//! TezSign host daemon
//!
//! Bridges the block producer's remote-signer HTTP protocol onto the USB
//! link: HTTP requests become broker RPCs, broker failures become a
//! reconnect loop. The device node comes from the endpoint registrar and
//! is reopened whenever the broker reports itself unhealthy.

use std::{
    collections::HashSet,
    fs::OpenOptions,
    net::SocketAddr,
    os::fd::AsRawFd,
    path::PathBuf,
    sync::Arc,
    time::Duration,
};

use anyhow::Context;
use clap::Parser;
use log::{info, warn, LevelFilter};
use tokio_util::sync::CancellationToken;

use tezsign_broker::{handler, Broker, FdReader, FdWriter};

mod client;
mod http;

use http::{AppState, BrokerSlot};

/// TezSign host daemon
#[derive(Clone, Debug, Parser)]
struct Options {
    /// HTTP listen address for the signer API
    #[clap(long, env = "BROKER", default_value = "127.0.0.1:6732")]
    listen: SocketAddr,

    /// Gadget device node (read/write)
    #[clap(long, env = "TEZSIGN_DEVICE", default_value = "/dev/tezsign0")]
    device: PathBuf,

    /// tz4 addresses to expose (comma separated)
    #[clap(long, env = "TEZSIGN_UNLOCK_KEYS", value_delimiter = ',')]
    keys: Vec<String>,

    /// Passphrase used to unlock the exposed keys at startup
    #[clap(long, env = "TEZSIGN_UNLOCK_PASS", hide_env_values = true)]
    unlock_pass: Option<String>,

    /// Log verbosity
    #[clap(long, default_value = "info")]
    log_level: LevelFilter,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Options::parse();
    simplelog::SimpleLogger::init(args.log_level, simplelog::Config::default()).unwrap();

    if args.keys.is_empty() {
        anyhow::bail!("no keys configured (set TEZSIGN_UNLOCK_KEYS or --keys)");
    }
    let allowed: HashSet<String> = args.keys.iter().cloned().collect();
    info!("serving {} key(s)", allowed.len());

    let root_ct = CancellationToken::new();
    spawn_signal_handler(root_ct.clone());

    let slot: BrokerSlot = Arc::new(tokio::sync::RwLock::new(None));

    // HTTP front.
    let state = AppState {
        broker: slot.clone(),
        allowed: Arc::new(allowed),
    };
    let listener = tokio::net::TcpListener::bind(args.listen)
        .await
        .with_context(|| format!("binding {}", args.listen))?;
    info!("http listening on {}", args.listen);
    let server = {
        let ct = root_ct.clone();
        tokio::spawn(async move {
            let app = http::router(state);
            if let Err(err) = axum::serve(listener, app)
                .with_graceful_shutdown(ct.cancelled_owned())
                .await
            {
                warn!("http server exited err={err}");
            }
        })
    };

    // Device supervisor: (re)open the device node, run a broker over it,
    // unlock the configured keys, wait for trouble.
    supervise_device(&args, &slot, &root_ct).await;

    // Teardown.
    if let Some(broker) = slot.write().await.take() {
        broker.stop().await;
    }
    let _ = server.await;
    Ok(())
}

async fn supervise_device(args: &Options, slot: &BrokerSlot, root_ct: &CancellationToken) {
    while !root_ct.is_cancelled() {
        let device = match OpenOptions::new()
            .read(true)
            .write(true)
            .open(&args.device)
        {
            Ok(f) => f,
            Err(err) => {
                warn!("opening device failed path={:?} err={err}", args.device);
                backoff_or_exit(root_ct).await;
                continue;
            }
        };

        // The host never serves inbound requests; the gadget only ever
        // answers ours.
        let broker = Arc::new(Broker::new(
            FdReader::new(device.as_raw_fd()),
            FdWriter::new(device.as_raw_fd()),
            handler(|_ct, _payload| async move { Ok(Vec::new()) }),
            tezsign_broker::Options::default(),
        ));

        *slot.write().await = Some(broker.clone());
        info!("broker up device={:?}", args.device);

        unlock_keys(args, &broker, root_ct).await;

        let done = broker.done();
        tokio::select! {
            _ = done.cancelled() => warn!("broker unhealthy; reconnecting"),
            _ = root_ct.cancelled() => {}
        }

        *slot.write().await = None;
        broker.stop().await;
        drop(device);

        if !root_ct.is_cancelled() {
            backoff_or_exit(root_ct).await;
        }
    }
}

/// Unlock every configured key over the link. Failures are logged, not
/// fatal: a locked key simply refuses to sign until unlocked.
async fn unlock_keys(args: &Options, broker: &Broker, ct: &CancellationToken) {
    let Some(pass) = &args.unlock_pass else {
        return;
    };

    for addr in &args.keys {
        let address = match http::decode_tz4(addr) {
            Ok(address) => address,
            Err(err) => {
                warn!("skipping unlock of malformed address addr={addr} err={err}");
                continue;
            }
        };

        match tokio::time::timeout(
            Duration::from_secs(10),
            client::req_unlock(broker, ct, address, pass.as_bytes()),
        )
        .await
        {
            Ok(Ok(state)) => info!("key unlock addr={addr} state={state}"),
            Ok(Err(err)) => warn!("key unlock failed addr={addr} err={err}"),
            Err(_) => warn!("key unlock timed out addr={addr}"),
        }
    }
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

async fn backoff_or_exit(ct: &CancellationToken) {
    tokio::select! {
        _ = tokio::time::sleep(Duration::from_millis(500)) => {}
        _ = ct.cancelled() => {}
    }
}
