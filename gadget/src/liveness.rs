// Copyright (c) 2024-2025 The TezSign Foundation

//! Liveness sockets shared with the endpoint registrar
//!
//! Two unix sockets carry the gadget/registrar handshake:
//!
//! * `ready.sock`: served here. The registrar connects and keeps one
//!   connection open; an open socket *is* the liveness signal, no bytes
//!   are exchanged.
//! * `enabled.sock`: served by the registrar once the host side has
//!   attached. We dial it and block on the connection; losing it means
//!   the host is gone and the brokers must terminate.

use std::{
    io,
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
    time::Duration,
};

use log::{info, warn};
use tokio::io::AsyncReadExt;
use tokio::net::{UnixListener, UnixStream};
use tokio_util::sync::CancellationToken;

/// Hold `ready.sock` open while the process is healthy. The listener is
/// removed when the returned task is cancelled.
pub fn serve_ready_socket(path: PathBuf, ct: CancellationToken) -> io::Result<tokio::task::JoinHandle<()>> {
    let _ = std::fs::remove_file(&path); // stale socket from a crash
    let listener = UnixListener::bind(&path)?;
    // World-connectable is fine; presence is the only signal.
    let _ = std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o666));

    info!("ready socket listening path={path:?}");

    Ok(tokio::spawn(async move {
        loop {
            let conn = tokio::select! {
                conn = listener.accept() => conn,
                _ = ct.cancelled() => break,
            };

            match conn {
                Ok((stream, _)) => {
                    // Drain and discard until the registrar goes away.
                    tokio::spawn(hold_connection(stream));
                }
                Err(err) => {
                    warn!("ready socket accept err={err}");
                }
            }
        }
        let _ = std::fs::remove_file(&path);
    }))
}

async fn hold_connection(mut stream: UnixStream) {
    let mut buf = [0u8; 1];
    while let Ok(n) = stream.read(&mut buf).await {
        if n == 0 {
            return;
        }
    }
}

/// Wait until `enabled.sock` accepts a connection (the host attached).
pub async fn await_enabled(path: &Path, ct: &CancellationToken) -> Option<UnixStream> {
    loop {
        match UnixStream::connect(path).await {
            Ok(stream) => {
                info!("host enabled (connected) path={path:?}");
                return Some(stream);
            }
            Err(_) => {
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_millis(500)) => {}
                    _ = ct.cancelled() => return None,
                }
            }
        }
    }
}

/// Block until the enabled connection dies (the host detached) or the
/// token fires.
pub async fn watch_enabled(mut stream: UnixStream, ct: &CancellationToken) {
    let mut buf = [0u8; 16];
    loop {
        tokio::select! {
            res = stream.read(&mut buf) => match res {
                Ok(0) | Err(_) => {
                    warn!("lost enabled socket; host detached");
                    return;
                }
                Ok(_) => {} // discard
            },
            _ = ct.cancelled() => return,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn ready_socket_accepts_and_survives_peers() {
        let dir = std::env::temp_dir().join(format!("tezsign-ready-{}", std::process::id()));
        let _ = std::fs::create_dir_all(&dir);
        let path = dir.join("ready.sock");

        let ct = CancellationToken::new();
        let task = serve_ready_socket(path.clone(), ct.clone()).unwrap();

        // Two registrar generations connect and drop.
        for _ in 0..2 {
            let conn = UnixStream::connect(&path).await.unwrap();
            drop(conn);
        }

        ct.cancel();
        let _ = task.await;
        assert!(!path.exists());
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn enabled_watch_detects_loss() {
        let dir = std::env::temp_dir().join(format!("tezsign-enabled-{}", std::process::id()));
        let _ = std::fs::create_dir_all(&dir);
        let path = dir.join("enabled.sock");
        let _ = std::fs::remove_file(&path);

        let listener = UnixListener::bind(&path).unwrap();
        let ct = CancellationToken::new();

        let accept = tokio::spawn(async move { listener.accept().await.unwrap().0 });
        let stream = await_enabled(&path, &ct).await.unwrap();
        let server_side = accept.await.unwrap();

        // Dropping the server side must wake the watcher promptly.
        let watch = tokio::spawn({
            let ct = ct.clone();
            async move { watch_enabled(stream, &ct).await }
        });
        drop(server_side);

        tokio::time::timeout(Duration::from_secs(2), watch)
            .await
            .expect("watcher did not notice loss")
            .unwrap();

        let _ = std::fs::remove_dir_all(&dir);
    }
}
