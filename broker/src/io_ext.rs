// Copyright (c) 2024-2025 The TezSign Foundation

//! Cancellable read/write over a raw file descriptor
//!
//! FunctionFS endpoint files block in `read(2)`/`write(2)` with no native
//! async story, so each operation runs on a blocking worker that polls the
//! descriptor in short slices and re-checks the cancellation token between
//! slices. A cancelled caller returns immediately; the abandoned worker
//! finishes its current slice (at most [POLL_SLICE_MS]) on its own. Each
//! abandonment is counted in a visible atomic so operators can watch for
//! pile-ups.

use std::{
    io,
    os::fd::{BorrowedFd, RawFd},
    sync::atomic::{AtomicU64, Ordering},
};

use async_trait::async_trait;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use tokio_util::sync::CancellationToken;
use zeroize::Zeroize;

use crate::{ReadCtx, WriteCtx};

/// Poll slice between cancellation checks.
const POLL_SLICE_MS: u16 = 100;

static LEAKED_READERS: AtomicU64 = AtomicU64::new(0);
static LEAKED_WRITERS: AtomicU64 = AtomicU64::new(0);

/// Blocking read workers abandoned by cancellation so far.
pub fn leaked_readers() -> u64 {
    LEAKED_READERS.load(Ordering::Relaxed)
}

/// Blocking write workers abandoned by cancellation so far.
pub fn leaked_writers() -> u64 {
    LEAKED_WRITERS.load(Ordering::Relaxed)
}

fn cancelled_err() -> io::Error {
    io::Error::new(io::ErrorKind::Interrupted, "operation cancelled")
}

/// Cancellable reader over a raw fd. The fd is owned by the caller (an
/// opened endpoint file kept alive for the broker's lifetime).
pub struct FdReader {
    fd: RawFd,
}

impl FdReader {
    pub fn new(fd: RawFd) -> Self {
        FdReader { fd }
    }
}

/// Cancellable writer over a raw fd.
pub struct FdWriter {
    fd: RawFd,
}

impl FdWriter {
    pub fn new(fd: RawFd) -> Self {
        FdWriter { fd }
    }
}

/// Wait for `events` on `fd`, honouring the token between slices.
fn poll_ready(fd: RawFd, events: PollFlags, ct: &CancellationToken) -> io::Result<()> {
    loop {
        if ct.is_cancelled() {
            return Err(cancelled_err());
        }

        let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
        let mut fds = [PollFd::new(borrowed, events)];
        match poll(&mut fds, PollTimeout::from(POLL_SLICE_MS)) {
            Ok(0) => continue, // slice elapsed, re-check token
            Ok(_) => return Ok(()),
            Err(nix::errno::Errno::EINTR) => continue,
            Err(errno) => return Err(io::Error::from(errno)),
        }
    }
}

#[async_trait]
impl ReadCtx for FdReader {
    async fn read_ctx(&mut self, ct: &CancellationToken, buf: &mut [u8]) -> io::Result<usize> {
        let fd = self.fd;
        let cap = buf.len();
        let worker_ct = ct.clone();

        let task = tokio::task::spawn_blocking(move || -> io::Result<Vec<u8>> {
            poll_ready(fd, PollFlags::POLLIN, &worker_ct)?;

            let mut tmp = vec![0u8; cap];
            let n = nix::unistd::read(fd, &mut tmp).map_err(io::Error::from)?;
            tmp.truncate(n);
            Ok(tmp)
        });

        tokio::select! {
            res = task => {
                let mut data = res.map_err(|e| io::Error::new(io::ErrorKind::Other, e))??;
                let n = data.len();
                buf[..n].copy_from_slice(&data);
                data.zeroize();
                Ok(n)
            }
            _ = ct.cancelled() => {
                LEAKED_READERS.fetch_add(1, Ordering::Relaxed);
                Err(cancelled_err())
            }
        }
    }
}

#[async_trait]
impl WriteCtx for FdWriter {
    async fn write_ctx(&mut self, ct: &CancellationToken, buf: &[u8]) -> io::Result<usize> {
        let fd = self.fd;
        let data = buf.to_vec();
        let worker_ct = ct.clone();

        let task = tokio::task::spawn_blocking(move || -> io::Result<usize> {
            let total = data.len();
            let mut written = 0;
            while written < total {
                poll_ready(fd, PollFlags::POLLOUT, &worker_ct)?;

                let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
                match nix::unistd::write(borrowed, &data[written..]) {
                    Ok(n) => written += n,
                    Err(nix::errno::Errno::EINTR) => continue,
                    Err(errno) => return Err(io::Error::from(errno)),
                }
            }
            Ok(written)
        });

        tokio::select! {
            res = task => res.map_err(|e| io::Error::new(io::ErrorKind::Other, e))?,
            _ = ct.cancelled() => {
                LEAKED_WRITERS.fetch_add(1, Ordering::Relaxed);
                Err(cancelled_err())
            }
        }
    }
}
