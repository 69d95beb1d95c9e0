// Copyright (c) 2024-2025 The TezSign Foundation

//! Request/response broker over an unordered, lossy, reboot-prone byte
//! stream
//!
//! A [Broker] owns one endpoint of the USB link: a cancellable read source,
//! a write sink, a fixed worker pool and the request-tracking tables. It
//! provides exactly-once-visible request/response semantics on top of a
//! transport that guarantees nothing:
//!
//! * frames are located by magic + parity and resynchronised via the
//!   [stash][stash::Stash] after corruption,
//! * inbound duplicates are suppressed while the first copy is in flight,
//! * outbound requests are retained until the peer `accept`s them and
//!   retransmitted when the peer signals `retry`,
//! * transient transport errors are retried with exponential backoff and
//!   only a fatal error (or ten consecutive failures) marks the broker
//!   [done][Broker::done].
//!
//! See [tezsign_wire] for the frame layout.

use std::io;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

mod broker;
pub use broker::{handler, Broker, Handler, Options};

mod error;
pub use error::Error;

pub mod io_ext;
pub use io_ext::{leaked_readers, leaked_writers, FdReader, FdWriter};

pub mod stash;

pub mod waiters;
pub use waiters::WaiterMap;

/// Cancellable byte source.
///
/// `read_ctx` must return promptly once `ct` is cancelled, even while the
/// underlying operation is blocked (see [io_ext] for the fd-backed
/// implementation and its leak accounting).
#[async_trait]
pub trait ReadCtx: Send {
    async fn read_ctx(&mut self, ct: &CancellationToken, buf: &mut [u8]) -> io::Result<usize>;
}

/// Cancellable byte sink. `write_ctx` writes the whole buffer or fails.
#[async_trait]
pub trait WriteCtx: Send {
    async fn write_ctx(&mut self, ct: &CancellationToken, buf: &[u8]) -> io::Result<usize>;
}
