// Copyright (c) 2024-2025 The TezSign Foundation

use std::io;

use tezsign_wire::{FrameError, MAX_MESSAGE_PAYLOAD};

/// Broker errors surfaced to callers of [crate::Broker::request].
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Payload exceeds the protocol maximum
    #[error("payload exceeds maximum message payload ({MAX_MESSAGE_PAYLOAD} bytes)")]
    PayloadTooLarge(usize),

    /// Caller cancelled the request
    #[error("request cancelled")]
    Cancelled,

    /// Broker shut down while the request was outstanding
    #[error("broker closed")]
    Closed,

    /// Waiter was reaped before a response arrived
    #[error("timed out waiting for response")]
    TimedOut,

    /// Frame encoding failed
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    /// Transport failure
    #[error("transport error: {0}")]
    Io(#[from] io::Error),
}

/// True only for errors that mean the endpoint is permanently gone: a
/// closed descriptor or a removed device node. USB endpoints produce many
/// transient error types during normal operation (disconnect/reconnect,
/// suspend/resume, host resets), so everything else is retried.
pub(crate) fn is_fatal(err: &io::Error) -> bool {
    matches!(
        err.raw_os_error(),
        Some(nix::libc::EBADF) | Some(nix::libc::ENOENT)
    )
}

#[cfg(test)]
mod test {
    use super::*;
    use nix::libc;

    fn os_err(code: i32) -> io::Error {
        io::Error::from_raw_os_error(code)
    }

    #[test]
    fn fatal_classification() {
        assert!(is_fatal(&os_err(libc::EBADF)));
        assert!(is_fatal(&os_err(libc::ENOENT)));

        assert!(!is_fatal(&os_err(libc::EAGAIN)));
        assert!(!is_fatal(&os_err(libc::EIO)));
        assert!(!is_fatal(&os_err(libc::EPIPE)));
        assert!(!is_fatal(&os_err(libc::ECONNRESET)));
        assert!(!is_fatal(&os_err(libc::ETIMEDOUT)));
        assert!(!is_fatal(&os_err(libc::EINTR)));
        assert!(!is_fatal(&io::Error::new(io::ErrorKind::Other, "some error")));
    }
}
