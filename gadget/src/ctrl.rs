// Copyright (c) 2024-2025 The TezSign Foundation

//! EP0 control endpoint: answer the vendor status request, stall the rest
//!
//! FunctionFS delivers setup packets as 8-byte `usb_ctrlrequest` records
//! on the ep0 file. The only request we honour is vendor-IN `0x5A`, which
//! returns the 8-byte status record; anything else gets a zero-length
//! write, which the UDC turns into a protocol STALL.

use std::{
    io,
    os::fd::RawFd,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use log::{debug, warn};
use tokio_util::sync::CancellationToken;

use tezsign_wire::{status_record, BM_REQ_TYPE_VENDOR_IN, VENDOR_REQ_READY};

/// Parsed `usb_ctrlrequest` (Linux UDC layout, little-endian).
#[derive(Copy, Clone, PartialEq, Debug)]
pub struct CtrlRequest {
    pub bm_request_type: u8,
    pub b_request: u8,
    pub w_value: u16,
    pub w_index: u16,
    pub w_length: u16,
}

impl CtrlRequest {
    pub fn parse(b: &[u8; 8]) -> CtrlRequest {
        CtrlRequest {
            bm_request_type: b[0],
            b_request: b[1],
            w_value: u16::from_le_bytes([b[2], b[3]]),
            w_index: u16::from_le_bytes([b[4], b[5]]),
            w_length: u16::from_le_bytes([b[6], b[7]]),
        }
    }

    pub fn is_status_request(&self) -> bool {
        self.bm_request_type == BM_REQ_TYPE_VENDOR_IN && self.b_request == VENDOR_REQ_READY
    }
}

/// Compute the reply for one setup packet: the status record for the
/// vendor request, an empty write (STALL) for everything else.
pub fn ctrl_reply(req: &CtrlRequest, ready: bool) -> Vec<u8> {
    if !req.is_status_request() {
        return Vec::new();
    }
    let record = status_record(ready);
    let n = (req.w_length as usize).min(record.len());
    record[..n].to_vec()
}

/// Serve setup packets on the ep0 descriptor until cancelled. Runs on a
/// dedicated blocking thread; the fd stays in blocking mode and the loop
/// exits when the fd is closed or the token fires between packets.
pub fn serve_ep0(
    fd: RawFd,
    ready: Arc<AtomicBool>,
    ct: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::task::spawn_blocking(move || {
        let mut buf = [0u8; 64];
        loop {
            if ct.is_cancelled() {
                return;
            }

            let n = match nix::unistd::read(fd, &mut buf) {
                Ok(n) => n,
                Err(nix::errno::Errno::EINTR) => continue,
                Err(err) => {
                    if !ct.is_cancelled() {
                        warn!("ep0 read failed err={err}");
                    }
                    return;
                }
            };
            if n < 8 {
                continue;
            }

            let setup = CtrlRequest::parse(&buf[..8].try_into().expect("checked length"));
            debug!(
                "ctrl-in bm=0x{:02x} bReq=0x{:02x} wValue={} wIndex={} wLength={}",
                setup.bm_request_type, setup.b_request, setup.w_value, setup.w_index,
                setup.w_length
            );

            let reply = ctrl_reply(&setup, ready.load(Ordering::SeqCst));
            if let Err(err) = write_all(fd, &reply) {
                warn!("ep0 write failed err={err}");
            }
        }
    })
}

fn write_all(fd: RawFd, data: &[u8]) -> io::Result<()> {
    use std::os::fd::BorrowedFd;

    let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
    let mut written = 0;
    // A zero-length write must still reach the UDC (it is the stall).
    loop {
        match nix::unistd::write(borrowed, &data[written..]) {
            Ok(n) => {
                written += n;
                if written >= data.len() {
                    return Ok(());
                }
            }
            Err(nix::errno::Errno::EINTR) => continue,
            Err(err) => return Err(io::Error::from(err)),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use tezsign_wire::STATUS_VERSION;

    #[test]
    fn parses_ctrl_request_little_endian() {
        let raw = [0x81, 0x5A, 0x34, 0x12, 0x78, 0x56, 0x08, 0x00];
        let req = CtrlRequest::parse(&raw);

        assert_eq!(req.bm_request_type, 0x81);
        assert_eq!(req.b_request, 0x5A);
        assert_eq!(req.w_value, 0x1234);
        assert_eq!(req.w_index, 0x5678);
        assert_eq!(req.w_length, 8);
        assert!(req.is_status_request());
    }

    #[test]
    fn status_reply_layout() {
        let req = CtrlRequest::parse(&[0x81, 0x5A, 0, 0, 0, 0, 0x08, 0x00]);

        let reply = ctrl_reply(&req, true);
        assert_eq!(reply.len(), 8);
        assert_eq!(&reply[..4], b"TZSG");
        assert_eq!(u16::from_le_bytes([reply[4], reply[5]]), STATUS_VERSION);
        assert_eq!(reply[6], 1);

        assert_eq!(ctrl_reply(&req, false)[6], 0);
    }

    #[test]
    fn short_w_length_truncates_reply() {
        let req = CtrlRequest::parse(&[0x81, 0x5A, 0, 0, 0, 0, 0x04, 0x00]);
        let reply = ctrl_reply(&req, true);
        assert_eq!(reply, b"TZSG");
    }

    #[test]
    fn non_vendor_requests_stall() {
        // Standard GET_DESCRIPTOR must not be answered.
        let req = CtrlRequest::parse(&[0x80, 0x06, 0, 0x01, 0, 0, 0x12, 0x00]);
        assert!(!req.is_status_request());
        assert!(ctrl_reply(&req, true).is_empty());

        // Vendor-OUT with the right bRequest still stalls.
        let req = CtrlRequest::parse(&[0x41, 0x5A, 0, 0, 0, 0, 0, 0]);
        assert!(ctrl_reply(&req, true).is_empty());
    }
}
