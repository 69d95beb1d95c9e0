// Copyright (c) 2024-2025 The TezSign Foundation

//! Correlation table for outstanding outbound requests
//!
//! Each waiter pairs a random 16-byte message ID with a single-shot
//! delivery slot. Responses are delivered at most once; waiters that never
//! hear back are reaped after a TTL so the table cannot grow without bound
//! across gadget reboots.

use std::{
    collections::HashMap,
    sync::Mutex,
    time::{Duration, Instant},
};

use tokio::sync::oneshot;

use tezsign_wire::MessageId;

struct Waiter {
    slot: oneshot::Sender<Vec<u8>>,
    created: Instant,
}

/// Concurrent map of message ID to delivery slot.
#[derive(Default)]
pub struct WaiterMap {
    inner: Mutex<HashMap<MessageId, Waiter>>,
}

impl WaiterMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a fresh waiter under a new random ID.
    pub fn new_waiter(&self) -> (MessageId, oneshot::Receiver<Vec<u8>>) {
        let id = MessageId::random();
        let (tx, rx) = oneshot::channel();
        self.inner.lock().unwrap().insert(
            id,
            Waiter {
                slot: tx,
                created: Instant::now(),
            },
        );
        (id, rx)
    }

    pub fn delete(&self, id: &MessageId) {
        self.inner.lock().unwrap().remove(id);
    }

    /// Take the delivery slot for `id`, if still registered.
    pub fn load_and_delete(&self, id: &MessageId) -> Option<oneshot::Sender<Vec<u8>>> {
        self.inner.lock().unwrap().remove(id).map(|w| w.slot)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().is_empty()
    }

    /// Remove every waiter older than `ttl`. Dropping the slot makes the
    /// awaiting caller observe closure and fail with a timeout-like error.
    pub fn reap_stale(&self, ttl: Duration) -> usize {
        let mut inner = self.inner.lock().unwrap();
        let before = inner.len();
        inner.retain(|_, w| w.created.elapsed() < ttl);
        before - inner.len()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn delivery_consumes_waiter() {
        let wm = WaiterMap::new();
        let (id, mut rx) = wm.new_waiter();

        let slot = wm.load_and_delete(&id).expect("waiter registered");
        slot.send(b"response".to_vec()).unwrap();

        assert_eq!(rx.try_recv().unwrap(), b"response");
        assert!(wm.load_and_delete(&id).is_none());
    }

    #[test]
    fn reap_stale_zero_removes_all() {
        let wm = WaiterMap::new();
        let (_, _rx1) = wm.new_waiter();
        let (_, _rx2) = wm.new_waiter();
        let (_, _rx3) = wm.new_waiter();

        assert_eq!(wm.reap_stale(Duration::from_secs(3600)), 0);
        assert_eq!(wm.reap_stale(Duration::ZERO), 3);
        assert!(wm.is_empty());
    }

    #[test]
    fn reaped_waiter_observes_closure() {
        let wm = WaiterMap::new();
        let (_, mut rx) = wm.new_waiter();

        wm.reap_stale(Duration::ZERO);
        assert!(matches!(
            rx.try_recv(),
            Err(oneshot::error::TryRecvError::Closed)
        ));
    }
}
