// Copyright (c) 2024-2025 The TezSign Foundation

//! Low-overhead health monitoring for the signing path
//!
//! The signing hot path records activity with two atomic stores and
//! nothing else: no locks, no allocation, no I/O. Budget checks run from
//! a background task.

use std::{
    sync::atomic::{AtomicI64, AtomicU64, AtomicUsize, Ordering},
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};

/// Service health tracker.
pub struct Monitor {
    /// Unix timestamp of the last successful sign.
    last_activity: AtomicI64,
    /// Total requests processed.
    request_count: AtomicU64,
    /// Live task gauge (see [Monitor::task_guard]).
    task_count: AtomicUsize,
    /// Max allowed live tasks; 0 means no limit.
    task_limit: usize,
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

impl Monitor {
    pub fn new(task_limit: usize) -> Arc<Self> {
        let m = Monitor {
            last_activity: AtomicI64::new(unix_now()),
            request_count: AtomicU64::new(0),
            task_count: AtomicUsize::new(0),
            task_limit,
        };
        Arc::new(m)
    }

    /// Record one completed signing operation. Hot path: two atomics.
    pub fn record_activity(&self) {
        self.last_activity.store(unix_now(), Ordering::Relaxed);
        self.request_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn last_activity(&self) -> i64 {
        self.last_activity.load(Ordering::Relaxed)
    }

    pub fn request_count(&self) -> u64 {
        self.request_count.load(Ordering::Relaxed)
    }

    pub fn seconds_since_activity(&self) -> i64 {
        unix_now() - self.last_activity.load(Ordering::Relaxed)
    }

    /// Count a live task for the duration of the returned guard.
    pub fn task_guard(self: &Arc<Self>) -> TaskGuard {
        self.task_count.fetch_add(1, Ordering::Relaxed);
        TaskGuard {
            monitor: self.clone(),
        }
    }

    pub fn task_count(&self) -> usize {
        self.task_count.load(Ordering::Relaxed)
    }

    /// Background check only, never on the signing path.
    pub fn is_healthy(&self) -> bool {
        self.task_limit == 0 || self.task_count.load(Ordering::Relaxed) <= self.task_limit
    }
}

/// RAII gauge decrement.
pub struct TaskGuard {
    monitor: Arc<Monitor>,
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        self.monitor.task_count.fetch_sub(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn records_activity() {
        let m = Monitor::new(0);
        let before = m.request_count();

        m.record_activity();
        m.record_activity();

        assert_eq!(m.request_count(), before + 2);
        assert!(m.seconds_since_activity() <= 1);
        assert!(m.last_activity() > 0);
    }

    #[test]
    fn task_budget() {
        let m = Monitor::new(2);
        assert!(m.is_healthy());

        let g1 = m.task_guard();
        let g2 = m.task_guard();
        assert!(m.is_healthy());

        let g3 = m.task_guard();
        assert_eq!(m.task_count(), 3);
        assert!(!m.is_healthy());

        drop(g3);
        assert!(m.is_healthy());
        drop((g1, g2));
        assert_eq!(m.task_count(), 0);
    }

    #[test]
    fn zero_limit_means_unbounded() {
        let m = Monitor::new(0);
        let _guards: Vec<_> = (0..100).map(|_| m.task_guard()).collect();
        assert!(m.is_healthy());
    }
}
