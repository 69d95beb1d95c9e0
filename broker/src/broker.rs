// Copyright (c) 2024-2025 The TezSign Foundation

//! The broker: transport loops, worker pool, retry and deduplication

use std::{
    collections::{HashMap, HashSet},
    future::Future,
    io,
    pin::Pin,
    sync::{Arc, Mutex as StdMutex},
    time::Duration,
};

use log::{debug, error, warn};
use tokio::{
    sync::{mpsc, Mutex as AsyncMutex},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use zeroize::Zeroize;

use tezsign_wire::{
    frame, FrameType, MessageId, DEFAULT_BROKER_CAPACITY, DEFAULT_READ_BUFFER,
    MAX_MESSAGE_PAYLOAD,
};

use crate::{
    error::is_fatal,
    stash::{Extract, Stash},
    waiters::WaiterMap,
    Error, ReadCtx, WriteCtx,
};

pub const DEFAULT_WORKER_COUNT: usize = 8;
pub const WORK_QUEUE_SIZE: usize = 64;
pub const WRITE_QUEUE_SIZE: usize = 32;

/// Backoff discipline for the transport loops.
pub const INITIAL_BACKOFF: Duration = Duration::from_millis(10);
pub const MAX_BACKOFF: Duration = Duration::from_secs(1);
pub const BACKOFF_FACTOR: u32 = 2;

/// Consecutive failures tolerated before a loop gives up. Prevents tight
/// exit loops while still allowing recovery from transient trouble.
pub const MAX_CONSECUTIVE_ERRORS: u32 = 10;

/// Waiters that never hear back are reaped after this long.
pub const WAITER_TTL: Duration = Duration::from_secs(5 * 60);
pub const WAITER_REAP_INTERVAL: Duration = Duration::from_secs(30);

/// Upper bound on graceful shutdown.
pub const STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Application handler invoked for each inbound request. Receives the
/// broker's shutdown token; a well-behaved handler observes it. Errors
/// become empty responses on the wire (the application encodes its own
/// failures into the response payload).
pub type Handler = Arc<
    dyn Fn(
            CancellationToken,
            Vec<u8>,
        ) -> Pin<Box<dyn Future<Output = anyhow::Result<Vec<u8>>> + Send>>
        + Send
        + Sync,
>;

/// Wrap an async closure as a [Handler].
pub fn handler<F, Fut>(f: F) -> Handler
where
    F: Fn(CancellationToken, Vec<u8>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Vec<u8>>> + Send + 'static,
{
    Arc::new(move |ct, payload| Box::pin(f(ct, payload)))
}

/// Broker tuning knobs.
#[derive(Clone, Debug)]
pub struct Options {
    /// Stash capacity in bytes.
    pub capacity: usize,
    /// Number of worker tasks handling inbound frames.
    pub worker_count: usize,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            capacity: DEFAULT_BROKER_CAPACITY,
            worker_count: DEFAULT_WORKER_COUNT,
        }
    }
}

/// One inbound frame queued for the worker pool.
struct Work {
    id: MessageId,
    frame_type: u8,
    payload: Vec<u8>,
}

/// State shared between the loops and callers.
struct Shared {
    waiters: WaiterMap,
    /// Outbound requests not yet `accept`ed; payload retained for
    /// retransmission on a peer `retry`.
    unconfirmed: StdMutex<HashMap<MessageId, Vec<u8>>>,
    /// Inbound requests currently being handled (wire-level dedup).
    processing: StdMutex<HashSet<MessageId>>,
    write_tx: mpsc::Sender<Vec<u8>>,
    handler: Handler,
    /// Broker lifetime; cancelled by [Broker::stop].
    ct: CancellationToken,
    /// Cancelled when a critical loop exits unexpectedly.
    done: CancellationToken,
}

impl Shared {
    /// Encode and enqueue a frame on the write channel. Blocks only while
    /// the bounded channel is full, and then only until a cancellation.
    async fn send_frame(
        &self,
        caller: Option<&CancellationToken>,
        frame_type: FrameType,
        id: MessageId,
        payload: &[u8],
    ) -> Result<(), Error> {
        let data = frame::encode(frame_type, id, payload)?;

        let caller_cancelled = async {
            match caller {
                Some(ct) => ct.cancelled().await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            permit = self.write_tx.reserve() => match permit {
                Ok(permit) => {
                    permit.send(data);
                    Ok(())
                }
                Err(_) => Err(Error::Closed),
            },
            _ = caller_cancelled => Err(Error::Cancelled),
            _ = self.ct.cancelled() => Err(Error::Closed),
        }
    }

    /// Mark the broker unhealthy unless this is an ordinary shutdown.
    fn signal_unhealthy(&self, which: &str) {
        if !self.ct.is_cancelled() {
            warn!("{which} loop exited, broker unhealthy");
            self.done.cancel();
        }
    }

    fn delete_request(&self, id: &MessageId) {
        self.waiters.delete(id);
        self.unconfirmed.lock().unwrap().remove(id);
    }
}

/// A single broker instance owning one endpoint of the transport.
pub struct Broker {
    shared: Arc<Shared>,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
    worker_count: usize,
}

impl Broker {
    /// Spawn the broker loops. Must be called within a tokio runtime.
    pub fn new(
        reader: impl ReadCtx + 'static,
        writer: impl WriteCtx + 'static,
        handler: Handler,
        opts: Options,
    ) -> Broker {
        let (write_tx, write_rx) = mpsc::channel(WRITE_QUEUE_SIZE);
        let (work_tx, work_rx) = mpsc::channel(WORK_QUEUE_SIZE);

        let shared = Arc::new(Shared {
            waiters: WaiterMap::new(),
            unconfirmed: StdMutex::new(HashMap::new()),
            processing: StdMutex::new(HashSet::new()),
            write_tx,
            handler,
            ct: CancellationToken::new(),
            done: CancellationToken::new(),
        });

        let mut tasks = Vec::with_capacity(opts.worker_count + 3);

        let work_rx = Arc::new(AsyncMutex::new(work_rx));
        for _ in 0..opts.worker_count {
            tasks.push(tokio::spawn(worker(shared.clone(), work_rx.clone())));
        }
        tasks.push(tokio::spawn(read_loop(
            shared.clone(),
            Box::new(reader),
            work_tx,
            opts.capacity,
        )));
        tasks.push(tokio::spawn(write_loop(
            shared.clone(),
            Box::new(writer),
            write_rx,
        )));
        tasks.push(tokio::spawn(reaper(shared.clone())));

        Broker {
            shared,
            tasks: StdMutex::new(tasks),
            worker_count: opts.worker_count,
        }
    }

    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    /// Token cancelled when the broker becomes unhealthy (a critical loop
    /// exited unexpectedly). Supervisors restart the broker when it fires.
    pub fn done(&self) -> CancellationToken {
        self.shared.done.clone()
    }

    /// Issue a request and wait for the matching response.
    ///
    /// Returns the response payload and the message ID used on the wire.
    /// Resolution order: response delivered, caller cancellation, broker
    /// shutdown. A response arriving after cancellation is dropped.
    pub async fn request(
        &self,
        ct: &CancellationToken,
        payload: &[u8],
    ) -> Result<(Vec<u8>, MessageId), Error> {
        if payload.len() > u32::MAX as usize || payload.len() > MAX_MESSAGE_PAYLOAD {
            return Err(Error::PayloadTooLarge(payload.len()));
        }

        let (id, rx) = self.shared.waiters.new_waiter();
        self.shared
            .unconfirmed
            .lock()
            .unwrap()
            .insert(id, payload.to_vec());

        debug!("tx req id={} size={}", id, payload.len());

        if let Err(err) = self
            .shared
            .send_frame(Some(ct), FrameType::Request, id, payload)
            .await
        {
            debug!("tx req write failed id={} err={}", id, err);
            self.shared.delete_request(&id);
            return Err(err);
        }

        tokio::select! {
            resp = rx => match resp {
                Ok(resp) => {
                    self.shared.unconfirmed.lock().unwrap().remove(&id);
                    Ok((resp, id))
                }
                // Slot dropped without delivery: the reaper got there first.
                Err(_) => {
                    self.shared.unconfirmed.lock().unwrap().remove(&id);
                    Err(Error::TimedOut)
                }
            },
            _ = ct.cancelled() => {
                self.shared.delete_request(&id);
                Err(Error::Cancelled)
            }
            _ = self.shared.ct.cancelled() => {
                self.shared.delete_request(&id);
                Err(Error::Closed)
            }
        }
    }

    /// Graceful shutdown bounded by [STOP_TIMEOUT]. Tasks still blocked in
    /// a syscall after the deadline are abandoned (acceptable during
    /// process exit; the fd adapter counts them).
    pub async fn stop(&self) {
        self.shared.ct.cancel();

        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().unwrap().drain(..).collect();
        let drain = async {
            for t in tasks {
                let _ = t.await;
            }
        };

        if tokio::time::timeout(STOP_TIMEOUT, drain).await.is_err() {
            warn!("broker stop timed out, forcing shutdown");
        }
    }
}

async fn read_loop(
    shared: Arc<Shared>,
    mut reader: Box<dyn ReadCtx>,
    work_tx: mpsc::Sender<Work>,
    capacity: usize,
) {
    let mut buf = vec![0u8; DEFAULT_READ_BUFFER];
    let mut stash = Stash::new(capacity);
    let mut backoff = INITIAL_BACKOFF;
    let mut consecutive_errors = 0u32;

    loop {
        if shared.ct.is_cancelled() {
            return;
        }

        let res = match reader.read_ctx(&shared.ct, &mut buf).await {
            Ok(0) => Err(io::Error::new(io::ErrorKind::UnexpectedEof, "eof")),
            other => other,
        };

        match res {
            Ok(n) => {
                stash.write(&buf[..n]);
                buf[..n].zeroize();
                if !drain_stash(&shared, &mut stash, &work_tx) {
                    return;
                }
                backoff = INITIAL_BACKOFF;
                consecutive_errors = 0;
            }
            Err(err) => {
                if shared.ct.is_cancelled() {
                    debug!("read loop: shutdown err={err}");
                    return;
                }

                consecutive_errors += 1;
                if consecutive_errors >= MAX_CONSECUTIVE_ERRORS {
                    error!(
                        "read loop: too many consecutive errors, exiting errors={consecutive_errors} last_err={err}"
                    );
                    shared.signal_unhealthy("read");
                    return;
                }
                if is_fatal(&err) {
                    error!("read loop: fatal error, exiting err={err}");
                    shared.signal_unhealthy("read");
                    return;
                }

                // Transient: hint the peer to retransmit, then back off.
                let _ = shared
                    .send_frame(None, FrameType::Retry, MessageId::default(), &[])
                    .await;
                debug!(
                    "read error, backing off err={err} backoff={backoff:?} consecutive={consecutive_errors}"
                );

                tokio::select! {
                    _ = tokio::time::sleep(backoff) => {}
                    _ = shared.ct.cancelled() => return,
                }
                backoff = (backoff * BACKOFF_FACTOR).min(MAX_BACKOFF);
            }
        }
    }
}

/// Drain complete frames from the stash into the work queue. Drops never
/// block the reader: a full queue costs the newest frame and a warning,
/// and the peer's retry discipline recovers it. Returns false on shutdown.
fn drain_stash(shared: &Shared, stash: &mut Stash, work_tx: &mpsc::Sender<Work>) -> bool {
    loop {
        let (id, frame_type, payload) = match stash.read_payload() {
            Extract::Frame(id, frame_type, payload) => (id, frame_type, payload),
            Extract::NoPayload | Extract::Incomplete => return true,
            Extract::InvalidPayloadSize => continue,
            Extract::InvalidPayload => {
                warn!("bad payload; resync");
                continue;
            }
        };

        if shared.ct.is_cancelled() {
            return false;
        }

        match work_tx.try_send(Work {
            id,
            frame_type,
            payload,
        }) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(w)) => {
                warn!(
                    "work queue full, dropping message type={:02x} id={}",
                    w.frame_type, w.id
                );
            }
            Err(mpsc::error::TrySendError::Closed(_)) => return false,
        }
    }
}

async fn write_loop(
    shared: Arc<Shared>,
    mut writer: Box<dyn WriteCtx>,
    mut write_rx: mpsc::Receiver<Vec<u8>>,
) {
    let mut backoff = INITIAL_BACKOFF;
    let mut consecutive_errors = 0u32;

    loop {
        let data = tokio::select! {
            data = write_rx.recv() => match data {
                Some(data) => data,
                None => return,
            },
            _ = shared.ct.cancelled() => return,
        };

        loop {
            if shared.ct.is_cancelled() {
                return;
            }

            match writer.write_ctx(&shared.ct, &data).await {
                Ok(_) => {
                    backoff = INITIAL_BACKOFF;
                    consecutive_errors = 0;
                    break;
                }
                Err(err) => {
                    if shared.ct.is_cancelled() {
                        debug!("write loop: shutdown err={err}");
                        return;
                    }

                    consecutive_errors += 1;
                    if consecutive_errors >= MAX_CONSECUTIVE_ERRORS {
                        error!(
                            "write loop: too many consecutive errors, exiting errors={consecutive_errors} last_err={err}"
                        );
                        shared.signal_unhealthy("write");
                        return;
                    }
                    if is_fatal(&err) {
                        error!("write loop: fatal error, exiting err={err}");
                        shared.signal_unhealthy("write");
                        return;
                    }

                    debug!(
                        "write error, backing off err={err} backoff={backoff:?} consecutive={consecutive_errors}"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(backoff) => {}
                        _ = shared.ct.cancelled() => return,
                    }
                    backoff = (backoff * BACKOFF_FACTOR).min(MAX_BACKOFF);
                }
            }
        }
    }
}

/// Worker task: one frame at a time off the shared queue. The queue lock is
/// held only across the dequeue, so at most `worker_count` handlers run
/// concurrently.
async fn worker(shared: Arc<Shared>, work_rx: Arc<AsyncMutex<mpsc::Receiver<Work>>>) {
    loop {
        let work = {
            let mut rx = work_rx.lock().await;
            tokio::select! {
                work = rx.recv() => work,
                _ = shared.ct.cancelled() => return,
            }
        };

        match work {
            Some(work) => handle_work(&shared, work).await,
            None => return,
        }
    }
}

async fn handle_work(shared: &Arc<Shared>, work: Work) {
    match FrameType::from_wire(work.frame_type) {
        Ok(FrameType::Response) => {
            debug!("rx resp id={} size={}", work.id, work.payload.len());
            if let Some(slot) = shared.waiters.load_and_delete(&work.id) {
                if slot.send(work.payload).is_err() {
                    // Receiver gone: caller cancelled between lookup and
                    // delivery. At-most-once is deliberate.
                    warn!("response slot closed, dropping id={}", work.id);
                }
            }
        }

        Ok(FrameType::Request) => {
            debug!("rx req id={} size={}", work.id, work.payload.len());
            if !shared.processing.lock().unwrap().insert(work.id) {
                debug!("duplicate request being processed; ignoring id={}", work.id);
                return;
            }

            // Confirm receipt before doing any work.
            let _ = shared.send_frame(None, FrameType::Accept, work.id, &[]).await;

            let handler = shared.handler.clone();
            let ct = shared.ct.clone();
            let payload = work.payload;
            let resp = match tokio::spawn(async move { (handler)(ct, payload).await }).await {
                Ok(Ok(resp)) => resp,
                Ok(Err(err)) => {
                    debug!("handler error id={} err={err:#}", work.id);
                    Vec::new()
                }
                Err(join_err) => {
                    // Panics must not take the broker down.
                    error!("handler panicked id={} err={join_err}", work.id);
                    Vec::new()
                }
            };

            shared.processing.lock().unwrap().remove(&work.id);

            debug!("tx resp id={} size={}", work.id, resp.len());
            let _ = shared
                .send_frame(None, FrameType::Response, work.id, &resp)
                .await;
        }

        Ok(FrameType::Accept) => {
            debug!("rx accept id={}", work.id);
            shared.unconfirmed.lock().unwrap().remove(&work.id);
        }

        Ok(FrameType::Retry) => {
            debug!("rx retry id={}", work.id);
            let unconfirmed: Vec<(MessageId, Vec<u8>)> = shared
                .unconfirmed
                .lock()
                .unwrap()
                .iter()
                .map(|(id, payload)| (*id, payload.clone()))
                .collect();
            for (req_id, req_payload) in unconfirmed {
                let _ = shared
                    .send_frame(None, FrameType::Request, req_id, &req_payload)
                    .await;
            }
        }

        Err(unknown) => {
            warn!("unknown type; resync type={unknown:02x} id={}", work.id);
        }
    }
}

async fn reaper(shared: Arc<Shared>) {
    let mut tick = tokio::time::interval(WAITER_REAP_INTERVAL);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = tick.tick() => {
                let reaped = shared.waiters.reap_stale(WAITER_TTL);
                if reaped > 0 {
                    debug!("reaped stale waiters count={reaped}");
                }
            }
            _ = shared.ct.cancelled() => return,
        }
    }
}
