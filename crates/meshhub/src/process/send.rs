//! The send dispatcher.
//!
//! Outbound frames enter one of `SC` shard channels; each shard's consumer
//! routes tasks to the writer belonging to the destination connection. Every
//! connection gets exactly one writer task with a bounded queue, so frames
//! sent to one connection hit the socket in enqueue order. The writer
//! encodes through the fixed-header fast path ([`wire::encode_header`]
//! stack-builds the 32 bytes, written ahead of the payload without
//! concatenation).
//!
//! Both enqueue steps are bounded by `send.enqueue_timeout_ms`; a timeout
//! surfaces as [`SendError::EnqueueTimeout`] instead of blocking the caller
//! indefinitely.

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock, Weak};
use std::time::Duration;

use bytes::Bytes;
use log::{debug, warn};
use tokio::select;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::{keys, Config};
use crate::connection::Connection;
use crate::server::Context;
use crate::wire::TcpHeader;

use super::strategy::fnv32a;

/// An error from the send path.
#[derive(Debug)]
#[non_exhaustive]
pub enum SendError {
    /// The destination connection is gone.
    NotFound(String),
    /// A bounded enqueue did not complete within the configured timeout.
    EnqueueTimeout,
    /// The dispatcher is shut down.
    DispatcherClosed,
    /// The per-connection writer is gone.
    WriterClosed,
    /// The caller's context was cancelled.
    Cancelled,
    /// An audit hook vetoed the send.
    Rejected(String),
    Io(io::Error),
}

impl fmt::Display for SendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SendError::NotFound(id) => write!(f, "conn not found: {id}"),
            SendError::EnqueueTimeout => write!(f, "enqueue timeout"),
            SendError::DispatcherClosed => write!(f, "send dispatcher closed"),
            SendError::WriterClosed => write!(f, "writer closed"),
            SendError::Cancelled => write!(f, "context cancelled"),
            SendError::Rejected(why) => write!(f, "send rejected: {why}"),
            SendError::Io(e) => write!(f, "send io error: {e}"),
        }
    }
}

impl std::error::Error for SendError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SendError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for SendError {
    fn from(e: io::Error) -> Self {
        SendError::Io(e)
    }
}

/// Completion callback carried with each task; invoked with the write
/// result once the frame hit the socket (or failed to).
pub type SendCallback = Box<dyn FnOnce(Result<(), SendError>) + Send>;

#[derive(Debug, Clone)]
pub struct SendOptions {
    pub channel_count: usize,
    /// Accepted for configuration compatibility; routing fans out to one
    /// writer per connection, so values beyond 1 have no effect.
    pub workers_per_channel: usize,
    pub channel_buffer: usize,
    /// Depth of each per-connection writer queue.
    pub conn_buffer: usize,
    /// Bounded wait for both enqueue steps; zero waits forever (subject to
    /// cancellation).
    pub enqueue_timeout: Duration,
}

impl Default for SendOptions {
    fn default() -> Self {
        Self {
            channel_count: 1,
            workers_per_channel: 1,
            channel_buffer: 64,
            conn_buffer: 64,
            enqueue_timeout: Duration::from_millis(100),
        }
    }
}

impl SendOptions {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            channel_count: cfg.get_positive(keys::SEND_CHANNEL_COUNT, 1),
            workers_per_channel: cfg.get_positive(keys::SEND_WORKERS_PER_CHAN, 1),
            channel_buffer: cfg.get_positive(keys::SEND_CHANNEL_BUFFER, 64),
            conn_buffer: cfg.get_positive(keys::SEND_CONN_BUFFER, 64),
            enqueue_timeout: cfg.get_duration_ms(keys::SEND_ENQUEUE_TIMEOUT_MS, 100),
        }
    }
}

struct SendTask {
    conn: Arc<dyn Connection>,
    hdr: TcpHeader,
    payload: Bytes,
    cb: Option<SendCallback>,
}

struct ConnWriter {
    tx: mpsc::Sender<SendTask>,
    handle: JoinHandle<()>,
}

pub struct SendDispatcher {
    opts: SendOptions,
    shards: Vec<mpsc::Sender<SendTask>>,
    receivers: StdMutex<Vec<mpsc::Receiver<SendTask>>>,
    writers: RwLock<HashMap<String, ConnWriter>>,
    /// Writers already detached via `close_conn`, still draining.
    retired: StdMutex<Vec<JoinHandle<()>>>,
    shard_tasks: StdMutex<Vec<JoinHandle<()>>>,
    cancel: CancellationToken,
    started: AtomicBool,
    shut: AtomicBool,
    weak: Weak<SendDispatcher>,
}

impl SendDispatcher {
    pub fn new(opts: SendOptions) -> Arc<Self> {
        let mut opts = opts;
        opts.channel_count = opts.channel_count.max(1);
        opts.workers_per_channel = opts.workers_per_channel.max(1);
        opts.channel_buffer = opts.channel_buffer.max(1);
        opts.conn_buffer = opts.conn_buffer.max(1);

        let mut shards = Vec::with_capacity(opts.channel_count);
        let mut receivers = Vec::with_capacity(opts.channel_count);
        for _ in 0..opts.channel_count {
            let (tx, rx) = mpsc::channel(opts.channel_buffer);
            shards.push(tx);
            receivers.push(rx);
        }

        Arc::new_cyclic(|weak| Self {
            opts,
            shards,
            receivers: StdMutex::new(receivers),
            writers: RwLock::new(HashMap::new()),
            retired: StdMutex::new(Vec::new()),
            shard_tasks: StdMutex::new(Vec::new()),
            cancel: CancellationToken::new(),
            started: AtomicBool::new(false),
            shut: AtomicBool::new(false),
            weak: weak.clone(),
        })
    }

    pub fn from_config(cfg: &Config) -> Arc<Self> {
        Self::new(SendOptions::from_config(cfg))
    }

    /// Queues one frame for `conn`. The optional callback reports the write
    /// outcome; the returned error covers the enqueue stage only.
    pub async fn dispatch(
        &self,
        ctx: &Context,
        conn: &Arc<dyn Connection>,
        hdr: &TcpHeader,
        payload: Bytes,
        cb: Option<SendCallback>,
    ) -> Result<(), SendError> {
        if self.shut.load(Ordering::SeqCst) {
            return Err(SendError::DispatcherClosed);
        }
        self.ensure_started();
        let idx = if self.shards.len() == 1 {
            0
        } else {
            fnv32a(conn.id().as_bytes()) as usize % self.shards.len()
        };
        let task = SendTask {
            conn: conn.clone(),
            hdr: *hdr,
            payload,
            cb,
        };
        bounded_send(
            &self.shards[idx],
            task,
            self.opts.enqueue_timeout,
            &self.cancel,
            Some(ctx),
            SendError::DispatcherClosed,
        )
        .await
        .map_err(|(_task, e)| e)
    }

    fn ensure_started(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let Some(this) = self.weak.upgrade() else {
            return;
        };
        let receivers = std::mem::take(&mut *self.receivers.lock().unwrap());
        let mut tasks = self.shard_tasks.lock().unwrap();
        for mut rx in receivers {
            let this = this.clone();
            let cancel = self.cancel.clone();
            tasks.push(tokio::spawn(async move {
                loop {
                    let task = select! {
                        _ = cancel.cancelled() => break,
                        task = rx.recv() => match task {
                            Some(task) => task,
                            None => break,
                        },
                    };
                    this.route_to_writer(task).await;
                }
            }));
        }
    }

    async fn route_to_writer(&self, task: SendTask) {
        let tx = self.writer_queue(&task.conn);
        match bounded_send(
            &tx,
            task,
            self.opts.enqueue_timeout,
            &self.cancel,
            None,
            SendError::WriterClosed,
        )
        .await
        {
            Ok(()) => {}
            Err((task, e)) => {
                if let Some(cb) = task.cb {
                    cb(Err(e));
                } else {
                    debug!("writer enqueue failed: conn={} err={e}", task.conn.id());
                }
            }
        }
    }

    fn writer_queue(&self, conn: &Arc<dyn Connection>) -> mpsc::Sender<SendTask> {
        if let Some(writer) = self.writers.read().unwrap().get(conn.id()) {
            return writer.tx.clone();
        }
        let mut writers = self.writers.write().unwrap();
        if let Some(writer) = writers.get(conn.id()) {
            return writer.tx.clone();
        }
        let (tx, rx) = mpsc::channel(self.opts.conn_buffer);
        let handle = tokio::spawn(writer_loop(conn.clone(), rx, self.cancel.clone()));
        writers.insert(conn.id().to_string(), ConnWriter { tx: tx.clone(), handle });
        tx
    }

    /// Stops and removes the writer for `conn_id`; the writer drains its
    /// queue and exits. A no-op for unknown connections.
    pub fn close_conn(&self, conn_id: &str) {
        let writer = self.writers.write().unwrap().remove(conn_id);
        if let Some(writer) = writer {
            // Dropping the sender closes the queue; the task finishes the
            // backlog and stops.
            drop(writer.tx);
            self.retired.lock().unwrap().push(writer.handle);
        }
    }

    /// Cancels the runtime, stops every writer and waits for them.
    /// Idempotent.
    pub async fn shutdown(&self) {
        if self.shut.swap(true, Ordering::SeqCst) {
            return;
        }
        self.cancel.cancel();
        let shard_tasks = std::mem::take(&mut *self.shard_tasks.lock().unwrap());
        let writers: Vec<ConnWriter> = {
            let mut map = self.writers.write().unwrap();
            map.drain().map(|(_, w)| w).collect()
        };
        let retired = std::mem::take(&mut *self.retired.lock().unwrap());
        for task in shard_tasks {
            let _ = task.await;
        }
        for writer in writers {
            drop(writer.tx);
            let _ = writer.handle.await;
        }
        for handle in retired {
            let _ = handle.await;
        }
    }

    pub fn snapshot(&self) -> (usize, usize, usize) {
        (
            self.shards.len(),
            self.opts.workers_per_channel,
            self.opts.channel_buffer,
        )
    }
}

/// Sends into a bounded queue honoring the enqueue timeout, runtime
/// shutdown and (optionally) the caller's context. On failure the task is
/// handed back so its callback survives.
async fn bounded_send(
    tx: &mpsc::Sender<SendTask>,
    task: SendTask,
    timeout: Duration,
    cancel: &CancellationToken,
    ctx: Option<&Context>,
    closed_err: SendError,
) -> Result<(), (SendTask, SendError)> {
    // Reserve first so a timeout does not consume the task (and with it the
    // caller's callback).
    let permit = if timeout.is_zero() {
        select! {
            permit = tx.reserve() => match permit {
                Ok(permit) => permit,
                Err(_) => return Err((task, closed_err)),
            },
            _ = cancel.cancelled() => return Err((task, SendError::DispatcherClosed)),
            _ = cancelled_or_pending(ctx) => return Err((task, SendError::Cancelled)),
        }
    } else {
        select! {
            permit = tx.reserve() => match permit {
                Ok(permit) => permit,
                Err(_) => return Err((task, closed_err)),
            },
            _ = tokio::time::sleep(timeout) => return Err((task, SendError::EnqueueTimeout)),
            _ = cancel.cancelled() => return Err((task, SendError::DispatcherClosed)),
            _ = cancelled_or_pending(ctx) => return Err((task, SendError::Cancelled)),
        }
    };
    permit.send(task);
    Ok(())
}

async fn cancelled_or_pending(ctx: Option<&Context>) {
    match ctx {
        Some(ctx) => ctx.cancelled().await,
        None => std::future::pending().await,
    }
}

async fn writer_loop(
    conn: Arc<dyn Connection>,
    mut rx: mpsc::Receiver<SendTask>,
    cancel: CancellationToken,
) {
    loop {
        let task = select! {
            _ = cancel.cancelled() => break,
            task = rx.recv() => match task {
                Some(task) => task,
                None => break,
            },
        };
        let res = conn
            .send_frame(&task.hdr, &task.payload)
            .await
            .map_err(SendError::Io);
        match (task.cb, res) {
            (Some(cb), res) => cb(res),
            (None, Err(e)) => warn!("write failed: conn={} err={e}", conn.id()),
            (None, Ok(())) => {}
        }
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::AtomicUsize;

    use super::*;
    use crate::testutil::MockConnection;

    #[tokio::test]
    async fn per_connection_fifo() {
        let sender = SendDispatcher::new(SendOptions {
            channel_count: 4,
            channel_buffer: 256,
            conn_buffer: 256,
            ..SendOptions::default()
        });
        let (conn, log) = MockConnection::recording("fifo");
        let ctx = Context::default();

        for i in 0..100u32 {
            let hdr = TcpHeader::new().with_msg_id(i);
            sender
                .dispatch(&ctx, &conn, &hdr, Bytes::from(format!("{i}")), None)
                .await
                .unwrap();
        }
        assert!(log.wait_len(100, Duration::from_secs(2)).await);
        for (i, (hdr, payload)) in log.frames().iter().enumerate() {
            assert_eq!(hdr.msg_id, i as u32);
            assert_eq!(payload, format!("{i}").as_bytes());
        }
        sender.shutdown().await;
    }

    #[tokio::test]
    async fn interleaved_connections_keep_their_order() {
        let sender = SendDispatcher::new(SendOptions {
            channel_count: 2,
            ..SendOptions::default()
        });
        let (conn_a, log_a) = MockConnection::recording("conn-a");
        let (conn_b, log_b) = MockConnection::recording("conn-b");
        let ctx = Context::default();

        for i in 0..20u32 {
            let hdr = TcpHeader::new().with_msg_id(i);
            sender
                .dispatch(&ctx, &conn_a, &hdr, Bytes::new(), None)
                .await
                .unwrap();
            sender
                .dispatch(&ctx, &conn_b, &hdr, Bytes::new(), None)
                .await
                .unwrap();
        }
        assert!(log_a.wait_len(20, Duration::from_secs(2)).await);
        assert!(log_b.wait_len(20, Duration::from_secs(2)).await);
        for log in [log_a, log_b] {
            for (i, (hdr, _)) in log.frames().iter().enumerate() {
                assert_eq!(hdr.msg_id, i as u32);
            }
        }
        sender.shutdown().await;
    }

    #[tokio::test]
    async fn callback_reports_success() {
        let sender = SendDispatcher::new(SendOptions::default());
        let (conn, log) = MockConnection::recording("cb");
        let hits = Arc::new(AtomicUsize::new(0));
        let hits2 = hits.clone();
        sender
            .dispatch(
                &Context::default(),
                &conn,
                &TcpHeader::new(),
                Bytes::from_static(b"x"),
                Some(Box::new(move |res| {
                    assert!(res.is_ok());
                    hits2.fetch_add(1, Ordering::SeqCst);
                })),
            )
            .await
            .unwrap();
        assert!(log.wait_len(1, Duration::from_secs(2)).await);
        // The callback runs after the socket write.
        for _ in 0..100 {
            if hits.load(Ordering::SeqCst) == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        sender.shutdown().await;
    }

    #[tokio::test]
    async fn full_pipeline_times_out() {
        let sender = SendDispatcher::new(SendOptions {
            channel_buffer: 1,
            conn_buffer: 1,
            enqueue_timeout: Duration::from_millis(50),
            ..SendOptions::default()
        });
        let (conn, _log, _gate) = MockConnection::gated("slow");
        let ctx = Context::default();

        // The writer blocks on the gate; queues behind it fill up.
        let mut timed_out = false;
        for i in 0..8u32 {
            let hdr = TcpHeader::new().with_msg_id(i);
            match sender.dispatch(&ctx, &conn, &hdr, Bytes::new(), None).await {
                Ok(()) => {}
                Err(SendError::EnqueueTimeout) => {
                    timed_out = true;
                    break;
                }
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        assert!(timed_out, "expected an enqueue timeout");
        sender.shutdown().await;
    }

    #[tokio::test]
    async fn dispatch_after_shutdown_fails() {
        let sender = SendDispatcher::new(SendOptions::default());
        let (conn, _log) = MockConnection::recording("late");
        sender.shutdown().await;
        let err = sender
            .dispatch(&Context::default(), &conn, &TcpHeader::new(), Bytes::new(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, SendError::DispatcherClosed));
    }

    #[tokio::test]
    async fn close_conn_drains_backlog() {
        let sender = SendDispatcher::new(SendOptions::default());
        let (conn, log) = MockConnection::recording("drain");
        let ctx = Context::default();
        for i in 0..10u32 {
            sender
                .dispatch(&ctx, &conn, &TcpHeader::new().with_msg_id(i), Bytes::new(), None)
                .await
                .unwrap();
        }
        sender.close_conn(conn.id());
        assert!(log.wait_len(10, Duration::from_secs(2)).await);
        // Closing twice is harmless.
        sender.close_conn(conn.id());
        sender.shutdown().await;
    }
}
