//! The sub-protocol dispatcher.
//!
//! Inbound frames are spread over `N` bounded shard queues, each drained by
//! `W` workers. The shard is picked by a pluggable [`QueueStrategy`]; under
//! the default `conn` strategy all frames of one connection land on one
//! shard, so with one worker per shard handler invocations for a connection
//! are serialized.
//!
//! Enqueueing never blocks the read loop: a full shard drops the frame with
//! a warning. Handlers run inside a panic guard — one misbehaving handler
//! must not take a worker down.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock, Weak};

use async_trait::async_trait;
use bytes::Bytes;
use futures::FutureExt;
use log::{error, warn};
use tokio::select;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::{keys, Config};
use crate::connection::{Connection, META_NODE_ID};
use crate::server::Context;
use crate::wire::{Major, TcpHeader};

use super::strategy::QueueStrategy;
use super::{Process, SubProcess};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum RegisterError {
    /// Sub-protocol numbers only go up to 63.
    OutOfRange(u8),
    AlreadyRegistered(u8),
    /// The handler's `init` reported failure.
    InitFailed(u8),
}

impl fmt::Display for RegisterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegisterError::OutOfRange(sub) => write!(f, "sub proto {sub} out of range"),
            RegisterError::AlreadyRegistered(sub) => {
                write!(f, "sub proto {sub} already registered")
            }
            RegisterError::InitFailed(sub) => write!(f, "sub proto {sub} init failed"),
        }
    }
}

impl std::error::Error for RegisterError {}

pub struct DispatchOptions {
    pub channel_count: usize,
    pub workers_per_channel: usize,
    pub channel_buffer: usize,
    pub strategy: QueueStrategy,
    /// The base process consulted for `pre_route` and lifecycle events.
    pub base: Option<Arc<dyn Process>>,
}

impl Default for DispatchOptions {
    fn default() -> Self {
        Self {
            channel_count: 1,
            workers_per_channel: 1,
            channel_buffer: 64,
            strategy: QueueStrategy::ConnHash,
            base: None,
        }
    }
}

impl DispatchOptions {
    pub fn from_config(cfg: &Config, base: Option<Arc<dyn Process>>) -> Self {
        let raw_strategy = cfg.get(keys::PROC_QUEUE_STRATEGY).unwrap_or_default();
        Self {
            channel_count: cfg.get_positive(keys::PROC_CHANNEL_COUNT, 1),
            workers_per_channel: cfg.get_positive(keys::PROC_WORKERS_PER_CHAN, 1),
            channel_buffer: cfg.get_positive(keys::PROC_CHANNEL_BUFFER, 64),
            strategy: QueueStrategy::from_config(&raw_strategy),
            base,
        }
    }
}

struct DispatchEvent {
    ctx: Context,
    conn: Arc<dyn Connection>,
    hdr: TcpHeader,
    payload: Bytes,
}

pub struct Dispatcher {
    base: Option<Arc<dyn Process>>,
    handlers: RwLock<HashMap<u8, Arc<dyn SubProcess>>>,
    fallback: RwLock<Option<Arc<dyn SubProcess>>>,
    queues: Vec<mpsc::Sender<DispatchEvent>>,
    receivers: StdMutex<Vec<mpsc::Receiver<DispatchEvent>>>,
    workers_per_channel: usize,
    channel_buffer: usize,
    strategy: QueueStrategy,
    cancel: CancellationToken,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
    shut: AtomicBool,
    weak: Weak<Dispatcher>,
}

impl Dispatcher {
    pub fn new(opts: DispatchOptions) -> Arc<Self> {
        let channel_count = opts.channel_count.max(1);
        let workers = opts.workers_per_channel.max(1);
        let buffer = opts.channel_buffer.max(1);

        let mut queues = Vec::with_capacity(channel_count);
        let mut receivers = Vec::with_capacity(channel_count);
        for _ in 0..channel_count {
            let (tx, rx) = mpsc::channel(buffer);
            queues.push(tx);
            receivers.push(rx);
        }

        Arc::new_cyclic(|weak| Self {
            base: opts.base,
            handlers: RwLock::new(HashMap::new()),
            fallback: RwLock::new(None),
            queues,
            receivers: StdMutex::new(receivers),
            workers_per_channel: workers,
            channel_buffer: buffer,
            strategy: opts.strategy,
            cancel: CancellationToken::new(),
            tasks: StdMutex::new(Vec::new()),
            started: AtomicBool::new(false),
            shut: AtomicBool::new(false),
            weak: weak.clone(),
        })
    }

    pub fn from_config(cfg: &Config, base: Option<Arc<dyn Process>>) -> Arc<Self> {
        Self::new(DispatchOptions::from_config(cfg, base))
    }

    /// Registers a sub-protocol handler. Each number registers once.
    pub fn register_handler(&self, handler: Arc<dyn SubProcess>) -> Result<(), RegisterError> {
        let sub = handler.sub_proto();
        if sub > 63 {
            return Err(RegisterError::OutOfRange(sub));
        }
        if !handler.init() {
            return Err(RegisterError::InitFailed(sub));
        }
        let mut handlers = self.handlers.write().unwrap();
        if handlers.contains_key(&sub) {
            return Err(RegisterError::AlreadyRegistered(sub));
        }
        handlers.insert(sub, handler);
        Ok(())
    }

    /// Registers the handler for otherwise-unmatched sub-protocols.
    pub fn register_default_handler(&self, handler: Arc<dyn SubProcess>) {
        *self.fallback.write().unwrap() = Some(handler);
    }

    /// Current channel/worker/buffer sizing, for observation and tests.
    pub fn config_snapshot(&self) -> (usize, usize, usize) {
        (self.queues.len(), self.workers_per_channel, self.channel_buffer)
    }

    fn ensure_started(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let Some(this) = self.weak.upgrade() else {
            return;
        };
        let receivers = std::mem::take(&mut *self.receivers.lock().unwrap());
        let mut tasks = self.tasks.lock().unwrap();
        for rx in receivers {
            let rx = Arc::new(tokio::sync::Mutex::new(rx));
            for _ in 0..self.workers_per_channel {
                let rx = rx.clone();
                let this = this.clone();
                let cancel = self.cancel.clone();
                tasks.push(tokio::spawn(async move {
                    loop {
                        let evt = {
                            let mut guard = rx.lock().await;
                            select! {
                                _ = cancel.cancelled() => None,
                                evt = guard.recv() => evt,
                            }
                        };
                        let Some(evt) = evt else { break };
                        this.route(evt).await;
                    }
                }));
            }
        }
    }

    fn handler_for(&self, sub: u8) -> Option<Arc<dyn SubProcess>> {
        if let Some(h) = self.handlers.read().unwrap().get(&sub) {
            return Some(h.clone());
        }
        self.fallback.read().unwrap().clone()
    }

    async fn route(&self, evt: DispatchEvent) {
        let sub = evt.hdr.sub_proto();
        let Some(handler) = self.handler_for(sub) else {
            warn!("no handler for sub proto: sub={sub} conn={}", evt.conn.id());
            return;
        };

        if source_mismatch(handler.as_ref(), &evt.conn, &evt.hdr) {
            warn!(
                "drop frame due to source mismatch: sub={sub} conn={} hdr_source={} meta_node={}",
                evt.conn.id(),
                evt.hdr.source,
                evt.conn.node_id(),
            );
            return;
        }

        let admitted = match &self.base {
            Some(base) => {
                base.pre_route(&evt.ctx, &evt.conn, &evt.hdr, &evt.payload)
                    .await
            }
            None => true,
        };
        if admitted {
            self.call_handler(&handler, &evt).await;
            return;
        }
        // Pre-routing handled the frame. Commands still get observed locally
        // when the handler opted in.
        if evt.hdr.major() == Major::CMD && handler.accept_cmd() {
            self.call_handler(&handler, &evt).await;
        }
    }

    async fn call_handler(&self, handler: &Arc<dyn SubProcess>, evt: &DispatchEvent) {
        let fut = handler.on_receive(&evt.ctx, &evt.conn, &evt.hdr, &evt.payload);
        if let Err(panic) = std::panic::AssertUnwindSafe(fut).catch_unwind().await {
            error!(
                "handler panic: sub={} conn={} panic={}",
                handler.sub_proto(),
                evt.conn.id(),
                panic_message(&panic),
            );
        }
    }

    /// Stops the worker pool and drops queued events. Idempotent.
    pub async fn stop(&self) {
        if self.shut.swap(true, Ordering::SeqCst) {
            return;
        }
        self.cancel.cancel();
        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap());
        for task in tasks {
            let _ = task.await;
        }
    }
}

fn source_mismatch(handler: &dyn SubProcess, conn: &Arc<dyn Connection>, hdr: &TcpHeader) -> bool {
    if handler.allow_source_mismatch() {
        return false;
    }
    let meta_node = conn
        .get_meta(META_NODE_ID)
        .and_then(|v| v.as_u32())
        .unwrap_or(0);
    // No bound node id means the peer never logged in.
    if meta_node == 0 {
        return true;
    }
    hdr.source != meta_node
}

pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "<non-string panic>".to_string()
    }
}

#[async_trait]
impl Process for Dispatcher {
    fn on_listen(&self, conn: &Arc<dyn Connection>) {
        if let Some(base) = &self.base {
            base.on_listen(conn);
        }
    }

    /// Enqueues the frame for the worker pool; never blocks the caller.
    async fn on_receive(
        &self,
        ctx: &Context,
        conn: &Arc<dyn Connection>,
        hdr: &TcpHeader,
        payload: &Bytes,
    ) {
        self.ensure_started();
        let idx = self.strategy.select(Some(conn), Some(hdr), self.queues.len());
        let evt = DispatchEvent {
            ctx: ctx.clone(),
            conn: conn.clone(),
            hdr: *hdr,
            payload: payload.clone(),
        };
        match self.queues[idx].try_send(evt) {
            Ok(()) => {}
            // Runtime already shut down; nothing to do.
            Err(mpsc::error::TrySendError::Closed(_)) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                if ctx.is_cancelled() || self.cancel.is_cancelled() {
                    return;
                }
                warn!("process queue full, drop frame: queue={idx} conn={}", conn.id());
            }
        }
    }

    async fn on_send(
        &self,
        ctx: &Context,
        conn: &Arc<dyn Connection>,
        hdr: &TcpHeader,
        payload: &[u8],
    ) -> Result<(), super::send::SendError> {
        match &self.base {
            Some(base) => base.on_send(ctx, conn, hdr, payload).await,
            None => Ok(()),
        }
    }

    fn on_close(&self, conn: &Arc<dyn Connection>) {
        if let Some(base) = &self.base {
            base.on_close(conn);
        }
    }

    async fn shutdown(&self) {
        self.stop().await;
    }
}
