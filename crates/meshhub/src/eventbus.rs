//! In-process pub/sub.
//!
//! Events are keyed by a normalized (lowercased, trimmed) name. Each name
//! lazily gets a bucket: a bounded channel plus a small worker pool that
//! invokes every subscribed handler for each event. Handler panics are
//! swallowed so one subscriber cannot starve the others.
//!
//! The bus carries opaque [`serde_json::Value`] payloads; the server
//! publishes `conn.closed` with `{conn_id, node_id}` whenever a connection
//! is removed.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::SystemTime;

use log::debug;
use serde_json::Value;
use tokio::select;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::{keys, Config};
use crate::server::Context;

/// One published event.
#[derive(Debug, Clone)]
pub struct Event {
    /// Normalized event name.
    pub name: String,
    pub data: Value,
    pub meta: HashMap<String, Value>,
    pub time: SystemTime,
}

/// Subscriber callback. Runs on a bucket worker (or, for
/// [`EventBus::publish_sync`], on the publisher).
pub type EventHandler = Arc<dyn Fn(&Event) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum BusError {
    Closed,
    Cancelled,
}

impl fmt::Display for BusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BusError::Closed => write!(f, "event bus closed"),
            BusError::Cancelled => write!(f, "publish cancelled"),
        }
    }
}

impl std::error::Error for BusError {}

#[derive(Debug, Clone)]
pub struct BusOptions {
    /// Channel depth per event bucket.
    pub default_buffer: usize,
    /// Workers per event bucket.
    pub default_workers: usize,
}

impl Default for BusOptions {
    fn default() -> Self {
        Self {
            default_buffer: 64,
            default_workers: 1,
        }
    }
}

impl BusOptions {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            default_buffer: cfg.get_positive(keys::BUS_DEFAULT_BUFFER, 64),
            default_workers: cfg.get_positive(keys::BUS_DEFAULT_WORKERS, 1),
        }
    }
}

struct Bucket {
    tx: mpsc::Sender<Event>,
    handlers: RwLock<HashMap<String, EventHandler>>,
    cancel: CancellationToken,
}

impl Bucket {
    fn new(opts: &BusOptions) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(opts.default_buffer.max(1));
        let bucket = Arc::new(Self {
            tx,
            handlers: RwLock::new(HashMap::new()),
            cancel: CancellationToken::new(),
        });
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        for _ in 0..opts.default_workers.max(1) {
            let bucket2 = bucket.clone();
            let rx = rx.clone();
            tokio::spawn(async move {
                loop {
                    let event = {
                        let mut guard = rx.lock().await;
                        select! {
                            _ = bucket2.cancel.cancelled() => None,
                            event = guard.recv() => event,
                        }
                    };
                    let Some(event) = event else { break };
                    bucket2.dispatch(&event);
                }
            });
        }
        bucket
    }

    /// Invokes every handler under the read lock, each inside a panic guard.
    fn dispatch(&self, event: &Event) {
        let handlers = self.handlers.read().unwrap();
        for handler in handlers.values() {
            let h = handler.clone();
            if std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| h(event))).is_err() {
                debug!("event handler panicked: event={}", event.name);
            }
        }
    }

    fn close(&self) {
        self.cancel.cancel();
    }
}

/// The bus. Cheap to share; all operations take `&self`.
pub struct EventBus {
    buckets: RwLock<HashMap<String, Arc<Bucket>>>,
    opts: BusOptions,
    closed: AtomicBool,
    counter: AtomicU64,
}

impl EventBus {
    pub fn new(opts: BusOptions) -> Arc<Self> {
        Arc::new(Self {
            buckets: RwLock::new(HashMap::new()),
            opts,
            closed: AtomicBool::new(false),
            counter: AtomicU64::new(0),
        })
    }

    /// Queues an event for asynchronous delivery, waiting for buffer space
    /// until the context cancels.
    pub async fn publish(
        &self,
        ctx: &Context,
        name: &str,
        data: Value,
        meta: HashMap<String, Value>,
    ) -> Result<(), BusError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BusError::Closed);
        }
        let key = normalize(name);
        if key.is_empty() {
            return Ok(());
        }
        let bucket = self.bucket(&key);
        let event = Event {
            name: key,
            data,
            meta,
            time: SystemTime::now(),
        };
        select! {
            res = bucket.tx.send(event) => res.map_err(|_| BusError::Closed),
            _ = ctx.cancelled() => Err(BusError::Cancelled),
        }
    }

    /// Runs all subscribed handlers synchronously on the caller.
    pub fn publish_sync(&self, name: &str, data: Value, meta: HashMap<String, Value>) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        let key = normalize(name);
        if key.is_empty() {
            return;
        }
        let bucket = self.bucket(&key);
        let event = Event {
            name: key,
            data,
            meta,
            time: SystemTime::now(),
        };
        bucket.dispatch(&event);
    }

    /// Registers a handler; the returned token unsubscribes it. `None` after
    /// close or for empty names.
    pub fn subscribe(&self, name: &str, handler: EventHandler) -> Option<String> {
        if self.closed.load(Ordering::SeqCst) {
            return None;
        }
        let key = normalize(name);
        if key.is_empty() {
            return None;
        }
        let token = format!("{key}#{}", self.counter.fetch_add(1, Ordering::SeqCst) + 1);
        let bucket = self.bucket(&key);
        bucket
            .handlers
            .write()
            .unwrap()
            .insert(token.clone(), handler);
        Some(token)
    }

    pub fn unsubscribe(&self, name: &str, token: &str) {
        let key = normalize(name);
        if key.is_empty() || token.is_empty() {
            return;
        }
        let bucket = self.buckets.read().unwrap().get(&key).cloned();
        if let Some(bucket) = bucket {
            bucket.handlers.write().unwrap().remove(token);
        }
    }

    /// Stops every bucket worker. Idempotent; all later operations are
    /// no-ops or [`BusError::Closed`].
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let buckets = std::mem::take(&mut *self.buckets.write().unwrap());
        for bucket in buckets.values() {
            bucket.close();
        }
    }

    fn bucket(&self, key: &str) -> Arc<Bucket> {
        if let Some(bucket) = self.buckets.read().unwrap().get(key) {
            return bucket.clone();
        }
        let mut buckets = self.buckets.write().unwrap();
        if let Some(bucket) = buckets.get(key) {
            return bucket.clone();
        }
        let bucket = Bucket::new(&self.opts);
        buckets.insert(key.to_string(), bucket.clone());
        bucket
    }
}

fn normalize(name: &str) -> String {
    name.trim().to_lowercase()
}
