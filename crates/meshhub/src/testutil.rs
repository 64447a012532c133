//! Shared test doubles.

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Notify, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::connection::{Connection, MetaValue, ReceiveHandler};
use crate::wire::TcpHeader;

/// Frames written through a mock connection, in write order.
#[derive(Default)]
pub struct SendLog {
    frames: StdMutex<Vec<(TcpHeader, Vec<u8>)>>,
    notify: Notify,
}

impl SendLog {
    pub fn push(&self, hdr: TcpHeader, payload: Vec<u8>) {
        self.frames.lock().unwrap().push((hdr, payload));
        self.notify.notify_waiters();
    }

    pub fn frames(&self) -> Vec<(TcpHeader, Vec<u8>)> {
        self.frames.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.frames.lock().unwrap().len()
    }

    /// Waits until at least `n` frames were recorded.
    pub async fn wait_len(&self, n: usize, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.len() >= n {
                return true;
            }
            let wait = self.notify.notified();
            if tokio::time::timeout_at(deadline, wait).await.is_err() {
                return self.len() >= n;
            }
        }
    }
}

pub struct MockConnection {
    id: String,
    meta: RwLock<HashMap<String, MetaValue>>,
    recv: RwLock<Option<ReceiveHandler>>,
    log: Arc<SendLog>,
    gate: Option<Arc<Semaphore>>,
    closer: CancellationToken,
    closed: AtomicBool,
}

impl MockConnection {
    pub fn new(id: &str) -> Arc<dyn Connection> {
        Self::recording(id).0
    }

    pub fn recording(id: &str) -> (Arc<dyn Connection>, Arc<SendLog>) {
        let log = Arc::new(SendLog::default());
        let conn = Arc::new(Self {
            id: id.to_string(),
            meta: RwLock::new(HashMap::new()),
            recv: RwLock::new(None),
            log: log.clone(),
            gate: None,
            closer: CancellationToken::new(),
            closed: AtomicBool::new(false),
        });
        (conn, log)
    }

    /// A connection whose writes block until the returned semaphore hands
    /// out a permit. Used to exercise backpressure paths.
    pub fn gated(id: &str) -> (Arc<dyn Connection>, Arc<SendLog>, Arc<Semaphore>) {
        let log = Arc::new(SendLog::default());
        let gate = Arc::new(Semaphore::new(0));
        let conn = Arc::new(Self {
            id: id.to_string(),
            meta: RwLock::new(HashMap::new()),
            recv: RwLock::new(None),
            log: log.clone(),
            gate: Some(gate.clone()),
            closer: CancellationToken::new(),
            closed: AtomicBool::new(false),
        });
        (conn, log, gate)
    }
}

#[async_trait]
impl Connection for MockConnection {
    fn id(&self) -> &str {
        &self.id
    }

    fn set_meta(&self, key: &str, val: MetaValue) {
        self.meta.write().unwrap().insert(key.to_string(), val);
    }

    fn get_meta(&self, key: &str) -> Option<MetaValue> {
        self.meta.read().unwrap().get(key).cloned()
    }

    fn metadata(&self) -> HashMap<String, MetaValue> {
        self.meta.read().unwrap().clone()
    }

    fn set_receive_handler(&self, handler: ReceiveHandler) {
        *self.recv.write().unwrap() = Some(handler);
    }

    fn receive_handler(&self) -> Option<ReceiveHandler> {
        self.recv.read().unwrap().clone()
    }

    async fn send(&self, data: &[u8]) -> io::Result<()> {
        self.log.push(TcpHeader::new(), data.to_vec());
        Ok(())
    }

    async fn send_frame(&self, hdr: &TcpHeader, payload: &[u8]) -> io::Result<()> {
        if let Some(gate) = &self.gate {
            let permit = gate
                .acquire()
                .await
                .map_err(|_| io::Error::new(io::ErrorKind::NotConnected, "gate closed"))?;
            permit.forget();
        }
        self.log.push(*hdr, payload.to_vec());
        Ok(())
    }

    fn closer(&self) -> CancellationToken {
        self.closer.clone()
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.closer.cancel();
    }
}
