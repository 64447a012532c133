//! Connections and their metadata.
//!
//! A [`Connection`] wraps one socket plus a string-keyed metadata map. The
//! metadata carries everything routing needs to know about the peer: its
//! node id once logged in, its device id, and its role in the tree
//! (`parent` points up, `child` points down).
//!
//! Writes through [`Connection::send`] / [`Connection::send_frame`] go
//! straight to the socket and are serialized only by the connection's write
//! lock; production traffic must flow through the send dispatcher, which
//! owns exactly one writer task per connection. The direct path exists for
//! tests and for handshakes performed before a connection is registered.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock};

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::BoxFuture;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::wire::{self, TcpHeader};

pub const META_ROLE: &str = "role";
pub const META_NODE_ID: &str = "nodeID";
pub const META_DEVICE_ID: &str = "deviceID";
pub const META_PERMS: &str = "perms";

pub const ROLE_PARENT: &str = "parent";
pub const ROLE_CHILD: &str = "child";
pub const ROLE_LOCAL: &str = "local";

/// An opaque metadata value.
#[derive(Debug, Clone, PartialEq)]
pub enum MetaValue {
    U32(u32),
    Str(String),
    List(Vec<String>),
    Bool(bool),
}

impl MetaValue {
    pub fn as_u32(&self) -> Option<u32> {
        match self {
            MetaValue::U32(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            MetaValue::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[String]> {
        match self {
            MetaValue::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            MetaValue::Bool(b) => Some(*b),
            _ => None,
        }
    }
}

impl From<u32> for MetaValue {
    fn from(v: u32) -> Self {
        MetaValue::U32(v)
    }
}

impl From<&str> for MetaValue {
    fn from(v: &str) -> Self {
        MetaValue::Str(v.to_string())
    }
}

impl From<String> for MetaValue {
    fn from(v: String) -> Self {
        MetaValue::Str(v)
    }
}

impl From<Vec<String>> for MetaValue {
    fn from(v: Vec<String>) -> Self {
        MetaValue::List(v)
    }
}

impl From<bool> for MetaValue {
    fn from(v: bool) -> Self {
        MetaValue::Bool(v)
    }
}

/// Callback invoked for every frame pulled off a connection's socket.
pub type ReceiveHandler =
    Arc<dyn Fn(Arc<dyn Connection>, TcpHeader, Bytes) -> BoxFuture<'static, ()> + Send + Sync>;

/// One peer on the bus.
///
/// Metadata accessors are safe for concurrent callers. Exactly one receive
/// handler is bound at a time; rebinding replaces the previous one. A
/// connection is closed exactly once, no matter how many callers race on
/// [`Connection::close`].
#[async_trait]
pub trait Connection: Send + Sync {
    /// Stable identifier, `"{local}->{remote}"` for TCP.
    fn id(&self) -> &str;

    fn local_addr(&self) -> Option<SocketAddr> {
        None
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        None
    }

    fn set_meta(&self, key: &str, val: MetaValue);

    fn get_meta(&self, key: &str) -> Option<MetaValue>;

    /// A point-in-time copy of the whole metadata map.
    fn metadata(&self) -> HashMap<String, MetaValue>;

    fn set_receive_handler(&self, handler: ReceiveHandler);

    fn receive_handler(&self) -> Option<ReceiveHandler>;

    /// Writes raw bytes to the socket. Not a production send path.
    async fn send(&self, data: &[u8]) -> io::Result<()>;

    /// Encodes `hdr` + `payload` and writes the frame.
    async fn send_frame(&self, hdr: &TcpHeader, payload: &[u8]) -> io::Result<()>;

    /// Hands the read half to the frame reader. Yields `Some` exactly once.
    fn take_read_half(&self) -> Option<OwnedReadHalf> {
        None
    }

    /// Token cancelled when the connection is closed.
    fn closer(&self) -> CancellationToken;

    fn close(&self);

    /// The peer's node id from metadata, `0` while not logged in.
    fn node_id(&self) -> u32 {
        self.get_meta(META_NODE_ID)
            .and_then(|v| v.as_u32())
            .unwrap_or(0)
    }

    /// The connection's role tag, if any.
    fn role(&self) -> Option<String> {
        self.get_meta(META_ROLE)
            .and_then(|v| v.as_str().map(str::to_string))
    }
}

/// Runs the bound receive handler for one frame, on the caller's task.
pub async fn dispatch_receive(conn: &Arc<dyn Connection>, hdr: TcpHeader, payload: Bytes) {
    if let Some(handler) = conn.receive_handler() {
        handler(conn.clone(), hdr, payload).await;
    }
}

/// A [`Connection`] over a split [`TcpStream`].
pub struct TcpConnection {
    id: String,
    local: SocketAddr,
    remote: SocketAddr,
    read_half: StdMutex<Option<OwnedReadHalf>>,
    write_half: Mutex<Option<OwnedWriteHalf>>,
    meta: RwLock<HashMap<String, MetaValue>>,
    recv: RwLock<Option<ReceiveHandler>>,
    closer: CancellationToken,
    closed: AtomicBool,
}

impl TcpConnection {
    pub fn new(stream: TcpStream) -> io::Result<Arc<Self>> {
        let local = stream.local_addr()?;
        let remote = stream.peer_addr()?;
        let (read_half, write_half) = stream.into_split();
        Ok(Arc::new(Self {
            id: format!("{local}->{remote}"),
            local,
            remote,
            read_half: StdMutex::new(Some(read_half)),
            write_half: Mutex::new(Some(write_half)),
            meta: RwLock::new(HashMap::new()),
            recv: RwLock::new(None),
            closer: CancellationToken::new(),
            closed: AtomicBool::new(false),
        }))
    }
}

#[async_trait]
impl Connection for TcpConnection {
    fn id(&self) -> &str {
        &self.id
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        Some(self.local)
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        Some(self.remote)
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
        let mut guard = self.write_half.lock().await;
        let writer = guard
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "connection closed"))?;
        writer.write_all(data).await
    }

    async fn send_frame(&self, hdr: &TcpHeader, payload: &[u8]) -> io::Result<()> {
        let head = wire::encode_header(hdr, payload.len());
        let mut guard = self.write_half.lock().await;
        let writer = guard
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "connection closed"))?;
        writer.write_all(&head).await?;
        if !payload.is_empty() {
            writer.write_all(payload).await?;
        }
        Ok(())
    }

    fn take_read_half(&self) -> Option<OwnedReadHalf> {
        self.read_half.lock().unwrap().take()
    }

    fn closer(&self) -> CancellationToken {
        self.closer.clone()
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.closer.cancel();
        // Best effort eager teardown; if a writer task is mid-write the
        // halves are released when the last Arc drops.
        if let Ok(mut guard) = self.write_half.try_lock() {
            guard.take();
        }
        self.read_half.lock().unwrap().take();
    }
}
