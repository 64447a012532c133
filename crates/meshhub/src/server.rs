//! The server orchestrator.
//!
//! A [`Server`] composes the listener, the connection manager, the
//! processing pipeline, the send dispatcher and the event bus, and owns the
//! lifecycle of all of them: it is the arena root, and every other
//! component is released when the server stops.
//!
//! Connection wiring happens through the manager hooks: `on_add` tags the
//! default role, binds the receive handler (whose [`Context`] carries the
//! server) and spawns the read loop; `on_remove` retires the connection's
//! writer, notifies the parent supervisor and publishes `conn.closed`.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use log::{debug, error, info, warn};
use serde_json::json;
use tokio::net::TcpStream;
use tokio::select;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::bootstrap;
use crate::config::{keys, Config};
use crate::connection::{
    Connection, MetaValue, TcpConnection, META_NODE_ID, META_ROLE, ROLE_CHILD, ROLE_PARENT,
};
use crate::eventbus::{BusOptions, EventBus};
use crate::listener::TcpAcceptor;
use crate::manager::{ConnectionHooks, ConnectionManager};
use crate::process::send::{SendDispatcher, SendError};
use crate::process::Process;
use crate::reader::FrameReader;
use crate::wire::TcpHeader;

use bytes::Bytes;

/// Per-call context: the shutdown token plus, for calls made on behalf of a
/// running server, a reference to that server.
///
/// Handlers receive the server through here — the explicit-argument flavor
/// of "server in context".
#[derive(Clone, Default)]
pub struct Context {
    cancel: CancellationToken,
    server: Option<Arc<Server>>,
}

impl Context {
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            server: None,
        }
    }

    pub fn with_server(cancel: CancellationToken, server: Arc<Server>) -> Self {
        Self {
            cancel,
            server: Some(server),
        }
    }

    /// A context that cancels itself after `timeout`.
    pub fn with_timeout(timeout: Duration) -> Self {
        let cancel = CancellationToken::new();
        let child = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            child.cancel();
        });
        Self {
            cancel,
            server: None,
        }
    }

    pub fn server(&self) -> Option<&Arc<Server>> {
        self.server.as_ref()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }
}

#[derive(Debug)]
#[non_exhaustive]
pub enum ServerError {
    /// A required option is missing.
    MissingOption(&'static str),
    AlreadyStarted,
    /// `stop` gave up waiting for read loops (caller context expired).
    StopTimeout,
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerError::MissingOption(what) => write!(f, "{what} required"),
            ServerError::AlreadyStarted => write!(f, "server already started"),
            ServerError::StopTimeout => write!(f, "stop timed out waiting for read loops"),
        }
    }
}

impl std::error::Error for ServerError {}

/// Server construction options. `listener`, `manager`, `process` and
/// `config` are required.
#[derive(Default)]
pub struct Options {
    pub name: String,
    pub listener: Option<Arc<TcpAcceptor>>,
    pub manager: Option<Arc<ConnectionManager>>,
    pub process: Option<Arc<dyn Process>>,
    pub config: Option<Arc<Config>>,
    /// This node's id; defaults to 1.
    pub node_id: u32,
}

/// Bounded wait for the uplink's login handshake.
const PARENT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

struct ParentLink {
    enable: bool,
    addr: String,
    reconnect: Duration,
    device_id: String,
    inner: StdMutex<ParentInner>,
}

#[derive(Default)]
struct ParentInner {
    conn_id: String,
    down: Option<CancellationToken>,
}

impl ParentLink {
    fn from_config(cfg: &Config) -> Self {
        Self {
            enable: cfg.get_bool(keys::PARENT_ENABLE, false),
            addr: cfg.get(keys::PARENT_ADDR).unwrap_or_default(),
            reconnect: cfg.get_duration_secs(keys::PARENT_RECONNECT_SEC, 3),
            device_id: cfg.get(keys::PARENT_DEVICE_ID).unwrap_or_default(),
            inner: StdMutex::new(ParentInner::default()),
        }
    }

    fn configured(&self) -> bool {
        self.enable && !self.addr.is_empty()
    }

    /// Arms the down signal for the current parent connection.
    fn set_conn(&self, id: &str) -> CancellationToken {
        let token = CancellationToken::new();
        let mut inner = self.inner.lock().unwrap();
        inner.conn_id = id.to_string();
        inner.down = Some(token.clone());
        token
    }

    /// Wakes the supervisor when the named connection was the parent.
    fn notify_down(&self, id: &str) {
        if id.is_empty() {
            return;
        }
        let mut inner = self.inner.lock().unwrap();
        if inner.conn_id == id {
            if let Some(down) = inner.down.take() {
                down.cancel();
            }
            inner.conn_id.clear();
        }
    }
}

pub struct Server {
    name: String,
    manager: Arc<ConnectionManager>,
    process: Arc<dyn Process>,
    config: Arc<Config>,
    listener: Arc<TcpAcceptor>,
    sender: Arc<SendDispatcher>,
    bus: Arc<EventBus>,
    parent: ParentLink,
    node_id: AtomicU32,
    cancel: CancellationToken,
    tracker: TaskTracker,
    started: AtomicBool,
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server").field("name", &self.name).finish_non_exhaustive()
    }
}

impl Server {
    pub fn new(opts: Options) -> Result<Arc<Self>, ServerError> {
        let listener = opts.listener.ok_or(ServerError::MissingOption("listener"))?;
        let manager = opts.manager.ok_or(ServerError::MissingOption("manager"))?;
        let process = opts.process.ok_or(ServerError::MissingOption("process"))?;
        let config = opts.config.ok_or(ServerError::MissingOption("config"))?;

        let sender = SendDispatcher::from_config(&config);
        let bus = EventBus::new(BusOptions::from_config(&config));
        let parent = ParentLink::from_config(&config);
        let node_id = if opts.node_id == 0 { 1 } else { opts.node_id };

        Ok(Arc::new(Self {
            name: opts.name,
            manager,
            process,
            config,
            listener,
            sender,
            bus,
            parent,
            node_id: AtomicU32::new(node_id),
            cancel: CancellationToken::new(),
            tracker: TaskTracker::new(),
            started: AtomicBool::new(false),
        }))
    }

    /// Wires the manager hooks and spawns the accept loop plus, when
    /// configured, the parent-link supervisor. Non-blocking.
    pub fn start(self: &Arc<Self>) -> Result<(), ServerError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(ServerError::AlreadyStarted);
        }

        let weak = Arc::downgrade(self);
        let on_add: crate::manager::Hook = {
            let weak = weak.clone();
            Arc::new(move |conn: &Arc<dyn Connection>| {
                let Some(server) = weak.upgrade() else { return };
                server.wire_connection(conn);
            })
        };
        let on_remove: crate::manager::Hook = {
            let weak = weak.clone();
            Arc::new(move |conn: &Arc<dyn Connection>| {
                let Some(server) = weak.upgrade() else { return };
                server.unwire_connection(conn);
            })
        };
        self.manager.set_hooks(ConnectionHooks {
            on_add: Some(on_add),
            on_remove: Some(on_remove),
        });

        if self.parent.configured() {
            let server = self.clone();
            tokio::spawn(async move { server.run_parent_link().await });
        }

        let server = self.clone();
        tokio::spawn(async move {
            let cancel = server.cancel.clone();
            if let Err(e) = server.listener.serve(cancel, server.manager.clone()).await {
                error!("listener exited: name={} err={e}", server.name);
                let _ = server.stop(&Context::default()).await;
            }
        });
        info!(
            "server started: name={} addr={} node_id={}",
            self.name,
            self.listener.local_addr(),
            self.node_id(),
        );
        Ok(())
    }

    fn wire_connection(self: &Arc<Self>, conn: &Arc<dyn Connection>) {
        if conn.get_meta(META_ROLE).is_none() {
            conn.set_meta(META_ROLE, MetaValue::Str(ROLE_CHILD.to_string()));
        }
        let weak = Arc::downgrade(self);
        conn.set_receive_handler(Arc::new(move |conn, hdr, payload| {
            let weak = weak.clone();
            Box::pin(async move {
                let Some(server) = weak.upgrade() else { return };
                let ctx = Context::with_server(server.cancel.clone(), server.clone());
                server.process.on_receive(&ctx, &conn, &hdr, &payload).await;
            })
        }));
        self.process.on_listen(conn);

        let server = self.clone();
        let conn = conn.clone();
        self.tracker.spawn(async move { server.serve_conn(conn).await });
    }

    async fn serve_conn(&self, conn: Arc<dyn Connection>) {
        let reader = FrameReader::new(conn.clone(), self.cancel.clone());
        match reader.run().await {
            Ok(()) => debug!("read loop done: conn={}", conn.id()),
            Err(e) if e.is_disconnect() => debug!("peer disconnected: conn={}", conn.id()),
            Err(e) => warn!("read loop exit: conn={} err={e}", conn.id()),
        }
        if let Err(e) = self.manager.remove(conn.id()) {
            debug!("remove conn: conn={} err={e}", conn.id());
        }
    }

    fn unwire_connection(self: &Arc<Self>, conn: &Arc<dyn Connection>) {
        self.sender.close_conn(conn.id());
        self.process.on_close(conn);
        self.parent.notify_down(conn.id());

        let bus = self.bus.clone();
        let ctx = Context::new(self.cancel.clone());
        let data = json!({
            "conn_id": conn.id(),
            "node_id": conn.node_id(),
        });
        tokio::spawn(async move {
            if let Err(e) = bus
                .publish(&ctx, "conn.closed", data, Default::default())
                .await
            {
                debug!("conn.closed publish failed: {e}");
            }
        });
    }

    /// Sends one frame to a connection by id, running the audit hook first.
    pub async fn send(
        &self,
        ctx: &Context,
        conn_id: &str,
        hdr: &TcpHeader,
        payload: Bytes,
    ) -> Result<(), SendError> {
        let Some(conn) = self.manager.get(conn_id) else {
            return Err(SendError::NotFound(conn_id.to_string()));
        };
        self.process.on_send(ctx, &conn, hdr, &payload).await?;
        self.sender.dispatch(ctx, &conn, hdr, payload, None).await
    }

    /// Enqueues the frame for every connection; the first enqueue error is
    /// returned. The audit hook is not repeated per connection.
    pub async fn broadcast(
        &self,
        ctx: &Context,
        hdr: &TcpHeader,
        payload: Bytes,
    ) -> Result<(), SendError> {
        let mut conns = Vec::new();
        self.manager.range(|c| {
            conns.push(c.clone());
            true
        });
        let mut first_err = None;
        for conn in conns {
            if let Err(e) = self
                .sender
                .dispatch(ctx, &conn, hdr, payload.clone(), None)
                .await
            {
                if first_err.is_none() {
                    first_err = Some(e);
                }
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Stops everything: cancels the runtime, shuts the pipeline and the
    /// send dispatcher, closes listener and bus, waits for read loops
    /// bounded by `ctx`, then closes all connections.
    pub async fn stop(&self, ctx: &Context) -> Result<(), ServerError> {
        if !self.started.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        info!("server stopping: name={}", self.name);
        self.cancel.cancel();
        self.process.shutdown().await;
        self.sender.shutdown().await;
        self.listener.close();
        self.bus.close();

        self.tracker.close();
        select! {
            _ = self.tracker.wait() => {}
            _ = ctx.cancelled() => {
                self.manager.close_all();
                return Err(ServerError::StopTimeout);
            }
        }
        self.manager.close_all();
        Ok(())
    }

    async fn run_parent_link(self: Arc<Self>) {
        let retry = self.parent.reconnect;
        loop {
            if self.cancel.is_cancelled() {
                return;
            }
            let dialed = select! {
                _ = self.cancel.cancelled() => return,
                res = TcpStream::connect(&self.parent.addr) => res,
            };
            let mut stream = match dialed {
                Ok(stream) => stream,
                Err(e) => {
                    warn!("dial parent failed: addr={} err={e}", self.parent.addr);
                    if self.sleep_or_cancel(retry).await {
                        return;
                    }
                    continue;
                }
            };
            // Log the uplink in before it joins the manager; this
            // pre-registration window is the only time the supervisor may
            // touch the raw socket. The reply carries the parent's node id,
            // which upload_msg relays are addressed to later.
            let device = self.parent_device_id();
            let hello = select! {
                _ = self.cancel.cancelled() => return,
                res = tokio::time::timeout(
                    PARENT_HANDSHAKE_TIMEOUT,
                    bootstrap::login_exchange(&mut stream, "register", &device, 0, 1),
                ) => res,
            };
            let hello = match hello {
                Ok(Ok(hello)) => hello,
                Ok(Err(e)) => {
                    warn!("parent login failed: addr={} err={e}", self.parent.addr);
                    if self.sleep_or_cancel(retry).await {
                        return;
                    }
                    continue;
                }
                Err(_) => {
                    warn!("parent login timed out: addr={}", self.parent.addr);
                    if self.sleep_or_cancel(retry).await {
                        return;
                    }
                    continue;
                }
            };
            let conn = match TcpConnection::new(stream) {
                Ok(conn) => conn,
                Err(e) => {
                    warn!("wrap parent connection failed: err={e}");
                    if self.sleep_or_cancel(retry).await {
                        return;
                    }
                    continue;
                }
            };
            conn.set_meta(META_ROLE, MetaValue::Str(ROLE_PARENT.to_string()));
            if hello.peer_node_id != 0 {
                conn.set_meta(META_NODE_ID, MetaValue::U32(hello.peer_node_id));
            }
            let conn: Arc<dyn Connection> = conn;
            // Arm the down signal before the manager can fire hooks for a
            // short-lived connection.
            let down = self.parent.set_conn(conn.id());
            if let Err(e) = self.manager.add(conn.clone()) {
                warn!("add parent connection failed: addr={} err={e}", self.parent.addr);
                self.parent.notify_down(conn.id());
                conn.close();
                if self.sleep_or_cancel(retry).await {
                    return;
                }
                continue;
            }
            info!(
                "parent connected: addr={} conn={} parent_node={}",
                self.parent.addr,
                conn.id(),
                hello.peer_node_id,
            );
            select! {
                _ = self.cancel.cancelled() => {
                    conn.close();
                    return;
                }
                _ = down.cancelled() => {
                    warn!("parent connection closed, retrying: addr={}", self.parent.addr);
                    if self.sleep_or_cancel(retry).await {
                        return;
                    }
                }
            }
        }
    }

    /// The device identity the uplink registers under: `parent.device_id`,
    /// else the server name, else a node-id derived fallback.
    fn parent_device_id(&self) -> String {
        if !self.parent.device_id.is_empty() {
            return self.parent.device_id.clone();
        }
        if !self.name.is_empty() {
            return self.name.clone();
        }
        format!("hub-{}", self.node_id())
    }

    /// Returns `true` when shutdown interrupted the sleep.
    async fn sleep_or_cancel(&self, d: Duration) -> bool {
        select! {
            _ = self.cancel.cancelled() => true,
            _ = tokio::time::sleep(d) => false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    pub fn conn_manager(&self) -> &Arc<ConnectionManager> {
        &self.manager
    }

    pub fn process(&self) -> &Arc<dyn Process> {
        &self.process
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn node_id(&self) -> u32 {
        self.node_id.load(Ordering::SeqCst)
    }

    /// Updates the local node id at runtime; zero is ignored.
    pub fn update_node_id(&self, id: u32) {
        if id == 0 {
            return;
        }
        self.node_id.store(id, Ordering::SeqCst);
    }
}
