//! Inbound TCP accept loop.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use log::{debug, info, warn};
use socket2::{SockRef, TcpKeepalive};
use tokio::net::{TcpListener, TcpStream};
use tokio::select;
use tokio_util::sync::CancellationToken;

use crate::config::{keys, Config};
use crate::connection::{Connection, TcpConnection};
use crate::manager::ConnectionManager;

#[derive(Debug, Clone)]
pub struct AcceptorOptions {
    /// Enable TCP keepalive on accepted sockets.
    pub keepalive: bool,
    pub keepalive_period: Duration,
}

impl Default for AcceptorOptions {
    fn default() -> Self {
        Self {
            keepalive: true,
            keepalive_period: Duration::from_secs(30),
        }
    }
}

impl AcceptorOptions {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            keepalive: cfg.get_bool(keys::LISTENER_KEEPALIVE, true),
            keepalive_period: cfg.get_duration_secs(keys::LISTENER_KEEPALIVE_SECS, 30),
        }
    }
}

/// Accepts inbound TCP connections, wraps them into [`TcpConnection`]s and
/// hands them to the [`ConnectionManager`].
///
/// The socket is bound eagerly in [`TcpAcceptor::bind`] so that the local
/// address (and an ephemeral port) is known before serving starts.
pub struct TcpAcceptor {
    listener: StdMutex<Option<TcpListener>>,
    local: SocketAddr,
    opts: AcceptorOptions,
}

impl TcpAcceptor {
    pub async fn bind(addr: &str) -> io::Result<Self> {
        Self::bind_with(addr, AcceptorOptions::default()).await
    }

    pub async fn bind_with(addr: &str, opts: AcceptorOptions) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local = listener.local_addr()?;
        Ok(Self {
            listener: StdMutex::new(Some(listener)),
            local,
            opts,
        })
    }

    pub fn protocol(&self) -> &'static str {
        "tcp"
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    /// Runs the accept loop until `cancel` fires or the socket dies.
    pub async fn serve(
        &self,
        cancel: CancellationToken,
        manager: Arc<ConnectionManager>,
    ) -> io::Result<()> {
        let listener = self.listener.lock().unwrap().take().ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotConnected, "listener closed or already serving")
        })?;
        info!("tcp listener started: addr={}", self.local);

        loop {
            select! {
                _ = cancel.cancelled() => {
                    info!("tcp listener stopped: addr={}", self.local);
                    return Ok(());
                }
                res = listener.accept() => match res {
                    Ok((stream, peer)) => self.accept_one(stream, peer, &manager),
                    Err(e) => {
                        warn!("accept error: {e}");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
        }
    }

    fn accept_one(&self, stream: TcpStream, peer: SocketAddr, manager: &Arc<ConnectionManager>) {
        if self.opts.keepalive {
            let ka = TcpKeepalive::new().with_time(self.opts.keepalive_period);
            if let Err(e) = SockRef::from(&stream).set_tcp_keepalive(&ka) {
                debug!("keepalive setup failed: remote={peer} err={e}");
            }
        }
        let conn = match TcpConnection::new(stream) {
            Ok(conn) => conn,
            Err(e) => {
                warn!("wrap connection failed: remote={peer} err={e}");
                return;
            }
        };
        let conn: Arc<dyn Connection> = conn;
        if let Err(e) = manager.add(conn.clone()) {
            warn!("add connection failed: remote={peer} err={e}");
            conn.close();
            return;
        }
        debug!("new connection accepted: remote={peer}");
    }

    /// Releases the bound socket if serving never started. A running accept
    /// loop is stopped through its cancellation token instead.
    pub fn close(&self) {
        self.listener.lock().unwrap().take();
    }
}
