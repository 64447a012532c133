//! The receive/send processing pipeline.
//!
//! A [`Process`] is the per-server pipeline the orchestrator drives for
//! connection lifecycle and frame events. The shipped composition is a
//! [`Dispatcher`] wrapping a [`PreRoutingProcess`]: pre-routing decides
//! whether a frame is broadcast, forwarded or admitted locally, the
//! dispatcher fans admitted frames out to [`SubProcess`] handlers keyed by
//! sub-protocol number.
//!
//! [`Dispatcher`]: dispatcher::Dispatcher
//! [`PreRoutingProcess`]: prerouting::PreRoutingProcess

pub mod dispatcher;
pub mod prerouting;
pub mod send;
pub mod strategy;

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use crate::connection::Connection;
use crate::server::Context;
use crate::wire::TcpHeader;
use self::send::SendError;

/// The base processing pipeline.
#[async_trait]
pub trait Process: Send + Sync {
    /// Fired once a connection joined the manager.
    fn on_listen(&self, _conn: &Arc<dyn Connection>) {}

    /// Fired for every received frame.
    async fn on_receive(
        &self,
        ctx: &Context,
        conn: &Arc<dyn Connection>,
        hdr: &TcpHeader,
        payload: &Bytes,
    );

    /// Audit hook fired before a frame is sent; an error aborts the send.
    async fn on_send(
        &self,
        _ctx: &Context,
        _conn: &Arc<dyn Connection>,
        _hdr: &TcpHeader,
        _payload: &[u8],
    ) -> Result<(), SendError> {
        Ok(())
    }

    /// Fired after a connection was removed.
    fn on_close(&self, _conn: &Arc<dyn Connection>) {}

    /// Runs before sub-protocol dispatch. Returning `true` admits the frame
    /// to the handlers; `false` means the frame was already handled
    /// (broadcast, forwarded or dropped).
    ///
    /// The default delegates to [`Process::on_receive`] and admits.
    async fn pre_route(
        &self,
        ctx: &Context,
        conn: &Arc<dyn Connection>,
        hdr: &TcpHeader,
        payload: &Bytes,
    ) -> bool {
        self.on_receive(ctx, conn, hdr, payload).await;
        true
    }

    /// Stops any background work the process owns. Default: nothing.
    async fn shutdown(&self) {}
}

/// A sub-protocol handler, selected by the header's sub-protocol number.
#[async_trait]
pub trait SubProcess: Send + Sync {
    /// The sub-protocol this handler serves (0..=63).
    fn sub_proto(&self) -> u8;

    async fn on_receive(
        &self,
        ctx: &Context,
        conn: &Arc<dyn Connection>,
        hdr: &TcpHeader,
        payload: &Bytes,
    );

    /// One-time initialization; `false` rejects the registration.
    fn init(&self) -> bool {
        true
    }

    /// Whether CMD frames addressed elsewhere should still be observed
    /// locally after pre-routing forwarded them.
    fn accept_cmd(&self) -> bool {
        false
    }

    /// Whether frames may carry a source id that does not match the
    /// connection's `nodeID` metadata. Login-style handlers opt in; they are
    /// the only handlers that ever see `source == 0`.
    fn allow_source_mismatch(&self) -> bool {
        false
    }
}
