//! Pre-routing: the decision stage ahead of sub-protocol dispatch.
//!
//! Based on the frame's target, one of four things happens:
//!
//! 1. `target == 0` — broadcast downstream: every connection except the
//!    source and any `parent`-tagged peer gets a clone of the frame.
//! 2. `target != local` and a local child matches — forward to it.
//! 3. `target != local` and nothing matches — relay to the parent link
//!    (unless the frame already came from the parent, which would loop).
//! 4. `target == local` — admit to the dispatcher's handlers.
//!
//! Every forwarded copy carries an independently decremented hop limit, so
//! a frame bouncing between misconfigured hubs dies out instead of
//! circulating forever.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use log::{debug, info, warn};

use crate::config::{keys, Config};
use crate::connection::{Connection, META_NODE_ID, ROLE_PARENT};
use crate::server::{Context, Server};
use crate::wire::TcpHeader;

use super::Process;

/// The shipped base process: routes non-local frames, admits local ones.
pub struct PreRoutingProcess {
    forward_remote: bool,
}

impl PreRoutingProcess {
    pub fn new() -> Self {
        Self {
            forward_remote: true,
        }
    }

    pub fn from_config(cfg: &Config) -> Self {
        Self {
            forward_remote: cfg.get_bool(keys::ROUTING_FORWARD_REMOTE, true),
        }
    }

    async fn broadcast(
        &self,
        ctx: &Context,
        server: &Arc<Server>,
        source: &Arc<dyn Connection>,
        hdr: &TcpHeader,
        payload: &Bytes,
    ) {
        info!(
            "broadcast downstream: from={} sub={}",
            hdr.source,
            hdr.sub_proto()
        );
        if hdr.clone_for_forward().is_none() {
            warn!("hop limit exhausted, dropping broadcast: from={}", hdr.source);
            return;
        }
        let mut peers = Vec::new();
        server.conn_manager().range(|c| {
            let is_source = c.id() == source.id();
            let is_parent = c.role().as_deref() == Some(ROLE_PARENT);
            if !is_source && !is_parent {
                peers.push(c.clone());
            }
            true
        });
        for peer in peers {
            // Each peer gets its own clone so later hops decrement
            // independently.
            let Some(fwd) = hdr.clone_for_forward() else { break };
            if let Err(e) = server.send(ctx, peer.id(), &fwd, payload.clone()).await {
                warn!("broadcast send failed: conn={} err={e}", peer.id());
            }
        }
    }

    async fn forward(
        &self,
        ctx: &Context,
        server: &Arc<Server>,
        source: &Arc<dyn Connection>,
        hdr: &TcpHeader,
        payload: &Bytes,
    ) {
        let target = hdr.target;
        info!(
            "forward: from={} to={target} sub={}",
            hdr.source,
            hdr.sub_proto()
        );
        let manager = server.conn_manager();

        let mut dest = manager.get_by_node(target);
        if dest.is_none() {
            // Index miss: fall back to a metadata scan.
            manager.range(|c| {
                let node = c.get_meta(META_NODE_ID).and_then(|v| v.as_u32());
                if node == Some(target) {
                    dest = Some(c.clone());
                    return false;
                }
                true
            });
        }
        if let Some(dest) = dest {
            let Some(fwd) = hdr.clone_for_forward() else {
                warn!("hop limit exhausted, dropping forward: to={target}");
                return;
            };
            if let Err(e) = server.send(ctx, dest.id(), &fwd, payload.clone()).await {
                warn!("forward send failed: conn={} err={e}", dest.id());
            }
            return;
        }

        // No local child. Frames from the parent must not bounce back up.
        if source.role().as_deref() == Some(ROLE_PARENT) {
            warn!("target unknown below parent, dropping: to={target}");
            return;
        }
        let Some(parent) = manager.find_role(ROLE_PARENT) else {
            warn!("target not found and no parent, dropping: to={target}");
            return;
        };
        let Some(fwd) = hdr.clone_for_forward() else {
            warn!("hop limit exhausted, dropping upstream relay: to={target}");
            return;
        };
        if let Err(e) = server.send(ctx, parent.id(), &fwd, payload.clone()).await {
            warn!("upstream relay failed: conn={} err={e}", parent.id());
        }
    }
}

impl Default for PreRoutingProcess {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Process for PreRoutingProcess {
    fn on_listen(&self, conn: &Arc<dyn Connection>) {
        info!(
            "connection up: conn={} remote={:?}",
            conn.id(),
            conn.remote_addr()
        );
    }

    async fn on_receive(
        &self,
        _ctx: &Context,
        _conn: &Arc<dyn Connection>,
        _hdr: &TcpHeader,
        _payload: &Bytes,
    ) {
    }

    fn on_close(&self, conn: &Arc<dyn Connection>) {
        info!("connection down: conn={}", conn.id());
    }

    async fn pre_route(
        &self,
        ctx: &Context,
        conn: &Arc<dyn Connection>,
        hdr: &TcpHeader,
        payload: &Bytes,
    ) -> bool {
        let Some(server) = ctx.server() else {
            warn!("no server in context, admitting frame unrouted");
            return true;
        };
        let target = hdr.target;

        if target == 0 {
            if !self.forward_remote {
                debug!("remote forwarding disabled, dropping broadcast");
                return false;
            }
            self.broadcast(ctx, server, conn, hdr, payload).await;
            return false;
        }

        if target != server.node_id() {
            if !self.forward_remote {
                debug!("remote forwarding disabled, dropping: to={target}");
                return false;
            }
            self.forward(ctx, server, conn, hdr, payload).await;
            return false;
        }

        // Local target: let the dispatcher run the sub-protocol handler.
        true
    }
}
