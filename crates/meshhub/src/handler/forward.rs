//! Fallback handler for unmatched sub-protocols.
//!
//! By default unknown sub-protocols are dropped with a debug log. With
//! `routing.default_forward_enable` the frame is instead retargeted — per
//! sub-protocol via `routing.default_forward_map` (`"<sub>=<node>;..."`),
//! else to `routing.default_forward_target` — and delivered to that node's
//! connection.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use log::{debug, error, warn};

use crate::config::{keys, Config};
use crate::connection::{Connection, META_NODE_ID};
use crate::process::SubProcess;
use crate::server::{Context, Server};
use crate::wire::TcpHeader;

pub struct DefaultForwardHandler {
    forward: bool,
    /// Sub-protocol to destination node; key 0 is the catch-all target.
    sub_targets: HashMap<u8, u32>,
}

impl DefaultForwardHandler {
    pub fn from_config(cfg: &Config) -> Self {
        let mut handler = Self {
            forward: false,
            sub_targets: HashMap::new(),
        };
        handler.forward = cfg.get_bool(keys::ROUTING_DEFAULT_FORWARD_ENABLE, false);
        if let Some(raw) = cfg.get(keys::ROUTING_DEFAULT_FORWARD_TARGET) {
            if let Ok(id) = raw.trim().parse::<u32>() {
                handler.sub_targets.insert(0, id);
            }
        }
        if let Some(raw) = cfg.get(keys::ROUTING_DEFAULT_FORWARD_MAP) {
            handler.load_map(&raw);
        }
        handler
    }

    fn load_map(&mut self, raw: &str) {
        for pair in raw.split(';') {
            let pair = pair.trim();
            if pair.is_empty() {
                continue;
            }
            let Some((sub, node)) = pair.split_once('=') else { continue };
            let (Ok(sub), Ok(node)) = (sub.trim().parse::<u8>(), node.trim().parse::<u32>())
            else {
                continue;
            };
            self.sub_targets.insert(sub, node);
        }
    }

    fn resolve_target(&self, sub: u8) -> u32 {
        self.sub_targets
            .get(&sub)
            .or_else(|| self.sub_targets.get(&0))
            .copied()
            .unwrap_or(0)
    }

    async fn forward_to_node(
        &self,
        ctx: &Context,
        server: &Arc<Server>,
        hdr: &TcpHeader,
        payload: &Bytes,
    ) {
        let target = hdr.target;
        let manager = server.conn_manager();
        let mut dest = manager.get_by_node(target);
        if dest.is_none() {
            manager.range(|c| {
                if c.get_meta(META_NODE_ID).and_then(|v| v.as_u32()) == Some(target) {
                    dest = Some(c.clone());
                    return false;
                }
                true
            });
        }
        let Some(dest) = dest else {
            warn!("default target not found: target={target}");
            return;
        };
        if let Err(e) = server.send(ctx, dest.id(), hdr, payload.clone()).await {
            error!("default forward failed: target={target} err={e}");
        }
    }
}

#[async_trait]
impl SubProcess for DefaultForwardHandler {
    // Registered as the fallback; the number is never matched against.
    fn sub_proto(&self) -> u8 {
        0
    }

    async fn on_receive(
        &self,
        ctx: &Context,
        conn: &Arc<dyn Connection>,
        hdr: &TcpHeader,
        payload: &Bytes,
    ) {
        if !self.forward {
            debug!(
                "unknown subproto dropped: sub={} conn={}",
                hdr.sub_proto(),
                conn.id()
            );
            return;
        }
        let target = self.resolve_target(hdr.sub_proto());
        if target == 0 {
            debug!("no default route for subproto: sub={}", hdr.sub_proto());
            return;
        }
        let Some(server) = ctx.server() else {
            warn!("no server context, cannot forward: conn={}", conn.id());
            return;
        };
        let Some(retargeted) = hdr.clone_for_forward() else {
            warn!("hop limit exhausted on default forward: sub={}", hdr.sub_proto());
            return;
        };
        let retargeted = retargeted
            .with_target(target)
            .with_source(server.node_id());
        self.forward_to_node(ctx, server, &retargeted, payload).await;
    }

    fn allow_source_mismatch(&self) -> bool {
        false
    }
}
