//! Upper-case sub-protocol.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use log::info;

use crate::connection::Connection;
use crate::process::SubProcess;
use crate::server::Context;
use crate::wire::TcpHeader;

use super::{send_response, SUB_PROTO_UPPER};

/// Replies with `UPPER(<msg_id>): <PAYLOAD>`.
#[derive(Default)]
pub struct UpperHandler;

impl UpperHandler {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl SubProcess for UpperHandler {
    fn sub_proto(&self) -> u8 {
        SUB_PROTO_UPPER
    }

    async fn on_receive(
        &self,
        ctx: &Context,
        conn: &Arc<dyn Connection>,
        hdr: &TcpHeader,
        payload: &Bytes,
    ) {
        let text = String::from_utf8_lossy(payload).to_uppercase();
        let reply = format!("UPPER({}): {text}", hdr.msg_id);
        info!("upper: conn={} resp={reply}", conn.id());
        send_response(ctx, conn, hdr, reply.into_bytes(), self.sub_proto()).await;
    }
}
