//! Echo sub-protocol.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use log::info;

use crate::connection::Connection;
use crate::process::SubProcess;
use crate::server::Context;
use crate::wire::TcpHeader;

use super::{send_response, SUB_PROTO_ECHO};

/// Replies with `ECHO: <payload>`.
#[derive(Default)]
pub struct EchoHandler;

impl EchoHandler {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl SubProcess for EchoHandler {
    fn sub_proto(&self) -> u8 {
        SUB_PROTO_ECHO
    }

    async fn on_receive(
        &self,
        ctx: &Context,
        conn: &Arc<dyn Connection>,
        hdr: &TcpHeader,
        payload: &Bytes,
    ) {
        let text = String::from_utf8_lossy(payload);
        info!("echo: conn={} payload={text}", conn.id());
        let reply = format!("ECHO: {text}").into_bytes();
        send_response(ctx, conn, hdr, reply, self.sub_proto()).await;
    }
}
