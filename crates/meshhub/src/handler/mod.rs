//! Built-in sub-protocol handlers.
//!
//! Sub-protocol numbers used by the built-ins:
//!
//! * `1` — [`EchoHandler`]
//! * `2` — [`LoginHandler`] (register/login, node-id assignment)
//! * `3` — [`UpperHandler`]
//!
//! [`DefaultForwardHandler`] has no number of its own; it is registered as
//! the dispatcher fallback.
//!
//! [`EchoHandler`]: echo::EchoHandler
//! [`LoginHandler`]: login::LoginHandler
//! [`UpperHandler`]: upper::UpperHandler
//! [`DefaultForwardHandler`]: forward::DefaultForwardHandler

pub mod echo;
pub mod forward;
pub mod login;
pub mod upper;

use std::sync::Arc;

use bytes::Bytes;
use log::error;

use crate::connection::Connection;
use crate::server::Context;
use crate::wire::{self, TcpHeader};

pub const SUB_PROTO_ECHO: u8 = 1;
pub const SUB_PROTO_LOGIN: u8 = 2;
pub const SUB_PROTO_UPPER: u8 = 3;

/// Answers `req` with an `OK_RESP` frame carrying `payload`.
///
/// Prefers the server send path (audited, serialized per connection); falls
/// back to a direct socket write when no server is in context, which only
/// happens in tests.
pub(crate) async fn send_response(
    ctx: &Context,
    conn: &Arc<dyn Connection>,
    req: &TcpHeader,
    payload: Vec<u8>,
    sub: u8,
) {
    let resp = wire::build_response(req, payload.len() as u32, sub);
    match ctx.server() {
        Some(server) => {
            if let Err(e) = server.send(ctx, conn.id(), &resp, Bytes::from(payload)).await {
                error!("send response failed: conn={} err={e}", conn.id());
            }
        }
        None => {
            if let Err(e) = conn.send_frame(&resp, &payload).await {
                error!("send response failed (direct): conn={} err={e}", conn.id());
            }
        }
    }
}
