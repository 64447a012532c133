//! Login/register sub-protocol (sub-proto 2).
//!
//! Payloads are JSON: `{"action": ..., "device_id": ..., "node_id": ...}`.
//! `register` binds a device id to a freshly assigned node id; `login`
//! requires an existing binding. Both stamp the connection's
//! `nodeID`/`deviceID` metadata and the manager indices, then push an
//! `upload_msg` to the parent hub so the whole ancestry learns where the
//! device now lives. A hub receiving `upload_msg` from below points its own
//! indices at the downstream hub's uplink connection and relays further up.
//!
//! This is the one handler that must see frames whose source id is still
//! zero, so it opts out of the dispatcher's source check. It also accepts
//! CMD interception: register/login commands address `target == 0`, so
//! pre-routing marks them handled (broadcast), and only the dispatcher's
//! CMD path brings them back to this handler.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use bytes::Bytes;
use log::{error, warn};
use serde::{Deserialize, Serialize};

use crate::connection::{Connection, MetaValue, META_DEVICE_ID, META_NODE_ID, ROLE_PARENT};
use crate::process::SubProcess;
use crate::server::Context;
use crate::wire::{Major, TcpHeader};

use super::SUB_PROTO_LOGIN;

const ACTION_REGISTER: &str = "register";
const ACTION_LOGIN: &str = "login";
const ACTION_ASSIST_REGISTER: &str = "assist_register";
const ACTION_ASSIST_LOGIN: &str = "assist_login";
const ACTION_UPLOAD: &str = "upload_msg";

#[derive(Debug, Deserialize, Serialize)]
pub struct LoginRequest {
    pub action: String,
    #[serde(default)]
    pub device_id: String,
    #[serde(default)]
    pub node_id: u32,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct LoginResponse {
    pub code: i32,
    pub msg: String,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub node_id: u32,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub device_id: String,
}

fn is_zero(v: &u32) -> bool {
    *v == 0
}

/// Register/login handler and owner of the device binding table.
pub struct LoginHandler {
    next_id: AtomicU32,
    bindings: RwLock<HashMap<String, u32>>,
}

impl Default for LoginHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl LoginHandler {
    pub fn new() -> Self {
        Self {
            // Node id 1 belongs to the hub itself.
            next_id: AtomicU32::new(2),
            bindings: RwLock::new(HashMap::new()),
        }
    }

    fn ensure_binding(&self, device_id: &str) -> u32 {
        if device_id.is_empty() {
            return 0;
        }
        if let Some(id) = self.bindings.read().unwrap().get(device_id) {
            return *id;
        }
        let mut bindings = self.bindings.write().unwrap();
        if let Some(id) = bindings.get(device_id) {
            return *id;
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        bindings.insert(device_id.to_string(), id);
        id
    }

    /// Records an externally assigned binding; an existing one wins.
    fn set_binding(&self, device_id: &str, node_id: u32) -> u32 {
        if device_id.is_empty() || node_id == 0 {
            return 0;
        }
        let mut bindings = self.bindings.write().unwrap();
        if let Some(existing) = bindings.get(device_id) {
            if *existing != 0 {
                return *existing;
            }
        }
        bindings.insert(device_id.to_string(), node_id);
        node_id
    }

    fn lookup(&self, device_id: &str) -> Option<u32> {
        self.bindings.read().unwrap().get(device_id).copied()
    }

    fn attach_meta(&self, ctx: &Context, conn: &Arc<dyn Connection>, node_id: u32, device_id: &str) {
        conn.set_meta(META_NODE_ID, MetaValue::U32(node_id));
        conn.set_meta(META_DEVICE_ID, device_id.into());
        if let Some(server) = ctx.server() {
            let manager = server.conn_manager();
            manager.update_node_index(node_id, Some(conn.clone()));
            manager.update_device_index(device_id, Some(conn.clone()));
        }
    }

    async fn reply(
        &self,
        ctx: &Context,
        conn: &Arc<dyn Connection>,
        req_hdr: &TcpHeader,
        resp: LoginResponse,
    ) {
        let ok = resp.code == 1;
        let major = if ok { Major::OK_RESP } else { Major::ERR_RESP };
        let source = ctx.server().map_or(0, |s| s.node_id());
        // Target 0: the nearest hub delivers by device/connection index.
        let hdr = (*req_hdr)
            .with_major(major)
            .with_sub_proto(SUB_PROTO_LOGIN)
            .with_source(source)
            .with_target(0);
        let payload = match serde_json::to_vec(&resp) {
            Ok(payload) => payload,
            Err(e) => {
                error!("encode login response failed: {e}");
                return;
            }
        };
        match ctx.server() {
            Some(server) => {
                if let Err(e) = server.send(ctx, conn.id(), &hdr, payload.into()).await {
                    error!("send login response failed: conn={} err={e}", conn.id());
                }
            }
            None => {
                if let Err(e) = conn.send_frame(&hdr, &payload).await {
                    error!("send login response failed (direct): conn={} err={e}", conn.id());
                }
            }
        }
    }

    async fn handle_register(
        &self,
        ctx: &Context,
        conn: &Arc<dyn Connection>,
        hdr: &TcpHeader,
        device_id: &str,
    ) {
        let node_id = self.ensure_binding(device_id);
        self.attach_meta(ctx, conn, node_id, device_id);
        self.reply(
            ctx,
            conn,
            hdr,
            LoginResponse {
                code: 1,
                msg: "ok".into(),
                node_id,
                device_id: device_id.to_string(),
            },
        )
        .await;
        self.upload_to_parent(ctx, device_id, node_id, None).await;
    }

    async fn handle_login(
        &self,
        ctx: &Context,
        conn: &Arc<dyn Connection>,
        hdr: &TcpHeader,
        device_id: &str,
    ) {
        let Some(node_id) = self.lookup(device_id) else {
            self.reply(
                ctx,
                conn,
                hdr,
                LoginResponse {
                    code: 4001,
                    msg: "unregistered device".into(),
                    node_id: 0,
                    device_id: String::new(),
                },
            )
            .await;
            return;
        };
        self.attach_meta(ctx, conn, node_id, device_id);
        self.reply(
            ctx,
            conn,
            hdr,
            LoginResponse {
                code: 1,
                msg: "ok".into(),
                node_id,
                device_id: device_id.to_string(),
            },
        )
        .await;
        self.upload_to_parent(ctx, device_id, node_id, None).await;
    }

    /// A downstream hub reported a binding in its subtree: point our
    /// indices at that hub's connection and relay further up.
    async fn handle_upload(
        &self,
        ctx: &Context,
        conn: &Arc<dyn Connection>,
        device_id: &str,
        node_id: u32,
    ) {
        if device_id.is_empty() || node_id == 0 {
            warn!("invalid upload_msg: device_id={device_id} node_id={node_id}");
            return;
        }
        self.set_binding(device_id, node_id);
        let Some(server) = ctx.server() else { return };
        let manager = server.conn_manager();
        manager.update_node_index(node_id, Some(conn.clone()));
        manager.update_device_index(device_id, Some(conn.clone()));
        self.upload_to_parent(ctx, device_id, node_id, Some(conn)).await;
    }

    /// Sends `upload_msg` to the parent link, unless the information just
    /// came from there.
    async fn upload_to_parent(
        &self,
        ctx: &Context,
        device_id: &str,
        node_id: u32,
        from: Option<&Arc<dyn Connection>>,
    ) {
        if device_id.is_empty() || node_id == 0 {
            return;
        }
        let Some(server) = ctx.server() else { return };
        let Some(parent) = server.conn_manager().find_role(ROLE_PARENT) else {
            return;
        };
        if let Some(from) = from {
            if from.id() == parent.id() {
                return;
            }
        }
        let payload = match serde_json::to_vec(&LoginRequest {
            action: ACTION_UPLOAD.into(),
            device_id: device_id.to_string(),
            node_id,
        }) {
            Ok(payload) => payload,
            Err(e) => {
                error!("encode upload_msg failed: {e}");
                return;
            }
        };
        let target = parent.node_id();
        let hdr = TcpHeader::new()
            .with_major(Major::MSG)
            .with_sub_proto(SUB_PROTO_LOGIN)
            .with_source(server.node_id())
            .with_target(target);
        if let Err(e) = server.send(ctx, parent.id(), &hdr, payload.into()).await {
            warn!("send upload_msg to parent failed: device={device_id} err={e}");
        }
    }

    #[cfg(test)]
    pub(crate) fn reset(&self, start: u32) {
        self.next_id.store(start, Ordering::SeqCst);
        self.bindings.write().unwrap().clear();
    }
}

#[async_trait]
impl SubProcess for LoginHandler {
    fn sub_proto(&self) -> u8 {
        SUB_PROTO_LOGIN
    }

    async fn on_receive(
        &self,
        ctx: &Context,
        conn: &Arc<dyn Connection>,
        hdr: &TcpHeader,
        payload: &Bytes,
    ) {
        let req: LoginRequest = match serde_json::from_slice(payload) {
            Ok(req) => req,
            Err(_) => {
                self.reply(
                    ctx,
                    conn,
                    hdr,
                    LoginResponse {
                        code: 400,
                        msg: "invalid payload".into(),
                        node_id: 0,
                        device_id: String::new(),
                    },
                )
                .await;
                return;
            }
        };
        let action = req.action.trim().to_lowercase();
        if req.device_id.is_empty() {
            self.reply(
                ctx,
                conn,
                hdr,
                LoginResponse {
                    code: 400,
                    msg: "device_id required".into(),
                    node_id: 0,
                    device_id: String::new(),
                },
            )
            .await;
            return;
        }
        match action.as_str() {
            ACTION_REGISTER | ACTION_ASSIST_REGISTER => {
                self.handle_register(ctx, conn, hdr, &req.device_id).await
            }
            ACTION_LOGIN | ACTION_ASSIST_LOGIN => {
                self.handle_login(ctx, conn, hdr, &req.device_id).await
            }
            ACTION_UPLOAD => {
                self.handle_upload(ctx, conn, &req.device_id, req.node_id)
                    .await
            }
            _ => {
                self.reply(
                    ctx,
                    conn,
                    hdr,
                    LoginResponse {
                        code: 400,
                        msg: "unknown action".into(),
                        node_id: 0,
                        device_id: String::new(),
                    },
                )
                .await;
            }
        }
    }

    /// Register/login arrive as CMD frames with `target == 0`, which
    /// pre-routing treats as a downstream broadcast. Opting in here makes
    /// the dispatcher still deliver them locally after that.
    fn accept_cmd(&self) -> bool {
        true
    }

    fn allow_source_mismatch(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::testutil::MockConnection;
    use std::time::Duration;

    fn request(action: &str, device: &str) -> Bytes {
        serde_json::to_vec(&LoginRequest {
            action: action.into(),
            device_id: device.into(),
            node_id: 0,
        })
        .unwrap()
        .into()
    }

    fn parse_response(payload: &[u8]) -> LoginResponse {
        serde_json::from_slice(payload).unwrap()
    }

    #[tokio::test]
    async fn register_assigns_sequential_ids() {
        let handler = LoginHandler::new();
        let ctx = Context::default();
        let hdr = TcpHeader::new().with_sub_proto(SUB_PROTO_LOGIN);

        let (conn_a, log_a) = MockConnection::recording("a");
        handler
            .on_receive(&ctx, &conn_a, &hdr, &request("register", "dev-a"))
            .await;
        let (conn_b, log_b) = MockConnection::recording("b");
        handler
            .on_receive(&ctx, &conn_b, &hdr, &request("register", "dev-b"))
            .await;

        assert!(log_a.wait_len(1, Duration::from_secs(1)).await);
        assert!(log_b.wait_len(1, Duration::from_secs(1)).await);
        let resp_a = parse_response(&log_a.frames()[0].1);
        let resp_b = parse_response(&log_b.frames()[0].1);
        assert_eq!(resp_a.code, 1);
        assert_eq!(resp_a.node_id, 2);
        assert_eq!(resp_b.node_id, 3);
        assert_eq!(conn_a.node_id(), 2);
        assert_eq!(
            conn_a.get_meta(META_DEVICE_ID).unwrap().as_str(),
            Some("dev-a")
        );
        // Same device registers to the same id.
        assert_eq!(handler.ensure_binding("dev-a"), 2);
    }

    #[tokio::test]
    async fn login_requires_registration() {
        let handler = LoginHandler::new();
        let ctx = Context::default();
        let hdr = TcpHeader::new().with_sub_proto(SUB_PROTO_LOGIN);

        let (conn, log) = MockConnection::recording("c");
        handler
            .on_receive(&ctx, &conn, &hdr, &request("login", "ghost"))
            .await;
        assert!(log.wait_len(1, Duration::from_secs(1)).await);
        let resp = parse_response(&log.frames()[0].1);
        assert_eq!(resp.code, 4001);
        assert_eq!(log.frames()[0].0.major(), Major::ERR_RESP);

        handler.reset(2);
        handler
            .on_receive(&ctx, &conn, &hdr, &request("register", "ghost"))
            .await;
        handler
            .on_receive(&ctx, &conn, &hdr, &request("login", "ghost"))
            .await;
        assert!(log.wait_len(3, Duration::from_secs(1)).await);
        let resp = parse_response(&log.frames()[2].1);
        assert_eq!(resp.code, 1);
        assert_eq!(resp.node_id, 2);
    }

    #[tokio::test]
    async fn malformed_payloads_get_400() {
        let handler = LoginHandler::new();
        let ctx = Context::default();
        let hdr = TcpHeader::new().with_sub_proto(SUB_PROTO_LOGIN);

        let (conn, log) = MockConnection::recording("c");
        handler
            .on_receive(&ctx, &conn, &hdr, &Bytes::from_static(b"not json"))
            .await;
        handler
            .on_receive(&ctx, &conn, &hdr, &request("register", ""))
            .await;
        handler
            .on_receive(&ctx, &conn, &hdr, &request("destroy", "dev"))
            .await;

        assert!(log.wait_len(3, Duration::from_secs(1)).await);
        for (frame_hdr, payload) in log.frames() {
            assert_eq!(parse_response(&payload).code, 400);
            assert_eq!(frame_hdr.major(), Major::ERR_RESP);
        }
    }

    #[tokio::test]
    async fn register_cmd_survives_broadcast_preroute() {
        use crate::process::dispatcher::{DispatchOptions, Dispatcher};
        use crate::process::Process;

        // A base that marks every frame handled, the way pre-routing does
        // for target == 0 broadcasts.
        struct HandledBase;

        #[async_trait]
        impl Process for HandledBase {
            async fn on_receive(
                &self,
                _ctx: &Context,
                _conn: &Arc<dyn Connection>,
                _hdr: &TcpHeader,
                _payload: &Bytes,
            ) {
            }

            async fn pre_route(
                &self,
                _ctx: &Context,
                _conn: &Arc<dyn Connection>,
                _hdr: &TcpHeader,
                _payload: &Bytes,
            ) -> bool {
                false
            }
        }

        let dispatcher = Dispatcher::new(DispatchOptions {
            base: Some(Arc::new(HandledBase)),
            ..DispatchOptions::default()
        });
        dispatcher.register_handler(Arc::new(LoginHandler::new())).unwrap();

        let (conn, log) = MockConnection::recording("c");
        let hdr = TcpHeader::new()
            .with_major(Major::CMD)
            .with_sub_proto(SUB_PROTO_LOGIN)
            .with_source(0)
            .with_target(0);
        dispatcher
            .on_receive(&Context::default(), &conn, &hdr, &request("register", "dev-cmd"))
            .await;

        assert!(log.wait_len(1, Duration::from_secs(2)).await);
        let resp = parse_response(&log.frames()[0].1);
        assert_eq!(resp.code, 1);
        assert_eq!(resp.node_id, 2);
        dispatcher.stop().await;
    }

    #[test]
    fn set_binding_keeps_existing() {
        let handler = LoginHandler::new();
        assert_eq!(handler.set_binding("dev", 40), 40);
        assert_eq!(handler.set_binding("dev", 41), 40);
        assert_eq!(handler.lookup("dev"), Some(40));
        assert_eq!(handler.set_binding("", 42), 0);
        assert_eq!(handler.set_binding("other", 0), 0);
    }
}
