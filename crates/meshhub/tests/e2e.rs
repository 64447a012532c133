//! End-to-end bus tests over real sockets.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};

use meshhub::config::{keys, Config};
use meshhub::handler::echo::EchoHandler;
use meshhub::handler::forward::DefaultForwardHandler;
use meshhub::handler::login::{LoginRequest, LoginResponse};
use meshhub::handler::upper::UpperHandler;
use meshhub::handler::{login::LoginHandler, SUB_PROTO_ECHO, SUB_PROTO_LOGIN, SUB_PROTO_UPPER};
use meshhub::process::dispatcher::Dispatcher;
use meshhub::process::prerouting::PreRoutingProcess;
use meshhub::wire::{self, Major, TcpHeader};
use meshhub::{
    Connection, ConnectionManager, Context, Options, Server, TcpAcceptor, ROLE_PARENT,
};

async fn start_hub(extra: &[(&str, &str)], node_id: u32) -> (Arc<Server>, std::net::SocketAddr) {
    let cfg = Config::empty();
    for (k, v) in extra {
        cfg.set(k, v);
    }
    let config = Arc::new(cfg);

    let base = Arc::new(PreRoutingProcess::from_config(&config));
    let dispatcher = Dispatcher::from_config(&config, Some(base));
    dispatcher
        .register_handler(Arc::new(LoginHandler::new()))
        .unwrap();
    dispatcher.register_handler(Arc::new(EchoHandler::new())).unwrap();
    dispatcher.register_handler(Arc::new(UpperHandler::new())).unwrap();
    dispatcher.register_default_handler(Arc::new(DefaultForwardHandler::from_config(&config)));

    let listener = Arc::new(TcpAcceptor::bind("127.0.0.1:0").await.unwrap());
    let addr = listener.local_addr();
    let server = Server::new(Options {
        name: "hub-test".into(),
        listener: Some(listener),
        manager: Some(ConnectionManager::new()),
        process: Some(dispatcher),
        config: Some(config),
        node_id,
    })
    .unwrap();
    server.start().unwrap();
    (server, addr)
}

async fn send_frame(stream: &mut TcpStream, hdr: &TcpHeader, payload: &[u8]) {
    let frame = wire::encode_frame(hdr, payload);
    stream.write_all(&frame).await.unwrap();
}

async fn expect_frame(stream: &mut TcpStream) -> (TcpHeader, Bytes) {
    tokio::time::timeout(Duration::from_secs(3), wire::read_frame(stream))
        .await
        .expect("timed out waiting for frame")
        .expect("frame decode failed")
}

fn login_payload(action: &str, device: &str, node_id: u32) -> Vec<u8> {
    serde_json::to_vec(&LoginRequest {
        action: action.into(),
        device_id: device.into(),
        node_id,
    })
    .unwrap()
}

/// Answers a dialing hub's login handshake the way a parent hub would:
/// reads the register frame, assigns `assigned_id`, replies as node
/// `parent_node_id`.
async fn serve_parent_handshake(
    sock: &mut TcpStream,
    parent_node_id: u32,
    assigned_id: u32,
) {
    let (hdr, body) = expect_frame(sock).await;
    assert_eq!(hdr.sub_proto(), SUB_PROTO_LOGIN);
    assert_eq!(hdr.major(), Major::CMD);
    let req: LoginRequest = serde_json::from_slice(&body).unwrap();
    assert_eq!(req.action, "register");

    let resp = LoginResponse {
        code: 1,
        msg: "ok".into(),
        node_id: assigned_id,
        device_id: req.device_id,
    };
    let resp_hdr = TcpHeader::new()
        .with_major(Major::OK_RESP)
        .with_sub_proto(SUB_PROTO_LOGIN)
        .with_source(parent_node_id)
        .with_target(0)
        .with_msg_id(hdr.msg_id);
    let payload = serde_json::to_vec(&resp).unwrap();
    sock.write_all(&wire::encode_frame(&resp_hdr, &payload))
        .await
        .unwrap();
}

/// Waits until the server's parent link is registered.
async fn wait_for_parent(server: &Arc<Server>) -> Arc<dyn Connection> {
    for _ in 0..300 {
        if let Some(parent) = server.conn_manager().find_role(ROLE_PARENT) {
            return parent;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("parent link never came up");
}

/// Registers over `stream` and returns the assigned node id.
async fn register(stream: &mut TcpStream, device: &str) -> u32 {
    let hdr = TcpHeader::new()
        .with_major(Major::CMD)
        .with_sub_proto(SUB_PROTO_LOGIN)
        .with_source(0)
        .with_target(0)
        .with_msg_id(1);
    send_frame(stream, &hdr, &login_payload("register", device, 0)).await;
    let (resp_hdr, body) = expect_frame(stream).await;
    assert_eq!(resp_hdr.major(), Major::OK_RESP);
    assert_eq!(resp_hdr.sub_proto(), SUB_PROTO_LOGIN);
    let resp: LoginResponse = serde_json::from_slice(&body).unwrap();
    assert_eq!(resp.code, 1, "register failed: {}", resp.msg);
    assert!(resp.node_id >= 2);
    resp.node_id
}

#[tokio::test]
async fn register_then_echo_and_upper() {
    let (server, addr) = start_hub(&[], 1).await;
    let mut client = TcpStream::connect(addr).await.unwrap();

    let node_id = register(&mut client, "dev-1").await;

    // The hub indexed the connection under the assigned id.
    assert!(server.conn_manager().get_by_node(node_id).is_some());
    assert!(server.conn_manager().get_by_device("dev-1").is_some());

    let echo = TcpHeader::new()
        .with_major(Major::MSG)
        .with_sub_proto(SUB_PROTO_ECHO)
        .with_source(node_id)
        .with_target(1)
        .with_msg_id(7);
    send_frame(&mut client, &echo, b"ping").await;
    let (resp_hdr, body) = expect_frame(&mut client).await;
    assert_eq!(resp_hdr.major(), Major::OK_RESP);
    assert_eq!(resp_hdr.sub_proto(), SUB_PROTO_ECHO);
    assert_eq!(resp_hdr.msg_id, 7);
    assert_eq!(body.as_ref(), b"ECHO: ping");

    let upper = TcpHeader::new()
        .with_major(Major::MSG)
        .with_sub_proto(SUB_PROTO_UPPER)
        .with_source(node_id)
        .with_target(1)
        .with_msg_id(8);
    send_frame(&mut client, &upper, b"shout").await;
    let (resp_hdr, body) = expect_frame(&mut client).await;
    assert_eq!(resp_hdr.sub_proto(), SUB_PROTO_UPPER);
    assert_eq!(body.as_ref(), b"UPPER(8): SHOUT");

    server.stop(&Context::with_timeout(Duration::from_secs(5))).await.unwrap();
}

#[tokio::test]
async fn unlogged_source_is_dropped() {
    let (server, addr) = start_hub(&[], 1).await;
    let mut client = TcpStream::connect(addr).await.unwrap();

    // No registration: echo frames never reach the handler.
    let echo = TcpHeader::new()
        .with_major(Major::MSG)
        .with_sub_proto(SUB_PROTO_ECHO)
        .with_source(42)
        .with_target(1)
        .with_msg_id(1);
    send_frame(&mut client, &echo, b"anyone there").await;

    let got = tokio::time::timeout(Duration::from_millis(300), wire::read_frame(&mut client)).await;
    assert!(got.is_err(), "frame from unlogged source must be dropped");

    server.stop(&Context::with_timeout(Duration::from_secs(5))).await.unwrap();
}

#[tokio::test]
async fn unregistered_login_is_rejected() {
    let (server, addr) = start_hub(&[], 1).await;
    let mut client = TcpStream::connect(addr).await.unwrap();

    let hdr = TcpHeader::new()
        .with_major(Major::CMD)
        .with_sub_proto(SUB_PROTO_LOGIN)
        .with_source(0)
        .with_target(0)
        .with_msg_id(1);
    send_frame(&mut client, &hdr, &login_payload("login", "never-seen", 0)).await;
    let (resp_hdr, body) = expect_frame(&mut client).await;
    assert_eq!(resp_hdr.major(), Major::ERR_RESP);
    let resp: LoginResponse = serde_json::from_slice(&body).unwrap();
    assert_eq!(resp.code, 4001);

    server.stop(&Context::with_timeout(Duration::from_secs(5))).await.unwrap();
}

#[tokio::test]
async fn broadcast_reaches_other_children_only() {
    let (server, addr) = start_hub(&[], 1).await;
    let mut sender = TcpStream::connect(addr).await.unwrap();
    let sender_id = register(&mut sender, "dev-send").await;

    let mut receiver = TcpStream::connect(addr).await.unwrap();
    let _receiver_id = register(&mut receiver, "dev-recv").await;

    // The receiver's register is a CMD with target 0: it is relayed to the
    // sender (the only other child) on top of being handled locally.
    let (stray, _) = expect_frame(&mut sender).await;
    assert_eq!(stray.sub_proto(), SUB_PROTO_LOGIN);
    assert_eq!(stray.major(), Major::CMD);

    let bcast = TcpHeader::new()
        .with_major(Major::MSG)
        .with_sub_proto(SUB_PROTO_ECHO)
        .with_source(sender_id)
        .with_target(0)
        .with_msg_id(5)
        .with_hop_limit(4);
    send_frame(&mut sender, &bcast, b"hello all").await;

    let (got_hdr, got_body) = expect_frame(&mut receiver).await;
    assert_eq!(got_body.as_ref(), b"hello all");
    assert_eq!(got_hdr.source, sender_id);
    assert_eq!(got_hdr.target, 0);
    assert_eq!(got_hdr.hop_limit, 3);

    // The sender must not see its own broadcast (nor an echo response).
    let nothing =
        tokio::time::timeout(Duration::from_millis(300), wire::read_frame(&mut sender)).await;
    assert!(nothing.is_err());

    server.stop(&Context::with_timeout(Duration::from_secs(5))).await.unwrap();
}

#[tokio::test]
async fn unknown_target_relays_to_parent() {
    // A raw socket stands in for the parent hub.
    let parent_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let parent_addr = parent_listener.local_addr().unwrap();

    let (server, addr) = start_hub(
        &[
            (keys::PARENT_ENABLE, "true"),
            (keys::PARENT_ADDR, &parent_addr.to_string()),
            (keys::PARENT_RECONNECT_SEC, "1"),
        ],
        1,
    )
    .await;

    let (mut parent_sock, _) = parent_listener.accept().await.unwrap();
    serve_parent_handshake(&mut parent_sock, 42, 60).await;
    let uplink = wait_for_parent(&server).await;
    // The supervisor stamped the uplink with the parent's node id.
    assert_eq!(uplink.node_id(), 42);

    let mut client = TcpStream::connect(addr).await.unwrap();
    let client_id = register(&mut client, "dev-c").await;

    // Registration pushed an upload_msg up the tree, addressed to the
    // parent's node id.
    let (up_hdr, up_body) = expect_frame(&mut parent_sock).await;
    assert_eq!(up_hdr.sub_proto(), SUB_PROTO_LOGIN);
    assert_eq!(up_hdr.target, 42);
    let upload: LoginRequest = serde_json::from_slice(&up_body).unwrap();
    assert_eq!(upload.action, "upload_msg");
    assert_eq!(upload.device_id, "dev-c");
    assert_eq!(upload.node_id, client_id);

    // A frame for an unknown node travels to the parent link.
    let remote = TcpHeader::new()
        .with_major(Major::MSG)
        .with_sub_proto(SUB_PROTO_ECHO)
        .with_source(client_id)
        .with_target(99)
        .with_msg_id(3);
    send_frame(&mut client, &remote, b"upstream").await;
    let (fwd_hdr, fwd_body) = expect_frame(&mut parent_sock).await;
    assert_eq!(fwd_hdr.target, 99);
    assert_eq!(fwd_hdr.source, client_id);
    assert_eq!(fwd_body.as_ref(), b"upstream");

    server.stop(&Context::with_timeout(Duration::from_secs(5))).await.unwrap();
}

#[tokio::test]
async fn parent_link_reconnects_after_drop() {
    let parent_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let parent_addr = parent_listener.local_addr().unwrap();

    let (server, _addr) = start_hub(
        &[
            (keys::PARENT_ENABLE, "true"),
            (keys::PARENT_ADDR, &parent_addr.to_string()),
            (keys::PARENT_RECONNECT_SEC, "1"),
        ],
        1,
    )
    .await;

    let (first, _) = parent_listener.accept().await.unwrap();
    drop(first);

    // The supervisor redials after the reconnect delay.
    let second = tokio::time::timeout(Duration::from_secs(5), parent_listener.accept())
        .await
        .expect("parent link did not reconnect");
    assert!(second.is_ok());

    server.stop(&Context::with_timeout(Duration::from_secs(5))).await.unwrap();
}

#[tokio::test]
async fn upload_msg_points_index_at_downstream_hub() {
    let (server, addr) = start_hub(&[], 1).await;

    // A raw socket plays the downstream hub proxying its subtree.
    let mut downstream = TcpStream::connect(addr).await.unwrap();
    let hub_id = register(&mut downstream, "hub-below").await;

    let upload = TcpHeader::new()
        .with_major(Major::MSG)
        .with_sub_proto(SUB_PROTO_LOGIN)
        .with_source(hub_id)
        .with_target(1)
        .with_msg_id(2);
    send_frame(
        &mut downstream,
        &upload,
        &login_payload("upload_msg", "dev-deep", 77),
    )
    .await;

    // The index follows the subtree: node 77 now resolves to the
    // downstream hub's uplink connection.
    for _ in 0..100 {
        if server.conn_manager().get_by_node(77).is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let via = server.conn_manager().get_by_node(77).expect("index missing");
    assert_eq!(via.node_id(), hub_id);

    // Frames for the proxied node are forwarded down that connection.
    let mut other = TcpStream::connect(addr).await.unwrap();
    let other_id = register(&mut other, "dev-other").await;
    // other's register CMD was relayed down to the downstream hub; skip it.
    let (stray, _) = expect_frame(&mut downstream).await;
    assert_eq!(stray.sub_proto(), SUB_PROTO_LOGIN);
    assert_eq!(stray.major(), Major::CMD);
    let to_deep = TcpHeader::new()
        .with_major(Major::MSG)
        .with_sub_proto(SUB_PROTO_ECHO)
        .with_source(other_id)
        .with_target(77)
        .with_msg_id(9);
    send_frame(&mut other, &to_deep, b"dig").await;

    let (fwd_hdr, fwd_body) = expect_frame(&mut downstream).await;
    assert_eq!(fwd_hdr.target, 77);
    assert_eq!(fwd_body.as_ref(), b"dig");

    server.stop(&Context::with_timeout(Duration::from_secs(5))).await.unwrap();
}

#[tokio::test]
async fn child_hub_uploads_through_real_parent() {
    // Parent hub.
    let (parent, parent_addr) = start_hub(&[], 1).await;

    // Child hub with a real parent link.
    let (child, child_addr) = start_hub(
        &[
            (keys::PARENT_ENABLE, "yes"),
            (keys::PARENT_ADDR, &parent_addr.to_string()),
            (keys::PARENT_RECONNECT_SEC, "1"),
        ],
        5,
    )
    .await;

    // The supervisor logs in to the parent on its own and learns the
    // parent's node id from the reply.
    let uplink = wait_for_parent(&child).await;
    assert_eq!(uplink.node_id(), 1);

    // An edge device registers against the child hub.
    let mut edge = TcpStream::connect(child_addr).await.unwrap();
    let edge_id = register(&mut edge, "edge-device").await;

    // The child relayed the binding upward; the parent's index now points
    // at the child hub's uplink connection.
    for _ in 0..300 {
        if parent.conn_manager().get_by_node(edge_id).is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let uplink = parent
        .conn_manager()
        .get_by_node(edge_id)
        .expect("parent never learned the edge binding");
    assert_eq!(uplink.role().as_deref(), Some("child"));
    assert!(parent.conn_manager().get_by_device("edge-device").is_some());

    child.stop(&Context::with_timeout(Duration::from_secs(5))).await.unwrap();
    parent.stop(&Context::with_timeout(Duration::from_secs(5))).await.unwrap();
}

#[tokio::test]
async fn self_register_bootstraps_node_id() {
    let (server, addr) = start_hub(&[], 1).await;

    let mut opts = meshhub::bootstrap::SelfRegisterOptions::new(&addr.to_string(), "boot-dev");
    opts.do_login = true;
    let node_id = meshhub::bootstrap::self_register(opts).await.unwrap();
    assert!(node_id >= 2);

    server.stop(&Context::with_timeout(Duration::from_secs(5))).await.unwrap();
}

#[tokio::test]
async fn conn_closed_event_fires() {
    let (server, addr) = start_hub(&[], 1).await;

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    server
        .event_bus()
        .subscribe(
            "conn.closed",
            Arc::new(move |ev| {
                let _ = tx.send(ev.data.clone());
            }),
        )
        .unwrap();

    let client = TcpStream::connect(addr).await.unwrap();
    // Let the hub register the connection, then drop it.
    tokio::time::sleep(Duration::from_millis(100)).await;
    drop(client);

    let data = tokio::time::timeout(Duration::from_secs(3), rx.recv())
        .await
        .expect("no conn.closed event")
        .unwrap();
    assert!(data["conn_id"].as_str().is_some());
    let _ = data; // node_id is 0 for a never-logged-in peer

    server.stop(&Context::with_timeout(Duration::from_secs(5))).await.unwrap();
}

#[tokio::test]
async fn extended_header_frames_are_served() {
    let (server, addr) = start_hub(&[], 1).await;
    let mut client = TcpStream::connect(addr).await.unwrap();
    let node_id = register(&mut client, "dev-ext").await;

    // Hand-build an extended (40-byte) header around an echo request.
    let hdr = TcpHeader::new()
        .with_major(Major::MSG)
        .with_sub_proto(SUB_PROTO_ECHO)
        .with_source(node_id)
        .with_target(1)
        .with_msg_id(11);
    let encoded = wire::encode_frame(&hdr, b"ext");
    let mut frame = Vec::new();
    frame.extend_from_slice(&encoded[..32]);
    frame[3] = 40;
    frame.extend_from_slice(&[0xAB; 8]);
    frame.extend_from_slice(&encoded[32..]);
    client.write_all(&frame).await.unwrap();

    let (resp_hdr, body) = expect_frame(&mut client).await;
    assert_eq!(resp_hdr.msg_id, 11);
    assert_eq!(body.as_ref(), b"ECHO: ext");

    server.stop(&Context::with_timeout(Duration::from_secs(5))).await.unwrap();
}

#[tokio::test]
async fn garbage_frame_closes_connection() {
    let (server, addr) = start_hub(&[], 1).await;
    let mut client = TcpStream::connect(addr).await.unwrap();
    client.write_all(&[0xFF; 64]).await.unwrap();

    // The hub drops the connection on a framing error; our next read sees
    // EOF.
    let mut buf = [0u8; 1];
    let n = tokio::time::timeout(Duration::from_secs(3), async {
        use tokio::io::AsyncReadExt;
        client.read(&mut buf).await
    })
    .await
    .expect("connection was not closed")
    .unwrap();
    assert_eq!(n, 0);

    server.stop(&Context::with_timeout(Duration::from_secs(5))).await.unwrap();
}
