//! A minimal edge node: registers against a hub, then sends an echo
//! request every couple of seconds and prints whatever comes back.
//!
//! Usage: `edge <hub-addr> <device-id>`

use std::io;
use std::time::Duration;

use log::{info, warn};
use tokio::net::TcpStream;

use meshhub::bootstrap::{self, SelfRegisterOptions};
use meshhub::handler::SUB_PROTO_ECHO;
use meshhub::wire::{self, Major, TcpHeader};

#[tokio::main]
async fn main() -> io::Result<()> {
    env_logger::init();

    let mut args = std::env::args().skip(1);
    let addr = args.next().unwrap_or_else(|| "127.0.0.1:9000".to_string());
    let device = args.next().unwrap_or_else(|| "edge-demo".to_string());

    let node_id = bootstrap::self_register(SelfRegisterOptions::new(&addr, &device))
        .await
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
    info!("registered as node {node_id}");

    let mut stream = TcpStream::connect(&addr).await?;
    login(&mut stream, &device, node_id).await?;

    let mut msg_id = 0u32;
    loop {
        msg_id += 1;
        let hdr = TcpHeader::new()
            .with_major(Major::MSG)
            .with_sub_proto(SUB_PROTO_ECHO)
            .with_source(node_id)
            .with_target(1)
            .with_msg_id(msg_id)
            .with_timestamp(wire::unix_now());
        let frame = wire::encode_frame(&hdr, format!("hello #{msg_id}").as_bytes());
        tokio::io::AsyncWriteExt::write_all(&mut stream, &frame).await?;

        match wire::read_frame(&mut stream).await {
            Ok((resp, payload)) => info!(
                "reply msg_id={} sub={}: {}",
                resp.msg_id,
                resp.sub_proto(),
                String::from_utf8_lossy(&payload)
            ),
            Err(e) => {
                warn!("read failed: {e}");
                return Ok(());
            }
        }
        tokio::time::sleep(Duration::from_secs(2)).await;
    }
}

/// Logs the persistent connection in so the hub binds our node id to it.
async fn login(stream: &mut TcpStream, device: &str, node_id: u32) -> io::Result<()> {
    let payload = format!(r#"{{"action":"login","device_id":"{device}"}}"#);
    let hdr = TcpHeader::new()
        .with_major(Major::CMD)
        .with_sub_proto(meshhub::handler::SUB_PROTO_LOGIN)
        .with_source(node_id)
        .with_target(0)
        .with_msg_id(1);
    let frame = wire::encode_frame(&hdr, payload.as_bytes());
    tokio::io::AsyncWriteExt::write_all(stream, &frame).await?;
    let (resp, body) = wire::read_frame(stream)
        .await
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
    info!(
        "login reply major={:?}: {}",
        resp.major(),
        String::from_utf8_lossy(&body)
    );
    Ok(())
}
