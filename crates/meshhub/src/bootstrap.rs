//! Self-registration and the raw login handshake.
//!
//! A hub (or edge node) booting without a preassigned node id dials its
//! configured parent, registers its device id through the login
//! sub-protocol and adopts the node id from the response. The same
//! [`login_exchange`] primitive is used by the parent-link supervisor to
//! log the persistent uplink in before it joins the connection manager.

use std::fmt;
use std::io;
use std::time::Duration;

use log::info;
use tokio::net::TcpStream;

use crate::handler::login::{LoginRequest, LoginResponse};
use crate::handler::SUB_PROTO_LOGIN;
use crate::wire::{self, FrameError, Major, TcpHeader};

#[derive(Debug)]
#[non_exhaustive]
pub enum RegisterError {
    /// The overall deadline expired.
    Timeout,
    /// The hub answered with a non-success code.
    Rejected { code: i32, msg: String },
    /// The reply was not a parseable login response.
    InvalidResponse,
    Frame(FrameError),
    Io(io::Error),
}

impl fmt::Display for RegisterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegisterError::Timeout => write!(f, "self register timed out"),
            RegisterError::Rejected { code, msg } => {
                write!(f, "self register rejected: code={code} msg={msg}")
            }
            RegisterError::InvalidResponse => write!(f, "invalid register response"),
            RegisterError::Frame(e) => write!(f, "register frame error: {e}"),
            RegisterError::Io(e) => write!(f, "register io error: {e}"),
        }
    }
}

impl std::error::Error for RegisterError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RegisterError::Frame(e) => Some(e),
            RegisterError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for RegisterError {
    fn from(e: io::Error) -> Self {
        RegisterError::Io(e)
    }
}

impl From<FrameError> for RegisterError {
    fn from(e: FrameError) -> Self {
        RegisterError::Frame(e)
    }
}

#[derive(Debug, Clone)]
pub struct SelfRegisterOptions {
    /// `host:port` of the parent hub.
    pub parent_addr: String,
    /// This node's device id.
    pub self_id: String,
    /// Overall deadline for the whole exchange.
    pub timeout: Duration,
    pub dial_timeout: Duration,
    /// Also perform a `login` after registering.
    pub do_login: bool,
}

impl SelfRegisterOptions {
    pub fn new(parent_addr: &str, self_id: &str) -> Self {
        Self {
            parent_addr: parent_addr.to_string(),
            self_id: self_id.to_string(),
            timeout: Duration::from_secs(10),
            dial_timeout: Duration::from_secs(5),
            do_login: false,
        }
    }
}

/// Registers against the parent and returns the assigned node id.
pub async fn self_register(opts: SelfRegisterOptions) -> Result<u32, RegisterError> {
    if opts.parent_addr.is_empty() {
        return Err(RegisterError::Io(io::Error::new(
            io::ErrorKind::InvalidInput,
            "parent address required",
        )));
    }
    if opts.self_id.is_empty() {
        return Err(RegisterError::Io(io::Error::new(
            io::ErrorKind::InvalidInput,
            "self id required",
        )));
    }
    tokio::time::timeout(opts.timeout, register_exchange(&opts))
        .await
        .map_err(|_| RegisterError::Timeout)?
}

async fn register_exchange(opts: &SelfRegisterOptions) -> Result<u32, RegisterError> {
    let mut stream = tokio::time::timeout(
        opts.dial_timeout,
        TcpStream::connect(&opts.parent_addr),
    )
    .await
    .map_err(|_| RegisterError::Timeout)??;

    let reply = login_exchange(&mut stream, "register", &opts.self_id, 0, 1).await?;
    if opts.do_login {
        login_exchange(&mut stream, "login", &opts.self_id, reply.node_id, 2).await?;
    }
    info!(
        "self register done: node_id={} self_id={}",
        reply.node_id, opts.self_id
    );
    Ok(reply.node_id)
}

/// The parsed success reply of one login-protocol exchange.
#[derive(Debug, Clone, Copy)]
pub struct HandshakeReply {
    /// Node id assigned (or confirmed) for the registering device.
    pub node_id: u32,
    /// The responding hub's own node id, taken from the reply header's
    /// source field.
    pub peer_node_id: u32,
}

/// Runs one request/response exchange of the login sub-protocol over a raw
/// stream. Used for self-registration and for the parent-link handshake
/// before the uplink joins the connection manager.
pub async fn login_exchange(
    stream: &mut TcpStream,
    action: &str,
    device_id: &str,
    source: u32,
    msg_id: u32,
) -> Result<HandshakeReply, RegisterError> {
    let req = LoginRequest {
        action: action.to_string(),
        device_id: device_id.to_string(),
        node_id: 0,
    };
    let payload = serde_json::to_vec(&req).map_err(|_| RegisterError::InvalidResponse)?;
    let hdr = TcpHeader::new()
        .with_major(Major::CMD)
        .with_sub_proto(SUB_PROTO_LOGIN)
        .with_source(source)
        .with_target(0)
        .with_msg_id(msg_id)
        .with_timestamp(wire::unix_now());
    let frame = wire::encode_frame(&hdr, &payload);
    tokio::io::AsyncWriteExt::write_all(stream, &frame).await?;

    let (resp_hdr, body) = wire::read_frame(stream).await?;
    let resp: LoginResponse =
        serde_json::from_slice(&body).map_err(|_| RegisterError::InvalidResponse)?;
    if resp.code != 1 {
        return Err(RegisterError::Rejected {
            code: resp.code,
            msg: resp.msg,
        });
    }
    Ok(HandshakeReply {
        node_id: resp.node_id,
        peer_node_id: resp_hdr.source,
    })
}
