//! # meshhub
//!
//! A lightweight hub/edge message bus over TCP. Nodes form a tree-shaped
//! overlay: a hub accepts connections from child nodes, optionally keeps one
//! outbound connection to a parent hub, and routes length-prefixed binary
//! frames between peers. Every node carries a 32-bit node id assigned through
//! the login sub-protocol; every frame carries a fixed 32-byte header
//! ([`TcpHeader`]) followed by an opaque payload.
//!
//! The crate is organized around a handful of cooperating pieces:
//!
//! * [`wire`] — the binary frame codec (header layout, encode/decode,
//!   hop-limit handling).
//! * [`connection`] / [`manager`] — one [`Connection`] per socket, indexed by
//!   connection id, node id and device id.
//! * [`process`] — the receive pipeline: pre-routing (broadcast / forward /
//!   local admission), the sharded sub-protocol [`Dispatcher`], and the
//!   [`SendDispatcher`] that serializes outbound writes per connection.
//! * [`eventbus`] — in-process pub/sub used for connection lifecycle events.
//! * [`server`] — the [`Server`] orchestrator tying everything together,
//!   including the parent-link supervisor.
//!
//! Frames are fire-and-forget: there is no retry, no ACK protocol and no
//! persistence. Per-connection ordering is guaranteed in both directions
//! (one read loop and one writer task per socket); ordering across different
//! connections is not.
//!
//! [`Connection`]: connection::Connection
//! [`Dispatcher`]: process::dispatcher::Dispatcher
//! [`SendDispatcher`]: process::send::SendDispatcher
//! [`Server`]: server::Server
//! [`TcpHeader`]: wire::TcpHeader

pub mod bootstrap;
pub mod config;
pub mod connection;
pub mod eventbus;
pub mod handler;
pub mod listener;
pub mod manager;
pub mod permission;
pub mod process;
pub mod reader;
pub mod server;
pub mod wire;

pub use config::Config;
pub use connection::{
    Connection, MetaValue, TcpConnection, META_DEVICE_ID, META_NODE_ID, META_PERMS, META_ROLE,
    ROLE_CHILD, ROLE_LOCAL, ROLE_PARENT,
};
pub use eventbus::{Event, EventBus};
pub use listener::TcpAcceptor;
pub use manager::ConnectionManager;
pub use process::send::SendError;
pub use process::{Process, SubProcess};
pub use server::{Context, Options, Server};
pub use wire::{FrameError, Major, TcpHeader, DEFAULT_HOP_LIMIT};

#[cfg(test)]
pub(crate) mod testutil;
