//! Queue-selection strategies.
//!
//! Maps an inbound frame to one of `n` shard queues. The default `conn`
//! strategy hashes the connection id, which keeps all frames of one
//! connection on one shard and therefore in order.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::connection::Connection;
use crate::wire::TcpHeader;

#[derive(Debug)]
pub enum QueueStrategy {
    /// FNV-32a over the connection id. Per-connection ordering.
    ConnHash,
    /// `sub_proto % n`; spreads distinct sub-protocols.
    SubProto,
    /// FNV-64a over the (source, target) pair; per-flow ordering.
    SourceTarget,
    /// Atomic round robin; no ordering guarantee.
    RoundRobin(AtomicU64),
}

impl QueueStrategy {
    /// Parses a configured strategy name; unknown input falls back to the
    /// default `conn` strategy.
    pub fn from_config(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "subproto" => QueueStrategy::SubProto,
            "source_target" => QueueStrategy::SourceTarget,
            "roundrobin" => QueueStrategy::RoundRobin(AtomicU64::new(0)),
            _ => QueueStrategy::ConnHash,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            QueueStrategy::ConnHash => "conn",
            QueueStrategy::SubProto => "subproto",
            QueueStrategy::SourceTarget => "source_target",
            QueueStrategy::RoundRobin(_) => "roundrobin",
        }
    }

    /// Picks a queue in `[0, n)`. With `n <= 1` every strategy returns 0.
    pub fn select(
        &self,
        conn: Option<&Arc<dyn Connection>>,
        hdr: Option<&TcpHeader>,
        n: usize,
    ) -> usize {
        if n <= 1 {
            return 0;
        }
        match self {
            QueueStrategy::ConnHash => match conn {
                Some(conn) => fnv32a(conn.id().as_bytes()) as usize % n,
                // No connection: degrade to the sub-protocol number.
                None => hdr.map_or(0, |h| h.sub_proto() as usize % n),
            },
            QueueStrategy::SubProto => hdr.map_or(0, |h| h.sub_proto() as usize % n),
            QueueStrategy::SourceTarget => {
                let Some(hdr) = hdr else { return 0 };
                let mut buf = [0u8; 16];
                buf[..8].copy_from_slice(&u64::from(hdr.source).to_be_bytes());
                buf[8..].copy_from_slice(&u64::from(hdr.target).to_be_bytes());
                (fnv64a(&buf) % n as u64) as usize
            }
            QueueStrategy::RoundRobin(counter) => {
                (counter.fetch_add(1, Ordering::Relaxed) % n as u64) as usize
            }
        }
    }
}

pub(crate) fn fnv32a(data: &[u8]) -> u32 {
    const OFFSET: u32 = 0x811c_9dc5;
    const PRIME: u32 = 16_777_619;
    let mut hash = OFFSET;
    for b in data {
        hash ^= u32::from(*b);
        hash = hash.wrapping_mul(PRIME);
    }
    hash
}

fn fnv64a(data: &[u8]) -> u64 {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;
    let mut hash = OFFSET;
    for b in data {
        hash ^= u64::from(*b);
        hash = hash.wrapping_mul(PRIME);
    }
    hash
}
