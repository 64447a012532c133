//! Per-connection frame read loop.

use std::io;
use std::sync::Arc;

use tokio::select;
use tokio_util::sync::CancellationToken;

use crate::connection::{dispatch_receive, Connection};
use crate::wire::{self, FrameError};

/// Pulls frames off one connection's socket and feeds them to the bound
/// receive handler, in arrival order, until the connection dies or shutdown
/// is requested.
pub struct FrameReader {
    conn: Arc<dyn Connection>,
    cancel: CancellationToken,
}

impl FrameReader {
    pub fn new(conn: Arc<dyn Connection>, cancel: CancellationToken) -> Self {
        Self { conn, cancel }
    }

    /// Runs to completion. `Ok(())` means an orderly shutdown; any error is
    /// the framing or transport failure that ended the loop, for the caller
    /// to act on (typically by removing the connection).
    pub async fn run(self) -> Result<(), FrameError> {
        let Some(mut read_half) = self.conn.take_read_half() else {
            return Err(FrameError::Io(io::Error::new(
                io::ErrorKind::NotConnected,
                "no read half bound",
            )));
        };
        let closer = self.conn.closer();
        loop {
            select! {
                _ = self.cancel.cancelled() => return Ok(()),
                _ = closer.cancelled() => return Ok(()),
                res = wire::read_frame(&mut read_half) => {
                    let (hdr, payload) = res?;
                    dispatch_receive(&self.conn, hdr, payload).await;
                }
            }
        }
    }
}
