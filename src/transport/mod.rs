//! Transport layer implementations
//!
//! The muxer runs over any message-oriented connection that hands over one
//! datagram per call:
//! - UDP, connected to a single peer
//! - An in-memory link with configurable loss, duplication and reordering

mod memory;
mod udp;

pub use memory::{pair, LinkConditions, MemoryConn};
pub use udp::UdpMsgConn;

use async_trait::async_trait;
use std::io;
use thiserror::Error;

/// Transport layer errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Connection closed")]
    Closed,

    #[error("Timeout")]
    Timeout,
}

/// A connection carrying whole datagrams
#[async_trait]
pub trait MsgConn: Send + Sync {
    /// Receive exactly one datagram into `buf`
    async fn read_msg(&self, buf: &mut [u8]) -> Result<usize, TransportError>;

    /// Send `buf` as exactly one datagram
    async fn write_msg(&self, buf: &[u8]) -> Result<(), TransportError>;

    /// Close the connection, waking any pending read
    async fn close(&self) -> Result<(), TransportError>;
}
