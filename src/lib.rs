//! # Tubemux
//!
//! Reliable and unreliable byte streams ("tubes") multiplexed over a single
//! lossy datagram connection.
//!
//! ## Features
//!
//! - **Up to 128 tubes per side**, opened by either end
//! - **Reliable tubes** with windowed retransmission and a TCP-like close
//! - **Unreliable tubes** carrying whole messages, best effort
//! - **Congestion control**: AIMD, Reno or BBR per tube
//! - **Transports**: connected UDP, or an in-memory link with loss injection
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                  Application Layer                   │
//! │            (exec, port forwarding, auth)             │
//! ├─────────────────────────────────────────────────────┤
//! │                     Tube Layer                       │
//! │   (sequencing, acks, retransmission, congestion)     │
//! ├─────────────────────────────────────────────────────┤
//! │                  Multiplexing Layer                  │
//! │        (tube IDs, open handshake, frame routing)     │
//! ├─────────────────────────────────────────────────────┤
//! │                  Transport Layer                     │
//! │               (UDP, in-memory link)                  │
//! └─────────────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod protocol;
pub mod transport;
pub mod tube;

pub use config::Config;
pub use tube::{Muxer, Role, Tube, TubeError, TubeState, TubeType};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] protocol::ProtocolError),

    #[error("Transport error: {0}")]
    Transport(#[from] transport::TransportError),

    #[error("Tube error: {0}")]
    Tube(#[from] tube::TubeError),

    #[error("Configuration error: {0}")]
    Config(String),
}
