//! Tube layer - multiplexed streams over one datagram connection
//!
//! Provides:
//! - Frame encoding/decoding
//! - Reliable tubes (ordering, retransmission, congestion control)
//! - Unreliable message tubes
//! - The muxer that owns the connection and routes frames to tubes

mod bbr;
mod congestion;
mod deadline;
mod frame;
mod muxer;
mod receiver;
mod reliable;
mod sender;
mod seq;
mod state;
mod unreliable;

pub use bbr::{BbrPhase, BbrProbe};
pub use congestion::{
    AckSample, AimdProbe, Congestion, CongestionAlgorithm, CongestionControl, LossPhase,
    RenoProbe,
};
pub use deadline::Deadline;
pub use frame::{Flags, Frame, InitiateFrame, Packet};
pub use muxer::{Muxer, Role};
pub use receiver::{Delivery, Receiver};
pub use reliable::ReliableTube;
pub use sender::{AckOutcome, Sender, Transmit};
pub use state::TubeState;
pub use unreliable::UnreliableTube;

use crate::protocol::ProtocolError;
use std::fmt;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::Instant;

/// Tube layer errors
#[derive(Debug, Error)]
pub enum TubeError {
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("No free tube IDs")]
    OutOfTubes,

    #[error("Muxer stopped")]
    MuxerStopped,

    #[error("Deadline exceeded")]
    DeadlineExceeded,

    #[error("End of stream")]
    EndOfStream,

    #[error("Message too large for one frame")]
    MessageTooLarge,

    #[error("Buffer too small for message")]
    MessageTruncated,
}

/// Application-defined tube type tag
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct TubeType(pub u8);

impl TubeType {
    /// Remote command execution
    pub const EXEC: TubeType = TubeType(1);
    /// Authorization grant delegation
    pub const AUTH_GRANT: TubeType = TubeType(2);
    /// Network proxying
    pub const NET_PROXY: TubeType = TubeType(3);
    /// User authentication
    pub const USER_AUTH: TubeType = TubeType(4);
    /// Local port forwarding
    pub const LOCAL_PF: TubeType = TubeType(5);
    /// Remote port forwarding
    pub const REMOTE_PF: TubeType = TubeType(6);

    fn name(self) -> Option<&'static str> {
        Some(match self {
            TubeType::EXEC => "exec",
            TubeType::AUTH_GRANT => "auth-grant",
            TubeType::NET_PROXY => "net-proxy",
            TubeType::USER_AUTH => "user-auth",
            TubeType::LOCAL_PF => "local-pf",
            TubeType::REMOTE_PF => "remote-pf",
            _ => return None,
        })
    }
}

impl fmt::Debug for TubeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "TubeType({})", name),
            None => write!(f, "TubeType({})", self.0),
        }
    }
}

/// Which side sent the open request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opener {
    Local,
    Peer,
}

/// A tube handed out by the muxer
#[derive(Clone)]
pub enum Tube {
    Reliable(ReliableTube),
    Unreliable(UnreliableTube),
}

impl Tube {
    /// Read bytes (reliable) or one message (unreliable). `Ok(0)` means end
    /// of stream.
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize, TubeError> {
        match self {
            Tube::Reliable(t) => t.read(buf).await,
            Tube::Unreliable(t) => t.read(buf).await,
        }
    }

    pub async fn write(&self, buf: &[u8]) -> Result<usize, TubeError> {
        match self {
            Tube::Reliable(t) => t.write(buf).await,
            Tube::Unreliable(t) => t.write(buf).await,
        }
    }

    /// Write the whole buffer
    pub async fn write_all(&self, buf: &[u8]) -> Result<(), TubeError> {
        match self {
            Tube::Reliable(t) => t.write(buf).await.map(|_| ()),
            Tube::Unreliable(t) => {
                for chunk in buf.chunks(t.max_message()) {
                    t.write(chunk).await?;
                }
                Ok(())
            }
        }
    }

    pub async fn close(&self) -> Result<(), TubeError> {
        match self {
            Tube::Reliable(t) => t.close().await,
            Tube::Unreliable(t) => t.close().await,
        }
    }

    pub fn id(&self) -> u8 {
        match self {
            Tube::Reliable(t) => t.id(),
            Tube::Unreliable(t) => t.id(),
        }
    }

    pub fn tube_type(&self) -> TubeType {
        match self {
            Tube::Reliable(t) => t.tube_type(),
            Tube::Unreliable(t) => t.tube_type(),
        }
    }

    pub fn is_reliable(&self) -> bool {
        matches!(self, Tube::Reliable(_))
    }

    pub fn state(&self) -> TubeState {
        match self {
            Tube::Reliable(t) => t.state(),
            Tube::Unreliable(t) => t.state(),
        }
    }

    /// Set both read and write deadlines
    pub fn set_deadline(&self, at: Option<Instant>) {
        self.set_read_deadline(at);
        self.set_write_deadline(at);
    }

    pub fn set_read_deadline(&self, at: Option<Instant>) {
        match self {
            Tube::Reliable(t) => t.set_read_deadline(at),
            Tube::Unreliable(t) => t.set_read_deadline(at),
        }
    }

    pub fn set_write_deadline(&self, at: Option<Instant>) {
        match self {
            Tube::Reliable(t) => t.set_write_deadline(at),
            Tube::Unreliable(t) => t.set_write_deadline(at),
        }
    }

    pub(crate) async fn receive(&self, frame: Frame) -> Result<(), TubeError> {
        match self {
            Tube::Reliable(t) => t.receive(frame).await,
            Tube::Unreliable(t) => t.receive(frame).await,
        }
    }

    pub(crate) async fn receive_initiate(&self, frame: InitiateFrame) -> Result<(), TubeError> {
        match self {
            Tube::Reliable(t) => t.receive_initiate(frame).await,
            Tube::Unreliable(t) => t.receive_initiate(frame).await,
        }
    }

    pub(crate) fn start_initiate(&self) {
        match self {
            Tube::Reliable(t) => t.start_initiate(),
            Tube::Unreliable(t) => t.start_initiate(),
        }
    }

    pub(crate) async fn wait_initiated(&self) -> Result<(), TubeError> {
        match self {
            Tube::Reliable(t) => t.wait_initiated().await,
            Tube::Unreliable(t) => t.wait_initiated().await,
        }
    }

    pub(crate) async fn force_close(&self) {
        match self {
            Tube::Reliable(t) => t.force_close().await,
            Tube::Unreliable(t) => t.force_close().await,
        }
    }

    pub(crate) fn state_watch(&self) -> watch::Receiver<TubeState> {
        match self {
            Tube::Reliable(t) => t.state_watch(),
            Tube::Unreliable(t) => t.state_watch(),
        }
    }

    /// Both handles refer to the same tube
    pub(crate) fn same(&self, other: &Tube) -> bool {
        match (self, other) {
            (Tube::Reliable(a), Tube::Reliable(b)) => a.same(b),
            (Tube::Unreliable(a), Tube::Unreliable(b)) => a.same(b),
            _ => false,
        }
    }
}

impl fmt::Debug for Tube {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tube")
            .field("id", &self.id())
            .field("type", &self.tube_type())
            .field("reliable", &self.is_reliable())
            .field("state", &self.state())
            .finish()
    }
}

/// Wait until the watched state satisfies `pred`. `None` if the tube is gone.
pub(crate) async fn wait_state(
    rx: &mut watch::Receiver<TubeState>,
    pred: impl Fn(TubeState) -> bool,
) -> Option<TubeState> {
    loop {
        let state = *rx.borrow_and_update();
        if pred(state) {
            return Some(state);
        }
        if rx.changed().await.is_err() {
            return None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tube_type_debug() {
        assert_eq!(format!("{:?}", TubeType::EXEC), "TubeType(exec)");
        assert_eq!(format!("{:?}", TubeType(200)), "TubeType(200)");
    }

    #[test]
    fn test_error_display() {
        let err: TubeError = ProtocolError::MalformedFrame("short".into()).into();
        assert_eq!(err.to_string(), "Protocol error: Malformed frame: short");
        assert_eq!(TubeError::OutOfTubes.to_string(), "No free tube IDs");
    }
}
