//! Protocol definitions and constants

use crate::tube::TubeState;
use thiserror::Error;

/// Protocol errors
///
/// These are always local to one datagram or one operation. The muxer drops
/// the offending datagram and keeps serving every other tube.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    #[error("Frame {frame_no} outside receive window [{window_start}, {window_end})")]
    OutOfBounds {
        frame_no: u64,
        window_start: u64,
        window_end: u64,
    },

    #[error("Frame not valid in tube state {0:?}")]
    BadTubeState(TubeState),

    #[error("Unexpected initiate frame: {0}")]
    UnexpectedInitiate(String),
}

/// Size of the fixed frame header
pub const FRAME_HEADER_SIZE: usize = 12;

/// Default datagram MTU handed to the underlying connection
pub const DEFAULT_MTU: usize = 1400;

/// Largest payload one frame can carry at the default MTU
pub const MAX_FRAME_DATA_LENGTH: usize = DEFAULT_MTU - FRAME_HEADER_SIZE;

/// Number of tube IDs available to each side of a connection
pub const MAX_TUBES_PER_ROLE: usize = 128;

/// Default receive window, in frames
pub const DEFAULT_WINDOW_SIZE: u16 = 128;

/// The congestion controller never shrinks the window below this many frames
pub const MIN_WINDOW_SIZE: u16 = 10;

/// Upper clamp for the bandwidth-delay window estimate
pub const MAX_WINDOW_SIZE: u16 = 1000;

/// Slow start threshold before any loss has been seen
pub const INITIAL_SSTHRESH: u16 = 100;

/// Interval between repeated initiate requests (milliseconds)
pub const INITIATE_INTERVAL_MS: u64 = 500;

/// RTT assumed before the first sample (milliseconds)
pub const INITIAL_RTT_MS: u64 = 500;

/// Floor for the smoothed RTT (milliseconds)
pub const MIN_RTT_MS: u64 = 10;

/// Oldest unacknowledged frames resent per retransmit timeout
pub const RETRANSMIT_BURST: usize = 16;

/// Linger time in the time-wait state (milliseconds)
pub const TIME_WAIT_MS: u64 = 5_000;

/// Hard limit on a local close before the tube is forced closed (milliseconds)
pub const CLOSE_TIMEOUT_MS: u64 = 30_000;

/// Handshake timeout for locally created tubes (milliseconds)
pub const HANDSHAKE_TIMEOUT_MS: u64 = 30_000;

/// Time a stopping muxer waits for tubes before forcing them closed (milliseconds)
pub const STOP_TIMEOUT_MS: u64 = 30_000;

/// Messages buffered per unreliable tube before new ones are dropped
pub const MAX_BUFFERED_MESSAGES: usize = 1000;
