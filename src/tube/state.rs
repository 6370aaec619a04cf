//! Tube lifecycle states and their transitions

use super::TubeError;
use crate::protocol::ProtocolError;

/// Lifecycle of one tube, modelled on TCP's connection states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TubeState {
    /// Registered, open handshake not finished
    Created,
    /// Handshake done, both directions open
    Initiated,
    /// Local FIN sent, waiting for its ack
    FinWait1,
    /// Local FIN acknowledged, waiting for the peer's FIN
    FinWait2,
    /// Both sides sent FIN before seeing the other's ack
    Closing,
    /// Both FINs done, lingering for retransmitted peer FINs
    TimeWait,
    /// Peer finished, local close still owed
    CloseWait,
    /// Local FIN sent after the peer's, waiting for its ack
    LastAck,
    Closed,
}

impl TubeState {
    /// State after a local close.
    pub fn on_local_close(self) -> Result<TubeState, TubeError> {
        match self {
            TubeState::Created => Err(ProtocolError::BadTubeState(self).into()),
            TubeState::Initiated => Ok(TubeState::FinWait1),
            TubeState::CloseWait => Ok(TubeState::LastAck),
            _ => Err(TubeError::EndOfStream),
        }
    }

    /// State after the local FIN is acknowledged
    pub fn on_fin_acked(self) -> TubeState {
        match self {
            TubeState::FinWait1 => TubeState::FinWait2,
            TubeState::Closing => TubeState::TimeWait,
            TubeState::LastAck => TubeState::Closed,
            other => other,
        }
    }

    /// State after the peer's FIN is consumed in order
    pub fn on_peer_fin(self) -> TubeState {
        match self {
            TubeState::Initiated => TubeState::CloseWait,
            TubeState::FinWait1 => TubeState::Closing,
            TubeState::FinWait2 => TubeState::TimeWait,
            other => other,
        }
    }

    /// Frames may be processed in this state
    pub fn accepts_frames(self) -> bool {
        !matches!(self, TubeState::Created | TubeState::Closed)
    }

    /// The local side may still write
    pub fn can_write(self) -> bool {
        matches!(self, TubeState::Initiated | TubeState::CloseWait)
    }

    /// A local close has nothing left to wait for
    pub fn close_settled(self) -> bool {
        matches!(
            self,
            TubeState::FinWait2 | TubeState::TimeWait | TubeState::Closed
        )
    }

    /// A close has started, locally or by the peer's FIN being acknowledged
    pub fn is_closing(self) -> bool {
        !matches!(
            self,
            TubeState::Created | TubeState::Initiated | TubeState::CloseWait
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_active_close() {
        let s = TubeState::Initiated.on_local_close().unwrap();
        assert_eq!(s, TubeState::FinWait1);
        let s = s.on_fin_acked();
        assert_eq!(s, TubeState::FinWait2);
        assert!(s.close_settled());
        assert_eq!(s.on_peer_fin(), TubeState::TimeWait);
    }

    #[test]
    fn test_passive_close() {
        let s = TubeState::Initiated.on_peer_fin();
        assert_eq!(s, TubeState::CloseWait);
        assert!(s.can_write());
        let s = s.on_local_close().unwrap();
        assert_eq!(s, TubeState::LastAck);
        assert_eq!(s.on_fin_acked(), TubeState::Closed);
    }

    #[test]
    fn test_simultaneous_close() {
        let s = TubeState::Initiated.on_local_close().unwrap().on_peer_fin();
        assert_eq!(s, TubeState::Closing);
        assert!(!s.close_settled());
        assert_eq!(s.on_fin_acked(), TubeState::TimeWait);
    }

    #[test]
    fn test_close_errors() {
        assert!(matches!(
            TubeState::Created.on_local_close(),
            Err(TubeError::Protocol(ProtocolError::BadTubeState(TubeState::Created)))
        ));
        for state in [
            TubeState::FinWait1,
            TubeState::FinWait2,
            TubeState::Closing,
            TubeState::TimeWait,
            TubeState::LastAck,
            TubeState::Closed,
        ] {
            assert!(matches!(state.on_local_close(), Err(TubeError::EndOfStream)));
        }
    }

    #[test]
    fn test_repeated_events_are_stable() {
        assert_eq!(TubeState::TimeWait.on_peer_fin(), TubeState::TimeWait);
        assert_eq!(TubeState::CloseWait.on_peer_fin(), TubeState::CloseWait);
        assert_eq!(TubeState::FinWait2.on_fin_acked(), TubeState::FinWait2);
        assert!(!TubeState::Created.accepts_frames());
        assert!(!TubeState::Closed.accepts_frames());
        assert!(TubeState::TimeWait.accepts_frames());
    }
}
