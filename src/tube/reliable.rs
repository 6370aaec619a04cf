//! Reliable, ordered tubes
//!
//! One lock guards the sender, the receiver and the lifecycle state, so an
//! acknowledgement and a delivered frame are always processed as one step.
//! Frames are built under the lock and handed to the muxer after it is
//! released.

use super::deadline::Deadline;
use super::frame::{Flags, Frame, InitiateFrame};
use super::receiver::Receiver;
use super::sender::{Sender, Transmit};
use super::{wait_state, Opener, TubeError, TubeState, TubeType};
use crate::config::TubeConfig;
use crate::protocol::ProtocolError;
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex, Notify};
use tokio::time::Instant;
use tracing::{debug, trace};

struct Inner {
    state: TubeState,
    sender: Sender,
    receiver: Receiver,
    /// Bumped whenever the time-wait linger restarts
    linger_epoch: u64,
    /// Local close requested; reads report end-of-stream from then on
    local_closed: bool,
}

struct Shared {
    id: u8,
    tube_type: TubeType,
    opener: Opener,
    config: TubeConfig,
    inner: Mutex<Inner>,
    outbound: mpsc::Sender<Bytes>,
    readable: Notify,
    state_tx: watch::Sender<TubeState>,
    retransmit_tx: watch::Sender<Option<Instant>>,
    read_deadline: Deadline,
    write_deadline: Deadline,
}

/// A reliable, ordered byte stream
#[derive(Clone)]
pub struct ReliableTube {
    shared: Arc<Shared>,
}

impl ReliableTube {
    pub(crate) fn new(
        id: u8,
        tube_type: TubeType,
        opener: Opener,
        config: &TubeConfig,
        outbound: mpsc::Sender<Bytes>,
    ) -> Self {
        let (state_tx, _) = watch::channel(TubeState::Created);
        let (retransmit_tx, _) = watch::channel(None);
        let shared = Arc::new(Shared {
            id,
            tube_type,
            opener,
            config: config.clone(),
            inner: Mutex::new(Inner {
                state: TubeState::Created,
                sender: Sender::new(config, config.window_size),
                receiver: Receiver::new(config.window_size),
                linger_epoch: 0,
                local_closed: false,
            }),
            outbound,
            readable: Notify::new(),
            state_tx,
            retransmit_tx,
            read_deadline: Deadline::new(),
            write_deadline: Deadline::new(),
        });

        tokio::spawn(retransmit_loop(Arc::clone(&shared)));
        Self { shared }
    }

    pub fn id(&self) -> u8 {
        self.shared.id
    }

    pub fn tube_type(&self) -> TubeType {
        self.shared.tube_type
    }

    pub fn state(&self) -> TubeState {
        *self.shared.state_tx.borrow()
    }

    pub fn set_read_deadline(&self, at: Option<Instant>) {
        self.shared.read_deadline.set(at);
    }

    pub fn set_write_deadline(&self, at: Option<Instant>) {
        self.shared.write_deadline.set(at);
    }

    /// Read delivered bytes. Returns `Ok(0)` at end of stream, and always
    /// after a local [`close`](Self::close), even if unread bytes remain.
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize, TubeError> {
        let s = &self.shared;
        if buf.is_empty() {
            return Ok(0);
        }

        loop {
            let notified = s.readable.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut inner = s.inner.lock().await;
                if inner.local_closed {
                    return Ok(0);
                }
                if let Some(n) = inner.receiver.read(buf)? {
                    return Ok(n);
                }
                if inner.state == TubeState::Closed {
                    return Ok(0);
                }
            }

            if s.read_deadline.is_expired() {
                return Err(TubeError::DeadlineExceeded);
            }
            tokio::select! {
                _ = &mut notified => {}
                _ = s.read_deadline.expired() => return Err(TubeError::DeadlineExceeded),
            }
        }
    }

    /// Queue bytes for delivery. Never waits for window space.
    pub async fn write(&self, buf: &[u8]) -> Result<usize, TubeError> {
        let s = &self.shared;
        if s.write_deadline.is_expired() {
            return Err(TubeError::DeadlineExceeded);
        }

        let datagrams = {
            let mut inner = s.inner.lock().await;
            if inner.state == TubeState::Created {
                return Err(ProtocolError::BadTubeState(inner.state).into());
            }
            if inner.local_closed || !inner.state.can_write() {
                return Err(TubeError::EndOfStream);
            }
            let transmits = inner.sender.write(buf, Instant::now())?;
            s.publish_retransmit(&inner);
            s.encode_all(&inner, transmits)
        };

        s.emit(datagrams).await?;
        Ok(buf.len())
    }

    /// Send FIN and wait for the close to settle, forcing the tube closed
    /// if that takes longer than the configured close timeout.
    pub async fn close(&self) -> Result<(), TubeError> {
        let s = &self.shared;
        let datagrams = {
            let mut inner = s.inner.lock().await;
            let next = inner.state.on_local_close()?;
            inner.local_closed = true;
            inner.receiver.discard();
            let transmits = inner.sender.send_fin(Instant::now())?;
            s.set_state(&mut inner, next);
            s.publish_retransmit(&inner);
            s.readable.notify_waiters();
            s.encode_all(&inner, transmits)
        };
        s.emit(datagrams).await?;

        let mut state_rx = s.state_tx.subscribe();
        let settled = tokio::time::timeout(
            s.config.close_timeout(),
            wait_state(&mut state_rx, TubeState::close_settled),
        )
        .await
        .is_ok();

        if !settled {
            debug!("tube {}: close timed out, forcing", s.id);
            self.force_close().await;
        }
        Ok(())
    }

    pub(crate) fn state_watch(&self) -> watch::Receiver<TubeState> {
        self.shared.state_tx.subscribe()
    }

    pub(crate) fn same(&self, other: &ReliableTube) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    /// Drop straight to Closed without any exchange with the peer
    pub(crate) async fn force_close(&self) {
        let s = &self.shared;
        let mut inner = s.inner.lock().await;
        inner.local_closed = true;
        s.set_state(&mut inner, TubeState::Closed);
        s.publish_retransmit(&inner);
    }

    /// Resend the open request until the handshake leaves Created
    pub(crate) fn start_initiate(&self) {
        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            let request = InitiateFrame::request(
                shared.id,
                shared.tube_type,
                shared.config.window_size,
                true,
            )
            .encode()
            .freeze();
            let mut state_rx = shared.state_tx.subscribe();
            let mut ticker = tokio::time::interval(shared.config.initiate_interval());

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        trace!("tube {}: sending open request", shared.id);
                        if shared.outbound.send(request.clone()).await.is_err() {
                            return;
                        }
                    }
                    _ = wait_state(&mut state_rx, |st| st != TubeState::Created) => return,
                }
            }
        });
    }

    /// Wait for the open handshake to finish
    pub(crate) async fn wait_initiated(&self) -> Result<(), TubeError> {
        let mut state_rx = self.shared.state_tx.subscribe();
        match wait_state(&mut state_rx, |st| st != TubeState::Created).await {
            Some(TubeState::Closed) | None => Err(TubeError::MuxerStopped),
            Some(_) => Ok(()),
        }
    }

    pub(crate) async fn receive_initiate(&self, frame: InitiateFrame) -> Result<(), TubeError> {
        let s = &self.shared;
        if !frame.has_flags(Flags::RELIABLE) || frame.tube_type != s.tube_type {
            return Err(ProtocolError::UnexpectedInitiate(format!(
                "{:?} type {} does not match tube {}",
                frame.flags, frame.tube_type.0, s.id
            ))
            .into());
        }

        let reply = {
            let mut inner = s.inner.lock().await;
            match (s.opener, frame.has_flags(Flags::REQ)) {
                (Opener::Peer, true) => {
                    if inner.state == TubeState::Created {
                        inner.sender.set_peer_window(frame.window_size);
                        s.set_state(&mut inner, TubeState::Initiated);
                    } else if inner.state.is_closing() {
                        return Err(ProtocolError::UnexpectedInitiate(format!(
                            "request for tube {} in state {:?}",
                            s.id, inner.state
                        ))
                        .into());
                    }
                    Some(
                        InitiateFrame::response(s.id, s.tube_type, s.config.window_size, true)
                            .encode()
                            .freeze(),
                    )
                }
                (Opener::Local, false) => {
                    if inner.state == TubeState::Created {
                        inner.sender.set_peer_window(frame.window_size);
                        s.set_state(&mut inner, TubeState::Initiated);
                    }
                    None
                }
                _ => {
                    return Err(ProtocolError::UnexpectedInitiate(format!(
                        "{:?} for tube {} opened by {:?}",
                        frame.flags, s.id, s.opener
                    ))
                    .into())
                }
            }
        };

        if let Some(reply) = reply {
            s.emit(vec![reply]).await?;
        }
        Ok(())
    }

    /// Handle one data frame routed here by the muxer
    pub(crate) async fn receive(&self, frame: Frame) -> Result<(), TubeError> {
        let s = &self.shared;
        if !frame.has_flags(Flags::RELIABLE) {
            return Err(ProtocolError::MalformedFrame(format!(
                "unreliable frame for reliable tube {}",
                s.id
            ))
            .into());
        }

        let now = Instant::now();
        let fin = frame.has_flags(Flags::FIN);
        let sequenced = fin || !frame.data.is_empty();

        let (datagrams, result) = {
            let mut inner = s.inner.lock().await;
            if !inner.state.accepts_frames() {
                return Err(ProtocolError::BadTubeState(inner.state).into());
            }

            let mut transmits = Vec::new();
            if frame.has_flags(Flags::ACK) {
                let outcome = inner.sender.recv_ack(frame.ack_no, !sequenced, now);
                transmits = outcome.transmit;
                if outcome.fin_acked {
                    let next = inner.state.on_fin_acked();
                    s.set_state(&mut inner, next);
                }
            }

            let mut result = Ok(());
            if sequenced {
                match inner.receiver.receive(frame.frame_no, frame.data, fin) {
                    Ok(delivery) => {
                        // Still acked and sequenced, but nobody reads it
                        if inner.local_closed {
                            inner.receiver.discard();
                        }
                        if delivery.frames > 0 {
                            s.readable.notify_waiters();
                        }
                        if delivery.fin {
                            let next = inner.state.on_peer_fin();
                            s.set_state(&mut inner, next);
                        }
                    }
                    Err(TubeError::EndOfStream) => {
                        // Retransmission after the peer's FIN was consumed
                        if fin && inner.state == TubeState::TimeWait {
                            trace!("tube {}: repeated FIN, restarting linger", s.id);
                            s.start_linger(&mut inner);
                        }
                    }
                    Err(e) => result = Err(e),
                }
            }

            let mut datagrams = s.encode_all(&inner, transmits);
            if sequenced && datagrams.is_empty() {
                datagrams.push(s.ack_frame(&inner));
            }
            s.publish_retransmit(&inner);
            (datagrams, result)
        };

        s.emit(datagrams).await?;
        result
    }
}

impl Shared {
    fn data_frame(&self, inner: &Inner, transmit: Transmit) -> Bytes {
        let mut flags = Flags::RELIABLE | Flags::ACK;
        flags.set(Flags::FIN, transmit.fin);
        Frame::new(
            self.id,
            flags,
            inner.receiver.ack(),
            transmit.frame_no,
            transmit.data,
        )
        .encode()
        .freeze()
    }

    fn encode_all(&self, inner: &Inner, transmits: Vec<Transmit>) -> Vec<Bytes> {
        transmits
            .into_iter()
            .map(|t| self.data_frame(inner, t))
            .collect()
    }

    /// Pure acknowledgement; carries the next frame number but is not sequenced
    fn ack_frame(&self, inner: &Inner) -> Bytes {
        Frame::new(
            self.id,
            Flags::RELIABLE | Flags::ACK,
            inner.receiver.ack(),
            inner.sender.next_frame_no(),
            Bytes::new(),
        )
        .encode()
        .freeze()
    }

    async fn emit(&self, datagrams: Vec<Bytes>) -> Result<(), TubeError> {
        for datagram in datagrams {
            self.outbound
                .send(datagram)
                .await
                .map_err(|_| TubeError::MuxerStopped)?;
        }
        Ok(())
    }

    fn publish_retransmit(&self, inner: &Inner) {
        let deadline = inner.sender.retransmit_deadline();
        self.retransmit_tx.send_if_modified(|current| {
            if *current == deadline {
                return false;
            }
            *current = deadline;
            true
        });
    }

    fn set_state(self: &Arc<Self>, inner: &mut Inner, next: TubeState) {
        if inner.state == next {
            return;
        }
        debug!("tube {}: {:?} -> {:?}", self.id, inner.state, next);
        inner.state = next;

        match next {
            TubeState::TimeWait => self.start_linger(inner),
            TubeState::Closed => {
                inner.receiver.close();
                inner.sender.abort();
                self.readable.notify_waiters();
            }
            _ => {}
        }
        self.state_tx.send_replace(next);
    }

    /// (Re)start the time-wait linger; only the newest timer may close
    fn start_linger(self: &Arc<Self>, inner: &mut Inner) {
        inner.linger_epoch += 1;
        let epoch = inner.linger_epoch;
        let shared = Arc::clone(self);

        tokio::spawn(async move {
            tokio::time::sleep(shared.config.time_wait()).await;
            let mut inner = shared.inner.lock().await;
            if inner.state == TubeState::TimeWait && inner.linger_epoch == epoch {
                shared.set_state(&mut inner, TubeState::Closed);
            }
        });
    }

    async fn on_retransmit_timer(&self) -> Result<(), TubeError> {
        let now = Instant::now();
        let datagrams = {
            let mut inner = self.inner.lock().await;
            match inner.sender.retransmit_deadline() {
                Some(at) if at <= now => {}
                _ => return Ok(()),
            }
            let transmits = inner.sender.on_retransmit_timeout(now);
            self.publish_retransmit(&inner);
            self.encode_all(&inner, transmits)
        };
        self.emit(datagrams).await
    }
}

/// Sleep until the sender's retransmit deadline and fire it, until the tube
/// closes
async fn retransmit_loop(shared: Arc<Shared>) {
    let mut deadline_rx = shared.retransmit_tx.subscribe();
    let mut state_rx = shared.state_tx.subscribe();

    loop {
        if *state_rx.borrow_and_update() == TubeState::Closed {
            return;
        }
        let deadline = *deadline_rx.borrow_and_update();

        tokio::select! {
            _ = sleep_until(deadline) => {
                if shared.on_retransmit_timer().await.is_err() {
                    return;
                }
            }
            changed = deadline_rx.changed() => {
                if changed.is_err() {
                    return;
                }
            }
            changed = state_rx.changed() => {
                if changed.is_err() {
                    return;
                }
            }
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tube::frame::Packet;
    use std::time::Duration;

    fn config() -> TubeConfig {
        TubeConfig {
            initial_rtt_ms: 50,
            time_wait_ms: 100,
            close_timeout_ms: 1_000,
            ..TubeConfig::default()
        }
    }

    fn decode(datagram: &Bytes) -> Frame {
        match Packet::decode(datagram).unwrap() {
            Packet::Data(frame) => frame,
            Packet::Initiate(frame) => panic!("unexpected initiate {:?}", frame),
        }
    }

    /// A responder tube that has already seen the open request
    async fn open_tube() -> (ReliableTube, mpsc::Receiver<Bytes>) {
        let (tx, mut rx) = mpsc::channel(64);
        let tube = ReliableTube::new(2, TubeType(7), Opener::Peer, &config(), tx);
        tube.receive_initiate(InitiateFrame::request(2, TubeType(7), 128, true))
            .await
            .unwrap();

        let resp = rx.recv().await.unwrap();
        assert!(matches!(Packet::decode(&resp).unwrap(), Packet::Initiate(f) if f.has_flags(Flags::RESP)));
        assert_eq!(tube.state(), TubeState::Initiated);
        (tube, rx)
    }

    fn data(frame_no: u32, ack_no: u32, payload: &'static [u8]) -> Frame {
        Frame::new(
            2,
            Flags::RELIABLE | Flags::ACK,
            ack_no,
            frame_no,
            Bytes::from_static(payload),
        )
    }

    fn fin(frame_no: u32, ack_no: u32) -> Frame {
        Frame::new(
            2,
            Flags::RELIABLE | Flags::ACK | Flags::FIN,
            ack_no,
            frame_no,
            Bytes::new(),
        )
    }

    #[tokio::test]
    async fn test_every_data_frame_is_acked() {
        let (tube, mut rx) = open_tube().await;

        tube.receive(data(2, 1, b"world")).await.unwrap();
        let ack = decode(&rx.recv().await.unwrap());
        assert!(ack.data.is_empty());
        assert_eq!(ack.ack_no, 1);

        tube.receive(data(1, 1, b"hello ")).await.unwrap();
        let ack = decode(&rx.recv().await.unwrap());
        assert_eq!(ack.ack_no, 3);

        // Duplicate below the window is rejected but still acknowledged
        assert!(tube.receive(data(1, 1, b"hello ")).await.is_err());
        assert_eq!(decode(&rx.recv().await.unwrap()).ack_no, 3);

        let mut buf = [0u8; 32];
        let n = tube.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hello world");
    }

    #[tokio::test]
    async fn test_pure_acks_not_answered() {
        let (tube, mut rx) = open_tube().await;
        tube.receive(data(1, 1, b"")).await.unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_write_piggybacks_ack() {
        let (tube, mut rx) = open_tube().await;
        tube.receive(data(1, 1, b"ping")).await.unwrap();
        rx.recv().await.unwrap();

        tube.write(b"pong").await.unwrap();
        let frame = decode(&rx.recv().await.unwrap());
        assert_eq!(frame.frame_no, 1);
        assert_eq!(frame.ack_no, 2);
        assert_eq!(&frame.data[..], b"pong");
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_deadline() {
        let (tube, _rx) = open_tube().await;
        tube.set_read_deadline(Some(Instant::now() + Duration::from_millis(20)));
        let mut buf = [0u8; 8];
        assert!(matches!(
            tube.read(&mut buf).await,
            Err(TubeError::DeadlineExceeded)
        ));
        // The tube is still usable afterwards
        tube.set_read_deadline(None);
        tube.receive(data(1, 1, b"late")).await.unwrap();
        assert_eq!(tube.read(&mut buf).await.unwrap(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unacked_frames_retransmitted() {
        let (tube, mut rx) = open_tube().await;
        tube.write(b"lost").await.unwrap();
        let first = decode(&rx.recv().await.unwrap());

        let again = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        let again = decode(&again);
        assert_eq!(again.frame_no, first.frame_no);
        assert_eq!(again.data, first.data);
    }

    #[tokio::test(start_paused = true)]
    async fn test_passive_close() {
        let (tube, mut rx) = open_tube().await;
        tube.receive(fin(1, 1)).await.unwrap();
        assert_eq!(tube.state(), TubeState::CloseWait);
        assert_eq!(decode(&rx.recv().await.unwrap()).ack_no, 2);

        let mut buf = [0u8; 8];
        assert_eq!(tube.read(&mut buf).await.unwrap(), 0);

        let closer = {
            let tube = tube.clone();
            tokio::spawn(async move { tube.close().await })
        };
        let our_fin = loop {
            let frame = decode(&rx.recv().await.unwrap());
            if frame.has_flags(Flags::FIN) {
                break frame;
            }
        };
        assert_eq!(tube.state(), TubeState::LastAck);

        tube.receive(data(2, our_fin.frame_no + 1, b"")).await.unwrap();
        assert_eq!(tube.state(), TubeState::Closed);
        closer.await.unwrap().unwrap();
        assert!(matches!(tube.close().await, Err(TubeError::EndOfStream)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_time_wait_lingers_then_closes() {
        let (tube, mut rx) = open_tube().await;
        let closer = {
            let tube = tube.clone();
            tokio::spawn(async move { tube.close().await })
        };
        let our_fin = decode(&rx.recv().await.unwrap());
        assert!(our_fin.has_flags(Flags::FIN));

        tube.receive(data(1, 2, b"")).await.unwrap();
        assert_eq!(tube.state(), TubeState::FinWait2);
        closer.await.unwrap().unwrap();

        tube.receive(fin(1, 2)).await.unwrap();
        assert_eq!(tube.state(), TubeState::TimeWait);

        tokio::time::sleep(Duration::from_millis(60)).await;
        // Repeated FIN restarts the linger
        tube.receive(fin(1, 2)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(tube.state(), TubeState::TimeWait);

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(tube.state(), TubeState::Closed);
        assert!(tube.receive(data(2, 2, b"x")).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_times_out() {
        let (tube, _rx) = open_tube().await;
        tube.close().await.unwrap();
        assert_eq!(tube.state(), TubeState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_after_local_close_ends() {
        let (tube, mut rx) = open_tube().await;
        tube.receive(data(1, 1, b"unread")).await.unwrap();
        rx.recv().await.unwrap();

        let closer = {
            let tube = tube.clone();
            tokio::spawn(async move { tube.close().await })
        };
        let our_fin = decode(&rx.recv().await.unwrap());
        assert!(our_fin.has_flags(Flags::FIN));

        let mut buf = [0u8; 16];
        assert_eq!(tube.read(&mut buf).await.unwrap(), 0);

        // Later data is still acknowledged but never surfaces
        tube.receive(data(2, our_fin.frame_no + 1, b"more")).await.unwrap();
        assert_eq!(decode(&rx.recv().await.unwrap()).ack_no, 3);
        assert_eq!(tube.state(), TubeState::FinWait2);
        assert_eq!(tube.read(&mut buf).await.unwrap(), 0);

        // The peer's FIN still completes the close
        tube.receive(fin(3, our_fin.frame_no + 1)).await.unwrap();
        assert_eq!(tube.state(), TubeState::TimeWait);
        closer.await.unwrap().unwrap();
        assert_eq!(tube.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_write_after_close_fails() {
        let (tube, _rx) = open_tube().await;
        tube.receive(fin(1, 1)).await.unwrap();
        tube.force_close().await;
        assert!(matches!(tube.write(b"x").await, Err(TubeError::EndOfStream)));
    }

    #[tokio::test]
    async fn test_requester_rejects_request() {
        let (tx, _rx) = mpsc::channel(8);
        let tube = ReliableTube::new(1, TubeType(7), Opener::Local, &config(), tx);
        let err = tube
            .receive_initiate(InitiateFrame::request(1, TubeType(7), 128, true))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            TubeError::Protocol(ProtocolError::UnexpectedInitiate(_))
        ));

        // Data before the handshake completes is refused
        assert!(matches!(
            tube.receive(data(1, 1, b"x")).await,
            Err(TubeError::Protocol(ProtocolError::BadTubeState(TubeState::Created)))
        ));

        tube.receive_initiate(InitiateFrame::response(1, TubeType(7), 64, true))
            .await
            .unwrap();
        assert_eq!(tube.state(), TubeState::Initiated);
        tube.wait_initiated().await.unwrap();
    }
}
