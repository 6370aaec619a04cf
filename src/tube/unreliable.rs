//! Unreliable, unordered tubes
//!
//! Each write is one frame and each read returns one message. Nothing is
//! acknowledged or retransmitted.

use super::deadline::Deadline;
use super::frame::{Flags, Frame, InitiateFrame};
use super::{wait_state, Opener, TubeError, TubeState, TubeType};
use crate::config::TubeConfig;
use crate::protocol::{ProtocolError, MAX_BUFFERED_MESSAGES};
use bytes::Bytes;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex, Notify};
use tokio::time::Instant;
use tracing::{debug, trace};

struct Inner {
    state: TubeState,
    messages: VecDeque<Bytes>,
    /// The peer sent FIN; reads drain then report end-of-stream
    peer_closed: bool,
    next_frame_no: u32,
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
    read_deadline: Deadline,
    write_deadline: Deadline,
}

/// A best-effort message tube
#[derive(Clone)]
pub struct UnreliableTube {
    shared: Arc<Shared>,
}

impl UnreliableTube {
    pub(crate) fn new(
        id: u8,
        tube_type: TubeType,
        opener: Opener,
        config: &TubeConfig,
        outbound: mpsc::Sender<Bytes>,
    ) -> Self {
        let (state_tx, _) = watch::channel(TubeState::Created);
        Self {
            shared: Arc::new(Shared {
                id,
                tube_type,
                opener,
                config: config.clone(),
                inner: Mutex::new(Inner {
                    state: TubeState::Created,
                    messages: VecDeque::new(),
                    peer_closed: false,
                    next_frame_no: 1,
                }),
                outbound,
                readable: Notify::new(),
                state_tx,
                read_deadline: Deadline::new(),
                write_deadline: Deadline::new(),
            }),
        }
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

    /// Largest message one write can carry
    pub fn max_message(&self) -> usize {
        self.shared.config.max_frame_payload
    }

    pub fn set_read_deadline(&self, at: Option<Instant>) {
        self.shared.read_deadline.set(at);
    }

    pub fn set_write_deadline(&self, at: Option<Instant>) {
        self.shared.write_deadline.set(at);
    }

    /// Read one message. A buffer too small for the next message fails with
    /// `MessageTruncated` and leaves the message queued.
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize, TubeError> {
        let s = &self.shared;
        loop {
            let notified = s.readable.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut inner = s.inner.lock().await;
                if let Some(message) = inner.messages.front() {
                    if message.len() > buf.len() {
                        return Err(TubeError::MessageTruncated);
                    }
                    let n = message.len();
                    buf[..n].copy_from_slice(message);
                    inner.messages.pop_front();
                    return Ok(n);
                }
                if inner.peer_closed || inner.state == TubeState::Closed {
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

    /// Send one message as one frame
    pub async fn write(&self, buf: &[u8]) -> Result<usize, TubeError> {
        let s = &self.shared;
        if buf.len() > s.config.max_frame_payload {
            return Err(TubeError::MessageTooLarge);
        }
        if s.write_deadline.is_expired() {
            return Err(TubeError::DeadlineExceeded);
        }

        let datagram = {
            let mut inner = s.inner.lock().await;
            if inner.state == TubeState::Created {
                return Err(ProtocolError::BadTubeState(inner.state).into());
            }
            if !inner.state.can_write() {
                return Err(TubeError::EndOfStream);
            }
            s.frame(&mut inner, Flags::empty(), Bytes::copy_from_slice(buf))
        };

        s.outbound
            .send(datagram)
            .await
            .map_err(|_| TubeError::MuxerStopped)?;
        Ok(buf.len())
    }

    /// Send a best-effort FIN and close immediately. Unread messages are
    /// dropped.
    pub async fn close(&self) -> Result<(), TubeError> {
        let s = &self.shared;
        let datagram = {
            let mut inner = s.inner.lock().await;
            inner.state.on_local_close()?;
            inner.messages.clear();
            let fin = s.frame(&mut inner, Flags::FIN, Bytes::new());
            s.set_state(&mut inner, TubeState::Closed);
            fin
        };

        // The FIN is best effort; a stopped muxer changes nothing here
        let _ = s.outbound.send(datagram).await;
        Ok(())
    }

    pub(crate) fn state_watch(&self) -> watch::Receiver<TubeState> {
        self.shared.state_tx.subscribe()
    }

    pub(crate) fn same(&self, other: &UnreliableTube) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    pub(crate) async fn force_close(&self) {
        let s = &self.shared;
        let mut inner = s.inner.lock().await;
        s.set_state(&mut inner, TubeState::Closed);
    }

    pub(crate) fn start_initiate(&self) {
        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            let request = InitiateFrame::request(
                shared.id,
                shared.tube_type,
                shared.config.window_size,
                false,
            )
            .encode()
            .freeze();
            let mut state_rx = shared.state_tx.subscribe();
            let mut ticker = tokio::time::interval(shared.config.initiate_interval());

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if shared.outbound.send(request.clone()).await.is_err() {
                            return;
                        }
                    }
                    _ = wait_state(&mut state_rx, |st| st != TubeState::Created) => return,
                }
            }
        });
    }

    pub(crate) async fn wait_initiated(&self) -> Result<(), TubeError> {
        let mut state_rx = self.shared.state_tx.subscribe();
        match wait_state(&mut state_rx, |st| st != TubeState::Created).await {
            Some(TubeState::Closed) | None => Err(TubeError::MuxerStopped),
            Some(_) => Ok(()),
        }
    }

    pub(crate) async fn receive_initiate(&self, frame: InitiateFrame) -> Result<(), TubeError> {
        let s = &self.shared;
        if frame.has_flags(Flags::RELIABLE) || frame.tube_type != s.tube_type {
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
                        s.set_state(&mut inner, TubeState::Initiated);
                    } else if inner.state == TubeState::Closed {
                        return Err(ProtocolError::BadTubeState(inner.state).into());
                    }
                    Some(
                        InitiateFrame::response(s.id, s.tube_type, s.config.window_size, false)
                            .encode()
                            .freeze(),
                    )
                }
                (Opener::Local, false) => {
                    if inner.state == TubeState::Created {
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
            s.outbound
                .send(reply)
                .await
                .map_err(|_| TubeError::MuxerStopped)?;
        }
        Ok(())
    }

    pub(crate) async fn receive(&self, frame: Frame) -> Result<(), TubeError> {
        let s = &self.shared;
        if frame.has_flags(Flags::RELIABLE) {
            return Err(ProtocolError::MalformedFrame(format!(
                "reliable frame for unreliable tube {}",
                s.id
            ))
            .into());
        }

        let mut inner = s.inner.lock().await;
        if !inner.state.accepts_frames() {
            return Err(ProtocolError::BadTubeState(inner.state).into());
        }

        if frame.has_flags(Flags::FIN) {
            if !inner.peer_closed {
                inner.peer_closed = true;
                let next = inner.state.on_peer_fin();
                s.set_state(&mut inner, next);
                s.readable.notify_waiters();
            }
            return Ok(());
        }

        if inner.peer_closed || frame.data.is_empty() {
            return Ok(());
        }
        if inner.messages.len() >= MAX_BUFFERED_MESSAGES {
            trace!("tube {}: queue full, dropping message", s.id);
            return Ok(());
        }
        inner.messages.push_back(frame.data);
        s.readable.notify_waiters();
        Ok(())
    }
}

impl Shared {
    fn frame(&self, inner: &mut Inner, flags: Flags, data: Bytes) -> Bytes {
        let frame_no = inner.next_frame_no;
        inner.next_frame_no = inner.next_frame_no.wrapping_add(1);
        Frame::new(self.id, flags, 0, frame_no, data).encode().freeze()
    }

    fn set_state(&self, inner: &mut Inner, next: TubeState) {
        if inner.state == next {
            return;
        }
        debug!("tube {}: {:?} -> {:?}", self.id, inner.state, next);
        inner.state = next;
        if next == TubeState::Closed {
            self.readable.notify_waiters();
        }
        self.state_tx.send_replace(next);
    }
}
