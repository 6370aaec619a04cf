//! Send side of a reliable tube: numbering, retransmission, RTT estimation.
//!
//! Like the receiver this is plain data driven by the owning tube. Every
//! method that may put frames on the wire returns them as [`Transmit`]s; the
//! tube attaches its ack number and hands them to the muxer.

use super::congestion::{AckSample, Congestion, CongestionAlgorithm, CongestionControl};
use super::seq;
use super::TubeError;
use crate::config::TubeConfig;
use bytes::Bytes;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;
use tracing::trace;

/// A sequenced frame ready for the wire
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transmit {
    pub frame_no: u32,
    pub data: Bytes,
    pub fin: bool,
}

/// A sequenced frame held until acknowledged
#[derive(Debug)]
struct OutFrame {
    frame_no: u64,
    data: Bytes,
    fin: bool,
    sent_at: Option<Instant>,
    retransmitted: bool,
    /// Frames delivered when this one was first sent, for rate sampling
    delivered: u64,
    delivered_at: Option<Instant>,
}

impl OutFrame {
    fn transmit(&self) -> Transmit {
        Transmit {
            frame_no: self.frame_no as u32,
            data: self.data.clone(),
            fin: self.fin,
        }
    }
}

/// Result of processing one acknowledgement
#[derive(Debug, Default)]
pub struct AckOutcome {
    /// Frames newly acknowledged
    pub acked: u64,
    /// The queued FIN is among them
    pub fin_acked: bool,
    /// Frames to put on the wire as a consequence
    pub transmit: Vec<Transmit>,
}

/// Per-tube sender
#[derive(Debug)]
pub struct Sender {
    /// Next number to assign
    next_frame_no: u64,
    /// Lowest unacknowledged frame number
    ack_no: u64,
    /// Unacknowledged frames; the first `unacked` have been transmitted
    frames: VecDeque<OutFrame>,
    unacked: usize,

    peer_window: u16,
    congestion: Congestion,

    rtt: Duration,
    rto: Duration,
    min_rtt: Duration,
    retransmit_deadline: Option<Instant>,
    retransmit_burst: usize,
    max_payload: usize,

    /// Frames acknowledged so far
    delivered: u64,
    delivered_at: Option<Instant>,
    /// Latest delivery rate sample, frames per second
    delivery_rate: Option<f64>,

    fin_queued: bool,
    closed: bool,
}

impl Sender {
    pub fn new(config: &TubeConfig, peer_window: u16) -> Self {
        let rtt = config.initial_rtt().max(config.min_rtt());
        Self {
            next_frame_no: 1,
            ack_no: 1,
            frames: VecDeque::new(),
            unacked: 0,
            peer_window,
            congestion: Congestion::new(config.congestion),
            rtt,
            rto: rto_for(rtt),
            min_rtt: config.min_rtt(),
            retransmit_deadline: None,
            retransmit_burst: config.retransmit_burst.max(1),
            max_payload: config.max_frame_payload.max(1),
            delivered: 0,
            delivered_at: None,
            delivery_rate: None,
            fin_queued: false,
            closed: false,
        }
    }

    /// Number the next sequenced frame will carry, truncated for the wire
    pub fn next_frame_no(&self) -> u32 {
        self.next_frame_no as u32
    }

    /// Frames on the wire and not yet acknowledged
    pub fn unacked(&self) -> usize {
        self.unacked
    }

    /// Frames queued behind the window
    pub fn pending(&self) -> usize {
        self.frames.len() - self.unacked
    }

    /// Everything written, FIN included, has been acknowledged
    pub fn is_drained(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn is_fin_queued(&self) -> bool {
        self.fin_queued
    }

    pub fn rtt(&self) -> Duration {
        self.rtt
    }

    pub fn rto(&self) -> Duration {
        self.rto
    }

    /// Frames per second acknowledged over the newest frame's flight
    pub fn delivery_rate(&self) -> Option<f64> {
        self.delivery_rate
    }

    pub fn retransmit_deadline(&self) -> Option<Instant> {
        self.retransmit_deadline
    }

    pub fn algorithm(&self) -> CongestionAlgorithm {
        self.congestion.algorithm()
    }

    /// Effective window: the congestion window capped by the peer's window
    pub fn window(&self) -> usize {
        self.congestion.current_window().min(self.peer_window) as usize
    }

    pub fn set_peer_window(&mut self, window: u16) {
        self.peer_window = window.max(1);
    }

    /// Queue bytes for delivery and transmit what the window allows.
    pub fn write(&mut self, data: &[u8], now: Instant) -> Result<Vec<Transmit>, TubeError> {
        if self.closed || self.fin_queued {
            return Err(TubeError::EndOfStream);
        }

        for chunk in data.chunks(self.max_payload) {
            self.queue(Bytes::copy_from_slice(chunk), false);
        }
        Ok(self.fill(now))
    }

    /// Queue the zero-length FIN frame.
    pub fn send_fin(&mut self, now: Instant) -> Result<Vec<Transmit>, TubeError> {
        if self.closed || self.fin_queued {
            return Err(TubeError::EndOfStream);
        }
        self.fin_queued = true;
        self.queue(Bytes::new(), true);
        Ok(self.fill(now))
    }

    /// Refuse further writes. Frames already queued keep retransmitting.
    pub fn close(&mut self) {
        self.closed = true;
    }

    /// Drop everything still queued; nothing will be sent again.
    pub fn abort(&mut self) {
        self.closed = true;
        self.frames.clear();
        self.unacked = 0;
        self.retransmit_deadline = None;
    }

    fn queue(&mut self, data: Bytes, fin: bool) {
        let frame_no = self.next_frame_no;
        self.next_frame_no += 1;
        self.frames.push_back(OutFrame {
            frame_no,
            data,
            fin,
            sent_at: None,
            retransmitted: false,
            delivered: 0,
            delivered_at: None,
        });
    }

    /// Transmit pending frames while the window has room
    fn fill(&mut self, now: Instant) -> Vec<Transmit> {
        let sendable = self
            .window()
            .saturating_sub(self.unacked)
            .min(self.pending());

        let mut out = Vec::with_capacity(sendable);
        for frame in self.frames.iter_mut().skip(self.unacked).take(sendable) {
            frame.sent_at = Some(now);
            frame.delivered = self.delivered;
            frame.delivered_at = self.delivered_at.or(Some(now));
            out.push(frame.transmit());
        }
        self.unacked += out.len();

        if !out.is_empty() {
            trace!("sending {} frames, {} in flight", out.len(), self.unacked);
            if self.retransmit_deadline.is_none() {
                self.retransmit_deadline = Some(now + self.rto);
            }
        }
        out
    }

    /// Process the peer's ack number.
    ///
    /// `pure` marks acks that arrived on a frame without payload or FIN; only
    /// those can count as duplicates.
    pub fn recv_ack(&mut self, ack_no: u32, pure: bool, now: Instant) -> AckOutcome {
        let mut outcome = AckOutcome::default();
        // Nothing past what was transmitted can be acknowledged
        let highest = self.ack_no + self.unacked as u64;
        let ack = seq::unwrap(self.ack_no, ack_no).min(highest);

        if ack <= self.ack_no {
            if pure && ack == self.ack_no && self.unacked > 0 && self.congestion.on_duplicate_ack() {
                if let Some(frame) = self.frames.front_mut() {
                    trace!("fast retransmit of frame {}", frame.frame_no);
                    frame.sent_at = Some(now);
                    frame.retransmitted = true;
                    outcome.transmit.push(frame.transmit());
                }
            }
            return outcome;
        }

        let mut rtt_sample = None;
        let mut delivery_rate = None;
        while self.ack_no < ack {
            let Some(frame) = self.frames.pop_front() else {
                break;
            };
            self.ack_no += 1;
            self.unacked -= 1;
            self.delivered += 1;
            outcome.acked += 1;
            outcome.fin_acked |= frame.fin;

            // Karn: only never-retransmitted frames, and only the newest one
            if self.ack_no == ack && !frame.retransmitted {
                if let Some(sent_at) = frame.sent_at {
                    let sample = now.saturating_duration_since(sent_at);
                    rtt_sample = Some(sample);
                    if let Some(since) = frame.delivered_at {
                        let elapsed = now.saturating_duration_since(since).as_secs_f64();
                        if elapsed > 0.0 {
                            delivery_rate =
                                Some((self.delivered - frame.delivered) as f64 / elapsed);
                        }
                    }
                }
            }
        }
        self.delivered_at = Some(now);
        if delivery_rate.is_some() {
            self.delivery_rate = delivery_rate;
        }

        if let Some(sample) = rtt_sample {
            self.update_rtt(sample);
        }
        self.rto = rto_for(self.rtt);

        self.congestion.on_ack(&AckSample {
            acked: outcome.acked,
            rtt_sample,
            srtt: self.rtt,
            in_flight: self.unacked as u64,
            delivery_rate,
            now,
        });

        self.retransmit_deadline = (self.unacked > 0).then(|| now + self.rto);
        outcome.transmit = self.fill(now);
        trace!(
            "ack {} acknowledged {} frames (rtt {:?}, window {})",
            ack,
            outcome.acked,
            self.rtt,
            self.window()
        );
        outcome
    }

    fn update_rtt(&mut self, sample: Duration) {
        let sample = sample.min(self.rtt * 2);
        self.rtt = (self.rtt * 7 / 8 + sample / 8).max(self.min_rtt);
    }

    /// The retransmit deadline passed: resend the oldest frames.
    pub fn on_retransmit_timeout(&mut self, now: Instant) -> Vec<Transmit> {
        if self.unacked == 0 {
            self.retransmit_deadline = None;
            return Vec::new();
        }

        self.congestion.on_loss_signal();
        let burst = self.retransmit_burst.min(self.unacked);
        let mut out = Vec::with_capacity(burst);
        for frame in self.frames.iter_mut().take(burst) {
            frame.sent_at = Some(now);
            frame.retransmitted = true;
            out.push(frame.transmit());
        }
        self.retransmit_deadline = Some(now + self.rto);
        trace!("retransmit timeout, resending {} of {} frames", burst, self.unacked);
        out
    }
}

fn rto_for(rtt: Duration) -> Duration {
    rtt * 9 / 8
}
