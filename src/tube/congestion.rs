//! Congestion control
//!
//! Every reliable sender owns exactly one controller, picked when the tube is
//! created. The sender reports acknowledgements, duplicate acknowledgements and
//! retransmit timeouts; the controller answers with a window size in frames.

use super::bbr::BbrProbe;
use crate::protocol::{INITIAL_SSTHRESH, MAX_WINDOW_SIZE, MIN_WINDOW_SIZE};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Duplicate acks that count as a loss
const DUP_ACK_THRESHOLD: u32 = 3;

/// What the sender learned from one advancing acknowledgement
#[derive(Debug, Clone, Copy)]
pub struct AckSample {
    /// Frames newly acknowledged
    pub acked: u64,
    /// Raw round-trip sample, when the ack produced one
    pub rtt_sample: Option<Duration>,
    /// Smoothed round-trip time after this ack
    pub srtt: Duration,
    /// Frames still unacknowledged after this ack
    pub in_flight: u64,
    /// Delivery rate in frames per second
    pub delivery_rate: Option<f64>,
    pub now: Instant,
}

/// Contract shared by all congestion control strategies
pub trait CongestionControl {
    /// The cumulative ack advanced
    fn on_ack(&mut self, sample: &AckSample);

    /// A pure ack arrived without advancing. Returns true when the oldest
    /// unacknowledged frame should be resent right away.
    fn on_duplicate_ack(&mut self) -> bool;

    /// The retransmit timer fired
    fn on_loss_signal(&mut self);

    /// Usable window, in frames
    fn current_window(&self) -> u16;
}

/// Strategy names as they appear in configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CongestionAlgorithm {
    /// Slow start followed by additive increase, multiplicative decrease
    #[default]
    Aimd,
    /// Reno-style fast retransmit and fast recovery
    Reno,
    /// Bandwidth-delay product estimation
    Bbr,
}

fn clamp_window(window: f64) -> u16 {
    window.clamp(MIN_WINDOW_SIZE as f64, MAX_WINDOW_SIZE as f64) as u16
}

/// Phase of the loss-based controllers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LossPhase {
    SlowStart,
    CongestionAvoidance,
    FastRecovery,
}

/// Slow start / AIMD state
#[derive(Debug, Clone)]
pub struct AimdProbe {
    phase: LossPhase,
    cwnd: f64,
    ssthresh: f64,
    dup_acks: u32,
}

impl AimdProbe {
    pub fn new() -> Self {
        Self {
            phase: LossPhase::SlowStart,
            cwnd: MIN_WINDOW_SIZE as f64,
            ssthresh: INITIAL_SSTHRESH as f64,
            dup_acks: 0,
        }
    }

    pub fn phase(&self) -> LossPhase {
        self.phase
    }

    pub fn ssthresh(&self) -> u16 {
        self.ssthresh as u16
    }

    /// Slow start growth and additive increase, shared with Reno
    fn grow(&mut self, acked: u64) {
        for _ in 0..acked {
            match self.phase {
                LossPhase::SlowStart => {
                    self.cwnd += 1.0;
                    if self.cwnd > self.ssthresh {
                        self.phase = LossPhase::CongestionAvoidance;
                    }
                }
                _ => self.cwnd += 1.0 / self.cwnd,
            }
        }
        self.cwnd = self.cwnd.min(MAX_WINDOW_SIZE as f64);
    }

    fn timeout(&mut self) {
        self.ssthresh = (self.cwnd / 2.0).max(MIN_WINDOW_SIZE as f64);
        self.cwnd = MIN_WINDOW_SIZE as f64;
        self.phase = LossPhase::SlowStart;
        self.dup_acks = 0;
    }
}

impl Default for AimdProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl CongestionControl for AimdProbe {
    fn on_ack(&mut self, sample: &AckSample) {
        self.dup_acks = 0;
        self.grow(sample.acked);
    }

    fn on_duplicate_ack(&mut self) -> bool {
        self.dup_acks += 1;
        if self.dup_acks == DUP_ACK_THRESHOLD {
            self.cwnd = (self.cwnd / 2.0).max(MIN_WINDOW_SIZE as f64);
            self.ssthresh = self.cwnd;
            self.phase = LossPhase::CongestionAvoidance;
            debug!("aimd: triple duplicate ack, window {:.1}", self.cwnd);
        }
        false
    }

    fn on_loss_signal(&mut self) {
        self.timeout();
        debug!("aimd: timeout, ssthresh {:.1}", self.ssthresh);
    }

    fn current_window(&self) -> u16 {
        clamp_window(self.cwnd)
    }
}

/// Reno state: AIMD plus fast recovery
#[derive(Debug, Clone, Default)]
pub struct RenoProbe {
    inner: AimdProbe,
}

impl RenoProbe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn phase(&self) -> LossPhase {
        self.inner.phase
    }

    pub fn ssthresh(&self) -> u16 {
        self.inner.ssthresh()
    }
}

impl CongestionControl for RenoProbe {
    fn on_ack(&mut self, sample: &AckSample) {
        let probe = &mut self.inner;
        probe.dup_acks = 0;
        if probe.phase == LossPhase::FastRecovery {
            // The retransmitted frame made it through
            probe.cwnd = probe.ssthresh;
            probe.phase = LossPhase::CongestionAvoidance;
            debug!("reno: leaving fast recovery, window {:.1}", probe.cwnd);
            return;
        }
        probe.grow(sample.acked);
    }

    fn on_duplicate_ack(&mut self) -> bool {
        let probe = &mut self.inner;
        probe.dup_acks += 1;
        if probe.dup_acks != DUP_ACK_THRESHOLD || probe.phase == LossPhase::FastRecovery {
            return false;
        }

        probe.ssthresh = (probe.cwnd / 2.0).max(MIN_WINDOW_SIZE as f64);
        probe.cwnd = (probe.ssthresh / 2.0).max(MIN_WINDOW_SIZE as f64);
        probe.phase = LossPhase::FastRecovery;
        debug!(
            "reno: fast recovery, ssthresh {:.1} window {:.1}",
            probe.ssthresh, probe.cwnd
        );
        true
    }

    fn on_loss_signal(&mut self) {
        self.inner.timeout();
        debug!("reno: timeout, ssthresh {:.1}", self.inner.ssthresh);
    }

    fn current_window(&self) -> u16 {
        clamp_window(self.inner.cwnd)
    }
}

/// The controller embedded in a sender
#[derive(Debug, Clone)]
pub enum Congestion {
    Aimd(AimdProbe),
    Reno(RenoProbe),
    Bbr(BbrProbe),
}

impl Congestion {
    pub fn new(algorithm: CongestionAlgorithm) -> Self {
        match algorithm {
            CongestionAlgorithm::Aimd => Congestion::Aimd(AimdProbe::new()),
            CongestionAlgorithm::Reno => Congestion::Reno(RenoProbe::new()),
            CongestionAlgorithm::Bbr => Congestion::Bbr(BbrProbe::new()),
        }
    }

    pub fn algorithm(&self) -> CongestionAlgorithm {
        match self {
            Congestion::Aimd(_) => CongestionAlgorithm::Aimd,
            Congestion::Reno(_) => CongestionAlgorithm::Reno,
            Congestion::Bbr(_) => CongestionAlgorithm::Bbr,
        }
    }

    fn probe(&self) -> &dyn CongestionControl {
        match self {
            Congestion::Aimd(p) => p,
            Congestion::Reno(p) => p,
            Congestion::Bbr(p) => p,
        }
    }

    fn probe_mut(&mut self) -> &mut dyn CongestionControl {
        match self {
            Congestion::Aimd(p) => p,
            Congestion::Reno(p) => p,
            Congestion::Bbr(p) => p,
        }
    }
}

impl CongestionControl for Congestion {
    fn on_ack(&mut self, sample: &AckSample) {
        self.probe_mut().on_ack(sample)
    }

    fn on_duplicate_ack(&mut self) -> bool {
        self.probe_mut().on_duplicate_ack()
    }

    fn on_loss_signal(&mut self) {
        self.probe_mut().on_loss_signal()
    }

    fn current_window(&self) -> u16 {
        self.probe().current_window()
    }
}
