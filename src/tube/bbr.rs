//! Bandwidth-delay congestion control
//!
//! The window follows `max bandwidth x min RTT x gain`, with bandwidth
//! measured in frames per second from the sender's delivery-rate samples.

use super::congestion::{AckSample, CongestionControl};
use crate::protocol::{MAX_WINDOW_SIZE, MIN_WINDOW_SIZE};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Window gain while searching for the bottleneck bandwidth (2/ln 2)
const STARTUP_GAIN: f64 = 2.885;

/// Window gain in steady state, applied on top of the cycle gain
const CWND_GAIN: f64 = 2.0;

/// Bandwidth growth that keeps startup going
const STARTUP_GROWTH: f64 = 1.25;

/// Gain cycle for probing bandwidth, one step per round trip
const PROBE_BW_GAINS: [f64; 8] = [1.25, 0.75, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0];

/// Minimum RTT estimate goes stale after this long
const PROBE_RTT_INTERVAL: Duration = Duration::from_secs(10);

/// Time spent at the floor window when re-measuring the minimum RTT
const PROBE_RTT_DURATION: Duration = Duration::from_millis(200);

/// Max bandwidth filter decay, applied when a sample falls well below it
const BW_DECAY: f64 = 0.99;

/// Phases of the estimator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BbrPhase {
    Startup,
    Drain,
    ProbeBw,
    ProbeRtt,
}

/// Bandwidth-delay estimator state
#[derive(Debug, Clone)]
pub struct BbrProbe {
    phase: BbrPhase,
    phase_start: Option<Instant>,
    cycle_index: usize,

    /// Max-filtered delivery rate, frames per second
    max_bw: f64,
    /// Bandwidth when startup last saw meaningful growth
    startup_bw: f64,

    min_rtt: Option<Duration>,
    min_rtt_stamp: Option<Instant>,
    /// Smallest sample seen while in ProbeRtt
    probe_rtt_min: Option<Duration>,
    srtt: Duration,

    window: u16,
}

impl BbrProbe {
    pub fn new() -> Self {
        Self {
            phase: BbrPhase::Startup,
            phase_start: None,
            cycle_index: 0,
            max_bw: 0.0,
            startup_bw: 0.0,
            min_rtt: None,
            min_rtt_stamp: None,
            probe_rtt_min: None,
            srtt: Duration::ZERO,
            window: MIN_WINDOW_SIZE,
        }
    }

    pub fn phase(&self) -> BbrPhase {
        self.phase
    }

    /// Estimated bandwidth in frames per second
    pub fn bandwidth(&self) -> f64 {
        self.max_bw
    }

    pub fn min_rtt(&self) -> Option<Duration> {
        self.min_rtt
    }

    /// Bandwidth-delay product in frames
    pub fn bdp(&self) -> f64 {
        match self.min_rtt {
            Some(rtt) => self.max_bw * rtt.as_secs_f64(),
            None => 0.0,
        }
    }

    fn enter(&mut self, phase: BbrPhase, now: Instant) {
        debug!(
            "bbr: {:?} -> {:?} (bw {:.1} frames/s, bdp {:.1})",
            self.phase,
            phase,
            self.max_bw,
            self.bdp()
        );
        self.phase = phase;
        self.phase_start = Some(now);
        if phase == BbrPhase::ProbeBw {
            self.cycle_index = 0;
        }
    }

    fn elapsed(&self, now: Instant) -> Duration {
        self.phase_start
            .map(|start| now.saturating_duration_since(start))
            .unwrap_or_default()
    }

    /// Move toward a new window: increases apply at once, decreases are
    /// smoothed over several acks.
    fn apply(&mut self, target: f64) {
        let target = target.clamp(MIN_WINDOW_SIZE as f64, MAX_WINDOW_SIZE as f64) as u32;
        let current = self.window as u32;
        let next = if target < current {
            (current * 7 + target) / 8
        } else {
            target
        };
        self.window = (next as u16).clamp(MIN_WINDOW_SIZE, MAX_WINDOW_SIZE);
    }

    fn update_bandwidth(&mut self, rate: f64) {
        if rate > self.max_bw {
            self.max_bw = rate;
        } else if rate < self.max_bw * 0.5 {
            self.max_bw *= BW_DECAY;
        }
    }

    fn update_min_rtt(&mut self, rtt: Duration, now: Instant) {
        if self.phase == BbrPhase::ProbeRtt {
            self.probe_rtt_min = Some(self.probe_rtt_min.map_or(rtt, |m| m.min(rtt)));
        }
        if self.min_rtt.map_or(true, |m| rtt <= m) {
            self.min_rtt = Some(rtt);
            self.min_rtt_stamp = Some(now);
        }
    }
}

impl Default for BbrProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl CongestionControl for BbrProbe {
    fn on_ack(&mut self, sample: &AckSample) {
        let now = sample.now;
        self.srtt = sample.srtt;
        if self.phase_start.is_none() {
            self.phase_start = Some(now);
        }
        if let Some(rtt) = sample.rtt_sample {
            self.update_min_rtt(rtt, now);
        }
        if let Some(rate) = sample.delivery_rate {
            self.update_bandwidth(rate);
        }

        let round = self.min_rtt.unwrap_or(self.srtt).max(self.srtt);
        match self.phase {
            BbrPhase::Startup => {
                if self.max_bw >= self.startup_bw * STARTUP_GROWTH && self.max_bw > 0.0 {
                    self.startup_bw = self.max_bw;
                    self.phase_start = Some(now);
                } else if self.elapsed(now) >= round * 2 {
                    self.enter(BbrPhase::Drain, now);
                }
                // Grow like slow start until the model has something to say
                let grown = self.window as f64 + sample.acked as f64;
                self.apply(grown.max(self.bdp() * STARTUP_GAIN));
            }
            BbrPhase::Drain => {
                if sample.in_flight as f64 <= self.bdp() {
                    self.enter(BbrPhase::ProbeBw, now);
                }
                self.apply(self.bdp());
            }
            BbrPhase::ProbeBw => {
                if self.elapsed(now) >= round {
                    self.cycle_index = (self.cycle_index + 1) % PROBE_BW_GAINS.len();
                    self.phase_start = Some(now);
                }
                self.apply(self.bdp() * CWND_GAIN * PROBE_BW_GAINS[self.cycle_index]);
            }
            BbrPhase::ProbeRtt => {
                self.window = MIN_WINDOW_SIZE;
                if self.elapsed(now) >= PROBE_RTT_DURATION {
                    if let Some(rtt) = self.probe_rtt_min.take() {
                        self.min_rtt = Some(rtt);
                    }
                    self.min_rtt_stamp = Some(now);
                    self.enter(BbrPhase::ProbeBw, now);
                }
            }
        }

        let stale = self
            .min_rtt_stamp
            .map_or(false, |stamp| now.saturating_duration_since(stamp) >= PROBE_RTT_INTERVAL);
        if stale && self.phase != BbrPhase::ProbeRtt {
            self.probe_rtt_min = None;
            self.enter(BbrPhase::ProbeRtt, now);
            self.window = MIN_WINDOW_SIZE;
        }
    }

    fn on_duplicate_ack(&mut self) -> bool {
        false
    }

    fn on_loss_signal(&mut self) {
        // Model-driven: a timeout alone does not move the estimate
        debug!("bbr: retransmit timeout in {:?}", self.phase);
    }

    fn current_window(&self) -> u16 {
        self.window
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(now: Instant, rtt_ms: u64, rate: f64, in_flight: u64) -> AckSample {
        AckSample {
            acked: 1,
            rtt_sample: Some(Duration::from_millis(rtt_ms)),
            srtt: Duration::from_millis(rtt_ms),
            in_flight,
            delivery_rate: Some(rate),
            now,
        }
    }

    #[test]
    fn test_startup_grows_window() {
        let mut bbr = BbrProbe::new();
        let t0 = Instant::now();
        for i in 0..20 {
            bbr.on_ack(&sample(t0 + Duration::from_millis(i), 50, 100.0 * (i + 1) as f64, 10));
        }
        assert_eq!(bbr.phase(), BbrPhase::Startup);
        assert!(bbr.current_window() > MIN_WINDOW_SIZE);
    }

    #[test]
    fn test_startup_exits_when_bandwidth_plateaus() {
        let mut bbr = BbrProbe::new();
        let t0 = Instant::now();
        bbr.on_ack(&sample(t0, 50, 1000.0, 100));
        // Bandwidth flat for more than two round trips
        for i in 1..=12 {
            bbr.on_ack(&sample(t0 + Duration::from_millis(10 * i), 50, 1000.0, 100));
        }
        assert_ne!(bbr.phase(), BbrPhase::Startup);
    }

    #[test]
    fn test_drain_then_probe_bw() {
        let mut bbr = BbrProbe::new();
        let t0 = Instant::now();
        bbr.on_ack(&sample(t0, 50, 1000.0, 200));
        bbr.on_ack(&sample(t0 + Duration::from_millis(150), 50, 1000.0, 200));
        assert_eq!(bbr.phase(), BbrPhase::Drain);

        // BDP is 1000 frames/s * 50ms = 50 frames
        bbr.on_ack(&sample(t0 + Duration::from_millis(160), 50, 1000.0, 40));
        assert_eq!(bbr.phase(), BbrPhase::ProbeBw);
        assert!((bbr.bdp() - 50.0).abs() < 1e-6);
    }

    #[test]
    fn test_probe_rtt_after_stale_min_rtt() {
        let mut bbr = BbrProbe::new();
        let t0 = Instant::now();
        bbr.on_ack(&sample(t0, 20, 500.0, 5));

        // Later samples never beat the first minimum
        let later = t0 + PROBE_RTT_INTERVAL + Duration::from_millis(1);
        bbr.on_ack(&sample(later, 40, 500.0, 5));
        assert_eq!(bbr.phase(), BbrPhase::ProbeRtt);
        assert_eq!(bbr.current_window(), MIN_WINDOW_SIZE);

        let done = later + PROBE_RTT_DURATION;
        bbr.on_ack(&sample(done, 40, 500.0, 5));
        assert_eq!(bbr.phase(), BbrPhase::ProbeBw);
        assert_eq!(bbr.min_rtt(), Some(Duration::from_millis(40)));
    }

    #[test]
    fn test_decreases_are_smoothed() {
        let mut bbr = BbrProbe::new();
        bbr.window = 800;
        bbr.apply(80.0);
        assert_eq!(bbr.current_window(), (800 * 7 + 80) / 8);

        bbr.apply(900.0);
        assert_eq!(bbr.current_window(), 900);

        bbr.apply(5000.0);
        assert_eq!(bbr.current_window(), MAX_WINDOW_SIZE);
    }

    #[test]
    fn test_bandwidth_filter_decays() {
        let mut bbr = BbrProbe::new();
        bbr.update_bandwidth(1000.0);
        bbr.update_bandwidth(800.0);
        assert_eq!(bbr.bandwidth(), 1000.0);
        bbr.update_bandwidth(100.0);
        assert!((bbr.bandwidth() - 990.0).abs() < 1e-9);
    }

    #[test]
    fn test_ignores_duplicate_acks() {
        let mut bbr = BbrProbe::new();
        for _ in 0..5 {
            assert!(!bbr.on_duplicate_ack());
        }
        bbr.on_loss_signal();
        assert_eq!(bbr.current_window(), MIN_WINDOW_SIZE);
    }
}
