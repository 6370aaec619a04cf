//! Configuration management

use crate::protocol::{
    CLOSE_TIMEOUT_MS, DEFAULT_MTU, DEFAULT_WINDOW_SIZE, FRAME_HEADER_SIZE, HANDSHAKE_TIMEOUT_MS,
    INITIAL_RTT_MS, INITIATE_INTERVAL_MS, MAX_FRAME_DATA_LENGTH, MIN_RTT_MS, RETRANSMIT_BURST,
    STOP_TIMEOUT_MS, TIME_WAIT_MS,
};
use crate::tube::CongestionAlgorithm;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Per-tube protocol settings
    #[serde(default)]
    pub tube: TubeConfig,
    /// Muxer settings
    #[serde(default)]
    pub muxer: MuxerConfig,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, crate::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::Error::Config(format!("Failed to read config: {}", e)))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), crate::Error> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| crate::Error::Config(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path, content)
            .map_err(|e| crate::Error::Config(format!("Failed to write config: {}", e)))
    }

    /// Reject settings the protocol cannot honour
    pub fn validate(&self) -> Result<(), crate::Error> {
        if self.tube.window_size == 0 {
            return Err(crate::Error::Config("tube.window_size must be positive".into()));
        }
        if self.tube.max_frame_payload == 0
            || self.tube.max_frame_payload + FRAME_HEADER_SIZE > self.muxer.mtu
        {
            return Err(crate::Error::Config(format!(
                "tube.max_frame_payload must be in 1..={}",
                self.muxer.mtu.saturating_sub(FRAME_HEADER_SIZE)
            )));
        }
        if self.muxer.mtu > u16::MAX as usize + FRAME_HEADER_SIZE {
            return Err(crate::Error::Config("muxer.mtu too large".into()));
        }
        if self.tube.retransmit_burst == 0 {
            return Err(crate::Error::Config("tube.retransmit_burst must be positive".into()));
        }
        if self.muxer.outbound_queue == 0 || self.muxer.accept_backlog == 0 {
            return Err(crate::Error::Config("muxer queue sizes must be positive".into()));
        }
        Ok(())
    }
}

/// Per-tube protocol settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TubeConfig {
    /// Receive window advertised to the peer, in frames
    pub window_size: u16,
    /// Largest payload carried by one frame
    pub max_frame_payload: usize,
    /// Interval between repeated open requests
    pub initiate_interval_ms: u64,
    /// RTT assumed before the first sample
    pub initial_rtt_ms: u64,
    /// Floor for the smoothed RTT
    pub min_rtt_ms: u64,
    /// Frames resent per retransmit timeout
    pub retransmit_burst: usize,
    /// Linger time in time-wait
    pub time_wait_ms: u64,
    /// Limit on a local close before the tube is forced closed
    pub close_timeout_ms: u64,
    /// Limit on the open handshake for locally created tubes
    pub handshake_timeout_ms: u64,
    /// Congestion control algorithm (aimd, reno, bbr)
    pub congestion: CongestionAlgorithm,
}

impl Default for TubeConfig {
    fn default() -> Self {
        Self {
            window_size: DEFAULT_WINDOW_SIZE,
            max_frame_payload: MAX_FRAME_DATA_LENGTH,
            initiate_interval_ms: INITIATE_INTERVAL_MS,
            initial_rtt_ms: INITIAL_RTT_MS,
            min_rtt_ms: MIN_RTT_MS,
            retransmit_burst: RETRANSMIT_BURST,
            time_wait_ms: TIME_WAIT_MS,
            close_timeout_ms: CLOSE_TIMEOUT_MS,
            handshake_timeout_ms: HANDSHAKE_TIMEOUT_MS,
            congestion: CongestionAlgorithm::default(),
        }
    }
}

impl TubeConfig {
    pub fn initiate_interval(&self) -> Duration {
        Duration::from_millis(self.initiate_interval_ms)
    }

    pub fn initial_rtt(&self) -> Duration {
        Duration::from_millis(self.initial_rtt_ms)
    }

    pub fn min_rtt(&self) -> Duration {
        Duration::from_millis(self.min_rtt_ms)
    }

    pub fn time_wait(&self) -> Duration {
        Duration::from_millis(self.time_wait_ms)
    }

    pub fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.close_timeout_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }
}

/// Muxer settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MuxerConfig {
    /// Peer-initiated tubes queued for accept
    pub accept_backlog: usize,
    /// Frames queued for the send loop
    pub outbound_queue: usize,
    /// Largest datagram read from or written to the connection
    pub mtu: usize,
    /// Stop the muxer after this long without inbound datagrams (0 = never)
    pub idle_timeout_ms: u64,
    /// Time a stopping muxer waits for tubes to close before forcing them
    pub stop_timeout_ms: u64,
}

impl Default for MuxerConfig {
    fn default() -> Self {
        Self {
            accept_backlog: 128,
            outbound_queue: 1024,
            mtu: DEFAULT_MTU,
            idle_timeout_ms: 0,
            stop_timeout_ms: STOP_TIMEOUT_MS,
        }
    }
}

impl MuxerConfig {
    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_ms > 0).then(|| Duration::from_millis(self.idle_timeout_ms))
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Log format (pretty, compact)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

/// Generate example configuration
pub fn generate_example_config() -> Config {
    Config::default()
}
