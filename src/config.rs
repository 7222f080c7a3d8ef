//! Configuration for the streaming core
//!
//! All defaults follow the protocol defaults: 15 second connect
//! timeout, 1 KiB read window, 2 second control loop periods and a
//! 32 kbit/s video bitrate floor.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::constants::*;
use crate::error::{Error, Result};

/// Transport layer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Seconds to wait for the handshake before firing the timeout event
    pub connect_timeout_secs: u64,

    /// Read window size in bytes for the inbound drain loop
    pub window_size: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: DEFAULT_CONNECT_TIMEOUT.as_secs(),
            window_size: DEFAULT_WINDOW_SIZE,
        }
    }
}

impl TransportConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

/// Adaptive bitrate controller configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BitrateConfig {
    /// Control loop period in seconds
    pub check_interval_secs: u64,

    /// Lowest bitrate the controller will request (bits/s)
    pub minimum_bitrate: u64,

    /// Initial ceiling for the requested bitrate (bits/s)
    pub maximum_bitrate: u64,

    /// Bitrate configured on the encoder at publish start (bits/s)
    pub initial_bitrate: u64,
}

impl Default for BitrateConfig {
    fn default() -> Self {
        Self {
            check_interval_secs: BITRATE_CHECK_INTERVAL.as_secs(),
            minimum_bitrate: MINIMUM_VIDEO_BITRATE,
            maximum_bitrate: 2_500_000,
            initial_bitrate: 1_000_000,
        }
    }
}

impl BitrateConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }
}

/// Health watchdog configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Watchdog period in seconds
    pub interval_secs: u64,

    /// Optional grace period before alarms are evaluated
    pub start_after_secs: Option<u64>,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval_secs: HEALTH_CHECK_INTERVAL.as_secs(),
            start_after_secs: None,
        }
    }
}

impl MonitorConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn start_after(&self) -> Option<Duration> {
        self.start_after_secs.map(Duration::from_secs)
    }
}

/// Metadata sent as the first message of a publish session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetadataConfig {
    pub width: u32,
    pub height: u32,
    pub framerate: f64,
    /// FLV codec id for video (7 = AVC)
    pub video_codec_id: u8,
    /// FLV codec id for audio (10 = AAC)
    pub audio_codec_id: u8,
    /// Video data rate in bits/s
    pub video_bitrate: u64,
    /// Audio data rate in bits/s
    pub audio_bitrate: u64,
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            framerate: 30.0,
            video_codec_id: 7,
            audio_codec_id: 10,
            video_bitrate: 1_000_000,
            audio_bitrate: 128_000,
        }
    }
}

/// Top-level configuration for a publish stream
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    pub transport: TransportConfig,
    pub bitrate: BitrateConfig,
    pub monitor: MonitorConfig,
    pub metadata: MetadataConfig,
    /// Maximum payload bytes carried by a single wire chunk
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
}

// Manual impl: the serde default attribute covers deserialization only,
// a derived Default would zero chunk_size
impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            transport: TransportConfig::default(),
            bitrate: BitrateConfig::default(),
            monitor: MonitorConfig::default(),
            metadata: MetadataConfig::default(),
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

fn default_chunk_size() -> usize {
    DEFAULT_CHUNK_SIZE
}

impl StreamConfig {
    /// Load configuration from a JSON file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        serde_json::from_str(&contents).map_err(|e| Error::Config(e.to_string()))
    }

    /// Write configuration to a JSON file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let contents =
            serde_json::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))?;
        std::fs::write(path, contents)?;
        Ok(())
    }
}
