//! # RTMP Live Streamer
//!
//! Client-side RTMP publish core: chunked message framing, audio/video
//! muxing, stream lifecycle management, adaptive bitrate control and
//! connection health monitoring.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                      CAPTURE / ENCODE (external)                 │
//! │   ┌──────────────┐                     ┌──────────────┐          │
//! │   │ AAC Encoder  │                     │ AVC Encoder  │          │
//! │   └──────┬───────┘                     └──────┬───────┘          │
//! └──────────┼────────────────────────────────────┼──────────────────┘
//!            │ EncodedSample (payload + pts)      │
//!            ▼                                    ▼
//! ┌──────────────────────────────────────────────────────────────────┐
//! │  Muxer (muxer) — per-channel millisecond timestamp deltas        │
//! │            │                                                     │
//! │            ▼                                                     │
//! │  Chunk Framing Codec (chunk) — Zero/One headers per channel      │
//! │            │                                                     │
//! │            ▼                                                     │
//! │  Transport (transport) — queued writer task, output bitrate      │
//! │            │                                                     │
//! │            ▼  TCP                                                │
//! └──────────────────────────────────────────────────────────────────┘
//!            ▲                                    ▲
//!   ┌────────┴─────────┐                ┌─────────┴────────┐
//!   │ Bitrate control  │◄── telemetry ──┤ Health watchdog  │
//!   │ (bitrate)        │                │ (monitor)        │
//!   └──────────────────┘                └──────────────────┘
//! ```
//!
//! The stream lifecycle state machine (`stream`) ties everything
//! together: `publish`/`play`/`close` sequencing, metadata emission,
//! and starting/stopping the encoders, recorder and control loops.

pub mod bitrate;
pub mod chunk;
pub mod config;
pub mod error;
pub mod event;
pub mod message;
pub mod monitor;
pub mod muxer;
pub mod stream;
pub mod telemetry;
pub mod transport;

pub use error::{Error, Result};
pub use event::{EventLevel, StreamEvent};
pub use stream::{PublishMode, ReadyState, RtmpStream, StreamInfo};

/// Application-wide constants
pub mod constants {
    use std::time::Duration;

    /// Timeout for the connection handshake to complete
    pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

    /// Read window for the inbound drain loop
    pub const DEFAULT_WINDOW_SIZE: usize = 1024;

    /// Maximum payload bytes carried by a single wire chunk
    pub const DEFAULT_CHUNK_SIZE: usize = 128;

    /// Period of the adaptive bitrate control loop
    pub const BITRATE_CHECK_INTERVAL: Duration = Duration::from_secs(2);

    /// Period of the health watchdog
    pub const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(2);

    /// Period of the stream info / fps sampler
    pub const INFO_INTERVAL: Duration = Duration::from_secs(1);

    /// Lowest video bitrate the controller will ever request (bits/s)
    pub const MINIMUM_VIDEO_BITRATE: u64 = 32_000;

    /// Message stream id used before the server assigns one
    pub const DEFAULT_STREAM_ID: u32 = 0;
}
