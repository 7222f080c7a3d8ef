//! Status and error events surfaced to callers
//!
//! Events keep the NetStream/NetConnection code-string contract so
//! existing consumers can keep matching on `code()` and `level()`,
//! while carrying structured payload fields.

use crate::monitor::Problem;

/// Severity attached to every event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventLevel {
    Status,
    Error,
    Warning,
}

impl EventLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventLevel::Status => "status",
            EventLevel::Error => "error",
            EventLevel::Warning => "warning",
        }
    }
}

/// Events emitted by the stream, transport and control loops
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// Publish command accepted; the stream entered `Publishing`
    PublishStart { name: String },
    /// Publish stopped by the caller
    UnpublishSuccess { name: Option<String> },
    /// Play command sent
    PlayStart { name: String },
    /// The transport tore down after an error or end-of-stream
    ConnectClosed,
    /// The handshake did not complete within the configured timeout
    ConnectTimeout { seconds: u64 },
    /// The controller pushed a new target bitrate to the encoder
    BitrateChanged { bitrate: u64, detail: String },
    /// The controller lowered the bitrate ceiling itself
    MaximumBitrateChanged { maximum_bitrate: u64 },
    /// Sustained queue growth with the bitrate already at its floor
    NotEnoughBandwidth { detail: String },
    /// The watchdog found a stalled stage this tick
    PublishingBroken { problem: Problem, status: String },
    /// The watchdog's derived status string changed
    StatusChanged { status: Option<String> },
}

impl StreamEvent {
    /// Stable code string for external consumers
    pub fn code(&self) -> &'static str {
        match self {
            StreamEvent::PublishStart { .. } => "NetStream.Publish.Start",
            StreamEvent::UnpublishSuccess { .. } => "NetStream.Unpublish.Success",
            StreamEvent::PlayStart { .. } => "NetStream.Play.Start",
            StreamEvent::ConnectClosed => "NetConnection.Connect.Closed",
            StreamEvent::ConnectTimeout { .. } => "NetConnection.Connect.Failed",
            StreamEvent::BitrateChanged { .. } => "NetConnection.Connect.BitrateChanged",
            StreamEvent::MaximumBitrateChanged { .. } => {
                "NetConnection.Connect.MaximumBitrateChanged"
            }
            StreamEvent::NotEnoughBandwidth { .. } => {
                "NetConnection.Connect.NotEnoughBandwidth"
            }
            StreamEvent::PublishingBroken { .. } => "NetStream.Publish.Broken",
            StreamEvent::StatusChanged { .. } => "NetStream.Publish.StatusChanged",
        }
    }

    pub fn level(&self) -> EventLevel {
        match self {
            StreamEvent::ConnectClosed | StreamEvent::ConnectTimeout { .. } => EventLevel::Error,
            StreamEvent::NotEnoughBandwidth { .. } | StreamEvent::PublishingBroken { .. } => {
                EventLevel::Warning
            }
            _ => EventLevel::Status,
        }
    }

    /// Human readable description
    pub fn description(&self) -> String {
        match self {
            StreamEvent::PublishStart { name } => format!("Started publishing {name}"),
            StreamEvent::UnpublishSuccess { name } => match name {
                Some(name) => format!("Stopped publishing {name}"),
                None => "Stopped publishing".to_string(),
            },
            StreamEvent::PlayStart { name } => format!("Started playing {name}"),
            StreamEvent::ConnectClosed => "Connection closed".to_string(),
            StreamEvent::ConnectTimeout { seconds } => {
                format!("Connection timed out after {seconds} seconds")
            }
            StreamEvent::BitrateChanged { bitrate, detail } => {
                format!("New video bitrate: {} kbit/s, {detail}", bitrate / 1024)
            }
            StreamEvent::MaximumBitrateChanged { maximum_bitrate } => {
                format!("Maximum bitrate changed: {} kbit/s", maximum_bitrate / 1024)
            }
            StreamEvent::NotEnoughBandwidth { detail } => detail.clone(),
            StreamEvent::PublishingBroken { problem, status } => {
                format!("Publishing is broken ({problem:?}): {status}")
            }
            StreamEvent::StatusChanged { status } => {
                status.clone().unwrap_or_else(|| "OK".to_string())
            }
        }
    }
}
