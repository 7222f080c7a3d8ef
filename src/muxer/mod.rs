//! Audio/video muxer
//!
//! Converts encoder output (compressed sample + presentation timestamp
//! in seconds) into tagged protocol messages whose timestamps are
//! integer millisecond deltas relative to the previous message on the
//! same channel.
//!
//! Truncating each delta to whole milliseconds would drift over time
//! (a 30 fps stream produces 33.333 ms deltas), so the fractional part
//! of the running timestamp is carried into the next delta:
//! `new = delta + fract(previous)`.

use bytes::Bytes;

use crate::message::Message;

/// Media channel of an encoded sample
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaChannel {
    Audio,
    Video,
}

/// A compressed sample handed over by an external encoder
#[derive(Debug, Clone)]
pub struct EncodedSample {
    pub channel: MediaChannel,
    pub payload: Bytes,
    /// Presentation timestamp in seconds, monotonic per channel
    pub pts: f64,
}

#[derive(Debug, Default)]
struct ChannelTrack {
    /// Previous presentation timestamp in seconds
    last_pts: Option<f64>,
    /// Running timestamp in milliseconds, fraction carried forward
    timestamp: f64,
}

impl ChannelTrack {
    fn advance(&mut self, pts: f64) -> u32 {
        let delta_ms = match self.last_pts {
            Some(previous) => ((pts - previous).max(0.0)) * 1000.0,
            None => 0.0,
        };
        self.last_pts = Some(pts);
        self.timestamp = delta_ms + self.timestamp.fract();
        self.timestamp as u32
    }
}

/// Tags encoded samples as audio/video messages
pub struct Muxer {
    /// Message stream id assigned by the server
    stream_id: u32,
    audio: ChannelTrack,
    video: ChannelTrack,
}

impl Muxer {
    pub fn new() -> Self {
        Self {
            stream_id: crate::constants::DEFAULT_STREAM_ID,
            audio: ChannelTrack::default(),
            video: ChannelTrack::default(),
        }
    }

    pub fn set_stream_id(&mut self, stream_id: u32) {
        self.stream_id = stream_id;
    }

    pub fn stream_id(&self) -> u32 {
        self.stream_id
    }

    /// Drop timestamp state; the next sample on each channel starts a
    /// fresh delta sequence (required after a publish restart)
    pub fn reset(&mut self) {
        self.audio = ChannelTrack::default();
        self.video = ChannelTrack::default();
    }

    /// Convert a sample into a tagged message
    pub fn tag(&mut self, sample: EncodedSample) -> Message {
        match sample.channel {
            MediaChannel::Audio => {
                let timestamp = self.audio.advance(sample.pts);
                Message::audio(self.stream_id, timestamp, sample.payload)
            }
            MediaChannel::Video => {
                let timestamp = self.video.advance(sample.pts);
                Message::video(self.stream_id, timestamp, sample.payload)
            }
        }
    }
}

impl Default for Muxer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageKind;

    fn sample(channel: MediaChannel, pts: f64) -> EncodedSample {
        EncodedSample {
            channel,
            payload: Bytes::from_static(&[0; 16]),
            pts,
        }
    }

    #[test]
    fn test_first_sample_has_zero_timestamp() {
        let mut muxer = Muxer::new();
        let message = muxer.tag(sample(MediaChannel::Audio, 12.5));
        assert_eq!(message.timestamp, 0);
        assert_eq!(message.kind, MessageKind::Audio);
    }

    #[test]
    fn test_channels_are_independent() {
        let mut muxer = Muxer::new();
        muxer.tag(sample(MediaChannel::Audio, 1.0));
        muxer.tag(sample(MediaChannel::Audio, 1.5));
        // First video sample still starts at zero
        let message = muxer.tag(sample(MediaChannel::Video, 2.0));
        assert_eq!(message.timestamp, 0);
        assert_eq!(message.kind, MessageKind::Video);
    }

    #[test]
    fn test_fractional_carry_has_no_drift_at_30_fps() {
        let mut muxer = Muxer::new();
        let mut accumulated: u64 = 0;
        let frame = 1.0 / 30.0;
        for i in 0..=1000 {
            let message = muxer.tag(sample(MediaChannel::Video, i as f64 * frame));
            accumulated += message.timestamp as u64;
        }
        let wall_ms = (1000.0 * frame * 1000.0) as i64;
        assert!((accumulated as i64 - wall_ms).abs() <= 1);
    }

    #[test]
    fn test_repeated_pts_yields_zero_deltas() {
        let mut muxer = Muxer::new();
        muxer.tag(sample(MediaChannel::Audio, 100.2));
        let second = muxer.tag(sample(MediaChannel::Audio, 100.2));
        let third = muxer.tag(sample(MediaChannel::Audio, 100.2));
        assert_eq!(second.timestamp, 0);
        assert_eq!(third.timestamp, 0);
    }

    #[test]
    fn test_reset_restarts_delta_sequence() {
        let mut muxer = Muxer::new();
        muxer.tag(sample(MediaChannel::Audio, 1.0));
        let message = muxer.tag(sample(MediaChannel::Audio, 2.0));
        assert_eq!(message.timestamp, 1000);

        muxer.reset();
        let message = muxer.tag(sample(MediaChannel::Audio, 3.0));
        assert_eq!(message.timestamp, 0);
    }

    #[test]
    fn test_non_monotonic_pts_clamps_to_zero_delta() {
        let mut muxer = Muxer::new();
        muxer.tag(sample(MediaChannel::Audio, 5.0));
        let message = muxer.tag(sample(MediaChannel::Audio, 4.0));
        assert_eq!(message.timestamp, 0);
    }
}
