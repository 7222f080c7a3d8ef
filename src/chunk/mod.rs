//! Chunk framing codec
//!
//! Splits application messages into bounded wire chunks and tracks
//! per-channel header-compression state.
//!
//! Wire layout:
//!
//! ```text
//! basic header   1 byte    fmt << 6 | chunk stream id
//! full header    11 bytes  timestamp(3, BE) length(3, BE) type(1) stream id(4, LE)
//! delta header   3 bytes   timestamp delta(3, BE)
//! continuation   0 bytes   fmt = 3, payload continues
//! ```
//!
//! The first message on a channel since the last reset always carries a
//! full header. Later messages whose length, type and stream id match
//! the channel's previous message carry a delta header that reuses
//! them; when any of the three change the channel drops back to a full
//! header. Since the delta header holds nothing but the timestamp,
//! only channels with steady payload sizes (constant-bitrate audio
//! frames, fixed-size data messages) get the compressed form; media
//! whose frame sizes vary re-sends full headers. A reset (publish stop
//! or restart) clears all channel state so the next message starts
//! full again.

use bytes::{BufMut, Bytes, BytesMut};
use std::collections::HashMap;

use crate::error::ProtocolError;
use crate::message::{ChannelId, Message, MessageKind};

/// Header kind for the first chunk of a message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ChunkType {
    /// Full header: absolute timestamp, length, type id, stream id
    Zero = 0,
    /// Delta header: timestamp delta only
    One = 1,
}

/// Wire format value for continuation chunks of a split message
const FMT_CONTINUATION: u8 = 3;

/// Largest timestamp representable in a 24-bit header field
const TIMESTAMP_MAX: u32 = 0xFF_FFFF;

#[derive(Debug, Clone, Copy)]
struct EncoderChannel {
    /// Fields a delta header would reuse from the previous message
    kind: MessageKind,
    stream_id: u32,
    length: usize,
}

/// Serializes messages into wire chunks
pub struct ChunkEncoder {
    chunk_size: usize,
    channels: HashMap<ChannelId, EncoderChannel>,
}

impl ChunkEncoder {
    pub fn new(chunk_size: usize) -> Self {
        Self {
            // Splitting requires a positive chunk size
            chunk_size: chunk_size.max(1),
            channels: HashMap::new(),
        }
    }

    /// Maximum payload bytes per chunk
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Forget all per-channel state; the next message on every channel
    /// will carry a full header
    pub fn reset(&mut self) {
        self.channels.clear();
    }

    /// Header kind the next message on `channel` would use, assuming
    /// its length, type and stream id repeat
    pub fn next_chunk_type(&self, channel: ChannelId) -> ChunkType {
        match self.channels.get(&channel) {
            Some(_) => ChunkType::One,
            None => ChunkType::Zero,
        }
    }

    fn chunk_type_for(&self, message: &Message) -> ChunkType {
        match self.channels.get(&message.kind.channel()) {
            Some(state)
                if state.kind == message.kind
                    && state.stream_id == message.stream_id
                    && state.length == message.payload.len() =>
            {
                ChunkType::One
            }
            _ => ChunkType::Zero,
        }
    }

    /// Encode a message into one or more chunks
    pub fn encode(&mut self, message: &Message) -> Bytes {
        let channel = message.kind.channel();
        let chunk_type = self.chunk_type_for(message);
        self.channels.insert(
            channel,
            EncoderChannel {
                kind: message.kind,
                stream_id: message.stream_id,
                length: message.payload.len(),
            },
        );

        let timestamp = message.timestamp.min(TIMESTAMP_MAX);
        let payload = &message.payload;
        let header_len = match chunk_type {
            ChunkType::Zero => 12,
            ChunkType::One => 4,
        };
        let continuation_count = if payload.is_empty() {
            0
        } else {
            (payload.len() - 1) / self.chunk_size
        };
        let mut wire = BytesMut::with_capacity(header_len + payload.len() + continuation_count);

        wire.put_u8((chunk_type as u8) << 6 | basic_stream_bits(channel.id()));
        match chunk_type {
            ChunkType::Zero => {
                put_u24(&mut wire, timestamp);
                put_u24(&mut wire, payload.len() as u32);
                wire.put_u8(message.kind.type_id());
                wire.put_u32_le(message.stream_id);
            }
            ChunkType::One => {
                put_u24(&mut wire, timestamp);
            }
        }

        let mut offset = 0;
        let mut first = true;
        while offset < payload.len() || first {
            if !first {
                wire.put_u8(FMT_CONTINUATION << 6 | basic_stream_bits(channel.id()));
            }
            let take = self.chunk_size.min(payload.len() - offset);
            wire.put_slice(&payload[offset..offset + take]);
            offset += take;
            first = false;
        }

        wire.freeze()
    }
}

fn basic_stream_bits(chunk_stream_id: u32) -> u8 {
    (chunk_stream_id & 0x3F) as u8
}

fn put_u24(buffer: &mut BytesMut, value: u32) {
    buffer.put_u8((value >> 16) as u8);
    buffer.put_u8((value >> 8) as u8);
    buffer.put_u8(value as u8);
}

/// A reassembled message with its accumulated absolute timestamp
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedMessage {
    pub channel: ChannelId,
    pub kind: MessageKind,
    pub stream_id: u32,
    /// Absolute milliseconds, deltas accumulated per channel
    pub timestamp: u32,
    pub payload: Bytes,
}

struct DecoderChannel {
    kind: MessageKind,
    stream_id: u32,
    length: usize,
    /// Last known absolute timestamp
    timestamp: u32,
    /// Payload being reassembled across continuation chunks
    partial: BytesMut,
}

/// Reassembles chunks back into messages, the inverse of [`ChunkEncoder`]
pub struct ChunkDecoder {
    chunk_size: usize,
    buffer: BytesMut,
    channels: HashMap<ChannelId, DecoderChannel>,
}

impl ChunkDecoder {
    pub fn new(chunk_size: usize) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
            buffer: BytesMut::new(),
            channels: HashMap::new(),
        }
    }

    /// Feed wire bytes; returns every message completed by them
    pub fn push(&mut self, data: &[u8]) -> Result<Vec<DecodedMessage>, ProtocolError> {
        self.buffer.extend_from_slice(data);
        let mut messages = Vec::new();
        while let Some(message) = self.try_decode_one()? {
            if let Some(message) = message {
                messages.push(message);
            }
        }
        Ok(messages)
    }

    /// Attempt to consume one chunk from the buffer.
    /// `Ok(None)` means more bytes are needed; `Ok(Some(None))` means a
    /// chunk was consumed without completing a message.
    #[allow(clippy::type_complexity)]
    fn try_decode_one(&mut self) -> Result<Option<Option<DecodedMessage>>, ProtocolError> {
        if self.buffer.is_empty() {
            return Ok(None);
        }
        let basic = self.buffer[0];
        let fmt = basic >> 6;
        let channel = ChannelId::from_id((basic & 0x3F) as u32)
            .ok_or(ProtocolError::UnknownChunkStream((basic & 0x3F) as u32))?;

        let header_len = match fmt {
            0 => 12,
            1 => 4,
            FMT_CONTINUATION => 1,
            other => return Err(ProtocolError::UnsupportedChunkFormat(other)),
        };
        if self.buffer.len() < header_len {
            return Ok(None);
        }

        if fmt == 0 {
            let timestamp = read_u24(&self.buffer[1..4]);
            let length = read_u24(&self.buffer[4..7]) as usize;
            let kind = MessageKind::from_type_id(self.buffer[7])
                .ok_or(ProtocolError::UnknownMessageType(self.buffer[7]))?;
            let stream_id = u32::from_le_bytes([
                self.buffer[8],
                self.buffer[9],
                self.buffer[10],
                self.buffer[11],
            ]);
            let take = self.chunk_size.min(length);
            if self.buffer.len() < header_len + take {
                return Ok(None);
            }
            let _ = self.buffer.split_to(header_len);
            let payload = self.buffer.split_to(take);
            let mut state = DecoderChannel {
                kind,
                stream_id,
                length,
                timestamp,
                partial: BytesMut::from(&payload[..]),
            };
            let complete = complete_if_done(&mut state);
            self.channels.insert(channel, state);
            return Ok(Some(complete));
        }

        // Delta and continuation chunks require prior channel state
        let state = self
            .channels
            .get(&channel)
            .ok_or(ProtocolError::DeltaWithoutFullHeader(channel.id()))?;
        let remaining = if fmt == 1 {
            state.length
        } else {
            state.length - state.partial.len()
        };
        let take = self.chunk_size.min(remaining);
        if self.buffer.len() < header_len + take {
            return Ok(None);
        }

        let delta = if fmt == 1 {
            read_u24(&self.buffer[1..4])
        } else {
            0
        };
        let _ = self.buffer.split_to(header_len);
        let payload = self.buffer.split_to(take);
        let state = self
            .channels
            .get_mut(&channel)
            .ok_or(ProtocolError::DeltaWithoutFullHeader(channel.id()))?;
        if fmt == 1 {
            state.timestamp = state.timestamp.wrapping_add(delta);
            state.partial = BytesMut::from(&payload[..]);
        } else {
            state.partial.extend_from_slice(&payload);
        }
        Ok(Some(complete_if_done(state)))
    }
}

fn complete_if_done(state: &mut DecoderChannel) -> Option<DecodedMessage> {
    if state.partial.len() < state.length {
        return None;
    }
    let payload = std::mem::take(&mut state.partial).freeze();
    Some(DecodedMessage {
        channel: state.kind.channel(),
        kind: state.kind,
        stream_id: state.stream_id,
        timestamp: state.timestamp,
        payload,
    })
}

fn read_u24(bytes: &[u8]) -> u32 {
    (bytes[0] as u32) << 16 | (bytes[1] as u32) << 8 | bytes[2] as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    fn audio(timestamp: u32, payload: &[u8]) -> Message {
        Message::audio(1, timestamp, Bytes::copy_from_slice(payload))
    }

    #[test]
    fn test_first_message_uses_full_header() {
        let mut encoder = ChunkEncoder::new(128);
        assert_eq!(encoder.next_chunk_type(ChannelId::Audio), ChunkType::Zero);

        let wire = encoder.encode(&audio(0, &[1, 2, 3]));
        assert_eq!(wire[0] >> 6, 0);
        assert_eq!(wire[0] & 0x3F, 4);
        // timestamp(3) + length(3) + type(1) + stream id(4)
        assert_eq!(read_u24(&wire[4..7]), 3);
        assert_eq!(wire[7], 8);
        assert_eq!(&wire[8..12], &1u32.to_le_bytes());
        assert_eq!(&wire[12..], &[1, 2, 3]);
    }

    #[test]
    fn test_subsequent_messages_use_delta_headers() {
        let mut encoder = ChunkEncoder::new(128);
        encoder.encode(&audio(0, &[0; 4]));
        for _ in 0..5 {
            let wire = encoder.encode(&audio(23, &[0; 4]));
            assert_eq!(wire[0] >> 6, ChunkType::One as u8);
            assert_eq!(read_u24(&wire[1..4]), 23);
            assert_eq!(wire.len(), 4 + 4);
        }
    }

    #[test]
    fn test_reset_restores_full_header() {
        let mut encoder = ChunkEncoder::new(128);
        encoder.encode(&audio(0, &[0; 4]));
        assert_eq!(encoder.next_chunk_type(ChannelId::Audio), ChunkType::One);
        encoder.reset();
        assert_eq!(encoder.next_chunk_type(ChannelId::Audio), ChunkType::Zero);
        let wire = encoder.encode(&audio(0, &[0; 4]));
        assert_eq!(wire[0] >> 6, ChunkType::Zero as u8);
    }

    #[test]
    fn test_channels_track_state_independently() {
        let mut encoder = ChunkEncoder::new(128);
        encoder.encode(&audio(0, &[0; 4]));
        let wire = encoder.encode(&Message::video(1, 0, Bytes::from_static(&[0; 4])));
        // Video channel had not sent a full header yet
        assert_eq!(wire[0] >> 6, ChunkType::Zero as u8);
        assert_eq!(wire[0] & 0x3F, 5);
    }

    #[test]
    fn test_default_config_chunk_size_encodes() {
        let config = crate::config::StreamConfig::default();
        assert_eq!(config.chunk_size, 128);
        let mut encoder = ChunkEncoder::new(config.chunk_size);
        let wire = encoder.encode(&audio(0, &[0xCD; 300]));
        assert_eq!(wire.len(), 12 + 300 + 2);
    }

    #[test]
    fn test_zero_chunk_size_is_clamped() {
        let mut encoder = ChunkEncoder::new(0);
        assert_eq!(encoder.chunk_size(), 1);
        // One payload byte per chunk, one continuation marker
        let wire = encoder.encode(&audio(0, &[1, 2]));
        assert_eq!(wire.len(), 12 + 2 + 1);
    }

    #[test]
    fn test_changed_length_falls_back_to_full_header() {
        let mut encoder = ChunkEncoder::new(128);
        let mut decoder = ChunkDecoder::new(128);

        // Command and data messages share a channel but differ in
        // length and type, so each needs its own full header
        let mut wire = BytesMut::new();
        wire.extend_from_slice(&encoder.encode(&Message::command(1, "publish", &[])));
        wire.extend_from_slice(&encoder.encode(&Message::data(1, "@setDataFrame", &[])));

        let messages = decoder.push(&wire).unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].kind, MessageKind::Command);
        assert_eq!(messages[1].kind, MessageKind::Data);
    }

    #[test]
    fn test_large_message_splits_with_continuation_chunks() {
        let mut encoder = ChunkEncoder::new(128);
        let payload = vec![0xAB; 300];
        let wire = encoder.encode(&audio(0, &payload));
        // 12-byte full header, two continuation markers
        assert_eq!(wire.len(), 12 + 300 + 2);
        assert_eq!(wire[12 + 128] >> 6, FMT_CONTINUATION);
        assert_eq!(wire[12 + 128 + 1 + 128] >> 6, FMT_CONTINUATION);
    }

    #[test]
    fn test_decoder_round_trip_accumulates_deltas() {
        let mut encoder = ChunkEncoder::new(128);
        let mut decoder = ChunkDecoder::new(128);

        let mut wire = BytesMut::new();
        wire.extend_from_slice(&encoder.encode(&audio(0, &[1; 8])));
        wire.extend_from_slice(&encoder.encode(&audio(33, &[2; 8])));
        wire.extend_from_slice(&encoder.encode(&audio(34, &[3; 8])));

        let messages = decoder.push(&wire).unwrap();
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0].timestamp, 0);
        assert_eq!(messages[1].timestamp, 33);
        assert_eq!(messages[2].timestamp, 67);
        assert_eq!(messages[2].payload, Bytes::from_static(&[3; 8]));
        assert_eq!(messages[0].kind, MessageKind::Audio);
        assert_eq!(messages[0].stream_id, 1);
    }

    #[test]
    fn test_decoder_reassembles_split_message() {
        let mut encoder = ChunkEncoder::new(128);
        let mut decoder = ChunkDecoder::new(128);
        let payload = (0..=255u8).cycle().take(300).collect::<Vec<_>>();

        let wire = encoder.encode(&audio(0, &payload));
        // Feed byte by byte to exercise partial-buffer handling
        let mut messages = Vec::new();
        for byte in wire.iter() {
            messages.extend(decoder.push(&[*byte]).unwrap());
        }
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].payload.len(), 300);
        assert_eq!(&messages[0].payload[..], &payload[..]);
    }

    #[test]
    fn test_decoder_rejects_delta_before_full() {
        let mut decoder = ChunkDecoder::new(128);
        // fmt=1 on the audio channel with no prior full header
        let wire = [1u8 << 6 | 4, 0, 0, 10];
        assert!(matches!(
            decoder.push(&wire),
            Err(ProtocolError::DeltaWithoutFullHeader(4))
        ));
    }
}
