//! Application-level protocol messages
//!
//! A [`Message`] is the unit handed to the chunk framing codec: a type
//! id, a message stream id, a timestamp (absolute or delta, the codec
//! decides) and a payload. Command and data payloads are AMF0-encoded.

pub mod amf0;

use bytes::{Bytes, BytesMut};

use crate::config::MetadataConfig;
use amf0::Amf0Value;

/// Message type ids carried in the chunk header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageKind {
    Audio = 8,
    Video = 9,
    Data = 18,
    Command = 20,
}

impl MessageKind {
    pub fn type_id(&self) -> u8 {
        *self as u8
    }

    pub fn from_type_id(value: u8) -> Option<Self> {
        match value {
            8 => Some(MessageKind::Audio),
            9 => Some(MessageKind::Video),
            18 => Some(MessageKind::Data),
            20 => Some(MessageKind::Command),
            _ => None,
        }
    }

    /// Logical chunk stream carrying this kind of message
    pub fn channel(&self) -> ChannelId {
        match self {
            MessageKind::Audio => ChannelId::Audio,
            MessageKind::Video => ChannelId::Video,
            MessageKind::Data | MessageKind::Command => ChannelId::Command,
        }
    }
}

/// Fixed chunk stream ids, one per logical channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ChannelId {
    Command = 3,
    Audio = 4,
    Video = 5,
}

impl ChannelId {
    pub fn id(&self) -> u32 {
        *self as u32
    }

    pub fn from_id(value: u32) -> Option<Self> {
        match value {
            3 => Some(ChannelId::Command),
            4 => Some(ChannelId::Audio),
            5 => Some(ChannelId::Video),
            _ => None,
        }
    }
}

/// An application message before chunking
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub kind: MessageKind,
    pub stream_id: u32,
    /// Milliseconds; absolute for the first message on a channel,
    /// delta afterwards
    pub timestamp: u32,
    pub payload: Bytes,
}

impl Message {
    pub fn audio(stream_id: u32, timestamp: u32, payload: Bytes) -> Self {
        Self {
            kind: MessageKind::Audio,
            stream_id,
            timestamp,
            payload,
        }
    }

    pub fn video(stream_id: u32, timestamp: u32, payload: Bytes) -> Self {
        Self {
            kind: MessageKind::Video,
            stream_id,
            timestamp,
            payload,
        }
    }

    /// AMF0 command message: name, transaction id, null command object,
    /// then the arguments
    pub fn command(stream_id: u32, name: &str, arguments: &[Amf0Value]) -> Self {
        let mut payload = BytesMut::new();
        amf0::encode(&Amf0Value::String(name.to_string()), &mut payload);
        amf0::encode(&Amf0Value::Number(0.0), &mut payload);
        amf0::encode(&Amf0Value::Null, &mut payload);
        for argument in arguments {
            amf0::encode(argument, &mut payload);
        }
        Self {
            kind: MessageKind::Command,
            stream_id,
            timestamp: 0,
            payload: payload.freeze(),
        }
    }

    /// AMF0 data message: handler name followed by its arguments
    pub fn data(stream_id: u32, handler: &str, arguments: &[Amf0Value]) -> Self {
        let mut payload = BytesMut::new();
        amf0::encode(&Amf0Value::String(handler.to_string()), &mut payload);
        for argument in arguments {
            amf0::encode(argument, &mut payload);
        }
        Self {
            kind: MessageKind::Data,
            stream_id,
            timestamp: 0,
            payload: payload.freeze(),
        }
    }

    /// The `@setDataFrame`/`onMetaData` message sent as the first
    /// outbound message of a publish session
    pub fn metadata(stream_id: u32, metadata: &MetadataConfig) -> Self {
        let object = Amf0Value::Object(vec![
            ("width".to_string(), Amf0Value::Number(metadata.width as f64)),
            ("height".to_string(), Amf0Value::Number(metadata.height as f64)),
            ("framerate".to_string(), Amf0Value::Number(metadata.framerate)),
            (
                "videocodecid".to_string(),
                Amf0Value::Number(metadata.video_codec_id as f64),
            ),
            (
                "videodatarate".to_string(),
                Amf0Value::Number(metadata.video_bitrate as f64),
            ),
            (
                "audiocodecid".to_string(),
                Amf0Value::Number(metadata.audio_codec_id as f64),
            ),
            (
                "audiodatarate".to_string(),
                Amf0Value::Number(metadata.audio_bitrate as f64),
            ),
        ]);
        Self::data(
            stream_id,
            "@setDataFrame",
            &[Amf0Value::String("onMetaData".to_string()), object],
        )
    }
}
