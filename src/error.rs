//! Error types for the streaming core

use thiserror::Error;

/// Main error type for the library
#[derive(Error, Debug)]
pub enum Error {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Stream error: {0}")]
    Stream(#[from] StreamError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Byte-stream transport errors
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("Connect timeout after {0} seconds")]
    Timeout(u64),
}

/// Wire protocol errors
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Unsupported RTMP version: {0}")]
    UnsupportedVersion(u8),

    #[error("Unknown message type id: {0}")]
    UnknownMessageType(u8),

    #[error("Unknown chunk stream id: {0}")]
    UnknownChunkStream(u32),

    #[error("Unsupported chunk format: {0}")]
    UnsupportedChunkFormat(u8),

    #[error("Delta chunk received before a full header on channel {0}")]
    DeltaWithoutFullHeader(u32),

    #[error("AMF0 marker not supported: 0x{0:02x}")]
    UnsupportedAmf0Marker(u8),

    #[error("AMF0 value truncated")]
    TruncatedAmf0,

    #[error("Invalid UTF-8 in AMF0 string")]
    InvalidAmf0String,
}

/// Stream lifecycle errors
#[derive(Error, Debug)]
pub enum StreamError {
    #[error("Stream is closed")]
    Closed,

    #[error("Timed out waiting for the stream to become ready")]
    ReadyTimeout,
}

/// Result type alias for the library
pub type Result<T> = std::result::Result<T, Error>;
