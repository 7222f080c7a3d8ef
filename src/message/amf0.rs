//! Minimal AMF0 value codec
//!
//! Covers the value types the publish path actually sends: numbers,
//! booleans, strings, anonymous objects and null. Decoding exists for
//! the same subset so command payloads can be inspected in tests and
//! by a caller-side response parser.

use bytes::{BufMut, BytesMut};

use crate::error::ProtocolError;

const MARKER_NUMBER: u8 = 0x00;
const MARKER_BOOLEAN: u8 = 0x01;
const MARKER_STRING: u8 = 0x02;
const MARKER_OBJECT: u8 = 0x03;
const MARKER_NULL: u8 = 0x05;
const MARKER_OBJECT_END: u8 = 0x09;

/// An AMF0 value
#[derive(Debug, Clone, PartialEq)]
pub enum Amf0Value {
    Number(f64),
    Boolean(bool),
    String(String),
    /// Key/value pairs in insertion order
    Object(Vec<(String, Amf0Value)>),
    Null,
}

/// Serialize a value into the buffer
pub fn encode(value: &Amf0Value, buffer: &mut BytesMut) {
    match value {
        Amf0Value::Number(number) => {
            buffer.put_u8(MARKER_NUMBER);
            buffer.put_f64(*number);
        }
        Amf0Value::Boolean(flag) => {
            buffer.put_u8(MARKER_BOOLEAN);
            buffer.put_u8(u8::from(*flag));
        }
        Amf0Value::String(string) => {
            buffer.put_u8(MARKER_STRING);
            put_utf8(string, buffer);
        }
        Amf0Value::Object(fields) => {
            buffer.put_u8(MARKER_OBJECT);
            for (key, field) in fields {
                put_utf8(key, buffer);
                encode(field, buffer);
            }
            buffer.put_u16(0);
            buffer.put_u8(MARKER_OBJECT_END);
        }
        Amf0Value::Null => {
            buffer.put_u8(MARKER_NULL);
        }
    }
}

fn put_utf8(string: &str, buffer: &mut BytesMut) {
    buffer.put_u16(string.len() as u16);
    buffer.put_slice(string.as_bytes());
}

/// Decode one value from the front of the slice, advancing it
pub fn decode(input: &mut &[u8]) -> Result<Amf0Value, ProtocolError> {
    let marker = take_u8(input)?;
    match marker {
        MARKER_NUMBER => {
            let raw = take(input, 8)?;
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(raw);
            Ok(Amf0Value::Number(f64::from_be_bytes(bytes)))
        }
        MARKER_BOOLEAN => Ok(Amf0Value::Boolean(take_u8(input)? != 0)),
        MARKER_STRING => Ok(Amf0Value::String(take_utf8(input)?)),
        MARKER_OBJECT => {
            let mut fields = Vec::new();
            loop {
                let key = take_utf8(input)?;
                if key.is_empty() {
                    let end = take_u8(input)?;
                    if end != MARKER_OBJECT_END {
                        return Err(ProtocolError::UnsupportedAmf0Marker(end));
                    }
                    break;
                }
                let value = decode(input)?;
                fields.push((key, value));
            }
            Ok(Amf0Value::Object(fields))
        }
        MARKER_NULL => Ok(Amf0Value::Null),
        other => Err(ProtocolError::UnsupportedAmf0Marker(other)),
    }
}

fn take<'a>(input: &mut &'a [u8], count: usize) -> Result<&'a [u8], ProtocolError> {
    if input.len() < count {
        return Err(ProtocolError::TruncatedAmf0);
    }
    let (head, tail) = input.split_at(count);
    *input = tail;
    Ok(head)
}

fn take_u8(input: &mut &[u8]) -> Result<u8, ProtocolError> {
    Ok(take(input, 1)?[0])
}

fn take_utf8(input: &mut &[u8]) -> Result<String, ProtocolError> {
    let raw = take(input, 2)?;
    let length = u16::from_be_bytes([raw[0], raw[1]]) as usize;
    let bytes = take(input, length)?;
    String::from_utf8(bytes.to_vec()).map_err(|_| ProtocolError::InvalidAmf0String)
}
