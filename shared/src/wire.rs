//! Field-level wire primitives for the sync channel
//!
//! Every envelope is a flat sequence of fields written one after another in
//! the layout of a Java `DataOutput` stream, so plugins on either side of the
//! proxy can read each other's payloads:
//!
//! - strings are a big-endian u16 byte length followed by modified UTF-8
//! - `i32`, `i64` and `bool` are big-endian fixed width
//!
//! Scalars go through bincode's big-endian fixint configuration with a size
//! limit so a corrupt field can never trigger a huge allocation.

use bincode::Options;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

/// Largest payload the carrier transport will relay in one piece
pub const MAX_PAYLOAD_LEN: usize = 32 * 1024;

/// Longest encoded string a u16 length prefix can describe
pub const MAX_STRING_LEN: usize = u16::MAX as usize;

/// Errors raised while encoding or decoding envelopes
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("malformed field `{field}`: {source}")]
    Field {
        field: &'static str,
        #[source]
        source: bincode::Error,
    },
    #[error("failed to encode field `{field}`: {source}")]
    Encode {
        field: &'static str,
        #[source]
        source: bincode::Error,
    },
    #[error("field `{field}` encodes to {len} bytes, more than {MAX_STRING_LEN}")]
    StringTooLong { field: &'static str, len: usize },
    #[error("field `{field}` needs {needed} bytes but only {available} remain")]
    Truncated {
        field: &'static str,
        needed: usize,
        available: usize,
    },
    #[error("field `{field}` is not valid modified UTF-8")]
    InvalidText { field: &'static str },
    #[error("unknown envelope kind `{0}`")]
    UnknownKind(String),
    #[error("invalid correlation id `{0}`")]
    InvalidCorrelationId(String),
    #[error("negative field count {0}")]
    NegativeFieldCount(i32),
    #[error("too many fields: {0}")]
    TooManyFields(usize),
    #[error("payload of {0} bytes exceeds the carrier limit")]
    PayloadTooLarge(usize),
}

fn options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_big_endian()
        .with_fixint_encoding()
        .with_limit(MAX_PAYLOAD_LEN as u64)
}

/// Java's modified UTF-8: UTF-16 code units, NUL as two bytes, no 4-byte forms
fn encode_modified_utf8(value: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(value.len());
    for unit in value.encode_utf16() {
        match unit {
            0x0001..=0x007F => out.push(unit as u8),
            0x0000 | 0x0080..=0x07FF => {
                out.push(0xC0 | (unit >> 6) as u8);
                out.push(0x80 | (unit & 0x3F) as u8);
            }
            _ => {
                out.push(0xE0 | (unit >> 12) as u8);
                out.push(0x80 | ((unit >> 6) & 0x3F) as u8);
                out.push(0x80 | (unit & 0x3F) as u8);
            }
        }
    }
    out
}

fn decode_modified_utf8(bytes: &[u8]) -> Option<String> {
    let continuation = |b: u8| (b & 0xC0 == 0x80).then_some(u16::from(b & 0x3F));

    let mut units = Vec::with_capacity(bytes.len());
    let mut iter = bytes.iter().copied();
    while let Some(lead) = iter.next() {
        let unit = match lead {
            0x01..=0x7F => u16::from(lead),
            _ if lead & 0xE0 == 0xC0 => {
                (u16::from(lead & 0x1F) << 6) | continuation(iter.next()?)?
            }
            _ if lead & 0xF0 == 0xE0 => {
                let high = continuation(iter.next()?)?;
                let low = continuation(iter.next()?)?;
                (u16::from(lead & 0x0F) << 12) | (high << 6) | low
            }
            _ => return None,
        };
        units.push(unit);
    }
    String::from_utf16(&units).ok()
}

/// Appends fields to an outgoing payload
#[derive(Debug, Default)]
pub struct WireWriter {
    buf: Vec<u8>,
}

impl WireWriter {
    pub fn new() -> Self {
        Self::default()
    }

    fn write<T: Serialize + ?Sized>(
        &mut self,
        field: &'static str,
        value: &T,
    ) -> Result<(), CodecError> {
        options()
            .serialize_into(&mut self.buf, value)
            .map_err(|source| CodecError::Encode { field, source })
    }

    pub fn write_string(&mut self, field: &'static str, value: &str) -> Result<(), CodecError> {
        let bytes = encode_modified_utf8(value);
        let len = u16::try_from(bytes.len()).map_err(|_| CodecError::StringTooLong {
            field,
            len: bytes.len(),
        })?;
        self.write(field, &len)?;
        self.buf.extend_from_slice(&bytes);
        Ok(())
    }

    pub fn write_bool(&mut self, field: &'static str, value: bool) -> Result<(), CodecError> {
        self.write(field, &value)
    }

    pub fn write_i32(&mut self, field: &'static str, value: i32) -> Result<(), CodecError> {
        self.write(field, &value)
    }

    pub fn write_i64(&mut self, field: &'static str, value: i64) -> Result<(), CodecError> {
        self.write(field, &value)
    }

    /// Returns the finished payload, rejecting anything a carrier could not relay
    pub fn finish(self) -> Result<Vec<u8>, CodecError> {
        if self.buf.len() > MAX_PAYLOAD_LEN {
            return Err(CodecError::PayloadTooLarge(self.buf.len()));
        }
        Ok(self.buf)
    }
}

/// Reads fields from an incoming payload in order
#[derive(Debug)]
pub struct WireReader<'a> {
    buf: &'a [u8],
}

impl<'a> WireReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    fn read<T: DeserializeOwned>(&mut self, field: &'static str) -> Result<T, CodecError> {
        options()
            .deserialize_from(&mut self.buf)
            .map_err(|source| CodecError::Field { field, source })
    }

    pub fn read_string(&mut self, field: &'static str) -> Result<String, CodecError> {
        let len = usize::from(self.read::<u16>(field)?);
        if len > self.buf.len() {
            return Err(CodecError::Truncated {
                field,
                needed: len,
                available: self.buf.len(),
            });
        }

        let (bytes, rest) = self.buf.split_at(len);
        self.buf = rest;
        decode_modified_utf8(bytes).ok_or(CodecError::InvalidText { field })
    }

    pub fn read_bool(&mut self, field: &'static str) -> Result<bool, CodecError> {
        self.read(field)
    }

    pub fn read_i32(&mut self, field: &'static str) -> Result<i32, CodecError> {
        self.read(field)
    }

    pub fn read_i64(&mut self, field: &'static str) -> Result<i64, CodecError> {
        self.read(field)
    }

    /// Reads a trailing string that older peers may not send
    pub fn read_string_or(
        &mut self,
        field: &'static str,
        default: &str,
    ) -> Result<String, CodecError> {
        if self.is_empty() {
            Ok(default.to_string())
        } else {
            self.read_string(field)
        }
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_string_layout_is_length_prefixed() {
        let mut writer = WireWriter::new();
        writer.write_string("kind", "PING").unwrap();
        let bytes = writer.finish().unwrap();

        assert_eq!(bytes, [0x00, 0x04, b'P', b'I', b'N', b'G']);
    }

    #[test]
    fn test_fixed_width_integers_are_big_endian() {
        let mut writer = WireWriter::new();
        writer.write_i32("count", -1).unwrap();
        writer.write_i64("timestamp", 42).unwrap();
        writer.write_bool("flag", true).unwrap();
        let bytes = writer.finish().unwrap();

        assert_eq!(
            bytes,
            [
                0xff, 0xff, 0xff, 0xff, // i32 -1
                0, 0, 0, 0, 0, 0, 0, 42, // i64 42
                0x01, // true
            ]
        );

        let mut reader = WireReader::new(&bytes);
        assert_eq!(reader.read_i32("count").unwrap(), -1);
        assert_eq!(reader.read_i64("timestamp").unwrap(), 42);
        assert!(reader.read_bool("flag").unwrap());
        assert!(reader.is_empty());
    }

    #[test]
    fn test_modified_utf8_strings() {
        let mut writer = WireWriter::new();
        writer.write_string("nul", "\0").unwrap();
        writer.write_string("accent", "é").unwrap();
        writer.write_string("emoji", "😀").unwrap();
        let bytes = writer.finish().unwrap();

        assert_eq!(
            bytes,
            [
                0x00, 0x02, 0xc0, 0x80, // NUL is never a raw zero byte
                0x00, 0x02, 0xc3, 0xa9, // U+00E9
                0x00, 0x06, 0xed, 0xa0, 0xbd, 0xed, 0xb8, 0x80, // surrogate pair
            ]
        );

        let mut reader = WireReader::new(&bytes);
        assert_eq!(reader.read_string("nul").unwrap(), "\0");
        assert_eq!(reader.read_string("accent").unwrap(), "é");
        assert_eq!(reader.read_string("emoji").unwrap(), "😀");
    }

    #[test]
    fn test_four_byte_utf8_is_rejected() {
        // Standard UTF-8 for U+1F600, which DataInput cannot produce
        let bytes = [0x00, 0x04, 0xf0, 0x9f, 0x98, 0x80];

        let mut reader = WireReader::new(&bytes);
        assert!(matches!(
            reader.read_string("emoji"),
            Err(CodecError::InvalidText { field: "emoji" })
        ));
    }

    #[test]
    fn test_truncated_string_is_an_error() {
        let mut writer = WireWriter::new();
        writer.write_string("token", "secret-token").unwrap();
        let bytes = writer.finish().unwrap();

        let mut reader = WireReader::new(&bytes[..bytes.len() - 3]);
        match reader.read_string("token") {
            Err(CodecError::Truncated {
                field,
                needed,
                available,
            }) => {
                assert_eq!(field, "token");
                assert_eq!(needed, 12);
                assert_eq!(available, 9);
            }
            other => panic!("expected truncation error, got {:?}", other),
        }
    }

    #[test]
    fn test_missing_length_prefix_is_an_error() {
        let mut reader = WireReader::new(&[0x00]);
        assert!(matches!(
            reader.read_string("token"),
            Err(CodecError::Field { field: "token", .. })
        ));
    }

    #[test]
    fn test_optional_trailing_string() {
        let mut reader = WireReader::new(&[]);
        assert_eq!(reader.read_string_or("version", "unknown").unwrap(), "unknown");
    }

    #[test]
    fn test_string_longer_than_u16_is_rejected() {
        let mut writer = WireWriter::new();
        let big = "x".repeat(MAX_STRING_LEN + 1);

        match writer.write_string("value", &big) {
            Err(CodecError::StringTooLong { field, len }) => {
                assert_eq!(field, "value");
                assert_eq!(len, MAX_STRING_LEN + 1);
            }
            other => panic!("expected length error, got {:?}", other),
        }
    }

    #[test]
    fn test_payload_limit() {
        let mut writer = WireWriter::new();
        writer.write_string("value", &"x".repeat(MAX_PAYLOAD_LEN)).unwrap();

        assert!(matches!(
            writer.finish(),
            Err(CodecError::PayloadTooLarge(len)) if len == MAX_PAYLOAD_LEN + 2
        ));
    }
}
