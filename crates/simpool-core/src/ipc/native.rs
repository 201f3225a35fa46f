//! Primitive-typed codec for callers that cannot decode rkyv archives.
//!
//! Fixed-width values (ints, doubles, bools) travel raw in little-endian
//! order. Strings and byte blobs travel as frames. Column data returned by
//! a native `READ` is one frame per column holding an encoded array.

use std::io::{Read, Write};

use chrono::NaiveDate;

use crate::error::{Error, Result};

use super::frame::{DEFAULT_MAX_FRAME_LEN, fill, read_frame_with_limit, write_frame};
use super::protocol::{Value, pack_date};

/// Acknowledgement token.
pub const ACK: &str = "ACK";
/// End-of-sequence / finished token.
pub const FIN: &str = "FIN";
/// Failure token, followed by a message string.
pub const ERR: &str = "ERR";
/// Start of a native run command.
pub const RUN: &str = "RUN";
/// Start of a native read command.
pub const READ: &str = "READ";

/// Type code of a replacement value in a native `RUN`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ParamType {
    Int = 0,
    Double = 1,
    Bool = 2,
    Date = 3,
    String = 4,
}

impl TryFrom<i32> for ParamType {
    type Error = Error;

    fn try_from(code: i32) -> Result<Self> {
        match code {
            0 => Ok(Self::Int),
            1 => Ok(Self::Double),
            2 => Ok(Self::Bool),
            3 => Ok(Self::Date),
            4 => Ok(Self::String),
            other => Err(Error::Protocol(format!("unknown parameter type code {}", other))),
        }
    }
}

/// Duplex channel speaking the native codec.
pub struct NativeChannel<R, W> {
    reader: R,
    writer: W,
    max_frame_len: usize,
}

impl<R: Read, W: Write> NativeChannel<R, W> {
    pub fn new(reader: R, writer: W) -> Self {
        Self {
            reader,
            writer,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }

    pub fn with_max_frame_len(mut self, limit: usize) -> Self {
        self.max_frame_len = limit;
        self
    }

    fn read_fixed<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut buf = [0u8; N];
        match fill(&mut self.reader, &mut buf)? {
            0 if N > 0 => Err(Error::ChannelClosed),
            n if n < N => Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("channel closed after {} of {} bytes", n, N),
            ))),
            _ => Ok(buf),
        }
    }

    /// Write unframed bytes.
    pub fn write_raw(&mut self, bytes: &[u8]) -> Result<()> {
        self.writer.write_all(bytes)?;
        self.writer.flush()?;
        Ok(())
    }

    /// Read exactly `len` unframed bytes.
    pub fn read_raw(&mut self, len: usize) -> Result<Vec<u8>> {
        if len > self.max_frame_len {
            return Err(Error::FrameTooLarge {
                len,
                limit: self.max_frame_len,
            });
        }
        let mut buf = vec![0u8; len];
        let read = fill(&mut self.reader, &mut buf)?;
        if read < len {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("channel closed after {} of {} bytes", read, len),
            )));
        }
        Ok(buf)
    }

    pub fn read_int(&mut self) -> Result<i32> {
        Ok(i32::from_le_bytes(self.read_fixed::<4>()?))
    }

    pub fn write_int(&mut self, value: i32) -> Result<()> {
        self.write_raw(&value.to_le_bytes())
    }

    pub fn read_double(&mut self) -> Result<f64> {
        Ok(f64::from_le_bytes(self.read_fixed::<8>()?))
    }

    pub fn write_double(&mut self, value: f64) -> Result<()> {
        self.write_raw(&value.to_le_bytes())
    }

    pub fn read_bool(&mut self) -> Result<bool> {
        match self.read_fixed::<1>()?[0] {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(Error::Protocol(format!("invalid bool byte {:#04x}", other))),
        }
    }

    pub fn write_bool(&mut self, value: bool) -> Result<()> {
        self.write_raw(&[value as u8])
    }

    /// Read a UTF-8 string frame.
    pub fn read_string(&mut self) -> Result<String> {
        let bytes = self.read_bytes()?;
        String::from_utf8(bytes).map_err(|e| Error::Serialization(format!("string frame is not UTF-8: {}", e)))
    }

    /// Write a string as a frame; no terminator.
    pub fn write_string(&mut self, value: &str) -> Result<()> {
        write_frame(&mut self.writer, value.as_bytes())
    }

    pub fn read_bytes(&mut self) -> Result<Vec<u8>> {
        read_frame_with_limit(&mut self.reader, self.max_frame_len)
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        write_frame(&mut self.writer, bytes)
    }

    /// Write a date as the int `yyyymmdd`.
    pub fn write_date(&mut self, date: NaiveDate) -> Result<()> {
        self.write_int(pack_date(date)?)
    }

    /// Dates cannot be read back through the native codec yet.
    pub fn read_date(&mut self) -> Result<NaiveDate> {
        Err(Error::NotImplemented("reading dates over the native codec"))
    }

    /// Read a string and fail unless it equals `token`.
    pub fn expect_token(&mut self, token: &str) -> Result<()> {
        let got = self.read_string()?;
        if got == token {
            Ok(())
        } else {
            Err(Error::Protocol(format!("expected {:?}, got {:?}", token, got)))
        }
    }

    /// Write a string and block until the peer acknowledges it.
    pub fn send_acked(&mut self, value: &str) -> Result<()> {
        self.write_string(value)?;
        self.expect_token(ACK)
    }

    /// Write an encoded column array as one frame.
    pub fn write_column(&mut self, values: &[Value]) -> Result<()> {
        let encoded = encode_column(values);
        write_frame(&mut self.writer, &encoded)
    }
}

/// Encode a column as a homogeneous array.
///
/// The element type is taken from the first non-null value. Nulls become
/// the type's neutral value (NaN for doubles, zero, false or an empty
/// string). Values of another type than the first are coerced through
/// their text form where possible.
pub fn encode_column(values: &[Value]) -> Vec<u8> {
    let Some(first) = values.iter().find(|v| !v.is_null()) else {
        return Vec::new();
    };
    let mut out = Vec::new();
    for value in values {
        match first {
            Value::Int(_) => {
                let v = match value {
                    Value::Int(i) => *i,
                    Value::Double(d) => *d as i32,
                    _ => 0,
                };
                out.extend_from_slice(&v.to_le_bytes());
            }
            Value::Double(_) => {
                let v = value.as_f64().unwrap_or(f64::NAN);
                out.extend_from_slice(&v.to_le_bytes());
            }
            Value::Bool(_) => out.push(matches!(value, Value::Bool(true)) as u8),
            Value::Date(_) => {
                let v = if let Value::Date(packed) = value { *packed } else { 0 };
                out.extend_from_slice(&v.to_le_bytes());
            }
            Value::Text(_) | Value::Null => {
                let text = value.to_string();
                out.extend_from_slice(&(text.len() as i32).to_le_bytes());
                out.extend_from_slice(text.as_bytes());
            }
        }
    }
    out
}

/// Decode a column array of 4-byte ints (also used for packed dates).
pub fn decode_ints(bytes: &[u8]) -> Result<Vec<i32>> {
    if bytes.len() % 4 != 0 {
        return Err(Error::Serialization(format!("int array of {} bytes", bytes.len())));
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|c| i32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}

/// Decode a column array of 8-byte doubles.
pub fn decode_doubles(bytes: &[u8]) -> Result<Vec<f64>> {
    if bytes.len() % 8 != 0 {
        return Err(Error::Serialization(format!("double array of {} bytes", bytes.len())));
    }
    Ok(bytes
        .chunks_exact(8)
        .map(|c| f64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]))
        .collect())
}

/// Decode a column array of length-prefixed strings.
pub fn decode_strings(bytes: &[u8]) -> Result<Vec<String>> {
    let mut out = Vec::new();
    let mut rest = bytes;
    while !rest.is_empty() {
        if rest.len() < 4 {
            return Err(Error::Serialization("truncated string length".to_string()));
        }
        let len = i32::from_le_bytes([rest[0], rest[1], rest[2], rest[3]]);
        let len = usize::try_from(len)
            .map_err(|_| Error::Serialization(format!("negative string length {}", len)))?;
        rest = &rest[4..];
        if rest.len() < len {
            return Err(Error::Serialization("truncated string body".to_string()));
        }
        let (text, tail) = rest.split_at(len);
        out.push(
            String::from_utf8(text.to_vec())
                .map_err(|e| Error::Serialization(format!("string is not UTF-8: {}", e)))?,
        );
        rest = tail;
    }
    Ok(out)
}
