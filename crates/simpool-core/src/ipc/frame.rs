//! Length-prefixed framing shared by every codec.
//!
//! Format: 4-byte length (u32 LE) + payload bytes.

use std::io::{ErrorKind, Read, Write};

use crate::error::{Error, Result};

/// Default upper bound on a single frame (100MB).
pub const DEFAULT_MAX_FRAME_LEN: usize = 100 * 1024 * 1024;

/// Write one frame and flush the writer.
pub fn write_frame<W: Write + ?Sized>(writer: &mut W, payload: &[u8]) -> Result<()> {
    let len = u32::try_from(payload.len()).map_err(|_| Error::FrameTooLarge {
        len: payload.len(),
        limit: u32::MAX as usize,
    })?;
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(payload)?;
    writer.flush()?;
    Ok(())
}

/// Read one frame using the default size limit.
pub fn read_frame<R: Read + ?Sized>(reader: &mut R) -> Result<Vec<u8>> {
    read_frame_with_limit(reader, DEFAULT_MAX_FRAME_LEN)
}

/// Read one frame, rejecting payloads longer than `limit`.
///
/// Returns [`Error::ChannelClosed`] if the stream ends cleanly before the
/// first length byte. Ending anywhere later is a transport fault.
pub fn read_frame_with_limit<R: Read + ?Sized>(reader: &mut R, limit: usize) -> Result<Vec<u8>> {
    let mut len_bytes = [0u8; 4];
    match fill(reader, &mut len_bytes)? {
        0 => return Err(Error::ChannelClosed),
        4 => {}
        n => {
            return Err(Error::Io(std::io::Error::new(
                ErrorKind::UnexpectedEof,
                format!("channel closed after {} of 4 length bytes", n),
            )));
        }
    }

    let len = u32::from_le_bytes(len_bytes) as usize;
    if len > limit {
        return Err(Error::FrameTooLarge { len, limit });
    }

    let mut payload = vec![0u8; len];
    let got = fill(reader, &mut payload)?;
    if got < len {
        return Err(Error::Io(std::io::Error::new(
            ErrorKind::UnexpectedEof,
            format!("channel closed after {} of {} payload bytes", got, len),
        )));
    }
    Ok(payload)
}

/// Read until `buf` is full or the stream ends, returning the bytes read.
///
/// Transports may hand back fewer bytes than asked for, so this keeps
/// reading until the buffer is complete.
pub(crate) fn fill<R: Read + ?Sized>(reader: &mut R, buf: &mut [u8]) -> Result<usize> {
    let mut total = 0;
    while total < buf.len() {
        match reader.read(&mut buf[total..]) {
            Ok(0) => break,
            Ok(n) => total += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(Error::Io(e)),
        }
    }
    Ok(total)
}
