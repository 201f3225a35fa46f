//! Legacy multi-machine protocol over TCP.
//!
//! A client uploads input files, the server runs its configured command in
//! a scratch directory, streams the command's stdout back line by line and
//! finally returns the files the command produced.
//!
//! All integers are 4-byte little-endian. A file set is sent as
//!
//! ```text
//! count, { name_len, data_len, name, <- ACK, data, <- ACK }*
//! ```
//!
//! and output lines as `len, bytes` repeated, ended by the length
//! [`END_OF_OUTPUT`] and the command's exit code.

mod client;
mod server;

use std::io::{Read, Write};
use std::path::Path;

use tracing::debug;

use crate::error::{Error, Result};
use crate::ipc::NativeChannel;
use crate::ipc::native::ACK;

pub use client::{Submission, submit};
pub use server::{RemoteServer, ServerConfig};

/// Length value marking the end of streamed output.
pub const END_OF_OUTPUT: u32 = 0xFFFF_FFFF;

/// A file travelling between client and server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteFile {
    /// Bare file name, no directories.
    pub name: String,
    pub data: Vec<u8>,
}

impl RemoteFile {
    pub fn new(name: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            data: data.into(),
        }
    }

    /// Read a local file, keeping only its file name.
    pub fn read(path: &Path) -> Result<Self> {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| Error::Config(format!("{} has no usable file name", path.display())))?;
        Ok(Self::new(name, std::fs::read(path)?))
    }

    /// Write into `dir` under this file's name.
    pub fn write_into(&self, dir: &Path) -> Result<std::path::PathBuf> {
        let path = dir.join(check_file_name(&self.name)?);
        std::fs::write(&path, &self.data)?;
        Ok(path)
    }
}

/// Reject names that could escape the directory they are written into.
pub fn check_file_name(name: &str) -> Result<&str> {
    let bad = name.is_empty()
        || name == "."
        || name == ".."
        || name.contains('/')
        || name.contains('\\')
        || name.contains('\0');
    if bad {
        Err(Error::Protocol(format!("invalid file name {:?}", name)))
    } else {
        Ok(name)
    }
}

fn to_len(value: usize, what: &str) -> Result<i32> {
    i32::try_from(value).map_err(|_| Error::Protocol(format!("{} of {} bytes is too large", what, value)))
}

fn from_len(value: i32, what: &str) -> Result<usize> {
    usize::try_from(value).map_err(|_| Error::Protocol(format!("negative {} {}", what, value)))
}

/// Send a file set; the peer acknowledges each name and each body.
pub fn send_files<R: Read, W: Write>(channel: &mut NativeChannel<R, W>, files: &[RemoteFile]) -> Result<()> {
    channel.write_int(to_len(files.len(), "file count")?)?;
    for file in files {
        channel.write_int(to_len(file.name.len(), "file name")?)?;
        channel.write_int(to_len(file.data.len(), "file")?)?;
        channel.write_raw(file.name.as_bytes())?;
        channel.expect_token(ACK)?;
        channel.write_raw(&file.data)?;
        channel.expect_token(ACK)?;
        debug!(file = %file.name, bytes = file.data.len(), "sent file");
    }
    Ok(())
}

/// Receive a file set sent by [`send_files`].
pub fn recv_files<R: Read, W: Write>(channel: &mut NativeChannel<R, W>) -> Result<Vec<RemoteFile>> {
    let count = from_len(channel.read_int()?, "file count")?;
    let mut files = Vec::with_capacity(count.min(1024));
    for _ in 0..count {
        let name_len = from_len(channel.read_int()?, "name length")?;
        let data_len = from_len(channel.read_int()?, "data length")?;
        let name = String::from_utf8(channel.read_raw(name_len)?)
            .map_err(|e| Error::Serialization(format!("file name is not UTF-8: {}", e)))?;
        check_file_name(&name)?;
        channel.write_string(ACK)?;
        let data = channel.read_raw(data_len)?;
        channel.write_string(ACK)?;
        debug!(file = %name, bytes = data.len(), "received file");
        files.push(RemoteFile { name, data });
    }
    Ok(files)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::os::unix::net::UnixStream;

    #[test]
    fn test_file_set_transfer() {
        let (a, b) = UnixStream::pair().unwrap();
        let files = vec![
            RemoteFile::new("sim.json", b"{}".to_vec()),
            RemoteFile::new("empty.met", Vec::new()),
        ];
        let expected = files.clone();
        let sender = std::thread::spawn(move || {
            let mut channel = NativeChannel::new(a.try_clone().unwrap(), a);
            send_files(&mut channel, &files).unwrap();
        });
        let mut channel = NativeChannel::new(b.try_clone().unwrap(), b);
        assert_eq!(recv_files(&mut channel).unwrap(), expected);
        sender.join().unwrap();
    }

    #[test]
    fn test_file_name_checked() {
        assert!(check_file_name("report.db").is_ok());
        for bad in ["", "..", "../etc/passwd", "a/b", "a\\b"] {
            assert!(check_file_name(bad).is_err(), "{:?} accepted", bad);
        }
    }

    #[test]
    fn test_write_into_dir() {
        let dir = tempfile::tempdir().unwrap();
        let path = RemoteFile::new("out.txt", b"x".to_vec())
            .write_into(dir.path())
            .unwrap();
        assert_eq!(std::fs::read(path).unwrap(), b"x");
        assert!(RemoteFile::new("../out.txt", Vec::new()).write_into(dir.path()).is_err());
    }
}
