//! Duplex channel over a pair of one-directional byte streams.
//!
//! The outbound half sits behind a shared mutex so a heartbeat thread and
//! the job thread can never interleave frames.

use std::fmt;
use std::io::{Read, Write};
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::debug;

use crate::error::{Error, Result};

use super::frame::DEFAULT_MAX_FRAME_LEN;
use super::protocol::{Request, Response, WireMessage, read_message, write_message};

/// Outbound half of a channel, shareable between threads.
pub type SharedWriter<W> = Arc<Mutex<W>>;

/// Convert a poisoned writer lock into a transport fault.
fn lock_error<T>(e: PoisonError<T>) -> Error {
    Error::Io(std::io::Error::other(format!(
        "channel writer lock poisoned (thread panicked): {}",
        e
    )))
}

/// Lock a shared writer.
pub fn lock_writer<W>(writer: &SharedWriter<W>) -> Result<MutexGuard<'_, W>> {
    writer.lock().map_err(lock_error)
}

/// A bound (in, out) stream pair speaking the object codec.
pub struct Channel<R, W> {
    reader: R,
    writer: SharedWriter<W>,
    max_frame_len: usize,
}

impl<R: Read, W: Write> Channel<R, W> {
    pub fn new(reader: R, writer: W) -> Self {
        Self {
            reader,
            writer: Arc::new(Mutex::new(writer)),
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }

    pub fn with_max_frame_len(mut self, limit: usize) -> Self {
        self.max_frame_len = limit;
        self
    }

    /// Shared handle to the outbound stream.
    pub fn writer(&self) -> SharedWriter<W> {
        Arc::clone(&self.writer)
    }

    /// Write one message under the writer lock.
    pub fn send<M: WireMessage>(&self, message: &M) -> Result<()> {
        let mut guard = lock_writer(&self.writer)?;
        write_message(&mut *guard, message)
    }

    /// Block until one full message arrives.
    pub fn recv<M: WireMessage>(&mut self) -> Result<M> {
        read_message(&mut self.reader, self.max_frame_len)
    }

    /// Send a request and block until the peer acknowledges ownership.
    pub fn send_command(&mut self, request: &Request) -> Result<()> {
        debug!(kind = request.label(), "sending command");
        self.send(request)?;
        match self.recv::<Response>()? {
            Response::Ack => Ok(()),
            other => Err(Error::Protocol(format!(
                "expected ack for {} command, got {}",
                request.label(),
                other.label()
            ))),
        }
    }

    /// Block until a request arrives, then acknowledge it.
    pub fn wait_for_command(&mut self) -> Result<Request> {
        let request: Request = self.recv()?;
        debug!(kind = request.label(), "received command");
        self.send(&Response::Ack)?;
        Ok(request)
    }
}

/// Identifier of one half of a worker's channel, passed on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    /// An inherited pipe descriptor.
    Fd(i32),
    /// Process stdin (inbound) or stdout (outbound).
    Stdio,
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Fd(fd) => write!(f, "fd:{}", fd),
            Endpoint::Stdio => f.write_str("-"),
        }
    }
}

impl FromStr for Endpoint {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if s == "-" {
            return Ok(Endpoint::Stdio);
        }
        let fd = s
            .strip_prefix("fd:")
            .and_then(|n| n.parse::<i32>().ok())
            .filter(|fd| *fd >= 0)
            .ok_or_else(|| Error::Config(format!("invalid endpoint {:?}, expected fd:<N> or -", s)))?;
        Ok(Endpoint::Fd(fd))
    }
}

impl Endpoint {
    /// Open this endpoint as the inbound stream.
    pub fn open_inbound(self) -> Result<Box<dyn Read + Send>> {
        match self {
            Endpoint::Stdio => Ok(Box::new(std::io::stdin())),
            Endpoint::Fd(fd) => Ok(Box::new(adopt_fd(fd)?)),
        }
    }

    /// Open this endpoint as the outbound stream.
    pub fn open_outbound(self) -> Result<Box<dyn Write + Send>> {
        match self {
            Endpoint::Stdio => Ok(Box::new(std::io::stdout())),
            Endpoint::Fd(fd) => Ok(Box::new(adopt_fd(fd)?)),
        }
    }
}

#[cfg(unix)]
fn adopt_fd(fd: i32) -> Result<std::fs::File> {
    use std::os::fd::FromRawFd;

    // SAFETY: fcntl only inspects the descriptor.
    if unsafe { libc::fcntl(fd, libc::F_GETFD) } == -1 {
        return Err(Error::Io(std::io::Error::last_os_error()));
    }
    // SAFETY: the descriptor was inherited for this process's exclusive use
    // and is valid (checked above); the File takes ownership of it.
    Ok(unsafe { std::fs::File::from_raw_fd(fd) })
}

#[cfg(not(unix))]
fn adopt_fd(fd: i32) -> Result<std::fs::File> {
    Err(Error::Config(format!(
        "pipe descriptor endpoints (fd:{}) are only supported on unix",
        fd
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::protocol::{ReadCommand, RunCommand};

    #[test]
    fn test_endpoint_parse() {
        assert_eq!("fd:7".parse::<Endpoint>().unwrap(), Endpoint::Fd(7));
        assert_eq!("-".parse::<Endpoint>().unwrap(), Endpoint::Stdio);
        assert!("7".parse::<Endpoint>().is_err());
        assert!("fd:-1".parse::<Endpoint>().is_err());
        assert_eq!(Endpoint::Fd(12).to_string(), "fd:12");
    }

    #[cfg(unix)]
    fn pair() -> (
        Channel<std::os::unix::net::UnixStream, std::os::unix::net::UnixStream>,
        Channel<std::os::unix::net::UnixStream, std::os::unix::net::UnixStream>,
    ) {
        let (a, b) = std::os::unix::net::UnixStream::pair().unwrap();
        (
            Channel::new(a.try_clone().unwrap(), a),
            Channel::new(b.try_clone().unwrap(), b),
        )
    }

    #[cfg(unix)]
    #[test]
    fn test_commands_arrive_in_order() {
        let (mut orchestrator, mut worker) = pair();

        let peer = std::thread::spawn(move || {
            let first = worker.wait_for_command().unwrap();
            let second = worker.wait_for_command().unwrap();
            (first, second)
        });

        let a = Request::Run(RunCommand::default());
        let b = Request::Read(ReadCommand {
            table_name: "Report".into(),
            field_names: vec!["Yield".into()],
        });
        orchestrator.send_command(&a).unwrap();
        orchestrator.send_command(&b).unwrap();

        let (first, second) = peer.join().unwrap();
        assert_eq!(first, a);
        assert_eq!(second, b);
    }

    #[cfg(unix)]
    #[test]
    fn test_send_command_rejects_non_ack() {
        let (mut orchestrator, mut worker) = pair();

        let peer = std::thread::spawn(move || {
            let _: Request = worker.recv().unwrap();
            worker.send(&Response::Finished).unwrap();
        });

        let err = orchestrator
            .send_command(&Request::Run(RunCommand::default()))
            .unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
        peer.join().unwrap();
    }

    #[cfg(unix)]
    #[test]
    fn test_wait_for_command_reports_close() {
        let (orchestrator, mut worker) = pair();
        drop(orchestrator);
        assert!(matches!(worker.wait_for_command(), Err(Error::ChannelClosed)));
    }
}
