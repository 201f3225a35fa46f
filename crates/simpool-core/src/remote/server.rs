//! Remote job server.

use std::collections::HashSet;
use std::io::{BufRead, BufReader, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::Arc;

use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::ipc::{DEFAULT_MAX_FRAME_LEN, NativeChannel};

use super::{END_OF_OUTPUT, RemoteFile, recv_files, send_files, to_len};

/// What the server runs for each submission.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Executed inside the submission's scratch directory.
    pub program: PathBuf,
    pub args: Vec<String>,
    /// Largest single file accepted.
    pub max_file_len: usize,
}

impl ServerConfig {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            max_file_len: DEFAULT_MAX_FRAME_LEN,
        }
    }
}

/// Accepts submissions and runs them one connection per thread.
pub struct RemoteServer {
    listener: TcpListener,
    config: Arc<ServerConfig>,
}

impl RemoteServer {
    pub fn bind(addr: impl ToSocketAddrs, config: ServerConfig) -> Result<Self> {
        Ok(Self {
            listener: TcpListener::bind(addr)?,
            config: Arc::new(config),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Serve connections until accepting fails.
    pub fn serve(&self) -> Result<()> {
        info!(addr = %self.local_addr()?, "remote server listening");
        loop {
            let (stream, peer) = self.listener.accept()?;
            let config = Arc::clone(&self.config);
            std::thread::Builder::new()
                .name(format!("remote-{}", peer))
                .spawn(move || {
                    if let Err(e) = handle_connection(stream, &config) {
                        warn!(%peer, "submission failed: {}", e);
                    }
                })?;
        }
    }

    /// Accept and handle exactly one connection on this thread.
    pub fn serve_one(&self) -> Result<()> {
        let (stream, _) = self.listener.accept()?;
        handle_connection(stream, &self.config)
    }
}

fn handle_connection(stream: TcpStream, config: &ServerConfig) -> Result<()> {
    let peer = stream.peer_addr()?;
    let mut channel =
        NativeChannel::new(stream.try_clone()?, stream).with_max_frame_len(config.max_file_len);

    let inputs = recv_files(&mut channel)?;
    let scratch = tempfile::tempdir()?;
    let mut uploaded = HashSet::new();
    for file in &inputs {
        file.write_into(scratch.path())?;
        uploaded.insert(file.name.clone());
    }
    info!(%peer, files = inputs.len(), program = %config.program.display(), "running submission");

    let mut child = Command::new(&config.program)
        .args(&config.args)
        .current_dir(scratch.path())
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .spawn()
        .map_err(|e| Error::Launch(format!("Failed to run '{}': {}", config.program.display(), e)))?;

    let status = match stream_output(&mut channel, &mut child) {
        Ok(()) => child.wait()?,
        Err(e) => {
            let _ = child.kill();
            let _ = child.wait();
            return Err(e);
        }
    };
    channel.write_raw(&END_OF_OUTPUT.to_le_bytes())?;
    channel.write_int(status.code().unwrap_or(-1))?;

    let mut produced = Vec::new();
    for entry in std::fs::read_dir(scratch.path())? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if entry.file_type()?.is_file() && !uploaded.contains(&name) {
            produced.push(RemoteFile::read(&entry.path())?);
        }
    }
    produced.sort_by(|a, b| a.name.cmp(&b.name));
    send_files(&mut channel, &produced)?;
    info!(%peer, %status, returned = produced.len(), "submission finished");
    Ok(())
}

/// Forward the child's stdout line by line, as raw bytes.
fn stream_output<R: Read, W: Write>(channel: &mut NativeChannel<R, W>, child: &mut Child) -> Result<()> {
    let Some(stdout) = child.stdout.take() else {
        return Ok(());
    };
    let mut reader = BufReader::new(stdout);
    let mut line = Vec::new();
    loop {
        line.clear();
        if reader.read_until(b'\n', &mut line)? == 0 {
            return Ok(());
        }
        let body = strip_line_ending(&line);
        channel.write_int(to_len(body.len(), "output line")?)?;
        channel.write_raw(body)?;
    }
}

fn strip_line_ending(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}
