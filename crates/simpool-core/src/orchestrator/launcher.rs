//! Starting workers and owning their channel pairs.

use std::io::{BufReader, BufWriter, Read, Write};
use std::path::PathBuf;
use std::process::Child;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{debug, warn};

use crate::config::PoolConfig;
use crate::error::{Error, Result};
use crate::ipc::{Channel, DEFAULT_MAX_FRAME_LEN};
use crate::runnable::Registry;
use crate::worker::WorkerClient;

/// Orchestrator side of a worker's channel.
pub type WorkerChannel = Channel<Box<dyn Read + Send>, Box<dyn Write + Send>>;

enum Peer {
    Process(Child),
    Thread(JoinHandle<()>),
}

/// A started worker: its channel plus whatever runs the other end.
pub struct WorkerConnection {
    channel: Option<WorkerChannel>,
    peer: Option<Peer>,
    label: String,
}

impl WorkerConnection {
    /// Wrap a channel whose peer is managed elsewhere.
    pub fn new(channel: WorkerChannel, label: impl Into<String>) -> Self {
        Self {
            channel: Some(channel),
            peer: None,
            label: label.into(),
        }
    }

    fn with_peer(mut self, peer: Peer) -> Self {
        self.peer = Some(peer);
        self
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn channel(&mut self) -> Result<&mut WorkerChannel> {
        self.channel.as_mut().ok_or(Error::ChannelClosed)
    }

    /// Close the channel and wait for the worker to exit.
    ///
    /// Closing the orchestrator's outbound pipe is the worker's signal to
    /// leave its loop.
    pub fn shutdown(mut self) {
        self.channel = None;
        match self.peer.take() {
            Some(Peer::Process(mut child)) => match child.wait() {
                Ok(status) if !status.success() => {
                    warn!(worker = %self.label, %status, "worker exited abnormally")
                }
                Ok(_) => debug!(worker = %self.label, "worker exited"),
                Err(e) => warn!(worker = %self.label, "failed to wait for worker: {}", e),
            },
            Some(Peer::Thread(handle)) => {
                let _ = handle.join();
            }
            None => {}
        }
    }
}

impl Drop for WorkerConnection {
    fn drop(&mut self) {
        self.channel = None;
        // A worker dropped without shutdown may be wedged mid-job.
        if let Some(Peer::Process(mut child)) = self.peer.take() {
            if let Ok(None) = child.try_wait() {
                let _ = child.kill();
            }
            let _ = child.wait();
        }
    }
}

/// Starts a worker for an orchestrator slot.
pub trait WorkerLauncher: Send + Sync {
    fn launch(&self, slot: usize) -> Result<WorkerConnection>;
}

/// Launches `simpool-worker` processes connected by anonymous pipes.
pub struct ProcessLauncher {
    binary: PathBuf,
    heartbeat_interval: Duration,
    max_frame_len: usize,
    verbose: bool,
    /// Held while pipes are created and a child is spawned, so no other
    /// child can inherit descriptors meant for this one.
    spawn_lock: Mutex<()>,
}

impl ProcessLauncher {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            heartbeat_interval: crate::config::DEFAULT_HEARTBEAT_INTERVAL,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            verbose: false,
            spawn_lock: Mutex::new(()),
        }
    }

    /// Launcher for the binary and limits in `config`.
    pub fn from_config(config: &PoolConfig) -> Result<Self> {
        Ok(Self::new(config.resolve_worker_binary()?)
            .with_heartbeat_interval(config.heartbeat_interval)
            .with_max_frame_len(config.max_frame_len)
            .with_verbose(config.verbose_workers))
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_max_frame_len(mut self, limit: usize) -> Self {
        self.max_frame_len = limit;
        self
    }

    /// Pass `--verbose` to workers.
    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    pub fn binary(&self) -> &std::path::Path {
        &self.binary
    }
}

#[cfg(unix)]
impl WorkerLauncher for ProcessLauncher {
    fn launch(&self, slot: usize) -> Result<WorkerConnection> {
        use std::fs::File;
        use std::os::fd::AsRawFd;
        use std::os::unix::process::CommandExt;
        use std::process::{Command, Stdio};

        use crate::config::WireProtocol;

        let _guard = self
            .spawn_lock
            .lock()
            .map_err(|e| Error::Launch(format!("spawn lock poisoned: {}", e)))?;

        // Worker writes, orchestrator reads.
        let (from_worker, worker_out) = pipes::cloexec_pipe()?;
        // Orchestrator writes, worker reads.
        let (worker_in, to_worker) = pipes::cloexec_pipe()?;
        let child_out = worker_out.as_raw_fd();
        let child_in = worker_in.as_raw_fd();

        let mut command = Command::new(&self.binary);
        command
            .arg(format!("fd:{}", child_out))
            .arg(format!("fd:{}", child_in))
            .arg("--protocol")
            .arg(WireProtocol::Object.to_string())
            .arg("--heartbeat-ms")
            .arg(self.heartbeat_interval.as_millis().to_string())
            .arg("--max-frame-len")
            .arg(self.max_frame_len.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit());
        if self.verbose {
            command.arg("--verbose");
        }
        // SAFETY: the hook only calls fcntl, which is async-signal-safe.
        unsafe {
            command.pre_exec(move || {
                pipes::inherit(child_out)?;
                pipes::inherit(child_in)
            });
        }

        let child = command.spawn().map_err(|e| {
            Error::Launch(format!(
                "Failed to spawn worker process '{}': {}",
                self.binary.display(),
                e
            ))
        })?;
        drop(worker_out);
        drop(worker_in);
        debug!(slot, pid = child.id(), "worker launched");

        let reader: Box<dyn Read + Send> = Box::new(BufReader::new(File::from(from_worker)));
        let writer: Box<dyn Write + Send> = Box::new(BufWriter::new(File::from(to_worker)));
        let channel = Channel::new(reader, writer).with_max_frame_len(self.max_frame_len);
        Ok(WorkerConnection::new(channel, format!("worker-{}[pid {}]", slot, child.id()))
            .with_peer(Peer::Process(child)))
    }
}

#[cfg(not(unix))]
impl WorkerLauncher for ProcessLauncher {
    fn launch(&self, _slot: usize) -> Result<WorkerConnection> {
        Err(Error::Launch(
            "pipe-connected worker processes are only supported on unix".to_string(),
        ))
    }
}

#[cfg(unix)]
mod pipes {
    use std::os::fd::{FromRawFd, OwnedFd};

    use crate::error::Result;

    fn set_cloexec(fd: i32, on: bool) -> std::io::Result<()> {
        // SAFETY: fcntl on a descriptor this process owns.
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
        if flags == -1 {
            return Err(std::io::Error::last_os_error());
        }
        let flags = if on {
            flags | libc::FD_CLOEXEC
        } else {
            flags & !libc::FD_CLOEXEC
        };
        // SAFETY: as above.
        if unsafe { libc::fcntl(fd, libc::F_SETFD, flags) } == -1 {
            return Err(std::io::Error::last_os_error());
        }
        Ok(())
    }

    /// Anonymous pipe as (read end, write end), both close-on-exec.
    pub(super) fn cloexec_pipe() -> Result<(OwnedFd, OwnedFd)> {
        let mut fds = [0i32; 2];
        // SAFETY: fds has room for the two descriptors pipe writes.
        if unsafe { libc::pipe(fds.as_mut_ptr()) } == -1 {
            return Err(std::io::Error::last_os_error().into());
        }
        // SAFETY: pipe succeeded, so both descriptors are open and unowned.
        let (read, write) = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };
        set_cloexec(fds[0], true)?;
        set_cloexec(fds[1], true)?;
        Ok((read, write))
    }

    /// Let a descriptor survive exec. Runs in the forked child.
    pub(super) fn inherit(fd: i32) -> std::io::Result<()> {
        set_cloexec(fd, false)
    }
}

/// Runs each worker on a thread of this process, over a socket pair.
///
/// Used by tests and by embedders whose runnables are safe to share a
/// process.
pub struct InProcessLauncher {
    registry: Arc<Registry>,
    heartbeat_interval: Duration,
}

impl InProcessLauncher {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self {
            registry,
            heartbeat_interval: crate::config::DEFAULT_HEARTBEAT_INTERVAL,
        }
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }
}

#[cfg(unix)]
impl WorkerLauncher for InProcessLauncher {
    fn launch(&self, slot: usize) -> Result<WorkerConnection> {
        use std::os::unix::net::UnixStream;

        let (ours, theirs) = UnixStream::pair()?;
        let worker_channel = Channel::new(theirs.try_clone()?, theirs);
        let mut worker = WorkerClient::new(worker_channel, Arc::clone(&self.registry))
            .with_heartbeat_interval(self.heartbeat_interval);

        let handle = std::thread::Builder::new()
            .name(format!("worker-{}", slot))
            .spawn(move || {
                if let Err(e) = worker.serve() {
                    warn!(slot, "in-process worker stopped: {}", e);
                }
            })?;

        let reader: Box<dyn Read + Send> = Box::new(ours.try_clone()?);
        let writer: Box<dyn Write + Send> = Box::new(ours);
        Ok(WorkerConnection::new(Channel::new(reader, writer), format!("worker-{}[thread]", slot))
            .with_peer(Peer::Thread(handle)))
    }
}

#[cfg(not(unix))]
impl WorkerLauncher for InProcessLauncher {
    fn launch(&self, _slot: usize) -> Result<WorkerConnection> {
        Err(Error::Launch("in-process workers need unix socket pairs".to_string()))
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::ipc::{JobSpec, Request, Response};

    #[test]
    fn test_in_process_worker_answers_job() {
        let launcher = InProcessLauncher::new(Arc::new(Registry::with_builtins()));
        let mut connection = launcher.launch(0).unwrap();
        let spec = JobSpec::new("noop", "n");

        let channel = connection.channel().unwrap();
        channel.send_command(&Request::Job(spec.clone())).unwrap();
        match channel.recv::<Response>().unwrap() {
            Response::Output(output) => {
                assert_eq!(output.job_id, spec.id);
                assert!(output.succeeded());
            }
            other => panic!("unexpected {:?}", other),
        }
        connection.shutdown();
    }

    #[test]
    fn test_from_config_carries_worker_settings() {
        let binary = tempfile::NamedTempFile::new().unwrap();
        let config = PoolConfig::default()
            .with_worker_path(binary.path())
            .with_heartbeat_interval(Duration::from_millis(40))
            .with_max_frame_len(4096)
            .with_verbose_workers(true);
        let launcher = ProcessLauncher::from_config(&config).unwrap();
        assert_eq!(launcher.binary(), binary.path());
        assert_eq!(launcher.heartbeat_interval, Duration::from_millis(40));
        assert_eq!(launcher.max_frame_len, 4096);
        assert!(launcher.verbose);
    }

    #[test]
    fn test_pipes_are_cloexec() {
        let (read, _write) = pipes::cloexec_pipe().unwrap();
        use std::os::fd::AsRawFd;
        let flags = unsafe { libc::fcntl(read.as_raw_fd(), libc::F_GETFD) };
        assert_ne!(flags & libc::FD_CLOEXEC, 0);
    }

    #[test]
    #[ignore = "Requires simpool-worker binary"]
    fn test_process_worker_answers_job() {
        let launcher = ProcessLauncher::from_config(&PoolConfig::default()).unwrap();
        let mut connection = launcher.launch(0).unwrap();
        let spec = JobSpec::new("noop", "n");
        let channel = connection.channel().unwrap();
        channel.send_command(&Request::Job(spec.clone())).unwrap();
        assert!(matches!(channel.recv::<Response>().unwrap(), Response::Output(_)));
        connection.shutdown();
    }
}
