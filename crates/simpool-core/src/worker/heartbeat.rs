//! Per-job progress heartbeat.

use std::io::Write;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::debug;

use crate::error::Result;
use crate::ipc::{ProgressReport, Response, SharedWriter, lock_writer, write_message};
use crate::runnable::Progress;

/// Background sender of `Progress` frames for one job.
///
/// The thread and the job share the channel's writer mutex. A progress
/// frame is only written while the heartbeat is enabled, checked with the
/// lock held, and [`Heartbeat::finish`] joins the thread before writing
/// the terminal message. No `Progress` can follow the `Output`.
pub struct Heartbeat<W: Write + Send + 'static> {
    writer: SharedWriter<W>,
    enabled: Arc<AtomicBool>,
    stop: Option<mpsc::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl<W: Write + Send + 'static> Heartbeat<W> {
    /// Start reporting `progress` for `job_id` every `interval`.
    pub fn start(writer: SharedWriter<W>, job_id: String, progress: Progress, interval: Duration) -> Self {
        let enabled = Arc::new(AtomicBool::new(true));
        let (stop_tx, stop_rx) = mpsc::channel::<()>();

        let thread_writer = Arc::clone(&writer);
        let thread_enabled = Arc::clone(&enabled);
        let thread = std::thread::Builder::new()
            .name(format!("heartbeat-{}", job_id))
            .spawn(move || {
                loop {
                    match stop_rx.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => {}
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                    let Ok(mut guard) = lock_writer(&thread_writer) else {
                        break;
                    };
                    if !thread_enabled.load(Ordering::Acquire) {
                        break;
                    }
                    let report = Response::Progress(ProgressReport {
                        job_id: job_id.clone(),
                        fraction: progress.get(),
                    });
                    if let Err(e) = write_message(&mut *guard, &report) {
                        debug!("heartbeat stopped: {}", e);
                        break;
                    }
                }
            });

        let thread = match thread {
            Ok(handle) => Some(handle),
            Err(e) => {
                // Jobs still run without progress reports.
                debug!("could not start heartbeat thread: {}", e);
                None
            }
        };

        Self {
            writer,
            enabled,
            stop: Some(stop_tx),
            thread,
        }
    }

    fn stop(&mut self) {
        self.enabled.store(false, Ordering::Release);
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }

    /// Stop the heartbeat, then write `terminal` under the writer lock.
    pub fn finish(mut self, terminal: &Response) -> Result<()> {
        self.stop();
        let mut guard = lock_writer(&self.writer)?;
        write_message(&mut *guard, terminal)
    }
}

impl<W: Write + Send + 'static> Drop for Heartbeat<W> {
    fn drop(&mut self) {
        self.stop();
    }
}
