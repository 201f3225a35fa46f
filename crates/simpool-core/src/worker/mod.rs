//! Worker-side execution loop.
//!
//! A [`WorkerClient`] owns one channel pair and moves through
//! `WaitingForJob -> Running -> Reporting` for every job it receives.
//! Execution failures are captured as data; only transport, protocol and
//! serialization faults end the loop.

mod heartbeat;
mod native;
mod session;

use std::any::Any;
use std::io::{Read, Write};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use crate::config::DEFAULT_HEARTBEAT_INTERVAL;
use crate::error::{Error, Result};
use crate::ipc::{Channel, JobOutput, JobSpec, Request, Response};
use crate::runnable::{CancelSignal, Registry, Runnable, redirect_storage};
use crate::storage::StorageRedirect;

pub use heartbeat::Heartbeat;
pub use native::NativeServer;
pub use session::{Session, load_catalog};

/// Where a worker is in its job cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    WaitingForJob,
    Running,
    Reporting,
}

/// Counters reported when the loop ends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStats {
    pub jobs: usize,
    pub failed_jobs: usize,
    pub runs: usize,
    pub reads: usize,
}

/// Object-codec worker bound to one channel pair.
pub struct WorkerClient<R, W: Write + Send + 'static> {
    channel: Channel<R, W>,
    registry: Arc<Registry>,
    session: Session,
    heartbeat_interval: Duration,
    cancel: CancelSignal,
    state: WorkerState,
}

impl<R: Read, W: Write + Send + 'static> WorkerClient<R, W> {
    pub fn new(channel: Channel<R, W>, registry: Arc<Registry>) -> Self {
        Self {
            channel,
            session: Session::new(Arc::clone(&registry), Vec::new()),
            registry,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            cancel: CancelSignal::new(),
            state: WorkerState::WaitingForJob,
        }
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Simulations addressable by `Run` commands.
    pub fn with_catalog(mut self, catalog: Vec<JobSpec>) -> Self {
        self.session = Session::new(Arc::clone(&self.registry), catalog);
        self
    }

    /// Signal handed to every runnable this worker executes.
    pub fn cancel_signal(&self) -> CancelSignal {
        self.cancel.clone()
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    fn transition(&mut self, next: WorkerState) {
        debug!(from = ?self.state, to = ?next, "worker state");
        self.state = next;
    }

    /// Serve commands until the orchestrator closes the channel.
    pub fn serve(&mut self) -> Result<WorkerStats> {
        let mut stats = WorkerStats::default();
        loop {
            self.transition(WorkerState::WaitingForJob);
            let request = match self.channel.wait_for_command() {
                Ok(request) => request,
                Err(Error::ChannelClosed) => {
                    info!(jobs = stats.jobs, "channel closed, worker exiting");
                    return Ok(stats);
                }
                Err(e) => return Err(e),
            };

            match request {
                Request::Job(spec) => {
                    stats.jobs += 1;
                    if !self.run_job(&spec)? {
                        stats.failed_jobs += 1;
                    }
                }
                Request::Run(command) => {
                    stats.runs += 1;
                    let response = match self.session.run(&command, &self.cancel) {
                        Ok(()) => Response::Finished,
                        Err(e) => Response::Failed {
                            message: format!("{:#}", e),
                        },
                    };
                    self.channel.send(&response)?;
                }
                Request::Read(command) => {
                    stats.reads += 1;
                    let response = match self.session.read(&command) {
                        Ok(table) => Response::Table(table),
                        Err(e) => Response::Failed { message: e.to_string() },
                    };
                    self.channel.send(&response)?;
                }
            }
        }
    }

    /// Execute one job and send its output. Returns whether it succeeded.
    fn run_job(&mut self, spec: &JobSpec) -> Result<bool> {
        self.transition(WorkerState::Running);
        info!(job = %spec.id, kind = %spec.kind, name = %spec.name, "job started");

        let mut runnable = match self.registry.build(spec) {
            Ok(runnable) => runnable,
            Err(e) => {
                self.transition(WorkerState::Reporting);
                let output = JobOutput::failed(&spec.id, e.to_string());
                self.channel.send(&Response::Output(output))?;
                return Ok(false);
            }
        };

        let redirect = Arc::new(StorageRedirect::new());
        if let Some(Some(_previous)) = redirect_storage(runnable.as_mut(), redirect.clone()) {
            debug!(job = %spec.id, "detached local store");
        }

        let heartbeat = Heartbeat::start(
            self.channel.writer(),
            spec.id.clone(),
            runnable.progress(),
            self.heartbeat_interval,
        );
        let error_message = run_guarded(runnable.as_mut(), &self.cancel).err();

        self.transition(WorkerState::Reporting);
        let (report_rows, data_tables) = match redirect.drain() {
            Ok(captured) => captured,
            Err(e) => {
                heartbeat.finish(&Response::Output(JobOutput::failed(&spec.id, e.to_string())))?;
                return Ok(false);
            }
        };
        let output = JobOutput {
            job_id: spec.id.clone(),
            error_message,
            report_rows,
            data_tables,
        };
        let succeeded = output.succeeded();
        info!(
            job = %spec.id,
            succeeded,
            rows = output.report_rows.len(),
            "job finished"
        );
        heartbeat.finish(&Response::Output(output))?;
        Ok(succeeded)
    }
}

/// Run a runnable, turning errors and panics into error text.
pub fn run_guarded(runnable: &mut dyn Runnable, cancel: &CancelSignal) -> std::result::Result<(), String> {
    match catch_unwind(AssertUnwindSafe(|| runnable.run(cancel))) {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(format!("{:#}", e)),
        Err(payload) => Err(format!("{} panicked: {}", runnable.name(), panic_message(payload.as_ref()))),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runnable::{FailingJob, NoopJob};

    #[test]
    fn test_run_guarded_captures_errors_and_panics() {
        let cancel = CancelSignal::new();
        assert!(run_guarded(&mut NoopJob::new("n"), &cancel).is_ok());

        let mut failing = FailingJob::new("f");
        failing.apply_override("[Fail].Message", "bad soil").unwrap();
        assert_eq!(run_guarded(&mut failing, &cancel).unwrap_err(), "bad soil");

        let mut panicking = FailingJob::new("p");
        panicking.apply_override("[Fail].Panic", "true").unwrap();
        let message = run_guarded(&mut panicking, &cancel).unwrap_err();
        assert!(message.contains("p panicked"));
    }
}
