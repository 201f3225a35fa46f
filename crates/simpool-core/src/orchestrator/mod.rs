//! Job orchestration across a pool of worker slots.
//!
//! Each slot has a driver thread that pops the shared queue, launches its
//! worker lazily, dispatches one job at a time and merges the returned data
//! into the real store. A worker that dies or misbehaves fails only its
//! in-flight job; the slot relaunches a fresh worker for the next one.

mod launcher;

use std::collections::VecDeque;
use std::sync::mpsc;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::config::PoolConfig;
use crate::error::{Error, Result};
use crate::ipc::{JobOutput, JobSpec, Request, Response};
use crate::runnable::CancelSignal;
use crate::storage::{DataStore, merge_output};

pub use launcher::{InProcessLauncher, ProcessLauncher, WorkerChannel, WorkerConnection, WorkerLauncher};

/// Error text recorded for jobs never dispatched because of cancellation.
pub const CANCELLED_MESSAGE: &str = "cancelled before dispatch";

/// Hooks for job lifecycle events.
///
/// Called from slot driver threads; implementations must be thread-safe.
pub trait JobCallback: Send + Sync {
    /// A job was taken off the queue for a slot.
    fn on_job_started(&self, _job: &JobSpec, _slot: usize) {}

    /// A worker reported progress.
    fn on_job_progress(&self, _job: &JobSpec, _fraction: f64) {}

    /// A job reached its terminal result and its data was merged.
    fn on_job_completed(&self, _result: &JobResult) {}
}

/// Outcome of one job.
#[derive(Debug, Clone)]
pub struct JobResult {
    pub job: JobSpec,
    pub output: JobOutput,
    /// From dispatch to terminal output.
    pub elapsed: Duration,
    /// Rows merged into the store.
    pub rows_merged: usize,
}

impl JobResult {
    pub fn succeeded(&self) -> bool {
        self.output.succeeded()
    }

    pub fn error_message(&self) -> Option<&str> {
        self.output.error_message.as_deref()
    }
}

/// Aggregate of a whole run, results in completion order.
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub results: Vec<JobResult>,
    pub elapsed: Duration,
}

impl RunSummary {
    pub fn total(&self) -> usize {
        self.results.len()
    }

    pub fn passed(&self) -> usize {
        self.results.iter().filter(|r| r.succeeded()).count()
    }

    pub fn failed(&self) -> usize {
        self.total() - self.passed()
    }

    /// Failed jobs with their error text.
    pub fn failures(&self) -> Vec<(&JobSpec, &str)> {
        self.results
            .iter()
            .filter_map(|r| r.error_message().map(|message| (&r.job, message)))
            .collect()
    }

    pub fn rows_merged(&self) -> usize {
        self.results.iter().map(|r| r.rows_merged).sum()
    }

    pub fn all_passed(&self) -> bool {
        self.failed() == 0
    }
}

fn lock_error<T>(e: PoisonError<T>) -> Error {
    Error::Io(std::io::Error::other(format!(
        "job queue lock poisoned (thread panicked): {}",
        e
    )))
}

/// Distributes jobs over worker slots and merges their output.
pub struct Orchestrator {
    config: PoolConfig,
    launcher: Arc<dyn WorkerLauncher>,
    store: Arc<dyn DataStore>,
    callback: Option<Box<dyn JobCallback>>,
    cancel: CancelSignal,
}

impl Orchestrator {
    /// Orchestrator launching worker processes as configured.
    pub fn new(config: PoolConfig, store: Arc<dyn DataStore>) -> Result<Self> {
        let launcher = ProcessLauncher::from_config(&config)?;
        Ok(Self::with_launcher(config, Arc::new(launcher), store))
    }

    pub fn with_launcher(config: PoolConfig, launcher: Arc<dyn WorkerLauncher>, store: Arc<dyn DataStore>) -> Self {
        Self {
            config,
            launcher,
            store,
            callback: None,
            cancel: CancelSignal::new(),
        }
    }

    pub fn set_callback(&mut self, callback: impl JobCallback + 'static) {
        self.callback = Some(Box::new(callback));
    }

    /// Signal that stops further dispatch. In-flight jobs run to completion.
    pub fn cancel_signal(&self) -> CancelSignal {
        self.cancel.clone()
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Run every job and return once all have a result.
    pub fn run(&self, jobs: Vec<JobSpec>) -> Result<RunSummary> {
        self.config.validate()?;
        let started = Instant::now();
        let slots = self.config.workers.min(jobs.len());
        info!(jobs = jobs.len(), slots, "run started");

        let queue = Mutex::new(VecDeque::from(jobs));
        let (tx, rx) = mpsc::channel::<JobResult>();
        let mut results = Vec::new();

        std::thread::scope(|scope| {
            for slot in 0..slots {
                let tx = tx.clone();
                let queue = &queue;
                scope.spawn(move || self.drive_slot(slot, queue, tx));
            }
            drop(tx);
            for result in rx {
                if let Some(callback) = &self.callback {
                    callback.on_job_completed(&result);
                }
                results.push(result);
            }
        });

        let leftover = queue.into_inner().map_err(lock_error)?;
        for job in leftover {
            let result = JobResult {
                output: JobOutput::failed(&job.id, CANCELLED_MESSAGE),
                job,
                elapsed: Duration::ZERO,
                rows_merged: 0,
            };
            if let Some(callback) = &self.callback {
                callback.on_job_completed(&result);
            }
            results.push(result);
        }

        let summary = RunSummary {
            results,
            elapsed: started.elapsed(),
        };
        info!(
            total = summary.total(),
            passed = summary.passed(),
            failed = summary.failed(),
            "run finished"
        );
        Ok(summary)
    }

    fn next_job(&self, queue: &Mutex<VecDeque<JobSpec>>) -> Option<JobSpec> {
        if self.cancel.is_cancelled() {
            return None;
        }
        match queue.lock() {
            Ok(mut queue) => queue.pop_front(),
            Err(e) => {
                warn!("{}", lock_error(e));
                None
            }
        }
    }

    fn drive_slot(&self, slot: usize, queue: &Mutex<VecDeque<JobSpec>>, results: mpsc::Sender<JobResult>) {
        let mut worker: Option<WorkerConnection> = None;

        while let Some(job) = self.next_job(queue) {
            if let Some(callback) = &self.callback {
                callback.on_job_started(&job, slot);
            }
            let started = Instant::now();

            let mut output = match self.dispatch(&mut worker, slot, &job) {
                Ok(output) => output,
                Err(e) => {
                    warn!(slot, job = %job.id, "worker fault: {}", e);
                    // Dropping the connection kills a worker that is still alive.
                    worker = None;
                    JobOutput::failed(&job.id, format!("worker fault: {}", e))
                }
            };
            let elapsed = started.elapsed();

            let rows_merged = match merge_output(self.store.as_ref(), &output) {
                Ok(rows) => rows,
                Err(e) => {
                    warn!(slot, job = %job.id, "merge failed: {}", e);
                    if output.error_message.is_none() {
                        output.error_message = Some(format!("merge failed: {}", e));
                    }
                    0
                }
            };

            debug!(slot, job = %job.id, rows_merged, ?elapsed, "job completed");
            let result = JobResult {
                job,
                output,
                elapsed,
                rows_merged,
            };
            if results.send(result).is_err() {
                break;
            }
        }

        if let Some(connection) = worker.take() {
            connection.shutdown();
        }
    }

    /// Send `job` to the slot's worker, launching one if needed, and wait
    /// for its terminal output.
    fn dispatch(&self, worker: &mut Option<WorkerConnection>, slot: usize, job: &JobSpec) -> Result<JobOutput> {
        if worker.is_none() {
            *worker = Some(self.launcher.launch(slot)?);
        }
        let connection = worker.as_mut().ok_or(Error::ChannelClosed)?;
        debug!(slot, worker = connection.label(), job = %job.id, "dispatching");

        let channel = connection.channel()?;
        channel.send_command(&Request::Job(job.clone()))?;
        loop {
            match channel.recv::<Response>()? {
                Response::Progress(report) => {
                    if report.job_id != job.id {
                        return Err(Error::Protocol(format!(
                            "progress for job {} while {} is running",
                            report.job_id, job.id
                        )));
                    }
                    if let Some(callback) = &self.callback {
                        callback.on_job_progress(job, report.fraction);
                    }
                }
                Response::Output(output) => {
                    if output.job_id != job.id {
                        return Err(Error::Protocol(format!(
                            "output for job {} while {} is running",
                            output.job_id, job.id
                        )));
                    }
                    return Ok(output);
                }
                other => {
                    return Err(Error::Protocol(format!(
                        "unexpected {} while waiting for job output",
                        other.label()
                    )));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_summary_counts() {
        let ok = JobResult {
            job: JobSpec::new("noop", "a"),
            output: JobOutput {
                job_id: "a".into(),
                error_message: None,
                report_rows: vec![],
                data_tables: vec![],
            },
            elapsed: Duration::from_millis(3),
            rows_merged: 4,
        };
        let bad = JobResult {
            job: JobSpec::new("fail", "b"),
            output: JobOutput::failed("b", "boom"),
            elapsed: Duration::ZERO,
            rows_merged: 0,
        };
        let summary = RunSummary {
            results: vec![ok, bad],
            elapsed: Duration::ZERO,
        };
        assert_eq!((summary.total(), summary.passed(), summary.failed()), (2, 1, 1));
        assert_eq!(summary.failures()[0].1, "boom");
        assert_eq!(summary.rows_merged(), 4);
        assert!(!summary.all_passed());
    }
}
